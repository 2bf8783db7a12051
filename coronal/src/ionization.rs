//! Ionization-balance (ion fraction) tables.
//!
//! Fractions are tabulated on the same (T, nₑ) grid convention as the
//! emissivities but are interpolated in temperature only; the density axis
//! is carried through the file format and ignored, a documented limitation
//! of the inherited data layout.

use crate::error::{Error, Result};
use crate::table::TableSource;
use crate::units::MAX_PROTON_NUMBER;
use log::{debug, warn};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// One ionization-balance table.
///
/// Fractions are packed per grid row: element Z occupies `Z + 1` consecutive
/// slots (q = 0..=Z) starting at `offset[Z]`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct IonizTable {
    temps: Vec<f32>,
    densities: Vec<f32>,
    offset: Vec<i32>,
    fractions: Vec<Vec<f32>>,
}

impl IonizTable {
    /// Load a table from the first extension of `source`.
    ///
    /// # Errors
    ///
    /// Propagates read failures; malformed offsets or row counts surface as
    /// [`Error::Parse`].
    pub fn load(source: &dyn TableSource) -> Result<Self> {
        let ext = source.extension(0)?;

        let num_temps = ext.int_keyword("T_NUMBER")?;
        let num_densities = ext.int_keyword("N_NUMBER")?;
        let n_elements = usize::try_from(ext.int_keyword("N_ELEMEN")?)
            .map_err(|_| Error::Parse("N_ELEMEN out of range".into()))?;
        let n_ions = usize::try_from(ext.int_keyword("N_IONS")?)
            .map_err(|_| Error::Parse("N_IONS out of range".into()))?;

        let expected = usize::try_from(num_temps * num_densities)
            .map_err(|_| Error::Parse("negative grid shape".into()))?;
        if ext.rows() < expected {
            return Err(Error::Parse(format!(
                "ionization table has {} rows, expected {expected}",
                ext.rows()
            )));
        }
        if num_densities > 1 {
            debug!("ionization table carries {num_densities} densities; only the temperature axis is interpolated");
        }

        let temp_col = ext.float_col("Temperature")?;
        let dens_col = ext.float_col("Density")?;
        let z_rows = ext.int_array_col("Z_ELEMENT")?;
        let pop_rows = ext.array_col("X_IONPOP")?;

        // one Z_ELEMENT row is enough; they repeat per grid point
        let z_list = z_rows
            .first()
            .ok_or_else(|| Error::Parse("empty Z_ELEMENT column".into()))?;
        if z_list.len() < n_elements {
            return Err(Error::Parse("Z_ELEMENT shorter than N_ELEMEN".into()));
        }

        let mut offset = vec![-1_i32; MAX_PROTON_NUMBER + 1];
        let mut next = 0_i64;
        for &z in z_list.iter().take(n_elements) {
            let z = usize::try_from(z)
                .ok()
                .filter(|&z| (1..=MAX_PROTON_NUMBER).contains(&z))
                .ok_or_else(|| Error::Parse(format!("ionization Z = {z}")))?;
            offset[z] = i32::try_from(next)
                .map_err(|_| Error::Parse("ionization offsets overflow".into()))?;
            next += z as i64 + 1;
        }
        if usize::try_from(next).unwrap_or(usize::MAX) != n_ions {
            return Err(Error::Parse(format!(
                "packed ion count {next} does not match N_IONS = {n_ions}"
            )));
        }

        let mut temps = Vec::with_capacity(expected);
        let mut densities = Vec::with_capacity(expected);
        let mut fractions = Vec::with_capacity(expected);
        for row in 0..expected {
            if pop_rows[row].len() < n_ions {
                return Err(Error::Parse(format!(
                    "X_IONPOP row {row} shorter than N_IONS"
                )));
            }
            #[allow(clippy::cast_possible_truncation)]
            {
                temps.push(temp_col[row] as f32);
                densities.push(dens_col[row] as f32);
                fractions.push(pop_rows[row][..n_ions].iter().map(|&v| v as f32).collect());
            }
        }

        Ok(Self {
            temps,
            densities,
            offset,
            fractions,
        })
    }

    /// Temperature span of the table.
    #[must_use]
    pub fn temperature_range(&self) -> (f32, f32) {
        let first = self.temps.first().copied().unwrap_or(0.0);
        let last = self.temps.last().copied().unwrap_or(0.0);
        (first, last)
    }

    /// Whether the table has data for element `z`.
    #[must_use]
    pub fn has_element(&self, z: u32) -> bool {
        self.offset
            .get(z as usize)
            .is_some_and(|&off| off >= 0)
    }

    /// Fraction of (Z, q) at electron temperature `temp`, linear in T between
    /// bracketing rows. The density axis is ignored.
    ///
    /// Returns `None`, with a warning naming the tabulated bounds, when
    /// `temp` falls outside the table.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParam`] on a bad (Z, q); [`Error::NotFound`] when the
    /// element is absent from the table.
    pub fn fraction(&self, temp: f32, z: u32, q: u32) -> Result<Option<f32>> {
        if z < 1 || z as usize > MAX_PROTON_NUMBER || q > z {
            return Err(Error::InvalidParam(format!("ion Z = {z}, q = {q}")));
        }
        let off = self.offset[z as usize];
        if off < 0 {
            return Err(Error::NotFound(format!("Z = {z} ionization")));
        }
        #[allow(clippy::cast_sign_loss)]
        let slot = off as usize + q as usize;

        for i in 0..self.temps.len().saturating_sub(1) {
            let t1 = self.temps[i];
            let t2 = self.temps[i + 1];
            if temp < t1 || t2 <= temp {
                continue;
            }
            let x = (temp - t1) / (t2 - t1);
            let f1 = self.fractions[i][slot];
            let f2 = self.fractions[i + 1][slot];
            return Ok(Some((1.0 - x).mul_add(f1, x * f2)));
        }

        let (lo, hi) = self.temperature_range();
        warn!("{temp:11.4e} K out of range [{lo:11.4e}, {hi:11.4e}]");
        Ok(None)
    }
}

/// Ion-by-ion rescaling factors `new_frac / old_frac` at temperature `temp`.
///
/// The ratio is clamped to 1 whenever either fraction is unavailable or the
/// old fraction is zero, and for every element absent from either table.
#[must_use]
pub fn ioniz_factor(new: &IonizTable, old: &IonizTable, temp: f32) -> Array2<f32> {
    let n = MAX_PROTON_NUMBER + 1;
    let mut factor = Array2::from_elem((n, n), 0.0_f32);

    for z in 1..=MAX_PROTON_NUMBER {
        #[allow(clippy::cast_possible_truncation)]
        let z32 = z as u32;
        let have_both = old.has_element(z32) && new.has_element(z32);
        for q in 0..=z {
            #[allow(clippy::cast_possible_truncation)]
            let q32 = q as u32;
            let ratio = if have_both {
                match (old.fraction(temp, z32, q32), new.fraction(temp, z32, q32)) {
                    (Ok(Some(f_old)), Ok(Some(f_new))) if f_old > 0.0 => f_new / f_old,
                    _ => 1.0,
                }
            } else {
                1.0
            };
            factor[[z, q]] = ratio;
        }
    }
    factor
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::table::{Column, Extension, MemoryTable};
    use float_cmp::assert_approx_eq;

    // two elements (H, He), three temperatures, one density
    pub(crate) fn ioniz_source(fractions: &[[f64; 5]; 3]) -> MemoryTable {
        let ext = Extension::new("IONBAL")
            .with_keyword("T_NUMBER", 3)
            .with_keyword("N_NUMBER", 1)
            .with_keyword("N_ELEMEN", 2)
            .with_keyword("N_IONS", 5)
            .with_column("Temperature", Column::Float(vec![1.0e6, 1.0e7, 1.0e8]))
            .with_column("Density", Column::Float(vec![1.0e9; 3]))
            .with_column(
                "Z_ELEMENT",
                Column::IntArray(vec![vec![1, 2], vec![1, 2], vec![1, 2]]),
            )
            .with_column(
                "X_IONPOP",
                Column::FloatArray(fractions.iter().map(|row| row.to_vec()).collect()),
            );
        MemoryTable::new("ionbal").with_extension(ext)
    }

    fn simple_table() -> IonizTable {
        // slots: H q=0, H q=1, He q=0, He q=1, He q=2
        IonizTable::load(&ioniz_source(&[
            [0.9, 0.1, 0.8, 0.2, 0.0],
            [0.5, 0.5, 0.4, 0.4, 0.2],
            [0.1, 0.9, 0.0, 0.2, 0.8],
        ]))
        .unwrap()
    }

    #[test]
    fn offsets_and_lookup() {
        let table = simple_table();
        assert!(table.has_element(1));
        assert!(table.has_element(2));
        assert!(!table.has_element(26));

        // exactly on a tabulated temperature
        assert_approx_eq!(f32, table.fraction(1.0e6, 1, 0).unwrap().unwrap(), 0.9);
        assert_approx_eq!(f32, table.fraction(1.0e6, 2, 1).unwrap().unwrap(), 0.2);
    }

    #[test]
    fn linear_in_temperature() {
        let table = simple_table();
        // halfway between 1e6 and 1e7 in linear T
        let f = table.fraction(5.5e6, 1, 0).unwrap().unwrap();
        assert_approx_eq!(f32, f, 0.7, epsilon = 1e-6);
    }

    #[test]
    fn out_of_range_is_none() {
        let table = simple_table();
        assert!(table.fraction(1.0e5, 1, 0).unwrap().is_none());
        assert!(table.fraction(2.0e8, 1, 0).unwrap().is_none());
        // the upper bound itself is excluded by the bracketing convention
        assert!(table.fraction(1.0e8, 1, 0).unwrap().is_none());
    }

    #[test]
    fn invalid_ion_is_an_error() {
        let table = simple_table();
        assert!(table.fraction(1.0e6, 0, 0).is_err());
        assert!(table.fraction(1.0e6, 2, 3).is_err());
        assert!(table.fraction(1.0e6, 26, 16).is_err());
    }

    #[test]
    fn factor_ratios_and_clamps() {
        let old = simple_table();
        let new = IonizTable::load(&ioniz_source(&[
            [0.45, 0.55, 0.8, 0.2, 0.0],
            [0.25, 0.75, 0.4, 0.4, 0.2],
            [0.05, 0.95, 0.0, 0.2, 0.8],
        ]))
        .unwrap();

        let factor = ioniz_factor(&new, &old, 1.0e6);
        assert_approx_eq!(f32, factor[[1, 0]], 0.5, epsilon = 1e-6);
        assert_approx_eq!(f32, factor[[1, 1]], 5.5, epsilon = 1e-5);
        // old fraction zero clamps to 1
        assert_approx_eq!(f32, factor[[2, 2]], 1.0);
        // element absent from both tables clamps to 1
        assert_approx_eq!(f32, factor[[26, 16]], 1.0);
    }
}
