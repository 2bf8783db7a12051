//! Elemental abundance tables.
//!
//! Abundances are stored as `log10(n_X / n_H) + 12` (hydrogen = 12.00).
//! The registry tracks two distinguished tables: the *standard* one the
//! emissivity files were computed against, and the *chosen* one the model is
//! to be reinterpreted into. When they differ, every element picks up the
//! factor `10^(chosen - standard)`.

use crate::error::{Error, Result};
use crate::table::TableSource;
use crate::units::{self, MAX_PROTON_NUMBER};
use log::warn;
use serde::{Deserialize, Serialize};

/// One named abundance table, indexed by proton number.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AbundanceTable {
    name: String,
    /// `abundance[Z]` for Z in `1..=MAX_PROTON_NUMBER`; index 0 unused.
    abundance: Vec<f32>,
}

impl AbundanceTable {
    /// Table name (e.g. the literature source).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Log-abundance of element `z`, 0.0 for elements the table omits.
    #[must_use]
    pub fn abundance(&self, z: u32) -> f32 {
        self.abundance.get(z as usize).copied().unwrap_or(0.0)
    }

    /// The full `[0..=MAX_PROTON_NUMBER]` log-abundance vector.
    #[must_use]
    pub fn values(&self) -> &[f32] {
        &self.abundance
    }
}

/// Registry of abundance tables with the standard/chosen distinction.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct AbundanceRegistry {
    tables: Vec<AbundanceTable>,
    standard: Option<usize>,
    chosen: Option<usize>,
}

impl AbundanceRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every table found in `source`.
    ///
    /// Each extension carries one row per table: a `Source` name column plus
    /// one float column per element, named by the standard element symbol.
    /// Returns the number of tables loaded.
    ///
    /// # Errors
    ///
    /// Propagates source read failures and missing `Source` columns.
    pub fn load_source(&mut self, source: &dyn TableSource) -> Result<usize> {
        let mut loaded = 0;
        for index in 0..source.num_extensions() {
            let ext = source.extension(index)?;
            let names = ext.text_col("Source")?;

            // fetch the per-element columns once, not per row
            let mut columns: Vec<Option<&[f64]>> = vec![None; MAX_PROTON_NUMBER + 1];
            for (z, column) in columns.iter_mut().enumerate().skip(1) {
                #[allow(clippy::cast_possible_truncation)]
                let symbol = units::element_name(z as u32).unwrap();
                *column = ext.float_col(symbol).ok();
            }

            for (row, name) in names.iter().enumerate() {
                let mut abundance = vec![0.0_f32; MAX_PROTON_NUMBER + 1];
                for z in 1..=MAX_PROTON_NUMBER {
                    #[allow(clippy::cast_possible_truncation)]
                    if let Some(column) = columns[z] {
                        abundance[z] = column[row] as f32;
                    }
                }
                self.tables.push(AbundanceTable {
                    name: name.clone(),
                    abundance,
                });
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Register a new table from `(Z, log-abundance)` pairs; returns its id.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParam`] when a proton number is out of range.
    pub fn add_table(&mut self, name: &str, values: &[(u32, f32)]) -> Result<usize> {
        let mut abundance = vec![0.0_f32; MAX_PROTON_NUMBER + 1];
        for &(z, a) in values {
            if z < 1 || z as usize > MAX_PROTON_NUMBER {
                return Err(Error::InvalidParam(format!("Z = {z}")));
            }
            abundance[z as usize] = a;
        }
        self.tables.push(AbundanceTable {
            name: name.to_owned(),
            abundance,
        });
        Ok(self.tables.len() - 1)
    }

    /// Number of registered tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether no table is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Tables with their ids, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &AbundanceTable)> {
        self.tables.iter().enumerate()
    }

    /// Table by id.
    #[must_use]
    pub fn get_table(&self, id: usize) -> Option<&AbundanceTable> {
        self.tables.get(id)
    }

    /// Id of the table named `name`; the comparison ignores case.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<usize> {
        self.tables
            .iter()
            .position(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// Select the table the emissivity files were computed against.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown id.
    pub fn set_standard(&mut self, id: usize) -> Result<()> {
        if id >= self.tables.len() {
            return Err(Error::NotFound(format!("abundance table {id}")));
        }
        self.standard = Some(id);
        Ok(())
    }

    /// Select the table to reinterpret the model into.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown id.
    pub fn set_chosen(&mut self, id: usize) -> Result<()> {
        if id >= self.tables.len() {
            return Err(Error::NotFound(format!("abundance table {id}")));
        }
        self.chosen = Some(id);
        Ok(())
    }

    /// Id of the standard table, if set.
    #[must_use]
    pub const fn standard(&self) -> Option<usize> {
        self.standard
    }

    /// Id of the chosen table, if set.
    #[must_use]
    pub const fn chosen(&self) -> Option<usize> {
        self.chosen
    }

    /// Whether evaluation has to rescale abundances at all.
    #[must_use]
    pub fn use_alternate(&self) -> bool {
        match (self.standard, self.chosen) {
            (Some(s), Some(c)) => s != c,
            _ => false,
        }
    }

    /// Per-element rescaling factors `10^(chosen[Z] - standard[Z])`.
    ///
    /// All ones when chosen and standard coincide (or either is unset).
    #[must_use]
    pub fn abundance_factor(&self) -> Vec<f32> {
        let mut factor = vec![1.0_f32; MAX_PROTON_NUMBER + 1];
        if !self.use_alternate() {
            return factor;
        }
        let (Some(standard), Some(chosen)) = (
            self.standard.and_then(|i| self.tables.get(i)),
            self.chosen.and_then(|i| self.tables.get(i)),
        ) else {
            warn!("standard or chosen abundance table is missing");
            return factor;
        };
        for (z, f) in factor.iter_mut().enumerate().skip(1) {
            #[allow(clippy::cast_possible_truncation)]
            let xp = chosen.abundance(z as u32) - standard.abundance(z as u32);
            *f = 10.0_f32.powf(xp);
        }
        factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{Column, Extension, MemoryTable};
    use float_cmp::assert_approx_eq;

    fn registry_with_two_tables() -> AbundanceRegistry {
        let ext = Extension::new("ABUND")
            .with_column(
                "Source",
                Column::Text(vec!["AG89".to_owned(), "Asplund".to_owned()]),
            )
            .with_column("H", Column::Float(vec![12.0, 12.0]))
            .with_column("Fe", Column::Float(vec![7.50, 6.50]))
            .with_column("O", Column::Float(vec![8.93, 8.69]));
        let source = MemoryTable::new("abund").with_extension(ext);

        let mut registry = AbundanceRegistry::new();
        assert_eq!(registry.load_source(&source).unwrap(), 2);
        registry
    }

    #[test]
    fn load_and_find() {
        let registry = registry_with_two_tables();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find_by_name("ag89"), Some(0));
        assert_eq!(registry.find_by_name("ASPLUND"), Some(1));
        assert_eq!(registry.find_by_name("nope"), None);

        let table = registry.get_table(0).unwrap();
        assert_approx_eq!(f32, table.abundance(26), 7.50);
        // element absent from the file
        assert_approx_eq!(f32, table.abundance(10), 0.0);
    }

    #[test]
    fn factors_identity_when_same() {
        let mut registry = registry_with_two_tables();
        registry.set_standard(0).unwrap();
        registry.set_chosen(0).unwrap();
        assert!(!registry.use_alternate());
        assert!(registry.abundance_factor().iter().all(|&f| (f - 1.0).abs() < 1e-6));
    }

    #[test]
    fn factors_rescale() {
        let mut registry = registry_with_two_tables();
        registry.set_standard(0).unwrap();
        registry.set_chosen(1).unwrap();
        let factor = registry.abundance_factor();
        // log(Fe) drops 7.50 -> 6.50, a factor of 10 down
        assert_approx_eq!(f32, factor[26], 0.1, epsilon = 1e-6);
        // H is 12.00 in both
        assert_approx_eq!(f32, factor[1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn user_tables() {
        let mut registry = registry_with_two_tables();
        let id = registry.add_table("custom", &[(26, 8.50)]).unwrap();
        assert_eq!(id, 2);
        assert!(registry.set_chosen(id).is_ok());
        assert!(registry.set_standard(5).is_err());
        assert!(registry.add_table("bad", &[(40, 1.0)]).is_err());
    }
}
