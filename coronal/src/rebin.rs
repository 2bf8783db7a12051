//! Piecewise-linear rebinning of tabulated functions.

use crate::error::{Error, Result};
use crate::units::KEV_ANGSTROM;

// Index k with x[k] <= edge < x[k+1], for each edge.
fn bracket(edges: &[f64], x: &[f64]) -> Vec<Option<usize>> {
    edges
        .iter()
        .map(|&e| {
            let i = x.partition_point(|&v| v <= e);
            if i == 0 || i == x.len() && e >= x[x.len() - 1] {
                None
            } else {
                Some(i - 1)
            }
        })
        .collect()
}

// Integral of the linear interpolant over [a, b], where x[i] <= a <= b <= x[i+1].
fn area(x: &[f64], y: &[f64], a: f64, b: f64, i: usize) -> f64 {
    let fac = (b - a) / (x[i + 1] - x[i]);
    let xm = 0.5 * (a + b);
    fac * y[i].mul_add(x[i + 1] - xm, y[i + 1] * (xm - x[i]))
}

/// Integrate the tabulated function `(x, y)` over each output bin
/// `[lo[k], hi[k])`.
///
/// `x` must be strictly ascending and the bins non-overlapping ascending.
/// With `want_avg` the result is divided by the bin width, giving a bin
/// average instead of a bin integral. Bins not fully bracketed by the source
/// grid come out zero.
///
/// # Errors
///
/// [`Error::InvalidParam`] when array lengths disagree.
pub fn rebin(
    x: &[f64],
    y: &[f64],
    want_avg: bool,
    lo: &[f64],
    hi: &[f64],
    out: &mut [f64],
) -> Result<()> {
    if x.len() != y.len() || lo.len() != hi.len() || lo.len() != out.len() {
        return Err(Error::InvalidParam("rebin array lengths disagree".into()));
    }
    if x.len() < 2 {
        out.fill(0.0);
        return Ok(());
    }

    let k_lo = bracket(lo, x);
    let k_hi = bracket(hi, x);

    for i in 0..out.len() {
        out[i] = match (k_lo[i], k_hi[i]) {
            (Some(klo), Some(khi)) if klo < x.len() - 1 && khi < x.len() - 1 => {
                if klo == khi {
                    area(x, y, lo[i], hi[i], klo)
                } else {
                    let mut sum = area(x, y, lo[i], x[klo + 1], klo);
                    sum += area(x, y, x[khi], hi[i], khi);
                    for j in klo + 1..khi {
                        sum += area(x, y, x[j], x[j + 1], j);
                    }
                    sum
                }
            }
            _ => 0.0,
        };
        if want_avg {
            out[i] /= hi[i] - lo[i];
        }
    }
    Ok(())
}

/// Convert a continuum table from a descending-wavelength energy grid
/// [keV, photons/keV] to an ascending wavelength grid [Angstrom,
/// photons/Angstrom], in place.
///
/// The grid is truncated at its first non-positive entry (trailing padding in
/// the data files), and intensities are folded through
/// `I_lambda = I_E * hc / lambda^2`.
pub(crate) fn energy_to_wavelength(grid: &mut Vec<f64>, val: &mut Vec<f64>) {
    let n = grid.iter().take_while(|&&e| e > 0.0).count();
    grid.truncate(n);
    val.truncate(n);

    grid.reverse();
    val.reverse();

    for (g, v) in grid.iter_mut().zip(val.iter_mut()) {
        *g = KEV_ANGSTROM / *g;
        *v = v.abs() * (KEV_ANGSTROM / (*g * *g));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn single_source_interval() {
        let x = [0.0, 1.0];
        let y = [2.0, 2.0];
        let lo = [0.25];
        let hi = [0.75];
        let mut out = [0.0];
        rebin(&x, &y, false, &lo, &hi, &mut out).unwrap();
        assert_approx_eq!(f64, out[0], 1.0, ulps = 4);

        rebin(&x, &y, true, &lo, &hi, &mut out).unwrap();
        assert_approx_eq!(f64, out[0], 2.0, ulps = 4);
    }

    #[test]
    fn spanning_bins_preserve_integral() {
        // y = x on [0, 4]; integral over [0.5, 3.5] = (3.5^2 - 0.5^2)/2 = 6
        let x = [0.0, 1.0, 2.0, 3.0, 4.0];
        let y = [0.0, 1.0, 2.0, 3.0, 4.0];
        let lo = [0.5, 1.5, 2.5];
        let hi = [1.5, 2.5, 3.5];
        let mut out = [0.0; 3];
        rebin(&x, &y, false, &lo, &hi, &mut out).unwrap();

        let total: f64 = out.iter().sum();
        assert_approx_eq!(f64, total, 6.0, epsilon = 1e-8);
        assert_approx_eq!(f64, out[0], 1.0, epsilon = 1e-12);
        assert_approx_eq!(f64, out[1], 2.0, epsilon = 1e-12);
        assert_approx_eq!(f64, out[2], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn outside_bins_are_zero() {
        let x = [1.0, 2.0];
        let y = [1.0, 1.0];
        let lo = [0.0, 2.5, 0.5];
        let hi = [0.5, 3.0, 1.5];
        let mut out = [9.0; 3];
        rebin(&x, &y, false, &lo, &hi, &mut out).unwrap();
        assert_approx_eq!(f64, out[0], 0.0);
        assert_approx_eq!(f64, out[1], 0.0);
        // partially overlapping bins are dropped too, not clipped
        assert_approx_eq!(f64, out[2], 0.0);
    }

    #[test]
    fn energy_grid_conversion() {
        // descending wavelength = ascending energy entries, zero padded
        let mut grid = vec![2.0, 4.0, 8.0, 0.0, 0.0];
        let mut val = vec![1.0, 1.0, 1.0, 0.0, 0.0];
        energy_to_wavelength(&mut grid, &mut val);

        assert_eq!(grid.len(), 3);
        // wavelengths ascending
        assert!(grid.windows(2).all(|w| w[0] < w[1]));
        assert_approx_eq!(f64, grid[0], KEV_ANGSTROM / 8.0, ulps = 4);
        assert_approx_eq!(f64, grid[2], KEV_ANGSTROM / 2.0, ulps = 4);
        // photons/keV -> photons/Angstrom
        assert_approx_eq!(f64, val[0], KEV_ANGSTROM / (grid[0] * grid[0]), ulps = 4);
    }
}
