//! Line profiles.
//!
//! A profile distributes one line's flux over the wavelength grid, walking
//! outward from the bin containing the line center and stopping once the
//! incremental contribution falls below the faint-wing cutoff.

use crate::error::{Error, Result};
use crate::units::{AMU, BOLTZ, CLIGHT};

/// Default relative faint-wing cutoff.
///
/// Larger values run faster but may underestimate faint line wings.
pub const FAINT_TOL: f64 = 1.0e-4;

/// Mutable view of the histogram a profile deposits into.
pub struct HistGrid<'a> {
    /// Low bin edges [Angstrom].
    pub lo: &'a [f64],
    /// High bin edges [Angstrom].
    pub hi: &'a [f64],
    /// Per-bin accumulator.
    pub val: &'a mut [f64],
}

/// A line profile: distributes `flux` onto the grid around bin `mid`.
pub trait LineProfile {
    /// Deposit `flux` for a line centered at `wavelen` (possibly redshifted,
    /// so the line's own wavelength is not used) onto `grid`.
    ///
    /// `mid` is the bin containing `wavelen`. `faint_tol` is the relative
    /// wing cutoff.
    ///
    /// # Errors
    ///
    /// Implementations fail on malformed parameter vectors.
    fn map(
        &self,
        grid: &mut HistGrid<'_>,
        flux: f64,
        wavelen: f64,
        atomic_weight: f64,
        mid: usize,
        params: &[f64],
        faint_tol: f64,
    ) -> Result<()>;
}

// erfc via the rational Chebyshev fit; fractional error below 1.2e-7, which
// is far under the faint-wing cutoff.
fn erfc_approx(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let ans = t
        * (-z * z
            - 1.26551223
            + t * (1.00002368
                + t * (0.37409196
                    + t * (0.09678418
                        + t * (-0.18628806
                            + t * (0.27886807
                                + t * (-1.13520398
                                    + t * (1.48851587
                                        + t * (-0.82215223 + t * 0.17087277)))))))))
            .exp();
    if x >= 0.0 {
        ans
    } else {
        2.0 - ans
    }
}

pub(crate) fn erf(x: f64) -> f64 {
    1.0 - erfc_approx(x)
}

// Gaussian cumulative distribution.
fn norm_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// The default thermal (Maxwellian) profile.
///
/// The Gaussian width combines thermal and turbulent broadening:
/// `sigma = (lambda / c) * sqrt(kT / (A m_u) + vturb^2 / 2)`.
/// `params` is `[temperature (K), vturb (cm/s)]`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThermalProfile;

impl ThermalProfile {
    fn bin_fraction(
        wl_lo: f64,
        wl_hi: f64,
        center: f64,
        sigma: f64,
    ) -> f64 {
        let dxh = (wl_hi - center) / sigma;
        let dxl = (wl_lo - center) / sigma;
        norm_cdf(dxh) - norm_cdf(dxl)
    }
}

impl LineProfile for ThermalProfile {
    fn map(
        &self,
        grid: &mut HistGrid<'_>,
        flux: f64,
        wavelen: f64,
        atomic_weight: f64,
        mid: usize,
        params: &[f64],
        faint_tol: f64,
    ) -> Result<()> {
        let &[temperature, vturb] = params else {
            return Err(Error::InvalidParam(
                "thermal profile wants [temperature, vturb]".into(),
            ));
        };

        let sigma = (wavelen / CLIGHT)
            * (BOLTZ * temperature / (atomic_weight * AMU)
                + 0.5 * vturb * vturb)
                .sqrt();
        if !sigma.is_finite() || sigma <= 0.0 {
            grid.val[mid] += flux;
            return Ok(());
        }

        let nbins = grid.val.len();
        for i in (0..=mid).rev() {
            let de = flux * Self::bin_fraction(grid.lo[i], grid.hi[i], wavelen, sigma);
            let av = grid.val[i].abs();
            let faint = av > 0.0 && de.abs() < faint_tol * av;
            grid.val[i] += de;
            if faint {
                break;
            }
        }
        for i in mid + 1..nbins {
            let de = flux * Self::bin_fraction(grid.lo[i], grid.hi[i], wavelen, sigma);
            let av = grid.val[i].abs();
            let faint = av > 0.0 && de.abs() < faint_tol * av;
            grid.val[i] += de;
            if faint {
                break;
            }
        }
        Ok(())
    }
}
