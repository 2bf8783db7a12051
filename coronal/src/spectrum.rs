//! Spectrum evaluation.
//!
//! Evaluates a model — an ordered list of plasma components — onto a caller
//! wavelength grid: the interpolated line spectrum of each component is
//! deposited (optionally profile-spread) in the component rest frame, the
//! continuum is rebinned on top, and redshifted components are time-dilated
//! before summing.

use crate::atomic::LineDb;
use crate::emissivity::{Continuum, ContinuumSelect, EmissivityStore, LineSpectrum};
use crate::error::{Error, Result};
use crate::interrupt::Interrupt;
use crate::model::{Model, PlasmaComponent};
use crate::profile::{HistGrid, LineProfile, ThermalProfile, FAINT_TOL};
use crate::units::{self, MAX_PROTON_NUMBER};
use log::warn;
use ndarray::Array2;

/// What a component contributes to the summed spectrum.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Contribution {
    /// Lines plus true and pseudo continuum.
    #[default]
    LinesAndContinuum,
    /// Lines only.
    Lines,
    /// True plus pseudo continuum.
    Continuum,
    /// Pseudo-continuum only.
    ContinuumPseudo,
    /// True continuum only.
    ContinuumTrue,
}

impl Contribution {
    /// Decode the historical integer flag; unrecognized values revert to
    /// [`Self::LinesAndContinuum`] with a warning.
    #[must_use]
    pub fn from_flag(flag: i32) -> Self {
        match flag {
            0 => Self::LinesAndContinuum,
            1 => Self::Lines,
            2 => Self::Continuum,
            3 => Self::ContinuumPseudo,
            4 => Self::ContinuumTrue,
            other => {
                warn!("contrib_flag={other}; using default");
                Self::LinesAndContinuum
            }
        }
    }

    const fn includes_lines(self) -> bool {
        matches!(self, Self::LinesAndContinuum | Self::Lines)
    }

    const fn includes_continuum(self) -> bool {
        !matches!(self, Self::Lines)
    }
}

/// Plasma conditions handed to user callbacks.
#[derive(Clone, Copy, Debug)]
pub struct PlasmaState {
    /// Electron temperature [K].
    pub temperature: f64,
    /// Electron density [cm^-3].
    pub ndensity: f64,
}

/// Signature of a line-emissivity modifier:
/// `(params, line_index, state, emissivity) -> emissivity`.
pub type LineModifierFn = dyn Fn(&[f64], u32, &PlasmaState, f64) -> f64;

/// A line-emissivity modifier with its captured parameter vector.
#[derive(Clone, Copy)]
pub struct LineModifier<'a> {
    func: &'a LineModifierFn,
    params: &'a [f64],
}

impl<'a> LineModifier<'a> {
    /// Pair a function with its parameters.
    #[must_use]
    pub fn new(func: &'a LineModifierFn, params: &'a [f64]) -> Self {
        Self { func, params }
    }

    fn call(&self, line_index: u32, state: &PlasmaState, emis: f64) -> f64 {
        (self.func)(self.params, line_index, state, emis)
    }
}

/// Signature of an ion-balance modifier:
/// `(params, state, last_ionpop) -> fractions`, where the result must be a
/// `(MAX_PROTON_NUMBER+1) x (MAX_PROTON_NUMBER+1)` matrix indexed `[Z, q]`
/// (entries with `q > Z` are ignored).
pub type IonPopFn = dyn Fn(&[f64], &PlasmaState, Option<&Array2<f32>>) -> Array2<f32>;

/// An ion-balance modifier with its captured parameter vector.
#[derive(Clone, Copy)]
pub struct IonPopModifier<'a> {
    func: &'a IonPopFn,
    params: &'a [f64],
}

impl<'a> IonPopModifier<'a> {
    /// Pair a function with its parameters.
    #[must_use]
    pub fn new(func: &'a IonPopFn, params: &'a [f64]) -> Self {
        Self { func, params }
    }

    fn call(&self, state: &PlasmaState, last: Option<&Array2<f32>>) -> Array2<f32> {
        (self.func)(self.params, state, last)
    }
}

/// Line-profile selection for an evaluation.
#[derive(Clone, Copy, Default)]
pub enum ProfileChoice<'a> {
    /// Deposit each line's whole flux into the bin containing it.
    #[default]
    Delta,
    /// The built-in thermal profile, parameterized per component by its
    /// temperature and turbulent velocity.
    Thermal,
    /// A caller-supplied profile with captured parameters.
    Custom {
        /// The profile implementation.
        profile: &'a dyn LineProfile,
        /// Parameter vector handed to every `map` call.
        params: &'a [f64],
    },
}

/// Qualifier bundle for one evaluation.
pub struct EvalInfo<'a> {
    /// Which emission channels to include.
    pub contrib: Contribution,
    /// Restrict line emission to these database indices (`None` = all).
    pub line_list: Option<&'a [u32]>,
    /// Per-line emissivity modifier.
    pub line_modifier: Option<LineModifier<'a>>,
    /// Ionization-balance override callback.
    pub ionpop_modifier: Option<IonPopModifier<'a>>,
    /// Line-profile selection.
    pub profile: ProfileChoice<'a>,
    /// Relative faint-wing cutoff for profile spreading.
    pub faint_tol: f64,
    /// Cooperative cancellation flag, sampled once per component.
    pub interrupt: Interrupt,
}

impl Default for EvalInfo<'_> {
    fn default() -> Self {
        Self {
            contrib: Contribution::LinesAndContinuum,
            line_list: None,
            line_modifier: None,
            ionpop_modifier: None,
            profile: ProfileChoice::Delta,
            faint_tol: FAINT_TOL,
            interrupt: Interrupt::new(),
        }
    }
}

impl EvalInfo<'_> {
    /// Default qualifiers: everything included, delta profiles.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn lorentz_gamma(redshift: f64) -> f64 {
    let x = redshift + 1.0;
    let beta = (x * x - 1.0) / (x * x + 1.0);
    1.0 / beta.mul_add(-beta, 1.0).sqrt()
}

fn validate_grid(wl_lo: &[f64], wl_hi: &[f64], out: &[f64]) -> Result<()> {
    if wl_lo.is_empty() || wl_lo.len() != wl_hi.len() || wl_lo.len() != out.len() {
        return Err(Error::InvalidParam("grid array lengths disagree".into()));
    }
    for i in 0..wl_lo.len() {
        if wl_lo[i] >= wl_hi[i] {
            return Err(Error::InvalidParam(format!("bin {i} is empty or inverted")));
        }
        if i + 1 < wl_lo.len() && wl_hi[i] > wl_lo[i + 1] {
            return Err(Error::InvalidParam(format!("bins {i} and {} overlap", i + 1)));
        }
    }
    Ok(())
}

impl Model {
    /// Evaluate the model onto the grid `(wl_lo, wl_hi)`, writing one photon
    /// flux value per bin into `out`.
    ///
    /// Side effects: every database line's scratch flux and every
    /// component's per-line flux buffer are zeroed and re-accumulated.
    /// A component whose (T, nₑ) falls outside the tabulated grid
    /// contributes nothing, with a warning naming the bounds.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParam`] for malformed grids, line lists or callback
    /// return values; [`Error::Cancelled`] on interrupt; structural store
    /// failures propagate.
    pub fn spectrum(
        &mut self,
        db: &mut LineDb,
        em: &EmissivityStore,
        info: &EvalInfo<'_>,
        wl_lo: &[f64],
        wl_hi: &[f64],
        out: &mut [f64],
    ) -> Result<()> {
        validate_grid(wl_lo, wl_hi, out)?;
        let nbins = out.len();

        out.fill(0.0);
        db.zero_line_flux();

        let flag_mask = match info.line_list {
            Some(list) if !list.is_empty() => {
                let mut mask = vec![0_u8; db.nlines()];
                for &index in list {
                    let slot = mask.get_mut(index as usize).ok_or_else(|| {
                        Error::InvalidParam(format!("line index {index}"))
                    })?;
                    *slot = 1;
                }
                Some(mask)
            }
            _ => None,
        };

        let mut cont = Continuum::new(nbins);
        let mut tmp = vec![0.0_f64; nbins];

        for component in self.components_mut() {
            info.interrupt.check()?;
            component.reset_line_flux(db.nlines());

            if component.norm == 0.0 {
                continue;
            }
            if component.redshift <= -1.0 {
                return Err(Error::InvalidParam(format!(
                    "redshift {} in component {}",
                    component.redshift,
                    component.id()
                )));
            }

            // rest-frame grid for this component
            let fac = 1.0 / (1.0 + f64::from(component.redshift));
            for i in 0..nbins {
                cont.wl_lo[i] = fac * wl_lo[i];
                cont.wl_hi[i] = fac * wl_hi[i];
            }

            if let Some(modifier) = &info.ionpop_modifier {
                let state = PlasmaState {
                    temperature: f64::from(component.temperature),
                    ndensity: f64::from(component.density),
                };
                let matrix = modifier.call(&state, component.last_ionpop());
                let n = MAX_PROTON_NUMBER + 1;
                if matrix.dim() != (n, n) {
                    return Err(Error::InvalidParam(format!(
                        "ionpop modifier returned {:?}, expected ({n}, {n})",
                        matrix.dim()
                    )));
                }
                component.set_last_ionpop(matrix);
            }

            tmp.fill(0.0);
            match eval_component(
                component,
                db,
                em,
                info,
                flag_mask.as_deref(),
                &mut cont,
                &mut tmp,
            ) {
                Ok(()) => {}
                Err(Error::OutOfRange(msg)) => {
                    warn!(
                        "component {} contributes nothing: {msg}",
                        component.id()
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }

            let gamma = if component.redshift == 0.0 {
                1.0
            } else {
                lorentz_gamma(f64::from(component.redshift))
            };
            for (o, &v) in out.iter_mut().zip(tmp.iter()) {
                *o += v / gamma;
            }
        }
        Ok(())
    }
}

fn eval_component(
    component: &mut PlasmaComponent,
    db: &mut LineDb,
    em: &EmissivityStore,
    info: &EvalInfo<'_>,
    flag: Option<&[u8]>,
    cont: &mut Continuum,
    val: &mut [f64],
) -> Result<()> {
    let par = [component.temperature, component.density];
    let ionpop = if info.ionpop_modifier.is_some() {
        component.last_ionpop().cloned()
    } else {
        None
    };

    if info.contrib.includes_lines() && em.has_line_data() {
        let spectrum = em.get_line_spectrum(db, flag, par, ionpop.as_ref())?;
        add_spread_lines(val, cont, &spectrum, component, db, info)?;
    }

    if info.contrib.includes_continuum() {
        let select = ContinuumSelect {
            z: 0,
            q: -1,
            rel_abund: &component.rel_abund,
        };
        em.get_continuum(cont, par, &select, ionpop.as_ref())?;

        let norm = component.norm;
        match info.contrib {
            Contribution::ContinuumTrue => {
                for (v, &c) in val.iter_mut().zip(cont.true_contin.iter()) {
                    *v += norm * c;
                }
            }
            Contribution::ContinuumPseudo => {
                for (v, &p) in val.iter_mut().zip(cont.pseudo.iter()) {
                    *v += norm * p;
                }
            }
            _ => {
                for ((v, &c), &p) in val
                    .iter_mut()
                    .zip(cont.true_contin.iter())
                    .zip(cont.pseudo.iter())
                {
                    *v += norm * (c + p);
                }
            }
        }
    }
    Ok(())
}

// Deposit each line of the interpolated spectrum onto the rest-frame grid,
// accumulating per-line fluxes into the database scratch and the
// component's own buffer.
fn add_spread_lines(
    val: &mut [f64],
    cont: &Continuum,
    spectrum: &LineSpectrum,
    component: &mut PlasmaComponent,
    db: &mut LineDb,
    info: &EvalInfo<'_>,
) -> Result<()> {
    let lo: &[f64] = &cont.wl_lo;
    let hi: &[f64] = &cont.wl_hi;
    let nbins = lo.len();
    let state = PlasmaState {
        temperature: f64::from(component.temperature),
        ndensity: f64::from(component.density),
    };
    let thermal_params = [
        f64::from(component.temperature),
        f64::from(component.vturb),
    ];

    for k in 0..spectrum.nlines() {
        let Some(index) = spectrum.line_index(k) else {
            break;
        };
        let (wavelen, z) = {
            let line = db.line(index).ok_or_else(|| {
                Error::Corruption(format!("emissivity references line {index}"))
            })?;
            (f64::from(line.wavelen), u32::from(line.proton_number))
        };

        if wavelen < lo[0] || hi[nbins - 1] < wavelen {
            continue;
        }

        let mut emis = f64::from(spectrum.emissivity(k).unwrap_or(0.0));
        if let Some(modifier) = &info.line_modifier {
            emis = modifier.call(index, &state, emis);
        }
        if emis <= 0.0 {
            continue;
        }
        let Some(mid) = units::find_bin(wavelen, lo, hi) else {
            continue;
        };

        let flux = component.norm * emis * f64::from(component.rel_abund[z as usize]);
        db.add_line_flux(index, flux);
        component.add_line_flux(index, flux);

        match info.profile {
            ProfileChoice::Delta => val[mid] += flux,
            ProfileChoice::Thermal => {
                let atwt = units::atomic_weight_amu(z).ok_or_else(|| {
                    Error::InvalidParam(format!("no atomic weight for Z = {z}"))
                })?;
                let mut grid = HistGrid {
                    lo,
                    hi,
                    val: &mut *val,
                };
                ThermalProfile.map(
                    &mut grid,
                    flux,
                    wavelen,
                    atwt,
                    mid,
                    &thermal_params,
                    info.faint_tol,
                )?;
            }
            ProfileChoice::Custom { profile, params } => {
                let atwt = units::atomic_weight_amu(z).ok_or_else(|| {
                    Error::InvalidParam(format!("no atomic weight for Z = {z}"))
                })?;
                let mut grid = HistGrid {
                    lo,
                    hi,
                    val: &mut *val,
                };
                profile.map(&mut grid, flux, wavelen, atwt, mid, params, info.faint_tol)?;
            }
        }
    }
    Ok(())
}
