//! Plasma model components and their ASCII round-trip.
//!
//! A model is an ordered list of components, each with its own temperature,
//! density, normalization, abundance vector, turbulent velocity and
//! redshift. Input units follow the historical conventions: normalization in
//! units of 1e14 cm^-5 and turbulent velocity in km/s, both converted on
//! entry.

use crate::error::{Error, Result};
use crate::units::{self, MAX_PROTON_NUMBER};
use itertools::Itertools;
use log::warn;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

const NORM_SCALE: f64 = 1.0e14;
const KM_PER_S: f32 = 1.0e5;
const OVERRIDES_PER_LINE: usize = 5;

/// User-facing parameters of one plasma component.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct ComponentParams {
    /// Electron temperature [K].
    pub temperature: f32,
    /// Electron density [cm^-3].
    pub density: f32,
    /// Normalization in units of 1e14 cm^-5.
    pub norm: f64,
    /// Abundance of the metals (Z >= 3) relative to cosmic.
    pub metal_abund: f32,
    /// Turbulent velocity [km/s].
    pub vturb: f32,
    /// Redshift.
    pub redshift: f32,
}

impl Default for ComponentParams {
    fn default() -> Self {
        Self {
            temperature: 1.0e7,
            density: 1.0e10,
            norm: 1.0,
            metal_abund: 1.0,
            vturb: 0.0,
            redshift: 0.0,
        }
    }
}

/// One plasma component, in internal units, with its evaluation scratch.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PlasmaComponent {
    id: u32,
    /// Normalization [cm^-5]; the input value times 1e14.
    pub norm: f64,
    /// Electron temperature [K].
    pub temperature: f32,
    /// Electron density [cm^-3].
    pub density: f32,
    /// Metal abundance the override vector was seeded from.
    pub metal_abund: f32,
    /// Per-element relative abundances, indexed by Z.
    pub rel_abund: Vec<f32>,
    /// Turbulent velocity [cm/s].
    pub vturb: f32,
    /// Redshift.
    pub redshift: f32,
    #[serde(skip)]
    line_flux: Vec<f32>,
    #[serde(skip)]
    last_ionpop: Option<Array2<f32>>,
}

impl PlasmaComponent {
    fn new(id: u32, params: &ComponentParams) -> Self {
        let mut rel_abund = vec![params.metal_abund; MAX_PROTON_NUMBER + 1];
        rel_abund[0] = 0.0;
        rel_abund[1] = 1.0; // H is cosmic
        rel_abund[2] = 1.0; // He is cosmic
        Self {
            id,
            norm: params.norm * NORM_SCALE,
            temperature: params.temperature,
            density: params.density,
            metal_abund: params.metal_abund,
            rel_abund,
            vturb: params.vturb * KM_PER_S,
            redshift: params.redshift,
            line_flux: Vec::new(),
            last_ionpop: None,
        }
    }

    fn apply_overrides(&mut self, overrides: &[(u32, f32)]) {
        for &(z, abund) in overrides {
            if z >= 1 && z as usize <= MAX_PROTON_NUMBER {
                self.rel_abund[z as usize] = abund;
            } else {
                warn!("ignoring abundance override for Z = {z}");
            }
        }
    }

    /// Ordinal of this component in its model (1-origin).
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Per-line flux contributed by this component in the last evaluation.
    ///
    /// Overwritten on every evaluation; copy it out to keep it.
    #[must_use]
    pub fn line_flux(&self) -> &[f32] {
        &self.line_flux
    }

    /// The ionization balance the ion-balance callback returned last.
    #[must_use]
    pub const fn last_ionpop(&self) -> Option<&Array2<f32>> {
        self.last_ionpop.as_ref()
    }

    pub(crate) fn reset_line_flux(&mut self, nlines: usize) {
        self.line_flux.clear();
        self.line_flux.resize(nlines, 0.0);
    }

    pub(crate) fn add_line_flux(&mut self, index: u32, flux: f64) {
        if let Some(slot) = self.line_flux.get_mut(index as usize) {
            #[allow(clippy::cast_possible_truncation)]
            {
                *slot += flux as f32;
            }
        }
    }

    pub(crate) fn set_last_ionpop(&mut self, ionpop: Array2<f32>) {
        self.last_ionpop = Some(ionpop);
    }
}

/// An ordered list of plasma components.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Model {
    components: Vec<PlasmaComponent>,
}

impl Model {
    /// Empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a component, returning its id.
    ///
    /// `overrides` replaces the metal-seeded relative abundance of
    /// individual elements; unknown proton numbers are warned about and
    /// skipped.
    pub fn add_component(
        &mut self,
        params: &ComponentParams,
        overrides: &[(u32, f32)],
    ) -> u32 {
        let id = u32::try_from(self.components.len() + 1).unwrap_or(u32::MAX);
        let mut component = PlasmaComponent::new(id, params);
        component.apply_overrides(overrides);
        self.components.push(component);
        id
    }

    /// The components, in evaluation order.
    #[must_use]
    pub fn components(&self) -> &[PlasmaComponent] {
        &self.components
    }

    /// Mutable access to the components.
    pub fn components_mut(&mut self) -> &mut [PlasmaComponent] {
        &mut self.components
    }

    /// Number of components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Whether the model has no components.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Read a model from an ASCII file.
    ///
    /// # Errors
    ///
    /// I/O failures, or a file yielding no components.
    pub fn load_ascii<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }

    /// Read a model from ASCII text.
    ///
    /// Lines starting with `#` and blank lines are ignored. A digit-led line
    /// starts a new component (`id T nₑ abund norm vturb redshift`); element
    /// overrides are free-form `name=value` pairs on continuation lines.
    /// Unrecognized element names are warned about and skipped.
    ///
    /// # Errors
    ///
    /// I/O failures, or input yielding no components.
    pub fn from_reader<R: Read>(reader: BufReader<R>) -> Result<Self> {
        let mut model = Self::new();

        for line in reader.lines() {
            let line = line?;
            if line.starts_with('#') {
                continue;
            }
            let trimmed = line.trim();
            let Some(first) = trimmed.chars().next() else {
                continue;
            };

            if first.is_ascii_digit() {
                let Some(params) = parse_component_line(trimmed) else {
                    continue;
                };
                model.add_component(&params, &[]);
            } else if first.is_ascii_alphabetic() {
                let Some(component) = model.components.last_mut() else {
                    warn!("abundance overrides before any component; ignored");
                    continue;
                };
                parse_abundance_overrides(trimmed, component);
            }
            // anything else is garbage; read another line
        }

        if model.is_empty() {
            return Err(Error::Parse("no model components found".into()));
        }
        Ok(model)
    }

    /// Write the model in the ASCII format `load_ascii` reads.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub fn write_ascii<W: Write>(&self, writer: &mut W) -> Result<()> {
        writeln!(
            writer,
            "# id    Temp         Dens         Abund        Norm        Vturb       redshift"
        )?;
        writeln!(
            writer,
            "#       (K)          (cm^-3)                               (km/s)              "
        )?;

        for m in &self.components {
            writeln!(
                writer,
                "{:4}  {:11.4e}  {:11.4e}  {:11.4e}  {:11.4e} {:11.4e} {:11.4e}",
                m.id,
                m.temperature,
                m.density,
                m.metal_abund,
                m.norm / NORM_SCALE,
                m.vturb / KM_PER_S,
                m.redshift
            )?;

            // only elements that differ from the metal seeding are written
            let overrides = (3..=MAX_PROTON_NUMBER).filter_map(|z| {
                let abund = m.rel_abund[z];
                if (abund - m.metal_abund).abs() < 100.0 * f32::EPSILON * m.metal_abund.abs()
                {
                    return None;
                }
                #[allow(clippy::cast_possible_truncation)]
                let symbol = units::element_name(z as u32)?;
                Some(format!("  {symbol}={abund:.4}"))
            });
            for chunk in &overrides.chunks(OVERRIDES_PER_LINE) {
                for entry in chunk {
                    write!(writer, "{entry}")?;
                }
                writeln!(writer)?;
            }
        }
        Ok(())
    }

    /// Write the model to a file.
    ///
    /// # Errors
    ///
    /// Propagates open/write failures.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_ascii(&mut writer)
    }
}

// `id T dens abund norm vturb redshift`; the id is re-assigned on append.
fn parse_component_line(line: &str) -> Option<ComponentParams> {
    let mut fields = line.split_whitespace();
    let _id = fields.next()?;
    let temperature: f32 = fields.next()?.parse().ok()?;
    let density: f32 = fields.next()?.parse().ok()?;
    let metal_abund: f32 = fields.next()?.parse().ok()?;
    let norm: f64 = fields.next()?.parse().ok()?;
    let vturb: f32 = fields.next()?.parse().ok()?;
    let redshift: f32 = fields.next()?.parse().ok()?;
    Some(ComponentParams {
        temperature,
        density,
        norm,
        metal_abund,
        vturb,
        redshift,
    })
}

fn parse_abundance_overrides(line: &str, component: &mut PlasmaComponent) {
    for token in line.split_whitespace() {
        let Some((name, value)) = token.split_once('=') else {
            continue;
        };
        let Ok(abund) = value.parse::<f32>() else {
            warn!("unreadable {name} abundance `{value}'");
            continue;
        };
        match units::element_z(name) {
            Some(z) => component.rel_abund[z as usize] = abund,
            None => warn!("ignoring unrecognized element: `{name}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;
    use std::io::BufReader;

    #[test]
    fn unit_conventions() {
        let mut model = Model::new();
        let id = model.add_component(
            &ComponentParams {
                temperature: 1.0e7,
                density: 1.0e10,
                norm: 2.0,
                metal_abund: 0.4,
                vturb: 100.0,
                redshift: 0.1,
            },
            &[(26, 0.5), (99, 3.0)],
        );
        assert_eq!(id, 1);

        let m = &model.components()[0];
        assert_approx_eq!(f64, m.norm, 2.0e14);
        assert_approx_eq!(f32, m.vturb, 1.0e7);
        assert_approx_eq!(f32, m.rel_abund[1], 1.0);
        assert_approx_eq!(f32, m.rel_abund[2], 1.0);
        assert_approx_eq!(f32, m.rel_abund[8], 0.4);
        assert_approx_eq!(f32, m.rel_abund[26], 0.5);
    }

    #[test]
    fn parse_skips_comments_and_garbage() {
        let text = "\
# id  Temp  Dens  Abund  Norm  Vturb  redshift
  1   1e7   1e10  1.0    1.0   0      0
  Fe=0.5 Ni=0.3
  Xx=9 S=broken
  2   2e7   1e11  0.3    2.0   100    0.5
";
        let model = Model::from_reader(BufReader::new(text.as_bytes())).unwrap();
        assert_eq!(model.len(), 2);

        let first = &model.components()[0];
        assert_approx_eq!(f32, first.rel_abund[26], 0.5);
        assert_approx_eq!(f32, first.rel_abund[28], 0.3);
        // the unknown element and the broken value fall back
        assert_approx_eq!(f32, first.rel_abund[16], 1.0);

        let second = &model.components()[1];
        assert_approx_eq!(f32, second.temperature, 2.0e7);
        assert_approx_eq!(f64, second.norm, 2.0e14);
        assert_approx_eq!(f32, second.vturb, 1.0e7);
        assert_approx_eq!(f32, second.redshift, 0.5);
    }

    #[test]
    fn round_trip() {
        let mut model = Model::new();
        model.add_component(
            &ComponentParams {
                temperature: 1.0e7,
                density: 1.0e10,
                norm: 1.0,
                metal_abund: 1.0,
                vturb: 0.0,
                redshift: 0.0,
            },
            &[(26, 0.5)],
        );
        model.add_component(
            &ComponentParams {
                temperature: 2.0e6,
                density: 1.0e12,
                norm: 0.25,
                metal_abund: 0.5,
                vturb: 200.0,
                redshift: 0.125,
            },
            &[],
        );

        let mut text = Vec::new();
        model.write_ascii(&mut text).unwrap();
        let read = Model::from_reader(BufReader::new(text.as_slice())).unwrap();

        assert_eq!(read.len(), model.len());
        for (a, b) in model.components().iter().zip(read.components()) {
            assert_approx_eq!(f32, a.temperature, b.temperature);
            assert_approx_eq!(f32, a.density, b.density);
            assert_approx_eq!(f64, a.norm, b.norm);
            assert_approx_eq!(f32, a.metal_abund, b.metal_abund);
            assert_approx_eq!(f32, a.vturb, b.vturb);
            assert_approx_eq!(f32, a.redshift, b.redshift);
            for z in 1..=MAX_PROTON_NUMBER {
                assert_approx_eq!(f32, a.rel_abund[z], b.rel_abund[z], epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(Model::from_reader(BufReader::new("# nothing\n".as_bytes())).is_err());
    }
}
