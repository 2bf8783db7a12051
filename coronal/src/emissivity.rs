//! The emissivity store: tabulated line and continuum emissivities on a
//! (T, nₑ) grid, plus the abundance and ionization-balance registries.
//!
//! Blocks can be fully memory-resident or fetched on demand from their
//! backing table source. Loading memory-resident line data is a two-pass
//! affair when `maybe_missing_lines` is set: the tables are scanned first to
//! discover transitions absent from the atomic inventory, those are merged
//! into the database in one batch, and only then are emissivity-to-line
//! references resolved.

use crate::abundance::AbundanceRegistry;
use crate::atomic::{LineAddition, LineDb};
use crate::error::{Error, Result};
use crate::interpolation::{bilinear_weights, linear_weights, Corners};
use crate::interrupt::Interrupt;
use crate::ionization::{ioniz_factor, IonizTable};
use crate::rebin;
use crate::table::{Extension, TableSource};
use crate::units::{self, BOLTZ, ERG_PER_EV, MAX_PROTON_NUMBER};
use bitflags::bitflags;
use log::{info, warn};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

// Data extensions follow the file header and the PARAMETERS extension.
const FILEMAP_DATA_OFFSET: usize = 2;

bitflags! {
    /// Which emissivity blocks stay memory-resident after open.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct MemoryUsage: u32 {
        /// Keep every line-emissivity block in memory.
        const LINE_EMIS = 0x01;
        /// Keep every continuum block in memory.
        const CONT_EMIS = 0x02;
    }
}

impl Default for MemoryUsage {
    fn default() -> Self {
        Self::LINE_EMIS
    }
}

/// Store configuration; defaults match the historical tunables.
#[derive(Clone, Copy, Debug)]
pub struct StoreConfig {
    /// Memory residency of line and continuum blocks.
    pub memory: MemoryUsage,
    /// Scan the emissivity tables for transitions missing from the atomic
    /// inventory and merge them before resolving references.
    pub maybe_missing_lines: bool,
    /// Pre-size hint for the missing-line scan buffer; 0 derives one.
    pub hash_size_hint: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            memory: MemoryUsage::default(),
            maybe_missing_lines: true,
            hash_size_hint: 0,
        }
    }
}

/// Bundle of table sources the store reads from. Any of them may be absent.
#[derive(Default)]
pub struct StoreSources {
    /// Line emissivities, led by a filemap.
    pub line_emis: Option<Box<dyn TableSource>>,
    /// Continuum emissivities, led by a filemap.
    pub contin_emis: Option<Box<dyn TableSource>>,
    /// Native ionization balance (slot 0).
    pub ionization: Option<Box<dyn TableSource>>,
    /// Abundance tables.
    pub abundance: Option<Box<dyn TableSource>>,
}

/// The ordered index of (T, nₑ, extension) triples describing where each
/// grid point of an emissivity file lives.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Filemap {
    source_name: String,
    temps: Vec<f32>,
    densities: Vec<f32>,
    extensions: Vec<usize>,
    num_temps: usize,
    num_densities: usize,
    abund_table: Option<String>,
}

impl Filemap {
    fn load(source: &dyn TableSource) -> Result<Self> {
        let header = source.extension(0)?;
        let num_temps = usize::try_from(header.int_keyword("INUM_TEMP")?)
            .map_err(|_| Error::Parse("INUM_TEMP out of range".into()))?;
        let num_densities = usize::try_from(header.int_keyword("INUM_DENSITIES")?)
            .map_err(|_| Error::Parse("INUM_DENSITIES out of range".into()))?;
        let abund_table = header
            .text_keyword("SABUND_SOURCE")
            .ok()
            .map(str::to_owned);

        let params = source.extension(1)?;
        if params.name() != "PARAMETERS" {
            return Err(Error::Parse(format!(
                "expected PARAMETERS extension in {}, found {}",
                source.name(),
                params.name()
            )));
        }

        let num_points = num_temps * num_densities;
        let kt = params.float_col("kT")?;
        let edens = params.float_col("EDensity")?;
        if kt.len() < num_points || edens.len() < num_points {
            return Err(Error::Parse(format!(
                "filemap in {} has {} rows, expected {num_points}",
                source.name(),
                kt.len().min(edens.len())
            )));
        }

        let mut temps = Vec::with_capacity(num_points);
        let mut densities = Vec::with_capacity(num_points);
        let mut extensions = Vec::with_capacity(num_points);
        for i in 0..num_points {
            // keV -> Kelvin
            #[allow(clippy::cast_possible_truncation)]
            let temp = (kt[i] * 1000.0 * ERG_PER_EV / BOLTZ) as f32;
            #[allow(clippy::cast_possible_truncation)]
            let density = edens[i] as f32;
            if temp <= 0.0 || density <= 0.0 {
                break;
            }
            temps.push(temp);
            densities.push(density);
            extensions.push(i + FILEMAP_DATA_OFFSET);
        }

        Ok(Self {
            source_name: source.name().to_owned(),
            temps,
            densities,
            extensions,
            num_temps,
            num_densities,
            abund_table,
        })
    }

    /// Number of tabulated grid points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    /// Whether the filemap holds no grid points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Tabulated electron temperatures [K], one per grid point.
    #[must_use]
    pub fn temps(&self) -> &[f32] {
        &self.temps
    }

    /// Tabulated electron densities [cm^-3], one per grid point.
    #[must_use]
    pub fn densities(&self) -> &[f32] {
        &self.densities
    }

    /// Count of distinct temperatures claimed by the file header.
    #[must_use]
    pub const fn num_temps(&self) -> usize {
        self.num_temps
    }

    /// Count of distinct densities claimed by the file header.
    #[must_use]
    pub const fn num_densities(&self) -> usize {
        self.num_densities
    }

    /// Name of the abundance table the file was computed against.
    #[must_use]
    pub fn abund_table(&self) -> Option<&str> {
        self.abund_table.as_deref()
    }

    fn extension_of(&self, point: usize) -> usize {
        self.extensions[point]
    }

    // Corner points and weights for a (T, ne) target. A single-density grid
    // interpolates linearly in T, a single-temperature grid linearly in ne;
    // the general case is bilinear with nearest-neighbor corner discovery.
    fn interp_weights(&self, par: [f32; 2]) -> Result<Corners> {
        if self.extensions.is_empty() {
            return Err(Error::NotFound(format!(
                "no grid points in {}",
                self.source_name
            )));
        }
        if self.extensions.len() == 1 {
            let mut corners = Corners::new();
            corners.push((0, 1.0));
            return Ok(corners);
        }
        if self.num_densities == 1 {
            linear_weights(par[0], &self.temps)
        } else if self.num_temps == 1 {
            linear_weights(par[1], &self.densities)
        } else {
            bilinear_weights(par[0], par[1], &self.temps, &self.densities)
        }
    }
}

// Line emissivities tabulated at one grid point.
#[derive(Clone, Debug)]
struct LineEmisBlock {
    lines: Vec<u32>,
    emis: Vec<f32>,
}

// A corner block is either borrowed from the memory-resident cache or was
// loaded on demand for this call.
enum CornerBlock<'a, B> {
    Cached(&'a B),
    Loaded(B),
}

impl<B> CornerBlock<'_, B> {
    fn get(&self) -> &B {
        match self {
            Self::Cached(block) => block,
            Self::Loaded(block) => block,
        }
    }
}

/// Interpolated line spectrum at one (T, nₑ).
///
/// Contains every line present in any corner block, in database-index order,
/// with a reverse lookup from database index to position.
#[derive(Clone, Debug)]
pub struct LineSpectrum {
    par: [f32; 2],
    lines: Vec<u32>,
    emis: Vec<f32>,
    lookup: Vec<i32>,
}

impl LineSpectrum {
    /// Number of lines carrying emissivity.
    #[must_use]
    pub fn nlines(&self) -> usize {
        self.lines.len()
    }

    /// The (T, nₑ) this spectrum was interpolated at.
    #[must_use]
    pub const fn par(&self) -> [f32; 2] {
        self.par
    }

    /// Database index of entry `k`.
    #[must_use]
    pub fn line_index(&self, k: usize) -> Option<u32> {
        self.lines.get(k).copied()
    }

    /// Emissivity of entry `k` [photons cm^3 s^-1].
    #[must_use]
    pub fn emissivity(&self, k: usize) -> Option<f32> {
        self.emis.get(k).copied()
    }

    /// Emissivity of the line with database index `index`, if present.
    #[must_use]
    pub fn emissivity_of(&self, index: u32) -> Option<f32> {
        let k = *self.lookup.get(index as usize)?;
        usize::try_from(k).ok().and_then(|k| self.emis.get(k).copied())
    }

    fn scale_by_element(&mut self, factor: &[f32], db: &LineDb) {
        for (line, emis) in self.lines.iter().zip(self.emis.iter_mut()) {
            let z = db.lines()[*line as usize].proton_number as usize;
            *emis *= factor[z];
        }
    }

    fn scale_by_ion(&mut self, factor: &Array2<f32>, db: &LineDb) {
        for (line, emis) in self.lines.iter().zip(self.emis.iter_mut()) {
            let line = &db.lines()[*line as usize];
            *emis *= factor[[line.proton_number as usize, line.ion_charge as usize]];
        }
    }
}

// Continuum record for one (Z, q) at one grid point, already converted to an
// ascending wavelength grid. Sentinels inherited from the data layout:
// (0, -1) is the total over all elements, (Z, -1) the sum over one element's
// ions.
#[derive(Clone, Debug)]
struct ContRecord {
    z: i32,
    q: i32,
    grid_true: Vec<f64>,
    val_true: Vec<f64>,
    grid_pseudo: Vec<f64>,
    val_pseudo: Vec<f64>,
}

#[derive(Clone, Debug, Default)]
struct ContBlock {
    records: Vec<ContRecord>,
}

impl ContBlock {
    fn find(&self, z: i32, q: i32) -> Option<&ContRecord> {
        self.records.iter().find(|r| r.z == z && r.q == q)
    }
}

/// Continuum spectrum binned onto a caller grid.
///
/// The caller owns the wavelength grid; [`EmissivityStore::get_continuum`]
/// fills the two value channels with per-bin integrals
/// [photons cm^3 s^-1 per bin].
#[derive(Clone, Debug, Default)]
pub struct Continuum {
    /// Low bin edges [Angstrom].
    pub wl_lo: Vec<f64>,
    /// High bin edges [Angstrom].
    pub wl_hi: Vec<f64>,
    /// Smooth true continuum per bin.
    pub true_contin: Vec<f64>,
    /// Pseudo-continuum of unresolved weak lines per bin.
    pub pseudo: Vec<f64>,
}

impl Continuum {
    /// Zeroed continuum with `nbins` bins and an unset grid.
    #[must_use]
    pub fn new(nbins: usize) -> Self {
        Self {
            wl_lo: vec![0.0; nbins],
            wl_hi: vec![0.0; nbins],
            true_contin: vec![0.0; nbins],
            pseudo: vec![0.0; nbins],
        }
    }

    /// Number of bins.
    #[must_use]
    pub fn nbins(&self) -> usize {
        self.wl_lo.len()
    }
}

/// Selection for a continuum request.
#[derive(Clone, Copy, Debug)]
pub struct ContinuumSelect<'a> {
    /// Element, or 0 for the total over all elements.
    pub z: i32,
    /// Ion charge, or -1 for the sum over an element's ions.
    pub q: i32,
    /// Per-element relative abundances, indexed by Z; must span
    /// `0..=MAX_PROTON_NUMBER`.
    pub rel_abund: &'a [f32],
}

/// Per-line emissivity as a function of the tabulated grid points.
#[derive(Clone, Debug)]
pub struct LineEmisFunction {
    /// Grid temperatures [K].
    pub temps: Vec<f32>,
    /// Grid densities [cm^-3].
    pub densities: Vec<f32>,
    /// Emissivity at each grid point; zero where the line is not tabulated.
    pub emis: Vec<f32>,
}

/// The emissivity store.
pub struct EmissivityStore {
    config: StoreConfig,
    line_source: Option<Box<dyn TableSource>>,
    cont_source: Option<Box<dyn TableSource>>,
    line_map: Option<Filemap>,
    cont_map: Option<Filemap>,
    line_blocks: Vec<Option<LineEmisBlock>>,
    cont_blocks: Vec<Option<ContBlock>>,
    abund: AbundanceRegistry,
    ioniz: [Option<IonizTable>; 2],
}

impl EmissivityStore {
    /// Open the store, scanning and loading according to `config`.
    ///
    /// When line tables reference transitions the database does not know and
    /// `maybe_missing_lines` is set, those transitions are merged into `db`
    /// before any emissivity reference is resolved.
    ///
    /// # Errors
    ///
    /// Structural failures (unreadable filemap, malformed columns) abort the
    /// open; [`Error::Cancelled`] when the interrupt flag is observed.
    pub fn open(
        sources: StoreSources,
        config: StoreConfig,
        db: &mut LineDb,
        interrupt: &Interrupt,
    ) -> Result<Self> {
        let mut store = Self {
            config,
            line_source: sources.line_emis,
            cont_source: sources.contin_emis,
            line_map: None,
            cont_map: None,
            line_blocks: Vec::new(),
            cont_blocks: Vec::new(),
            abund: AbundanceRegistry::new(),
            ioniz: [None, None],
        };

        if let Some(source) = &sources.abundance {
            let n = store.abund.load_source(source.as_ref())?;
            info!("loaded {n} abundance tables from {}", source.name());
        }
        if let Some(source) = &sources.ionization {
            store.ioniz[0] = Some(IonizTable::load(source.as_ref())?);
        }

        if let Some(source) = &store.line_source {
            let map = Filemap::load(source.as_ref())?;
            if config.maybe_missing_lines {
                scan_missing_lines(source.as_ref(), &map, config.hash_size_hint, db, interrupt)?;
            }
            let mut blocks = Vec::new();
            if config.memory.contains(MemoryUsage::LINE_EMIS) {
                info!("loading line emissivity tables [{} extensions]", map.len());
                blocks.reserve(map.len());
                for point in 0..map.len() {
                    interrupt.check()?;
                    let ext = source.extension(map.extension_of(point))?;
                    blocks.push(Some(load_line_block(&ext, db)?));
                }
            }
            store.line_blocks = blocks;
            store.line_map = Some(map);
        }

        if let Some(source) = &store.cont_source {
            let map = Filemap::load(source.as_ref())?;
            let mut blocks = Vec::new();
            if config.memory.contains(MemoryUsage::CONT_EMIS) {
                info!("loading continuum tables [{} extensions]", map.len());
                blocks.reserve(map.len());
                for point in 0..map.len() {
                    interrupt.check()?;
                    let ext = source.extension(map.extension_of(point))?;
                    blocks.push(Some(load_cont_block(&ext, None)?));
                }
            }
            store.cont_blocks = blocks;
            store.cont_map = Some(map);
        }

        store.wire_standard_abundance();
        Ok(store)
    }

    // The emissivity files name the abundance table they were computed
    // against; make it both the standard and the initial chosen table.
    fn wire_standard_abundance(&mut self) {
        let line_name = self
            .line_map
            .as_ref()
            .and_then(Filemap::abund_table)
            .map(str::to_owned);
        let cont_name = self
            .cont_map
            .as_ref()
            .and_then(Filemap::abund_table)
            .map(str::to_owned);

        let standard = match (line_name, cont_name) {
            (Some(a), Some(b)) => {
                if !a.eq_ignore_ascii_case(&b) {
                    warn!("abundance table mismatch: lines -> '{a}', continua -> '{b}'");
                }
                Some(a)
            }
            (Some(a), None) => Some(a),
            (None, b) => b,
        };

        if let Some(name) = standard {
            if let Some(k) = self.abund.find_by_name(&name) {
                let _ = self.abund.set_standard(k);
                let _ = self.abund.set_chosen(k);
            } else if !self.abund.is_empty() {
                warn!("abundance table '{name}' is not in the registry");
            }
        }
    }

    /// Whether line emissivity data is loaded.
    #[must_use]
    pub const fn has_line_data(&self) -> bool {
        self.line_map.is_some()
    }

    /// Whether continuum emissivity data is loaded.
    #[must_use]
    pub const fn has_continuum_data(&self) -> bool {
        self.cont_map.is_some()
    }

    /// The line-emissivity filemap.
    #[must_use]
    pub const fn filemap(&self) -> Option<&Filemap> {
        self.line_map.as_ref()
    }

    /// The continuum filemap.
    #[must_use]
    pub const fn continuum_filemap(&self) -> Option<&Filemap> {
        self.cont_map.as_ref()
    }

    /// Abundance registry.
    #[must_use]
    pub const fn abundances(&self) -> &AbundanceRegistry {
        &self.abund
    }

    /// Mutable abundance registry (select chosen/standard, add tables).
    pub fn abundances_mut(&mut self) -> &mut AbundanceRegistry {
        &mut self.abund
    }

    /// Load an alternate ionization table into slot 1.
    ///
    /// # Errors
    ///
    /// Propagates table read failures.
    pub fn load_alt_ionization(&mut self, source: &dyn TableSource) -> Result<()> {
        self.ioniz[1] = Some(IonizTable::load(source)?);
        Ok(())
    }

    /// Drop the alternate ionization table.
    pub fn clear_alt_ionization(&mut self) {
        self.ioniz[1] = None;
    }

    /// Ion fraction of (Z, q) from table `slot` (0 native, 1 alternate) at
    /// temperature `temp`; `None` (with a warning naming the bounds) outside
    /// the tabulated temperature range. The density axis is ignored.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParam`] for a bad slot or ion; [`Error::NotFound`]
    /// when the table is not loaded or lacks the element.
    pub fn ion_fraction(&self, slot: usize, temp: f32, z: u32, q: u32) -> Result<Option<f32>> {
        let table = self
            .ioniz
            .get(slot)
            .ok_or_else(|| Error::InvalidParam(format!("ionization table {slot}")))?
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("ionization table {slot} not loaded")))?;
        table.fraction(temp, z, q)
    }

    fn use_alt_ioniz(&self) -> bool {
        self.ioniz[0].is_some() && self.ioniz[1].is_some()
    }

    // Scaling matrix for an externally supplied ionization balance: the
    // callback's fractions against the native table the emissivities were
    // computed with.
    fn ionpop_factor_matrix(&self, temp: f32, matrix: &Array2<f32>) -> Option<Array2<f32>> {
        let native = self.ioniz[0].as_ref()?;
        let n = MAX_PROTON_NUMBER + 1;
        let mut factor = Array2::from_elem((n, n), 1.0_f32);
        for z in 1..=MAX_PROTON_NUMBER {
            #[allow(clippy::cast_possible_truncation)]
            let z32 = z as u32;
            if !native.has_element(z32) {
                continue;
            }
            for q in 0..=z {
                #[allow(clippy::cast_possible_truncation)]
                let old = native.fraction(temp, z32, q as u32).ok().flatten();
                if let Some(old) = old.filter(|&f| f > 0.0) {
                    factor[[z, q]] = matrix[[z, q]] / old;
                }
            }
        }
        Some(factor)
    }

    fn ion_scaling(&self, temp: f32, ionpop: Option<&Array2<f32>>) -> Option<Array2<f32>> {
        if let Some(matrix) = ionpop {
            let factor = self.ionpop_factor_matrix(temp, matrix);
            if factor.is_none() {
                warn!("ionization modifier ignored: no native ionization table loaded");
            }
            factor
        } else if self.use_alt_ioniz() {
            let old = self.ioniz[0].as_ref()?;
            let new = self.ioniz[1].as_ref()?;
            Some(ioniz_factor(new, old, temp))
        } else {
            None
        }
    }

    fn line_corner_blocks(
        &self,
        map: &Filemap,
        weights: &Corners,
        db: &mut LineDb,
    ) -> Result<Vec<CornerBlock<'_, LineEmisBlock>>> {
        let mut blocks = Vec::with_capacity(weights.len());
        for &(point, _) in weights.iter() {
            if let Some(block) = self.line_blocks.get(point).and_then(Option::as_ref) {
                blocks.push(CornerBlock::Cached(block));
            } else {
                let source = self
                    .line_source
                    .as_ref()
                    .ok_or_else(|| Error::NotFound("line emissivity source".into()))?;
                let ext = source.extension(map.extension_of(point))?;
                blocks.push(CornerBlock::Loaded(load_line_block(&ext, db)?));
            }
        }
        Ok(blocks)
    }

    /// Interpolated line spectrum at `par = [T, nₑ]`.
    ///
    /// `flag`, when given, is a byte mask over database indices; only flagged
    /// lines accumulate emissivity (unflagged ones still appear, at zero).
    /// `ionpop` is an externally computed ionization balance to rescale
    /// against the native one. Abundance and ionization rescalings are
    /// applied to the result.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] without line data; interpolation failures
    /// propagate ([`Error::OutOfRange`], [`Error::Corruption`]).
    pub fn get_line_spectrum(
        &self,
        db: &mut LineDb,
        flag: Option<&[u8]>,
        par: [f32; 2],
        ionpop: Option<&Array2<f32>>,
    ) -> Result<LineSpectrum> {
        let map = self
            .line_map
            .as_ref()
            .ok_or_else(|| Error::NotFound("line emissivity data".into()))?;
        let weights = map.interp_weights(par)?;
        let blocks = self.line_corner_blocks(map, &weights, db)?;

        let mut spectrum = interpolate_line_blocks(db.nlines(), &blocks, &weights, flag)?;

        if self.abund.use_alternate() {
            spectrum.scale_by_element(&self.abund.abundance_factor(), db);
        }
        if let Some(factor) = self.ion_scaling(par[0], ionpop) {
            spectrum.scale_by_ion(&factor, db);
        }
        spectrum.par = par;
        Ok(spectrum)
    }

    /// Interpolated emissivity at `par`, summed over the listed lines.
    ///
    /// # Errors
    ///
    /// As for [`Self::get_line_spectrum`].
    pub fn sum_line_emissivity(
        &self,
        db: &mut LineDb,
        par: [f32; 2],
        list: &[u32],
    ) -> Result<f64> {
        let spectrum = self.get_line_spectrum(db, None, par, None)?;
        Ok(units::kahan_sum(list.iter().map(|&index| {
            f64::from(spectrum.emissivity_of(index).unwrap_or(0.0))
        })))
    }

    /// The tabulated emissivity of one line across every grid point.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] without line data, [`Error::InvalidParam`] for an
    /// unknown line index.
    pub fn line_emissivity_function(
        &self,
        db: &mut LineDb,
        index: u32,
    ) -> Result<LineEmisFunction> {
        if db.line(index).is_none() {
            return Err(Error::InvalidParam(format!("line index {index}")));
        }
        let map = self
            .line_map
            .as_ref()
            .ok_or_else(|| Error::NotFound("line emissivity data".into()))?;

        let mut emis = Vec::with_capacity(map.len());
        for point in 0..map.len() {
            if let Some(block) = self.line_blocks.get(point).and_then(Option::as_ref) {
                emis.push(block_emissivity_of(block, index));
            } else {
                let source = self
                    .line_source
                    .as_ref()
                    .ok_or_else(|| Error::NotFound("line emissivity source".into()))?;
                let ext = source.extension(map.extension_of(point))?;
                emis.push(block_emissivity_of(&load_line_block(&ext, db)?, index));
            }
        }

        Ok(LineEmisFunction {
            temps: map.temps().to_vec(),
            densities: map.densities().to_vec(),
            emis,
        })
    }

    fn cont_corner_blocks(
        &self,
        map: &Filemap,
        weights: &Corners,
        select: Option<(i32, i32)>,
    ) -> Result<Vec<CornerBlock<'_, ContBlock>>> {
        let mut blocks = Vec::with_capacity(weights.len());
        for &(point, _) in weights.iter() {
            if let Some(block) = self.cont_blocks.get(point).and_then(Option::as_ref) {
                blocks.push(CornerBlock::Cached(block));
            } else {
                let source = self
                    .cont_source
                    .as_ref()
                    .ok_or_else(|| Error::NotFound("continuum source".into()))?;
                let ext = source.extension(map.extension_of(point))?;
                blocks.push(CornerBlock::Loaded(load_cont_block(&ext, select)?));
            }
        }
        Ok(blocks)
    }

    /// Continuum spectrum at `par`, rebinned onto the grid already present in
    /// `cont` and scaled per element.
    ///
    /// With no continuum data loaded the output channels stay zero.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when the selected (Z, q) has no continuum record;
    /// interpolation failures propagate.
    pub fn get_continuum(
        &self,
        cont: &mut Continuum,
        par: [f32; 2],
        select: &ContinuumSelect<'_>,
        ionpop: Option<&Array2<f32>>,
    ) -> Result<()> {
        cont.true_contin.fill(0.0);
        cont.pseudo.fill(0.0);

        let Some(map) = self.cont_map.as_ref() else {
            return Ok(());
        };

        if select.rel_abund.len() <= MAX_PROTON_NUMBER {
            return Err(Error::InvalidParam("rel_abund is too short".into()));
        }
        if select.q > select.z || select.z > MAX_PROTON_NUMBER as i32 {
            return Err(Error::NotFound(format!(
                "Z={} q={} continuum",
                select.z, select.q
            )));
        }
        // the data tables use these sentinels for sums over ions/elements
        let z_req = select.z.max(0);
        let q_req = select.q.max(-1);

        let alt_abund = self.abund.use_alternate();
        let ion_factor = self.ion_scaling(par[0], ionpop);
        let vary_rel = select.rel_abund[1..=MAX_PROTON_NUMBER]
            .iter()
            .any(|&v| (v - 1.0).abs() > 0.0);

        let weights = map.interp_weights(par)?;
        // a total request may have to be assembled element by element, so
        // bring in every record unless a specific ion was asked for
        let load_all = vary_rel || alt_abund || ion_factor.is_some() || z_req == 0;
        let block_select = if load_all { None } else { Some((z_req, q_req)) };
        let blocks = self.cont_corner_blocks(map, &weights, block_select)?;

        let f_abund = if alt_abund {
            self.abund.abundance_factor()
        } else {
            vec![1.0; MAX_PROTON_NUMBER + 1]
        };

        let missing_total = z_req == 0 && blocks[0].get().find(0, -1).is_none();
        let expand = (z_req == 0 && (alt_abund || ion_factor.is_some()))
            || missing_total
            || vary_rel;
        #[allow(clippy::cast_possible_truncation)]
        let z_range = if expand {
            1..=MAX_PROTON_NUMBER as i32
        } else {
            z_req..=z_req
        };

        let mut found_something = false;
        let mut found_z = [false; MAX_PROTON_NUMBER + 1];
        let mut scratch = vec![0.0_f64; cont.nbins()];

        for (block, &(_, weight)) in blocks.iter().zip(weights.iter()) {
            for z in z_range.clone() {
                let q_range = if ion_factor.is_some() && select.q < 0 && z > 0 {
                    0..z
                } else {
                    q_req..q_req + 1
                };
                for q in q_range {
                    let Some(record) = block.get().find(z, q) else {
                        continue;
                    };
                    found_something = true;

                    let mut scale = weight;
                    if z > 0 {
                        #[allow(clippy::cast_sign_loss)]
                        let zi = z as usize;
                        found_z[zi] = true;
                        scale *= f64::from(f_abund[zi]) * f64::from(select.rel_abund[zi]);
                        if q >= 0 {
                            if let Some(factor) = &ion_factor {
                                #[allow(clippy::cast_sign_loss)]
                                let qi = q as usize;
                                scale *= f64::from(factor[[zi, qi]]);
                            }
                        }
                    }

                    add_cont_contrib(cont, record, scale, &mut scratch)?;
                }
            }
        }

        if expand {
            for z in 1..=MAX_PROTON_NUMBER {
                if (select.rel_abund[z] - 1.0).abs() > 0.0
                    && select.rel_abund[z] > 0.0
                    && !found_z[z]
                {
                    #[allow(clippy::cast_possible_truncation)]
                    let name = units::element_name(z as u32).unwrap_or("?");
                    info!("no {name} continuum in the tables");
                }
            }
        }

        if found_something {
            Ok(())
        } else {
            Err(Error::NotFound(format!(
                "Z={} q={} continuum",
                select.z, select.q
            )))
        }
    }
}

fn block_emissivity_of(block: &LineEmisBlock, index: u32) -> f32 {
    block
        .lines
        .iter()
        .position(|&l| l == index)
        .map_or(0.0, |k| block.emis[k])
}

// First pass over the line tables: collect transitions the database does not
// know yet, then commit them in one merge.
fn scan_missing_lines(
    source: &dyn TableSource,
    map: &Filemap,
    size_hint: usize,
    db: &mut LineDb,
    interrupt: &Interrupt,
) -> Result<()> {
    let mut additions: Vec<LineAddition> = Vec::with_capacity(size_hint);

    for point in 0..map.len() {
        interrupt.check()?;
        let ext = source.extension(map.extension_of(point))?;
        for (wavelen, _, z, q, upper, lower) in read_line_rows(&ext)? {
            if db
                .get_line(wavelen, u32::from(z), u32::from(q), upper, lower)
                .is_none()
            {
                additions.push(LineAddition {
                    wavelen,
                    wavelen_err: 0.0,
                    a_value: 0.0,
                    a_err: 0.0,
                    proton_number: z,
                    ion_charge: q,
                    upper_level: upper,
                    lower_level: lower,
                });
            }
        }
    }

    if !additions.is_empty() {
        let added = db.merge_lines(&additions)?;
        if added > 0 {
            info!("merged {added} lines referenced only by the emissivity tables");
        }
    }
    Ok(())
}

type LineRow = (f32, f32, u8, u8, u32, u32);

fn read_line_rows(ext: &Extension) -> Result<Vec<LineRow>> {
    let lambda = ext.float_col("Lambda")?;
    let epsilon = ext.float_col("Epsilon")?;
    let element = ext.int_col("Element")?;
    let ion = ext.int_col("Ion")?;
    let upper = ext.int_col("UpperLev")?;
    let lower = ext.int_col("LowerLev")?;

    let mut rows = Vec::with_capacity(ext.rows());
    for i in 0..ext.rows() {
        let (Ok(z), Ok(q), Ok(up), Ok(lo)) = (
            u8::try_from(element[i]),
            u8::try_from(ion[i]),
            u32::try_from(upper[i]),
            u32::try_from(lower[i]),
        ) else {
            return Err(Error::Parse(format!(
                "bad line identity in {} row {i}",
                ext.name()
            )));
        };
        #[allow(clippy::cast_possible_truncation)]
        rows.push((lambda[i] as f32, epsilon[i] as f32, z, q, up, lo));
    }
    Ok(rows)
}

fn load_line_block(ext: &Extension, db: &mut LineDb) -> Result<LineEmisBlock> {
    let rows = read_line_rows(ext)?;
    let mut lines = Vec::with_capacity(rows.len());
    let mut emis = Vec::with_capacity(rows.len());
    let mut unidentified = 0_usize;

    for (wavelen, epsilon, z, q, upper, lower) in rows {
        match db.get_line(wavelen, u32::from(z), u32::from(q), upper, lower) {
            Some(line) => {
                let index = line.index();
                lines.push(index);
                emis.push(epsilon);
                db.mark_emissivity_data(index);
            }
            None => unidentified += 1,
        }
    }

    if unidentified > 0 {
        warn!("{unidentified} unidentified lines in {}", ext.name());
    }
    Ok(LineEmisBlock { lines, emis })
}

fn load_cont_block(ext: &Extension, select: Option<(i32, i32)>) -> Result<ContBlock> {
    let z_col = ext.int_col("Z")?;
    let q_col = ext.int_col("rmJ")?;
    let n_cont = ext.int_col("N_Cont")?;
    let n_pseudo = ext.int_col("N_Pseudo")?;
    let e_cont = ext.array_col("E_Cont")?;
    let continuum = ext.array_col("Continuum")?;
    let e_pseudo = ext.array_col("E_Pseudo")?;
    let pseudo = ext.array_col("Pseudo")?;

    let mut records = Vec::new();
    for i in 0..ext.rows() {
        #[allow(clippy::cast_possible_truncation)]
        let (z, q) = (z_col[i] as i32, q_col[i] as i32);
        if let Some((z_req, q_req)) = select {
            if z != z_req || q != q_req {
                continue;
            }
        }

        let nc = usize::try_from(n_cont[i]).unwrap_or(0).min(e_cont[i].len());
        let np = usize::try_from(n_pseudo[i]).unwrap_or(0).min(e_pseudo[i].len());

        let mut grid_true = e_cont[i][..nc].to_vec();
        let mut val_true = continuum[i][..nc].to_vec();
        rebin::energy_to_wavelength(&mut grid_true, &mut val_true);

        let mut grid_pseudo = e_pseudo[i][..np].to_vec();
        let mut val_pseudo = pseudo[i][..np].to_vec();
        rebin::energy_to_wavelength(&mut grid_pseudo, &mut val_pseudo);

        records.push(ContRecord {
            z,
            q,
            grid_true,
            val_true,
            grid_pseudo,
            val_pseudo,
        });
    }
    Ok(ContBlock { records })
}

fn add_cont_contrib(
    cont: &mut Continuum,
    record: &ContRecord,
    weight: f64,
    scratch: &mut [f64],
) -> Result<()> {
    if record.grid_true.len() > 1 {
        rebin::rebin(
            &record.grid_true,
            &record.val_true,
            false,
            &cont.wl_lo,
            &cont.wl_hi,
            scratch,
        )?;
        for (out, &v) in cont.true_contin.iter_mut().zip(scratch.iter()) {
            *out += weight * v;
        }
    }
    if record.grid_pseudo.len() > 1 {
        rebin::rebin(
            &record.grid_pseudo,
            &record.val_pseudo,
            false,
            &cont.wl_lo,
            &cont.wl_hi,
            scratch,
        )?;
        for (out, &v) in cont.pseudo.iter_mut().zip(scratch.iter()) {
            *out += weight * v;
        }
    }
    Ok(())
}

// Union of the corner line lists with weighted emissivities. A scratch table
// indexed by database position makes the union linear and order-independent.
fn interpolate_line_blocks(
    nlines: usize,
    blocks: &[CornerBlock<'_, LineEmisBlock>],
    weights: &Corners,
    flag: Option<&[u8]>,
) -> Result<LineSpectrum> {
    let mut scratch: Vec<(bool, f64)> = vec![(false, 0.0); nlines];
    let mut present = 0_usize;

    for (block, &(_, weight)) in blocks.iter().zip(weights.iter()) {
        let block = block.get();
        for (&index, &emis) in block.lines.iter().zip(block.emis.iter()) {
            let slot = scratch.get_mut(index as usize).ok_or_else(|| {
                Error::Corruption(format!("emissivity references line {index}"))
            })?;
            if !slot.0 {
                slot.0 = true;
                present += 1;
            }
            if flag.map_or(true, |f| f[index as usize] != 0) {
                slot.1 += weight * f64::from(emis);
            }
        }
    }

    if present == 0 {
        return Err(Error::NotFound(
            "no lines at the interpolation corners".into(),
        ));
    }

    let mut lines = Vec::with_capacity(present);
    let mut emis = Vec::with_capacity(present);
    let mut lookup = vec![-1_i32; nlines];
    for (index, &(seen, value)) in scratch.iter().enumerate() {
        if !seen {
            continue;
        }
        lookup[index] = i32::try_from(lines.len())
            .map_err(|_| Error::Corruption("line spectrum overflow".into()))?;
        lines.push(u32::try_from(index).unwrap_or(u32::MAX));
        #[allow(clippy::cast_possible_truncation)]
        emis.push(value.max(0.0) as f32);
    }

    Ok(LineSpectrum {
        par: [0.0; 2],
        lines,
        emis,
        lookup,
    })
}
