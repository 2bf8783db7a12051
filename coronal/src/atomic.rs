//! Atomic line and energy-level database.
//!
//! The database owns the canonical line array. Line positions are assigned
//! once and never move; every other structure (the wavelength-sorted
//! permutation, the open-addressed hash table, the per-level downward
//! transition lists) is a derived view rebuilt atomically whenever lines are
//! appended. External holders reference lines by index, never by pointer, so
//! growth during a merge cannot invalidate them.

use crate::error::{Error, Result};
use crate::interrupt::Interrupt;
use crate::table::TableSource;
use crate::units::{self, IonFormat, MAX_PROTON_NUMBER};
use log::{info, warn};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Two wavelengths are "the same" when `|a/b - 1|` is below this.
pub const WAVELEN_TOL: f32 = 1.0e-5;

const NHASH_DIGITS: i32 = 5;
const WARN_HASH_MISSES: u32 = 128;

// Hash table sizes; first prime at least twice the line count is used.
const PRIME_LIST: [u64; 18] = [
    16381, 32749, 65521, 131071, 262139, //
    524287, 1048573, 2097143, 4194301, 8388593, //
    16777213, 33554393, 67108859, 134217689, 268435399, //
    536870909, 1073741789, 4294967295,
];

const IONSIZE: usize = MAX_PROTON_NUMBER * MAX_PROTON_NUMBER + 1;

/// One radiative transition between two levels of a single ion.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Line {
    /// Flux in the current model [photons/cm^2/s]. Scratch, written by the
    /// spectrum evaluator.
    pub flux: f64,
    /// Wavelength [Angstrom]; the observed value when one is available.
    pub wavelen: f32,
    /// Wavelength uncertainty [Angstrom].
    pub wavelen_err: f32,
    /// Einstein A coefficient [1/s].
    pub a_value: f32,
    /// Uncertainty in the Einstein A coefficient [1/s].
    pub a_err: f32,
    /// Upper level index (1-origin; 1 is the ground state).
    pub upper_level: u32,
    /// Lower level index (1-origin).
    pub lower_level: u32,
    /// Ion charge; 0 is the neutral atom.
    pub ion_charge: u8,
    /// Proton number.
    pub proton_number: u8,
    /// True once an emissivity table references this line.
    pub have_emissivity_data: bool,
    index: u32,
}

impl Line {
    /// Position of this line in the database's canonical array. Stable for
    /// the lifetime of the database.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    fn matches(&self, wavelen: f32, z: u8, q: u8, upper: u32, lower: u32) -> bool {
        self.proton_number == z
            && self.ion_charge == q
            && self.upper_level == upper
            && self.lower_level == lower
            && (self.wavelen / wavelen - 1.0).abs() < WAVELEN_TOL
    }
}

/// Identity and atomic parameters of a line to be merged into the database.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LineAddition {
    pub wavelen: f32,
    pub wavelen_err: f32,
    pub a_value: f32,
    pub a_err: f32,
    pub proton_number: u8,
    pub ion_charge: u8,
    pub upper_level: u32,
    pub lower_level: u32,
}

/// One energy level of an ion.
///
/// The ground state is level 1 in the data files but is stored at array
/// offset 0.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Level {
    /// Excitation energy [eV].
    pub energy: f32,
    /// Statistical weight.
    pub stat_weight: f32,
    /// Principal quantum number, -1 if unknown.
    pub n: i32,
    /// Orbital quantum number, -1 if unknown.
    pub l: i32,
    /// Spin quantum number, -1 if unknown.
    pub s: f32,
    /// Configuration label, possibly empty.
    pub label: String,
    /// Indices of database lines whose upper level is this one.
    pub down: Vec<u32>,
}

/// Energy-level inventory for one (Z, q) ion.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Ion {
    /// Proton number.
    pub proton_number: u8,
    /// Ion charge.
    pub charge: u8,
    levels: Vec<Level>,
}

impl Ion {
    /// Number of levels loaded for this ion.
    #[must_use]
    pub fn nlevels(&self) -> usize {
        self.levels.len()
    }

    /// Level by 1-origin index (1 = ground state).
    #[must_use]
    pub fn level(&self, index: u32) -> Option<&Level> {
        if index == 0 {
            return None;
        }
        self.levels.get(index as usize - 1)
    }
}

/// One downward transition out of a level, with its branching ratio.
#[derive(Clone, Debug)]
pub struct BranchingLine {
    /// Database index of the transition.
    pub line: u32,
    /// Wavelength [Angstrom].
    pub wavelen: f32,
    /// Lower level of the transition.
    pub lower_level: u32,
    /// Einstein A [1/s].
    pub a_value: f32,
    /// `A / sum(A)` over all downward transitions out of the upper level.
    pub ratio: f64,
}

/// Branching-ratio report block for one upper level.
#[derive(Clone, Debug)]
pub struct LevelBranching {
    /// Upper level index (1-origin).
    pub upper_level: u32,
    /// Configuration label of the upper level.
    pub label: String,
    /// Sum of A coefficients over the downward transitions.
    pub total_a: f64,
    /// The downward transitions, in database order.
    pub lines: Vec<BranchingLine>,
}

/// The atomic database: lines, per-ion level inventories, and the derived
/// lookup structures.
#[derive(Debug)]
pub struct LineDb {
    lines: Vec<Line>,
    sorted: Vec<u32>,
    hash: Vec<Option<u32>>,
    max_hash_misses: u32,
    ions: Vec<Option<Ion>>,
}

impl Default for LineDb {
    fn default() -> Self {
        Self {
            lines: Vec::new(),
            sorted: Vec::new(),
            hash: Vec::new(),
            max_hash_misses: 0,
            ions: vec![None; IONSIZE],
        }
    }
}

const fn ion_slot(z: u8, q: u8) -> usize {
    (z as usize - 1) * MAX_PROTON_NUMBER + q as usize
}

fn valid_ion(z: u32, q: u32) -> bool {
    z >= 1 && z <= MAX_PROTON_NUMBER as u32 && q <= z
}

/// Primary hash over the full line identity.
///
/// The wavelength enters through its five most significant base-10 digits;
/// energy level data may be unavailable, so the wavelength cannot be skipped,
/// but using every bit of it would make round-off differences fatal.
fn hash_key(wavelen: f32, z: u8, q: u8, upper: u32, lower: u32, size: u64) -> u64 {
    let wl = f64::from(wavelen);
    #[allow(clippy::cast_possible_truncation)]
    let xp = NHASH_DIGITS - 1 - (wl.log10() as i32);
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let iwl = (wl * 10.0_f64.powi(xp)) as u64;

    let mut h = (u64::from(upper) << 4) % size;
    h = ((h + u64::from(q)) << 12) % size;
    h = ((h + u64::from(lower)) << 4) % size;
    h = ((h + u64::from(z)) << 12) % size;
    (h + iwl) % size
}

/// Secondary (probe step) hash; always in `1..=53`.
const fn hash_step(z: u8, q: u8) -> u64 {
    (11 * z as u64 + q as u64) % 53 + 1
}

fn next_prime(min: u64) -> u64 {
    for &p in &PRIME_LIST {
        if p >= min {
            return p;
        }
    }
    *PRIME_LIST.last().unwrap()
}

impl LineDb {
    /// Load a database from zero or more energy-level sources and zero or
    /// more line-list sources.
    ///
    /// A failing source is reported and skipped; the remaining sources still
    /// load. Only cancellation aborts the whole open.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] when the interrupt flag is observed.
    pub fn open(
        level_sources: &[&dyn TableSource],
        line_sources: &[&dyn TableSource],
        interrupt: &Interrupt,
    ) -> Result<Self> {
        let mut db = Self::default();

        for source in level_sources {
            interrupt.check()?;
            match db.load_level_source(*source, interrupt) {
                Ok(()) => {}
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => warn!("skipping energy levels from {}: {e}", source.name()),
            }
        }

        for source in line_sources {
            interrupt.check()?;
            match db.load_line_source(*source, interrupt) {
                Ok(()) => {}
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => warn!("skipping wavelength tables from {}: {e}", source.name()),
            }
        }

        db.rebuild_internals()?;
        Ok(db)
    }

    fn load_level_source(
        &mut self,
        source: &dyn TableSource,
        interrupt: &Interrupt,
    ) -> Result<()> {
        for index in 0..source.num_extensions() {
            interrupt.check()?;
            let ext = source.extension(index)?;

            let z = u8::try_from(ext.int_keyword("ELEMENT")?)
                .map_err(|_| Error::Parse("ELEMENT out of range".into()))?;
            let q = u8::try_from(ext.int_keyword("ION_STAT")?)
                .map_err(|_| Error::Parse("ION_STAT out of range".into()))?;
            if !valid_ion(u32::from(z), u32::from(q)) {
                return Err(Error::InvalidParam(format!("ion Z={z} q={q}")));
            }
            let nlevels = usize::try_from(ext.int_keyword("N_LEVELS")?)
                .map_err(|_| Error::Parse("N_LEVELS out of range".into()))?;

            let energy = ext.float_col("Energy")?;
            let degeneracy = ext.float_col("Lev_Deg")?;
            let labels = ext.text_col("Elec_Config")?;
            if energy.len() < nlevels {
                return Err(Error::Parse(format!(
                    "level table for Z={z} q={q} has {} rows, N_LEVELS={nlevels}",
                    energy.len()
                )));
            }

            let n_quan = ext.opt_int_col("N_quan");
            let l_quan = ext.opt_int_col("L_quan");
            let s_quan = ext.float_col("S_quan").ok();

            let mut levels = Vec::with_capacity(nlevels);
            for i in 0..nlevels {
                #[allow(clippy::cast_possible_truncation)]
                levels.push(Level {
                    energy: energy[i] as f32,
                    stat_weight: degeneracy[i] as f32,
                    n: n_quan.map_or(-1, |c| c[i] as i32),
                    l: l_quan.map_or(-1, |c| c[i] as i32),
                    s: s_quan.map_or(-1.0, |c| c[i] as f32),
                    label: labels[i].clone(),
                    down: Vec::new(),
                });
            }

            self.ions[ion_slot(z, q)] = Some(Ion {
                proton_number: z,
                charge: q,
                levels,
            });
        }
        Ok(())
    }

    fn load_line_source(
        &mut self,
        source: &dyn TableSource,
        interrupt: &Interrupt,
    ) -> Result<()> {
        let mut dropped = 0_usize;
        for index in 0..source.num_extensions() {
            interrupt.check()?;
            let ext = source.extension(index)?;

            let z = u8::try_from(ext.int_keyword("ELEMENT")?)
                .map_err(|_| Error::Parse("ELEMENT out of range".into()))?;
            let q = u8::try_from(ext.int_keyword("ION_STAT")?)
                .map_err(|_| Error::Parse("ION_STAT out of range".into()))?;
            if !valid_ion(u32::from(z), u32::from(q)) {
                return Err(Error::InvalidParam(format!("ion Z={z} q={q}")));
            }

            let upper = ext.int_col("Upper_Lev")?;
            let lower = ext.int_col("Lower_Lev")?;
            let wavelen = ext.float_col("Wavelen")?;
            let wave_obs = ext.float_col("Wave_Obs")?;
            let wave_err = ext.float_col("Wave_Err")?;
            let a_value = ext.float_col("Einstein_A")?;
            let a_err = ext.float_col("Ein_A_err")?;

            for row in 0..ext.rows() {
                // observed wavelength wins over the theoretical one
                let wl = if wave_obs[row] > 0.0 {
                    wave_obs[row]
                } else {
                    wavelen[row]
                };
                let (Ok(up), Ok(lo)) =
                    (u32::try_from(upper[row]), u32::try_from(lower[row]))
                else {
                    dropped += 1;
                    continue;
                };
                if wl <= 0.0 || up == 0 || lo == 0 || up == lo {
                    dropped += 1;
                    continue;
                }
                #[allow(clippy::cast_possible_truncation)]
                let line = Line {
                    flux: 0.0,
                    wavelen: wl as f32,
                    wavelen_err: wave_err[row].max(0.0) as f32,
                    a_value: a_value[row] as f32,
                    a_err: a_err[row] as f32,
                    upper_level: up,
                    lower_level: lo,
                    ion_charge: q,
                    proton_number: z,
                    have_emissivity_data: false,
                    index: u32::try_from(self.lines.len())
                        .map_err(|_| Error::InvalidParam("too many lines".into()))?,
                };
                self.lines.push(line);
            }
        }
        if dropped > 0 {
            warn!("{dropped} rows with unusable wavelengths dropped from {}", source.name());
        }
        Ok(())
    }

    /// Number of lines in the database.
    #[must_use]
    pub fn nlines(&self) -> usize {
        self.lines.len()
    }

    /// All lines in canonical (index) order.
    #[must_use]
    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    /// Line by database index.
    #[must_use]
    pub fn line(&self, index: u32) -> Option<&Line> {
        self.lines.get(index as usize)
    }

    /// The wavelength-ascending permutation of line indices.
    #[must_use]
    pub fn sorted_by_wavelength(&self) -> &[u32] {
        &self.sorted
    }

    /// Largest number of probe steps any lookup can need.
    #[must_use]
    pub const fn max_hash_misses(&self) -> u32 {
        self.max_hash_misses
    }

    #[cfg(test)]
    pub(crate) fn hash_table_size(&self) -> usize {
        self.hash.len()
    }

    /// Exact-identity lookup through the hash table.
    ///
    /// Matches when Z, q and the level indices agree exactly and the
    /// wavelengths agree to [`WAVELEN_TOL`] (relative).
    #[must_use]
    pub fn get_line(
        &self,
        wavelen: f32,
        z: u32,
        q: u32,
        upper: u32,
        lower: u32,
    ) -> Option<&Line> {
        if wavelen <= 0.0 || !valid_ion(z, q) || self.hash.is_empty() {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        let (z8, q8) = (z as u8, q as u8);
        let size = self.hash.len() as u64;
        let mut h = hash_key(wavelen, z8, q8, upper, lower, size);
        let step = hash_step(z8, q8);

        // probes bounded by the worst insertion chain seen while building
        for _ in 0..=self.max_hash_misses {
            #[allow(clippy::cast_possible_truncation)]
            if let Some(index) = self.hash[h as usize] {
                let line = &self.lines[index as usize];
                if line.matches(wavelen, z8, q8, upper, lower) {
                    return Some(line);
                }
            }
            h = (h + step) % size;
        }
        None
    }

    /// Brute-force lookup ignoring the wavelength.
    #[must_use]
    pub fn get_line_by_indices(
        &self,
        z: u32,
        q: u32,
        upper: u32,
        lower: u32,
    ) -> Option<&Line> {
        if !valid_ion(z, q) {
            return None;
        }
        self.lines.iter().find(|line| {
            u32::from(line.proton_number) == z
                && u32::from(line.ion_charge) == q
                && line.upper_level == upper
                && line.lower_level == lower
        })
    }

    /// Append lines absent from the inventory.
    ///
    /// Additions already present (by exact identity, wavelength within
    /// tolerance) are skipped, as are duplicates within `additions` itself.
    /// All derived structures are rebuilt after the batch commits; indices of
    /// pre-existing lines do not change. Returns the number of lines added.
    ///
    /// # Errors
    ///
    /// Fails if rebuilding the hash table exceeds its probe bound.
    pub fn merge_lines(&mut self, additions: &[LineAddition]) -> Result<usize> {
        let mut staged: Vec<LineAddition> = Vec::new();
        let mut by_identity: FxHashMap<(u8, u8, u32, u32), Vec<usize>> =
            FxHashMap::default();

        for add in additions {
            if self
                .get_line(
                    add.wavelen,
                    u32::from(add.proton_number),
                    u32::from(add.ion_charge),
                    add.upper_level,
                    add.lower_level,
                )
                .is_some()
            {
                continue;
            }
            let key = (
                add.proton_number,
                add.ion_charge,
                add.upper_level,
                add.lower_level,
            );
            let bucket = by_identity.entry(key).or_default();
            let dup = bucket.iter().any(|&i| {
                let prev: &LineAddition = &staged[i];
                (prev.wavelen / add.wavelen - 1.0).abs() < WAVELEN_TOL
            });
            if dup {
                continue;
            }
            bucket.push(staged.len());
            staged.push(*add);
        }

        if staged.is_empty() {
            return Ok(0);
        }

        let offset = self.lines.len();
        self.lines.reserve(staged.len());
        for (i, add) in staged.iter().enumerate() {
            self.lines.push(Line {
                flux: 0.0,
                wavelen: add.wavelen,
                wavelen_err: add.wavelen_err,
                a_value: add.a_value,
                a_err: add.a_err,
                upper_level: add.upper_level,
                lower_level: add.lower_level,
                ion_charge: add.ion_charge,
                proton_number: add.proton_number,
                have_emissivity_data: false,
                index: u32::try_from(offset + i)
                    .map_err(|_| Error::InvalidParam("too many lines".into()))?,
            });
        }

        self.rebuild_internals()?;
        Ok(staged.len())
    }

    /// Overwrite a line's wavelength in place.
    ///
    /// The hash table is *not* rebuilt: exact-identity lookups for the edited
    /// line may fail until the next merge. Call [`Self::sort_lines`]
    /// afterwards to restore the wavelength-sorted permutation.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParam`] for an unknown index or non-positive
    /// wavelength.
    pub fn set_line_wavelength(
        &mut self,
        index: u32,
        wavelen: f32,
        wavelen_err: f32,
    ) -> Result<()> {
        if wavelen <= 0.0 {
            return Err(Error::InvalidParam(format!("wavelength {wavelen}")));
        }
        let line = self
            .lines
            .get_mut(index as usize)
            .ok_or_else(|| Error::InvalidParam(format!("line index {index}")))?;
        line.wavelen = wavelen;
        line.wavelen_err = wavelen_err;
        Ok(())
    }

    /// Clear the model-flux scratch field of every line.
    pub fn zero_line_flux(&mut self) {
        for line in &mut self.lines {
            line.flux = 0.0;
        }
    }

    /// Add `flux` to a line's scratch flux field.
    pub(crate) fn add_line_flux(&mut self, index: u32, flux: f64) {
        if let Some(line) = self.lines.get_mut(index as usize) {
            line.flux += flux;
        }
    }

    pub(crate) fn mark_emissivity_data(&mut self, index: u32) {
        if let Some(line) = self.lines.get_mut(index as usize) {
            line.have_emissivity_data = true;
        }
    }

    /// Level inventory for ion (Z, q), if one was loaded.
    #[must_use]
    pub fn get_ion(&self, z: u32, q: u32) -> Option<&Ion> {
        if !valid_ion(z, q) {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        let slot = ion_slot(z as u8, q as u8);
        self.ions[slot].as_ref()
    }

    /// Configuration label of level `index` of ion (Z, q); empty when the
    /// level (or the whole ion) is missing.
    #[must_use]
    pub fn get_level_label(&self, z: u32, q: u32, index: u32) -> &str {
        self.get_ion(z, q)
            .and_then(|ion| ion.level(index))
            .map_or("", |level| level.label.as_str())
    }

    /// Branching-ratio report for ion (Z, q): every level with at least one
    /// downward transition, with per-line `A / sum(A)`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when no level data is loaded for the ion.
    pub fn branching_for_ion(&self, z: u32, q: u32) -> Result<Vec<LevelBranching>> {
        let ion = self.get_ion(z, q).ok_or_else(|| {
            Error::NotFound(format!("no level data for Z={z} q={q}"))
        })?;

        let mut report = Vec::new();
        for (offset, level) in ion.levels.iter().enumerate() {
            if level.down.is_empty() {
                continue;
            }
            let total_a = units::kahan_sum(
                level
                    .down
                    .iter()
                    .map(|&k| f64::from(self.lines[k as usize].a_value)),
            );
            let lines = level
                .down
                .iter()
                .map(|&k| {
                    let line = &self.lines[k as usize];
                    BranchingLine {
                        line: k,
                        wavelen: line.wavelen,
                        lower_level: line.lower_level,
                        a_value: line.a_value,
                        ratio: if total_a > 0.0 {
                            f64::from(line.a_value) / total_a
                        } else {
                            0.0
                        },
                    }
                })
                .collect();
            report.push(LevelBranching {
                upper_level: u32::try_from(offset + 1).unwrap_or(u32::MAX),
                label: level.label.clone(),
                total_a,
                lines,
            });
        }
        Ok(report)
    }

    /// Display name of a line, e.g. `Fe XVII 15.0140` or (long form)
    /// `Fe XVII 15.0140 (3 -> 1)` with level labels appended when loaded.
    #[must_use]
    pub fn line_name(&self, index: u32, long: bool, format: IonFormat) -> Option<String> {
        let line = self.line(index)?;
        let ion = units::ion_name(
            u32::from(line.proton_number),
            u32::from(line.ion_charge),
            format,
        )?;
        if !long {
            return Some(format!("{ion} {:.4}", line.wavelen));
        }
        let mut name = format!(
            "{ion} {:.4} ({} -> {})",
            line.wavelen, line.upper_level, line.lower_level
        );
        let up_label = self.get_level_label(
            u32::from(line.proton_number),
            u32::from(line.ion_charge),
            line.upper_level,
        );
        let lo_label = self.get_level_label(
            u32::from(line.proton_number),
            u32::from(line.ion_charge),
            line.lower_level,
        );
        if !up_label.is_empty() || !lo_label.is_empty() {
            name.push_str(&format!("  {up_label} - {lo_label}"));
        }
        Some(name)
    }

    /// Rebuild the wavelength-sorted permutation.
    pub fn sort_lines(&mut self) {
        let mut index: Vec<u32> = (0..self.lines.len())
            .map(|i| u32::try_from(i).unwrap_or(u32::MAX))
            .collect();
        index.sort_by(|&a, &b| {
            self.lines[a as usize]
                .wavelen
                .total_cmp(&self.lines[b as usize].wavelen)
        });
        self.sorted = index;
    }

    fn rebuild_internals(&mut self) -> Result<()> {
        self.sort_lines();

        if let (Some(&imin), Some(&imax)) = (self.sorted.first(), self.sorted.last()) {
            info!(
                "tables have {} lines between {:.4} and {:.4} Angstrom",
                self.lines.len(),
                self.lines[imin as usize].wavelen,
                self.lines[imax as usize].wavelen
            );
        }

        if !self.lines.is_empty() {
            self.build_hash_table()?;
        }
        self.build_branching();
        Ok(())
    }

    fn build_hash_table(&mut self) -> Result<()> {
        let size = next_prime(2 * self.lines.len() as u64 + 1);
        #[allow(clippy::cast_possible_truncation)]
        let mut table: Vec<Option<u32>> = vec![None; size as usize];
        let mut max_misses: u32 = 0;

        for line in &self.lines {
            let mut h = hash_key(
                line.wavelen,
                line.proton_number,
                line.ion_charge,
                line.upper_level,
                line.lower_level,
                size,
            );
            let step = hash_step(line.proton_number, line.ion_charge);
            let mut misses: u32 = 0;

            #[allow(clippy::cast_possible_truncation)]
            while table[h as usize].is_some() {
                h = (h + step) % size;
                misses += 1;
                if misses as usize > self.lines.len() {
                    return Err(Error::Corruption(format!(
                        "hash table probe bound exceeded (hash_misses = {misses})"
                    )));
                }
            }
            #[allow(clippy::cast_possible_truncation)]
            {
                table[h as usize] = Some(line.index);
            }
            max_misses = max_misses.max(misses);
        }

        if max_misses > WARN_HASH_MISSES {
            warn!("hash table is slow: max_hash_misses = {max_misses}");
        }

        self.hash = table;
        self.max_hash_misses = max_misses;
        Ok(())
    }

    fn build_branching(&mut self) {
        for ion in self.ions.iter_mut().flatten() {
            for level in &mut ion.levels {
                level.down.clear();
            }
        }

        for line in &self.lines {
            let slot = ion_slot(line.proton_number, line.ion_charge);
            let Some(ion) = self.ions[slot].as_mut() else {
                continue;
            };
            let up = line.upper_level as usize;
            let lo = line.lower_level as usize;
            if up < 1 || up > ion.levels.len() || lo < 1 || lo > ion.levels.len() {
                continue;
            }
            ion.levels[up - 1].down.push(line.index);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::table::{Column, Extension, MemoryTable};

    pub(crate) fn line_extension(z: i64, q: i64, rows: &[(i64, i64, f64, f64)]) -> Extension {
        Extension::new("LINES")
            .with_keyword("ELEMENT", z)
            .with_keyword("ION_STAT", q)
            .with_column("Upper_Lev", Column::Int(rows.iter().map(|r| r.0).collect()))
            .with_column("Lower_Lev", Column::Int(rows.iter().map(|r| r.1).collect()))
            .with_column("Wavelen", Column::Float(rows.iter().map(|r| r.2).collect()))
            .with_column("Wave_Obs", Column::Float(rows.iter().map(|r| r.3).collect()))
            .with_column(
                "Wave_Err",
                Column::Float(rows.iter().map(|_| 0.001).collect()),
            )
            .with_column(
                "Einstein_A",
                Column::Float(rows.iter().map(|_| 1.0e12).collect()),
            )
            .with_column(
                "Ein_A_err",
                Column::Float(rows.iter().map(|_| 0.0).collect()),
            )
    }

    pub(crate) fn level_extension(z: i64, q: i64, labels: &[&str]) -> Extension {
        let n = labels.len();
        Extension::new("LEVELS")
            .with_keyword("ELEMENT", z)
            .with_keyword("ION_STAT", q)
            .with_keyword("N_LEVELS", i64::try_from(n).unwrap())
            .with_column(
                "Energy",
                Column::Float((0..n).map(|i| 10.0 * i as f64).collect()),
            )
            .with_column("Lev_Deg", Column::Float(vec![1.0; n]))
            .with_column(
                "Elec_Config",
                Column::Text(labels.iter().map(|&s| s.to_owned()).collect()),
            )
    }

    pub(crate) fn small_db() -> LineDb {
        let lines = MemoryTable::new("lines").with_extension(line_extension(
            26,
            16,
            &[(3, 1, 15.014, -1.0), (2, 1, 16.780, -1.0), (5, 2, 12.266, -1.0)],
        ));
        let levels = MemoryTable::new("levels").with_extension(level_extension(
            26,
            16,
            &["ground", "2s", "2p", "3s", "3p"],
        ));
        LineDb::open(&[&levels], &[&lines], &Interrupt::new()).unwrap()
    }

    #[test]
    fn hash_table_is_prime_and_big_enough() {
        let db = small_db();
        let size = db.hash_table_size() as u64;
        assert!(size >= 2 * db.nlines() as u64);
        assert!(PRIME_LIST.contains(&size));
    }

    #[test]
    fn exact_lookup_with_tolerance() {
        let lines = MemoryTable::new("lines")
            .with_extension(line_extension(26, 16, &[(3, 1, 12.3456, -1.0)]));
        let db = LineDb::open(&[], &[&lines], &Interrupt::new()).unwrap();

        assert!(db.get_line(12.3456, 26, 16, 3, 1).is_some());
        // within 0.9 * tolerance
        assert!(db.get_line(12.3456 * (1.0 + 0.9e-5), 26, 16, 3, 1).is_some());
        // wrong lower level
        assert!(db.get_line(12.3456, 26, 16, 3, 2).is_none());
        // outside tolerance
        assert!(db.get_line(12.3456 * 1.001, 26, 16, 3, 1).is_none());
        // invalid ion
        assert!(db.get_line(12.3456, 26, 27, 3, 1).is_none());

        assert!(db.get_line_by_indices(26, 16, 3, 1).is_some());
        assert!(db.get_line_by_indices(26, 16, 4, 1).is_none());
    }

    #[test]
    fn observed_wavelength_preferred() {
        let lines = MemoryTable::new("lines")
            .with_extension(line_extension(8, 7, &[(2, 1, 18.9689, 18.9671)]));
        let db = LineDb::open(&[], &[&lines], &Interrupt::new()).unwrap();
        let line = db.get_line_by_indices(8, 7, 2, 1).unwrap();
        assert!((line.wavelen - 18.9671).abs() < 1e-4);
    }

    #[test]
    fn sorted_permutation_is_ascending() {
        let db = small_db();
        let sorted = db.sorted_by_wavelength();
        assert_eq!(sorted.len(), db.nlines());
        for pair in sorted.windows(2) {
            assert!(
                db.line(pair[0]).unwrap().wavelen <= db.line(pair[1]).unwrap().wavelen
            );
        }
    }

    #[test]
    fn merge_is_idempotent_and_stable() {
        let mut db = small_db();
        let n0 = db.nlines();
        let old_indices: Vec<u32> = db.lines().iter().map(Line::index).collect();

        let additions = [
            LineAddition {
                wavelen: 21.6015,
                wavelen_err: 0.0,
                a_value: 3.3e12,
                a_err: 0.0,
                proton_number: 8,
                ion_charge: 7,
                upper_level: 2,
                lower_level: 1,
            },
            // duplicate of the first, inside tolerance
            LineAddition {
                wavelen: 21.6015 * (1.0 + 0.5e-5),
                wavelen_err: 0.0,
                a_value: 3.3e12,
                a_err: 0.0,
                proton_number: 8,
                ion_charge: 7,
                upper_level: 2,
                lower_level: 1,
            },
            // already in the database
            LineAddition {
                wavelen: 15.014,
                wavelen_err: 0.0,
                a_value: 1.0e12,
                a_err: 0.0,
                proton_number: 26,
                ion_charge: 16,
                upper_level: 3,
                lower_level: 1,
            },
        ];

        assert_eq!(db.merge_lines(&additions).unwrap(), 1);
        assert_eq!(db.nlines(), n0 + 1);
        assert!(db.get_line(21.6015, 8, 7, 2, 1).is_some());
        for (i, &old) in old_indices.iter().enumerate() {
            assert_eq!(db.lines()[i].index(), old);
        }

        // repeating the identical merge changes nothing
        assert_eq!(db.merge_lines(&additions).unwrap(), 0);
        assert_eq!(db.nlines(), n0 + 1);
    }

    #[test]
    fn wavelength_edit_skips_rehash() {
        let mut db = small_db();
        let index = db.get_line_by_indices(26, 16, 3, 1).unwrap().index();
        db.set_line_wavelength(index, 15.5, 0.01).unwrap();
        db.sort_lines();

        // the brute-force path still finds it; the documented pitfall is that
        // the hashed path keys on the old wavelength
        assert!(db.get_line_by_indices(26, 16, 3, 1).is_some());
        assert!(db.get_line(15.5, 26, 16, 3, 1).is_none());
        let sorted = db.sorted_by_wavelength();
        for pair in sorted.windows(2) {
            assert!(
                db.line(pair[0]).unwrap().wavelen <= db.line(pair[1]).unwrap().wavelen
            );
        }
    }

    #[test]
    fn branching_ratios() {
        let db = small_db();
        // only level 5 -> 2 and levels 3 -> 1, 2 -> 1 are present
        let report = db.branching_for_ion(26, 16).unwrap();
        assert_eq!(report.len(), 3);
        for block in &report {
            let sum: f64 = block.lines.iter().map(|l| l.ratio).sum();
            float_cmp::assert_approx_eq!(f64, sum, 1.0, ulps = 4);
        }
        assert!(db.branching_for_ion(2, 1).is_err());
    }

    #[test]
    fn level_labels_and_names() {
        let db = small_db();
        assert_eq!(db.get_level_label(26, 16, 1), "ground");
        assert_eq!(db.get_level_label(26, 16, 9), "");
        assert_eq!(db.get_level_label(10, 9, 1), "");

        let index = db.get_line_by_indices(26, 16, 3, 1).unwrap().index();
        let short = db.line_name(index, false, IonFormat::Roman).unwrap();
        assert_eq!(short, "Fe XVII 15.0140");
        let long = db.line_name(index, true, IonFormat::Roman).unwrap();
        assert!(long.starts_with("Fe XVII 15.0140 (3 -> 1)"));
        assert!(long.contains("2p - ground"));
    }

    #[test]
    fn interrupt_aborts_open() {
        let lines = MemoryTable::new("lines")
            .with_extension(line_extension(26, 16, &[(3, 1, 15.014, -1.0)]));
        let interrupt = Interrupt::new();
        interrupt.raise();
        assert!(matches!(
            LineDb::open(&[], &[&lines], &interrupt),
            Err(Error::Cancelled)
        ));
    }
}
