//! Named line groups, filter predicates, and derived queries.
//!
//! Groups hold line *indices* into the [`LineDb`]; the database never moves
//! a line once assigned, so group membership stays valid across merges.

use crate::atomic::{Line, LineDb};
use crate::error::{Error, Result};
use bitflags::bitflags;
use log::{info, warn};
use serde::{Deserialize, Serialize};

bitflags! {
    /// Neighbor classes *excluded* from blend contamination in
    /// [`get_unblended`].
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct BlendMask: u32 {
        /// Ignore neighbors with the same ion charge.
        const SAME_ION = 0x01;
        /// Ignore neighbors from the same element.
        const SAME_ELEM = 0x02;
    }
}

/// Predicate selecting a subset of database lines.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum LineFilter {
    /// Half-open wavelength range `[min, max)` in Angstrom.
    Wavelength {
        min: f32,
        max: f32,
    },
    /// Half-open model-flux range `[min, max)`.
    Flux {
        min: f64,
        max: f64,
    },
    /// Z in `elements` (empty list means all) and q in `charges` (ditto).
    ElementIon {
        elements: Vec<u8>,
        charges: Vec<u8>,
    },
    /// Fixed ion, upper level in `upper` and lower in `lower` (empty lists
    /// match every level).
    Transition {
        proton_number: u8,
        charge: u8,
        upper: Vec<u32>,
        lower: Vec<u32>,
    },
}

impl LineFilter {
    /// Whether `line` satisfies this predicate.
    #[must_use]
    pub fn matches(&self, line: &Line) -> bool {
        match self {
            Self::Wavelength { min, max } => {
                *min <= line.wavelen && line.wavelen < *max
            }
            Self::Flux { min, max } => *min <= line.flux && line.flux < *max,
            Self::ElementIon { elements, charges } => {
                (elements.is_empty() || elements.contains(&line.proton_number))
                    && (charges.is_empty() || charges.contains(&line.ion_charge))
            }
            Self::Transition {
                proton_number,
                charge,
                upper,
                lower,
            } => {
                line.proton_number == *proton_number
                    && line.ion_charge == *charge
                    && (upper.is_empty() || upper.contains(&line.upper_level))
                    && (lower.is_empty() || lower.contains(&line.lower_level))
            }
        }
    }
}

/// Scan all lines, producing a byte mask of length `nlines`.
#[must_use]
pub fn apply_filter(db: &LineDb, filter: &LineFilter) -> Vec<u8> {
    db.lines()
        .iter()
        .map(|line| u8::from(filter.matches(line)))
        .collect()
}

/// A named, identified set of lines, kept sorted by wavelength.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LineGroup {
    id: u32,
    name: Option<String>,
    members: Vec<u32>,
}

impl LineGroup {
    /// Group id.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Optional user-assigned name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Member line indices, ascending in wavelength.
    #[must_use]
    pub fn members(&self) -> &[u32] {
        &self.members
    }

    /// Number of member lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the group has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Registry of line groups, indexed by id.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct GroupTable {
    groups: Vec<LineGroup>,
}

// Deduplicate `list` against `base` with an nlines-sized byte mask, then
// return the marked indices sorted by wavelength.
fn mask_and_sort(db: &LineDb, base: &[u32], list: &[u32], add: bool) -> Result<Vec<u32>> {
    let nlines = db.nlines();
    let mut mask = vec![false; nlines];
    for &index in base {
        let i = index as usize;
        if i >= nlines {
            return Err(Error::InvalidParam(format!("line index {index}")));
        }
        mask[i] = true;
    }
    for &index in list {
        let i = index as usize;
        if i >= nlines {
            return Err(Error::InvalidParam(format!("line index {index}")));
        }
        mask[i] = add;
    }

    let mut members: Vec<u32> = mask
        .iter()
        .enumerate()
        .filter_map(|(i, &m)| m.then(|| u32::try_from(i).unwrap_or(u32::MAX)))
        .collect();
    members.sort_by(|&a, &b| {
        db.lines()[a as usize]
            .wavelen
            .total_cmp(&db.lines()[b as usize].wavelen)
    });
    Ok(members)
}

impl GroupTable {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) group `id` from a list of line indices.
    ///
    /// Duplicates in `list` collapse; members come out sorted by wavelength.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParam`] when an index is out of range.
    pub fn make_group_from_list(
        &mut self,
        db: &LineDb,
        id: u32,
        list: &[u32],
    ) -> Result<&LineGroup> {
        let members = mask_and_sort(db, &[], list, true)?;
        self.delete_group(id);
        self.groups.push(LineGroup {
            id,
            name: None,
            members,
        });
        Ok(self.groups.last().unwrap())
    }

    /// Add (`add = true`) or remove (`add = false`) the listed lines from
    /// group `id`. Removing every member deletes the group.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown id, [`Error::InvalidParam`] for an
    /// out-of-range line index.
    pub fn edit_group(
        &mut self,
        db: &LineDb,
        id: u32,
        list: &[u32],
        add: bool,
    ) -> Result<()> {
        let pos = self
            .groups
            .iter()
            .position(|g| g.id == id)
            .ok_or_else(|| Error::NotFound(format!("line group {id}")))?;
        let members = mask_and_sort(db, &self.groups[pos].members, list, add)?;
        if members.is_empty() {
            self.groups.remove(pos);
        } else {
            self.groups[pos].members = members;
        }
        Ok(())
    }

    /// Remove group `id`; unknown ids are ignored.
    pub fn delete_group(&mut self, id: u32) {
        self.groups.retain(|g| g.id != id);
    }

    /// Group by id.
    #[must_use]
    pub fn find_group(&self, id: u32) -> Option<&LineGroup> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// Rename group `id`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown id.
    pub fn set_group_name(&mut self, id: u32, name: &str) -> Result<()> {
        let group = self
            .groups
            .iter_mut()
            .find(|g| g.id == id)
            .ok_or_else(|| Error::NotFound(format!("line group {id}")))?;
        group.name = Some(name.to_owned());
        Ok(())
    }

    /// All groups, in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &LineGroup> {
        self.groups.iter()
    }
}

// standard 0-based binary min-heap over flux values, addressed through an
// index array
fn sift_up(heap: &mut [usize], mut k: usize, flux: &[f64]) {
    while k > 0 {
        let parent = (k - 1) / 2;
        if flux[heap[k]] >= flux[heap[parent]] {
            break;
        }
        heap.swap(k, parent);
        k = parent;
    }
}

fn sift_down(heap: &mut [usize], mut k: usize, n: usize, flux: &[f64]) {
    loop {
        let mut child = 2 * k + 1;
        if child >= n {
            break;
        }
        if child + 1 < n && flux[heap[child + 1]] < flux[heap[child]] {
            child += 1;
        }
        if flux[heap[k]] <= flux[heap[child]] {
            break;
        }
        heap.swap(k, child);
        k = child;
    }
}

// Partial selection with a k-sized min-heap (Sedgewick): scan once, keep the
// k largest, then pop into descending order.
fn select_k_largest(flux: &[f64], k_want: usize) -> Vec<usize> {
    let k = k_want.min(flux.len());
    if k == 0 {
        return Vec::new();
    }

    let mut heap: Vec<usize> = Vec::with_capacity(k);
    for i in 0..k {
        heap.push(i);
        sift_up(&mut heap, i, flux);
    }
    for i in k..flux.len() {
        if flux[i] <= flux[heap[0]] {
            continue;
        }
        heap[0] = i;
        sift_down(&mut heap, 0, k, flux);
    }

    let mut out = vec![0_usize; k];
    let mut n = k;
    while n > 0 {
        n -= 1;
        out[n] = heap[0];
        heap[0] = heap[n];
        sift_down(&mut heap, 0, n, flux);
    }
    out
}

/// The at-most-k brightest lines of `members`, by the current model flux.
///
/// Returned in non-increasing flux order; lines with non-positive flux are
/// dropped, so fewer than `k` indices may come back.
#[must_use]
pub fn get_k_brightest(db: &LineDb, k: usize, members: &[u32]) -> Vec<u32> {
    let flux: Vec<f64> = members
        .iter()
        .map(|&i| db.line(i).map_or(0.0, |line| line.flux))
        .collect();

    let selected = select_k_largest(&flux, k);
    let out: Vec<u32> = selected
        .into_iter()
        .filter(|&i| flux[i] > 0.0)
        .map(|i| members[i])
        .collect();

    if out.is_empty() {
        warn!("all lines have flux = 0");
    } else if out.len() < k.min(members.len()) {
        warn!("only {} lines had flux > 0", out.len());
    }
    out
}

fn sorted_position(db: &LineDb, index: u32) -> Option<usize> {
    let sorted = db.sorted_by_wavelength();
    let wl = db.line(index)?.wavelen;
    let mut i = sorted.partition_point(|&k| db.lines()[k as usize].wavelen < wl);
    while i < sorted.len() {
        if sorted[i] == index {
            return Some(i);
        }
        if db.lines()[sorted[i] as usize].wavelen > wl {
            break;
        }
        i += 1;
    }
    None
}

fn counts_as_blend(line: &Line, neighbor: &Line, excluded: BlendMask) -> bool {
    excluded.is_empty()
        || (excluded.contains(BlendMask::SAME_ELEM)
            && line.proton_number != neighbor.proton_number)
        || (excluded.contains(BlendMask::SAME_ION)
            && line.ion_charge != neighbor.ion_charge)
}

/// The subset of `members` whose neighborhood is fainter than the line
/// itself.
///
/// A line passes when the summed flux of other database lines within the
/// fractional wavelength distance `wl_frac` stays below
/// `flux_frac * line.flux`. Neighbors in the classes named by `excluded` do
/// not count toward the contamination.
///
/// # Errors
///
/// [`Error::InvalidParam`] when a member index is unknown, or
/// [`Error::Corruption`] when the sorted permutation is stale.
pub fn get_unblended(
    db: &LineDb,
    flux_frac: f32,
    wl_frac: f32,
    excluded: BlendMask,
    members: &[u32],
) -> Result<Vec<u32>> {
    let sorted = db.sorted_by_wavelength();
    let mut out = Vec::new();

    for &index in members {
        let line = db
            .line(index)
            .ok_or_else(|| Error::InvalidParam(format!("line index {index}")))?;
        let pos = sorted_position(db, index).ok_or_else(|| {
            Error::Corruption("wavelength permutation is stale".into())
        })?;

        let mut contamination = 0.0_f64;
        for j in (0..pos).rev() {
            let neighbor = &db.lines()[sorted[j] as usize];
            if (1.0 - neighbor.wavelen / line.wavelen).abs() > wl_frac {
                break;
            }
            if counts_as_blend(line, neighbor, excluded) {
                contamination += neighbor.flux;
            }
        }
        for j in pos + 1..sorted.len() {
            let neighbor = &db.lines()[sorted[j] as usize];
            if (1.0 - neighbor.wavelen / line.wavelen).abs() > wl_frac {
                break;
            }
            if counts_as_blend(line, neighbor, excluded) {
                contamination += neighbor.flux;
            }
        }

        if contamination < f64::from(flux_frac) * line.flux {
            out.push(index);
        }
    }

    info!("got {} unblended lines", out.len());
    Ok(out)
}
