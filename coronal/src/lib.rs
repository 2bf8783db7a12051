//! `coronal` synthesizes model emission spectra of optically-thin,
//! collisionally-ionized plasmas.
//!
//! The engine combines tabulated atomic data — per-line transition
//! parameters, per-line emissivities on a grid of electron temperatures and
//! densities, and per-ion continuum emissivities on the same grid — with
//! user-selected elemental abundances, ion-fraction overrides, line profiles
//! and per-line flux modifiers, and evaluates a multi-component plasma model
//! onto an arbitrary wavelength grid.
//!
//! The main pieces:
//! - [`atomic::LineDb`] — the atomic transition and energy-level database,
//!   with O(1) identity lookup;
//! - [`group`] — named line sets, filters, and derived queries;
//! - [`emissivity::EmissivityStore`] — the (T, nₑ)-gridded line and
//!   continuum emissivity tables, abundance and ionization registries;
//! - [`model::Model`] — the component list and its ASCII round-trip;
//! - [`Model::spectrum`](model::Model) (in [`spectrum`]) — the evaluator.
//!
//! Tabular inputs arrive through the [`table::TableSource`] abstraction;
//! decoding a concrete container format is a collaborator's concern.

pub mod abundance;
pub mod atomic;
pub mod emissivity;
pub mod error;
pub mod group;
pub mod interpolation;
pub mod interrupt;
pub mod ionization;
pub mod model;
pub mod profile;
pub mod rebin;
pub mod spectrum;
pub mod table;
pub mod units;

pub use error::{Error, Result};
