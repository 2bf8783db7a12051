//! Abstract tabular data source.
//!
//! The engine consumes atomic and emissivity data as streams of *extensions*:
//! keyword-indexed metadata plus typed columns of uniform length. Decoding a
//! concrete container (FITS or otherwise) is a collaborator's job; tests and
//! embedders build [`MemoryTable`] fixtures directly.

use crate::error::{Error, Result};
use rustc_hash::FxHashMap;

/// Scalar keyword attached to an extension header.
#[derive(Clone, Debug, PartialEq)]
pub enum Keyword {
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<i64> for Keyword {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Keyword {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Keyword {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

/// Typed column of an extension.
#[derive(Clone, Debug, PartialEq)]
pub enum Column {
    Int(Vec<i64>),
    Float(Vec<f64>),
    Text(Vec<String>),
    /// Variable-length float vectors, one per row.
    FloatArray(Vec<Vec<f64>>),
    /// Variable-length integer vectors, one per row.
    IntArray(Vec<Vec<i64>>),
}

impl Column {
    fn len(&self) -> usize {
        match self {
            Self::Int(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Text(v) => v.len(),
            Self::FloatArray(v) => v.len(),
            Self::IntArray(v) => v.len(),
        }
    }
}

/// One table extension: a named header plus columns of equal row count.
#[derive(Clone, Debug, Default)]
pub struct Extension {
    name: String,
    rows: usize,
    keywords: FxHashMap<String, Keyword>,
    columns: FxHashMap<String, Column>,
}

impl Extension {
    /// Empty extension with the given name.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Self::default()
        }
    }

    /// Attach a keyword (builder style).
    #[must_use]
    pub fn with_keyword(mut self, key: &str, value: impl Into<Keyword>) -> Self {
        self.keywords.insert(key.to_owned(), value.into());
        self
    }

    /// Attach a column (builder style).
    ///
    /// # Panics
    ///
    /// Panics if the column's row count differs from columns already present.
    #[must_use]
    pub fn with_column(mut self, name: &str, column: Column) -> Self {
        if self.columns.is_empty() {
            self.rows = column.len();
        } else {
            assert_eq!(self.rows, column.len(), "column {name} row count");
        }
        self.columns.insert(name.to_owned(), column);
        self
    }

    /// Extension name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of rows shared by every column.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Whether the header carries `key`.
    #[must_use]
    pub fn has_keyword(&self, key: &str) -> bool {
        self.keywords.contains_key(key)
    }

    /// Integer keyword, or a parse error naming the missing/mistyped key.
    pub fn int_keyword(&self, key: &str) -> Result<i64> {
        match self.keywords.get(key) {
            Some(Keyword::Int(v)) => Ok(*v),
            Some(_) => Err(Error::Parse(format!(
                "keyword {key} in {} is not an integer",
                self.name
            ))),
            None => Err(Error::Parse(format!("missing keyword {key} in {}", self.name))),
        }
    }

    /// Float keyword; integer keywords are widened.
    pub fn float_keyword(&self, key: &str) -> Result<f64> {
        match self.keywords.get(key) {
            Some(Keyword::Float(v)) => Ok(*v),
            #[allow(clippy::cast_precision_loss)]
            Some(Keyword::Int(v)) => Ok(*v as f64),
            Some(Keyword::Text(_)) => Err(Error::Parse(format!(
                "keyword {key} in {} is not numeric",
                self.name
            ))),
            None => Err(Error::Parse(format!("missing keyword {key} in {}", self.name))),
        }
    }

    /// String keyword.
    pub fn text_keyword(&self, key: &str) -> Result<&str> {
        match self.keywords.get(key) {
            Some(Keyword::Text(v)) => Ok(v),
            Some(_) => Err(Error::Parse(format!(
                "keyword {key} in {} is not a string",
                self.name
            ))),
            None => Err(Error::Parse(format!("missing keyword {key} in {}", self.name))),
        }
    }

    fn column(&self, name: &str) -> Result<&Column> {
        self.columns.get(name).ok_or_else(|| {
            Error::Parse(format!("missing column {name} in {}", self.name))
        })
    }

    /// Integer column.
    pub fn int_col(&self, name: &str) -> Result<&[i64]> {
        match self.column(name)? {
            Column::Int(v) => Ok(v),
            _ => Err(Error::Parse(format!(
                "column {name} in {} is not integer",
                self.name
            ))),
        }
    }

    /// Float column.
    pub fn float_col(&self, name: &str) -> Result<&[f64]> {
        match self.column(name)? {
            Column::Float(v) => Ok(v),
            _ => Err(Error::Parse(format!(
                "column {name} in {} is not float",
                self.name
            ))),
        }
    }

    /// String column.
    pub fn text_col(&self, name: &str) -> Result<&[String]> {
        match self.column(name)? {
            Column::Text(v) => Ok(v),
            _ => Err(Error::Parse(format!(
                "column {name} in {} is not text",
                self.name
            ))),
        }
    }

    /// Variable-length float-array column.
    pub fn array_col(&self, name: &str) -> Result<&[Vec<f64>]> {
        match self.column(name)? {
            Column::FloatArray(v) => Ok(v),
            _ => Err(Error::Parse(format!(
                "column {name} in {} is not a float array",
                self.name
            ))),
        }
    }

    /// Variable-length integer-array column.
    pub fn int_array_col(&self, name: &str) -> Result<&[Vec<i64>]> {
        match self.column(name)? {
            Column::IntArray(v) => Ok(v),
            _ => Err(Error::Parse(format!(
                "column {name} in {} is not an integer array",
                self.name
            ))),
        }
    }

    /// Integer column if present, `None` otherwise.
    #[must_use]
    pub fn opt_int_col(&self, name: &str) -> Option<&[i64]> {
        match self.columns.get(name) {
            Some(Column::Int(v)) => Some(v),
            _ => None,
        }
    }

    /// Whether a column named `name` exists.
    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }
}

/// Source of table extensions: a decoded FITS file, an in-memory fixture, ...
///
/// Extensions are addressed by 0-origin index. Sources backing a lazily
/// loaded store are re-queried for the same index many times and should make
/// repeated fetches cheap.
pub trait TableSource {
    /// Identifying name used in log messages.
    fn name(&self) -> &str;

    /// Number of extensions available.
    fn num_extensions(&self) -> usize;

    /// Fetch extension `index`.
    ///
    /// # Errors
    ///
    /// I/O or decode failures of the backing container, or `index` out of
    /// range.
    fn extension(&self, index: usize) -> Result<Extension>;
}

/// Fully memory-resident [`TableSource`].
#[derive(Clone, Debug, Default)]
pub struct MemoryTable {
    name: String,
    extensions: Vec<Extension>,
}

impl MemoryTable {
    /// Empty source with the given name.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            extensions: Vec::new(),
        }
    }

    /// Append an extension (builder style).
    #[must_use]
    pub fn with_extension(mut self, ext: Extension) -> Self {
        self.extensions.push(ext);
        self
    }

    /// Append an extension.
    pub fn push(&mut self, ext: Extension) {
        self.extensions.push(ext);
    }
}

impl TableSource for MemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_extensions(&self) -> usize {
        self.extensions.len()
    }

    fn extension(&self, index: usize) -> Result<Extension> {
        self.extensions.get(index).cloned().ok_or_else(|| {
            Error::NotFound(format!("extension {index} in {}", self.name))
        })
    }
}
