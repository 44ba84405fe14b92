#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use cf_columnar::{Column, ColumnError};
use cf_types::Scalar;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("unknown column '{name}'")]
    UnknownColumn { name: String },
    #[error("column '{column}' has length {found}, expected {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        found: usize,
    },
    #[error("duplicate column name '{name}'")]
    DuplicateColumn { name: String },
    #[error(transparent)]
    Column(#[from] ColumnError),
}

/// An in-memory table of uniquely named, equal-length columns.
///
/// Column order is the order columns were supplied in; lookups go through a
/// name-keyed map. A frame owns its columns and never mutates them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    columns: BTreeMap<String, Column>,
    column_order: Vec<String>,
    len: usize,
}

impl Frame {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Assemble a frame from already-built columns.
    pub fn new(columns: Vec<(String, Column)>) -> Result<Self, FrameError> {
        let len = columns.first().map_or(0, |(_, column)| column.len());
        let mut by_name = BTreeMap::new();
        let mut column_order = Vec::with_capacity(columns.len());

        for (name, column) in columns {
            if column.len() != len {
                return Err(FrameError::LengthMismatch {
                    column: name,
                    expected: len,
                    found: column.len(),
                });
            }
            if by_name.contains_key(&name) {
                return Err(FrameError::DuplicateColumn { name });
            }
            column_order.push(name.clone());
            by_name.insert(name, column);
        }

        Ok(Self {
            columns: by_name,
            column_order,
            len,
        })
    }

    /// Construct a frame from a dict of homogeneous value vectors.
    ///
    /// Dtype is inferred per column; string columns are dictionary-encoded
    /// here, once. All vectors must have the same length.
    pub fn from_dict(data: Vec<(&str, Vec<Scalar>)>) -> Result<Self, FrameError> {
        let mut columns = Vec::with_capacity(data.len());
        for (name, values) in data {
            let column = Column::from_values(values)?;
            debug!(
                column = name,
                dtype = %column.dtype(),
                rows = column.len(),
                dictionary = column.dictionary().map(|d| d.len()),
                "built frame column"
            );
            columns.push((name.to_owned(), column));
        }
        Self::new(columns)
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn num_columns(&self) -> usize {
        self.column_order.len()
    }

    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.column_order.iter().map(String::as_str).collect()
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    /// Like [`Frame::column`], but a missing name is an error.
    pub fn require_column(&self, name: &str) -> Result<&Column, FrameError> {
        self.columns
            .get(name)
            .ok_or_else(|| FrameError::UnknownColumn {
                name: name.to_owned(),
            })
    }

    #[must_use]
    pub fn contains_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Columns in their declared order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Column)> + '_ {
        self.column_order
            .iter()
            .filter_map(|name| self.columns.get(name).map(|column| (name.as_str(), column)))
    }
}
