//! Element-ordering and layout conventions shared by packing, unpacking and
//! evaluation.
//!
//! The remote engine never negotiates a layout: both sides agree on the
//! convention up front. Every conversion between a shaped batch and a flat
//! slot vector therefore names its [`FlattenOrder`] and [`PackingFactor`]
//! explicitly, and score matrices carry a declared [`ScoreLayout`].
//!
//! ```text
//! batch (N, d0, d1)          RowMajor ('C')    : d1 fastest, N slowest
//!                            ColumnMajor ('F') : N fastest, d1 slowest
//!                            NativeStorageOrder ('A'): whichever the
//!                              array is laid out in (F only when the
//!                              memory is Fortran- and not C-contiguous)
//! ```

use std::fmt;
use std::str::FromStr;

use ndarray::{ArrayBase, Data, Dimension};
use serde::{Deserialize, Serialize};

/// Order in which the elements of a batch tensor are written into slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlattenOrder {
    /// Last axis varies fastest (numpy `'C'`).
    RowMajor,
    /// First (batch) axis varies fastest (numpy `'F'`).
    ColumnMajor,
    /// Follow the memory layout of the input array (numpy `'A'`).
    NativeStorageOrder,
}

impl FlattenOrder {
    /// Resolve [`FlattenOrder::NativeStorageOrder`] against a concrete array.
    ///
    /// Arrays that are both C- and F-contiguous (1-d, or with unit axes)
    /// resolve to row-major. Concrete orders are returned unchanged.
    pub fn resolve<S, D>(self, array: &ArrayBase<S, D>) -> FlattenOrder
    where
        S: Data,
        D: Dimension,
    {
        match self {
            FlattenOrder::NativeStorageOrder => {
                if !array.is_standard_layout() && array.t().is_standard_layout() {
                    FlattenOrder::ColumnMajor
                } else {
                    FlattenOrder::RowMajor
                }
            }
            concrete => concrete,
        }
    }

    /// Resolve against freshly decoded flat data, which is always laid out
    /// row-major.
    pub fn resolve_flat(self) -> FlattenOrder {
        match self {
            FlattenOrder::NativeStorageOrder => FlattenOrder::RowMajor,
            concrete => concrete,
        }
    }
}

impl fmt::Display for FlattenOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlattenOrder::RowMajor => "row_major",
            FlattenOrder::ColumnMajor => "column_major",
            FlattenOrder::NativeStorageOrder => "native",
        };
        f.write_str(name)
    }
}

impl FromStr for FlattenOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "c" | "row" | "row_major" | "row-major" => Ok(FlattenOrder::RowMajor),
            "f" | "column" | "column_major" | "column-major" | "col" => {
                Ok(FlattenOrder::ColumnMajor)
            }
            "a" | "native" | "native_storage_order" | "native-storage-order" => {
                Ok(FlattenOrder::NativeStorageOrder)
            }
            _ => Err(format!(
                "unknown order '{s}', expected 'row_major' (C), 'column_major' (F) or 'native' (A)"
            )),
        }
    }
}

/// How many batch examples share one slot.
///
/// `Two` is complex packing: one half of the batch rides in the real part
/// and the other half in the imaginary part of each slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub enum PackingFactor {
    One,
    Two,
}

impl PackingFactor {
    pub fn value(self) -> usize {
        match self {
            PackingFactor::One => 1,
            PackingFactor::Two => 2,
        }
    }

    pub fn is_complex(self) -> bool {
        self == PackingFactor::Two
    }
}

impl TryFrom<usize> for PackingFactor {
    type Error = String;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PackingFactor::One),
            2 => Ok(PackingFactor::Two),
            other => Err(format!("packing factor must be 1 or 2, got {other}")),
        }
    }
}

impl From<PackingFactor> for usize {
    fn from(factor: PackingFactor) -> usize {
        factor.value()
    }
}

impl fmt::Display for PackingFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// Declared layout of a 2-d score matrix.
///
/// Fixed at the configuration layer; consumers check the declared layout
/// against the actual shape instead of guessing and transposing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreLayout {
    /// Rows are examples, columns are classes: `(batch, classes)`.
    #[default]
    BatchByClass,
    /// Rows are classes, columns are examples: `(classes, batch)`.
    ClassByBatch,
}

impl fmt::Display for ScoreLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoreLayout::BatchByClass => f.write_str("batch_by_class"),
            ScoreLayout::ClassByBatch => f.write_str("class_by_batch"),
        }
    }
}

impl FromStr for ScoreLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "batch_by_class" | "batch-by-class" | "batch" => Ok(ScoreLayout::BatchByClass),
            "class_by_batch" | "class-by-batch" | "class" => Ok(ScoreLayout::ClassByBatch),
            _ => Err(format!(
                "unknown result layout '{s}', expected 'batch_by_class' or 'class_by_batch'"
            )),
        }
    }
}
