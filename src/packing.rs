//! Batch packing: shaped batch → flat slot vector.
//!
//! ```text
//! factor 1:  batch (N, ...)  ──flatten(order)──────────────►  Real[N·E]
//!
//! factor 2:  batch (N, ...) ─┬─ A = examples [0, N/2) ─flatten(order)─┐
//!                            └─ B = examples [N/2, N) ─flatten(order)─┤
//!                                                                     ▼
//!                                        Complex[N·E/2], slot i = A[i] + i·B[i]
//! ```
//!
//! `E` is the number of elements per example (product of the feature dims).
//! The resolved order and the factor travel with the slots in
//! [`PackingMeta`], which is everything [`crate::unpacking`] needs to invert
//! the operation.

use ndarray::{ArrayBase, ArrayViewD, Axis, Data, Dimension, IxDyn, Slice};
use serde::{Deserialize, Serialize};

use crate::layout::{FlattenOrder, PackingFactor};
use crate::slots::SlotVector;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PackingError {
    #[error("batch size {batch_size} is not divisible by packing factor {factor}")]
    NotDivisible { batch_size: usize, factor: usize },
    #[error("cannot pack an empty batch")]
    EmptyBatch,
    #[error("input has no batch axis (0-dimensional array)")]
    MissingBatchAxis,
    #[error("flat input has {actual} values, expected {expected} (batch of {batch_size} x {elements_per_example})")]
    LengthMismatch {
        expected: usize,
        actual: usize,
        batch_size: usize,
        elements_per_example: usize,
    },
    #[error("slot {index} holds a non-finite value (NaN or infinity)")]
    NonFinite { index: usize },
}

/// Shape and convention of a packed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackingMeta {
    pub batch_size: usize,
    /// Shape of one example (the input shape minus the batch axis).
    pub feature_shape: Vec<usize>,
    /// Concrete order the slots were written in (never `NativeStorageOrder`).
    pub order: FlattenOrder,
    pub factor: PackingFactor,
}

impl PackingMeta {
    pub fn elements_per_example(&self) -> usize {
        self.feature_shape.iter().product()
    }

    /// Expected number of slots for this batch.
    pub fn slot_count(&self) -> usize {
        self.batch_size * self.elements_per_example() / self.factor.value()
    }

    /// Full batch shape `(batch_size, *feature_shape)`.
    pub fn batch_shape(&self) -> Vec<usize> {
        let mut shape = Vec::with_capacity(self.feature_shape.len() + 1);
        shape.push(self.batch_size);
        shape.extend_from_slice(&self.feature_shape);
        shape
    }
}

/// A batch flattened into slots, plus the metadata to invert it.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedBatch {
    pub slots: SlotVector,
    pub meta: PackingMeta,
}

/// Flattens batches under a fixed ordering and packing factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPacker {
    order: FlattenOrder,
    factor: PackingFactor,
}

impl BatchPacker {
    pub fn new(order: FlattenOrder, factor: PackingFactor) -> Self {
        Self { order, factor }
    }

    pub fn order(&self) -> FlattenOrder {
        self.order
    }

    pub fn factor(&self) -> PackingFactor {
        self.factor
    }

    /// Pack a batch whose axis 0 is the batch axis.
    pub fn pack<S, D>(&self, batch: &ArrayBase<S, D>) -> Result<PackedBatch, PackingError>
    where
        S: Data<Elem = f64>,
        D: Dimension,
    {
        let batch = batch.view().into_dyn();
        let shape = batch.shape().to_vec();
        let (&batch_size, feature_shape) = shape.split_first().ok_or(PackingError::MissingBatchAxis)?;
        if batch_size == 0 {
            return Err(PackingError::EmptyBatch);
        }
        let factor = self.factor.value();
        if batch_size % factor != 0 {
            return Err(PackingError::NotDivisible { batch_size, factor });
        }

        let order = self.order.resolve(&batch);
        let slots = match self.factor {
            PackingFactor::One => SlotVector::Real(flatten(&batch, order)),
            PackingFactor::Two => {
                let half = batch_size / 2;
                let a = batch.slice_axis(Axis(0), Slice::from(..half));
                let b = batch.slice_axis(Axis(0), Slice::from(half..));
                SlotVector::from_halves(flatten(&a, order), flatten(&b, order))
                    .ok_or(PackingError::NotDivisible { batch_size, factor })?
            }
        };
        if let Some(index) = slots.first_non_finite() {
            return Err(PackingError::NonFinite { index });
        }

        let meta = PackingMeta {
            batch_size,
            feature_shape: feature_shape.to_vec(),
            order,
            factor: self.factor,
        };
        tracing::debug!(
            batch_size,
            elements_per_example = meta.elements_per_example(),
            slots = slots.len(),
            %order,
            factor = factor,
            "packed batch"
        );
        Ok(PackedBatch { slots, meta })
    }

    /// Pack a batch held as flat row-major data of shape
    /// `(batch_size, *feature_shape)`.
    pub fn pack_flat(
        &self,
        data: &[f64],
        batch_size: usize,
        feature_shape: &[usize],
    ) -> Result<PackedBatch, PackingError> {
        let elements_per_example: usize = feature_shape.iter().product();
        let expected = batch_size * elements_per_example;
        if data.len() != expected {
            return Err(PackingError::LengthMismatch {
                expected,
                actual: data.len(),
                batch_size,
                elements_per_example,
            });
        }
        let mut shape = Vec::with_capacity(feature_shape.len() + 1);
        shape.push(batch_size);
        shape.extend_from_slice(feature_shape);
        let view = ArrayViewD::from_shape(IxDyn(&shape), data).map_err(|_| {
            PackingError::LengthMismatch {
                expected,
                actual: data.len(),
                batch_size,
                elements_per_example,
            }
        })?;
        self.pack(&view)
    }
}

/// Flatten an array under a concrete order.
pub(crate) fn flatten(view: &ArrayViewD<'_, f64>, order: FlattenOrder) -> Vec<f64> {
    match order.resolve(view) {
        FlattenOrder::ColumnMajor => view.t().iter().copied().collect(),
        _ => view.iter().copied().collect(),
    }
}
