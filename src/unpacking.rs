//! Result unpacking: raw slot vector → `(batch, elements)` array.
//!
//! The inverse of [`crate::packing::BatchPacker`]. Factor-2 results are split
//! into their real and imaginary halves, each half is reshaped under the
//! packing order, and the halves are concatenated along the batch axis.
//! Nothing is ever reshaped to fit: a slot count, lane kind or divisibility
//! that disagrees with the declared convention is an error.

use ndarray::{concatenate, Array2, ArrayD, Axis, IxDyn, ShapeBuilder, ShapeError};

use crate::layout::{FlattenOrder, PackingFactor};
use crate::packing::{PackedBatch, PackingMeta};
use crate::protocol::InferenceResult;
use crate::slots::SlotVector;

#[derive(Debug, thiserror::Error)]
pub enum UnpackError {
    #[error("result has {actual} slots, expected {expected} (batch {batch_size} x {elements_per_example} / factor {factor})")]
    LengthMismatch {
        expected: usize,
        actual: usize,
        batch_size: usize,
        elements_per_example: usize,
        factor: usize,
    },
    #[error("result carries {actual} lanes but packing factor {factor} expects {expected} lanes")]
    LaneKindMismatch {
        expected: &'static str,
        actual: &'static str,
        factor: usize,
    },
    #[error("batch size {batch_size} is not divisible by packing factor {factor}")]
    NotDivisible { batch_size: usize, factor: usize },
    #[error("result has no output named '{0}'")]
    MissingOutput(String),
    #[error("batch size and elements per example must be non-zero (got {batch_size} x {elements_per_example})")]
    ZeroSized {
        batch_size: usize,
        elements_per_example: usize,
    },
    #[error("reshape failed: {0}")]
    Shape(#[from] ShapeError),
}

/// Reconstructs per-example rows from a flat result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultUnpacker {
    batch_size: usize,
    elements_per_example: usize,
    order: FlattenOrder,
    factor: PackingFactor,
}

impl ResultUnpacker {
    pub fn new(
        batch_size: usize,
        elements_per_example: usize,
        order: FlattenOrder,
        factor: PackingFactor,
    ) -> Result<Self, UnpackError> {
        if batch_size == 0 || elements_per_example == 0 {
            return Err(UnpackError::ZeroSized {
                batch_size,
                elements_per_example,
            });
        }
        if batch_size % factor.value() != 0 {
            return Err(UnpackError::NotDivisible {
                batch_size,
                factor: factor.value(),
            });
        }
        Ok(Self {
            batch_size,
            elements_per_example,
            order: order.resolve_flat(),
            factor,
        })
    }

    /// Unpacker for an output of a request packed with `meta`; the output
    /// has `elements_per_example` values per example (e.g. class count).
    pub fn from_meta(meta: &PackingMeta, elements_per_example: usize) -> Result<Self, UnpackError> {
        Self::new(meta.batch_size, elements_per_example, meta.order, meta.factor)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn elements_per_example(&self) -> usize {
        self.elements_per_example
    }

    /// Reshape `slots` into `(batch_size, elements_per_example)`.
    pub fn unpack(&self, slots: &SlotVector) -> Result<Array2<f64>, UnpackError> {
        let unpacked = self.unpack_shaped(slots, &[self.elements_per_example])?;
        Ok(unpacked.into_dimensionality()?)
    }

    /// Look up `name` in `result` and unpack it.
    pub fn unpack_output(
        &self,
        result: &InferenceResult,
        name: &str,
    ) -> Result<Array2<f64>, UnpackError> {
        let slots = result
            .outputs
            .get(name)
            .ok_or_else(|| UnpackError::MissingOutput(name.to_string()))?;
        let scores = self.unpack(slots)?;
        tracing::debug!(
            output = name,
            batch_size = self.batch_size,
            elements = self.elements_per_example,
            "unpacked result"
        );
        Ok(scores)
    }

    /// Invert a packed batch back to its full original shape.
    pub fn unpack_packed(packed: &PackedBatch) -> Result<ArrayD<f64>, UnpackError> {
        let meta = &packed.meta;
        let unpacker = Self::from_meta(meta, meta.elements_per_example())?;
        unpacker.unpack_shaped(&packed.slots, &meta.feature_shape)
    }

    fn unpack_shaped(
        &self,
        slots: &SlotVector,
        feature_shape: &[usize],
    ) -> Result<ArrayD<f64>, UnpackError> {
        let factor = self.factor.value();
        let expected = self.batch_size * self.elements_per_example / factor;
        if slots.len() != expected {
            return Err(UnpackError::LengthMismatch {
                expected,
                actual: slots.len(),
                batch_size: self.batch_size,
                elements_per_example: self.elements_per_example,
                factor,
            });
        }

        let lane_mismatch = || UnpackError::LaneKindMismatch {
            expected: if self.factor.is_complex() { "complex" } else { "real" },
            actual: slots.lane_kind(),
            factor,
        };
        match self.factor {
            PackingFactor::One => {
                let values = slots.as_real().ok_or_else(lane_mismatch)?;
                reshape(values.to_vec(), self.batch_size, feature_shape, self.order)
            }
            PackingFactor::Two => {
                let (re, im) = slots.split_complex().ok_or_else(lane_mismatch)?;
                let half = self.batch_size / 2;
                let a = reshape(re, half, feature_shape, self.order)?;
                let b = reshape(im, half, feature_shape, self.order)?;
                Ok(concatenate(Axis(0), &[a.view(), b.view()])?)
            }
        }
    }
}

fn reshape(
    data: Vec<f64>,
    batch_size: usize,
    feature_shape: &[usize],
    order: FlattenOrder,
) -> Result<ArrayD<f64>, UnpackError> {
    let mut shape = Vec::with_capacity(feature_shape.len() + 1);
    shape.push(batch_size);
    shape.extend_from_slice(feature_shape);
    let array = match order {
        FlattenOrder::ColumnMajor => ArrayD::from_shape_vec(IxDyn(&shape).f(), data)?,
        _ => ArrayD::from_shape_vec(IxDyn(&shape), data)?,
    };
    Ok(array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packing::BatchPacker;
    use ndarray::{array, s, Array, Array2, ShapeBuilder};
    use std::collections::BTreeMap;

    const ORDERS: [FlattenOrder; 3] = [
        FlattenOrder::RowMajor,
        FlattenOrder::ColumnMajor,
        FlattenOrder::NativeStorageOrder,
    ];

    fn ramp(shape: &[usize]) -> ArrayD<f64> {
        let n: usize = shape.iter().product();
        Array::from_shape_vec(IxDyn(shape), (0..n).map(|v| v as f64 * 0.5 - 3.0).collect())
            .unwrap()
    }

    #[test]
    fn test_pack_unpack_round_trip() {
        for batch_size in [2, 4, 6] {
            for order in ORDERS {
                for factor in [PackingFactor::One, PackingFactor::Two] {
                    let batch = ramp(&[batch_size, 3, 2]);
                    let packed = BatchPacker::new(order, factor).pack(&batch).unwrap();
                    let back = ResultUnpacker::unpack_packed(&packed).unwrap();
                    assert_eq!(back, batch, "batch {batch_size}, {order}, factor {factor}");
                }
            }
        }
    }

    #[test]
    fn test_round_trip_from_fortran_storage() {
        let mut batch = Array::<f64, _>::zeros((4, 3).f());
        batch.assign(&array![
            [1.0, 2.0, 3.0],
            [4.0, 5.0, 6.0],
            [7.0, 8.0, 9.0],
            [10.0, 11.0, 12.0]
        ]);
        for factor in [PackingFactor::One, PackingFactor::Two] {
            let packed = BatchPacker::new(FlattenOrder::NativeStorageOrder, factor)
                .pack(&batch)
                .unwrap();
            assert_eq!(packed.meta.order, FlattenOrder::ColumnMajor);
            let back = ResultUnpacker::unpack_packed(&packed).unwrap();
            assert_eq!(back, batch.clone().into_dyn());
        }
    }

    #[test]
    fn test_unpack_scores_row_major() {
        let unpacker = ResultUnpacker::new(2, 3, FlattenOrder::RowMajor, PackingFactor::One).unwrap();
        let scores = unpacker
            .unpack(&SlotVector::Real(vec![0.1, 0.2, 0.7, 0.9, 0.05, 0.05]))
            .unwrap();
        assert_eq!(scores, array![[0.1, 0.2, 0.7], [0.9, 0.05, 0.05]]);
    }

    #[test]
    fn test_unpack_scores_column_major() {
        let unpacker =
            ResultUnpacker::new(2, 3, FlattenOrder::ColumnMajor, PackingFactor::One).unwrap();
        let scores = unpacker
            .unpack(&SlotVector::Real(vec![0.1, 0.9, 0.2, 0.05, 0.7, 0.05]))
            .unwrap();
        assert_eq!(scores, array![[0.1, 0.2, 0.7], [0.9, 0.05, 0.05]]);
    }

    #[test]
    fn test_unpack_complex_concatenates_halves() {
        let unpacker = ResultUnpacker::new(2, 2, FlattenOrder::RowMajor, PackingFactor::Two).unwrap();
        let slots = SlotVector::from_halves(vec![1.0, 2.0], vec![3.0, 4.0]).unwrap();
        assert_eq!(unpacker.unpack(&slots).unwrap(), array![[1.0, 2.0], [3.0, 4.0]]);
    }

    #[test]
    fn test_single_example_matches_first_row_of_duplicated_batch() {
        let example: Array2<f64> = ramp(&[1, 10]).into_dimensionality().unwrap();
        let duplicated = ndarray::concatenate(Axis(0), &[example.view(), example.view()]).unwrap();
        for order in ORDERS {
            let one = BatchPacker::new(order, PackingFactor::One).pack(&example).unwrap();
            let two = BatchPacker::new(order, PackingFactor::One).pack(&duplicated).unwrap();
            let u1 = ResultUnpacker::from_meta(&one.meta, 10).unwrap();
            let u2 = ResultUnpacker::from_meta(&two.meta, 10).unwrap();
            let r1: Array2<f64> = u1.unpack(&one.slots).unwrap();
            let r2: Array2<f64> = u2.unpack(&two.slots).unwrap();
            assert_eq!(r1.row(0), r2.row(0), "order {order}");
            assert_eq!(r1.slice(s![0, ..]), example.row(0));
        }
    }

    #[test]
    fn test_length_mismatch_is_reported() {
        let unpacker = ResultUnpacker::new(4, 10, FlattenOrder::RowMajor, PackingFactor::One).unwrap();
        let err = unpacker.unpack(&SlotVector::Real(vec![0.0; 39])).unwrap_err();
        assert!(matches!(
            err,
            UnpackError::LengthMismatch {
                expected: 40,
                actual: 39,
                ..
            }
        ));
    }

    #[test]
    fn test_lane_kind_mismatch_is_reported() {
        let unpacker = ResultUnpacker::new(2, 2, FlattenOrder::RowMajor, PackingFactor::Two).unwrap();
        let err = unpacker.unpack(&SlotVector::Real(vec![0.0; 2])).unwrap_err();
        assert!(matches!(
            err,
            UnpackError::LaneKindMismatch {
                expected: "complex",
                actual: "real",
                factor: 2
            }
        ));
    }

    #[test]
    fn test_invalid_construction() {
        assert!(matches!(
            ResultUnpacker::new(3, 10, FlattenOrder::RowMajor, PackingFactor::Two),
            Err(UnpackError::NotDivisible {
                batch_size: 3,
                factor: 2
            })
        ));
        assert!(matches!(
            ResultUnpacker::new(0, 10, FlattenOrder::RowMajor, PackingFactor::One),
            Err(UnpackError::ZeroSized { .. })
        ));
    }

    #[test]
    fn test_missing_output() {
        let result = InferenceResult {
            request_id: "r1".into(),
            outputs: BTreeMap::new(),
        };
        let unpacker = ResultUnpacker::new(1, 10, FlattenOrder::RowMajor, PackingFactor::One).unwrap();
        let err = unpacker.unpack_output(&result, "logits").unwrap_err();
        assert!(matches!(err, UnpackError::MissingOutput(name) if name == "logits"));
    }
}
