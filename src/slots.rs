//! Flat slot vectors: the values occupying the parallel lanes of one
//! plaintext or ciphertext.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// A flat sequence of slot values.
///
/// `Real` carries one batch element per slot. `Complex` carries two, one in
/// each component (see [`crate::layout::PackingFactor::Two`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "lanes", content = "values", rename_all = "snake_case")]
pub enum SlotVector {
    Real(Vec<f64>),
    Complex(Vec<Complex64>),
}

impl SlotVector {
    /// Interleave two equally long real halves into complex slots:
    /// slot `i` is `real[i] + i·imag[i]`.
    ///
    /// Returns `None` when the halves differ in length.
    pub fn from_halves(real: Vec<f64>, imag: Vec<f64>) -> Option<Self> {
        if real.len() != imag.len() {
            return None;
        }
        Some(SlotVector::Complex(
            real.into_iter()
                .zip(imag)
                .map(|(re, im)| Complex64::new(re, im))
                .collect(),
        ))
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        match self {
            SlotVector::Real(v) => v.len(),
            SlotVector::Complex(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of scalar values carried (twice the slot count for complex).
    pub fn value_count(&self) -> usize {
        match self {
            SlotVector::Real(v) => v.len(),
            SlotVector::Complex(v) => 2 * v.len(),
        }
    }

    /// Lane kind name, used in error messages.
    pub fn lane_kind(&self) -> &'static str {
        match self {
            SlotVector::Real(_) => "real",
            SlotVector::Complex(_) => "complex",
        }
    }

    pub fn as_real(&self) -> Option<&[f64]> {
        match self {
            SlotVector::Real(v) => Some(v),
            SlotVector::Complex(_) => None,
        }
    }

    pub fn as_complex(&self) -> Option<&[Complex64]> {
        match self {
            SlotVector::Complex(v) => Some(v),
            SlotVector::Real(_) => None,
        }
    }

    /// Split complex slots back into their real and imaginary halves.
    pub fn split_complex(&self) -> Option<(Vec<f64>, Vec<f64>)> {
        let slots = self.as_complex()?;
        Some(slots.iter().map(|c| (c.re, c.im)).unzip())
    }

    /// Index of the first slot holding NaN or an infinity.
    pub fn first_non_finite(&self) -> Option<usize> {
        match self {
            SlotVector::Real(v) => v.iter().position(|x| !x.is_finite()),
            SlotVector::Complex(v) => v.iter().position(|c| !c.is_finite()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_halves_interleaves_components() {
        let slots = SlotVector::from_halves(vec![1.0, 2.0], vec![3.0, 4.0]).unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots.value_count(), 4);
        assert_eq!(
            slots.as_complex().unwrap(),
            &[Complex64::new(1.0, 3.0), Complex64::new(2.0, 4.0)]
        );
        let (re, im) = slots.split_complex().unwrap();
        assert_eq!(re, vec![1.0, 2.0]);
        assert_eq!(im, vec![3.0, 4.0]);
    }

    #[test]
    fn test_from_halves_rejects_uneven_halves() {
        assert!(SlotVector::from_halves(vec![1.0], vec![]).is_none());
    }

    #[test]
    fn test_json_shape() {
        let real = SlotVector::Real(vec![0.5, -1.0]);
        let json = serde_json::to_value(&real).unwrap();
        assert_eq!(json["lanes"], "real");
        assert_eq!(json["values"][1], -1.0);

        let complex = SlotVector::from_halves(vec![1.0], vec![2.0]).unwrap();
        let json = serde_json::to_string(&complex).unwrap();
        let back: SlotVector = serde_json::from_str(&json).unwrap();
        assert_eq!(back, complex);
    }

    #[test]
    fn test_finiteness() {
        assert_eq!(SlotVector::Real(vec![1.0]).first_non_finite(), None);
        assert_eq!(SlotVector::Real(vec![f64::NAN]).first_non_finite(), Some(0));
        assert_eq!(
            SlotVector::from_halves(vec![1.0], vec![f64::INFINITY])
                .unwrap()
                .first_non_finite(),
            Some(0)
        );
        assert_eq!(
            SlotVector::Real(vec![1.0, 2.0, f64::NEG_INFINITY, f64::NAN]).first_non_finite(),
            Some(2)
        );
        let complex = SlotVector::from_halves(vec![1.0, 2.0], vec![3.0, f64::NAN]).unwrap();
        assert_eq!(complex.first_non_finite(), Some(1));
    }
}
