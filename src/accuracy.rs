//! Top-1 / top-5 accuracy over unpacked score matrices.

use std::fmt;

use ndarray::{ArrayBase, ArrayView2, Data, Ix2};
use serde::{Deserialize, Serialize};

use crate::layout::ScoreLayout;

pub const TOP_K: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    #[error("score matrix of shape {rows}x{cols} does not match declared layout {layout} with {labels} labels")]
    LayoutMismatch {
        layout: ScoreLayout,
        rows: usize,
        cols: usize,
        labels: usize,
    },
    #[error("no examples to evaluate")]
    EmptyBatch,
    #[error("label {label} of example {example} is out of range for {classes} classes")]
    LabelOutOfRange {
        example: usize,
        label: usize,
        classes: usize,
    },
    #[error("non-finite score for example {example}, class {class}")]
    NonFiniteScore { example: usize, class: usize },
    #[error("row {row} is not a one-hot vector")]
    InvalidOneHot { row: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyReport {
    pub examples: usize,
    pub top1_correct: usize,
    pub top5_correct: usize,
    pub top1: f64,
    pub top5: f64,
}

impl fmt::Display for AccuracyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "top-1 accuracy: {:.2}% ({}/{}), top-5 accuracy: {:.2}% ({}/{})",
            self.top1 * 100.0,
            self.top1_correct,
            self.examples,
            self.top5 * 100.0,
            self.top5_correct,
            self.examples
        )
    }
}

/// Indices of the `k` highest scores, best first. Ties go to the lower
/// index. Returns every index when there are fewer than `k`.
pub fn top_k(scores: &[f64], k: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..scores.len()).collect();
    indices.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
    indices.truncate(k);
    indices
}

/// Class index of each row of a one-hot matrix `(examples, classes)`.
pub fn labels_from_one_hot<S>(one_hot: &ArrayBase<S, Ix2>) -> Result<Vec<usize>, EvalError>
where
    S: Data<Elem = f64>,
{
    one_hot
        .rows()
        .into_iter()
        .enumerate()
        .map(|(row, values)| {
            let values: Vec<f64> = values.to_vec();
            match top_k(&values, 1).first() {
                Some(&idx) if values[idx] > 0.0 => Ok(idx),
                _ => Err(EvalError::InvalidOneHot { row }),
            }
        })
        .collect()
}

/// Scores predictions against integer labels under a declared layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccuracyEvaluator {
    layout: ScoreLayout,
}

impl AccuracyEvaluator {
    pub fn new(layout: ScoreLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> ScoreLayout {
        self.layout
    }

    pub fn evaluate<S>(
        &self,
        scores: &ArrayBase<S, Ix2>,
        labels: &[usize],
    ) -> Result<AccuracyReport, EvalError>
    where
        S: Data<Elem = f64>,
    {
        if labels.is_empty() {
            return Err(EvalError::EmptyBatch);
        }
        let by_example = self.orient(scores.view(), labels.len())?;
        let classes = by_example.ncols();

        let mut top1_correct = 0;
        let mut top5_correct = 0;
        for (example, (row, &label)) in by_example.rows().into_iter().zip(labels).enumerate() {
            if label >= classes {
                return Err(EvalError::LabelOutOfRange {
                    example,
                    label,
                    classes,
                });
            }
            let row: Vec<f64> = row.to_vec();
            if let Some(class) = row.iter().position(|s| !s.is_finite()) {
                return Err(EvalError::NonFiniteScore { example, class });
            }
            let best = top_k(&row, TOP_K);
            if best.first() == Some(&label) {
                top1_correct += 1;
            }
            if best.contains(&label) {
                top5_correct += 1;
            }
        }

        let examples = labels.len();
        let report = AccuracyReport {
            examples,
            top1_correct,
            top5_correct,
            top1: top1_correct as f64 / examples as f64,
            top5: top5_correct as f64 / examples as f64,
        };
        tracing::info!(
            examples,
            top1 = report.top1,
            top5 = report.top5,
            "accuracy evaluated"
        );
        Ok(report)
    }

    /// View with one row per example, after checking the declared layout.
    fn orient<'a>(
        &self,
        scores: ArrayView2<'a, f64>,
        labels: usize,
    ) -> Result<ArrayView2<'a, f64>, EvalError> {
        let (rows, cols) = scores.dim();
        let mismatch = || EvalError::LayoutMismatch {
            layout: self.layout,
            rows,
            cols,
            labels,
        };
        let view = match self.layout {
            ScoreLayout::BatchByClass if rows == labels => scores,
            ScoreLayout::ClassByBatch if cols == labels => scores.reversed_axes(),
            _ => return Err(mismatch()),
        };
        if view.ncols() == 0 {
            return Err(mismatch());
        }
        Ok(view)
    }
}
