//! Responsible-box assignment.
//!
//! For every object cell, each of the B candidates is scored by its IoU with
//! that same cell's ground-truth box, and the best candidate becomes the one
//! the regression and confidence terms are computed against.

use crate::config::BOX_CHANNELS;
use crate::error::{LossError, Result};
use crate::geometry::{paired_iou, to_corners};
use crate::tensor::Tensor;
use ndarray::{s, Array1, ArrayD, ArrayView2, Axis, Ix2, Zip};
use tracing::trace;

/// Output of [`find_best_iou_boxes`], one row per object cell.
#[derive(Debug)]
pub struct BestBoxes {
    /// IoU of the responsible box with the ground truth, shape `[n, 1]`.
    /// This is a detached leaf: it is a training target, not a prediction.
    pub ious: Tensor,
    /// Responsible `(cx, cy, w, h, confidence)` rows, shape `[n, 5]`, still
    /// connected to the candidate tensors.
    pub boxes: Tensor,
    /// Index of the responsible candidate for each cell.
    pub responsible: Vec<usize>,
}

fn as_matrix<'a>(
    data: &'a ArrayD<f32>,
    cols: usize,
    operation: &str,
) -> Result<ArrayView2<'a, f32>> {
    data.view()
        .into_dimensionality::<Ix2>()
        .ok()
        .filter(|m| m.ncols() == cols)
        .ok_or_else(|| {
            LossError::shape_mismatch(operation, format!("[N, {}]", cols), format!("{:?}", data.shape()))
        })
}

/// Picks, for every row, the candidate with the highest IoU against that row's
/// own target box.
///
/// `candidates` holds B tensors of shape `[n, 5]`; `targets` is `[n, 4]`, both in
/// `(cx, cy, w, h)` form with centers in cell units. Ties go to the lowest
/// candidate index. Neither input is modified.
pub fn find_best_iou_boxes(
    candidates: &[Tensor],
    targets: &Tensor,
    grid_size: usize,
) -> Result<BestBoxes> {
    if candidates.is_empty() {
        return Err(LossError::shape_mismatch(
            "find_best_iou_boxes",
            "at least one candidate",
            "none",
        ));
    }

    let target_data = targets.data();
    let target_view = as_matrix(&target_data, 4, "find_best_iou_boxes")?;
    let target_corners = to_corners(target_view, grid_size)?;
    let rows = target_view.nrows();

    let mut best_iou = Array1::<f32>::zeros(rows);
    let mut chosen = Array1::<usize>::zeros(rows);
    for (k, candidate) in candidates.iter().enumerate() {
        let candidate_data = candidate.data();
        let view = as_matrix(&candidate_data, BOX_CHANNELS, "find_best_iou_boxes")?;
        if view.nrows() != rows {
            return Err(LossError::shape_mismatch(
                "find_best_iou_boxes",
                format!("{} candidate rows", rows),
                format!("{} rows in candidate {}", view.nrows(), k),
            ));
        }
        let corners = to_corners(view.slice(s![.., 0..4]), grid_size)?;
        let iou = paired_iou(corners.view(), target_corners.view())?;

        // strict comparison keeps the earliest candidate on ties
        Zip::from(&mut best_iou)
            .and(&mut chosen)
            .and(&iou)
            .for_each(|best, index, &value| {
                if value > *best || k == 0 {
                    *best = value;
                    *index = k;
                }
            });
    }

    let responsible = chosen.to_vec();
    let boxes = Tensor::choose_rows(candidates, &responsible)?;
    let ious = Tensor::from_data(best_iou.insert_axis(Axis(1)).into_dyn());
    trace!(cells = rows, candidates = candidates.len(), "matched responsible boxes");

    Ok(BestBoxes {
        ious,
        boxes,
        responsible,
    })
}
