//! Box coordinate conversion and intersection-over-union.
//!
//! Boxes arrive as `(cx, cy, w, h)` rows where the center is expressed in cell
//! units (divide by the grid size S to get image-normalized coordinates) and the
//! size is already image-normalized. IoU is computed on `(x1, y1, x2, y2)`
//! corners. Everything here works on plain ndarray values: overlaps feed the
//! loss only as targets, so none of it needs to be differentiable.

use crate::error::{LossError, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Zip};

fn expect_four_columns(operation: &str, boxes: &ArrayView2<f32>) -> Result<()> {
    if boxes.ncols() != 4 {
        return Err(LossError::shape_mismatch(
            operation,
            "[N, 4]",
            format!("{:?}", boxes.shape()),
        ));
    }
    Ok(())
}

fn expect_grid(operation: &str, grid_size: usize) -> Result<f32> {
    if grid_size == 0 {
        return Err(LossError::InvalidConfig(format!(
            "{}: grid size must be at least 1",
            operation
        )));
    }
    Ok(grid_size as f32)
}

/// Converts `(cx, cy, w, h)` rows to `(x1, y1, x2, y2)` rows.
///
/// All four outputs are computed from the original row, into a fresh array;
/// the input is never modified.
pub fn to_corners(boxes: ArrayView2<f32>, grid_size: usize) -> Result<Array2<f32>> {
    expect_four_columns("to_corners", &boxes)?;
    let s = expect_grid("to_corners", grid_size)?;
    let mut corners = Array2::zeros((boxes.nrows(), 4));
    Zip::from(corners.rows_mut())
        .and(boxes.rows())
        .for_each(|mut out, b| {
            let (cx, cy) = (b[0] / s, b[1] / s);
            let (half_w, half_h) = (0.5 * b[2], 0.5 * b[3]);
            out[0] = cx - half_w;
            out[1] = cy - half_h;
            out[2] = cx + half_w;
            out[3] = cy + half_h;
        });
    Ok(corners)
}

/// Inverse of [`to_corners`].
pub fn to_centers(corners: ArrayView2<f32>, grid_size: usize) -> Result<Array2<f32>> {
    expect_four_columns("to_centers", &corners)?;
    let s = expect_grid("to_centers", grid_size)?;
    let mut boxes = Array2::zeros((corners.nrows(), 4));
    Zip::from(boxes.rows_mut())
        .and(corners.rows())
        .for_each(|mut out, c| {
            out[0] = 0.5 * (c[0] + c[2]) * s;
            out[1] = 0.5 * (c[1] + c[3]) * s;
            out[2] = c[2] - c[0];
            out[3] = c[3] - c[1];
        });
    Ok(boxes)
}

fn area(c: &ArrayView1<f32>) -> f32 {
    (c[2] - c[0]) * (c[3] - c[1])
}

/// IoU of two corner boxes. An empty union (both boxes degenerate) gives 0.
fn box_iou(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    let w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = w * h;
    let union = area(&a) + area(&b) - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

/// Pairwise IoU: entry `(i, j)` is the overlap of `a[i]` with `b[j]`.
/// Both inputs are `[N, 4]` / `[M, 4]` corner boxes; N and M may differ.
pub fn compute_iou(a: ArrayView2<f32>, b: ArrayView2<f32>) -> Result<Array2<f32>> {
    expect_four_columns("compute_iou", &a)?;
    expect_four_columns("compute_iou", &b)?;
    Ok(Array2::from_shape_fn((a.nrows(), b.nrows()), |(i, j)| {
        box_iou(a.row(i), b.row(j))
    }))
}

/// Row-wise IoU: entry `i` is the overlap of `a[i]` with `b[i]`.
pub fn paired_iou(a: ArrayView2<f32>, b: ArrayView2<f32>) -> Result<Array1<f32>> {
    expect_four_columns("paired_iou", &a)?;
    expect_four_columns("paired_iou", &b)?;
    if a.nrows() != b.nrows() {
        return Err(LossError::shape_mismatch(
            "paired_iou",
            format!("{} rows", a.nrows()),
            format!("{} rows", b.nrows()),
        ));
    }
    Ok(Zip::from(a.rows())
        .and(b.rows())
        .map_collect(|x, y| box_iou(x, y)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::Rng;

    fn assert_all_close<'a>(
        got: impl IntoIterator<Item = &'a f32>,
        want: impl IntoIterator<Item = &'a f32>,
    ) {
        for (g, w) in got.into_iter().zip(want) {
            assert_abs_diff_eq!(*g, *w, epsilon = 1e-5);
        }
    }

    fn random_corner_boxes(n: usize) -> Array2<f32> {
        let mut rng = rand::thread_rng();
        let mut boxes = Array2::zeros((n, 4));
        for mut row in boxes.rows_mut() {
            let (xa, xb): (f32, f32) = (rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0));
            let (ya, yb): (f32, f32) = (rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0));
            row[0] = xa.min(xb);
            row[1] = ya.min(yb);
            row[2] = xa.max(xb);
            row[3] = ya.max(yb);
        }
        boxes
    }

    #[test]
    fn corners_use_original_center() {
        let boxes = array![[3.5, 3.5, 0.2, 0.4]];
        let original = boxes.clone();
        let corners = to_corners(boxes.view(), 7).unwrap();
        assert_all_close(&corners, &array![[0.4, 0.3, 0.6, 0.7]]);
        assert!(corners[[0, 0]] <= corners[[0, 2]]);
        assert!(corners[[0, 1]] <= corners[[0, 3]]);
        // the caller's buffer is untouched
        assert_eq!(boxes, original);
    }

    #[test]
    fn corner_round_trip() {
        let boxes = array![[0.5, 0.5, 0.2, 0.2], [2.25, 6.0, 0.9, 0.05], [0.0, 1.0, 0.0, 0.3]];
        let back = to_centers(to_corners(boxes.view(), 7).unwrap().view(), 7).unwrap();
        assert_eq!(back.dim(), boxes.dim());
        assert_all_close(&back, &boxes);
    }

    #[test]
    fn zero_grid_is_rejected() {
        let boxes = array![[0.5, 0.5, 0.2, 0.2]];
        assert!(matches!(to_corners(boxes.view(), 0), Err(LossError::InvalidConfig(_))));
        assert!(matches!(to_centers(boxes.view(), 0), Err(LossError::InvalidConfig(_))));
    }

    #[test]
    fn wrong_column_count_is_rejected() {
        let boxes = Array2::<f32>::zeros((2, 5));
        assert!(matches!(
            to_corners(boxes.view(), 7),
            Err(LossError::ShapeMismatch { .. })
        ));
        assert!(compute_iou(boxes.view(), boxes.view()).is_err());
    }

    #[test]
    fn identical_boxes_fully_overlap() {
        let a = array![[0.1, 0.2, 0.5, 0.9], [0.0, 0.0, 1.0, 1.0]];
        let iou = paired_iou(a.view(), a.view()).unwrap();
        assert_all_close(&iou, &array![1.0, 1.0]);
    }

    #[test]
    fn disjoint_and_touching_boxes_do_not_overlap() {
        let a = array![[0.0, 0.0, 0.2, 0.2]];
        let b = array![[0.5, 0.5, 0.9, 0.9], [0.2, 0.0, 0.4, 0.2]];
        let iou = compute_iou(a.view(), b.view()).unwrap();
        assert_eq!(iou.dim(), (1, 2));
        assert!(iou.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn known_partial_overlap() {
        let a = array![[0.0, 0.0, 2.0, 2.0]];
        let b = array![[1.0, 1.0, 3.0, 3.0]];
        let iou = compute_iou(a.view(), b.view()).unwrap();
        assert_abs_diff_eq!(iou[[0, 0]], 1.0 / 7.0, epsilon = 1e-6);
    }

    #[test]
    fn degenerate_boxes_give_zero() {
        let point = array![[0.3, 0.3, 0.3, 0.3]];
        let iou = compute_iou(point.view(), point.view()).unwrap();
        assert_eq!(iou[[0, 0]], 0.0);
    }

    #[test]
    fn matrix_is_n_by_m_and_symmetric() {
        let a = random_corner_boxes(3);
        let b = random_corner_boxes(5);

        let ab = compute_iou(a.view(), b.view()).unwrap();
        let ba = compute_iou(b.view(), a.view()).unwrap();
        assert_eq!(ab.dim(), (3, 5));
        for ((i, j), &v) in ab.indexed_iter() {
            assert_abs_diff_eq!(v, ba[[j, i]], epsilon = 1e-6);
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn paired_iou_requires_equal_rows() {
        let a = Array2::<f32>::zeros((2, 4));
        let b = Array2::<f32>::zeros((3, 4));
        assert!(paired_iou(a.view(), b.view()).is_err());
    }
}
