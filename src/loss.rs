//! The detection training loss.
//!
//! A prediction tensor of shape `[N, S, S, B*5 + C]` is scored against
//! per-cell ground truth. Four sum-of-squared-error terms come out:
//!
//! * classification, over object cells only;
//! * no-object confidence, over every candidate of every empty cell;
//! * regression on `(cx, cy, sqrt(w), sqrt(h))` of the responsible box;
//! * containing-object confidence, pulling the responsible box's confidence
//!   towards its (detached) IoU with the ground truth.
//!
//! The total is `(l_coord * reg + obj + l_noobj * noobj + cls) / N`.

use crate::config::{YoloLossConfig, BOX_CHANNELS};
use crate::error::{LossError, Result};
use crate::matcher::find_best_iou_boxes;
use crate::tensor::{sse, Tensor};
use ndarray::{Array3, Ix2};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// The loss terms of one call. Only `total_loss` is meant for `backward()`;
/// the others share its graph and are reported for logging.
#[derive(Debug)]
pub struct LossDict {
    pub total_loss: Tensor,
    pub reg_loss: Tensor,
    pub containing_obj_loss: Tensor,
    pub no_obj_loss: Tensor,
    pub cls_loss: Tensor,
}

/// Plain values of a [`LossDict`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossSummary {
    pub total_loss: f32,
    pub reg_loss: f32,
    pub containing_obj_loss: f32,
    pub no_obj_loss: f32,
    pub cls_loss: f32,
}

impl LossDict {
    pub fn summary(&self) -> LossSummary {
        LossSummary {
            total_loss: self.total_loss.item(),
            reg_loss: self.reg_loss.item(),
            containing_obj_loss: self.containing_obj_loss.item(),
            no_obj_loss: self.no_obj_loss.item(),
            cls_loss: self.cls_loss.item(),
        }
    }
}

impl fmt::Display for LossSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total {:.4} | reg {:.4} | obj {:.4} | noobj {:.4} | cls {:.4}",
            self.total_loss, self.reg_loss, self.containing_obj_loss, self.no_obj_loss, self.cls_loss
        )
    }
}

/// The prediction tensor cut into its candidate boxes and class scores.
#[derive(Debug)]
pub struct SplitPredictions {
    /// B tensors of shape `[N, S, S, 5]`.
    pub boxes: Vec<Tensor>,
    /// Class scores, `[N, S, S, C]`.
    pub classes: Tensor,
}

#[derive(Debug, Clone)]
pub struct YoloLoss {
    config: YoloLossConfig,
}

/// Flattens `[N, S, S, channels]` into `[N*S*S, channels]`.
fn cell_rows(tensor: &Tensor, channels: usize) -> Result<Tensor> {
    let cells = tensor.shape().iter().product::<usize>() / channels.max(1);
    tensor.reshape(vec![cells, channels])
}

/// Flattened row indices of object cells and of empty cells, in row-major order.
fn partition_cells(has_object_map: &Array3<bool>) -> (Vec<usize>, Vec<usize>) {
    let mut object_cells = Vec::new();
    let mut empty_cells = Vec::new();
    for (row, &has_object) in has_object_map.iter().enumerate() {
        if has_object {
            object_cells.push(row);
        } else {
            empty_cells.push(row);
        }
    }
    (object_cells, empty_cells)
}

fn expect_shape(operation: &str, got: &[usize], expected: &[usize]) -> Result<()> {
    if got != expected {
        return Err(LossError::shape_mismatch(
            operation,
            format!("{:?}", expected),
            format!("{:?}", got),
        ));
    }
    Ok(())
}

/// Fails on any negative or non-finite width/height (columns 2 and 3).
fn check_box_sizes(operation: &str, boxes: &Tensor) -> Result<()> {
    let data = boxes.data();
    let view = data
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| LossError::shape_mismatch(operation, "[n, 4]", format!("{:?}", data.shape())))?;
    for (row, lane) in view.rows().into_iter().enumerate() {
        for value in [lane[2], lane[3]] {
            if !value.is_finite() || value < 0.0 {
                return Err(LossError::NegativeDimension {
                    operation: operation.to_string(),
                    row,
                    value,
                });
            }
        }
    }
    Ok(())
}

impl YoloLoss {
    pub fn new(config: YoloLossConfig) -> Result<Self> {
        config.validate()?;
        info!(
            "Initializing YoloLoss with S={}, B={}, C={}, l_coord={}, l_noobj={}",
            config.grid_size, config.num_boxes, config.num_classes, config.l_coord, config.l_noobj
        );
        Ok(Self { config })
    }

    pub fn config(&self) -> &YoloLossConfig {
        &self.config
    }

    fn grid_shape(&self, batch: usize, channels: usize) -> Vec<usize> {
        let s = self.config.grid_size;
        vec![batch, s, s, channels]
    }

    fn check_mask(&self, operation: &str, batch: usize, has_object_map: &Array3<bool>) -> Result<()> {
        let s = self.config.grid_size;
        expect_shape(operation, has_object_map.shape(), &[batch, s, s])
    }

    /// Splits `[N, S, S, B*5 + C]` predictions into B box tensors and the
    /// class tensor.
    pub fn split_predictions(&self, pred: &Tensor) -> Result<SplitPredictions> {
        let shape = pred.shape();
        let batch = shape.first().copied().unwrap_or(0);
        expect_shape(
            "split_predictions",
            &shape,
            &self.grid_shape(batch, self.config.cell_channels()),
        )?;

        let boxes = (0..self.config.num_boxes)
            .map(|k| pred.narrow(3, k * BOX_CHANNELS, BOX_CHANNELS))
            .collect::<Result<Vec<_>>>()?;
        let classes = pred.narrow(
            3,
            self.config.num_boxes * BOX_CHANNELS,
            self.config.num_classes,
        )?;
        Ok(SplitPredictions { boxes, classes })
    }

    /// Squared error between predicted and target class vectors over the
    /// object cells. Both tensors are `[N, S, S, C]`.
    pub fn class_prediction_loss(
        &self,
        classes_pred: &Tensor,
        classes_target: &Tensor,
        has_object_map: &Array3<bool>,
    ) -> Result<Tensor> {
        let shape = classes_pred.shape();
        let batch = shape.first().copied().unwrap_or(0);
        let expected = self.grid_shape(batch, self.config.num_classes);
        expect_shape("class_prediction_loss", &shape, &expected)?;
        expect_shape("class_prediction_loss", &classes_target.shape(), &expected)?;
        self.check_mask("class_prediction_loss", batch, has_object_map)?;

        let (object_cells, _) = partition_cells(has_object_map);
        let pred = cell_rows(classes_pred, self.config.num_classes)?.index_select(&object_cells)?;
        let target =
            cell_rows(classes_target, self.config.num_classes)?.index_select(&object_cells)?;
        sse(&pred, &target)
    }

    /// Squared confidence of every candidate in every empty cell (the target
    /// confidence there is 0). `pred_boxes` holds B tensors of `[N, S, S, 5]`.
    pub fn no_object_loss(
        &self,
        pred_boxes: &[Tensor],
        has_object_map: &Array3<bool>,
    ) -> Result<Tensor> {
        let (_, empty_cells) = partition_cells(has_object_map);
        let batch = has_object_map.shape()[0];
        let expected = self.grid_shape(batch, BOX_CHANNELS);
        self.check_mask("no_object_loss", batch, has_object_map)?;

        let mut total: Option<Tensor> = None;
        for boxes in pred_boxes {
            expect_shape("no_object_loss", &boxes.shape(), &expected)?;
            let confidence = cell_rows(boxes, BOX_CHANNELS)?
                .index_select(&empty_cells)?
                .narrow(1, 4, 1)?;
            let term = confidence.square().sum();
            total = Some(match total {
                Some(acc) => acc + &term,
                None => term,
            });
        }
        total.ok_or_else(|| {
            LossError::shape_mismatch("no_object_loss", "at least one candidate", "none")
        })
    }

    /// Squared error on `(cx, cy)` plus squared error on `(sqrt(w), sqrt(h))`.
    /// Both inputs are `[n, 4]`; widths and heights must be finite and >= 0.
    pub fn regression_loss(
        &self,
        box_pred_response: &Tensor,
        box_target_response: &Tensor,
    ) -> Result<Tensor> {
        let rows = box_pred_response.shape().first().copied().unwrap_or(0);
        expect_shape("regression_loss", &box_pred_response.shape(), &[rows, 4])?;
        expect_shape("regression_loss", &box_target_response.shape(), &[rows, 4])?;
        check_box_sizes("regression_loss (prediction)", box_pred_response)?;
        check_box_sizes("regression_loss (target)", box_target_response)?;

        let loss_xy = sse(
            &box_pred_response.narrow(1, 0, 2)?,
            &box_target_response.narrow(1, 0, 2)?,
        )?;
        let loss_wh = sse(
            &box_pred_response.narrow(1, 2, 2)?.sqrt(),
            &box_target_response.narrow(1, 2, 2)?.sqrt(),
        )?;
        Ok(loss_xy + &loss_wh)
    }

    /// Squared error between predicted confidence and its target. The target
    /// is detached first, so gradient flows only into `box_pred_conf`.
    pub fn contain_conf_loss(&self, box_pred_conf: &Tensor, box_target_conf: &Tensor) -> Result<Tensor> {
        sse(box_pred_conf, &box_target_conf.detach())
    }

    /// Computes every loss term for one batch.
    ///
    /// * `pred`: `[N, S, S, B*5 + C]`
    /// * `target_boxes`: `[N, S, S, 4]`
    /// * `target_cls`: `[N, S, S, C]`
    /// * `has_object_map`: `[N, S, S]`
    ///
    /// The targets are read, never written, and never receive gradient.
    pub fn forward(
        &self,
        pred: &Tensor,
        target_boxes: &Tensor,
        target_cls: &Tensor,
        has_object_map: &Array3<bool>,
    ) -> Result<LossDict> {
        let batch = pred.shape().first().copied().unwrap_or(0);
        if pred.ndim() != 4 || batch == 0 {
            return Err(LossError::shape_mismatch(
                "forward",
                "[N >= 1, S, S, B*5 + C]",
                format!("{:?}", pred.shape()),
            ));
        }
        expect_shape("forward", &target_boxes.shape(), &self.grid_shape(batch, 4))?;
        expect_shape(
            "forward",
            &target_cls.shape(),
            &self.grid_shape(batch, self.config.num_classes),
        )?;
        self.check_mask("forward", batch, has_object_map)?;

        let split = self.split_predictions(pred)?;
        let target_boxes = target_boxes.detach();
        let target_cls = target_cls.detach();

        let cls_loss = self.class_prediction_loss(&split.classes, &target_cls, has_object_map)?;
        let no_obj_loss = self.no_object_loss(&split.boxes, has_object_map)?;

        // object cells only, flattened to rows that line up across tensors
        let (object_cells, empty_cells) = partition_cells(has_object_map);
        let candidates = split
            .boxes
            .iter()
            .map(|boxes| cell_rows(boxes, BOX_CHANNELS)?.index_select(&object_cells))
            .collect::<Result<Vec<_>>>()?;
        let box_target_response = cell_rows(&target_boxes, 4)?.index_select(&object_cells)?;

        let best = find_best_iou_boxes(&candidates, &box_target_response, self.config.grid_size)?;

        let reg_loss = self.regression_loss(&best.boxes.narrow(1, 0, 4)?, &box_target_response)?;
        let containing_obj_loss = self.contain_conf_loss(&best.boxes.narrow(1, 4, 1)?, &best.ious)?;

        let weighted_reg = &reg_loss * self.config.l_coord;
        let weighted_no_obj = &no_obj_loss * self.config.l_noobj;
        let total_loss =
            (weighted_reg + &containing_obj_loss + &weighted_no_obj + &cls_loss) / batch as f32;

        let loss_dict = LossDict {
            total_loss,
            reg_loss,
            containing_obj_loss,
            no_obj_loss,
            cls_loss,
        };
        debug!(
            batch,
            object_cells = object_cells.len(),
            empty_cells = empty_cells.len(),
            "{}",
            loss_dict.summary()
        );
        Ok(loss_dict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array4, ArrayD};

    fn loss_fn(grid_size: usize) -> YoloLoss {
        YoloLoss::new(YoloLossConfig::new(grid_size, 2, 5.0, 0.5).with_num_classes(3)).unwrap()
    }

    fn tensor(data: Array4<f32>) -> Tensor {
        Tensor::from_data(data.into_dyn())
    }

    fn boxes(values: &[[f32; 4]]) -> Tensor {
        Tensor::new(values.iter().flatten().copied().collect(), vec![values.len(), 4]).unwrap()
    }

    #[test]
    fn invalid_config_is_rejected() {
        assert!(matches!(
            YoloLoss::new(YoloLossConfig::new(0, 2, 5.0, 0.5)),
            Err(LossError::InvalidConfig(_))
        ));
    }

    #[test]
    fn split_predictions_shapes() {
        let loss = loss_fn(2);
        let pred = Tensor::zeros(vec![3, 2, 2, 13]);
        let split = loss.split_predictions(&pred).unwrap();
        assert_eq!(split.boxes.len(), 2);
        assert_eq!(split.boxes[1].shape(), vec![3, 2, 2, 5]);
        assert_eq!(split.classes.shape(), vec![3, 2, 2, 3]);

        assert!(loss.split_predictions(&Tensor::zeros(vec![3, 2, 2, 30])).is_err());
    }

    #[test]
    fn split_predictions_reads_channels_in_order() {
        let loss = loss_fn(1);
        let pred = Tensor::new((0..13).map(|v| v as f32).collect(), vec![1, 1, 1, 13]).unwrap();
        let split = loss.split_predictions(&pred).unwrap();
        assert_eq!(split.boxes[1].data()[[0, 0, 0, 0]], 5.0);
        assert_eq!(split.classes.data()[[0, 0, 0, 0]], 10.0);
    }

    #[test]
    fn class_loss_ignores_empty_cells() {
        let loss = loss_fn(2);
        let mut mask = Array3::from_elem((1, 2, 2), false);
        mask[[0, 1, 0]] = true;

        let target = Array4::<f32>::zeros((1, 2, 2, 3));
        let mut pred = Array4::<f32>::zeros((1, 2, 2, 3));
        pred[[0, 1, 0, 2]] = 0.5;
        let base = loss
            .class_prediction_loss(&tensor(pred.clone()), &tensor(target.clone()), &mask)
            .unwrap();
        assert_abs_diff_eq!(base.item(), 0.25);

        pred[[0, 0, 0, 1]] = 9.0;
        pred[[0, 1, 1, 0]] = -3.0;
        let changed = loss
            .class_prediction_loss(&tensor(pred), &tensor(target), &mask)
            .unwrap();
        assert_eq!(changed.item(), base.item());
    }

    #[test]
    fn no_object_loss_counts_every_candidate_of_empty_cells() {
        let loss = loss_fn(2);
        let mut mask = Array3::from_elem((1, 2, 2), false);
        mask[[0, 0, 0]] = true;

        let mut first = Array4::<f32>::zeros((1, 2, 2, 5));
        let mut second = Array4::<f32>::zeros((1, 2, 2, 5));
        first[[0, 0, 1, 4]] = 0.5;
        second[[0, 1, 1, 4]] = 1.0;
        // object cell confidences must not count
        first[[0, 0, 0, 4]] = 7.0;
        second[[0, 0, 0, 4]] = 7.0;

        let value = loss
            .no_object_loss(&[tensor(first), tensor(second)], &mask)
            .unwrap();
        assert_abs_diff_eq!(value.item(), 1.25);
    }

    #[test]
    fn no_object_loss_checks_box_shape() {
        let loss = loss_fn(2);
        let mask = Array3::from_elem((1, 2, 2), false);
        let wrong = Tensor::zeros(vec![1, 2, 2, 4]);
        assert!(loss.no_object_loss(&[wrong], &mask).is_err());
    }

    #[test]
    fn regression_uses_square_roots_of_size() {
        let loss = loss_fn(7);
        let pred = boxes(&[[0.5, 0.5, 0.25, 0.09]]);
        let target = boxes(&[[0.5, 0.5, 0.16, 0.04]]);
        let value = loss.regression_loss(&pred, &target).unwrap();
        assert_abs_diff_eq!(value.item(), 0.02, epsilon = 1e-6);
    }

    #[test]
    fn regression_rejects_negative_sizes() {
        let loss = loss_fn(7);
        let pred = boxes(&[[0.5, 0.5, 0.2, 0.2], [0.5, 0.5, -0.1, 0.2]]);
        let target = boxes(&[[0.5, 0.5, 0.2, 0.2], [0.5, 0.5, 0.2, 0.2]]);
        match loss.regression_loss(&pred, &target) {
            Err(LossError::NegativeDimension { row, value, .. }) => {
                assert_eq!(row, 1);
                assert_eq!(value, -0.1);
            }
            other => panic!("expected NegativeDimension, got {:?}", other),
        }

        let nan = boxes(&[[0.5, 0.5, 0.2, 0.2], [0.5, 0.5, 0.2, f32::NAN]]);
        assert!(loss.regression_loss(&target, &nan).is_err());
    }

    #[test]
    fn confidence_gradient_only_reaches_prediction() {
        let loss = loss_fn(7);
        let pred = Tensor::new(vec![0.8], vec![1, 1]).unwrap();
        let target = Tensor::new(vec![0.5], vec![1, 1]).unwrap();
        let value = loss.contain_conf_loss(&pred, &target).unwrap();
        assert_abs_diff_eq!(value.item(), 0.09, epsilon = 1e-6);

        value.backward();
        assert_abs_diff_eq!(pred.grad().unwrap().item(), 0.6, epsilon = 1e-6);
        assert!(target.grad().is_none());
    }

    #[test]
    fn forward_rejects_mismatched_inputs() {
        let loss = loss_fn(2);
        let pred = Tensor::zeros(vec![2, 2, 2, 13]);
        let target_boxes = Tensor::zeros(vec![2, 2, 2, 4]);
        let target_cls = Tensor::zeros(vec![2, 2, 2, 3]);
        let mask = Array3::from_elem((2, 2, 2), false);
        assert!(loss.forward(&pred, &target_boxes, &target_cls, &mask).is_ok());

        let short_batch = Tensor::zeros(vec![1, 2, 2, 4]);
        assert!(loss.forward(&pred, &short_batch, &target_cls, &mask).is_err());

        let wrong_grid = Array3::from_elem((2, 3, 3), false);
        assert!(loss.forward(&pred, &target_boxes, &target_cls, &wrong_grid).is_err());

        let wrong_classes = Tensor::zeros(vec![2, 2, 2, 20]);
        assert!(loss.forward(&pred, &target_boxes, &wrong_classes, &mask).is_err());

        let flat = Tensor::from_data(ArrayD::zeros(ndarray::IxDyn(&[8, 13])));
        assert!(loss.forward(&flat, &target_boxes, &target_cls, &mask).is_err());
    }

    #[test]
    fn summary_display() {
        let summary = LossSummary {
            total_loss: 1.0,
            reg_loss: 0.5,
            containing_obj_loss: 0.25,
            no_obj_loss: 0.125,
            cls_loss: 0.0,
        };
        assert_eq!(
            summary.to_string(),
            "total 1.0000 | reg 0.5000 | obj 0.2500 | noobj 0.1250 | cls 0.0000"
        );
    }
}
