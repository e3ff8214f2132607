//! Loss configuration, fixed when a [`YoloLoss`](crate::loss::YoloLoss) is built.

use crate::error::{LossError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Values carried by each candidate box: cx, cy, w, h, confidence.
pub const BOX_CHANNELS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct YoloLossConfig {
    /// Grid resolution S; each image is split into S x S cells.
    pub grid_size: usize,
    /// Candidate boxes B predicted per cell.
    pub num_boxes: usize,
    /// Number of object classes C.
    pub num_classes: usize,
    /// Weight on the regression term.
    pub l_coord: f32,
    /// Weight on the no-object confidence term.
    pub l_noobj: f32,
}

impl Default for YoloLossConfig {
    fn default() -> Self {
        Self {
            grid_size: 7,
            num_boxes: 2,
            num_classes: 20,
            l_coord: 5.0,
            l_noobj: 0.5,
        }
    }
}

impl YoloLossConfig {
    pub fn new(grid_size: usize, num_boxes: usize, l_coord: f32, l_noobj: f32) -> Self {
        Self {
            grid_size,
            num_boxes,
            l_coord,
            l_noobj,
            ..Default::default()
        }
    }

    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }

    /// Channels per cell in the prediction tensor: B x 5 + C.
    pub fn cell_channels(&self) -> usize {
        self.num_boxes * BOX_CHANNELS + self.num_classes
    }

    pub fn validate(&self) -> Result<()> {
        if self.grid_size == 0 {
            return Err(LossError::InvalidConfig("grid_size must be at least 1".into()));
        }
        if self.num_boxes == 0 {
            return Err(LossError::InvalidConfig("num_boxes must be at least 1".into()));
        }
        if self.num_classes == 0 {
            return Err(LossError::InvalidConfig("num_classes must be at least 1".into()));
        }
        for (name, weight) in [("l_coord", self.l_coord), ("l_noobj", self.l_noobj)] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(LossError::InvalidConfig(format!(
                    "{} must be finite and non-negative, got {}",
                    name, weight
                )));
            }
        }
        Ok(())
    }

    /// Parses a JSON document; missing fields fall back to the defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}
