//! Runs a few gradient steps of the detection loss directly on a random
//! prediction tensor and prints each loss term.
//!
//! Usage: `cargo run --example train_step [config.json]`
//!
//! Lives in `demos/` and is registered as an example in `Cargo.toml`.

use ndarray::{s, Array3, Array4, Ix4};
use std::env;
use yolo_loss::{Tensor, YoloLoss, YoloLossConfig};

const BATCH: usize = 2;
const STEPS: usize = 20;
const LEARNING_RATE: f32 = 0.05;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let config = match env::args().nth(1) {
        Some(path) => YoloLossConfig::from_json_file(path)?,
        None => YoloLossConfig::default(),
    };
    let loss_fn = YoloLoss::new(config.clone())?;
    let grid = config.grid_size;

    // One object per image, in a different cell each time.
    let mut has_object = Array3::from_elem((BATCH, grid, grid), false);
    let mut target_boxes = Array4::<f32>::zeros((BATCH, grid, grid, 4));
    let mut target_cls = Array4::<f32>::zeros((BATCH, grid, grid, config.num_classes));
    for b in 0..BATCH {
        let (i, j) = (b % grid, (2 * b + 1) % grid);
        has_object[[b, i, j]] = true;
        target_boxes
            .slice_mut(s![b, i, j, ..])
            .assign(&ndarray::arr1(&[0.5, 0.5, 0.3, 0.2]));
        target_cls[[b, i, j, b % config.num_classes]] = 1.0;
    }
    let target_boxes = Tensor::from_data(target_boxes.into_dyn());
    let target_cls = Tensor::from_data(target_cls.into_dyn());

    let mut pred = Tensor::uniform(vec![BATCH, grid, grid, config.cell_channels()], 0.05, 1.0);

    println!("--- {} steps, lr = {} ---", STEPS, LEARNING_RATE);
    for step in 0..STEPS {
        let losses = loss_fn.forward(&pred, &target_boxes, &target_cls, &has_object)?;
        println!("step {:>3}: {}", step, losses.summary());
        losses.total_loss.backward();

        let Some(grad) = pred.grad() else {
            break;
        };
        let mut updated = (&*pred.data() - &(&*grad.data() * LEARNING_RATE)).into_dimensionality::<Ix4>()?;
        // keep widths and heights in the domain of the square root
        for k in 0..config.num_boxes {
            let size = k * 5 + 2;
            updated
                .slice_mut(s![.., .., .., size..size + 2])
                .mapv_inplace(|v| v.max(1e-4));
        }
        pred = Tensor::from_data(updated.into_dyn());
    }

    Ok(())
}
