use ndarray::{s, Array3};
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::model::ModelHandle;
use crate::volume::ScanVolume;
use crate::TARGET_INFERENCE;

/// Result of whole-volume inference.
#[derive(Debug, Clone)]
pub struct SegmentationOutput {
    /// Averaged probability field, cropped to the volume shape.
    pub probability: Array3<f32>,
    /// Binary nodule mask, probability strictly above the threshold.
    pub mask: Array3<u8>,
    /// Mean of the per-patch scalar risk outputs.
    pub mean_risk: f32,
}

/// Start offsets along one axis: `0, stride, ...` up to the last position
/// where a full patch still fits, with the final offset `extent - patch`
/// appended when the stride does not land on it, so no tail voxel is left
/// without a prediction. An axis that equals the patch edge exactly yields
/// the single offset 0.
fn axis_steps(extent: usize, patch_size: usize, stride: usize) -> Vec<usize> {
    let last = extent.saturating_sub(patch_size);
    let mut steps: Vec<usize> = (0..=last).step_by(stride).collect();
    match steps.last() {
        None => steps.push(0),
        Some(&tail) if tail != last => steps.push(last),
        Some(_) => {}
    }
    steps
}

/// Run sliding-window inference over a normalized volume.
///
/// Axes shorter than the patch edge are zero-padded at the far side so that
/// every voxel of the original volume is covered by at least one patch.
/// Overlapping patch predictions are accumulated and averaged; the count is
/// floored at 1 before the division. Patches run sequentially, so for a
/// fixed model and config the output is bit-reproducible.
pub fn sliding_window_inference(
    model: &ModelHandle,
    volume: &ScanVolume,
    config: &PipelineConfig,
) -> Result<SegmentationOutput, PipelineError> {
    let patch_size = config.patch_size;
    let stride = config.stride;
    let [depth, rows, cols] = volume.shape();

    let padded_shape = (
        depth.max(patch_size),
        rows.max(patch_size),
        cols.max(patch_size),
    );
    let padded = if padded_shape != (depth, rows, cols) {
        let mut padded = Array3::<f32>::zeros(padded_shape);
        padded.slice_mut(s![..depth, ..rows, ..cols]).assign(&volume.data);
        padded
    } else {
        volume.data.clone()
    };

    let mut accumulated = Array3::<f32>::zeros(padded_shape);
    let mut counts = Array3::<f32>::zeros(padded_shape);
    let mut risk_scores: Vec<f32> = Vec::new();

    let z_steps = axis_steps(padded_shape.0, patch_size, stride);
    let y_steps = axis_steps(padded_shape.1, patch_size, stride);
    let x_steps = axis_steps(padded_shape.2, patch_size, stride);
    let total = z_steps.len() * y_steps.len() * x_steps.len();
    info!(target: TARGET_INFERENCE, "Sliding window: {} patches over {:?}", total, padded_shape);

    for &z in &z_steps {
        for &y in &y_steps {
            for &x in &x_steps {
                let patch = padded
                    .slice(s![z..z + patch_size, y..y + patch_size, x..x + patch_size])
                    .to_owned();

                let prediction = model.predict(&patch)?;
                if prediction.mask.dim() != (patch_size, patch_size, patch_size) {
                    return Err(PipelineError::Inference(format!(
                        "model returned a {:?} field for a {}-voxel patch",
                        prediction.mask.dim(),
                        patch_size
                    )));
                }

                let mut out = accumulated.slice_mut(s![z..z + patch_size, y..y + patch_size, x..x + patch_size]);
                out += &prediction.mask;
                let mut cnt = counts.slice_mut(s![z..z + patch_size, y..y + patch_size, x..x + patch_size]);
                cnt += 1.0;

                risk_scores.push(prediction.risk);
            }
        }
    }

    // Average the overlap, then drop the padding.
    let averaged = &accumulated / &counts.mapv(|c| c.max(1.0));
    let probability = averaged.slice(s![..depth, ..rows, ..cols]).to_owned();
    let mask = probability.mapv(|p| u8::from(p > config.mask_threshold));

    let mean_risk = if risk_scores.is_empty() {
        0.0
    } else {
        risk_scores.iter().sum::<f32>() / risk_scores.len() as f32
    };
    debug!(target: TARGET_INFERENCE, "Processed {} patches, mean risk {:.4}", total, mean_risk);

    Ok(SegmentationOutput { probability, mask, mean_risk })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PatchPrediction, VolumetricModel};
    use crate::volume::ScanVolume;
    use ndarray::Array3;
    use std::sync::Arc;

    /// Predicts a constant field and risk regardless of input.
    struct ConstantModel {
        value: f32,
        risk: f32,
    }

    impl VolumetricModel for ConstantModel {
        fn predict(&self, patch: &Array3<f32>) -> Result<PatchPrediction, PipelineError> {
            Ok(PatchPrediction {
                mask: Array3::from_elem(patch.dim(), self.value),
                risk: self.risk,
            })
        }

        fn malignancy(&self, _patch: &Array3<f32>) -> Result<f32, PipelineError> {
            Ok(self.risk)
        }

        fn activation_map(&self, patch: &Array3<f32>) -> Result<Array3<f32>, PipelineError> {
            Ok(Array3::zeros(patch.dim()))
        }
    }

    fn small_config() -> PipelineConfig {
        PipelineConfig {
            patch_size: 8,
            stride: 4,
            ..PipelineConfig::default()
        }
    }

    fn volume(shape: (usize, usize, usize)) -> ScanVolume {
        ScanVolume::new(Array3::zeros(shape), [1.0, 1.0, 1.0]).unwrap()
    }

    #[test]
    fn constant_model_averages_to_constant() {
        let model: ModelHandle = Arc::new(ConstantModel { value: 0.25, risk: 0.6 });
        let output = sliding_window_inference(&model, &volume((12, 12, 12)), &small_config()).unwrap();

        assert_eq!(output.probability.dim(), (12, 12, 12));
        assert!(output.probability.iter().all(|&p| (p - 0.25).abs() < 1e-6));
        assert!((output.mean_risk - 0.6).abs() < 1e-6);
    }

    #[test]
    fn every_voxel_is_covered_when_volume_shorter_than_patch() {
        // 5 < patch edge on every axis: padding must still cover the
        // original voxels with exactly one prediction each.
        let model: ModelHandle = Arc::new(ConstantModel { value: 1.0, risk: 0.0 });
        let output = sliding_window_inference(&model, &volume((5, 9, 8)), &small_config()).unwrap();

        assert_eq!(output.probability.dim(), (5, 9, 8));
        assert!(output.probability.iter().all(|&p| p > 0.0));
        assert!(output.mask.iter().all(|&m| m == 1));
    }

    #[test]
    fn exact_fit_axis_uses_single_offset() {
        let model: ModelHandle = Arc::new(ConstantModel { value: 0.9, risk: 0.1 });
        let output = sliding_window_inference(&model, &volume((8, 8, 8)), &small_config()).unwrap();
        assert!(output.probability.iter().all(|&p| (p - 0.9).abs() < 1e-6));
    }

    #[test]
    fn threshold_is_strictly_greater() {
        let at_threshold: ModelHandle = Arc::new(ConstantModel { value: 0.5, risk: 0.0 });
        let output = sliding_window_inference(&at_threshold, &volume((8, 8, 8)), &small_config()).unwrap();
        assert!(output.mask.iter().all(|&m| m == 0));

        let above: ModelHandle = Arc::new(ConstantModel { value: 0.5001, risk: 0.0 });
        let output = sliding_window_inference(&above, &volume((8, 8, 8)), &small_config()).unwrap();
        assert!(output.mask.iter().all(|&m| m == 1));
    }

    #[test]
    fn tail_voxels_receive_predictions() {
        // 13 = 8 + 4 + 1: the stride alone would leave the last voxel of
        // each axis uncovered.
        let model: ModelHandle = Arc::new(ConstantModel { value: 1.0, risk: 0.0 });
        let output = sliding_window_inference(&model, &volume((13, 13, 13)), &small_config()).unwrap();
        assert!(output.probability.iter().all(|&p| (p - 1.0).abs() < 1e-6));
    }

    #[test]
    fn inference_is_deterministic() {
        let model: ModelHandle = Arc::new(ConstantModel { value: 0.4, risk: 0.3 });
        let volume = volume((12, 10, 14));
        let config = small_config();

        let a = sliding_window_inference(&model, &volume, &config).unwrap();
        let b = sliding_window_inference(&model, &volume, &config).unwrap();
        assert_eq!(a.probability, b.probability);
        assert_eq!(a.mask, b.mask);
        assert_eq!(a.mean_risk, b.mean_risk);
    }

    #[test]
    fn axis_steps_cover_trailing_region() {
        assert_eq!(axis_steps(8, 8, 4), vec![0]);
        assert_eq!(axis_steps(12, 8, 4), vec![0, 4]);
        assert_eq!(axis_steps(13, 8, 4), vec![0, 4, 5]);
        assert_eq!(axis_steps(4, 8, 4), vec![0]);
    }
}
