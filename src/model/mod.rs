pub mod lungnet;

use std::sync::Arc;

use ndarray::Array3;
use once_cell::sync::OnceCell;
use tracing::info;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::TARGET_INFERENCE;

pub use lungnet::LungNet3d;

/// Output of one forward pass over a cubic patch.
#[derive(Debug, Clone)]
pub struct PatchPrediction {
    /// Per-voxel probability field, same shape as the input patch.
    pub mask: Array3<f32>,
    /// Scalar risk signal for the whole patch.
    pub risk: f32,
}

/// The model contract the pipeline depends on. The engine, classifier and
/// explainability generator all go through this trait so the network can be
/// swapped for synthetic models in tests.
pub trait VolumetricModel: Send + Sync {
    /// Segmentation forward pass: probability sub-field plus patch risk.
    fn predict(&self, patch: &Array3<f32>) -> Result<PatchPrediction, PipelineError>;

    /// Classification head only: calibrated malignancy probability for a
    /// patch centered on a candidate nodule.
    fn malignancy(&self, patch: &Array3<f32>) -> Result<f32, PipelineError>;

    /// Gradient-weighted activation map at feature resolution, negatives
    /// already clamped. Callers resize and normalize.
    fn activation_map(&self, patch: &Array3<f32>) -> Result<Array3<f32>, PipelineError>;
}

/// Shared, immutable model handle. Cloning is cheap; the model itself is
/// never mutated after load.
pub type ModelHandle = Arc<dyn VolumetricModel>;

static MODEL: OnceCell<ModelHandle> = OnceCell::new();

/// Load the model once and return the shared handle. Subsequent calls reuse
/// the already-initialized instance regardless of config.
pub fn init_model(config: &PipelineConfig) -> Result<ModelHandle, PipelineError> {
    let handle = MODEL.get_or_try_init(|| -> Result<ModelHandle, PipelineError> {
        info!(target: TARGET_INFERENCE, "Loading model from {}", config.model_path.display());
        let net = LungNet3d::load(config)?;
        Ok(Arc::new(net))
    })?;
    Ok(handle.clone())
}

/// The initialized model handle, if `init_model` has run.
pub fn model() -> Option<ModelHandle> {
    MODEL.get().cloned()
}
