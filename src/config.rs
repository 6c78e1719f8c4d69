use std::env;
use std::path::PathBuf;

use crate::error::PipelineError;

/// Configuration for the analysis pipeline, resolved once at startup.
///
/// Patch size and stride control the sliding window: stride must stay below
/// the patch edge so adjacent patch predictions overlap and average out at
/// their boundaries.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Cubic patch edge length fed to the model, in voxels.
    pub patch_size: usize,
    /// Step between consecutive patch start offsets, in voxels.
    pub stride: usize,
    /// Probability cutoff when binarizing the averaged field.
    pub mask_threshold: f32,
    /// Components below this physical volume are discarded outright.
    pub min_nodule_volume_mm3: f64,
    /// Intensity window clipped and scaled to [0, 1] during normalization.
    pub intensity_window: (f32, f32),
    /// Where findings artifacts and explainability assets are written.
    pub output_dir: PathBuf,
    pub model_path: PathBuf,
    pub database_path: String,
    pub notify_webhook_url: Option<String>,
    pub report_service_url: Option<String>,
    /// Bounded timeout for downstream collaborator requests, seconds.
    pub downstream_timeout_secs: u64,
    /// Worker idle poll interval, seconds.
    pub poll_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            patch_size: 64,
            stride: 48,
            mask_threshold: 0.5,
            min_nodule_volume_mm3: 10.0,
            intensity_window: (-1000.0, 400.0),
            output_dir: PathBuf::from("outputs"),
            model_path: PathBuf::from("models/lungnet3d.safetensors"),
            database_path: "pulmoscan.db".to_string(),
            notify_webhook_url: None,
            report_service_url: None,
            downstream_timeout_secs: 30,
            poll_interval_secs: 2,
        }
    }
}

impl PipelineConfig {
    /// Build a config from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self, PipelineError> {
        let defaults = Self::default();

        let config = Self {
            patch_size: env_parse("PATCH_SIZE", defaults.patch_size),
            stride: env_parse("STRIDE", defaults.stride),
            mask_threshold: env_parse("MASK_THRESHOLD", defaults.mask_threshold),
            min_nodule_volume_mm3: env_parse("MIN_NODULE_VOLUME_MM3", defaults.min_nodule_volume_mm3),
            intensity_window: (
                env_parse("HU_WINDOW_MIN", defaults.intensity_window.0),
                env_parse("HU_WINDOW_MAX", defaults.intensity_window.1),
            ),
            output_dir: env::var("OUTPUT_DIR").map(PathBuf::from).unwrap_or(defaults.output_dir),
            model_path: env::var("MODEL_PATH").map(PathBuf::from).unwrap_or(defaults.model_path),
            database_path: env::var("DATABASE_PATH").unwrap_or(defaults.database_path),
            notify_webhook_url: env::var("NOTIFY_WEBHOOK_URL").ok(),
            report_service_url: env::var("REPORT_SERVICE_URL").ok(),
            downstream_timeout_secs: env_parse("DOWNSTREAM_TIMEOUT_SECS", defaults.downstream_timeout_secs),
            poll_interval_secs: env_parse("POLL_INTERVAL_SECS", defaults.poll_interval_secs),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.patch_size == 0 {
            return Err(PipelineError::Input("patch_size must be positive".into()));
        }
        if self.patch_size % 4 != 0 {
            return Err(PipelineError::Input(format!(
                "patch_size {} must be divisible by 4 (two pooling stages)",
                self.patch_size
            )));
        }
        if self.stride == 0 || self.stride >= self.patch_size {
            return Err(PipelineError::Input(format!(
                "stride {} must be positive and below patch_size {}",
                self.stride, self.patch_size
            )));
        }
        if !(0.0..=1.0).contains(&self.mask_threshold) {
            return Err(PipelineError::Input(format!(
                "mask_threshold {} outside [0, 1]",
                self.mask_threshold
            )));
        }
        if self.min_nodule_volume_mm3 < 0.0 {
            return Err(PipelineError::Input("min_nodule_volume_mm3 must be non-negative".into()));
        }
        if self.intensity_window.0 >= self.intensity_window.1 {
            return Err(PipelineError::Input(format!(
                "intensity window [{}, {}] is empty",
                self.intensity_window.0, self.intensity_window.1
            )));
        }
        Ok(())
    }

    pub fn xai_dir(&self, case_id: &str) -> PathBuf {
        self.output_dir.join(case_id).join("xai")
    }

    pub fn case_dir(&self, case_id: &str) -> PathBuf {
        self.output_dir.join(case_id)
    }
}

fn env_parse<T: std::str::FromStr + Copy>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn stride_must_overlap() {
        let mut config = PipelineConfig::default();
        config.stride = config.patch_size;
        assert!(config.validate().is_err());
    }

    #[test]
    fn patch_size_must_pool_evenly() {
        let mut config = PipelineConfig::default();
        config.patch_size = 30;
        config.stride = 16;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_intensity_window_rejected() {
        let mut config = PipelineConfig::default();
        config.intensity_window = (400.0, 400.0);
        assert!(config.validate().is_err());
    }
}
