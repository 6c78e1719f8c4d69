use std::fs::File;
use std::path::Path;

use ndarray::{Array2, Array3, Axis};
use ndarray_npy::ReadNpyExt;
use serde::Deserialize;
use tracing::info;

use crate::error::PipelineError;
use crate::TARGET_INFERENCE;

/// How a registered scan is stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFormat {
    /// A single whole-volume `.npy` array.
    Npy,
    /// A directory of per-slice `.npy` files with a `series.json` manifest.
    SliceSeries,
}

impl ScanFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanFormat::Npy => "npy",
            ScanFormat::SliceSeries => "series",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "npy" => Some(ScanFormat::Npy),
            "series" => Some(ScanFormat::SliceSeries),
            _ => None,
        }
    }
}

/// A 3D scan with voxel spacing in mm, ordered [depth, row, column].
#[derive(Debug, Clone)]
pub struct ScanVolume {
    pub data: Array3<f32>,
    pub spacing: [f64; 3],
}

impl ScanVolume {
    pub fn new(data: Array3<f32>, spacing: [f64; 3]) -> Result<Self, PipelineError> {
        if data.shape().iter().any(|&d| d == 0) {
            return Err(PipelineError::Input(format!(
                "volume has an empty axis: {:?}",
                data.shape()
            )));
        }
        if spacing.iter().any(|&s| s <= 0.0 || !s.is_finite()) {
            return Err(PipelineError::Input(format!(
                "voxel spacing must be strictly positive: {:?}",
                spacing
            )));
        }
        Ok(Self { data, spacing })
    }

    pub fn shape(&self) -> [usize; 3] {
        let s = self.data.shape();
        [s[0], s[1], s[2]]
    }

    pub fn voxel_volume_mm3(&self) -> f64 {
        self.spacing[0] * self.spacing[1] * self.spacing[2]
    }
}

/// One entry of a slice-series manifest. Carries the per-slice geometry the
/// scanner would otherwise provide in its series headers.
#[derive(Debug, Deserialize)]
pub struct SliceEntry {
    pub file: String,
    /// Physical position along the depth axis, mm.
    pub position: f64,
    #[serde(default = "default_slope")]
    pub rescale_slope: f64,
    #[serde(default)]
    pub rescale_intercept: f64,
    pub pixel_spacing: [f64; 2],
}

fn default_slope() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
pub struct SeriesManifest {
    pub slices: Vec<SliceEntry>,
    /// Fallback depth spacing when positions cannot be trusted.
    #[serde(default)]
    pub slice_thickness: Option<f64>,
}

/// Load a whole-volume `.npy` array. Accepts f32 payloads directly and
/// converts i16 (raw scanner units) when that is what is on disk.
pub fn load_npy_volume(path: &Path) -> Result<Array3<f32>, PipelineError> {
    let file = File::open(path)
        .map_err(|e| PipelineError::Input(format!("cannot open {}: {}", path.display(), e)))?;

    match Array3::<f32>::read_npy(file) {
        Ok(volume) => Ok(volume),
        Err(_) => {
            let file = File::open(path)
                .map_err(|e| PipelineError::Input(format!("cannot open {}: {}", path.display(), e)))?;
            let raw = Array3::<i16>::read_npy(file).map_err(|e| {
                PipelineError::Input(format!("cannot parse {} as f32 or i16 npy: {}", path.display(), e))
            })?;
            Ok(raw.mapv(|v| v as f32))
        }
    }
}

fn load_npy_slice(path: &Path) -> Result<Array2<f32>, PipelineError> {
    let file = File::open(path)
        .map_err(|e| PipelineError::Input(format!("cannot open {}: {}", path.display(), e)))?;

    match Array2::<f32>::read_npy(file) {
        Ok(slice) => Ok(slice),
        Err(_) => {
            let file = File::open(path)
                .map_err(|e| PipelineError::Input(format!("cannot open {}: {}", path.display(), e)))?;
            let raw = Array2::<i16>::read_npy(file).map_err(|e| {
                PipelineError::Input(format!("cannot parse {} as f32 or i16 npy: {}", path.display(), e))
            })?;
            Ok(raw.mapv(|v| v as f32))
        }
    }
}

/// Load an ordered slice series from a directory containing per-slice 2D
/// `.npy` files and a `series.json` manifest.
///
/// Slices are sorted by physical position along the depth axis before
/// stacking. Rescale slope/intercept are applied uniformly from the first
/// sorted slice. Depth spacing is inferred from the first two positions,
/// falling back to the manifest's `slice_thickness`.
pub fn load_slice_series(dir: &Path) -> Result<ScanVolume, PipelineError> {
    let manifest_path = dir.join("series.json");
    let manifest_file = File::open(&manifest_path).map_err(|e| {
        PipelineError::Input(format!("no series manifest at {}: {}", manifest_path.display(), e))
    })?;
    let manifest: SeriesManifest = serde_json::from_reader(manifest_file)
        .map_err(|e| PipelineError::Input(format!("malformed series manifest: {}", e)))?;

    let mut entries = manifest.slices;
    if entries.is_empty() {
        return Err(PipelineError::Input(format!("no slices listed in {}", manifest_path.display())));
    }
    if entries.len() < 2 {
        return Err(PipelineError::Input(
            "slice series has fewer than 2 slices; depth spacing cannot be inferred".into(),
        ));
    }

    entries.sort_by(|a, b| a.position.total_cmp(&b.position));

    let slice_thickness = {
        let from_positions = (entries[0].position - entries[1].position).abs();
        if from_positions > 0.0 {
            from_positions
        } else {
            manifest.slice_thickness.ok_or_else(|| {
                PipelineError::Input("duplicate slice positions and no slice_thickness fallback".into())
            })?
        }
    };

    // Uniform rescale from the first slice, as the scanner reports it.
    let slope = entries[0].rescale_slope;
    let intercept = entries[0].rescale_intercept;
    let pixel_spacing = entries[0].pixel_spacing;

    let mut slices = Vec::with_capacity(entries.len());
    for entry in &entries {
        let slice = load_npy_slice(&dir.join(&entry.file))?;
        slices.push(slice.mapv(|v| (v as f64 * slope + intercept) as f32));
    }

    let (rows, cols) = slices[0].dim();
    for (i, slice) in slices.iter().enumerate() {
        if slice.dim() != (rows, cols) {
            return Err(PipelineError::Input(format!(
                "slice {} has shape {:?}, expected {:?}",
                i,
                slice.dim(),
                (rows, cols)
            )));
        }
    }

    let views: Vec<_> = slices.iter().map(|s| s.view()).collect();
    let data = ndarray::stack(Axis(0), &views)
        .map_err(|e| PipelineError::Input(format!("cannot stack slices: {}", e)))?;

    info!(target: TARGET_INFERENCE, "Slice series loaded: {} slices, {}x{} in-plane, thickness {:.3}mm",
        entries.len(), rows, cols, slice_thickness);

    ScanVolume::new(data, [slice_thickness, pixel_spacing[0], pixel_spacing[1]])
}

/// Map raw intensities onto [0, 1] by clipping to the diagnostic window and
/// scaling linearly. Values outside the window clamp rather than drop.
pub fn normalize_intensity(volume: &Array3<f32>, window: (f32, f32)) -> Array3<f32> {
    let (lo, hi) = window;
    let range = hi - lo;
    volume.mapv(|v| ((v - lo) / range).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray_npy::WriteNpyExt;
    use std::io::BufWriter;

    #[test]
    fn normalization_clamps_to_unit_range() {
        let volume = ndarray::arr3(&[[[-2000.0_f32, -1000.0], [-300.0, 400.0]], [
            [1200.0, 0.0],
            [-650.0, 100.0],
        ]]);
        let normalized = normalize_intensity(&volume, (-1000.0, 400.0));

        assert_eq!(normalized[[0, 0, 0]], 0.0);
        assert_eq!(normalized[[0, 0, 1]], 0.0);
        assert_eq!(normalized[[0, 1, 1]], 1.0);
        assert_eq!(normalized[[1, 0, 0]], 1.0);
        let mid = normalized[[0, 1, 0]];
        assert!((mid - 0.5).abs() < 1e-6);
        assert!(normalized.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn empty_axis_rejected() {
        let data = Array3::<f32>::zeros((0, 4, 4));
        assert!(ScanVolume::new(data, [1.0, 1.0, 1.0]).is_err());
    }

    #[test]
    fn non_positive_spacing_rejected() {
        let data = Array3::<f32>::zeros((4, 4, 4));
        assert!(ScanVolume::new(data.clone(), [0.0, 1.0, 1.0]).is_err());
        assert!(ScanVolume::new(data, [1.0, -0.5, 1.0]).is_err());
    }

    #[test]
    fn missing_npy_is_input_error() {
        let err = load_npy_volume(Path::new("/nonexistent/scan.npy")).unwrap_err();
        assert!(matches!(err, PipelineError::Input(_)));
    }

    fn write_slice(dir: &Path, name: &str, fill: f32) {
        let slice = Array2::<f32>::from_elem((4, 4), fill);
        let file = File::create(dir.join(name)).unwrap();
        slice.write_npy(BufWriter::new(file)).unwrap();
    }

    #[test]
    fn slice_series_sorts_by_position_and_infers_spacing() {
        let dir = tempfile::tempdir().unwrap();
        write_slice(dir.path(), "a.npy", 10.0);
        write_slice(dir.path(), "b.npy", 20.0);
        write_slice(dir.path(), "c.npy", 30.0);

        // Listed out of order; positions define the stack order.
        let manifest = serde_json::json!({
            "slices": [
                {"file": "c.npy", "position": 5.0, "pixel_spacing": [0.7, 0.7]},
                {"file": "a.npy", "position": 0.0, "pixel_spacing": [0.7, 0.7]},
                {"file": "b.npy", "position": 2.5, "pixel_spacing": [0.7, 0.7]},
            ]
        });
        std::fs::write(dir.path().join("series.json"), manifest.to_string()).unwrap();

        let volume = load_slice_series(dir.path()).unwrap();
        assert_eq!(volume.shape(), [3, 4, 4]);
        assert_eq!(volume.spacing, [2.5, 0.7, 0.7]);
        assert_eq!(volume.data[[0, 0, 0]], 10.0);
        assert_eq!(volume.data[[1, 0, 0]], 20.0);
        assert_eq!(volume.data[[2, 0, 0]], 30.0);
    }

    #[test]
    fn slice_series_applies_first_slice_rescale_uniformly() {
        let dir = tempfile::tempdir().unwrap();
        write_slice(dir.path(), "s0.npy", 100.0);
        write_slice(dir.path(), "s1.npy", 100.0);

        let manifest = serde_json::json!({
            "slices": [
                {"file": "s0.npy", "position": 0.0, "rescale_slope": 2.0,
                 "rescale_intercept": -1000.0, "pixel_spacing": [1.0, 1.0]},
                {"file": "s1.npy", "position": 1.0, "rescale_slope": 7.0,
                 "rescale_intercept": 500.0, "pixel_spacing": [1.0, 1.0]},
            ]
        });
        std::fs::write(dir.path().join("series.json"), manifest.to_string()).unwrap();

        let volume = load_slice_series(dir.path()).unwrap();
        // Second slice's slope/intercept are ignored.
        assert_eq!(volume.data[[0, 0, 0]], -800.0);
        assert_eq!(volume.data[[1, 0, 0]], -800.0);
    }

    #[test]
    fn single_slice_series_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_slice(dir.path(), "only.npy", 1.0);
        let manifest = serde_json::json!({
            "slices": [{"file": "only.npy", "position": 0.0, "pixel_spacing": [1.0, 1.0]}]
        });
        std::fs::write(dir.path().join("series.json"), manifest.to_string()).unwrap();

        let err = load_slice_series(dir.path()).unwrap_err();
        assert!(matches!(err, PipelineError::Input(_)));
    }
}
