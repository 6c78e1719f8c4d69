use std::collections::VecDeque;

use ndarray::{s, Array3};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::model::ModelHandle;
use crate::volume::ScanVolume;
use crate::TARGET_INFERENCE;

/// Probability at or above which a nodule is high risk.
pub const HIGH_RISK_PROBABILITY: f64 = 0.7;
/// Probability at or above which a nodule is moderate risk (and flagged for
/// review / explainability generation).
pub const MODERATE_RISK_PROBABILITY: f64 = 0.4;

pub const NOT_AVAILABLE: &str = "not_available";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskCategory {
    High,
    Moderate,
    Low,
}

impl RiskCategory {
    /// Both band boundaries are inclusive: exactly 0.7 is high, exactly 0.4
    /// is moderate.
    pub fn from_probability(p: f64) -> Self {
        if p >= HIGH_RISK_PROBABILITY {
            RiskCategory::High
        } else if p >= MODERATE_RISK_PROBABILITY {
            RiskCategory::Moderate
        } else {
            RiskCategory::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskCategory::High => "high",
            RiskCategory::Moderate => "moderate",
            RiskCategory::Low => "low",
        }
    }
}

/// Descriptive label decided by the malignancy probability band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoduleKind {
    Suspicious,
    Indeterminate,
    Benign,
}

impl NoduleKind {
    pub fn from_probability(p: f64) -> Self {
        if p >= HIGH_RISK_PROBABILITY {
            NoduleKind::Suspicious
        } else if p >= MODERATE_RISK_PROBABILITY {
            NoduleKind::Indeterminate
        } else {
            NoduleKind::Benign
        }
    }
}

/// Coarse lobe estimate from the centroid quadrant. A geometric placeholder,
/// not an anatomical segmentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lobe {
    #[serde(rename = "RUL")]
    RightUpper,
    #[serde(rename = "LUL")]
    LeftUpper,
    #[serde(rename = "RLL")]
    RightLower,
    #[serde(rename = "LLL")]
    LeftLower,
}

pub fn estimate_lobe(centroid: [f64; 3], shape: [usize; 3]) -> Lobe {
    let is_upper = centroid[0] < shape[0] as f64 * 0.4;
    let is_right = centroid[2] > shape[2] as f64 * 0.5;
    match (is_upper, is_right) {
        (true, true) => Lobe::RightUpper,
        (true, false) => Lobe::LeftUpper,
        (false, true) => Lobe::RightLower,
        (false, false) => Lobe::LeftLower,
    }
}

/// Per-axis [min, max] voxel indices, inclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub z: [usize; 2],
    pub y: [usize; 2],
    pub x: [usize; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Uncertainty {
    pub confidence: f64,
    pub entropy: f64,
    pub needs_review: bool,
}

/// One detected nodule. Geometry is filled at extraction; the `Option`
/// fields are enriched by classification and stay `None` when classifying
/// that nodule failed (the run continues with the nodule degraded).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nodule {
    pub id: usize,
    pub centroid: [f64; 3],
    pub bbox: BoundingBox,
    pub voxel_count: usize,
    pub volume_mm3: f64,
    pub long_axis_mm: f64,
    pub prob_malignant: Option<f64>,
    pub risk: Option<RiskCategory>,
    #[serde(rename = "type")]
    pub kind: Option<NoduleKind>,
    pub location: Option<Lobe>,
    pub uncertainty: Option<Uncertainty>,
    pub gradcam_path: String,
}

impl Nodule {
    pub fn is_high_risk(&self) -> bool {
        self.prob_malignant.map_or(false, |p| p >= HIGH_RISK_PROBABILITY)
    }

    pub fn qualifies_for_explainability(&self) -> bool {
        self.prob_malignant.map_or(false, |p| p >= MODERATE_RISK_PROBABILITY)
    }
}

fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

/// Label connected components of the binary mask and turn each sufficiently
/// large one into a measured nodule.
///
/// Connectivity is 26-connected (full 3D, diagonals included), so two
/// foreground voxels touching only at a corner merge into one component.
/// Components with physical volume strictly below `min_volume_mm3` are
/// dropped; one exactly at the threshold is kept. Survivors are sorted by
/// descending volume and re-numbered from 1, so ids are presentation order.
///
/// An empty mask yields an empty list, which is a valid result.
pub fn extract_nodules(mask: &Array3<u8>, spacing: [f64; 3], min_volume_mm3: f64) -> Vec<Nodule> {
    let (depth, rows, cols) = mask.dim();
    let voxel_volume = spacing[0] * spacing[1] * spacing[2];

    let mut visited = Array3::<bool>::from_elem(mask.dim(), false);
    let mut nodules: Vec<Nodule> = Vec::new();
    let mut raw_components = 0usize;

    for z in 0..depth {
        for y in 0..rows {
            for x in 0..cols {
                if mask[[z, y, x]] == 0 || visited[[z, y, x]] {
                    continue;
                }
                raw_components += 1;

                // Flood fill, gathering stats as voxels are dequeued.
                let mut queue = VecDeque::new();
                visited[[z, y, x]] = true;
                queue.push_back([z, y, x]);

                let mut voxel_count = 0usize;
                let mut coord_sum = [0f64; 3];
                let mut min_idx = [z, y, x];
                let mut max_idx = [z, y, x];

                while let Some([cz, cy, cx]) = queue.pop_front() {
                    voxel_count += 1;
                    coord_sum[0] += cz as f64;
                    coord_sum[1] += cy as f64;
                    coord_sum[2] += cx as f64;
                    min_idx = [min_idx[0].min(cz), min_idx[1].min(cy), min_idx[2].min(cx)];
                    max_idx = [max_idx[0].max(cz), max_idx[1].max(cy), max_idx[2].max(cx)];

                    for dz in -1i64..=1 {
                        for dy in -1i64..=1 {
                            for dx in -1i64..=1 {
                                if dz == 0 && dy == 0 && dx == 0 {
                                    continue;
                                }
                                let nz = cz as i64 + dz;
                                let ny = cy as i64 + dy;
                                let nx = cx as i64 + dx;
                                if nz < 0 || ny < 0 || nx < 0 {
                                    continue;
                                }
                                let (nz, ny, nx) = (nz as usize, ny as usize, nx as usize);
                                if nz >= depth || ny >= rows || nx >= cols {
                                    continue;
                                }
                                if mask[[nz, ny, nx]] != 0 && !visited[[nz, ny, nx]] {
                                    visited[[nz, ny, nx]] = true;
                                    queue.push_back([nz, ny, nx]);
                                }
                            }
                        }
                    }
                }

                let volume_mm3 = voxel_count as f64 * voxel_volume;
                if volume_mm3 < min_volume_mm3 {
                    continue;
                }

                let centroid = [
                    round_to(coord_sum[0] / voxel_count as f64, 1),
                    round_to(coord_sum[1] / voxel_count as f64, 1),
                    round_to(coord_sum[2] / voxel_count as f64, 1),
                ];
                let extents = [
                    (max_idx[0] - min_idx[0]) as f64 * spacing[0],
                    (max_idx[1] - min_idx[1]) as f64 * spacing[1],
                    (max_idx[2] - min_idx[2]) as f64 * spacing[2],
                ];
                let long_axis_mm = round_to(extents[0].max(extents[1]).max(extents[2]), 2);

                nodules.push(Nodule {
                    id: 0,
                    centroid,
                    bbox: BoundingBox {
                        z: [min_idx[0], max_idx[0]],
                        y: [min_idx[1], max_idx[1]],
                        x: [min_idx[2], max_idx[2]],
                    },
                    voxel_count,
                    volume_mm3: round_to(volume_mm3, 2),
                    long_axis_mm,
                    prob_malignant: None,
                    risk: None,
                    kind: None,
                    location: None,
                    uncertainty: None,
                    gradcam_path: NOT_AVAILABLE.to_string(),
                });
            }
        }
    }

    // Largest first; ids are reassigned after sorting so raw label order
    // never leaks into the artifact.
    nodules.sort_by(|a, b| b.volume_mm3.total_cmp(&a.volume_mm3));
    for (i, nodule) in nodules.iter_mut().enumerate() {
        nodule.id = i + 1;
    }

    info!(target: TARGET_INFERENCE, "Extracted {} nodules from {} raw components", nodules.len(), raw_components);
    nodules
}

/// Cut the cubic patch of the normalized volume anchored at
/// `max(0, centroid - patch/2)` per axis, zero-padded back to the full cube
/// where the volume ends first.
pub fn extract_centered_patch(volume: &Array3<f32>, centroid: [f64; 3], patch_size: usize) -> Array3<f32> {
    let (depth, rows, cols) = volume.dim();
    let half = patch_size / 2;

    let start = [
        (centroid[0] as i64 - half as i64).max(0) as usize,
        (centroid[1] as i64 - half as i64).max(0) as usize,
        (centroid[2] as i64 - half as i64).max(0) as usize,
    ];
    let end = [
        (start[0] + patch_size).min(depth),
        (start[1] + patch_size).min(rows),
        (start[2] + patch_size).min(cols),
    ];

    let mut patch = Array3::<f32>::zeros((patch_size, patch_size, patch_size));
    let len = [end[0] - start[0], end[1] - start[1], end[2] - start[2]];
    patch
        .slice_mut(s![..len[0], ..len[1], ..len[2]])
        .assign(&volume.slice(s![start[0]..end[0], start[1]..end[1], start[2]..end[2]]));
    patch
}

/// Run the classification head over every extracted nodule, enriching it
/// with the calibrated probability, band labels, lobe estimate and
/// uncertainty record.
///
/// A failure on one nodule degrades only that nodule (fields stay `None`)
/// and never aborts the rest. Returns one message per degraded nodule.
pub fn classify_nodules(
    model: &ModelHandle,
    volume: &ScanVolume,
    nodules: &mut [Nodule],
    patch_size: usize,
) -> Vec<String> {
    let shape = volume.shape();
    let mut degraded = Vec::new();

    for nodule in nodules.iter_mut() {
        let patch = extract_centered_patch(&volume.data, nodule.centroid, patch_size);

        let probability = match model.malignancy(&patch) {
            Ok(p) => round_to(p as f64, 4),
            Err(e) => {
                warn!(target: TARGET_INFERENCE, "Classification failed for nodule {}: {}", nodule.id, e);
                degraded.push(format!("nodule {} classification failed: {}", nodule.id, e));
                continue;
            }
        };

        nodule.prob_malignant = Some(probability);
        nodule.risk = Some(RiskCategory::from_probability(probability));
        nodule.kind = Some(NoduleKind::from_probability(probability));
        nodule.location = Some(estimate_lobe(nodule.centroid, shape));
        nodule.uncertainty = Some(Uncertainty {
            confidence: round_to(probability.max(1.0 - probability), 4),
            entropy: round_to(binary_entropy(probability), 4),
            needs_review: probability >= MODERATE_RISK_PROBABILITY,
        });
    }

    degraded
}

fn binary_entropy(p: f64) -> f64 {
    const EPS: f64 = 1e-8;
    -p * (p + EPS).ln() - (1.0 - p) * (1.0 - p + EPS).ln()
}
