use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::nodule::{Nodule, RiskCategory};
use crate::volume::ScanVolume;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanMetadata {
    pub shape: [usize; 3],
    pub spacing: [f64; 3],
    pub analyzed_at: String,
}

/// Scan-level descriptors. The texture scores are placeholders carried for
/// report compatibility; `aggregate_risk` is the mean per-patch risk from
/// the sliding window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanScores {
    pub lung_health: String,
    pub aggregate_risk: f64,
    pub emphysema_score: f64,
    pub fibrosis_score: f64,
    pub consolidation_score: f64,
    pub airway_wall_thickness: String,
}

/// The finalized structured output of one pipeline run for one case.
/// Built once after extraction and never mutated afterwards; re-triggering
/// a case produces a new artifact rather than editing this one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindingsArtifact {
    pub case_id: String,
    pub scan_metadata: ScanMetadata,
    pub num_nodules: usize,
    pub nodules: Vec<Nodule>,
    pub scan_scores: ScanScores,
    pub impression: String,
    pub summary_text: String,
    pub processing_time_seconds: f64,
}

fn count_in_band(nodules: &[Nodule], category: RiskCategory) -> usize {
    nodules
        .iter()
        .filter(|n| n.prob_malignant.map_or(false, |p| RiskCategory::from_probability(p) == category))
        .count()
}

/// Deterministic impression / patient summary templates keyed on the risk
/// band counts.
fn impression_texts(nodules: &[Nodule]) -> (String, String) {
    let total = nodules.len();
    let high = count_in_band(nodules, RiskCategory::High);
    let moderate = count_in_band(nodules, RiskCategory::Moderate);

    if high > 0 {
        (
            format!(
                "AI detected {total} nodule(s), {high} classified as high-risk for malignancy. \
                 Clinical correlation and follow-up recommended."
            ),
            format!(
                "The AI scan found {total} spot(s) in your lungs. {high} need(s) attention. \
                 Please consult your doctor for next steps."
            ),
        )
    } else if moderate > 0 {
        (
            format!("AI detected {total} nodule(s), {moderate} with moderate risk. Monitoring recommended."),
            format!(
                "The AI scan found {total} spot(s). Some may need monitoring. \
                 Your doctor will advise on follow-up."
            ),
        )
    } else if total > 0 {
        (
            format!("AI detected {total} nodule(s), all classified as low risk. Routine follow-up suggested."),
            format!(
                "The AI scan found {total} small spot(s) that appear low risk. \
                 Regular check-ups are recommended."
            ),
        )
    } else {
        (
            "No significant nodules detected by AI analysis.".to_string(),
            "The AI scan did not find any concerning spots in your lungs. \
             Continue with regular health check-ups."
                .to_string(),
        )
    }
}

/// Scan-level risk label persisted next to the artifact: the highest band
/// any nodule reaches.
pub fn overall_risk_label(nodules: &[Nodule]) -> RiskCategory {
    if nodules.iter().any(|n| n.prob_malignant.map_or(false, |p| p >= crate::nodule::HIGH_RISK_PROBABILITY)) {
        RiskCategory::High
    } else if nodules
        .iter()
        .any(|n| n.prob_malignant.map_or(false, |p| p >= crate::nodule::MODERATE_RISK_PROBABILITY))
    {
        RiskCategory::Moderate
    } else {
        RiskCategory::Low
    }
}

/// Assemble the artifact from the pipeline stages' outputs. This is the
/// single normalization point: every defaultable field is filled here, and
/// downstream consumers read the artifact as-is.
pub fn build_findings(
    case_id: &str,
    volume: &ScanVolume,
    nodules: Vec<Nodule>,
    aggregate_risk: f32,
    processing_time_seconds: f64,
) -> FindingsArtifact {
    let (impression, summary_text) = impression_texts(&nodules);

    FindingsArtifact {
        case_id: case_id.to_string(),
        scan_metadata: ScanMetadata {
            shape: volume.shape(),
            spacing: volume.spacing,
            analyzed_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        },
        num_nodules: nodules.len(),
        nodules,
        scan_scores: ScanScores {
            lung_health: "model-analyzed".to_string(),
            aggregate_risk: (aggregate_risk as f64 * 1e4).round() / 1e4,
            emphysema_score: 0.0,
            fibrosis_score: 0.0,
            consolidation_score: 0.0,
            airway_wall_thickness: "normal".to_string(),
        },
        impression,
        summary_text,
        processing_time_seconds: (processing_time_seconds * 100.0).round() / 100.0,
    }
}
