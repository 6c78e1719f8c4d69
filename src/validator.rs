use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::findings::FindingsArtifact;
use crate::nodule::{HIGH_RISK_PROBABILITY, NOT_AVAILABLE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningCategory {
    Schema,
    Required,
    Nodule,
    Xai,
    Sanity,
}

impl WarningCategory {
    pub fn tag(&self) -> &'static str {
        match self {
            WarningCategory::Schema => "Schema",
            WarningCategory::Required => "Required",
            WarningCategory::Nodule => "Nodule",
            WarningCategory::Xai => "XAI",
            WarningCategory::Sanity => "Sanity",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationWarning {
    pub category: WarningCategory,
    pub message: String,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.category.tag(), self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Ok,
    OkWithWarnings,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationSummary {
    pub timestamp: String,
    pub case_id: String,
    pub total_warnings: usize,
    pub schema_warnings: usize,
    pub required_warnings: usize,
    pub nodule_warnings: usize,
    pub xai_warnings: usize,
    pub sanity_warnings: usize,
    pub status: ValidationStatus,
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    /// Only structural problems flip this to false; everything else stays
    /// a warning so report generation is never blocked.
    pub is_valid: bool,
    pub warnings: Vec<ValidationWarning>,
    pub summary: ValidationSummary,
}

fn warning(category: WarningCategory, message: impl Into<String>) -> ValidationWarning {
    ValidationWarning { category, message: message.into() }
}

/// Structural integrity of the artifact itself. The only layer allowed to
/// invalidate the artifact.
fn check_structure(artifact: &FindingsArtifact) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();

    if artifact.case_id.trim().is_empty() {
        warnings.push(warning(WarningCategory::Schema, "case_id is empty"));
    }
    if artifact.scan_metadata.shape.iter().any(|&d| d == 0) {
        warnings.push(warning(
            WarningCategory::Schema,
            format!("scan shape has an empty axis: {:?}", artifact.scan_metadata.shape),
        ));
    }
    if artifact.scan_metadata.spacing.iter().any(|&s| s <= 0.0 || !s.is_finite()) {
        warnings.push(warning(
            WarningCategory::Schema,
            format!("scan spacing not strictly positive: {:?}", artifact.scan_metadata.spacing),
        ));
    }
    if artifact.processing_time_seconds < 0.0 {
        warnings.push(warning(
            WarningCategory::Schema,
            format!("negative processing time: {}", artifact.processing_time_seconds),
        ));
    }
    if DateTime::parse_from_rfc3339(&artifact.scan_metadata.analyzed_at).is_err() {
        warnings.push(warning(
            WarningCategory::Schema,
            format!("analyzed_at is not a valid timestamp: {:?}", artifact.scan_metadata.analyzed_at),
        ));
    }

    warnings
}

/// Business-critical fields the report renderer depends on.
fn check_required_fields(artifact: &FindingsArtifact) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();

    if artifact.case_id.trim().is_empty() {
        warnings.push(warning(WarningCategory::Required, "missing study identifier"));
    }
    if artifact.impression.trim().is_empty() {
        warnings.push(warning(WarningCategory::Required, "missing impression text"));
    }
    if artifact.summary_text.trim().is_empty() {
        warnings.push(warning(WarningCategory::Required, "missing summary text"));
    }

    warnings
}

/// Every nodule must carry the measurements and labels a report needs.
fn check_nodule_fields(artifact: &FindingsArtifact) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();

    for nodule in &artifact.nodules {
        if nodule.long_axis_mm <= 0.0 {
            warnings.push(warning(
                WarningCategory::Nodule,
                format!("nodule {} missing size measurement", nodule.id),
            ));
        }
        if nodule.prob_malignant.is_none() {
            warnings.push(warning(
                WarningCategory::Nodule,
                format!("nodule {} missing malignancy probability", nodule.id),
            ));
        }
        if nodule.kind.is_none() {
            warnings.push(warning(
                WarningCategory::Nodule,
                format!("nodule {} missing type label", nodule.id),
            ));
        }
        if nodule.location.is_none() {
            warnings.push(warning(
                WarningCategory::Nodule,
                format!("nodule {} missing anatomical location", nodule.id),
            ));
        }
    }

    warnings
}

/// Explainability assets referenced by the artifact must exist on disk, and
/// high-risk nodules are expected to carry one at all.
fn check_explainability_assets(artifact: &FindingsArtifact) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();

    for nodule in &artifact.nodules {
        let has_asset = nodule.gradcam_path != NOT_AVAILABLE;

        if has_asset && !Path::new(&nodule.gradcam_path).exists() {
            warnings.push(warning(
                WarningCategory::Xai,
                format!("nodule {} activation map file missing: {}", nodule.id, nodule.gradcam_path),
            ));
        }

        if let Some(p) = nodule.prob_malignant {
            if p >= HIGH_RISK_PROBABILITY && !has_asset {
                warnings.push(warning(
                    WarningCategory::Xai,
                    format!(
                        "high-risk nodule {} (p={:.2}) missing explainability visualization",
                        nodule.id, p
                    ),
                ));
            }
        }
    }

    warnings
}

/// Cross-field consistency and suspicious statistical patterns.
fn check_sanity(artifact: &FindingsArtifact) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();

    if artifact.num_nodules != artifact.nodules.len() {
        warnings.push(warning(
            WarningCategory::Sanity,
            format!(
                "num_nodules mismatch: declared {} vs actual {}",
                artifact.num_nodules,
                artifact.nodules.len()
            ),
        ));
    }

    let mut probabilities = Vec::new();
    for nodule in &artifact.nodules {
        let Some(p) = nodule.prob_malignant else { continue };
        probabilities.push(p);

        if !(0.0..=1.0).contains(&p) {
            warnings.push(warning(
                WarningCategory::Sanity,
                format!("nodule {} probability {} outside [0, 1]", nodule.id, p),
            ));
        }

        if let Some(uncertainty) = &nodule.uncertainty {
            if p > 0.8 && uncertainty.entropy > 0.5 {
                warnings.push(warning(
                    WarningCategory::Sanity,
                    format!(
                        "nodule {} combines high malignancy ({:.2}) with high entropy ({:.2}), flagging for review",
                        nodule.id, p, uncertainty.entropy
                    ),
                ));
            }
        }
    }

    if probabilities.len() > 3 {
        if probabilities.iter().all(|&p| p > 0.9) {
            warnings.push(warning(
                WarningCategory::Sanity,
                "all nodules show >90% malignancy, verify model output",
            ));
        }

        let distinct: HashSet<i64> = probabilities.iter().map(|&p| (p * 1e4).round() as i64).collect();
        if distinct.len() == 1 {
            warnings.push(warning(
                WarningCategory::Sanity,
                "all nodules share an identical probability, possible synthetic input",
            ));
        }
    }

    warnings
}

/// Run every validation layer over a findings artifact.
///
/// The layers are independent and all of them run even when an earlier one
/// reported issues. The artifact is never mutated.
pub fn validate_findings(artifact: &FindingsArtifact) -> ValidationReport {
    let schema = check_structure(artifact);
    let required = check_required_fields(artifact);
    let nodule = check_nodule_fields(artifact);
    let xai = check_explainability_assets(artifact);
    let sanity = check_sanity(artifact);

    let is_valid = schema.is_empty();
    let counts = (schema.len(), required.len(), nodule.len(), xai.len(), sanity.len());

    let mut warnings = schema;
    warnings.extend(required);
    warnings.extend(nodule);
    warnings.extend(xai);
    warnings.extend(sanity);

    let status = if !is_valid {
        ValidationStatus::Failed
    } else if warnings.is_empty() {
        ValidationStatus::Ok
    } else {
        ValidationStatus::OkWithWarnings
    };

    let summary = ValidationSummary {
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        case_id: artifact.case_id.clone(),
        total_warnings: warnings.len(),
        schema_warnings: counts.0,
        required_warnings: counts.1,
        nodule_warnings: counts.2,
        xai_warnings: counts.3,
        sanity_warnings: counts.4,
        status,
    };

    ValidationReport { is_valid, warnings, summary }
}
