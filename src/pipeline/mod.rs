pub mod worker;

#[cfg(test)]
mod tests;

use std::fs;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::db::{Database, RunRecord};
use crate::error::{PipelineError, Stage};
use crate::findings::{build_findings, overall_risk_label, FindingsArtifact};
use crate::inference::sliding_window_inference;
use crate::model::ModelHandle;
use crate::nodule::{classify_nodules, extract_nodules};
use crate::validator::validate_findings;
use crate::volume::{load_npy_volume, load_slice_series, normalize_intensity, ScanFormat, ScanVolume};
use crate::xai::generate_activation_assets;
use crate::{TARGET_PIPELINE, TARGET_XAI};

/// Lifecycle of one pipeline run. Transitions are monotonic
/// (pending -> processing -> completed | failed); only an explicit
/// re-trigger restarts a terminal case from pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Processing => "processing",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "processing" => Some(RunStatus::Processing),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// The processing orchestrator. Owns run-state transitions and the staged
/// execution of a case; the model handle is injected once and shared
/// read-only across runs.
pub struct Pipeline {
    db: Database,
    model: ModelHandle,
    config: PipelineConfig,
    /// In-process set of cases currently executing, so concurrent triggers
    /// for one case short-circuit without a database round trip. The
    /// run_queue unique constraint is the cross-process backstop.
    active: DashMap<String, ()>,
}

impl Pipeline {
    pub fn new(db: Database, model: ModelHandle, config: PipelineConfig) -> Arc<Self> {
        Arc::new(Self { db, model, config, active: DashMap::new() })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Start processing a case. The `pending -> processing` transition
    /// happens here, synchronously, before the run descriptor is enqueued,
    /// so status polling is accurate the moment this returns.
    ///
    /// A case already `processing` is left alone and its current status
    /// returned. Terminal cases (`completed`/`failed`) are also a no-op;
    /// restarting those requires the explicit [`Pipeline::retrigger`].
    pub async fn trigger(&self, case_id: &str) -> Result<RunStatus, PipelineError> {
        if self.active.contains_key(case_id) {
            info!(target: TARGET_PIPELINE, "Case {} already executing, trigger is a no-op", case_id);
            return Ok(RunStatus::Processing);
        }

        match self.db.run_status(case_id).await? {
            Some(record) if record.status == RunStatus::Processing => {
                info!(target: TARGET_PIPELINE, "Case {} already processing, trigger is a no-op", case_id);
                Ok(RunStatus::Processing)
            }
            Some(record) if record.status != RunStatus::Pending => {
                info!(target: TARGET_PIPELINE, "Case {} is {}, re-trigger must be explicit",
                    case_id, record.status.as_str());
                Ok(record.status)
            }
            _ => self.start_run(case_id).await,
        }
    }

    /// Explicitly restart a terminal case from pending. A case mid-flight
    /// is still left alone.
    pub async fn retrigger(&self, case_id: &str) -> Result<RunStatus, PipelineError> {
        if self.active.contains_key(case_id) {
            return Ok(RunStatus::Processing);
        }
        if let Some(record) = self.db.run_status(case_id).await? {
            if record.status == RunStatus::Processing {
                return Ok(RunStatus::Processing);
            }
        }

        info!(target: TARGET_PIPELINE, "Re-triggering case {} from pending", case_id);
        self.db.upsert_run_status(case_id, RunStatus::Pending).await?;
        self.start_run(case_id).await
    }

    async fn start_run(&self, case_id: &str) -> Result<RunStatus, PipelineError> {
        self.db.upsert_run_status(case_id, RunStatus::Processing).await?;
        self.active.insert(case_id.to_string(), ());
        self.db.enqueue_run(case_id).await?;
        info!(target: TARGET_PIPELINE, "Case {} queued for processing", case_id);
        Ok(RunStatus::Processing)
    }

    pub async fn get_status(&self, case_id: &str) -> Result<Option<RunRecord>, PipelineError> {
        Ok(self.db.run_status(case_id).await?)
    }

    /// Execute the staged pipeline for a dequeued case and record the
    /// terminal state. Never returns an error: every failure path ends in
    /// a `failed` run row plus a best-effort notification.
    pub async fn execute_case(&self, case_id: &str) {
        // The guard may be missing when a queued descriptor survived a
        // restart; executing is still correct.
        self.active.entry(case_id.to_string()).or_insert(());
        let started = Instant::now();
        info!(target: TARGET_PIPELINE, ">>> Starting analysis for case {}", case_id);

        match self.run_stages(case_id, started).await {
            Ok(warnings) => {
                if let Err(e) = self.db.mark_completed(case_id, &warnings).await {
                    error!(target: TARGET_PIPELINE, "Failed to record completion for {}: {}", case_id, e);
                }
                info!(target: TARGET_PIPELINE, "<<< Case {} completed with {} warning(s)", case_id, warnings.len());
            }
            Err((stage, e)) => {
                error!(target: TARGET_PIPELINE, "<<< Case {} failed at {}: {}", case_id, stage, e);
                if let Err(db_err) = self.db.mark_failed(case_id, stage.as_str(), &e.to_string()).await {
                    error!(target: TARGET_PIPELINE, "Failed to record failure for {}: {}", case_id, db_err);
                }
                self.notify_best_effort(
                    case_id,
                    &format!("Processing for scan ({case_id}) could not be completed."),
                )
                .await;
            }
        }

        self.active.remove(case_id);
    }

    async fn run_stages(
        &self,
        case_id: &str,
        started: Instant,
    ) -> Result<Vec<String>, (Stage, PipelineError)> {
        let mut warnings: Vec<String> = Vec::new();

        // 1. Locate scan data.
        let (scan_path, format) = self
            .db
            .scan_location(case_id)
            .await
            .map_err(|e| (Stage::LocateScan, e.into()))?
            .ok_or_else(|| {
                (
                    Stage::LocateScan,
                    PipelineError::Input(format!("no scan registered for case {case_id}")),
                )
            })?;

        // 2. Load and normalize the volume.
        let volume = self.load_volume(&scan_path, format).map_err(|e| (Stage::LoadVolume, e))?;
        let normalized = ScanVolume {
            data: normalize_intensity(&volume.data, self.config.intensity_window),
            spacing: volume.spacing,
        };
        info!(target: TARGET_PIPELINE, "Volume loaded: {:?}, spacing {:?}", normalized.shape(), normalized.spacing);

        // 3. Sliding-window inference.
        let segmentation = sliding_window_inference(&self.model, &normalized, &self.config)
            .map_err(|e| (Stage::Inference, e))?;

        // 4. Extract and classify nodules.
        let mut nodules = extract_nodules(
            &segmentation.mask,
            normalized.spacing,
            self.config.min_nodule_volume_mm3,
        );
        let degraded = classify_nodules(&self.model, &normalized, &mut nodules, self.config.patch_size);
        warnings.extend(degraded);

        // 5. Explainability for risk-flagged nodules, best effort.
        let xai_dir = self.config.xai_dir(case_id);
        for nodule in nodules.iter_mut().filter(|n| n.qualifies_for_explainability()) {
            match generate_activation_assets(&self.model, &normalized, nodule, &xai_dir, self.config.patch_size) {
                Ok(path) => nodule.gradcam_path = path.display().to_string(),
                Err(e) => {
                    warn!(target: TARGET_XAI, "Explainability unavailable for nodule {} of {}: {}",
                        nodule.id, case_id, e);
                    warnings.push(format!("nodule {} explainability unavailable: {}", nodule.id, e));
                }
            }
        }

        // 6. Build and validate the findings artifact.
        let artifact = build_findings(
            case_id,
            &volume,
            nodules,
            segmentation.mean_risk,
            started.elapsed().as_secs_f64(),
        );
        let report = validate_findings(&artifact);
        info!(target: TARGET_PIPELINE, "Validation: valid={}, {} warning(s)", report.is_valid, report.warnings.len());
        for validation_warning in &report.warnings {
            warn!(target: TARGET_PIPELINE, "Validation: {}", validation_warning);
            warnings.push(format!("validation: {}", validation_warning));
        }

        // 7. Persist the artifact; the run is only a success once this holds.
        self.persist_findings(case_id, &artifact, &segmentation.mask)
            .await
            .map_err(|e| (Stage::Persist, e))?;

        // 8 + 9. Downstream collaborators; their failures never undo a
        // persisted result.
        if let Some(url) = &self.config.report_service_url {
            if let Err(e) = crate::report::request_report(url, &artifact, self.config.downstream_timeout_secs).await
            {
                warn!(target: TARGET_PIPELINE, "Report generation failed for {}: {}", case_id, e);
                warnings.push(format!("report generation failed: {e}"));
            }
        }
        match self
            .notify_outcome(case_id, &format!("Your scan ({case_id}) has been analyzed. Reports are ready."))
            .await
        {
            Ok(()) => {}
            Err(e) => {
                warn!(target: TARGET_PIPELINE, "Notification failed for {}: {}", case_id, e);
                warnings.push(format!("notification failed: {e}"));
            }
        }

        Ok(warnings)
    }

    fn load_volume(&self, scan_path: &str, format: ScanFormat) -> Result<ScanVolume, PipelineError> {
        match format {
            ScanFormat::Npy => {
                // Whole-array input carries no geometry; unit spacing is the
                // documented default for preprocessed volumes.
                let data = load_npy_volume(std::path::Path::new(scan_path))?;
                ScanVolume::new(data, [1.0, 1.0, 1.0])
            }
            ScanFormat::SliceSeries => load_slice_series(std::path::Path::new(scan_path)),
        }
    }

    async fn persist_findings(
        &self,
        case_id: &str,
        artifact: &FindingsArtifact,
        mask: &ndarray::Array3<u8>,
    ) -> Result<(), PipelineError> {
        use ndarray_npy::WriteNpyExt;
        use std::io::BufWriter;

        let case_dir = self.config.case_dir(case_id);
        fs::create_dir_all(&case_dir)?;

        let mask_path = case_dir.join(format!("{case_id}_mask.npy"));
        let file = fs::File::create(&mask_path)?;
        mask.write_npy(BufWriter::new(file))
            .map_err(|e| PipelineError::Input(format!("cannot write {}: {}", mask_path.display(), e)))?;

        let json = serde_json::to_string_pretty(artifact)
            .map_err(|e| PipelineError::Input(format!("cannot serialize findings: {e}")))?;
        let findings_path = case_dir.join(format!("{case_id}_findings.json"));
        fs::write(&findings_path, &json)?;

        self.db
            .insert_findings(
                case_id,
                &json,
                artifact.num_nodules,
                overall_risk_label(&artifact.nodules).as_str(),
                &artifact.impression,
            )
            .await?;

        info!(target: TARGET_PIPELINE, "Findings persisted: {}", findings_path.display());
        Ok(())
    }

    async fn notify_outcome(&self, case_id: &str, message: &str) -> Result<(), PipelineError> {
        match &self.config.notify_webhook_url {
            Some(url) => crate::notify::notify(url, case_id, message, self.config.downstream_timeout_secs).await,
            None => Ok(()),
        }
    }

    async fn notify_best_effort(&self, case_id: &str, message: &str) {
        if let Err(e) = self.notify_outcome(case_id, message).await {
            warn!(target: TARGET_PIPELINE, "Failure notification for {} also failed: {}", case_id, e);
        }
    }
}
