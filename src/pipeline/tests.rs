use std::path::Path;
use std::sync::Arc;

use ndarray::{s, Array3};
use ndarray_npy::WriteNpyExt;

use crate::config::PipelineConfig;
use crate::db::Database;
use crate::error::PipelineError;
use crate::findings::FindingsArtifact;
use crate::model::{ModelHandle, PatchPrediction, VolumetricModel};
use crate::pipeline::{Pipeline, RunStatus};
use crate::volume::ScanFormat;

/// Segments by intensity: every normalized voxel above 0.5 is foreground.
/// The fixed malignancy value stands in for the classification head.
struct EchoModel {
    malignancy: f32,
}

impl VolumetricModel for EchoModel {
    fn predict(&self, patch: &Array3<f32>) -> Result<PatchPrediction, PipelineError> {
        let mask = patch.mapv(|v| if v > 0.5 { 1.0 } else { 0.0 });
        let risk = mask.iter().sum::<f32>() / mask.len() as f32;
        Ok(PatchPrediction { mask, risk })
    }

    fn malignancy(&self, _patch: &Array3<f32>) -> Result<f32, PipelineError> {
        Ok(self.malignancy)
    }

    fn activation_map(&self, _patch: &Array3<f32>) -> Result<Array3<f32>, PipelineError> {
        Ok(Array3::from_elem((4, 4, 4), 1.0))
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    pipeline: Arc<Pipeline>,
}

async fn harness(malignancy: f32) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::new(dir.path().join("test.db").to_str().unwrap())
        .await
        .unwrap();

    let config = PipelineConfig {
        patch_size: 16,
        stride: 8,
        output_dir: dir.path().join("outputs"),
        database_path: String::new(),
        ..PipelineConfig::default()
    };

    let model: ModelHandle = Arc::new(EchoModel { malignancy });
    let pipeline = Pipeline::new(db, model, config);
    Harness { _dir: dir, pipeline }
}

/// Write a raw-intensity volume: background at air, an optional cube at
/// soft-tissue intensity.
fn write_volume(path: &Path, shape: (usize, usize, usize), cube: Option<([usize; 3], usize)>) {
    let mut volume = Array3::<f32>::from_elem(shape, -1000.0);
    if let Some((origin, edge)) = cube {
        volume
            .slice_mut(s![
                origin[0]..origin[0] + edge,
                origin[1]..origin[1] + edge,
                origin[2]..origin[2] + edge
            ])
            .fill(400.0);
    }
    let file = std::fs::File::create(path).unwrap();
    volume.write_npy(std::io::BufWriter::new(file)).unwrap();
}

#[tokio::test]
async fn all_zero_volume_completes_with_empty_findings() {
    let h = harness(0.2).await;
    let scan = h._dir.path().join("clean.npy");
    write_volume(&scan, (64, 64, 64), None);

    h.pipeline
        .db()
        .register_scan("clean-1", scan.to_str().unwrap(), ScanFormat::Npy)
        .await
        .unwrap();

    assert_eq!(h.pipeline.trigger("clean-1").await.unwrap(), RunStatus::Processing);
    let queued = h.pipeline.db().fetch_and_delete_queued_case().await.unwrap();
    assert_eq!(queued.as_deref(), Some("clean-1"));
    h.pipeline.execute_case("clean-1").await;

    let record = h.pipeline.get_status("clean-1").await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Completed);

    let findings = h.pipeline.db().latest_findings("clean-1").await.unwrap().unwrap();
    assert_eq!(findings.num_nodules, 0);
    assert_eq!(findings.risk_label, "low");
    assert!(findings.impression.contains("No significant nodules"));

    let artifact: FindingsArtifact = serde_json::from_str(&findings.findings_json).unwrap();
    assert!(artifact.nodules.is_empty());
    assert_eq!(artifact.num_nodules, 0);
}

#[tokio::test]
async fn synthetic_cube_yields_one_measured_nodule() {
    let h = harness(0.9).await;
    let scan = h._dir.path().join("cube.npy");
    // 15^3 cube at offset 10 in a 40^3 volume.
    write_volume(&scan, (40, 40, 40), Some(([10, 10, 10], 15)));

    h.pipeline
        .db()
        .register_scan("cube-1", scan.to_str().unwrap(), ScanFormat::Npy)
        .await
        .unwrap();
    h.pipeline.trigger("cube-1").await.unwrap();
    h.pipeline.db().fetch_and_delete_queued_case().await.unwrap();
    h.pipeline.execute_case("cube-1").await;

    let record = h.pipeline.get_status("cube-1").await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Completed);

    let findings = h.pipeline.db().latest_findings("cube-1").await.unwrap().unwrap();
    assert_eq!(findings.num_nodules, 1);
    assert_eq!(findings.risk_label, "high");

    let artifact: FindingsArtifact = serde_json::from_str(&findings.findings_json).unwrap();
    let nodule = &artifact.nodules[0];
    assert_eq!(nodule.id, 1);
    assert_eq!(nodule.voxel_count, 15 * 15 * 15);
    assert!((nodule.volume_mm3 - 3375.0).abs() < 1e-6);
    // Geometric center of voxels 10..=24 is 17; tolerance one voxel.
    for axis in 0..3 {
        assert!((nodule.centroid[axis] - 17.0).abs() <= 1.0);
    }
    assert_eq!(nodule.prob_malignant, Some(0.9));
    assert!(artifact.impression.contains("1 classified as high-risk"));

    // Explainability assets were generated for the risk-flagged nodule.
    assert_ne!(nodule.gradcam_path, "not_available");
    assert!(Path::new(&nodule.gradcam_path).exists());

    // The artifact file itself was persisted alongside the mask.
    let case_dir = h.pipeline.config().case_dir("cube-1");
    assert!(case_dir.join("cube-1_findings.json").exists());
    assert!(case_dir.join("cube-1_mask.npy").exists());
}

#[tokio::test]
async fn trigger_while_processing_is_a_no_op() {
    let h = harness(0.2).await;
    let scan = h._dir.path().join("busy.npy");
    write_volume(&scan, (16, 16, 16), None);
    h.pipeline
        .db()
        .register_scan("busy-1", scan.to_str().unwrap(), ScanFormat::Npy)
        .await
        .unwrap();

    assert_eq!(h.pipeline.trigger("busy-1").await.unwrap(), RunStatus::Processing);
    // Second trigger before the worker picks it up: no second descriptor.
    assert_eq!(h.pipeline.trigger("busy-1").await.unwrap(), RunStatus::Processing);

    let first = h.pipeline.db().fetch_and_delete_queued_case().await.unwrap();
    assert_eq!(first.as_deref(), Some("busy-1"));
    let second = h.pipeline.db().fetch_and_delete_queued_case().await.unwrap();
    assert_eq!(second, None);
}

#[tokio::test]
async fn concurrent_triggers_produce_a_single_run_descriptor() {
    let h = harness(0.2).await;
    let scan = h._dir.path().join("race.npy");
    write_volume(&scan, (16, 16, 16), None);
    h.pipeline
        .db()
        .register_scan("race-1", scan.to_str().unwrap(), ScanFormat::Npy)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pipeline = h.pipeline.clone();
        handles.push(tokio::spawn(async move { pipeline.trigger("race-1").await }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), RunStatus::Processing);
    }

    let mut descriptors = 0;
    while h.pipeline.db().fetch_and_delete_queued_case().await.unwrap().is_some() {
        descriptors += 1;
    }
    assert_eq!(descriptors, 1);
}

#[tokio::test]
async fn completed_case_requires_explicit_retrigger() {
    let h = harness(0.2).await;
    let scan = h._dir.path().join("done.npy");
    write_volume(&scan, (16, 16, 16), None);
    h.pipeline
        .db()
        .register_scan("done-1", scan.to_str().unwrap(), ScanFormat::Npy)
        .await
        .unwrap();

    h.pipeline.trigger("done-1").await.unwrap();
    h.pipeline.db().fetch_and_delete_queued_case().await.unwrap();
    h.pipeline.execute_case("done-1").await;
    assert_eq!(
        h.pipeline.get_status("done-1").await.unwrap().unwrap().status,
        RunStatus::Completed
    );

    // Plain trigger reports the existing terminal status and queues nothing.
    assert_eq!(h.pipeline.trigger("done-1").await.unwrap(), RunStatus::Completed);
    assert_eq!(h.pipeline.db().fetch_and_delete_queued_case().await.unwrap(), None);

    // The explicit re-trigger restarts from pending.
    assert_eq!(h.pipeline.retrigger("done-1").await.unwrap(), RunStatus::Processing);
    assert_eq!(
        h.pipeline.db().fetch_and_delete_queued_case().await.unwrap().as_deref(),
        Some("done-1")
    );
}

#[tokio::test]
async fn missing_scan_fails_at_locate_stage() {
    let h = harness(0.2).await;

    assert_eq!(h.pipeline.trigger("ghost-1").await.unwrap(), RunStatus::Processing);
    h.pipeline.db().fetch_and_delete_queued_case().await.unwrap();
    h.pipeline.execute_case("ghost-1").await;

    let record = h.pipeline.get_status("ghost-1").await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.stage.as_deref(), Some("locate_scan"));
    assert!(record.error.unwrap().contains("no scan registered"));
}

#[tokio::test]
async fn failed_case_can_be_retriggered_after_fixing_input() {
    let h = harness(0.2).await;

    h.pipeline.trigger("late-1").await.unwrap();
    h.pipeline.db().fetch_and_delete_queued_case().await.unwrap();
    h.pipeline.execute_case("late-1").await;
    assert_eq!(
        h.pipeline.get_status("late-1").await.unwrap().unwrap().status,
        RunStatus::Failed
    );

    // Register the scan late and explicitly restart the case.
    let scan = h._dir.path().join("late.npy");
    write_volume(&scan, (16, 16, 16), None);
    h.pipeline
        .db()
        .register_scan("late-1", scan.to_str().unwrap(), ScanFormat::Npy)
        .await
        .unwrap();

    assert_eq!(h.pipeline.retrigger("late-1").await.unwrap(), RunStatus::Processing);
    h.pipeline.db().fetch_and_delete_queued_case().await.unwrap();
    h.pipeline.execute_case("late-1").await;

    let record = h.pipeline.get_status("late-1").await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    assert!(record.error.is_none());
}

#[tokio::test]
async fn rerunning_the_pipeline_is_deterministic() {
    let h = harness(0.6).await;
    let scan = h._dir.path().join("repeat.npy");
    write_volume(&scan, (24, 24, 24), Some(([4, 4, 4], 6)));
    h.pipeline
        .db()
        .register_scan("repeat-1", scan.to_str().unwrap(), ScanFormat::Npy)
        .await
        .unwrap();

    h.pipeline.trigger("repeat-1").await.unwrap();
    h.pipeline.db().fetch_and_delete_queued_case().await.unwrap();
    h.pipeline.execute_case("repeat-1").await;
    let first: FindingsArtifact = serde_json::from_str(
        &h.pipeline.db().latest_findings("repeat-1").await.unwrap().unwrap().findings_json,
    )
    .unwrap();

    h.pipeline.retrigger("repeat-1").await.unwrap();
    h.pipeline.db().fetch_and_delete_queued_case().await.unwrap();
    h.pipeline.execute_case("repeat-1").await;
    let second: FindingsArtifact = serde_json::from_str(
        &h.pipeline.db().latest_findings("repeat-1").await.unwrap().unwrap().findings_json,
    )
    .unwrap();

    // The pure computation is idempotent: identical nodule lists, metrics
    // and ordering on identical input.
    assert_eq!(first.num_nodules, second.num_nodules);
    let a = serde_json::to_value(&first.nodules).unwrap();
    let b = serde_json::to_value(&second.nodules).unwrap();
    assert_eq!(a, b);
}
