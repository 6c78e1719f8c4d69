use chrono::{SecondsFormat, Utc};
use sqlx::Row;
use tracing::debug;

use super::core::Database;
use crate::pipeline::RunStatus;
use crate::volume::ScanFormat;
use crate::TARGET_DB;

/// One row of the `runs` table.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub case_id: String,
    pub status: RunStatus,
    pub stage: Option<String>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub updated_at: String,
}

/// One persisted findings artifact.
#[derive(Debug, Clone)]
pub struct FindingsRecord {
    pub case_id: String,
    pub findings_json: String,
    pub num_nodules: i64,
    pub risk_label: String,
    pub impression: String,
    pub created_at: String,
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl Database {
    /// Register a scan location for a case and seed its run row as pending.
    /// Re-registering updates the location without touching run state.
    pub async fn register_scan(
        &self,
        case_id: &str,
        scan_path: &str,
        format: ScanFormat,
    ) -> Result<(), sqlx::Error> {
        let timestamp = now();
        sqlx::query(
            r#"
            INSERT INTO scans (case_id, scan_path, format, registered_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(case_id) DO UPDATE SET scan_path = ?2, format = ?3
            "#,
        )
        .bind(case_id)
        .bind(scan_path)
        .bind(format.as_str())
        .bind(&timestamp)
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"
            INSERT INTO runs (case_id, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?3)
            ON CONFLICT(case_id) DO NOTHING
            "#,
        )
        .bind(case_id)
        .bind(RunStatus::Pending.as_str())
        .bind(&timestamp)
        .execute(self.pool())
        .await?;

        debug!(target: TARGET_DB, "Registered scan for case {}: {}", case_id, scan_path);
        Ok(())
    }

    /// Look up the scan location for a case.
    pub async fn scan_location(&self, case_id: &str) -> Result<Option<(String, ScanFormat)>, sqlx::Error> {
        let row = sqlx::query("SELECT scan_path, format FROM scans WHERE case_id = ?1")
            .bind(case_id)
            .fetch_optional(self.pool())
            .await?;

        row.map(|row| {
            let path: String = row.get("scan_path");
            let format: String = row.get("format");
            let format = ScanFormat::parse(&format)
                .ok_or_else(|| sqlx::Error::Protocol(format!("unknown scan format '{}'", format)))?;
            Ok((path, format))
        })
        .transpose()
    }

    pub async fn run_status(&self, case_id: &str) -> Result<Option<RunRecord>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT case_id, status, stage, error, warnings, updated_at FROM runs WHERE case_id = ?1",
        )
        .bind(case_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| {
            let status: String = row.get("status");
            let status = RunStatus::parse(&status)
                .ok_or_else(|| sqlx::Error::Protocol(format!("unknown run status '{}'", status)))?;
            let warnings: Option<String> = row.get("warnings");
            let warnings = warnings
                .and_then(|json| serde_json::from_str(&json).ok())
                .unwrap_or_default();
            Ok(RunRecord {
                case_id: row.get("case_id"),
                status,
                stage: row.get("stage"),
                error: row.get("error"),
                warnings,
                updated_at: row.get("updated_at"),
            })
        })
        .transpose()
    }

    /// Set the run status, clearing stage/error/warning details from any
    /// previous run.
    pub async fn upsert_run_status(&self, case_id: &str, status: RunStatus) -> Result<(), sqlx::Error> {
        let timestamp = now();
        sqlx::query(
            r#"
            INSERT INTO runs (case_id, status, stage, error, warnings, created_at, updated_at)
            VALUES (?1, ?2, NULL, NULL, NULL, ?3, ?3)
            ON CONFLICT(case_id) DO UPDATE SET
                status = ?2, stage = NULL, error = NULL, warnings = NULL, updated_at = ?3
            "#,
        )
        .bind(case_id)
        .bind(status.as_str())
        .bind(&timestamp)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Terminal failure: record the originating stage and a sanitized error
    /// message for status polling.
    pub async fn mark_failed(&self, case_id: &str, stage: &str, error: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE runs SET status = ?2, stage = ?3, error = ?4, updated_at = ?5
            WHERE case_id = ?1
            "#,
        )
        .bind(case_id)
        .bind(RunStatus::Failed.as_str())
        .bind(stage)
        .bind(error)
        .bind(now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Terminal success, with any non-fatal downstream warnings attached.
    pub async fn mark_completed(&self, case_id: &str, warnings: &[String]) -> Result<(), sqlx::Error> {
        let warnings_json = if warnings.is_empty() {
            None
        } else {
            Some(serde_json::to_string(warnings).unwrap_or_default())
        };
        sqlx::query(
            r#"
            UPDATE runs SET status = ?2, stage = NULL, error = NULL, warnings = ?3, updated_at = ?4
            WHERE case_id = ?1
            "#,
        )
        .bind(case_id)
        .bind(RunStatus::Completed.as_str())
        .bind(warnings_json)
        .bind(now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Push a run descriptor. A case already queued stays queued once.
    pub async fn enqueue_run(&self, case_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO run_queue (case_id, queued_at)
            VALUES (?1, ?2)
            ON CONFLICT(case_id) DO NOTHING
            "#,
        )
        .bind(case_id)
        .bind(now())
        .execute(self.pool())
        .await?;
        debug!(target: TARGET_DB, "Enqueued run for case {}", case_id);
        Ok(())
    }

    /// Pop the oldest queued case, if any.
    pub async fn fetch_and_delete_queued_case(&self) -> Result<Option<String>, sqlx::Error> {
        let mut transaction = self.pool().begin().await?;

        let row = sqlx::query(
            r#"
            SELECT id, case_id FROM run_queue
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *transaction)
        .await?;

        let result = match row {
            Some(row) => {
                let id: i64 = row.get("id");
                let case_id: String = row.get("case_id");
                sqlx::query("DELETE FROM run_queue WHERE id = ?1")
                    .bind(id)
                    .execute(&mut *transaction)
                    .await?;
                Some(case_id)
            }
            None => None,
        };

        transaction.commit().await?;
        Ok(result)
    }

    /// Persist a findings artifact. Every run appends a new immutable row;
    /// the latest row is the current artifact for the case.
    pub async fn insert_findings(
        &self,
        case_id: &str,
        findings_json: &str,
        num_nodules: usize,
        risk_label: &str,
        impression: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO findings (case_id, findings_json, num_nodules, risk_label, impression, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(case_id)
        .bind(findings_json)
        .bind(num_nodules as i64)
        .bind(risk_label)
        .bind(impression)
        .bind(now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn latest_findings(&self, case_id: &str) -> Result<Option<FindingsRecord>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT case_id, findings_json, num_nodules, risk_label, impression, created_at
            FROM findings WHERE case_id = ?1
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(case_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(|row| FindingsRecord {
            case_id: row.get("case_id"),
            findings_json: row.get("findings_json"),
            num_nodules: row.get("num_nodules"),
            risk_label: row.get("risk_label"),
            impression: row.get("impression"),
            created_at: row.get("created_at"),
        }))
    }
}
