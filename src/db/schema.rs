use super::core::Database;

impl Database {
    pub(crate) async fn initialize_schema(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.pool().acquire().await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scans (
                case_id TEXT PRIMARY KEY,
                scan_path TEXT NOT NULL,
                format TEXT NOT NULL, -- npy | series
                registered_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS runs (
                case_id TEXT PRIMARY KEY,
                status TEXT NOT NULL, -- pending | processing | completed | failed
                stage TEXT,
                error TEXT,
                warnings TEXT, -- JSON array of non-fatal warnings
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs (status);

            CREATE TABLE IF NOT EXISTS run_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                case_id TEXT NOT NULL UNIQUE,
                queued_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS findings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                case_id TEXT NOT NULL,
                findings_json TEXT NOT NULL,
                num_nodules INTEGER NOT NULL,
                risk_label TEXT NOT NULL,
                impression TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_findings_case_id ON findings (case_id);
            "#,
        )
        .execute(&mut *conn)
        .await?;

        Ok(())
    }
}
