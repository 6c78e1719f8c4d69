use thiserror::Error;

/// Pipeline stages, recorded on run failure so status polling can report
/// where a run died without exposing internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    LocateScan,
    LoadVolume,
    Inference,
    Extraction,
    Explainability,
    Persist,
    Report,
    Notify,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::LocateScan => "locate_scan",
            Stage::LoadVolume => "load_volume",
            Stage::Inference => "inference",
            Stage::Extraction => "extraction",
            Stage::Explainability => "explainability",
            Stage::Persist => "persist",
            Stage::Report => "report",
            Stage::Notify => "notify",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Unreadable or absent scan data. Fatal, no retry.
    #[error("input error: {0}")]
    Input(String),

    /// Model forward-pass or tensor failure. Fatal for the run.
    #[error("inference error: {0}")]
    Inference(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Report/notify collaborator failure. Recovered at orchestrator level.
    #[error("downstream error ({service}): {detail}")]
    Downstream { service: String, detail: String },
}

impl From<candle_core::Error> for PipelineError {
    fn from(e: candle_core::Error) -> Self {
        PipelineError::Inference(e.to_string())
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Input(e.to_string())
    }
}
