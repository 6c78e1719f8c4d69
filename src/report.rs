use reqwest::Client;
use std::time::Duration;
use tracing::{error, info};

use crate::error::PipelineError;
use crate::findings::FindingsArtifact;
use crate::TARGET_WEB_REQUEST;

/// Hand the findings artifact to the report-generation service.
///
/// The artifact's serialized form is the sole contract boundary: the
/// service renders PDFs/narratives from it on its own schedule. One
/// bounded-timeout request; failures are the caller's to absorb.
pub async fn request_report(
    service_url: &str,
    artifact: &FindingsArtifact,
    timeout_secs: u64,
) -> Result<(), PipelineError> {
    let client = Client::new();
    let url = format!("{}/reports/{}", service_url.trim_end_matches('/'), artifact.case_id);

    info!(target: TARGET_WEB_REQUEST, "Requesting report generation for case {} at {}", artifact.case_id, url);
    let res = client
        .post(&url)
        .timeout(Duration::from_secs(timeout_secs))
        .json(artifact)
        .send()
        .await;

    match res {
        Ok(response) if response.status().is_success() => {
            info!(target: TARGET_WEB_REQUEST, " ** Report generation accepted for case {}", artifact.case_id);
            Ok(())
        }
        Ok(response) => {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(target: TARGET_WEB_REQUEST, " !! Report service returned {}: {}", status, error_text);
            Err(PipelineError::Downstream {
                service: "report".to_string(),
                detail: format!("report service returned {}", status),
            })
        }
        Err(err) => {
            error!(target: TARGET_WEB_REQUEST, " !! Error contacting report service: {:?}", err);
            Err(PipelineError::Downstream {
                service: "report".to_string(),
                detail: err.to_string(),
            })
        }
    }
}
