use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{error, info};

use crate::error::PipelineError;
use crate::TARGET_WEB_REQUEST;

/// Deliver one message to a recipient through the notification webhook.
///
/// The webhook is a black box that may fail independently of pipeline
/// success; callers decide whether the failure matters. One bounded-timeout
/// request, no internal retries.
pub async fn notify(
    webhook_url: &str,
    recipient: &str,
    message: &str,
    timeout_secs: u64,
) -> Result<(), PipelineError> {
    let client = Client::new();
    let payload = json!({
        "recipient": recipient,
        "message": message,
    });

    info!(target: TARGET_WEB_REQUEST, "Sending notification to {} via {}", recipient, webhook_url);
    let res = client
        .post(webhook_url)
        .header("Content-Type", "application/json")
        .timeout(Duration::from_secs(timeout_secs))
        .body(payload.to_string())
        .send()
        .await;

    match res {
        Ok(response) => {
            if response.status().is_success() {
                info!(target: TARGET_WEB_REQUEST, " ** Notification sent successfully");
                Ok(())
            } else {
                let status = response.status();
                let error_text = response.text().await.unwrap_or_default();
                error!(target: TARGET_WEB_REQUEST, " !! Error sending notification ({}): {}", status, error_text);
                Err(PipelineError::Downstream {
                    service: "notify".to_string(),
                    detail: format!("webhook returned {}", status),
                })
            }
        }
        Err(err) => {
            error!(target: TARGET_WEB_REQUEST, " !! Error sending notification: {:?}", err);
            Err(PipelineError::Downstream {
                service: "notify".to_string(),
                detail: err.to_string(),
            })
        }
    }
}
