//! Best-effort rebuild notification for the viewer

use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Sends an empty `POST` to the downstream consumer. Never fails the caller.
#[derive(Debug, Clone)]
pub struct Notifier {
    client: reqwest::Client,
    timeout: Duration,
}

impl Notifier {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_NOTIFY_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns whether the consumer acknowledged with a success status
    pub async fn notify(&self, url: &str) -> bool {
        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .body(Vec::new())
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                info!("Viewer rebuild: {}", resp.status());
                true
            }
            Ok(resp) => {
                warn!("Viewer rebuild failed (non-fatal): {} returned {}", url, resp.status());
                false
            }
            Err(e) => {
                warn!("Viewer rebuild failed (non-fatal): {}", e);
                false
            }
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
