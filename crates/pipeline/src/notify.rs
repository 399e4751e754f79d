//! Best-effort failure notification.
//!
//! Fires at most once per campaign, only on failure. Success is silent, and
//! a delivery failure never fails the pipeline — this is a side channel, not
//! a gate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

/// JSON payload delivered to the webhook.
#[derive(Debug, Clone, Serialize)]
pub struct FailureNotice {
    pub run_id: String,
    pub failure_class: String,
    pub summary: String,
}

/// Webhook sink, latched to a single delivery.
pub struct NotificationSink {
    webhook_url: Option<String>,
    client: reqwest::Client,
    fired: AtomicBool,
}

impl NotificationSink {
    pub fn new(webhook_url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            webhook_url,
            client,
            fired: AtomicBool::new(false),
        }
    }

    /// Disabled sink; notify is a no-op.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Whether a notification has been sent this campaign.
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Deliver the notice, once. Later calls and delivery errors are
    /// swallowed after logging.
    pub async fn notify_failure(&self, notice: &FailureNotice) {
        let Some(url) = &self.webhook_url else {
            debug!("notification sink disabled, skipping");
            return;
        };
        if self.fired.swap(true, Ordering::SeqCst) {
            debug!("notification already fired this campaign, skipping");
            return;
        }

        match self.client.post(url).json(notice).send().await {
            Ok(response) if response.status().is_success() => {
                info!(run_id = %notice.run_id, "failure notification delivered");
            }
            Ok(response) => {
                warn!(
                    status = %response.status(),
                    "failure notification rejected by webhook"
                );
            }
            Err(e) => {
                warn!(error = %e, "failure notification delivery failed");
            }
        }
    }
}
