//! Webhook notifications.
//!
//! Each configured webhook gets a JSON POST per matching lifecycle event.
//! Failures are reported to the caller once and never escalate further;
//! the orchestrator logs them and moves on.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use gridguard_core::orchestrator::{Notifier, NotifyError};
use serde_json::json;
use tracing::debug;

/// One webhook target with its event filter.
#[derive(Debug, Clone)]
pub struct Webhook {
    /// Target URL, or the name of an environment variable holding it.
    pub url: Option<String>,
    /// Environment variable holding the URL.
    pub url_env: Option<String>,
    /// Events to forward; empty means all, `*` matches everything.
    pub events: Vec<String>,
}

impl Webhook {
    fn wants(&self, event: &str) -> bool {
        self.events.is_empty() || self.events.iter().any(|e| e == event || e == "*")
    }

    fn resolve_url(&self) -> Option<String> {
        if let Some(env) = &self.url_env {
            return std::env::var(env).ok().filter(|u| !u.is_empty());
        }
        self.url.clone().filter(|u| !u.is_empty())
    }
}

/// Dispatches lifecycle events to configured webhooks.
pub struct WebhookNotifier {
    webhooks: Vec<Webhook>,
    http: reqwest::Client,
}

impl WebhookNotifier {
    /// Creates a notifier over the configured targets.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError`] when the HTTP client cannot be built.
    pub fn new(webhooks: Vec<Webhook>) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| NotifyError(e.to_string()))?;
        Ok(Self { webhooks, http })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &str, data: serde_json::Value) -> Result<(), NotifyError> {
        let payload = json!({
            "event": event,
            "timestamp": Utc::now().to_rfc3339(),
            "data": data,
        });

        let mut last_error = None;
        for webhook in self.webhooks.iter().filter(|w| w.wants(event)) {
            let Some(url) = webhook.resolve_url() else {
                last_error = Some("webhook URL not configured".to_string());
                continue;
            };

            debug!(event, "dispatching webhook");
            let result = self.http.post(&url).json(&payload).send().await;
            match result {
                Ok(response) if response.status().is_client_error() || response.status().is_server_error() => {
                    last_error = Some(format!("webhook returned status {}", response.status()));
                },
                Ok(_) => {},
                Err(e) => last_error = Some(format!("sending webhook: {e}")),
            }
        }

        match last_error {
            Some(error) => Err(NotifyError(error)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(events: &[&str]) -> Webhook {
        Webhook {
            url: Some("https://example.invalid/hook".to_string()),
            url_env: None,
            events: events.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn test_empty_filter_matches_all() {
        assert!(hook(&[]).wants("shutdown_start"));
        assert!(hook(&[]).wants("anything"));
    }

    #[test]
    fn test_exact_filter() {
        let h = hook(&["shutdown_start", "shutdown_complete"]);
        assert!(h.wants("shutdown_start"));
        assert!(!h.wants("phase_start"));
    }

    #[test]
    fn test_wildcard_filter() {
        assert!(hook(&["*"]).wants("phase_complete"));
    }

    #[test]
    fn test_url_env_resolution() {
        let h = Webhook {
            url: None,
            url_env: Some("GRIDGUARD_TEST_HOOK_URL".to_string()),
            events: Vec::new(),
        };
        std::env::set_var("GRIDGUARD_TEST_HOOK_URL", "https://example.invalid/x");
        assert_eq!(
            h.resolve_url().as_deref(),
            Some("https://example.invalid/x")
        );
        std::env::remove_var("GRIDGUARD_TEST_HOOK_URL");
        assert!(h.resolve_url().is_none());
    }

    #[tokio::test]
    async fn test_unmatched_event_is_success() {
        let notifier = WebhookNotifier::new(vec![hook(&["shutdown_start"])]).unwrap();
        // phase_start matches no target, so nothing is sent and nothing fails.
        notifier
            .notify("phase_start", serde_json::json!({}))
            .await
            .unwrap();
    }
}
