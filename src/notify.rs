//! Best-effort alerting
//!
//! The engine only sees [`Notifier`]; delivery problems never reach it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;

use crate::grid::GridResult;

/// Alert sink. Implementations must not block and must swallow failures.
pub trait Notifier: Send + Sync {
    fn notify(&self, text: &str);
}

/// Writes alerts to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, text: &str) {
        warn!("[ALERT] {}", text);
    }
}

fn default_flush_interval_secs() -> u64 {
    10
}

fn default_name() -> String {
    "grid_bot".to_string()
}

/// Chat webhook settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Empty disables the webhook
    #[serde(default)]
    pub url: String,

    /// Prefixed to every message so several bots can share one chat
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            name: default_name(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

impl WebhookConfig {
    pub fn is_enabled(&self) -> bool {
        !self.url.is_empty()
    }
}

/// Buffers alerts and posts them in batches to a chat webhook
pub struct WebhookNotifier {
    config: WebhookConfig,
    client: Client,
    buffer: Mutex<Vec<String>>,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            config,
            client: Client::new(),
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Number of messages waiting for the next flush
    pub fn pending(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Post everything buffered so far as one message.
    ///
    /// The buffer is drained even if delivery fails.
    pub async fn flush(&self) {
        let messages: Vec<String> = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *buffer)
        };
        if messages.is_empty() {
            return;
        }

        let payload = build_payload(&self.config.name, &messages);
        match self.post(&payload).await {
            Ok(()) => debug!("Webhook delivered {} message(s)", messages.len()),
            Err(e) => warn!("Webhook delivery failed, dropped {} message(s): {}", messages.len(), e),
        }
    }

    async fn post(&self, payload: &serde_json::Value) -> GridResult<()> {
        self.client
            .post(&self.config.url)
            .json(payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Spawn the periodic flush task
    pub fn spawn_flusher(self: &Arc<Self>) -> JoinHandle<()> {
        let notifier = Arc::clone(self);
        let period = Duration::from_secs(notifier.config.flush_interval_secs.max(1));
        info!(
            "Webhook notifier started ({}), flushing every {:?}",
            notifier.config.name, period
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                notifier.flush().await;
            }
        })
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, text: &str) {
        if !self.config.is_enabled() {
            return;
        }
        self.buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(text.to_string());
    }
}

fn build_payload(name: &str, messages: &[String]) -> serde_json::Value {
    json!({
        "msgtype": "text",
        "text": { "content": format!("[{}]\n{}", name, messages.join("\n")) },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape() {
        let payload = build_payload("btc-ladder", &["a".to_string(), "b".to_string()]);
        assert_eq!(payload["msgtype"], "text");
        assert_eq!(payload["text"]["content"], "[btc-ladder]\na\nb");
    }

    #[test]
    fn test_disabled_webhook_buffers_nothing() {
        let notifier = WebhookNotifier::new(WebhookConfig::default());
        notifier.notify("ignored");
        assert_eq!(notifier.pending(), 0);
    }

    #[tokio::test]
    async fn test_flush_drains_even_on_failure() {
        let notifier = WebhookNotifier::new(WebhookConfig {
            url: "http://127.0.0.1:9/unreachable".to_string(),
            ..Default::default()
        });
        notifier.notify("first");
        notifier.notify("second");
        assert_eq!(notifier.pending(), 2);

        notifier.flush().await;
        assert_eq!(notifier.pending(), 0);
    }

    #[tokio::test]
    async fn test_delivery_error_maps_to_notification() {
        let notifier = WebhookNotifier::new(WebhookConfig {
            url: "not a url".to_string(),
            ..Default::default()
        });
        let result = notifier.post(&build_payload("x", &["a".to_string()])).await;
        assert!(matches!(result, Err(crate::grid::GridError::Notification(_))));
    }
}
