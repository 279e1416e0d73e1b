// src/notify/mod.rs

//! Best-effort delivery of pipeline, refresh, drift and failure messages
//!
//! Messages go to a single channel: a Discord webhook, or standard output
//! when notifications are disabled. Delivery failures are logged and never
//! propagated to the caller.

mod message;

pub use message::{
    FailureReport, Mark, Message, PUBLISH_STEP, PipelineReport, RefreshItem, RefreshReport,
    ReportLine,
};

use crate::config::DiscordConfig;
use crate::error::{Error, Result};
use crate::http::HttpClient;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Discord rejects longer message contents
const MAX_MESSAGE_CHARS: usize = 2000;

/// Upper bound on how long a delivery holds up the caller
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// A notification channel
pub trait Notifier: Send + Sync {
    fn send(&self, topic: &str, content: &str) -> Result<()>;
}

/// Posts messages to a Discord webhook
///
/// The URL is read from a file at each delivery, so the configuration can be
/// kept under version control without the secret.
pub struct DiscordNotifier {
    webhook_url_file: PathBuf,
    client: HttpClient,
}

impl DiscordNotifier {
    pub fn new(config: &DiscordConfig) -> Result<Self> {
        Ok(Self {
            webhook_url_file: config.webhook_url_file.clone(),
            client: HttpClient::with_timeout(WEBHOOK_TIMEOUT)?,
        })
    }

    fn webhook_url(&self) -> Result<String> {
        let url = fs::read_to_string(&self.webhook_url_file).map_err(|e| {
            Error::NotifyError(format!(
                "Failed to read webhook URL from {}: {}",
                self.webhook_url_file.display(),
                e
            ))
        })?;
        let url = url.trim();
        if url.is_empty() {
            return Err(Error::NotifyError(format!(
                "{} is empty",
                self.webhook_url_file.display()
            )));
        }
        Ok(url.to_string())
    }
}

impl Notifier for DiscordNotifier {
    fn send(&self, topic: &str, content: &str) -> Result<()> {
        let url = self.webhook_url()?;
        let body = serde_json::json!({ "content": truncate(content, MAX_MESSAGE_CHARS) });
        self.client
            .post_json(&url, &body)
            .map_err(|e| Error::NotifyError(e.to_string()))?;
        debug!("Notified about {}", topic);
        Ok(())
    }
}

/// Prints messages instead of sending them
pub struct PrintNotifier;

impl Notifier for PrintNotifier {
    fn send(&self, topic: &str, content: &str) -> Result<()> {
        debug!("Printing notification about {} instead of sending it", topic);
        println!("{}\n", content);
        Ok(())
    }
}

fn truncate(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let mut truncated: String = content.chars().take(max_chars - 1).collect();
    truncated.push('…');
    truncated
}

/// Renders messages and hands them to the channel
pub struct Dispatcher {
    notifier: Box<dyn Notifier>,
}

impl Dispatcher {
    pub fn new(notifier: Box<dyn Notifier>) -> Self {
        Self { notifier }
    }

    /// Discord when configured, printing otherwise or when `print_only`
    pub fn from_config(discord: Option<&DiscordConfig>, print_only: bool) -> Result<Self> {
        let notifier: Box<dyn Notifier> = match discord {
            Some(config) if !print_only => Box::new(DiscordNotifier::new(config)?),
            Some(_) => Box::new(PrintNotifier),
            None => {
                if !print_only {
                    warn!("No [discord] section, notifications are printed");
                }
                Box::new(PrintNotifier)
            }
        };
        Ok(Self::new(notifier))
    }

    /// Deliver a message; failures are logged only
    pub fn dispatch(&self, message: &Message) {
        let topic = message.topic();
        let Some(content) = message.render() else {
            debug!("Nothing to report about {}", topic);
            return;
        };
        if let Err(e) = self.notifier.send(&topic, &content) {
            error!("Failed to notify about {}: {}", topic, e);
        }
    }

    /// Report an operation that stopped with `error`
    pub fn report_failure(&self, operation: &str, error: impl fmt::Display) {
        self.dispatch(&Message::Failure(FailureReport::new(
            operation,
            error.to_string(),
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Failing;

    impl Notifier for Failing {
        fn send(&self, _topic: &str, _content: &str) -> Result<()> {
            Err(Error::NotifyError("HTTP 500 from webhook".to_string()))
        }
    }

    #[derive(Clone, Default)]
    struct Recording(Arc<Mutex<Vec<String>>>);

    impl Notifier for Recording {
        fn send(&self, _topic: &str, content: &str) -> Result<()> {
            self.0.lock().unwrap().push(content.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_delivery_failure_is_swallowed() {
        let dispatcher = Dispatcher::new(Box::new(Failing));
        let mut report = RefreshReport::default();
        report.todo.push("16.4.8".to_string());
        dispatcher.dispatch(&Message::Refresh(report));
    }

    #[test]
    fn test_empty_messages_are_not_sent() {
        let recording = Recording::default();
        let dispatcher = Dispatcher::new(Box::new(recording.clone()));
        dispatcher.dispatch(&Message::Refresh(RefreshReport::default()));
        assert!(recording.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_missing_webhook_file() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = DiscordNotifier::new(&DiscordConfig {
            webhook_url_file: dir.path().join("webhook"),
        })
        .unwrap();
        assert!(matches!(
            notifier.send("test", "hello"),
            Err(Error::NotifyError(_))
        ));
    }

    #[test]
    fn test_silent_webhook_gives_up() {
        // Connections queue in the backlog and never get an answer
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let url_file = dir.path().join("webhook");
        fs::write(
            &url_file,
            format!("http://{}/api/webhooks/1/x\n", listener.local_addr().unwrap()),
        )
        .unwrap();
        let notifier = DiscordNotifier::new(&DiscordConfig {
            webhook_url_file: url_file,
        })
        .unwrap();

        let started = std::time::Instant::now();
        assert!(matches!(
            notifier.send("test", "hello"),
            Err(Error::NotifyError(_))
        ));
        assert!(started.elapsed() < WEBHOOK_TIMEOUT + Duration::from_secs(5));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        let long = "é".repeat(30);
        let cut = truncate(&long, 10);
        assert_eq!(cut.chars().count(), 10);
        assert!(cut.ends_with('…'));
    }
}
