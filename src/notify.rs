// =============================================================================
// Notification contract
// =============================================================================
//
// The engine raises notifications through a single `send(message, priority)`
// seam. Concrete channels (Slack, Telegram) are injected at wire-up; the
// default sink routes everything to the process log so the core never blocks
// on a missing webhook.
// =============================================================================

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Priority {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Outbound notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str, priority: Priority);
}

/// Default notifier: writes to the structured log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &str, priority: Priority) {
        match priority {
            Priority::Info => info!(notification = message, "notification"),
            Priority::Warning => warn!(notification = message, "notification"),
            Priority::Critical => error!(notification = message, "CRITICAL notification"),
        }
    }
}
