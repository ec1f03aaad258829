//! Notification sinks

use async_trait::async_trait;
use mend_model::{NotificationLevel, Notifier};

/// Notifier that writes to the tracing log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str, level: NotificationLevel) {
        match level {
            NotificationLevel::Info => tracing::info!(target: "mend::notify", "{}", message),
            NotificationLevel::Warning => tracing::warn!(target: "mend::notify", "{}", message),
            NotificationLevel::Critical | NotificationLevel::Emergency => {
                tracing::error!(target: "mend::notify", level = ?level, "{}", message);
            }
        }
    }
}
