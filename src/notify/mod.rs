//! Run notifications (start, success, failure).

use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Success,
    Failure,
}

pub trait Notifier: Send + Sync {
    fn send(&self, title: &str, context: &str, severity: Severity);
}

/// Writes notifications to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, title: &str, context: &str, severity: Severity) {
        match severity {
            Severity::Failure => error!(title = %title, "{}", context),
            Severity::Normal | Severity::Success => info!(title = %title, "{}", context),
        }
    }
}
