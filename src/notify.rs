use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::action::ActionKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A user-facing message the host surfaces however it likes (toast, banner,
/// status line). The engine only ever constructs these; it never renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub title: String,
    pub description: String,
    pub severity: Severity,
}

impl Notice {
    #[must_use]
    pub fn back_online() -> Self {
        Self {
            title: "Back online".to_string(),
            description: "Connection restored. Syncing your pending changes.".to_string(),
            severity: Severity::Info,
        }
    }

    #[must_use]
    pub fn connection_lost() -> Self {
        Self {
            title: "Working offline".to_string(),
            description: "No connection. Your changes will be saved and synced when you're back online.".to_string(),
            severity: Severity::Warning,
        }
    }

    #[must_use]
    pub fn action_queued(kind: ActionKind, table: &str) -> Self {
        Self {
            title: "Saved offline".to_string(),
            description: format!("Your {kind} to {table} was saved and will sync automatically."),
            severity: Severity::Info,
        }
    }

    #[must_use]
    pub fn sync_complete(count: usize) -> Self {
        let changes = if count == 1 { "change" } else { "changes" };
        Self {
            title: "Sync complete".to_string(),
            description: format!("{count} offline {changes} synced successfully."),
            severity: Severity::Info,
        }
    }

    #[must_use]
    pub fn sync_failed(kind: ActionKind, table: &str, retries: u32) -> Self {
        Self {
            title: "Change could not be synced".to_string(),
            description: format!(
                "A {kind} to {table} failed after {retries} attempts and was discarded. Please re-enter it."
            ),
            severity: Severity::Error,
        }
    }

    #[must_use]
    pub fn action_too_large(size: usize, max: usize) -> Self {
        Self {
            title: "Change too large to save offline".to_string(),
            description: format!(
                "This change is {size} bytes, over the {max} byte offline limit. Try again while online."
            ),
            severity: Severity::Error,
        }
    }

    #[must_use]
    pub fn storage_limit_reached() -> Self {
        Self {
            title: "Offline storage full".to_string(),
            description: "Local storage is full. Older cached data was cleared to keep your recent changes.".to_string(),
            severity: Severity::Warning,
        }
    }
}

/// Sink for user notifications; implemented by the host UI.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Default sink for headless hosts: notices go to the log at their severity.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        match notice.severity {
            Severity::Info => info!(title = %notice.title, "{}", notice.description),
            Severity::Warning => warn!(title = %notice.title, "{}", notice.description),
            Severity::Error => error!(title = %notice.title, "{}", notice.description),
        }
    }
}

/// Captures every notice; used by tests and by hosts that drain notices on
/// their own schedule.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: std::sync::Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All notices so far, oldest first.
    #[must_use]
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().map(|n| n.clone()).unwrap_or_default()
    }

    /// Remove and return everything captured so far.
    #[must_use]
    pub fn drain(&self) -> Vec<Notice> {
        self.notices
            .lock()
            .map(|mut n| std::mem::take(&mut *n))
            .unwrap_or_default()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        if let Ok(mut notices) = self.notices.lock() {
            notices.push(notice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_complete_pluralizes() {
        assert!(Notice::sync_complete(1).description.contains("1 offline change "));
        assert!(Notice::sync_complete(3).description.contains("3 offline changes "));
    }

    #[test]
    fn sync_failed_names_kind_table_and_attempts() {
        let notice = Notice::sync_failed(ActionKind::Update, "medications", 3);
        assert_eq!(notice.severity, Severity::Error);
        assert!(notice.description.contains("update"));
        assert!(notice.description.contains("medications"));
        assert!(notice.description.contains("3 attempts"));
    }

    #[test]
    fn recording_notifier_preserves_order() {
        let notifier = RecordingNotifier::new();
        notifier.notify(Notice::connection_lost());
        notifier.notify(Notice::back_online());
        let notices = notifier.drain();
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[0].title, "Working offline");
        assert_eq!(notices[1].title, "Back online");
        assert!(notifier.notices().is_empty());
    }
}
