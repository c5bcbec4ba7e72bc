use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{Record, UnixTimeMs, MAX_RETRY_ATTEMPTS};

/// The three mutation verbs the remote data service understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
}

impl ActionKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("invalid table name '{name}': {reason}")]
    InvalidTable { name: String, reason: &'static str },

    #[error("{kind} on '{table}' requires a string 'id' field in the payload")]
    MissingRecordId { kind: ActionKind, table: String },
}

/// Validated target collection name - immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableName(String);

impl TableName {
    pub const MAX_LENGTH: usize = 64;

    pub fn new(name: impl Into<String>) -> Result<Self, ActionError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ActionError::InvalidTable {
                name,
                reason: "table name cannot be empty",
            });
        }
        if name.len() > Self::MAX_LENGTH {
            return Err(ActionError::InvalidTable {
                name: name.chars().take(32).collect(),
                reason: "table name too long",
            });
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(ActionError::InvalidTable {
                name,
                reason: "table name may only contain a-z, 0-9 and _",
            });
        }
        Ok(Self(name))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Queue-unique action identifier: kind, table, enqueue time and a random
/// suffix, so collisions are impossible even for identical payloads enqueued
/// in the same millisecond.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionId(String);

impl ActionId {
    #[must_use]
    pub fn generate(kind: ActionKind, table: &TableName, now: UnixTimeMs) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!(
            "{}_{}_{}_{}",
            kind.as_str(),
            table.as_str(),
            now.as_millis(),
            &suffix[..8]
        ))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A mutation buffered while offline, waiting to be replayed.
///
/// Invariant: `retry_count <= max_retries`; the sync pass drops the action
/// permanently the moment the ceiling is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub id: ActionId,
    pub kind: ActionKind,
    pub table: TableName,
    pub data: Record,
    pub timestamp: UnixTimeMs,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl PendingAction {
    #[must_use]
    pub fn new(kind: ActionKind, table: TableName, data: Record, now: UnixTimeMs) -> Self {
        Self {
            id: ActionId::generate(kind, &table, now),
            kind,
            table,
            data,
            timestamp: now,
            retry_count: 0,
            max_retries: MAX_RETRY_ATTEMPTS,
        }
    }

    /// Serialized size of the whole action, used against the per-action
    /// ceiling at enqueue time.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        serde_json::to_string(self).map_or(usize::MAX, |s| s.len())
    }

    /// The payload's record id, required for update and delete dispatch.
    pub fn record_id(&self) -> Result<&str, ActionError> {
        self.data
            .get("id")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ActionError::MissingRecordId {
                kind: self.kind,
                table: self.table.as_str().to_string(),
            })
    }

    /// Record one failed replay attempt. Returns true when the retry ceiling
    /// has been reached and the action must be dropped.
    pub fn record_failure(&mut self) -> bool {
        self.retry_count = self.retry_count.saturating_add(1);
        self.retry_count >= self.max_retries
    }

    #[must_use]
    pub const fn attempts_left(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(pairs: serde_json::Value) -> Record {
        pairs.as_object().cloned().unwrap_or_default()
    }

    fn table(name: &str) -> TableName {
        TableName::new(name).unwrap()
    }

    #[test]
    fn table_name_validation() {
        assert!(TableName::new("vitals").is_ok());
        assert!(TableName::new("lab_results_2").is_ok());
        assert!(TableName::new("").is_err());
        assert!(TableName::new("Patients").is_err());
        assert!(TableName::new("drop table;").is_err());
        assert!(TableName::new("a".repeat(65)).is_err());
    }

    #[test]
    fn action_id_carries_kind_table_and_time() {
        let now = UnixTimeMs(1_700_000_000_000);
        let id = ActionId::generate(ActionKind::Create, &table("vitals"), now);
        assert!(id.as_str().starts_with("create_vitals_1700000000000_"));
    }

    #[test]
    fn action_ids_are_unique() {
        let now = UnixTimeMs(42);
        let t = table("vitals");
        let a = ActionId::generate(ActionKind::Create, &t, now);
        let b = ActionId::generate(ActionKind::Create, &t, now);
        assert_ne!(a, b);
    }

    #[test]
    fn new_action_starts_at_zero_retries() {
        let action = PendingAction::new(
            ActionKind::Create,
            table("vitals"),
            payload(json!({"heart_rate": 72})),
            UnixTimeMs(1_000),
        );
        assert_eq!(action.retry_count, 0);
        assert_eq!(action.max_retries, MAX_RETRY_ATTEMPTS);
        assert_eq!(action.attempts_left(), MAX_RETRY_ATTEMPTS);
    }

    #[test]
    fn record_failure_reports_exhaustion() {
        let mut action = PendingAction::new(
            ActionKind::Update,
            table("patients"),
            payload(json!({"id": "p1"})),
            UnixTimeMs(1_000),
        );
        assert!(!action.record_failure());
        assert!(!action.record_failure());
        assert!(action.record_failure());
        assert_eq!(action.retry_count, action.max_retries);
    }

    #[test]
    fn record_id_required_for_update() {
        let action = PendingAction::new(
            ActionKind::Update,
            table("patients"),
            payload(json!({"name": "missing id"})),
            UnixTimeMs(1_000),
        );
        assert!(matches!(
            action.record_id(),
            Err(ActionError::MissingRecordId { .. })
        ));

        let action = PendingAction::new(
            ActionKind::Update,
            table("patients"),
            payload(json!({"id": "p1", "name": "ok"})),
            UnixTimeMs(1_000),
        );
        assert_eq!(action.record_id().unwrap(), "p1");
    }

    #[test]
    fn estimated_size_tracks_payload() {
        let small = PendingAction::new(
            ActionKind::Create,
            table("vitals"),
            payload(json!({"v": 1})),
            UnixTimeMs(0),
        );
        let big = PendingAction::new(
            ActionKind::Create,
            table("vitals"),
            payload(json!({"v": "x".repeat(10_000)})),
            UnixTimeMs(0),
        );
        assert!(big.estimated_size() > small.estimated_size() + 9_000);
    }

    #[test]
    fn serde_roundtrip() {
        let action = PendingAction::new(
            ActionKind::Delete,
            table("medications"),
            payload(json!({"id": "m1"})),
            UnixTimeMs(7),
        );
        let json = serde_json::to_string(&action).unwrap();
        let back: PendingAction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, action);
    }
}
