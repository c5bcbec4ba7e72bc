use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::action::PendingAction;
use crate::crypto::RecordMetadata;
use crate::{
    Record, SyncStatus, MAX_MEDICATION_RECORDS, MAX_PATIENT_RECORDS, MAX_VITALS_RECORDS,
    QUOTA_FALLBACK_PENDING_ACTIONS, TRIM_MEDICATION_RECORDS, TRIM_PATIENT_RECORDS,
    TRIM_PENDING_ACTIONS, TRIM_VITALS_RECORDS,
};

/// The three bounded record collections the cache mirrors locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordCollection {
    PatientData,
    Vitals,
    Medications,
}

impl RecordCollection {
    pub const ALL: [Self; 3] = [Self::PatientData, Self::Vitals, Self::Medications];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PatientData => "patient_data",
            Self::Vitals => "vitals",
            Self::Medications => "medications",
        }
    }

    #[must_use]
    pub const fn cap(self) -> usize {
        match self {
            Self::PatientData => MAX_PATIENT_RECORDS,
            Self::Vitals => MAX_VITALS_RECORDS,
            Self::Medications => MAX_MEDICATION_RECORDS,
        }
    }

    /// Emergency cap used when the serialized snapshot exceeds the ceiling.
    #[must_use]
    pub const fn trim_cap(self) -> usize {
        match self {
            Self::PatientData => TRIM_PATIENT_RECORDS,
            Self::Vitals => TRIM_VITALS_RECORDS,
            Self::Medications => TRIM_MEDICATION_RECORDS,
        }
    }

    /// Fields encrypted at rest. Fixed per collection; a record that lacks a
    /// listed field is stored with that field absent, not padded.
    #[must_use]
    pub const fn sensitive_fields(self) -> &'static [&'static str] {
        match self {
            Self::PatientData => &[
                "first_name",
                "last_name",
                "date_of_birth",
                "national_id",
                "phone",
                "address",
            ],
            Self::Vitals => &["notes"],
            Self::Medications => &["drug_name", "dosage", "instructions"],
        }
    }
}

impl std::fmt::Display for RecordCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// In-memory offline cache. Owned exclusively by the sync engine, which is
/// the sole writer to the backing storage key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OfflineCache {
    patient_data: VecDeque<Record>,
    vitals: VecDeque<Record>,
    medications: VecDeque<Record>,
    pub pending_actions: VecDeque<PendingAction>,
    pub sync_status: SyncStatus,
}

impl OfflineCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self, collection: RecordCollection) -> &VecDeque<Record> {
        match collection {
            RecordCollection::PatientData => &self.patient_data,
            RecordCollection::Vitals => &self.vitals,
            RecordCollection::Medications => &self.medications,
        }
    }

    fn records_mut(&mut self, collection: RecordCollection) -> &mut VecDeque<Record> {
        match collection {
            RecordCollection::PatientData => &mut self.patient_data,
            RecordCollection::Vitals => &mut self.vitals,
            RecordCollection::Medications => &mut self.medications,
        }
    }

    /// Append a record, evicting from the front once the cap is exceeded.
    pub fn push_record(&mut self, collection: RecordCollection, record: Record, cap: usize) {
        let records = self.records_mut(collection);
        records.push_back(record);
        let evicted = truncate_front(records, cap);
        if evicted > 0 {
            warn!(
                collection = collection.as_str(),
                evicted, cap, "record cache full, evicted oldest entries"
            );
        }
    }

    /// Append a pending action, evicting oldest actions over the cap.
    /// Returns the number of evicted actions.
    pub fn push_action(&mut self, action: PendingAction, cap: usize) -> usize {
        self.pending_actions.push_back(action);
        let evicted = truncate_front(&mut self.pending_actions, cap);
        if evicted > 0 {
            warn!(evicted, cap, "pending action queue full, evicted oldest actions");
        }
        evicted
    }

    /// Enforce every cap at once; used after hydrating a persisted snapshot.
    /// Caps come from the caller's configuration, not the default constants.
    pub fn truncate_to_caps(
        &mut self,
        record_cap: impl Fn(RecordCollection) -> usize,
        action_cap: usize,
    ) {
        for collection in RecordCollection::ALL {
            let evicted = truncate_front(self.records_mut(collection), record_cap(collection));
            if evicted > 0 {
                warn!(
                    collection = collection.as_str(),
                    evicted, "hydrated snapshot over cap, truncated oldest records"
                );
            }
        }
        let evicted = truncate_front(&mut self.pending_actions, action_cap);
        if evicted > 0 {
            warn!(evicted, "hydrated snapshot over action cap, truncated oldest actions");
        }
    }

    /// Soft trim when the serialized snapshot exceeds the byte ceiling.
    pub fn trim_for_size(&mut self) {
        for collection in RecordCollection::ALL {
            truncate_front(self.records_mut(collection), collection.trim_cap());
        }
        truncate_front(&mut self.pending_actions, TRIM_PENDING_ACTIONS);
        warn!("serialized cache over size ceiling, trimmed to emergency caps");
    }

    /// Last resort when the storage backend reports quota exhaustion: drop
    /// every cached record and keep only the most recent pending actions.
    pub fn quota_fallback(&mut self) {
        self.patient_data.clear();
        self.vitals.clear();
        self.medications.clear();
        truncate_front(&mut self.pending_actions, QUOTA_FALLBACK_PENDING_ACTIONS);
        warn!(
            kept_actions = self.pending_actions.len(),
            "storage quota exhausted, cleared cached records and kept recent actions"
        );
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending_actions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patient_data.is_empty()
            && self.vitals.is_empty()
            && self.medications.is_empty()
            && self.pending_actions.is_empty()
    }
}

fn truncate_front<T>(queue: &mut VecDeque<T>, cap: usize) -> usize {
    let mut evicted = 0;
    while queue.len() > cap {
        queue.pop_front();
        evicted += 1;
    }
    evicted
}

/// Wire form of the cache as written to storage: record collections hold
/// ciphertext for their sensitive fields, with index-aligned metadata
/// describing how to reverse the transform.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedCache {
    pub patient_data: Vec<Record>,
    pub vitals: Vec<Record>,
    pub medications: Vec<Record>,
    pub pending_actions: Vec<PendingAction>,
    pub sync_status: SyncStatus,
    pub encryption_metadata: EncryptionMetadata,
}

impl PersistedCache {
    #[must_use]
    pub fn records(&self, collection: RecordCollection) -> &[Record] {
        match collection {
            RecordCollection::PatientData => &self.patient_data,
            RecordCollection::Vitals => &self.vitals,
            RecordCollection::Medications => &self.medications,
        }
    }

    #[must_use]
    pub fn metadata(&self, collection: RecordCollection) -> &[RecordMetadata] {
        match collection {
            RecordCollection::PatientData => &self.encryption_metadata.patient_data,
            RecordCollection::Vitals => &self.encryption_metadata.vitals,
            RecordCollection::Medications => &self.encryption_metadata.medications,
        }
    }

    pub fn set_collection(
        &mut self,
        collection: RecordCollection,
        records: Vec<Record>,
        metadata: Vec<RecordMetadata>,
    ) {
        match collection {
            RecordCollection::PatientData => {
                self.patient_data = records;
                self.encryption_metadata.patient_data = metadata;
            }
            RecordCollection::Vitals => {
                self.vitals = records;
                self.encryption_metadata.vitals = metadata;
            }
            RecordCollection::Medications => {
                self.medications = records;
                self.encryption_metadata.medications = metadata;
            }
        }
    }
}

/// Per-collection transform descriptors, index-aligned with the records of
/// the same collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionMetadata {
    pub patient_data: Vec<RecordMetadata>,
    pub vitals: Vec<RecordMetadata>,
    pub medications: Vec<RecordMetadata>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionKind, TableName};
    use crate::{UnixTimeMs, MAX_PENDING_ACTIONS};
    use proptest::prelude::*;
    use serde_json::json;

    fn record(id: u64) -> Record {
        json!({ "id": id.to_string() }).as_object().cloned().unwrap()
    }

    fn action(n: u64) -> PendingAction {
        PendingAction::new(
            ActionKind::Create,
            TableName::new("vitals").unwrap(),
            json!({ "seq": n }).as_object().cloned().unwrap(),
            UnixTimeMs(n),
        )
    }

    #[test]
    fn record_eviction_is_fifo() {
        let mut cache = OfflineCache::new();
        for i in 0..5 {
            cache.push_record(RecordCollection::PatientData, record(i), 3);
        }
        let kept: Vec<_> = cache
            .records(RecordCollection::PatientData)
            .iter()
            .map(|r| r["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(kept, vec!["2", "3", "4"]);
    }

    #[test]
    fn action_eviction_counts() {
        let mut cache = OfflineCache::new();
        for i in 0..3 {
            assert_eq!(cache.push_action(action(i), 3), 0);
        }
        assert_eq!(cache.push_action(action(3), 3), 1);
        assert_eq!(cache.pending_len(), 3);
        assert_eq!(cache.pending_actions.front().unwrap().timestamp, UnixTimeMs(1));
    }

    #[test]
    fn truncate_to_caps_bounds_everything() {
        let mut cache = OfflineCache::new();
        for i in 0..(MAX_VITALS_RECORDS + 10) as u64 {
            cache
                .records_mut(RecordCollection::Vitals)
                .push_back(record(i));
        }
        for i in 0..(MAX_PENDING_ACTIONS + 5) as u64 {
            cache.pending_actions.push_back(action(i));
        }
        cache.truncate_to_caps(RecordCollection::cap, MAX_PENDING_ACTIONS);
        assert_eq!(cache.records(RecordCollection::Vitals).len(), MAX_VITALS_RECORDS);
        assert_eq!(cache.pending_len(), MAX_PENDING_ACTIONS);
    }

    #[test]
    fn truncate_to_caps_honors_supplied_caps() {
        let mut cache = OfflineCache::new();
        for i in 0..(MAX_PATIENT_RECORDS + 10) as u64 {
            cache
                .records_mut(RecordCollection::PatientData)
                .push_back(record(i));
        }
        // a cap above the default constant must not shrink to the constant
        cache.truncate_to_caps(|_| MAX_PATIENT_RECORDS + 10, 10);
        assert_eq!(
            cache.records(RecordCollection::PatientData).len(),
            MAX_PATIENT_RECORDS + 10
        );
        cache.truncate_to_caps(|_| 5, 10);
        assert_eq!(cache.records(RecordCollection::PatientData).len(), 5);
    }

    #[test]
    fn trim_for_size_applies_emergency_caps() {
        let mut cache = OfflineCache::new();
        for i in 0..60 {
            cache.push_record(RecordCollection::PatientData, record(i), 100);
            cache.push_record(RecordCollection::Medications, record(i), 100);
        }
        for i in 0..80 {
            cache.pending_actions.push_back(action(i));
        }
        cache.trim_for_size();
        assert_eq!(
            cache.records(RecordCollection::PatientData).len(),
            TRIM_PATIENT_RECORDS
        );
        assert_eq!(
            cache.records(RecordCollection::Medications).len(),
            TRIM_MEDICATION_RECORDS
        );
        assert_eq!(cache.pending_len(), TRIM_PENDING_ACTIONS);
    }

    #[test]
    fn quota_fallback_keeps_most_recent_actions() {
        let mut cache = OfflineCache::new();
        cache.push_record(RecordCollection::Vitals, record(1), 100);
        for i in 0..30 {
            cache.pending_actions.push_back(action(i));
        }
        cache.quota_fallback();
        assert!(cache.records(RecordCollection::Vitals).is_empty());
        assert_eq!(cache.pending_len(), QUOTA_FALLBACK_PENDING_ACTIONS);
        assert_eq!(
            cache.pending_actions.front().unwrap().timestamp,
            UnixTimeMs(10)
        );
    }

    proptest! {
        /// For any enqueue sequence the queue never exceeds its cap and the
        /// retained actions are always the most recently enqueued ones.
        #[test]
        fn cap_invariant_holds(count in 0usize..250, cap in 1usize..120) {
            let mut cache = OfflineCache::new();
            for i in 0..count {
                cache.push_action(action(i as u64), cap);
                prop_assert!(cache.pending_len() <= cap);
            }
            let expected_start = count.saturating_sub(cap) as u64;
            for (offset, a) in cache.pending_actions.iter().enumerate() {
                prop_assert_eq!(a.timestamp, UnixTimeMs(expected_start + offset as u64));
            }
        }
    }
}
