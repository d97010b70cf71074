//! In-memory adapters for the ports: a record type, a transactional store,
//! a capability table and an audit log. The CLI demo and the tests run on
//! these.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FieldError, StoreError, ValidationErrors};
use crate::ports::{
    AuditPort, Authorizer, ChangesetId, RecordKey, RecordStore, Stateful, ValidationScope,
    distinct_states,
};
use crate::state_machine::{StateId, Transition};

/// A record held by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub key: RecordKey,
    pub label: String,
    pub state: StateId,
    /// Free-text attributes, validated against a transition's required list.
    pub attributes: HashMap<String, String>,
    /// Target states this record's business rule refuses.
    pub blocked_targets: Vec<StateId>,
    /// Attributes required when moving into a given state.
    pub required_for: HashMap<StateId, Vec<String>>,
    pub audited: bool,
}

impl MemoryRecord {
    pub fn new(key: &str, state: &str) -> Self {
        Self {
            key: RecordKey::from(key),
            label: format!("#{key}"),
            state: StateId::from(state),
            attributes: HashMap::new(),
            blocked_targets: Vec::new(),
            required_for: HashMap::new(),
            audited: false,
        }
    }

    pub fn blocking(mut self, target: &str) -> Self {
        self.blocked_targets.push(StateId::from(target));
        self
    }

    pub fn requiring(mut self, target: &str, attribute: &str) -> Self {
        self.required_for
            .entry(StateId::from(target))
            .or_default()
            .push(attribute.to_string());
        self
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    pub fn audited(mut self) -> Self {
        self.audited = true;
        self
    }
}

impl Stateful for MemoryRecord {
    fn key(&self) -> RecordKey {
        self.key.clone()
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn state(&self) -> &StateId {
        &self.state
    }

    fn set_state(&mut self, state: StateId) {
        self.state = state;
    }

    fn is_transition_allowed(&self, target: &StateId) -> bool {
        !self.blocked_targets.contains(target)
    }

    fn apply_transition_rules(&mut self, target: &StateId) -> ValidationScope {
        let mut scope = ValidationScope::transition();
        if let Some(required) = self.required_for.get(target) {
            scope.required.extend(required.iter().cloned());
        }
        scope
    }

    fn tracks_changes(&self) -> bool {
        self.audited
    }
}

/// Which records a bulk operation targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemorySelection {
    All,
    Keys(Vec<RecordKey>),
}

impl MemorySelection {
    pub fn keys(keys: &[&str]) -> Self {
        MemorySelection::Keys(keys.iter().map(|k| RecordKey::from(*k)).collect())
    }

    fn matches(&self, record: &MemoryRecord) -> bool {
        match self {
            MemorySelection::All => true,
            MemorySelection::Keys(keys) => keys.contains(&record.key),
        }
    }
}

/// Counters of what a [`MemoryStore`] was asked to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub saves: usize,
    pub commits: usize,
    pub rollbacks: usize,
}

/// Ordered record table with snapshot-based transactions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Vec<MemoryRecord>,
    snapshot: Option<Vec<MemoryRecord>>,
    /// Records whose save fails with a backend error.
    broken: HashSet<RecordKey>,
    /// Blocked targets applied to prototypes, i.e. the business rule every
    /// record of this table shares.
    pub prototype_blocked: Vec<StateId>,
    stats: StoreStats,
}

impl MemoryStore {
    pub fn new(records: Vec<MemoryRecord>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    pub fn get(&self, key: &str) -> Option<&MemoryRecord> {
        self.records.iter().find(|r| r.key.as_str() == key)
    }

    pub fn records(&self) -> &[MemoryRecord] {
        &self.records
    }

    /// Makes every save of `key` fail as if the backend were down.
    pub fn break_record(&mut self, key: &str) {
        self.broken.insert(RecordKey::from(key));
    }

    pub fn stats(&self) -> StoreStats {
        self.stats
    }

    pub fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }
}

impl RecordStore for MemoryStore {
    type Record = MemoryRecord;
    type Selection = MemorySelection;

    fn find(&self, selection: &MemorySelection) -> Result<Vec<MemoryRecord>, StoreError> {
        Ok(self
            .records
            .iter()
            .filter(|r| selection.matches(r))
            .cloned()
            .collect())
    }

    fn distinct_states(&self, selection: &MemorySelection) -> Result<Vec<StateId>, StoreError> {
        Ok(distinct_states(
            self.records
                .iter()
                .filter(|r| selection.matches(r))
                .map(|r| &r.state),
        ))
    }

    fn prototype(&self, state: &StateId) -> MemoryRecord {
        MemoryRecord {
            label: String::new(),
            state: state.clone(),
            blocked_targets: self.prototype_blocked.clone(),
            ..MemoryRecord::new("", state.as_str())
        }
    }

    fn save(&mut self, record: &MemoryRecord, scope: &ValidationScope) -> Result<(), StoreError> {
        if self.broken.contains(&record.key) {
            return Err(StoreError::Backend(format!(
                "write to record {} failed",
                record.key
            )));
        }

        let missing: Vec<FieldError> = scope
            .required
            .iter()
            .filter(|attribute| {
                record
                    .attributes
                    .get(attribute.as_str())
                    .is_none_or(|value| value.trim().is_empty())
            })
            .map(|attribute| FieldError {
                field: attribute.clone(),
                message: "cannot be blank".to_string(),
            })
            .collect();
        if !missing.is_empty() {
            return Err(StoreError::Validation(ValidationErrors(missing)));
        }

        let slot = self
            .records
            .iter_mut()
            .find(|r| r.key == record.key)
            .ok_or_else(|| StoreError::NotFound(record.key.to_string()))?;
        *slot = record.clone();
        self.stats.saves += 1;
        Ok(())
    }

    fn begin_transaction(&mut self) -> Result<(), StoreError> {
        if self.snapshot.is_some() {
            return Err(StoreError::Backend("transaction already open".to_string()));
        }
        self.snapshot = Some(self.records.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.snapshot
            .take()
            .ok_or_else(|| StoreError::Backend("no open transaction".to_string()))?;
        self.stats.commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        let snapshot = self
            .snapshot
            .take()
            .ok_or_else(|| StoreError::Backend("no open transaction".to_string()))?;
        self.records = snapshot;
        self.stats.rollbacks += 1;
        Ok(())
    }
}

/// Capability grants held in memory, globally or per record.
#[derive(Debug, Default)]
pub struct CapabilityTable {
    grant_by_default: bool,
    granted: HashSet<String>,
    revoked: HashSet<String>,
    denied_for: HashSet<(String, RecordKey)>,
    lookups: AtomicUsize,
}

impl CapabilityTable {
    /// Grants nothing until told otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants every capability not explicitly revoked or denied.
    pub fn allow_by_default() -> Self {
        Self {
            grant_by_default: true,
            ..Self::default()
        }
    }

    pub fn grant(mut self, capability: &str) -> Self {
        self.granted.insert(capability.to_string());
        self
    }

    pub fn revoke(mut self, capability: &str) -> Self {
        self.revoked.insert(capability.to_string());
        self
    }

    pub fn deny_for(mut self, capability: &str, record: &str) -> Self {
        self.denied_for
            .insert((capability.to_string(), RecordKey::from(record)));
        self
    }

    /// How many times `can` has been called.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl Authorizer for CapabilityTable {
    fn can(&self, capability: &str, record: &dyn Stateful) -> bool {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.revoked.contains(capability)
            || self
                .denied_for
                .contains(&(capability.to_string(), record.key()))
        {
            return false;
        }
        self.grant_by_default || self.granted.contains(capability)
    }
}

/// One performed change, as logged into a changeset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformedTransition {
    pub record: RecordKey,
    pub source_state: StateId,
    pub target_state: StateId,
    pub performed_on: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesetEntry {
    pub id: ChangesetId,
    pub record: RecordKey,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub transitions: Vec<PerformedTransition>,
}

/// Audit log keeping every changeset in memory.
#[derive(Debug, Default)]
pub struct MemoryAudit {
    changesets: Mutex<Vec<ChangesetEntry>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn changesets(&self) -> Vec<ChangesetEntry> {
        self.lock().clone()
    }

    /// Changesets opened but not yet closed.
    pub fn open_count(&self) -> usize {
        self.lock().iter().filter(|c| c.closed_at.is_none()).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ChangesetEntry>> {
        self.changesets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl AuditPort for MemoryAudit {
    fn begin_changeset(&self, record: &dyn Stateful) -> ChangesetId {
        let id = ChangesetId::new();
        self.lock().push(ChangesetEntry {
            id,
            record: record.key(),
            opened_at: Utc::now(),
            closed_at: None,
            transitions: Vec::new(),
        });
        id
    }

    fn end_changeset(&self, changeset: ChangesetId) {
        if let Some(entry) = self.lock().iter_mut().find(|c| c.id == changeset) {
            entry.closed_at = Some(Utc::now());
        }
    }

    fn record_transition(&self, changeset: ChangesetId, record: &RecordKey, transition: &Transition) {
        if let Some(entry) = self.lock().iter_mut().find(|c| c.id == changeset) {
            entry.transitions.push(PerformedTransition {
                record: record.clone(),
                source_state: transition.source_state.clone(),
                target_state: transition.target_state.clone(),
                performed_on: Utc::now(),
            });
        }
    }
}
