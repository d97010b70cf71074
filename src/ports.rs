//! Contracts the engine needs from the systems around it.
//!
//! Records expose their lifecycle through [`Stateful`]; persistence goes
//! through a [`RecordStore`]; permissions through an [`Authorizer`]; change
//! tracking through an optional [`AuditPort`]. [`Transaction`] and
//! [`Changeset`] are scope guards that always release what they opened.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::{StoreError, TransitionError};
use crate::state_machine::{StateDefinition, StateId, Transition};

/// Validation scenario used while persisting a state change.
pub const TRANSITION_SCENARIO: &str = "transition";

/// Primary-key identity of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(String);

impl RecordKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// The subset of a record's rules that applies when saving a transition,
/// rather than the full record schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationScope {
    pub scenario: String,
    /// Attributes that must be present for this transition.
    pub required: Vec<String>,
}

impl ValidationScope {
    pub fn transition() -> Self {
        Self {
            scenario: TRANSITION_SCENARIO.to_string(),
            required: Vec::new(),
        }
    }

    pub fn requiring(mut self, attribute: impl Into<String>) -> Self {
        self.required.push(attribute.into());
        self
    }
}

impl Default for ValidationScope {
    fn default() -> Self {
        Self::transition()
    }
}

/// A record with a lifecycle attribute.
pub trait Stateful {
    fn key(&self) -> RecordKey;

    /// Label used in batch failure reports.
    fn label(&self) -> String {
        self.key().to_string()
    }

    fn state(&self) -> &StateId;

    fn set_state(&mut self, state: StateId);

    /// Business rule: may this record move into `target`? Checked after the
    /// graph and authorization checks pass.
    fn is_transition_allowed(&self, _target: &StateId) -> bool {
        true
    }

    /// Rules to validate when saving a move into `target`.
    fn apply_transition_rules(&mut self, _target: &StateId) -> ValidationScope {
        ValidationScope::transition()
    }

    /// Records that opt in get their changes bracketed by an audit changeset.
    fn tracks_changes(&self) -> bool {
        false
    }
}

/// Persistence for one record type.
pub trait RecordStore {
    type Record: Stateful;
    type Selection: ?Sized;

    fn find(&self, selection: &Self::Selection) -> Result<Vec<Self::Record>, StoreError>;

    /// Distinct current states across the selection, in first-seen order.
    fn distinct_states(&self, selection: &Self::Selection) -> Result<Vec<StateId>, StoreError>;

    /// A blank record carrying only `state`, used to check a batch once
    /// before touching any real record.
    fn prototype(&self, state: &StateId) -> Self::Record;

    fn save(&mut self, record: &Self::Record, scope: &ValidationScope) -> Result<(), StoreError>;

    fn begin_transaction(&mut self) -> Result<(), StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;

    fn rollback(&mut self) -> Result<(), StoreError>;
}

/// An open store transaction. Dropping it without [`commit`](Self::commit)
/// rolls back.
pub struct Transaction<'s, S: RecordStore + ?Sized> {
    store: &'s mut S,
    open: bool,
}

impl<'s, S: RecordStore + ?Sized> Transaction<'s, S> {
    pub fn begin(store: &'s mut S) -> Result<Self, StoreError> {
        store.begin_transaction()?;
        Ok(Self { store, open: true })
    }

    pub fn store(&mut self) -> &mut S {
        &mut *self.store
    }

    pub fn commit(mut self) -> Result<(), StoreError> {
        self.open = false;
        if let Err(err) = self.store.commit() {
            if let Err(rollback_err) = self.store.rollback() {
                warn!(error = %rollback_err, "rollback after failed commit failed");
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn rollback(mut self) -> Result<(), StoreError> {
        self.open = false;
        self.store.rollback()
    }
}

impl<S: RecordStore + ?Sized> Drop for Transaction<'_, S> {
    fn drop(&mut self) {
        if self.open
            && let Err(err) = self.store.rollback()
        {
            warn!(error = %err, "implicit rollback failed");
        }
    }
}

/// Decides whether the current principal holds a capability for a record.
pub trait Authorizer: Send + Sync {
    fn can(&self, capability: &str, record: &dyn Stateful) -> bool;
}

/// Grants everything. This is the administrator policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn can(&self, _capability: &str, _record: &dyn Stateful) -> bool {
        true
    }
}

/// Narrows another authorizer: a capability listed here is only granted
/// while the record sits in one of its allowed states.
pub struct StateRule<A> {
    inner: A,
    allowed: HashMap<String, Vec<StateId>>,
}

impl<A: Authorizer> StateRule<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            allowed: HashMap::new(),
        }
    }

    pub fn allow_in(mut self, capability: impl Into<String>, states: &[StateId]) -> Self {
        self.allowed
            .entry(capability.into())
            .or_default()
            .extend(states.iter().cloned());
        self
    }
}

impl<A: Authorizer> Authorizer for StateRule<A> {
    fn can(&self, capability: &str, record: &dyn Stateful) -> bool {
        if !self.inner.can(capability, record) {
            return false;
        }
        self.allowed
            .get(capability)
            .is_none_or(|states| states.contains(record.state()))
    }
}

/// Memo of authorization answers for one run, keyed by capability and
/// record. Create one per operation; never share it between runs.
///
/// The record is part of the key because authorizers may answer per record
/// (a bulk run can deny some records and not others). Keying on the
/// capability alone would apply the first record's answer to the whole
/// batch; here the memo only saves repeated checks of the same record.
#[derive(Debug, Default)]
pub struct AccessCache {
    answers: HashMap<(String, RecordKey), bool>,
    lookups: usize,
}

impl AccessCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` or a blank capability is always granted without asking.
    pub fn check(
        &mut self,
        authorizer: &dyn Authorizer,
        capability: Option<&str>,
        record: &dyn Stateful,
    ) -> bool {
        let Some(capability) = capability.map(str::trim).filter(|c| !c.is_empty()) else {
            return true;
        };
        let key = (capability.to_string(), record.key());
        if let Some(&granted) = self.answers.get(&key) {
            return granted;
        }
        self.lookups += 1;
        let granted = authorizer.can(capability, record);
        self.answers.insert(key, granted);
        granted
    }

    /// How many times the authorizer was actually consulted.
    pub fn lookups(&self) -> usize {
        self.lookups
    }
}

/// Identity of an open audit changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangesetId(pub Uuid);

impl ChangesetId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChangesetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChangesetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Change tracking. Only engaged for records whose
/// [`Stateful::tracks_changes`] is true.
pub trait AuditPort: Send + Sync {
    fn begin_changeset(&self, record: &dyn Stateful) -> ChangesetId;

    fn end_changeset(&self, changeset: ChangesetId);

    /// Logs a performed transition inside an open changeset.
    fn record_transition(
        &self,
        _changeset: ChangesetId,
        _record: &RecordKey,
        _transition: &Transition,
    ) {
    }
}

/// An open changeset; closed on drop.
pub struct Changeset<'a> {
    audit: &'a dyn AuditPort,
    id: ChangesetId,
}

impl<'a> Changeset<'a> {
    pub fn open(audit: &'a dyn AuditPort, record: &dyn Stateful) -> Self {
        let id = audit.begin_changeset(record);
        Self { audit, id }
    }

    pub fn id(&self) -> ChangesetId {
        self.id
    }

    pub fn record(&self, record: &RecordKey, transition: &Transition) {
        self.audit.record_transition(self.id, record, transition);
    }
}

impl Drop for Changeset<'_> {
    fn drop(&mut self) {
        self.audit.end_changeset(self.id);
    }
}

/// Renders state values for messages. Never used for control flow.
pub trait StateFormatter: Send + Sync {
    fn format(&self, state: &StateId) -> String;
}

/// Prints the raw state id.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainFormatter;

impl StateFormatter for PlainFormatter {
    fn format(&self, state: &StateId) -> String {
        state.to_string()
    }
}

/// Uses the names declared alongside the states, falling back to the id.
#[derive(Debug, Clone, Default)]
pub struct CatalogFormatter {
    names: HashMap<StateId, String>,
}

impl CatalogFormatter {
    pub fn new(states: &[StateDefinition]) -> Self {
        let names = states
            .iter()
            .filter_map(|s| s.name.clone().map(|name| (s.id.clone(), name)))
            .collect();
        Self { names }
    }
}

impl StateFormatter for CatalogFormatter {
    fn format(&self, state: &StateId) -> String {
        self.names
            .get(state)
            .cloned()
            .unwrap_or_else(|| state.to_string())
    }
}

/// Extension points around a single state change.
pub trait TransitionHooks: Send + Sync {
    /// Runs after the new state is assigned and before it is saved. Returning
    /// `Ok(false)` vetoes the change; an error aborts it.
    fn before_transition(
        &self,
        _record: &dyn Stateful,
        _transition: &Transition,
    ) -> Result<bool, TransitionError> {
        Ok(true)
    }

    /// Side effects once the change has been saved.
    fn after_transition(&self, _record: &dyn Stateful, _transition: &Transition) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl TransitionHooks for NoHooks {}

/// Names of the states a set of records is currently in, deduplicated in
/// first-seen order.
pub fn distinct_states<'a>(states: impl IntoIterator<Item = &'a StateId>) -> Vec<StateId> {
    let mut seen = HashSet::new();
    states
        .into_iter()
        .filter(|s| seen.insert(*s))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Doc {
        key: &'static str,
        state: StateId,
    }

    impl Stateful for Doc {
        fn key(&self) -> RecordKey {
            RecordKey::from(self.key)
        }

        fn state(&self) -> &StateId {
            &self.state
        }

        fn set_state(&mut self, state: StateId) {
            self.state = state;
        }
    }

    struct Counting(AtomicUsize);

    impl Authorizer for Counting {
        fn can(&self, capability: &str, _record: &dyn Stateful) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            capability != "forbidden"
        }
    }

    fn doc(key: &'static str, state: &str) -> Doc {
        Doc {
            key,
            state: state.into(),
        }
    }

    #[test]
    fn cache_memoizes_per_capability_and_record() {
        let auth = Counting(AtomicUsize::new(0));
        let mut cache = AccessCache::new();
        let a = doc("1", "draft");
        let b = doc("2", "draft");

        assert!(cache.check(&auth, Some("submit"), &a));
        assert!(cache.check(&auth, Some("submit"), &a));
        assert!(!cache.check(&auth, Some("forbidden"), &a));
        assert!(!cache.check(&auth, Some("forbidden"), &a));
        assert!(cache.check(&auth, Some("submit"), &b));

        assert_eq!(auth.0.load(Ordering::SeqCst), 3);
        assert_eq!(cache.lookups(), 3);
    }

    #[test]
    fn missing_or_blank_capability_is_granted_without_lookup() {
        let auth = Counting(AtomicUsize::new(0));
        let mut cache = AccessCache::new();
        let a = doc("1", "draft");

        assert!(cache.check(&auth, None, &a));
        assert!(cache.check(&auth, Some("   "), &a));
        assert_eq!(cache.lookups(), 0);
    }

    #[test]
    fn state_rule_limits_capability_to_allowed_states() {
        let rule = StateRule::new(AllowAll).allow_in("approve", &["pending".into()]);

        assert!(rule.can("approve", &doc("1", "pending")));
        assert!(!rule.can("approve", &doc("1", "draft")));
        assert!(rule.can("submit", &doc("1", "draft")));
    }

    #[test]
    fn catalog_formatter_falls_back_to_id() {
        let states = vec![
            StateDefinition {
                name: Some("Draft".into()),
                ..StateDefinition::new("draft")
            },
            StateDefinition::new("pending"),
        ];
        let formatter = CatalogFormatter::new(&states);
        assert_eq!(formatter.format(&"draft".into()), "Draft");
        assert_eq!(formatter.format(&"pending".into()), "pending");
        assert_eq!(PlainFormatter.format(&"draft".into()), "draft");
    }

    #[test]
    fn distinct_states_keep_first_seen_order() {
        let states: Vec<StateId> = ["b", "a", "b", "c", "a"].into_iter().map(StateId::from).collect();
        let expected: Vec<StateId> = vec!["b".into(), "a".into(), "c".into()];
        assert_eq!(distinct_states(&states), expected);
    }
}
