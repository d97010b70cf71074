//! Facade bundling the guard and executors over one shared catalog.

use std::sync::Arc;

use crate::error::TransitionError;
use crate::executor::{BatchResult, BulkOptions, BulkTransitionExecutor, SingleTransitionExecutor};
use crate::menu::{MenuEntry, StatusMenuBuilder};
use crate::ports::{AccessCache, AuditPort, Authorizer, RecordStore, StateFormatter, Stateful, TransitionHooks};
use crate::state_machine::{Decision, StateId, TransitionCatalog, TransitionGuard};

/// Entry point for callers: evaluates, executes and lists state changes.
///
/// Cheap to share behind an `Arc`; it holds no per-request state.
pub struct TransitionEngine {
    guard: TransitionGuard,
    executor: SingleTransitionExecutor,
}

impl TransitionEngine {
    pub fn new(catalog: Arc<TransitionCatalog>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            guard: TransitionGuard::new(catalog, authorizer),
            executor: SingleTransitionExecutor::new(),
        }
    }

    pub fn with_formatter(mut self, formatter: Arc<dyn StateFormatter>) -> Self {
        self.guard = self.guard.with_formatter(formatter);
        self
    }

    /// Capability required for every transition, on top of each edge's own.
    pub fn with_modify_capability(mut self, capability: Option<String>) -> Self {
        self.guard = self.guard.with_modify_capability(capability);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn TransitionHooks>) -> Self {
        self.executor = self.executor.with_hooks(hooks);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditPort>) -> Self {
        self.executor = self.executor.with_audit(audit);
        self
    }

    pub fn catalog(&self) -> &TransitionCatalog {
        self.guard.catalog()
    }

    pub fn guard(&self) -> &TransitionGuard {
        &self.guard
    }

    /// See [`TransitionGuard::evaluate`]. Each call gets a fresh access cache.
    pub fn evaluate(
        &self,
        record: &dyn Stateful,
        source: &StateId,
        target: Option<&StateId>,
        confirmed: bool,
    ) -> Result<Decision, TransitionError> {
        self.guard
            .evaluate(record, source, target, confirmed, &mut AccessCache::new())
    }

    pub fn execute_single<S: RecordStore + ?Sized>(
        &self,
        store: &mut S,
        record: &mut S::Record,
        decision: &Decision,
    ) -> Result<bool, TransitionError> {
        self.executor.execute(store, record, decision)
    }

    pub fn execute_bulk<S: RecordStore + ?Sized>(
        &self,
        store: &mut S,
        selection: &S::Selection,
        target: &StateId,
        options: BulkOptions,
    ) -> Result<BatchResult, TransitionError> {
        BulkTransitionExecutor::new(&self.guard, &self.executor).execute(store, selection, target, options)
    }

    pub fn list_available_transitions(&self, record: &dyn Stateful) -> Vec<MenuEntry> {
        StatusMenuBuilder::new(&self.guard).list_available_transitions(record)
    }

    /// The notice to show once `record` has left `source`: the post label of
    /// the edge it took.
    pub fn success_notice(&self, source: &StateId, record: &dyn Stateful) -> Option<String> {
        self.catalog()
            .find(source, record.state())
            .map(|transition| transition.post_label.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TransactionMode;
    use crate::memory::{CapabilityTable, MemoryRecord, MemorySelection, MemoryStore};
    use crate::state_machine::{StateDefinition, Transition};

    fn engine(authorizer: CapabilityTable) -> TransitionEngine {
        let states = vec![
            StateDefinition {
                post_label: Some("Submitted for review".into()),
                ..StateDefinition::new("pending")
            },
            StateDefinition::new("draft"),
            StateDefinition::new("approved"),
        ];
        let transitions = Transition::from_states(&states)
            .into_iter()
            .map(|t| match (t.source_state.as_str(), t.target_state.as_str()) {
                ("draft", "pending") => t.with_auth_item("submit"),
                ("pending", "approved") => t.with_auth_item("approve"),
                _ => t,
            })
            .collect();
        TransitionEngine::new(
            Arc::new(TransitionCatalog::new(transitions).unwrap()),
            Arc::new(authorizer),
        )
    }

    #[test]
    fn granted_submit_moves_draft_to_pending() {
        let engine = engine(CapabilityTable::new().grant("submit"));
        let mut record = MemoryRecord::new("1", "draft");
        let mut store = MemoryStore::new(vec![record.clone()]);
        let source = record.state.clone();

        let decision = engine
            .evaluate(&record, &source, Some(&StateId::from("pending")), true)
            .unwrap();
        assert!(decision.is_executable());

        assert!(engine.execute_single(&mut store, &mut record, &decision).unwrap());
        assert_eq!(record.state, StateId::from("pending"));
        assert_eq!(store.get("1").unwrap().state, StateId::from("pending"));
        assert_eq!(
            engine.success_notice(&source, &record).as_deref(),
            Some("Submitted for review")
        );
    }

    #[test]
    fn business_rule_blocks_approval_from_draft() {
        let engine = engine(CapabilityTable::allow_by_default());
        let record = MemoryRecord::new("1", "draft").blocking("approved");

        let err = engine
            .evaluate(&record, &record.state, Some(&StateId::from("approved")), true)
            .unwrap_err();
        assert!(matches!(err, TransitionError::TransitionNotAllowed { .. }));
        assert_eq!(
            err.to_string(),
            "You cannot change state from draft to approved because such state transition is not allowed."
        );
    }

    #[test]
    fn bulk_and_menu_share_the_catalog() {
        let engine = engine(CapabilityTable::new().grant("approve"));
        let mut store = MemoryStore::new(vec![
            MemoryRecord::new("1", "pending"),
            MemoryRecord::new("2", "pending"),
        ]);

        let result = engine
            .execute_bulk(
                &mut store,
                &MemorySelection::All,
                &StateId::from("approved"),
                BulkOptions {
                    transaction: TransactionMode::AllOrNothing,
                    single_query: false,
                },
            )
            .unwrap();
        assert!(result.is_complete_success());

        let menu = engine.list_available_transitions(store.get("1").unwrap());
        let targets: Vec<&str> = menu.iter().map(|e| e.target_state.as_str()).collect();
        assert_eq!(targets, ["pending", "draft"]);
    }

    #[test]
    fn notice_is_absent_without_an_edge() {
        let engine = engine(CapabilityTable::allow_by_default());
        let record = MemoryRecord::new("1", "draft");
        assert_eq!(engine.success_notice(&StateId::from("draft"), &record), None);
    }
}
