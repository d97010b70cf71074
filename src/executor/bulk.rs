use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::TransitionError;
use crate::ports::{AccessCache, RecordKey, RecordStore, Stateful, Transaction};
use crate::state_machine::{Decision, StateId, Transition, TransitionGuard};

use super::single::SingleTransitionExecutor;

/// How a batch is bracketed by store transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMode {
    /// Every record is saved in its own transaction.
    #[default]
    PerRecord,
    /// One transaction spans the batch and is committed once at the end,
    /// keeping whatever succeeded even if other records failed. This is a
    /// best-effort batched commit, not an atomic batch.
    BatchedCommit,
    /// One transaction spans the batch; a single failure rolls back all of it.
    AllOrNothing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOptions {
    pub transaction: TransactionMode,
    /// Apply the change with one statement over the whole selection. Not
    /// supported; requesting it fails the batch.
    pub single_query: bool,
}

/// A record that could not be transitioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub key: RecordKey,
    pub label: String,
    pub message: String,
}

/// Outcome of one bulk call. `succeeded + failed + skipped == total`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub total: usize,
    pub succeeded: Vec<RecordKey>,
    pub failed: Vec<BatchFailure>,
    /// Records the principal may not transition, or already in the target state.
    pub skipped: Vec<RecordKey>,
    /// Set when an all-or-nothing batch was undone.
    pub rolled_back: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl BatchResult {
    fn start(total: usize, started_at: DateTime<Utc>) -> Self {
        Self {
            total,
            succeeded: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            rolled_back: false,
            started_at,
            completed_at: started_at,
        }
    }

    fn finish(mut self) -> Self {
        self.completed_at = Utc::now();
        self
    }

    pub fn is_complete_success(&self) -> bool {
        self.succeeded.len() == self.total
    }

    pub fn summary(&self) -> String {
        format!(
            "{} out of {} records have been successfully updated.",
            self.succeeded.len(),
            self.total
        )
    }
}

/// Applies one transition across a selection of records sharing a source
/// state, one record at a time.
pub struct BulkTransitionExecutor<'a> {
    guard: &'a TransitionGuard,
    executor: &'a SingleTransitionExecutor,
}

impl<'a> BulkTransitionExecutor<'a> {
    pub fn new(guard: &'a TransitionGuard, executor: &'a SingleTransitionExecutor) -> Self {
        Self { guard, executor }
    }

    /// Moves every selected record into `target`.
    ///
    /// Fails before touching any record when the selection spans several
    /// states, when the shared state has no edge to `target` or its business
    /// rule refuses it, or when `single_query` is requested. Past that point
    /// per-record problems never abort the batch: denied records are skipped,
    /// records failing validation or storage are reported as failed.
    pub fn execute<S: RecordStore + ?Sized>(
        &self,
        store: &mut S,
        selection: &S::Selection,
        target: &StateId,
        options: BulkOptions,
    ) -> Result<BatchResult, TransitionError> {
        let started_at = Utc::now();
        let states = store.distinct_states(selection)?;
        let source = match states.as_slice() {
            [] => return Ok(BatchResult::start(0, started_at).finish()),
            [only] => only.clone(),
            _ => {
                return Err(TransitionError::AmbiguousSourceState {
                    states: states
                        .iter()
                        .map(|s| self.guard.formatter().format(s))
                        .collect(),
                });
            }
        };

        let prototype = store.prototype(&source);
        let transition = if *target == source {
            None
        } else {
            Some(self.guard.check_edge(&prototype, &source, target)?.clone())
        };

        if options.single_query {
            return Err(TransitionError::NotImplemented(
                "the single-query bulk mode has not been implemented",
            ));
        }

        let records = store.find(selection)?;
        let mut result = BatchResult::start(records.len(), started_at);

        let Some(transition) = transition else {
            debug!(state = %source, "selection already in target state");
            result.skipped = records.iter().map(|r| r.key()).collect();
            return Ok(result.finish());
        };

        let mut run = Run {
            source: &source,
            transition: &transition,
            cache: AccessCache::new(),
            result,
            labels: Vec::new(),
        };

        match options.transaction {
            TransactionMode::PerRecord => {
                for record in records {
                    self.run_record(store, record, &mut run, false);
                }
            }
            mode @ (TransactionMode::BatchedCommit | TransactionMode::AllOrNothing) => {
                let mut trx = Transaction::begin(store)?;
                for record in records {
                    self.run_record(trx.store(), record, &mut run, true);
                }

                if mode == TransactionMode::AllOrNothing && !run.result.failed.is_empty() {
                    trx.rollback()?;
                    run.roll_back();
                } else {
                    trx.commit()?;
                }
            }
        }

        let result = run.result.finish();
        info!(
            source = %source,
            target = %target,
            total = result.total,
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            skipped = result.skipped.len(),
            rolled_back = result.rolled_back,
            "bulk transition finished"
        );
        Ok(result)
    }

    /// With `batched` the record is applied inside the batch's transaction
    /// instead of its own. Audited records get their own changeset either way.
    fn run_record<S: RecordStore + ?Sized>(
        &self,
        store: &mut S,
        mut record: S::Record,
        run: &mut Run<'_>,
        batched: bool,
    ) {
        let key = record.key();
        if !self.guard.is_authorized(&record, run.transition, &mut run.cache) {
            debug!(record = %key, "record skipped: access denied");
            run.result.skipped.push(key);
            return;
        }

        let decision = self.guard.evaluate(
            &record,
            run.source,
            Some(&run.transition.target_state),
            true,
            &mut run.cache,
        );
        let outcome = match decision {
            Ok(Decision::Proceed { .. }) if batched => {
                let changeset = self.executor.open_changeset(&record);
                self.executor
                    .apply(store, &mut record, run.transition, changeset.as_ref())
            }
            Ok(decision @ Decision::Proceed { .. }) => {
                self.executor.execute(store, &mut record, &decision)
            }
            Ok(Decision::AlreadyChanged { .. }) | Err(TransitionError::Authorization { .. }) => {
                run.result.skipped.push(key);
                return;
            }
            Ok(Decision::ListTransitions(_)) => Err(TransitionError::NotExecutable(
                "no target state was requested".to_string(),
            )),
            Err(err) => Err(err),
        };

        match outcome {
            Ok(true) => {
                run.labels.push(record.label());
                run.result.succeeded.push(key);
            }
            Ok(false) => run.fail(key, record.label(), "Vetoed before saving.".to_string()),
            Err(err) => {
                warn!(record = %key, error = %err, "record failed");
                run.fail(key, record.label(), err.to_string());
            }
        }
    }
}

/// Mutable state of one bulk call.
struct Run<'r> {
    source: &'r StateId,
    transition: &'r Transition,
    cache: AccessCache,
    result: BatchResult,
    /// Labels of `result.succeeded`, index-aligned.
    labels: Vec<String>,
}

impl Run<'_> {
    fn fail(&mut self, key: RecordKey, label: String, message: String) {
        self.result.failed.push(BatchFailure {
            key,
            label,
            message,
        });
    }

    /// Reclassifies every succeeded record as failed after a rollback.
    fn roll_back(&mut self) {
        let message = format!(
            "Rolled back: {} other record(s) failed.",
            self.result.failed.len()
        );
        let succeeded = std::mem::take(&mut self.result.succeeded);
        let labels = std::mem::take(&mut self.labels);
        for (key, label) in succeeded.into_iter().zip(labels) {
            self.fail(key, label, message.clone());
        }
        self.result.rolled_back = true;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memory::{CapabilityTable, MemoryAudit, MemoryRecord, MemorySelection, MemoryStore};
    use crate::state_machine::{StateDefinition, TransitionCatalog};

    fn catalog() -> Arc<TransitionCatalog> {
        let states: Vec<StateDefinition> = ["draft", "pending", "approved"]
            .into_iter()
            .map(StateDefinition::new)
            .collect();
        let transitions = Transition::from_states(&states)
            .into_iter()
            .map(|t| match (t.source_state.as_str(), t.target_state.as_str()) {
                ("pending", "approved") => t.with_auth_item("approve"),
                _ => t,
            })
            .collect();
        Arc::new(TransitionCatalog::new(transitions).unwrap())
    }

    fn pending(n: usize) -> MemoryStore {
        MemoryStore::new(
            (1..=n)
                .map(|i| MemoryRecord::new(&i.to_string(), "pending"))
                .collect(),
        )
    }

    fn run(
        authorizer: CapabilityTable,
        store: &mut MemoryStore,
        target: &str,
        options: BulkOptions,
    ) -> Result<BatchResult, TransitionError> {
        let guard = TransitionGuard::new(catalog(), Arc::new(authorizer));
        let executor = SingleTransitionExecutor::new();
        BulkTransitionExecutor::new(&guard, &executor).execute(
            store,
            &MemorySelection::All,
            &StateId::from(target),
            options,
        )
    }

    fn assert_tally(result: &BatchResult) {
        assert_eq!(
            result.succeeded.len() + result.failed.len() + result.skipped.len(),
            result.total
        );
    }

    #[test]
    fn denied_records_are_skipped() {
        let mut store = pending(5);
        let authorizer = CapabilityTable::new()
            .grant("approve")
            .deny_for("approve", "2")
            .deny_for("approve", "4");

        let result = run(authorizer, &mut store, "approved", BulkOptions::default()).unwrap();

        assert_eq!(result.total, 5);
        assert_eq!(result.succeeded.len(), 3);
        assert_eq!(result.failed.len(), 0);
        assert_eq!(result.skipped, vec![RecordKey::from("2"), RecordKey::from("4")]);
        assert_tally(&result);
        assert_eq!(store.get("1").unwrap().state, StateId::from("approved"));
        assert_eq!(store.get("2").unwrap().state, StateId::from("pending"));
        assert_eq!(store.stats().commits, 3);
        assert_eq!(result.summary(), "3 out of 5 records have been successfully updated.");
    }

    #[test]
    fn authorization_is_memoized_per_record() {
        let mut store = pending(4);
        let authorizer = Arc::new(CapabilityTable::new().grant("approve"));
        let guard = TransitionGuard::new(catalog(), authorizer.clone())
            .with_modify_capability(Some("approve".into()));
        let executor = SingleTransitionExecutor::new();

        BulkTransitionExecutor::new(&guard, &executor)
            .execute(
                &mut store,
                &MemorySelection::All,
                &StateId::from("approved"),
                BulkOptions::default(),
            )
            .unwrap();

        assert_eq!(authorizer.lookups(), 4);
    }

    #[test]
    fn mixed_source_states_touch_nothing() {
        let mut store = MemoryStore::new(vec![
            MemoryRecord::new("1", "draft"),
            MemoryRecord::new("2", "pending"),
        ]);

        let err = run(
            CapabilityTable::allow_by_default(),
            &mut store,
            "approved",
            BulkOptions::default(),
        )
        .unwrap_err();

        assert!(matches!(err, TransitionError::AmbiguousSourceState { .. }));
        assert_eq!(store.get("1").unwrap().state, StateId::from("draft"));
        assert_eq!(store.get("2").unwrap().state, StateId::from("pending"));
        assert_eq!(store.stats().saves, 0);
    }

    #[test]
    fn single_query_is_not_implemented() {
        let mut store = pending(3);
        let options = BulkOptions {
            single_query: true,
            ..BulkOptions::default()
        };

        let err = run(CapabilityTable::allow_by_default(), &mut store, "approved", options)
            .unwrap_err();

        assert_eq!(err.kind(), "not_implemented");
        assert_eq!(store.stats().saves, 0);
        assert!(!store.in_transaction());
    }

    #[test]
    fn undefined_edge_fails_the_whole_batch() {
        let states = vec![StateDefinition::new("pending"), StateDefinition::new("approved")];
        let catalog = Arc::new(
            TransitionCatalog::new(vec![Transition::between(&states[1], &states[0])]).unwrap(),
        );
        let guard = TransitionGuard::new(catalog, Arc::new(CapabilityTable::allow_by_default()));
        let executor = SingleTransitionExecutor::new();
        let mut store = pending(2);

        let err = BulkTransitionExecutor::new(&guard, &executor)
            .execute(
                &mut store,
                &MemorySelection::All,
                &StateId::from("approved"),
                BulkOptions::default(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");
        assert_eq!(store.stats().saves, 0);
    }

    #[test]
    fn prototype_rule_refusal_fails_the_whole_batch() {
        let mut store = pending(2);
        store.prototype_blocked.push(StateId::from("approved"));

        let err = run(
            CapabilityTable::allow_by_default(),
            &mut store,
            "approved",
            BulkOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "transition_not_allowed");
        assert_eq!(store.stats().saves, 0);
    }

    #[test]
    fn per_record_failures_do_not_abort() {
        let mut store = MemoryStore::new(vec![
            MemoryRecord::new("1", "pending"),
            MemoryRecord::new("2", "pending").requiring("approved", "notes"),
            MemoryRecord::new("3", "pending").blocking("approved"),
            MemoryRecord::new("4", "pending"),
        ]);

        let result = run(
            CapabilityTable::allow_by_default(),
            &mut store,
            "approved",
            BulkOptions::default(),
        )
        .unwrap();

        assert_eq!(result.succeeded, vec![RecordKey::from("1"), RecordKey::from("4")]);
        assert_eq!(result.failed.len(), 2);
        assert_eq!(result.failed[0].label, "#2");
        assert!(result.failed[0].message.contains("notes: cannot be blank"));
        assert!(result.failed[1].message.contains("not allowed"));
        assert_tally(&result);
    }

    #[test]
    fn batched_commit_keeps_partial_success() {
        let mut store = pending(3);
        store.break_record("2");
        let options = BulkOptions {
            transaction: TransactionMode::BatchedCommit,
            ..BulkOptions::default()
        };

        let result = run(CapabilityTable::allow_by_default(), &mut store, "approved", options).unwrap();

        assert_eq!(result.succeeded.len(), 2);
        assert_eq!(result.failed.len(), 1);
        assert!(!result.rolled_back);
        assert_eq!(store.stats().commits, 1);
        assert_eq!(store.get("1").unwrap().state, StateId::from("approved"));
        assert_eq!(store.get("3").unwrap().state, StateId::from("approved"));
        assert_eq!(store.get("2").unwrap().state, StateId::from("pending"));
    }

    #[test]
    fn all_or_nothing_rolls_back_on_any_failure() {
        let mut store = pending(3);
        store.break_record("2");
        let options = BulkOptions {
            transaction: TransactionMode::AllOrNothing,
            ..BulkOptions::default()
        };

        let result = run(CapabilityTable::allow_by_default(), &mut store, "approved", options).unwrap();

        assert!(result.rolled_back);
        assert!(result.succeeded.is_empty());
        assert_eq!(result.failed.len(), 3);
        assert_tally(&result);
        assert_eq!(store.stats().rollbacks, 1);
        assert!(store.records().iter().all(|r| r.state == StateId::from("pending")));
    }

    #[test]
    fn all_or_nothing_commits_clean_batch() {
        let mut store = pending(3);
        let options = BulkOptions {
            transaction: TransactionMode::AllOrNothing,
            ..BulkOptions::default()
        };

        let result = run(CapabilityTable::allow_by_default(), &mut store, "approved", options).unwrap();

        assert!(result.is_complete_success());
        assert_eq!(store.stats().commits, 1);
    }

    fn audited(n: usize) -> MemoryStore {
        MemoryStore::new(
            (1..=n)
                .map(|i| MemoryRecord::new(&i.to_string(), "pending").audited())
                .collect(),
        )
    }

    fn run_audited(
        store: &mut MemoryStore,
        audit: &Arc<MemoryAudit>,
        transaction: TransactionMode,
    ) -> BatchResult {
        let guard = TransitionGuard::new(catalog(), Arc::new(CapabilityTable::allow_by_default()));
        let executor = SingleTransitionExecutor::new().with_audit(audit.clone());
        BulkTransitionExecutor::new(&guard, &executor)
            .execute(
                store,
                &MemorySelection::All,
                &StateId::from("approved"),
                BulkOptions {
                    transaction,
                    ..BulkOptions::default()
                },
            )
            .unwrap()
    }

    #[test]
    fn audited_records_get_a_changeset_in_every_mode() {
        for mode in [
            TransactionMode::PerRecord,
            TransactionMode::BatchedCommit,
            TransactionMode::AllOrNothing,
        ] {
            let mut store = audited(3);
            let audit = Arc::new(MemoryAudit::new());

            let result = run_audited(&mut store, &audit, mode);

            assert_eq!(result.succeeded.len(), 3, "{mode:?}");
            let changesets = audit.changesets();
            assert_eq!(changesets.len(), 3, "{mode:?}");
            assert_eq!(audit.open_count(), 0, "{mode:?}");
            for (changeset, key) in changesets.iter().zip(["1", "2", "3"]) {
                assert_eq!(changeset.record, RecordKey::from(key));
                assert_eq!(changeset.transitions.len(), 1);
                assert_eq!(changeset.transitions[0].record, RecordKey::from(key));
                assert_eq!(
                    changeset.transitions[0].target_state,
                    StateId::from("approved")
                );
            }
        }
    }

    #[test]
    fn batched_failure_still_closes_the_changeset() {
        let mut store = audited(2);
        store.break_record("2");
        let audit = Arc::new(MemoryAudit::new());

        let result = run_audited(&mut store, &audit, TransactionMode::BatchedCommit);

        assert_eq!(result.failed.len(), 1);
        let changesets = audit.changesets();
        assert_eq!(changesets.len(), 2);
        assert_eq!(audit.open_count(), 0);
        assert!(changesets[1].transitions.is_empty());
    }

    #[test]
    fn untracked_records_open_no_changeset() {
        let mut store = pending(3);
        let audit = Arc::new(MemoryAudit::new());

        run_audited(&mut store, &audit, TransactionMode::BatchedCommit);

        assert!(audit.changesets().is_empty());
    }

    #[test]
    fn empty_selection_is_an_empty_result() {
        let mut store = pending(0);
        let result = run(
            CapabilityTable::allow_by_default(),
            &mut store,
            "approved",
            BulkOptions::default(),
        )
        .unwrap();
        assert_eq!(result.total, 0);
        assert_tally(&result);
    }

    #[test]
    fn selection_already_in_target_is_skipped() {
        let mut store = pending(2);
        let result = run(
            CapabilityTable::allow_by_default(),
            &mut store,
            "pending",
            BulkOptions::default(),
        )
        .unwrap();
        assert_eq!(result.skipped.len(), 2);
        assert_eq!(store.stats().saves, 0);
        assert_tally(&result);
    }
}
