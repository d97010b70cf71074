use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::TransitionError;
use crate::ports::{AuditPort, Changeset, NoHooks, RecordStore, Stateful, Transaction, TransitionHooks};
use crate::state_machine::{Decision, Transition};

/// Applies an approved decision to one record.
pub struct SingleTransitionExecutor {
    hooks: Arc<dyn TransitionHooks>,
    audit: Option<Arc<dyn AuditPort>>,
}

impl Default for SingleTransitionExecutor {
    fn default() -> Self {
        Self {
            hooks: Arc::new(NoHooks),
            audit: None,
        }
    }
}

impl SingleTransitionExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn TransitionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditPort>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Moves `record` along the transition carried by `decision`, inside one
    /// store transaction and, for audited records, one changeset.
    ///
    /// Returns `Ok(false)` when the before-hook vetoes the change. Anything
    /// but a confirmed [`Decision::Proceed`] is refused with
    /// [`TransitionError::NotExecutable`] before the store is touched; the
    /// decision itself is not re-validated.
    pub fn execute<S: RecordStore + ?Sized>(
        &self,
        store: &mut S,
        record: &mut S::Record,
        decision: &Decision,
    ) -> Result<bool, TransitionError> {
        let transition = executable(decision)?;

        let mut trx = Transaction::begin(store)?;
        let changeset = self.open_changeset(record);
        let applied = self.apply(trx.store(), record, transition, changeset.as_ref())?;
        drop(changeset);

        if !applied {
            trx.rollback()?;
            return Ok(false);
        }
        trx.commit()?;

        info!(
            record = %record.key(),
            source = %transition.source_state,
            target = %transition.target_state,
            "state changed"
        );
        Ok(true)
    }

    /// The changeset for `record`, when it tracks changes and an audit port
    /// is configured.
    pub(crate) fn open_changeset(&self, record: &dyn Stateful) -> Option<Changeset<'_>> {
        let audit = self.audit.as_deref()?;
        record
            .tracks_changes()
            .then(|| Changeset::open(audit, record))
    }

    /// Assigns the target state, runs the hooks and saves, without opening a
    /// transaction. On veto or failure the record gets its old state back.
    pub(crate) fn apply<S: RecordStore + ?Sized>(
        &self,
        store: &mut S,
        record: &mut S::Record,
        transition: &Transition,
        changeset: Option<&Changeset<'_>>,
    ) -> Result<bool, TransitionError> {
        let previous = record.state().clone();
        record.set_state(transition.target_state.clone());
        let scope = record.apply_transition_rules(&transition.target_state);

        let proceed = match self.hooks.before_transition(record, transition) {
            Ok(proceed) => proceed,
            Err(err) => {
                record.set_state(previous);
                return Err(err);
            }
        };
        if !proceed {
            debug!(record = %record.key(), target = %transition.target_state, "transition vetoed");
            record.set_state(previous);
            return Ok(false);
        }

        if let Err(err) = store.save(record, &scope) {
            warn!(record = %record.key(), error = %err, "saving transition failed");
            record.set_state(previous);
            return Err(err.into());
        }

        if let Some(changeset) = changeset {
            changeset.record(&record.key(), transition);
        }
        self.hooks.after_transition(record, transition);
        Ok(true)
    }
}

fn executable(decision: &Decision) -> Result<&Transition, TransitionError> {
    match decision {
        Decision::Proceed {
            transition,
            confirmed: true,
        } => Ok(transition),
        Decision::Proceed {
            confirmed: false, ..
        } => Err(TransitionError::NotExecutable(
            "transition has not been confirmed".to_string(),
        )),
        Decision::AlreadyChanged { .. } => Err(TransitionError::NotExecutable(
            "record is already in the requested state".to_string(),
        )),
        Decision::ListTransitions(_) => Err(TransitionError::NotExecutable(
            "no target state was requested".to_string(),
        )),
    }
}
