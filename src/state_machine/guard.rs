use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::error::TransitionError;
use crate::ports::{AccessCache, Authorizer, PlainFormatter, StateFormatter, Stateful};

use super::catalog::TransitionCatalog;
use super::transition::{StateId, Transition};

/// A transition offered to a record, annotated with whether it can be taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailableTransition {
    pub transition: Transition,
    /// The principal holds the transition's capability.
    pub authorized: bool,
    /// The record's business rule accepts the target state.
    pub valid: bool,
    /// `authorized && valid`.
    pub enabled: bool,
}

/// The result of evaluating a requested state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// No target was requested: the transitions to choose from, in display order.
    ListTransitions(Vec<AvailableTransition>),
    /// The record is already in the requested state. Nothing to do.
    AlreadyChanged { state: StateId, notice: String },
    /// The change may go ahead. With `confirmed == false` the caller should
    /// ask for confirmation and evaluate again with `confirmed = true`.
    Proceed {
        transition: Transition,
        confirmed: bool,
    },
}

impl Decision {
    /// Only a confirmed `Proceed` may be handed to an executor.
    pub fn is_executable(&self) -> bool {
        matches!(self, Decision::Proceed { confirmed: true, .. })
    }

    pub fn needs_confirmation(&self) -> bool {
        matches!(self, Decision::Proceed { confirmed: false, .. })
    }
}

/// Evaluates requested state changes against the catalog, the authorizer and
/// the record's business rule. Never mutates anything.
pub struct TransitionGuard {
    catalog: Arc<TransitionCatalog>,
    authorizer: Arc<dyn Authorizer>,
    formatter: Arc<dyn StateFormatter>,
    /// Checked for every transition on top of its own auth item.
    modify_capability: Option<String>,
}

impl TransitionGuard {
    pub fn new(catalog: Arc<TransitionCatalog>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            catalog,
            authorizer,
            formatter: Arc::new(PlainFormatter),
            modify_capability: None,
        }
    }

    pub fn with_formatter(mut self, formatter: Arc<dyn StateFormatter>) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn with_modify_capability(mut self, capability: Option<String>) -> Self {
        self.modify_capability = capability;
        self
    }

    pub fn catalog(&self) -> &TransitionCatalog {
        &self.catalog
    }

    pub fn formatter(&self) -> &dyn StateFormatter {
        self.formatter.as_ref()
    }

    /// Decides what happens when `record`, currently in `source`, is asked to
    /// move to `target`.
    ///
    /// - no target: the transitions leaving `source` that the principal may take
    /// - `target == source`: [`Decision::AlreadyChanged`], for any `confirmed`
    /// - capability denied: [`TransitionError::Authorization`]
    /// - no such edge: [`TransitionError::InvalidTransition`]
    /// - business rule refuses: [`TransitionError::TransitionNotAllowed`]
    /// - otherwise [`Decision::Proceed`]; transitions that do not require
    ///   confirmation are always confirmed
    pub fn evaluate(
        &self,
        record: &dyn Stateful,
        source: &StateId,
        target: Option<&StateId>,
        confirmed: bool,
        cache: &mut AccessCache,
    ) -> Result<Decision, TransitionError> {
        let Some(target) = target else {
            let entries = match self.catalog.source_group(source) {
                Some(group) => self.annotate(record, group.entries(), cache),
                None => Vec::new(),
            };
            return Ok(Decision::ListTransitions(
                entries.into_iter().filter(|e| e.authorized).collect(),
            ));
        };

        if target == source {
            return Ok(Decision::AlreadyChanged {
                state: target.clone(),
                notice: "Status has already been changed".to_string(),
            });
        }

        if let Some(transition) = self.catalog.find(source, target) {
            self.authorize(record, transition, cache)?;
        }

        let transition = self.check_edge(record, source, target)?;
        let confirmed = confirmed || !transition.confirmation_required;
        debug!(
            record = %record.key(),
            source = %source,
            target = %target,
            confirmed,
            "transition approved"
        );
        Ok(Decision::Proceed {
            transition: transition.clone(),
            confirmed,
        })
    }

    /// Graph and business-rule half of [`evaluate`](Self::evaluate), without
    /// authorization.
    pub fn check_edge(
        &self,
        record: &dyn Stateful,
        source: &StateId,
        target: &StateId,
    ) -> Result<&Transition, TransitionError> {
        let Some(transition) = self.catalog.find(source, target) else {
            return Err(TransitionError::InvalidTransition {
                from: self.formatter.format(source),
                to: self.formatter.format(target),
            });
        };
        if !record.is_transition_allowed(target) {
            return Err(TransitionError::TransitionNotAllowed {
                from: self.formatter.format(source),
                to: self.formatter.format(target),
            });
        }
        Ok(transition)
    }

    /// Whether the principal may take `transition` on `record`.
    pub fn is_authorized(
        &self,
        record: &dyn Stateful,
        transition: &Transition,
        cache: &mut AccessCache,
    ) -> bool {
        self.authorize(record, transition, cache).is_ok()
    }

    fn authorize(
        &self,
        record: &dyn Stateful,
        transition: &Transition,
        cache: &mut AccessCache,
    ) -> Result<(), TransitionError> {
        let authorizer = self.authorizer.as_ref();
        for capability in [self.modify_capability.as_deref(), transition.capability()]
            .into_iter()
            .flatten()
        {
            if !cache.check(authorizer, Some(capability), record) {
                return Err(TransitionError::Authorization {
                    capability: capability.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Annotates candidate transitions for `record` and puts them in display
    /// order: by `display_order`, unordered ones last, ties by catalog position.
    pub(crate) fn annotate<'c>(
        &self,
        record: &dyn Stateful,
        candidates: impl IntoIterator<Item = (usize, &'c Transition)>,
        cache: &mut AccessCache,
    ) -> Vec<AvailableTransition> {
        let mut entries: Vec<(usize, AvailableTransition)> = candidates
            .into_iter()
            .map(|(position, transition)| {
                let authorized = self.is_authorized(record, transition, cache);
                let valid = record.is_transition_allowed(&transition.target_state);
                let entry = AvailableTransition {
                    transition: transition.clone(),
                    authorized,
                    valid,
                    enabled: authorized && valid,
                };
                (position, entry)
            })
            .collect();

        entries.sort_by_key(|(position, entry)| {
            let order = entry.transition.display_order;
            (order.is_none(), order, *position)
        });
        entries.into_iter().map(|(_, entry)| entry).collect()
    }
}
