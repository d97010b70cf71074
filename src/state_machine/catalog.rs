use std::collections::{HashMap, HashSet};

use crate::error::FsmError;

use super::transition::{StateDefinition, StateId, Transition};

/// Which endpoint of a transition a grouping is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Source,
    Target,
}

impl Endpoint {
    fn key(self, t: &Transition) -> &StateId {
        match self {
            Endpoint::Source => &t.source_state,
            Endpoint::Target => &t.target_state,
        }
    }

    fn other(self, t: &Transition) -> &StateId {
        match self {
            Endpoint::Source => &t.target_state,
            Endpoint::Target => &t.source_state,
        }
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    key: StateId,
    representative: usize,
    members: Vec<usize>,
    by_other: HashMap<StateId, usize>,
}

#[derive(Debug, Clone)]
struct Grouping {
    buckets: Vec<Bucket>,
    by_key: HashMap<StateId, usize>,
}

impl Grouping {
    /// Single pass; the first transition seen for a key becomes its
    /// representative and bucket order follows first appearance.
    fn build(transitions: &[Transition], endpoint: Endpoint) -> Self {
        let mut buckets: Vec<Bucket> = Vec::new();
        let mut by_key: HashMap<StateId, usize> = HashMap::new();

        for (position, transition) in transitions.iter().enumerate() {
            let key = endpoint.key(transition);
            let slot = *by_key.entry(key.clone()).or_insert_with(|| {
                buckets.push(Bucket {
                    key: key.clone(),
                    representative: position,
                    members: Vec::new(),
                    by_other: HashMap::new(),
                });
                buckets.len() - 1
            });
            let bucket = &mut buckets[slot];
            bucket.members.push(position);
            bucket
                .by_other
                .insert(endpoint.other(transition).clone(), position);
        }

        Self { buckets, by_key }
    }
}

/// The full transition set plus its source- and target-indexed views.
///
/// Built once and never mutated; share it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct TransitionCatalog {
    transitions: Vec<Transition>,
    by_source: Grouping,
    by_target: Grouping,
}

impl TransitionCatalog {
    /// Builds the catalog from an explicit transition list, rejecting
    /// duplicate `(source, target)` pairs.
    pub fn new(transitions: Vec<Transition>) -> Result<Self, FsmError> {
        let mut seen = HashSet::with_capacity(transitions.len());
        for t in &transitions {
            if !seen.insert((&t.source_state, &t.target_state)) {
                return Err(FsmError::DuplicateTransition {
                    source_state: t.source_state.clone(),
                    target_state: t.target_state.clone(),
                });
            }
        }

        let by_source = Grouping::build(&transitions, Endpoint::Source);
        let by_target = Grouping::build(&transitions, Endpoint::Target);

        Ok(Self {
            transitions,
            by_source,
            by_target,
        })
    }

    /// Complete graph over the given states, see [`Transition::from_states`].
    pub fn from_states(states: &[StateDefinition]) -> Result<Self, FsmError> {
        Self::new(Transition::from_states(states))
    }

    /// All transitions in insertion order.
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    /// `TransitionsBySource[source]`.
    pub fn source_group(&self, source: &StateId) -> Option<Group<'_>> {
        self.group(&self.by_source, source)
    }

    /// `TransitionsByTarget[target]`.
    pub fn target_group(&self, target: &StateId) -> Option<Group<'_>> {
        self.group(&self.by_target, target)
    }

    /// Source buckets in order of first appearance.
    pub fn source_groups(&self) -> impl Iterator<Item = Group<'_>> {
        self.by_source.buckets.iter().map(move |bucket| Group {
            transitions: &self.transitions,
            bucket,
        })
    }

    /// Target buckets in order of first appearance.
    pub fn target_groups(&self) -> impl Iterator<Item = Group<'_>> {
        self.by_target.buckets.iter().map(move |bucket| Group {
            transitions: &self.transitions,
            bucket,
        })
    }

    /// The edge `source -> target`, if the graph has one.
    pub fn find(&self, source: &StateId, target: &StateId) -> Option<&Transition> {
        self.source_group(source)?.get(target)
    }

    /// Position of the edge in the catalog's insertion order.
    pub fn position(&self, source: &StateId, target: &StateId) -> Option<usize> {
        let slot = *self.by_source.by_key.get(source)?;
        self.by_source.buckets[slot].by_other.get(target).copied()
    }

    fn group<'a>(&'a self, grouping: &'a Grouping, key: &StateId) -> Option<Group<'a>> {
        let slot = *grouping.by_key.get(key)?;
        Some(Group {
            transitions: &self.transitions,
            bucket: &grouping.buckets[slot],
        })
    }
}

/// One bucket of a grouping: every transition sharing a source (or target),
/// addressable by the opposite endpoint.
#[derive(Debug, Clone, Copy)]
pub struct Group<'a> {
    transitions: &'a [Transition],
    bucket: &'a Bucket,
}

impl<'a> Group<'a> {
    /// The state this bucket is keyed on.
    pub fn state(&self) -> &'a StateId {
        &self.bucket.key
    }

    /// First transition seen for this bucket.
    pub fn representative(&self) -> &'a Transition {
        &self.transitions[self.bucket.representative]
    }

    /// Member whose opposite endpoint is `other`.
    pub fn get(&self, other: &StateId) -> Option<&'a Transition> {
        self.bucket
            .by_other
            .get(other)
            .map(|&position| &self.transitions[position])
    }

    pub fn contains(&self, other: &StateId) -> bool {
        self.bucket.by_other.contains_key(other)
    }

    pub fn len(&self) -> usize {
        self.bucket.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bucket.members.is_empty()
    }

    /// Members in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &'a Transition> + 'a {
        let transitions = self.transitions;
        self.bucket.members.iter().map(move |&p| &transitions[p])
    }

    /// Members paired with their catalog position.
    pub fn entries(&self) -> impl Iterator<Item = (usize, &'a Transition)> + 'a {
        let transitions = self.transitions;
        self.bucket.members.iter().map(move |&p| (p, &transitions[p]))
    }
}
