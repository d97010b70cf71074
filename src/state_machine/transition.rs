use std::fmt;

use serde::{Deserialize, Serialize};

/// Value of a record's lifecycle attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateId(String);

impl StateId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StateId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for StateId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A state as declared in configuration. Transitions generated from a list of
/// these take their display metadata from the target state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDefinition {
    pub id: StateId,
    /// Human-readable name, used when formatting messages.
    #[serde(default)]
    pub name: Option<String>,
    /// Label of the action leading into this state ("Approve").
    #[serde(default)]
    pub pre_label: Option<String>,
    /// Notice shown once a record has entered this state ("Approved").
    #[serde(default)]
    pub post_label: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub css_class: Option<String>,
    #[serde(default)]
    pub display_order: Option<u32>,
}

impl StateDefinition {
    pub fn new(id: impl Into<StateId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            pre_label: None,
            post_label: None,
            icon: None,
            css_class: None,
            display_order: None,
        }
    }

    /// Name if configured, otherwise the raw id.
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.to_string())
    }
}

/// A directed edge of the transition graph with its display and
/// authorization metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub source_state: StateId,
    pub target_state: StateId,
    pub label: String,
    pub post_label: String,
    pub icon: Option<String>,
    pub css_class: Option<String>,
    /// Capability a principal needs to take this edge. `None` means anyone may.
    pub auth_item_name: Option<String>,
    pub confirmation_required: bool,
    pub display_order: Option<u32>,
}

impl Transition {
    /// Edge from `source` into `target`, carrying the target's metadata.
    pub fn between(source: &StateDefinition, target: &StateDefinition) -> Self {
        let name = target.display_name();
        Self {
            source_state: source.id.clone(),
            target_state: target.id.clone(),
            label: target.pre_label.clone().unwrap_or_else(|| name.clone()),
            post_label: target.post_label.clone().unwrap_or(name),
            icon: target.icon.clone(),
            css_class: target.css_class.clone(),
            auth_item_name: None,
            confirmation_required: false,
            display_order: target.display_order,
        }
    }

    /// Every ordered pair `(i, j)`, `i != j`, of the given states: `n * (n - 1)`
    /// transitions, grouped by source in input order.
    pub fn from_states(states: &[StateDefinition]) -> Vec<Transition> {
        let mut result = Vec::with_capacity(states.len() * states.len().saturating_sub(1));
        for (i, source) in states.iter().enumerate() {
            for (j, target) in states.iter().enumerate() {
                if i == j {
                    continue;
                }
                result.push(Transition::between(source, target));
            }
        }
        result
    }

    pub fn with_auth_item(mut self, auth_item: impl Into<String>) -> Self {
        self.auth_item_name = Some(auth_item.into());
        self
    }

    pub fn with_confirmation(mut self, required: bool) -> Self {
        self.confirmation_required = required;
        self
    }

    pub fn with_display_order(mut self, order: Option<u32>) -> Self {
        self.display_order = order;
        self
    }

    /// Auth item name, treating a blank name as "no capability required".
    pub fn capability(&self) -> Option<&str> {
        self.auth_item_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source_state, self.target_state)
    }
}
