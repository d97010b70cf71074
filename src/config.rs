//! Engine configuration loaded from `statewright.toml`.
//!
//! [`EngineConfig`] declares the states, the transition overrides and the
//! engine-wide policy. Values missing from the file use sensible defaults.
//! The `STATEWRIGHT_CONFIG` variable overrides the file's path and
//! `STATEWRIGHT_LOG` overrides its log filter.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::FsmError;
use crate::ports::CatalogFormatter;
use crate::state_machine::{StateDefinition, StateId, Transition, TransitionCatalog};

pub const DEFAULT_PATH: &str = "statewright.toml";
pub const CONFIG_ENV: &str = "STATEWRIGHT_CONFIG";
pub const LOG_ENV: &str = "STATEWRIGHT_LOG";

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// `tracing` filter directive used when `STATEWRIGHT_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Capability checked for every transition on top of its own auth item.
    #[serde(default)]
    pub modify_capability: Option<String>,

    /// Generate every edge between the declared states, then apply the
    /// overrides. Otherwise only the listed transitions exist.
    #[serde(default = "default_generate_all")]
    pub generate_all: bool,

    #[serde(default)]
    pub states: Vec<StateDefinition>,

    #[serde(default)]
    pub transitions: Vec<TransitionConfig>,
}

/// Per-edge settings. Unset fields keep what the edge was generated with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TransitionConfig {
    pub source: StateId,
    pub target: StateId,
    #[serde(default)]
    pub auth_item: Option<String>,
    #[serde(default)]
    pub confirmation_required: Option<bool>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub post_label: Option<String>,
    #[serde(default)]
    pub display_order: Option<u32>,
    /// Removes the edge from the catalog.
    #[serde(default)]
    pub disabled: bool,
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_generate_all() -> bool {
    true
}

// Review workflow used when no file is present.
fn sample_states() -> Vec<StateDefinition> {
    [
        ("draft", "Draft", "Back to draft", "Moved back to draft"),
        ("pending", "Pending", "Submit", "Submitted for review"),
        ("approved", "Approved", "Approve", "Approved"),
        ("rejected", "Rejected", "Reject", "Rejected"),
    ]
    .into_iter()
    .map(|(id, name, pre_label, post_label)| StateDefinition {
        name: Some(name.to_string()),
        pre_label: Some(pre_label.to_string()),
        post_label: Some(post_label.to_string()),
        ..StateDefinition::new(id)
    })
    .collect()
}

fn sample_transitions() -> Vec<TransitionConfig> {
    vec![
        TransitionConfig {
            source: "draft".into(),
            target: "pending".into(),
            auth_item: Some("submit".to_string()),
            ..TransitionConfig::default()
        },
        TransitionConfig {
            source: "pending".into(),
            target: "approved".into(),
            auth_item: Some("approve".to_string()),
            confirmation_required: Some(true),
            display_order: Some(1),
            ..TransitionConfig::default()
        },
        TransitionConfig {
            source: "pending".into(),
            target: "rejected".into(),
            auth_item: Some("approve".to_string()),
            display_order: Some(2),
            ..TransitionConfig::default()
        },
        TransitionConfig {
            source: "approved".into(),
            target: "draft".into(),
            disabled: true,
            ..TransitionConfig::default()
        },
    ]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            modify_capability: None,
            generate_all: default_generate_all(),
            states: sample_states(),
            transitions: sample_transitions(),
        }
    }
}

impl EngineConfig {
    /// Loads the file named by `STATEWRIGHT_CONFIG`, else `statewright.toml`
    /// in the current directory. Defaults apply when neither exists.
    pub fn load() -> Result<Self> {
        let path = match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => PathBuf::from(DEFAULT_PATH),
        };
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(FsmError::from)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = toml::from_str::<EngineConfig>(&contents)
            .map_err(FsmError::from)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// The filter from `STATEWRIGHT_LOG` when set, else the configured one.
    pub fn log_filter(&self) -> String {
        match std::env::var(LOG_ENV) {
            Ok(filter) if !filter.is_empty() => filter,
            _ => self.log_filter.clone(),
        }
    }

    pub fn formatter(&self) -> CatalogFormatter {
        CatalogFormatter::new(&self.states)
    }

    /// Builds the catalog: generated edges (if enabled) patched by the
    /// overrides, or the overrides alone. Disabled edges are dropped.
    pub fn build_catalog(&self) -> Result<TransitionCatalog, FsmError> {
        let mut declared = HashSet::new();
        for state in &self.states {
            if !declared.insert(&state.id) {
                return Err(FsmError::Config(format!("state {} declared twice", state.id)));
            }
        }
        let definition = |id: &StateId| {
            self.states
                .iter()
                .find(|s| &s.id == id)
                .ok_or_else(|| FsmError::UnknownState(id.clone()))
        };

        let mut transitions = if self.generate_all {
            Transition::from_states(&self.states)
        } else {
            Vec::new()
        };
        let mut disabled = HashSet::new();

        for entry in &self.transitions {
            let source = definition(&entry.source)?;
            let target = definition(&entry.target)?;
            if source.id == target.id {
                return Err(FsmError::Config(format!(
                    "transition from {} to itself",
                    source.id
                )));
            }
            if entry.disabled {
                disabled.insert((&entry.source, &entry.target));
                continue;
            }

            let existing = transitions
                .iter()
                .position(|t| t.source_state == source.id && t.target_state == target.id);
            let slot = match existing {
                Some(index) if self.generate_all => &mut transitions[index],
                Some(_) => {
                    return Err(FsmError::DuplicateTransition {
                        source_state: source.id.clone(),
                        target_state: target.id.clone(),
                    });
                }
                None => {
                    transitions.push(Transition::between(source, target));
                    let last = transitions.len() - 1;
                    &mut transitions[last]
                }
            };
            entry.apply(slot);
        }

        transitions.retain(|t| !disabled.contains(&(&t.source_state, &t.target_state)));
        TransitionCatalog::new(transitions)
    }
}

impl TransitionConfig {
    fn apply(&self, transition: &mut Transition) {
        if let Some(auth_item) = &self.auth_item {
            transition.auth_item_name = Some(auth_item.clone());
        }
        if let Some(required) = self.confirmation_required {
            transition.confirmation_required = required;
        }
        if let Some(label) = &self.label {
            transition.label = label.clone();
        }
        if let Some(post_label) = &self.post_label {
            transition.post_label = post_label.clone();
        }
        if self.display_order.is_some() {
            transition.display_order = self.display_order;
        }
    }
}
