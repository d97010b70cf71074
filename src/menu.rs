use serde::Serialize;

use crate::ports::{AccessCache, RecordKey, Stateful};
use crate::state_machine::{StateId, TransitionGuard};

/// Request parameters that trigger one menu entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UrlParams {
    pub id: RecordKey,
    pub target_state: StateId,
    /// Set when the transition needs no confirmation step.
    pub confirmed: bool,
}

impl UrlParams {
    pub fn to_query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("id", self.id.to_string()),
            ("targetState", self.target_state.to_string()),
        ];
        if self.confirmed {
            pairs.push(("confirmed", "1".to_string()));
        }
        pairs
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MenuEntry {
    pub label: String,
    pub post_label: String,
    pub icon: Option<String>,
    pub css_class: Option<String>,
    pub target_state: StateId,
    pub enabled: bool,
    pub valid: bool,
    pub url_params: UrlParams,
}

/// Read-only projection of the transitions a record can be offered.
pub struct StatusMenuBuilder<'a> {
    guard: &'a TransitionGuard,
}

impl<'a> StatusMenuBuilder<'a> {
    pub fn new(guard: &'a TransitionGuard) -> Self {
        Self { guard }
    }

    /// Every transition leaving the record's current state, unauthorized ones
    /// included but disabled, in display order.
    pub fn list_available_transitions(&self, record: &dyn Stateful) -> Vec<MenuEntry> {
        let catalog = self.guard.catalog();
        let current = record.state();
        let candidates = catalog.target_groups().filter_map(|group| {
            let transition = group.get(current)?;
            let position = catalog.position(current, &transition.target_state)?;
            Some((position, transition))
        });

        let key = record.key();
        self.guard
            .annotate(record, candidates, &mut AccessCache::new())
            .into_iter()
            .map(|available| {
                let transition = available.transition;
                MenuEntry {
                    url_params: UrlParams {
                        id: key.clone(),
                        target_state: transition.target_state.clone(),
                        confirmed: !transition.confirmation_required,
                    },
                    label: transition.label,
                    post_label: transition.post_label,
                    icon: transition.icon,
                    css_class: transition.css_class,
                    target_state: transition.target_state,
                    enabled: available.enabled,
                    valid: available.valid,
                }
            })
            .collect()
    }
}
