//! Terminal output: colored catalog, menus and batch reports.
//!
//! Uses `console` for styling; batch results are printed as JSON.

use console::Style;

use statewright::executor::BatchResult;
use statewright::menu::MenuEntry;
use statewright::state_machine::TransitionCatalog;

/// Styles shared by every printer.
pub struct Printer {
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl Default for Printer {
    fn default() -> Self {
        Self {
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }
}

impl Printer {
    pub fn print_catalog(&self, catalog: &TransitionCatalog) {
        if catalog.is_empty() {
            println!("{}", self.yellow.apply_to("No transitions configured."));
            return;
        }
        for group in catalog.source_groups() {
            println!("{}", self.green.apply_to(group.state()));
            for transition in group.iter() {
                let mut flags = Vec::new();
                if let Some(capability) = transition.capability() {
                    flags.push(format!("requires {capability}"));
                }
                if transition.confirmation_required {
                    flags.push("confirm".to_string());
                }
                if let Some(order) = transition.display_order {
                    flags.push(format!("order {order}"));
                }
                println!(
                    "  -> {} {} {}",
                    transition.target_state,
                    transition.label,
                    self.dim.apply_to(flags.join(", "))
                );
            }
        }
    }

    pub fn print_menu(&self, entries: &[MenuEntry]) {
        if entries.is_empty() {
            println!("{}", self.yellow.apply_to("No transitions available."));
            return;
        }
        for entry in entries {
            let marker = if entry.enabled {
                self.green.apply_to("✓")
            } else {
                self.red.apply_to("✗")
            };
            let query: Vec<String> = entry
                .url_params
                .to_query_pairs()
                .into_iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect();
            let reason = match (entry.enabled, entry.valid) {
                (true, _) => "",
                (false, false) => " (not allowed)",
                (false, true) => " (access denied)",
            };
            println!(
                "  {marker} {}{reason} {}",
                entry.label,
                self.dim.apply_to(format!("?{}", query.join("&")))
            );
        }
    }

    /// Prints the summary line, then the full result as JSON.
    pub fn print_batch(&self, result: &BatchResult) {
        let style = if result.rolled_back || !result.failed.is_empty() {
            &self.red
        } else if result.is_complete_success() {
            &self.green
        } else {
            &self.yellow
        };
        println!("{}", style.apply_to(result.summary()));
        for failure in &result.failed {
            println!("  {} {}: {}", self.red.apply_to("✗"), failure.label, failure.message);
        }
        println!();
        println!(
            "{}",
            serde_json::to_string_pretty(result).unwrap_or_default()
        );
    }
}
