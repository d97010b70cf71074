mod cli;
mod ui;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Command};
use statewright::config::EngineConfig;
use statewright::engine::TransitionEngine;
use statewright::executor::BulkOptions;
use statewright::memory::{CapabilityTable, MemoryAudit, MemoryRecord, MemorySelection, MemoryStore};
use statewright::state_machine::{StateId, TransitionCatalog};
use ui::Printer;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?,
    };

    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.log_filter()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_new(&filter)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_writer(std::io::stderr),
        )
        .init();

    let catalog = Arc::new(
        config
            .build_catalog()
            .context("building the transition catalog")?,
    );
    let printer = Printer::default();

    match cli.command {
        Command::Catalog => printer.print_catalog(&catalog),
        Command::Menu { state, deny } => {
            let authorizer = deny
                .iter()
                .fold(CapabilityTable::allow_by_default(), |table, capability| {
                    table.revoke(capability)
                });
            let engine = engine(&config, catalog, authorizer);
            let record = MemoryRecord::new("1", &state);
            printer.print_menu(&engine.list_available_transitions(&record));
        }
        Command::Demo {
            records,
            from,
            target,
            deny_record,
            mode,
        } => {
            let from = match from {
                Some(state) => StateId::from(state),
                None => match config.states.first() {
                    Some(state) => state.id.clone(),
                    None => bail!("no states configured"),
                },
            };

            let capabilities = capabilities(&config, &catalog);
            let mut authorizer = CapabilityTable::allow_by_default();
            for index in deny_record {
                for capability in &capabilities {
                    authorizer = authorizer.deny_for(capability, &index.to_string());
                }
            }

            let mut store = MemoryStore::new(
                (1..=records)
                    .map(|i| MemoryRecord::new(&i.to_string(), from.as_str()).audited())
                    .collect(),
            );
            let audit = Arc::new(MemoryAudit::new());
            let engine = engine(&config, catalog, authorizer).with_audit(audit.clone());

            let result = engine.execute_bulk(
                &mut store,
                &MemorySelection::All,
                &StateId::from(target),
                BulkOptions {
                    transaction: mode.into(),
                    single_query: false,
                },
            )?;
            printer.print_batch(&result);
            tracing::debug!(changesets = audit.changesets().len(), "audit log");
        }
    }

    Ok(())
}

fn engine(
    config: &EngineConfig,
    catalog: Arc<TransitionCatalog>,
    authorizer: CapabilityTable,
) -> TransitionEngine {
    TransitionEngine::new(catalog, Arc::new(authorizer))
        .with_formatter(Arc::new(config.formatter()))
        .with_modify_capability(config.modify_capability.clone())
}

/// Every capability the catalog can ask for.
fn capabilities(config: &EngineConfig, catalog: &TransitionCatalog) -> Vec<String> {
    let mut capabilities: Vec<String> = catalog
        .transitions()
        .iter()
        .filter_map(|t| t.capability().map(str::to_string))
        .chain(config.modify_capability.clone())
        .collect();
    capabilities.sort();
    capabilities.dedup();
    capabilities
}
