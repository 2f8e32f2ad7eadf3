//! Prints the ctDNA stage table and, optionally, which stage each of a
//! batch of envelopes would select.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{json, Value};

use ctdna_orchestrator::config::OrchestratorConfig;
use ctdna_orchestrator::core::EventEnvelope;
use ctdna_orchestrator::observability::{init_tracing, LogFormat};
use ctdna_orchestrator::registry::{GrantedCapabilities, StageDefinition, StageRegistry};
use ctdna_orchestrator::routing::match_event;

#[derive(Parser, Debug)]
#[command(name = "ctdna-stages")]
#[command(about = "Inspect the DRAGEN TSO500 ctDNA stage table")]
struct Cli {
    /// JSON configuration file; defaults apply when omitted
    config: Option<PathBuf>,

    /// JSON array of bus envelopes to match against the stage table
    #[arg(long = "match", value_name = "FILE")]
    match_file: Option<PathBuf>,

    /// Log output format (pretty or json)
    #[arg(long, env = "LOG_FORMAT", default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    let config = match path {
        Some(path) => OrchestratorConfig::from_path(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };
    Ok(config.apply_env_overrides()?)
}

fn match_envelopes(registry: &StageRegistry, path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let envelopes: Vec<EventEnvelope> =
        serde_json::from_str(&raw).with_context(|| format!("parsing envelopes in {}", path.display()))?;

    let matches = envelopes
        .iter()
        .map(|envelope| {
            let stage = match_event(registry, envelope).map(|s| s.name.clone());
            tracing::debug!(event_id = %envelope.id, stage = ?stage, "Matched envelope");
            json!({
                "id": envelope.id,
                "source": envelope.source,
                "detail-type": envelope.detail_type,
                "stage": stage,
            })
        })
        .collect::<Vec<_>>();
    Ok(Value::Array(matches))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    let config = load_config(cli.config.as_deref())?;
    let capabilities = Arc::new(GrantedCapabilities::new(config.granted_capabilities.iter().copied()));
    let registry = StageRegistry::standard(&config, capabilities)?;
    tracing::info!(
        workflow = %config.workflow_name,
        stages = registry.len(),
        "Stage table built"
    );

    let output = match cli.match_file.as_deref() {
        Some(path) => match_envelopes(&registry, path)?,
        None => Value::Array(registry.all().iter().map(StageDefinition::describe).collect()),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
