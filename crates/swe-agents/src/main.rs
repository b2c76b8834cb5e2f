//! SWE-bench evaluation CLI
//!
//! Drives the harness over a cached dataset split: one instance at a
//! time, up to N attempts each, predictions appended to a run-scoped
//! JSONL file. Exit code 0 means the run completed, regardless of
//! per-instance outcomes; only configuration failures exit nonzero.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use harness::{
    preflight, run_instance, CachedDataset, GraphRagClient, GraphRagSession, InstanceLog,
    InstanceSelection, LoopPolicy, PredictionWriter, RunConfig, TaskSource,
};
use swe_agents::backend::OllamaBackendFactory;
use swe_agents::endpoint::{check_endpoint, AgentEndpoint};
use swe_agents::variant::VariantConfig;

#[derive(Parser, Debug)]
#[command(
    name = "swe-agents",
    about = "Evaluate a local coding agent on cached SWE-bench instances",
    group = clap::ArgGroup::new("selection").required(true)
)]
struct Cli {
    /// Path to the cached dataset JSON (list of instance records).
    #[arg(long)]
    dataset: PathBuf,

    /// First N instances from the dataset.
    #[arg(long, group = "selection")]
    limit: Option<usize>,

    /// Explicit instance IDs.
    #[arg(long, group = "selection", num_args = 1..)]
    instance_ids: Vec<String>,

    /// File with one instance ID per line.
    #[arg(long, group = "selection")]
    instance_ids_file: Option<PathBuf>,

    /// Variant: vanilla, tdd_loop, graphrag_tdd (aliases: baseline, tdd, graphrag).
    #[arg(long, default_value = "vanilla")]
    variant: String,

    /// Name of the predictions file; defaults to a timestamped name.
    #[arg(long)]
    run_name: Option<String>,

    /// Maximum attempts per instance.
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Maximum model calls per agent run.
    #[arg(long)]
    step_limit: Option<u32>,

    /// Loop policy: off, warn, strict.
    #[arg(long)]
    loop_policy: Option<LoopPolicy>,

    /// Test-repair rounds per attempt (TDD / GraphRAG variants).
    #[arg(long)]
    max_fix_iterations: Option<u32>,

    /// Compile-repair rounds per attempt.
    #[arg(long)]
    max_compile_fix_iterations: Option<u32>,

    /// Patch compile gate: on or off.
    #[arg(long)]
    patch_compile_gate: Option<String>,

    /// GraphRAG service URL.
    #[arg(long, default_value = "http://localhost:8080")]
    graphrag_url: String,

    /// Directory for per-instance logs.
    #[arg(long, default_value = "logs")]
    logs_dir: PathBuf,

    /// Directory for prediction JSONL files.
    #[arg(long, default_value = "predictions")]
    predictions_dir: PathBuf,
}

impl Cli {
    fn selection(&self) -> Result<InstanceSelection> {
        if let Some(limit) = self.limit {
            return Ok(InstanceSelection::First(limit));
        }
        if !self.instance_ids.is_empty() {
            return Ok(InstanceSelection::Ids(self.instance_ids.clone()));
        }
        if let Some(path) = &self.instance_ids_file {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            let ids: Vec<String> = raw
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(String::from)
                .collect();
            return Ok(InstanceSelection::Ids(ids));
        }
        anyhow::bail!("one of --limit, --instance-ids, --instance-ids-file is required");
    }

    fn run_config(&self) -> Result<RunConfig> {
        let mut config = RunConfig::default();
        if let Some(v) = self.max_attempts {
            config.max_attempts = v.max(1);
        }
        if let Some(v) = self.step_limit {
            config.step_limit = v.max(1);
        }
        if let Some(policy) = self.loop_policy {
            config.loop_policy = policy;
        }
        if let Some(v) = self.max_fix_iterations {
            config.max_fix_iterations = v;
        }
        if let Some(v) = self.max_compile_fix_iterations {
            config.max_compile_fix_iterations = v;
        }
        if let Some(v) = &self.patch_compile_gate {
            config.patch_compile_gate = match v.to_ascii_lowercase().as_str() {
                "on" => true,
                "off" => false,
                other => anyhow::bail!("--patch-compile-gate expects on or off, got '{other}'"),
            };
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.run_config()?;
    preflight(&config).await?;

    let variant = VariantConfig::resolve(&cli.variant)
        .with_context(|| format!("unknown variant '{}'", cli.variant))?;
    let mode = variant.mode();

    let tasks = CachedDataset::new(&cli.dataset).tasks()?;
    let tasks = cli.selection()?.apply(tasks);
    if tasks.is_empty() {
        warn!("selection matched no instances; nothing to do");
        return Ok(());
    }

    let endpoint = AgentEndpoint::default();
    if !check_endpoint(&endpoint).await {
        warn!(url = %endpoint.url, "agent endpoint health probe failed; continuing anyway");
    }
    let factory = OllamaBackendFactory::new(
        endpoint,
        config.step_limit,
        config.cost_limit,
        mode.tdd_mode,
    );

    // GraphRAG degrades to a no-op when the service is down.
    let graphrag = if mode.use_graphrag {
        let client = GraphRagClient::new(&cli.graphrag_url);
        if client.health().await {
            Some(GraphRagSession::new(client))
        } else {
            warn!(url = %cli.graphrag_url, "graphrag unavailable; running without it");
            None
        }
    } else {
        None
    };

    let run_name = cli.run_name.clone().unwrap_or_else(|| {
        format!(
            "predictions_{}_{}",
            variant.name,
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        )
    });
    let mut writer = PredictionWriter::create(&cli.predictions_dir, &run_name)?;

    info!(
        variant = variant.name,
        instances = tasks.len(),
        max_attempts = config.max_attempts,
        step_limit = config.step_limit,
        loop_policy = %config.loop_policy,
        predictions = %writer.path().display(),
        "starting run"
    );

    let run_started = Instant::now();
    let mut non_empty = 0usize;
    let mut errors = 0usize;

    for (index, task) in tasks.iter().enumerate() {
        info!(
            instance = %task.instance_id,
            progress = format!("{}/{}", index + 1, tasks.len()),
            "evaluating instance"
        );
        let log = InstanceLog::create(&cli.logs_dir, &task.instance_id, config.max_attempts)?;

        let started = Instant::now();
        let prediction =
            run_instance(&config, mode, &factory, graphrag.as_ref(), task, &log).await;
        let elapsed = started.elapsed().as_secs_f64();

        if prediction.prediction.is_empty() {
            if prediction.error.is_some() {
                errors += 1;
            }
        } else {
            non_empty += 1;
        }
        log.log(0, format!("Instance finished in {elapsed:.1}s"));
        writer.append(&prediction)?;
    }

    if let Some(session) = &graphrag {
        session.clear_cache();
    }

    info!(
        instances = tasks.len(),
        non_empty_patches = non_empty,
        errors,
        elapsed_s = format!("{:.1}", run_started.elapsed().as_secs_f64()),
        predictions = %writer.path().display(),
        "run complete"
    );
    Ok(())
}
