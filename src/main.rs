//! ACE: Agentic Context Engineering for code-writing agents
//!
//! Provides subcommands for each way of running the adapter:
//!
//! - `offline`  -- Multi-epoch adaptation over a training split
//! - `online`   -- Single-pass adaptation over a sample stream
//! - `baseline` -- Evaluate a frozen playbook without learning
//! - `inspect`  -- Inspect a saved playbook
//! - `stats`    -- Summarise a metrics log

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use ace::adaptation::{
    evaluate_frozen, jsonl_samples, AdapterPipeline, MetricsLog, OfflineAdapter, OnlineAdapter,
    Phase, RunSummary,
};
use ace::config::AceConfig;
use ace::env::{AnyEnv, MockSandboxEnv, SandboxEnv};
use ace::model::UsageLog;
use ace::playbook::{AnyDeduplicator, Playbook, SharedPlaybook};
use ace::roles::{LlmCurator, LlmGenerator, LlmReflector};
use ace::trajectory::load_samples;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// ACE: Agentic Context Engineering for code-writing agents
#[derive(Parser)]
#[command(name = "ace", version, about)]
struct Cli {
    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use the scripted mock sandbox instead of a live server.
    #[arg(long, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Adapt over a fixed training split for several epochs.
    Offline {
        /// Training samples (JSON array or JSON lines).
        #[arg(long)]
        train: PathBuf,

        /// Held-out samples evaluated with the final playbook.
        #[arg(long)]
        eval: Option<PathBuf>,

        /// Playbook to start from (starts empty if absent).
        #[arg(long)]
        playbook: Option<PathBuf>,

        /// Override `offline.epochs`.
        #[arg(long)]
        epochs: Option<usize>,
    },

    /// Adapt in a single pass over a sample stream.
    Online {
        /// Samples (JSON array or JSON lines); `-` reads JSON lines from stdin.
        #[arg(long)]
        input: PathBuf,

        /// Playbook to start from (starts empty if absent).
        #[arg(long)]
        playbook: Option<PathBuf>,

        /// Override `online.max_samples`.
        #[arg(long)]
        max_samples: Option<usize>,
    },

    /// Evaluate a playbook without reflecting or curating.
    Baseline {
        /// Samples to evaluate.
        #[arg(long)]
        input: PathBuf,

        /// Frozen playbook (evaluates with an empty playbook if absent).
        #[arg(long)]
        playbook: Option<PathBuf>,
    },

    /// Inspect a saved playbook.
    Inspect {
        /// Path to the playbook JSON file.
        #[arg(default_value = "outputs/playbook.json")]
        path: PathBuf,
    },

    /// Summarise a metrics log.
    Stats {
        /// Path to a `metrics.jsonl` file.
        #[arg(default_value = "outputs/metrics.jsonl")]
        path: PathBuf,

        /// TGC threshold for SGC (defaults to `adaptation.sgc_threshold`).
        #[arg(long)]
        threshold: Option<f64>,
    },
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing (reads RUST_LOG env var, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Load or create configuration.
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str::<AceConfig>(&text)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?
        }
        None => AceConfig::default(),
    };

    // Fill in API keys from environment variables when not set in the config file.
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        if config.model.api_key.is_empty() {
            config.model.api_key = key.clone();
        }
        if config.model.embedding_api_key.is_empty() {
            config.model.embedding_api_key = key;
        }
    }

    match cli.command {
        Commands::Offline {
            train,
            eval,
            playbook,
            epochs,
        } => {
            if let Some(epochs) = epochs {
                config.offline.epochs = epochs;
            }
            cmd_offline(&config, cli.mock, &train, eval.as_deref(), playbook.as_deref()).await
        }
        Commands::Online {
            input,
            playbook,
            max_samples,
        } => {
            if max_samples.is_some() {
                config.online.max_samples = max_samples;
            }
            cmd_online(&config, cli.mock, &input, playbook.as_deref()).await
        }
        Commands::Baseline { input, playbook } => {
            cmd_baseline(&config, cli.mock, &input, playbook.as_deref()).await
        }
        Commands::Inspect { path } => cmd_inspect(&path),
        Commands::Stats { path, threshold } => {
            cmd_stats(&path, threshold.unwrap_or(config.adaptation.sgc_threshold))
        }
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_offline(
    config: &AceConfig,
    mock: bool,
    train_path: &Path,
    eval_path: Option<&Path>,
    playbook_path: Option<&Path>,
) -> Result<()> {
    let train = load_samples(train_path)?;
    let eval = eval_path.map(load_samples).transpose()?;

    let usage = prepare_output(config)?;
    let pipeline = build_pipeline(config, playbook_path, &usage)?;
    let mut adapter =
        OfflineAdapter::new(pipeline, config.offline.clone()).with_output_dir(&config.output_dir);
    if let Some(dedup) = AnyDeduplicator::from_config(&config.dedup, &config.model) {
        adapter = adapter.with_deduplicator(dedup);
    }
    let mut env = create_env(config, mock);

    let report = adapter.run(&train, &mut env).await?;
    println!("Offline adaptation\n{}", report.summary);

    if let Some(eval) = eval {
        let report = adapter.evaluate(&eval, &mut env).await?;
        println!("Held-out evaluation\n{}", report.summary);
    }
    print_usage(&usage);
    Ok(())
}

async fn cmd_online(
    config: &AceConfig,
    mock: bool,
    input: &Path,
    playbook_path: Option<&Path>,
) -> Result<()> {
    let usage = prepare_output(config)?;
    let pipeline = build_pipeline(config, playbook_path, &usage)?;
    let adapter =
        OnlineAdapter::new(pipeline, config.online.clone()).with_output_dir(&config.output_dir);
    let mut env = create_env(config, mock);

    let stop = adapter.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current sample");
            stop.store(true, Ordering::SeqCst);
        }
    });

    let report = if input.as_os_str() == "-" {
        let stdin = BufReader::new(tokio::io::stdin());
        adapter.run_fallible(jsonl_samples(stdin), &mut env).await?
    } else if input.extension().is_some_and(|ext| ext == "jsonl") {
        let file = tokio::fs::File::open(input)
            .await
            .with_context(|| format!("Failed to open {}", input.display()))?;
        adapter
            .run_fallible(jsonl_samples(BufReader::new(file)), &mut env)
            .await?
    } else {
        let samples = load_samples(input)?;
        adapter.run(futures::stream::iter(samples), &mut env).await?
    };

    println!("Online adaptation\n{}", report.summary);
    println!("Total steps: {}", report.total_steps);
    print_usage(&usage);
    Ok(())
}

async fn cmd_baseline(
    config: &AceConfig,
    mock: bool,
    input: &Path,
    playbook_path: Option<&Path>,
) -> Result<()> {
    let samples = load_samples(input)?;
    let usage = prepare_output(config)?;
    let pipeline = build_pipeline(config, playbook_path, &usage)?;
    let mut env = create_env(config, mock);

    let output_dir = Some(config.output_dir.as_path());
    let report = evaluate_frozen(&pipeline, &samples, &mut env, output_dir).await?;
    println!("Baseline evaluation\n{}", report.summary);
    print_usage(&usage);
    Ok(())
}

fn cmd_inspect(path: &Path) -> Result<()> {
    let playbook = Playbook::load_from_file(path)?;

    println!("Playbook: {}", path.display());
    println!("  Live bullets: {}", playbook.len());
    println!("  Next id: {}", playbook.next_id());
    println!();

    println!("Bullets by section:");
    for (section, count) in playbook.section_counts() {
        println!("  {section}: {count}");
    }
    println!();

    for bullet in playbook.bullets() {
        println!(
            "  [{}] ({}) helpful={} harmful={}",
            bullet.id, bullet.section, bullet.helpful, bullet.harmful
        );
        println!("    {}", bullet.content);
        println!(
            "    from {} at {}",
            bullet.provenance.task_id,
            bullet.provenance.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        if !bullet.merged_from.is_empty() {
            let merged: Vec<String> = bullet.merged_from.iter().map(|id| id.to_string()).collect();
            println!("    merged: {}", merged.join(", "));
        }
    }

    Ok(())
}

fn cmd_stats(path: &Path, threshold: f64) -> Result<()> {
    let records = MetricsLog::read_all(path)?;
    println!("Metrics: {}", path.display());
    println!();

    for phase in [Phase::Offline, Phase::Online, Phase::Evaluation] {
        let subset: Vec<_> = records
            .iter()
            .filter(|r| r.phase == phase)
            .cloned()
            .collect();
        if subset.is_empty() {
            continue;
        }
        println!("[{phase}]");
        println!("{}", RunSummary::from_records(&subset, threshold));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Construction helpers
// ---------------------------------------------------------------------------

/// Snapshot the configuration and open the LLM call log under `output_dir`.
fn prepare_output(config: &AceConfig) -> Result<UsageLog> {
    let snapshot = config.save_snapshot()?;
    tracing::info!(path = %snapshot.display(), "Configuration saved");
    UsageLog::open(config.output_dir.join("llm_calls.jsonl"))
}

fn print_usage(usage: &UsageLog) {
    let totals = usage.totals();
    if totals.is_empty() {
        return;
    }
    println!("LLM usage:");
    for (role, t) in totals {
        println!(
            "  {role:<10} calls={} prompt={} completion={} total={}",
            t.calls, t.prompt_tokens, t.completion_tokens, t.total_tokens
        );
    }
}

fn build_pipeline(
    config: &AceConfig,
    playbook_path: Option<&Path>,
    usage: &UsageLog,
) -> Result<AdapterPipeline<LlmGenerator, LlmReflector, LlmCurator>> {
    let playbook = match playbook_path {
        Some(path) if path.exists() => Playbook::load_from_file(path)?,
        Some(path) => {
            tracing::warn!(path = %path.display(), "Playbook not found, starting empty");
            Playbook::new()
        }
        None => Playbook::new(),
    };

    Ok(AdapterPipeline::new(
        LlmGenerator::from_config(&config.model).with_usage_log(usage.clone()),
        LlmReflector::from_config(&config.model).with_usage_log(usage.clone()),
        LlmCurator::from_config(&config.model).with_usage_log(usage.clone()),
        SharedPlaybook::new(playbook),
        config.adaptation.clone(),
    )
    .with_trajectory_log(&config.output_dir))
}

fn create_env(config: &AceConfig, mock: bool) -> AnyEnv {
    if mock {
        tracing::info!("Using mock sandbox environment");
        AnyEnv::Mock(MockSandboxEnv::new())
    } else {
        tracing::info!(base_url = %config.environment.base_url, "Using live sandbox environment");
        AnyEnv::Sandbox(SandboxEnv::new(
            &config.environment.base_url,
            &config.environment.experiment_name,
        ))
    }
}
