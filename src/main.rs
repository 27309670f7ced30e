use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use callscore::io::unique_call_id;
use callscore::models::{FailureKind, FailureRecord};
use callscore::{
    AnthropicClient, AnthropicConfig, BatchOutcome, DetectionCatalog, Embedder, EmbeddingConfig,
    HttpEmbedder, HumanReport, LlmBackend, PipelineConfig, Workflow, execute_batch,
    read_call_file, write_batch_outputs, write_json,
};

#[derive(Parser)]
#[command(name = "callscore")]
#[command(author, version, about = "Sales call transcript analysis", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze one call and write its report
    Analyze {
        /// Call file (.json call file or timestamped text)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file for the JSON report (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Output file for a plain-text summary
        #[arg(long)]
        human_readable: Option<PathBuf>,

        #[command(flatten)]
        engines: EngineArgs,
    },

    /// Analyze many calls, one report per call plus batch_summary.json
    Batch {
        /// Call files or directories containing them
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Directory for reports and the batch summary
        #[arg(short, long)]
        output_dir: PathBuf,

        /// Stop at the first failed call and skip the rest
        #[arg(long)]
        fail_fast: bool,

        /// Calls analyzed at the same time
        #[arg(long, default_value = "3")]
        max_concurrent_calls: usize,

        #[command(flatten)]
        engines: EngineArgs,
    },

    /// Print the detection catalog as JSON
    Catalog {
        /// Catalog file to validate and print instead of the built-in one
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
}

#[derive(Args)]
struct EngineArgs {
    /// Detection catalog JSON (built-in catalog when omitted)
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Skip LLM validation
    #[arg(long)]
    no_llm: bool,

    /// Skip semantic matching
    #[arg(long)]
    no_semantic: bool,

    /// Also ask the LLM about points the other engines are already sure of
    #[arg(long)]
    secondary_analysis: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            input,
            output,
            human_readable,
            engines,
        } => {
            setup_logging(engines.verbose);
            let workflow = build_workflow(&engines, PipelineConfig::default()).await?;
            analyze_call(&workflow, &input, output.as_deref(), human_readable.as_deref()).await
        }
        Commands::Batch {
            inputs,
            output_dir,
            fail_fast,
            max_concurrent_calls,
            engines,
        } => {
            setup_logging(engines.verbose);
            let config = PipelineConfig {
                max_concurrent_calls,
                ..Default::default()
            };
            let workflow = build_workflow(&engines, config).await?;
            analyze_batch(&workflow, &inputs, &output_dir, fail_fast).await
        }
        Commands::Catalog { catalog } => {
            let catalog = load_catalog(catalog.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&catalog)?);
            Ok(())
        }
    }
}

fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn load_catalog(path: Option<&Path>) -> Result<DetectionCatalog> {
    match path {
        Some(path) => {
            info!("Loading catalog from {:?}", path);
            DetectionCatalog::from_file(path)
        }
        None => DetectionCatalog::builtin().context("Built-in catalog is invalid"),
    }
}

async fn build_workflow(args: &EngineArgs, mut config: PipelineConfig) -> Result<Workflow> {
    let catalog = load_catalog(args.catalog.as_deref())?;

    let llm: Option<Arc<dyn LlmBackend>> = if args.no_llm {
        info!("LLM validation disabled (--no-llm)");
        None
    } else {
        match AnthropicConfig::from_env() {
            Ok(api_config) => {
                info!("LLM validation using {}", api_config.model);
                Some(Arc::new(AnthropicClient::new(api_config)))
            }
            Err(e) => {
                warn!("LLM validation disabled: {:#}", e);
                None
            }
        }
    };

    let embedder: Option<Arc<dyn Embedder>> = if args.no_semantic {
        info!("Semantic matching disabled (--no-semantic)");
        None
    } else {
        match EmbeddingConfig::from_env() {
            Ok(embedding_config) => Some(Arc::new(HttpEmbedder::new(embedding_config)?)),
            Err(e) => {
                warn!("Semantic matching disabled: {:#}", e);
                None
            }
        }
    };

    config.validator.secondary_analysis = args.secondary_analysis;

    Ok(Workflow::build(Arc::new(catalog), llm, embedder, config).await)
}

async fn analyze_call(
    workflow: &Workflow,
    input: &Path,
    output: Option<&Path>,
    human_readable: Option<&Path>,
) -> Result<()> {
    info!("Loading call from {:?}", input);
    let call = read_call_file(input)?;
    info!("Loaded call {} ({} utterances)", call.call_id, call.utterances.len());

    let result = workflow.execute(call).await;
    log_stats(workflow)?;
    let report = result?;

    match output {
        Some(path) => {
            write_json(&report, path)?;
            info!("Report written to {:?}", path);
        }
        None => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    if let Some(path) = human_readable {
        HumanReport::new(&report).write_file(path)?;
        info!("Summary written to {:?}", path);
    }

    Ok(())
}

async fn analyze_batch(
    workflow: &Workflow,
    inputs: &[PathBuf],
    output_dir: &Path,
    fail_fast: bool,
) -> Result<()> {
    let files = collect_call_files(inputs)?;
    info!("Found {} call files", files.len());

    let mut seen_ids = HashSet::new();
    let mut calls = Vec::with_capacity(files.len());
    let mut unreadable = Vec::new();
    for path in &files {
        match read_call_file(path) {
            Ok(mut call) => {
                let call_id = unique_call_id(&mut seen_ids, &call.call_id);
                if call_id != call.call_id {
                    warn!("Duplicate call id {} in {:?}, using {}", call.call_id, path, call_id);
                    call.call_id = call_id;
                }
                calls.push(call)
            }
            Err(e) => {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                let call_id = unique_call_id(&mut seen_ids, &stem);
                warn!("Could not read {:?}: {:#}", path, e);
                if fail_fast {
                    bail!("Failed to read {:?} (--fail-fast): {:#}", path, e);
                }
                unreadable.push(FailureRecord {
                    call_id,
                    kind: FailureKind::ParseError,
                    reason: format!("{:#}", e),
                });
            }
        }
    }

    let mut outcomes = execute_batch(workflow, calls, !fail_fast).await;
    outcomes.extend(unreadable.into_iter().map(BatchOutcome::Failure));

    let summary = write_batch_outputs(&outcomes, output_dir)?;
    info!(
        "Batch: {} succeeded, {} failed, {} skipped (output in {:?})",
        summary.succeeded, summary.failed, summary.skipped, output_dir
    );
    log_stats(workflow)?;

    if summary.succeeded == 0 && summary.total > 0 {
        bail!("No call in the batch could be analyzed");
    }
    Ok(())
}

/// Expand directories into their `.json` and `.txt` files
fn collect_call_files(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found = Vec::new();
            for entry in std::fs::read_dir(input)
                .with_context(|| format!("Failed to read directory: {:?}", input))?
            {
                let path = entry?.path();
                let is_call = path.extension().is_some_and(|ext| {
                    ext.eq_ignore_ascii_case("json") || ext.eq_ignore_ascii_case("txt")
                });
                if path.is_file() && is_call {
                    found.push(path);
                }
            }
            found.sort();
            files.extend(found);
        } else {
            files.push(input.clone());
        }
    }
    Ok(files)
}

fn log_stats(workflow: &Workflow) -> Result<()> {
    let snapshot = workflow.stats().snapshot();
    info!(
        "Stats: {} points ({} degraded), avg confidence {:.3}, {} LLM calls, {} cache hits",
        snapshot.points_processed,
        snapshot.points_degraded,
        snapshot.average_confidence,
        snapshot.llm_calls,
        snapshot.cache_hits
    );
    eprintln!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
