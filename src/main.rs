//! Screen Eval CLI
//!
//! Scores VLM screen descriptions against annotated references with an LLM judge.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use screen_eval::{
    aggregate::{aggregate, exclude_unmatched},
    annotations::AnnotationStore,
    config::Config,
    generation::{ResultSet, discover_result_files, load_metadata_sidecar},
    identity::{RunIdentity, RunMetadata, resolve_with_fallback},
    judge::LlmJudge,
    llm::LlmClient,
    pipeline::{CancelFlag, EvaluationPipeline},
    report::{
        StoredRun, StoredSummary, eval_csv_for_summary, load_any, load_stored, save_report,
        write_run_outputs,
    },
    rubric::RubricEvaluator,
    scorer::CoverageScorer,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// Screen Eval - LLM-judged scoring of VLM screen descriptions
#[derive(Parser)]
#[command(name = "screen-eval")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct EvaluateArgs {
    /// Annotation file (JSON)
    #[arg(short, long)]
    annotations: PathBuf,

    /// Result files (.csv/.json) or directories containing them
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Directory for evaluation tables and summaries
    #[arg(short, long, default_value = "reports")]
    output_dir: PathBuf,

    /// Also write a full report snapshot per run ("json" or "bin")
    #[arg(long)]
    snapshot: Option<String>,

    /// Pass threshold for both criteria
    #[arg(long)]
    threshold: Option<f64>,

    /// Pass threshold for reference coverage
    #[arg(long)]
    reference_threshold: Option<f64>,

    /// Pass threshold for must-include coverage
    #[arg(long)]
    must_include_threshold: Option<f64>,

    /// Samples scored at once (1 = sequential)
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    /// Per judge call timeout in seconds (0 = no deadline)
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Retries after a judge timeout
    #[arg(long)]
    max_retries: Option<u32>,

    /// Model name, overriding metadata and file name
    #[arg(long)]
    model: Option<String>,

    /// Prompt version, overriding metadata and file name
    #[arg(long)]
    prompt_version: Option<String>,

    /// Run timestamp, overriding metadata and file name
    #[arg(long)]
    timestamp: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Score generation result sets with the judge model
    Evaluate(EvaluateArgs),

    /// Recompute and print statistics for a stored run
    Summarize {
        /// Evaluation table (`__eval.csv`), summary (`__eval.summary.json`) or report snapshot
        path: PathBuf,

        /// Re-check samples against this annotation file
        #[arg(short, long)]
        annotations: Option<PathBuf>,
    },

    /// Compare stored runs across models and prompt versions
    Compare {
        /// Summaries, evaluation tables, snapshots or directories
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Show the run identity resolved for a file
    Identity {
        /// Result file or evaluation output
        path: PathBuf,
    },

    /// Test judge connection
    Test,
}

fn main() {
    init_tracing();

    if let Err(err) = run() {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load().context("Failed to load configuration")?,
    };

    match cli.command {
        Commands::Evaluate(args) => cmd_evaluate(config, args).await,
        Commands::Summarize { path, annotations } => cmd_summarize(path, annotations),
        Commands::Compare { paths } => cmd_compare(paths),
        Commands::Identity { path } => cmd_identity(path),
        Commands::Test => cmd_test(config).await,
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn apply_overrides(config: &mut Config, args: &EvaluateArgs) {
    if let Some(t) = args.threshold {
        config.eval.reference_threshold = t;
        config.eval.must_include_threshold = t;
    }
    if let Some(t) = args.reference_threshold {
        config.eval.reference_threshold = t;
    }
    if let Some(t) = args.must_include_threshold {
        config.eval.must_include_threshold = t;
    }
    if let Some(n) = args.concurrency {
        config.eval.concurrency = n;
    }
    if let Some(secs) = args.timeout_secs {
        config.eval.timeout_secs = Some(secs);
    }
    if let Some(n) = args.max_retries {
        config.eval.max_retries = n;
    }
}

async fn cmd_evaluate(mut config: Config, args: EvaluateArgs) -> Result<()> {
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    let snapshot_ext = match args.snapshot.as_deref() {
        None => None,
        Some(ext @ ("json" | "bin")) => Some(ext.to_string()),
        Some(other) => anyhow::bail!("--snapshot must be 'json' or 'bin', got '{}'", other),
    };

    let store = AnnotationStore::load(&args.annotations).context("Failed to load annotations")?;
    let files = discover_result_files(&args.inputs).context("Failed to collect result files")?;
    if files.is_empty() {
        anyhow::bail!("No result files found in the given inputs");
    }

    // Load everything up front so malformed inputs fail before any judge call.
    let mut sets = Vec::with_capacity(files.len());
    for file in &files {
        let set = ResultSet::load(file)
            .with_context(|| format!("Failed to load result set {}", file.display()))?;
        sets.push(set);
    }

    let overrides = RunMetadata {
        model: args.model.clone(),
        prompt_version: args.prompt_version.clone(),
        timestamp: args.timestamp.clone(),
    };

    info!(
        judge = %config.judge.model,
        result_sets = sets.len(),
        annotations = store.len(),
        "evaluating"
    );

    let judge = Arc::new(LlmJudge::from_config(config.judge.clone()));
    let evaluator = RubricEvaluator::new(judge, config.eval.retry_policy());
    let scorer = CoverageScorer::new(evaluator, config.eval.thresholds());
    let pipeline = EvaluationPipeline::new(scorer, config.eval.concurrency);

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing samples in flight");
                cancel.cancel();
            }
        });
    }

    let mut failures = 0usize;
    for set in &sets {
        if cancel.is_cancelled() {
            warn!(source = %set.source.display(), "skipping result set after interrupt");
            continue;
        }

        let report = match pipeline
            .evaluate_result_set(set, &store, &overrides, &cancel)
            .await
        {
            Ok(report) => report,
            Err(err) => {
                error!(source = %set.source.display(), error = %err, "run aborted");
                failures += 1;
                continue;
            }
        };

        report.print_summary();
        let outputs = write_run_outputs(&report, &args.output_dir)
            .with_context(|| format!("Failed to write report for {}", report.identity))?;
        println!("Evaluation table: {}", outputs.eval_csv.display());
        println!("Summary:          {}", outputs.summary.display());

        if let Some(ext) = &snapshot_ext {
            let path = args
                .output_dir
                .join(format!("{}__eval.report.{}", report.identity.file_stem(), ext));
            save_report(&report, &path).context("Failed to save report snapshot")?;
            println!("Snapshot:         {}", path.display());
        }
    }

    if failures > 0 {
        anyhow::bail!("{} of {} result sets failed", failures, sets.len());
    }
    Ok(())
}

fn cmd_summarize(path: PathBuf, annotations: Option<PathBuf>) -> Result<()> {
    let stored =
        load_stored(&path).with_context(|| format!("Failed to load stored run {}", path.display()))?;

    let Some(annotations) = annotations else {
        stored.print_summary();
        return Ok(());
    };

    let mut report = match stored {
        StoredRun::Full(report) => report,
        StoredRun::SummaryOnly(_) => anyhow::bail!(
            "Re-checking against annotations needs the evaluation table {}",
            eval_csv_for_summary(&path).display()
        ),
    };

    let store = AnnotationStore::load(&annotations).context("Failed to load annotations")?;
    let (samples, dropped) = exclude_unmatched(report.samples, &store);
    for image_id in &dropped {
        warn!(%image_id, "stored sample has no annotation, excluding");
    }
    let mut skipped = report.skipped;
    skipped.unmatched.extend(dropped);
    let evaluated_at = report.evaluated_at;
    report = aggregate(report.identity, samples, skipped);
    report.evaluated_at = evaluated_at;

    report.print_summary();
    Ok(())
}

/// Collect stored runs from files and directories.
fn collect_stored(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in WalkDir::new(path) {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy();
                if entry.file_type().is_file() && name.ends_with("__eval.summary.json") {
                    files.push(entry.path().to_path_buf());
                }
            }
        } else {
            files.push(path.clone());
        }
    }
    Ok(files)
}

fn cmd_compare(paths: Vec<PathBuf>) -> Result<()> {
    let mut runs: BTreeMap<RunIdentity, StoredSummary> = BTreeMap::new();

    for file in collect_stored(&paths)? {
        let stored = load_any(&file).with_context(|| format!("Failed to load {}", file.display()))?;
        if runs.contains_key(&stored.identity) {
            warn!(run = %stored.identity, file = %file.display(), "duplicate run, keeping first");
            continue;
        }
        runs.insert(stored.identity.clone(), stored);
    }

    if runs.is_empty() {
        println!("No stored runs found.");
        return Ok(());
    }

    let fmt_opt = |v: Option<f64>| v.map(|v| format!("{:.3}", v)).unwrap_or_else(|| "n/a".to_string());

    println!(
        "{:<28} {:<14} {:<17} {:>6} {:>6} {:>8} {:>8} {:>8} {:>8}",
        "model", "prompt", "timestamp", "eval", "pass", "partial", "unmatch", "ref", "must"
    );
    println!("{}", "─".repeat(112));
    for (identity, stored) in &runs {
        let s = &stored.summary;
        println!(
            "{:<28} {:<14} {:<17} {:>6} {:>6} {:>8} {:>8} {:>8} {:>8}",
            identity.model,
            identity.prompt_version,
            identity.timestamp,
            s.evaluated,
            s.passed,
            s.partial,
            s.unmatched,
            fmt_opt(s.reference_coverage.mean_score),
            fmt_opt(s.must_include.mean_score),
        );
    }
    println!("{}", "─".repeat(112));
    println!("{} runs", runs.len());

    Ok(())
}

fn cmd_identity(path: PathBuf) -> Result<()> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let metadata = sidecar_metadata(&path)?;
    let identity = resolve_with_fallback(metadata.as_ref(), &name)?;

    println!("Model:          {}", identity.model);
    println!("Prompt version: {}", identity.prompt_version);
    println!("Timestamp:      {}", identity.timestamp);
    println!("Eval table:     {}", identity.eval_csv_name());
    Ok(())
}

fn sidecar_metadata(path: &Path) -> Result<Option<RunMetadata>> {
    if path.exists() {
        Ok(load_metadata_sidecar(path)?)
    } else {
        Ok(None)
    }
}

async fn cmd_test(config: Config) -> Result<()> {
    println!("Testing judge connection...\n");

    println!("Configuration:");
    println!("  API Base:  {}", config.judge.api_base);
    println!("  Model:     {}", config.judge.model);
    println!(
        "  API Key:   {}...",
        config.judge.api_key.chars().take(8).collect::<String>()
    );
    println!();

    if let Err(e) = config.validate() {
        println!("Configuration error: {}", e);
        return Ok(());
    }

    let client = LlmClient::new(config.judge);

    println!("Sending test request...");
    match client.test_connection().await {
        Ok(()) => {
            println!("Connection successful!");
        }
        Err(e) => {
            println!("Connection failed: {}", e);
        }
    }

    Ok(())
}
