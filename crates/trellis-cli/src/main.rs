//! Trellis - reproducible ML pipelines CLI
//!
//! The `trellis` command runs declarative stage pipelines with
//! content-addressed caching and experiment tracking.
//!
//! ## Commands
//!
//! - `init`: create the workspace layout
//! - `repro`: run stale stages in dependency order
//! - `status`: show which stages would run and why
//! - `dag`: print the stage graph
//! - `exp`: run, compare, apply and remove experiments
//! - `metrics`: show or diff metric values
//! - `push` / `pull`: sync cached artifacts with a remote store
//! - `report`: render a Markdown run report

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;

use trellis_core::{
    render_comparison, ExperimentTracker, PipelineDef, ReproOptions, RunReport, Runner,
    StageOutcome, Workspace,
};
use trellis_remote::{RemoteConfig, SyncReport};

#[derive(Parser)]
#[command(name = "trellis")]
#[command(author = "Trellis Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Reproducible ML pipelines with experiment tracking", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a trellis workspace
    Init {
        /// Path to initialize (default: current directory)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Run stale pipeline stages in dependency order
    Repro {
        /// Run only this stage and its ancestors
        stage: Option<String>,

        /// Re-run every selected stage even when fresh
        #[arg(short, long)]
        force: bool,
    },

    /// Report stage freshness (exit code 1 when anything is stale)
    Status {
        /// Check only this stage and its ancestors
        stage: Option<String>,
    },

    /// Print stages in execution order with their dependency edges
    Dag,

    /// Experiment tracking
    Exp {
        #[command(subcommand)]
        action: ExpAction,
    },

    /// Metric values from pipeline metrics files
    Metrics {
        #[command(subcommand)]
        action: MetricsAction,
    },

    /// Upload cached artifacts to the remote store
    Push {
        /// Remote url (overrides TRELLIS_REMOTE and workspace config)
        #[arg(long)]
        remote: Option<String>,
    },

    /// Download recorded artifacts from the remote store
    Pull {
        /// Remote url (overrides TRELLIS_REMOTE and workspace config)
        #[arg(long)]
        remote: Option<String>,
    },

    /// Render a Markdown report of the workspace (stages, params, metrics)
    Report {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ExpAction {
    /// Run the pipeline with overridden params and capture a run record
    Run {
        /// Parameter override (repeatable)
        #[arg(long = "set", value_name = "SECTION.KEY=VALUE")]
        set: Vec<String>,

        /// Name for the experiment
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Compare captured experiments side by side
    Show,

    /// Promote an experiment's results into the workspace
    Apply {
        /// Experiment id prefix or name
        id: String,
    },

    /// Delete an experiment record (cached artifacts are kept)
    Remove {
        /// Experiment id prefix or name
        id: String,
    },
}

#[derive(Subcommand)]
enum MetricsAction {
    /// Show current workspace metrics
    Show,

    /// Diff metrics between experiments, or an experiment and the workspace
    Diff {
        /// Baseline experiment id or name
        old: String,

        /// Other experiment id or name (default: current workspace metrics)
        new: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    trellis_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Init { path } => cmd_init(&path),
        Commands::Repro { stage, force } => cmd_repro(&workspace()?, stage, force).await,
        Commands::Status { stage } => cmd_status(&workspace()?, stage.as_deref()),
        Commands::Dag => cmd_dag(&workspace()?),
        Commands::Exp { action } => match action {
            ExpAction::Run { set, name } => cmd_exp_run(&workspace()?, &set, name).await,
            ExpAction::Show => cmd_exp_show(&workspace()?),
            ExpAction::Apply { id } => cmd_exp_apply(&workspace()?, &id),
            ExpAction::Remove { id } => cmd_exp_remove(&workspace()?, &id),
        },
        Commands::Metrics { action } => match action {
            MetricsAction::Show => cmd_metrics_show(&workspace()?),
            MetricsAction::Diff { old, new } => {
                cmd_metrics_diff(&workspace()?, &old, new.as_deref())
            }
        },
        Commands::Push { remote } => cmd_push(&workspace()?, remote.as_deref()).await,
        Commands::Pull { remote } => cmd_pull(&workspace()?, remote.as_deref()).await,
        Commands::Report { output } => cmd_report(&workspace()?, output.as_deref()),
    }
}

/// Find the enclosing workspace from the current directory.
fn workspace() -> Result<Workspace> {
    let cwd = std::env::current_dir().context("failed to get current directory")?;
    Ok(Workspace::discover(&cwd)?)
}

/// Initialize a trellis workspace
fn cmd_init(path: &Path) -> Result<()> {
    let ws = Workspace::init(path)?;
    println!("Initialized trellis workspace at {}", ws.root().display());
    println!("Describe stages in trellis.yaml and parameters in params.yaml to get started.");
    Ok(())
}

/// Run stale pipeline stages
async fn cmd_repro(ws: &Workspace, stage: Option<String>, force: bool) -> Result<()> {
    let runner = Runner::load(ws)?;
    let opts = ReproOptions {
        target: stage,
        force,
    };
    let summary = runner.repro(&opts).await?;

    for report in &summary.reports {
        match &report.outcome {
            StageOutcome::Skipped => println!("  - {} (fresh)", report.stage),
            StageOutcome::Executed { duration_ms } => {
                let reasons = join_display(&report.reasons);
                println!("  ✓ {} ({}ms; {})", report.stage, duration_ms, reasons);
            }
        }
    }

    println!();
    println!(
        "Summary: {} executed, {} skipped in {}ms",
        summary.executed_count(),
        summary.skipped_count(),
        summary.duration_ms
    );
    Ok(())
}

/// Report stage freshness without running anything
fn cmd_status(ws: &Workspace, stage: Option<&str>) -> Result<()> {
    let runner = Runner::load(ws)?;
    let statuses = runner.status(stage)?;

    let mut stale = 0usize;
    for status in &statuses {
        if status.is_fresh() {
            println!("  ✓ {} fresh", status.stage);
        } else {
            stale += 1;
            println!("  ✗ {} stale ({})", status.stage, join_display(&status.reasons));
        }
    }

    if stale > 0 {
        anyhow::bail!("{} of {} stages are stale", stale, statuses.len());
    }
    println!();
    println!("Pipeline is up to date.");
    Ok(())
}

/// Print the stage graph in execution order
fn cmd_dag(ws: &Workspace) -> Result<()> {
    let runner = Runner::load(ws)?;
    for name in runner.graph().order() {
        let upstream: Vec<&str> = runner.graph().direct_upstream(name).collect();
        if upstream.is_empty() {
            println!("{name}");
        } else {
            println!("{name} <- {}", upstream.join(", "));
        }
    }
    Ok(())
}

/// Run an experiment and capture its record
async fn cmd_exp_run(ws: &Workspace, overrides: &[String], name: Option<String>) -> Result<()> {
    let tracker = ExperimentTracker::new(ws);
    let record = tracker
        .run(overrides, name, &ReproOptions::default())
        .await?;

    println!(
        "Captured experiment {} ({})",
        record.label(),
        record.short_id()
    );
    println!(
        "  {} executed, {} skipped in {}ms",
        record.executed, record.skipped, record.duration_ms
    );
    if !record.metrics.is_empty() {
        println!();
        print!("{}", trellis_core::metrics::render_table(&record.metrics));
    }
    Ok(())
}

/// Compare captured experiments
fn cmd_exp_show(ws: &Workspace) -> Result<()> {
    let records = ExperimentTracker::new(ws).list()?;
    if records.is_empty() {
        println!("No experiments captured. Run 'trellis exp run' first.");
        return Ok(());
    }
    print!("{}", render_comparison(&records));
    Ok(())
}

/// Promote an experiment into the workspace
fn cmd_exp_apply(ws: &Workspace, id: &str) -> Result<()> {
    let record = ExperimentTracker::new(ws).apply(id)?;
    println!("Applied experiment {} to the workspace", record.label());
    println!("  outputs, lock and params now match the recorded run");
    Ok(())
}

/// Delete an experiment record
fn cmd_exp_remove(ws: &Workspace, id: &str) -> Result<()> {
    let record = ExperimentTracker::new(ws).remove(id)?;
    println!("Removed experiment {}", record.label());
    Ok(())
}

/// Show workspace metrics
fn cmd_metrics_show(ws: &Workspace) -> Result<()> {
    let pipeline = PipelineDef::load(&ws.pipeline_path())?;
    let values = trellis_core::metrics::collect_existing(ws.root(), &pipeline)?;
    print!("{}", trellis_core::metrics::render_table(&values));
    Ok(())
}

/// Diff metrics between two runs
fn cmd_metrics_diff(ws: &Workspace, old: &str, new: Option<&str>) -> Result<()> {
    let tracker = ExperimentTracker::new(ws);

    let old_values = tracker.find(old)?.metrics;
    let new_values = match new {
        Some(id) => tracker.find(id)?.metrics,
        None => {
            let pipeline = PipelineDef::load(&ws.pipeline_path())?;
            trellis_core::metrics::collect_existing(ws.root(), &pipeline)?
        }
    };

    let deltas = trellis_core::diff_metrics(&old_values, &new_values);
    print!("{}", trellis_core::metrics::render_diff_table(&deltas));
    Ok(())
}

/// Upload cached artifacts
async fn cmd_push(ws: &Workspace, remote_url: Option<&str>) -> Result<()> {
    let config = RemoteConfig::resolve(remote_url, ws)?;
    let remote = config.open()?;

    println!("Pushing to {}", remote.location());
    let report = trellis_remote::push(ws, remote.as_ref()).await?;
    print_sync_report("push", &report)
}

/// Download recorded artifacts and restore lock outputs
async fn cmd_pull(ws: &Workspace, remote_url: Option<&str>) -> Result<()> {
    let config = RemoteConfig::resolve(remote_url, ws)?;
    let remote = config.open()?;

    println!("Pulling from {}", remote.location());
    let report = trellis_remote::pull(ws, remote.as_ref()).await?;
    print_sync_report("pull", &report)
}

fn print_sync_report(direction: &str, report: &SyncReport) -> Result<()> {
    println!(
        "  {} transferred, {} already present",
        report.transferred, report.already_present
    );
    if report.is_clean() {
        return Ok(());
    }
    for failure in &report.failed {
        let short = &failure.digest[..12.min(failure.digest.len())];
        println!("  ✗ {}: {}", short, failure.error);
    }
    anyhow::bail!(
        "{} finished with {} failed objects",
        direction,
        report.failed.len()
    )
}

/// Render the Markdown run report
fn cmd_report(ws: &Workspace, output: Option<&Path>) -> Result<()> {
    let runner = Runner::load(ws)?;
    let report = RunReport::collect(ws, &runner)?;

    match output {
        Some(path) => {
            report.write(path)?;
            println!("Wrote report to {}", path.display());
        }
        None => print!("{}", report.render_markdown()),
    }
    Ok(())
}

fn join_display<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::init(dir.path()).unwrap();
        std::fs::write(ws.params_path(), "base: {seed: 7}\n").unwrap();
        std::fs::write(
            ws.pipeline_path(),
            "stages:\n  gen:\n    cmd: echo hi > out.txt\n    outs: [out.txt]\n",
        )
        .unwrap();
        (dir, ws)
    }

    #[test]
    fn init_refuses_an_initialized_directory() {
        let dir = tempfile::tempdir().unwrap();
        cmd_init(dir.path()).unwrap();
        assert!(cmd_init(dir.path()).is_err());
    }

    #[tokio::test]
    async fn repro_then_status_reports_fresh() {
        let (_dir, ws) = setup_workspace();

        // Nothing has run yet, so status exits non-zero.
        assert!(cmd_status(&ws, None).is_err());

        cmd_repro(&ws, None, false).await.unwrap();
        cmd_status(&ws, None).unwrap();
    }

    #[tokio::test]
    async fn exp_run_leaves_the_workspace_untouched() {
        let (dir, ws) = setup_workspace();
        cmd_repro(&ws, None, false).await.unwrap();
        let before = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();

        cmd_exp_run(&ws, &["base.seed=8".to_string()], Some("bump".to_string()))
            .await
            .unwrap();

        let after = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(before, after);
        assert_eq!(ExperimentTracker::new(&ws).list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn push_without_a_remote_is_an_error() {
        let (_dir, ws) = setup_workspace();
        let err = cmd_push(&ws, None).await.unwrap_err();
        assert!(err.to_string().contains("no remote configured"));
    }

    #[test]
    fn dag_renders_for_a_valid_pipeline() {
        let (_dir, ws) = setup_workspace();
        cmd_dag(&ws).unwrap();
    }
}
