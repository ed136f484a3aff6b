//! # Safepoint CLI
//!
//! Hook entry point and standalone utilities for the safepoint
//! checkpointing library.
//!
//! ## Usage
//! ```bash
//! # Called by the assistant's hook protocol (payload on stdin)
//! safepoint hook < payload.json
//!
//! # Inspect checkpoints
//! safepoint list
//! safepoint status
//!
//! # Roll back
//! safepoint restore <snapshot-id>
//! safepoint diff <snapshot-id>
//!
//! # Retention
//! safepoint cleanup --all --dry-run
//! ```

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use safepoint::checkpoint::{cleanup_projects, reclaim_orphans, CheckpointOutcome, SkipReason};
use safepoint::metadata::MetadataStore;
use safepoint::snapshot::SnapshotEngine;
use safepoint::{
    config, CheckpointConfig, Checkpointer, HookPayload, SnapshotInfo, SnapshotStore,
};
use std::io::{IsTerminal, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

/// Safepoint CLI - checkpoint and restore project states around edits
#[derive(Parser)]
#[command(name = "safepoint")]
#[command(version)]
#[command(about = "Automatic pre-edit checkpoints with restore and retention tooling")]
#[command(long_about = None)]
struct Cli {
    /// Project directory (defaults to current)
    #[arg(short, long, global = true)]
    path: Option<PathBuf>,

    /// Checkpoint storage base (defaults to the configured data dir)
    #[arg(short, long, global = true)]
    base: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process a hook payload from stdin (pre or post phase auto-detected)
    Hook,

    /// List checkpoints
    #[command(alias = "ls")]
    List {
        /// Limit results
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Only checkpoints whose message contains this text
        #[arg(short, long)]
        search: Option<String>,

        /// Only checkpoints that touched this file
        #[arg(short, long)]
        file: Option<String>,
    },

    /// Restore the project to a checkpoint
    #[command(alias = "rs")]
    Restore {
        /// Snapshot ID or unambiguous prefix; prompts when omitted
        snapshot: Option<String>,

        /// Report what would change without touching anything
        #[arg(long)]
        dry_run: bool,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Show changed paths against a checkpoint (latest when omitted)
    Diff {
        /// Snapshot ID or prefix
        snapshot: Option<String>,
    },

    /// Show checkpoint statistics for the project
    Status,

    /// Remove expired checkpoints
    Cleanup {
        /// Report what would be removed without removing it
        #[arg(long)]
        dry_run: bool,

        /// Clean every project, not just the current one
        #[arg(long)]
        all: bool,

        /// Also reclaim storage directories with no metadata
        #[arg(long)]
        orphans: bool,

        /// Additionally cap each project at this many newest records
        #[arg(short, long)]
        keep: Option<usize>,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_env("SAFEPOINT_LOG")
        .unwrap_or_else(|_| {
            let level = if cli.verbose { "debug" } else { "warn" };
            tracing_subscriber::EnvFilter::new(format!("safepoint={}", level))
        });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let project_path = cli.path.unwrap_or_else(|| PathBuf::from("."));
    let base = cli.base.unwrap_or_else(config::checkpoint_base);
    let config = CheckpointConfig::load_default();

    match cli.command {
        Commands::Hook => cmd_hook(project_path, config, base),
        Commands::List {
            limit,
            search,
            file,
        } => cmd_list(project_path, config, base, limit, search, file),
        Commands::Restore {
            snapshot,
            dry_run,
            yes,
        } => cmd_restore(project_path, config, base, snapshot, dry_run, yes),
        Commands::Diff { snapshot } => cmd_diff(project_path, config, base, snapshot),
        Commands::Status => cmd_status(project_path, config, base),
        Commands::Cleanup {
            dry_run,
            all,
            orphans,
            keep,
        } => cmd_cleanup(project_path, config, base, dry_run, all, orphans, keep),
    }
}

/// Handle one hook invocation
///
/// This path must never block the host tool: every problem is reported on
/// stderr and the process still exits 0.
fn cmd_hook(project_path: PathBuf, config: CheckpointConfig, base: PathBuf) -> anyhow::Result<()> {
    let mut raw = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut raw) {
        eprintln!("Warning: could not read hook payload: {}", e);
        return Ok(());
    }
    let payload = match HookPayload::from_json(&raw) {
        Ok(payload) => payload,
        Err(e) => {
            eprintln!("Warning: invalid hook payload: {}", e);
            return Ok(());
        }
    };

    let checkpointer = Checkpointer::new(project_path, config, base);

    if payload.is_post_phase() {
        if let Err(e) = checkpointer.finalize(&payload) {
            eprintln!("Warning: could not finalize checkpoint: {}", e);
        }
        return Ok(());
    }

    match checkpointer.maybe_checkpoint(&payload) {
        CheckpointOutcome::Created { snapshot_id } => {
            eprintln!("Created checkpoint: {}", &snapshot_id[..8]);
        }
        CheckpointOutcome::Skipped(SkipReason::ExcludedPath(path)) => {
            eprintln!("Skipping checkpoint for excluded file: {}", path.display());
        }
        CheckpointOutcome::Skipped(_) => {}
        CheckpointOutcome::Failed => {
            eprintln!("Warning: Could not create checkpoint");
        }
    }
    Ok(())
}

fn cmd_list(
    project_path: PathBuf,
    config: CheckpointConfig,
    base: PathBuf,
    limit: usize,
    search: Option<String>,
    file: Option<String>,
) -> anyhow::Result<()> {
    let store = SnapshotStore::new(&project_path, &base, &config);
    let metadata = MetadataStore::new(&base);

    let mut snapshots = store.list();
    if let Some(term) = &search {
        snapshots.retain(|s| s.message.contains(term.as_str()));
    }
    if let Some(file) = &file {
        let touching: Vec<String> = metadata
            .find_by_file(store.project_id(), file)
            .into_iter()
            .map(|cp| cp.id)
            .collect();
        snapshots.retain(|s| touching.contains(&s.id));
    }

    if snapshots.is_empty() {
        println!("No checkpoints found for this project.");
        return Ok(());
    }

    let total = snapshots.len();
    println!(
        "\nCheckpoints for: {}",
        project_path.display().to_string().cyan()
    );
    println!("{}", "=".repeat(70));

    for (i, snapshot) in snapshots.iter().take(limit).enumerate() {
        let record = metadata.get(store.project_id(), &snapshot.id);
        let status_icon = match record.as_ref().map(|r| r.status) {
            Some(safepoint::CheckpointStatus::Success) => "✓".green(),
            Some(safepoint::CheckpointStatus::Failed) => "✗".red(),
            Some(safepoint::CheckpointStatus::Pending) => "⋯".yellow(),
            None => "?".dimmed(),
        };

        println!(
            "{}. [{}] {} - {}",
            i + 1,
            status_icon,
            snapshot.id[..8].yellow(),
            relative_time(snapshot)
        );
        println!("   {}", snapshot.message);
        if let Some(record) = &record {
            if !record.files_affected.is_empty() {
                println!("   Files: {}", record.files_affected.join(", ").dimmed());
            }
        }
    }

    if total > limit {
        println!("\nShowing {} most recent checkpoints out of {} total.", limit, total);
    }
    Ok(())
}

fn cmd_restore(
    project_path: PathBuf,
    config: CheckpointConfig,
    base: PathBuf,
    snapshot: Option<String>,
    dry_run: bool,
    yes: bool,
) -> anyhow::Result<()> {
    let store = SnapshotStore::new(&project_path, &base, &config);

    let requested = match snapshot {
        Some(id) => id,
        None => select_interactively(&store)?,
    };
    let target = store
        .resolve(&requested)
        .map_err(|e| anyhow!("{}", e.user_message()))?;

    println!(
        "{} {}",
        "Restoring to checkpoint".blue().bold(),
        target[..8].yellow()
    );

    let diff = store
        .diff_stat(Some(&target))
        .map_err(|e| anyhow!("{}", e.user_message()))?;
    println!("\nChanges that will be applied:");
    println!("{}", "-".repeat(70));
    print!("{}", diff);
    println!("{}", "-".repeat(70));

    if dry_run {
        let report = store
            .restore(&target, true)
            .map_err(|e| anyhow!("{}", e.user_message()))?;
        println!(
            "Dry run: {} files would be written, {} deleted.",
            report.files_restored, report.files_deleted
        );
        return Ok(());
    }

    if !yes && !confirm("Restore to this checkpoint? [y/N]: ")? {
        println!("Restoration cancelled.");
        return Ok(());
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap(),
    );
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message("Restoring files...");

    let result = store.restore(&target, false);
    spinner.finish_and_clear();
    let report = result.map_err(|e| anyhow!("{}", e.user_message()))?;

    println!("{} Restoration complete", "✓".green().bold());
    println!("  Files restored: {}", report.files_restored.to_string().cyan());
    println!("  Files deleted: {}", report.files_deleted.to_string().yellow());
    println!(
        "  Bytes written: {}",
        safepoint::format_bytes(report.bytes_written).cyan()
    );
    for warning in &report.warnings {
        println!("  {} {}", "Warning:".yellow(), warning);
    }
    Ok(())
}

fn cmd_diff(
    project_path: PathBuf,
    config: CheckpointConfig,
    base: PathBuf,
    snapshot: Option<String>,
) -> anyhow::Result<()> {
    let store = SnapshotStore::new(&project_path, &base, &config);
    let text = store
        .diff_stat(snapshot.as_deref())
        .map_err(|e| anyhow!("{}", e.user_message()))?;
    print!("{}", text);
    Ok(())
}

fn cmd_status(
    project_path: PathBuf,
    config: CheckpointConfig,
    base: PathBuf,
) -> anyhow::Result<()> {
    let checkpointer = Checkpointer::new(&project_path, config, base);
    let stats = checkpointer.stats();

    println!("Checkpoint status for: {}", project_path.display().to_string().cyan());
    println!("Project id: {}", checkpointer.project_id().yellow());
    println!("{}", "-".repeat(50));
    println!("Total checkpoints: {}", stats.total);
    println!("Successful: {}", stats.successful.to_string().green());
    println!("Failed: {}", stats.failed.to_string().red());
    println!("Pending: {}", stats.pending.to_string().yellow());

    if let Some(latest) = stats.latest {
        println!("Latest checkpoint: {}", latest.to_rfc3339());
    }
    if !stats.most_modified_files.is_empty() {
        println!("\nMost modified files:");
        for (file, count) in &stats.most_modified_files {
            println!("  {}: {} times", file, count);
        }
    }
    Ok(())
}

fn cmd_cleanup(
    project_path: PathBuf,
    config: CheckpointConfig,
    base: PathBuf,
    dry_run: bool,
    all: bool,
    orphans: bool,
    keep: Option<usize>,
) -> anyhow::Result<()> {
    let metadata = MetadataStore::new(&base);
    let project_ids = if all {
        metadata.project_ids()
    } else {
        vec![safepoint::project_id(&project_path.canonicalize().unwrap_or(project_path.clone()))]
    };

    let outcome = cleanup_projects(&base, &config, &project_ids, keep, dry_run)
        .map_err(|e| anyhow!("{}", e.user_message()))?;

    let verb = if dry_run { "Would remove" } else { "Removed" };
    println!(
        "{} {} checkpoint records (retention: {} days).",
        verb, outcome.records_removed, config.retention_days
    );
    if !dry_run && outcome.snapshots_removed > 0 {
        println!(
            "Pruned {} snapshots and {} unreferenced objects.",
            outcome.snapshots_removed, outcome.objects_removed
        );
    }

    if orphans {
        let reclaimed = reclaim_orphans(&base, &config, dry_run)
            .map_err(|e| anyhow!("{}", e.user_message()))?;
        if reclaimed.is_empty() {
            println!("No orphaned storage found.");
        } else {
            println!("{} {} orphaned storage directories:", verb, reclaimed.len());
            for name in reclaimed {
                println!("  {}", name);
            }
        }
    }
    Ok(())
}

/// Numbered prompt over the checkpoint list, as a fallback for restore
/// without an id. Accepts an index, an id prefix, or `q` to abort.
fn select_interactively(store: &SnapshotStore) -> anyhow::Result<String> {
    let snapshots = store.list();
    if snapshots.is_empty() {
        return Err(anyhow!("No checkpoints found for this project."));
    }
    if !std::io::stdin().is_terminal() {
        return Err(anyhow!("No snapshot id given and stdin is not a terminal."));
    }

    for (i, snapshot) in snapshots.iter().enumerate() {
        println!(
            "{}. {} - {} ({})",
            i + 1,
            snapshot.id[..8].yellow(),
            snapshot.message,
            relative_time(snapshot)
        );
    }

    loop {
        print!("\nEnter checkpoint number, ID prefix, or 'q' to quit: ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line)? == 0 {
            return Err(anyhow!("Restoration cancelled."));
        }
        let choice = line.trim();

        if choice.eq_ignore_ascii_case("q") {
            return Err(anyhow!("Restoration cancelled."));
        }
        if let Ok(index) = choice.parse::<usize>() {
            if index >= 1 && index <= snapshots.len() {
                return Ok(snapshots[index - 1].id.clone());
            }
            println!("Invalid number. Please enter 1-{}.", snapshots.len());
            continue;
        }
        match store.resolve(choice) {
            Ok(id) => return Ok(id),
            Err(e) => println!("{}", e.user_message()),
        }
    }
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{}", prompt);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("could not read confirmation")?;
    Ok(line.trim().eq_ignore_ascii_case("y"))
}

/// Render a snapshot's age like "5m ago", falling back to the raw
/// timestamp for unparseable legacy entries
fn relative_time(snapshot: &SnapshotInfo) -> String {
    let Ok(parsed) = DateTime::parse_from_rfc3339(&snapshot.timestamp) else {
        return snapshot.timestamp.clone();
    };
    let age = Utc::now().signed_duration_since(parsed.with_timezone(&Utc));
    let secs = age.num_seconds().max(0) as u64;

    if secs < 60 {
        return "just now".to_string();
    }
    // Truncate to the coarsest sensible unit before formatting
    let truncated = if secs < 3600 {
        secs - secs % 60
    } else if secs < 86_400 {
        secs - secs % 3600
    } else {
        secs - secs % 86_400
    };
    format!("{} ago", humantime::format_duration(Duration::from_secs(truncated)))
}
