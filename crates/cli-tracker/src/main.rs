use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use log::{debug, error, info, warn};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracker::{
    config::TrackerConfig,
    pipeline, recovery, scan,
    status::TaskStatus,
    task::{self, NewTask},
};

/// Lesson analysis worker with durable progress tracking
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a new task from a video and an optional outline document
    Create {
        #[arg(long)]
        course: String,
        #[arg(long)]
        teacher: String,
        #[arg(long)]
        student_type: String,
        #[arg(long)]
        video: PathBuf,
        #[arg(long)]
        outline: Option<PathBuf>,
    },
    /// Run the analysis pipeline for one task in the foreground
    Run {
        task_id: String,
        /// Run even if the task is not pending
        #[arg(long)]
        force: bool,
    },
    /// Print the derived status of one task as JSON
    Status { task_id: String },
    /// Print every task with its derived status as JSON
    List,
    /// Mark tasks left running by a dead process as failed
    Recover,
    /// Process pending tasks one at a time, forever
    Daemon,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_secs()
        .init();

    let cfg = TrackerConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    match args.command {
        Commands::Create {
            course,
            teacher,
            student_type,
            video,
            outline,
        } => {
            let new_task = NewTask {
                course_name: course,
                teacher,
                student_type,
                video,
                outline,
            };
            let (folder, metadata) = task::register_task(&cfg, &new_task)
                .context("Failed to register task")?;
            info!("Created task {} in {}", metadata.task_id, folder.display());
            print_json(&json!({ "success": true, "task_id": metadata.task_id, "data": metadata }))?;
        }
        Commands::Run { task_id, force } => {
            let summary = scan::find_task(&cfg, &task_id)?
                .with_context(|| format!("Task {} not found in {}", task_id, cfg.data_dir.display()))?;
            if summary.status != TaskStatus::Pending && !force {
                anyhow::bail!(
                    "Task {} is {} (use --force to run it again)",
                    task_id,
                    summary.status
                );
            }
            run_task_blocking(cfg.clone(), summary.folder).await?;
        }
        Commands::Status { task_id } => match scan::find_task(&cfg, &task_id)? {
            Some(summary) => print_json(&json!({ "success": true, "data": summary }))?,
            None => {
                print_json(&json!({ "success": false, "message": format!("task {} not found", task_id) }))?;
                std::process::exit(1);
            }
        },
        Commands::List => {
            let tasks = scan::list_tasks(&cfg).context("Failed to list tasks")?;
            print_json(&json!({ "success": true, "data": tasks }))?;
        }
        Commands::Recover => {
            let recovered = recovery::recover_stalled_tasks(&cfg, Local::now())
                .context("Failed to recover stalled tasks")?;
            info!("Recovery complete: {} task(s) marked as failed", recovered);
        }
        Commands::Daemon => run_daemon(&cfg).await?,
    }

    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to render JSON")?;
    println!("{}", text);
    Ok(())
}

/// Run the instrumented pipeline for the task stored in `folder`
fn run_task(cfg: &TrackerConfig, folder: &Path) -> Result<()> {
    let metadata = task::read_metadata(folder, cfg)?
        .with_context(|| format!("No task metadata in {}", folder.display()))?;
    let inputs = metadata.inputs(folder);
    pipeline::analyze_task(cfg, &inputs)
}

/// The pipeline blocks on child processes and a heartbeat thread; keep it off the runtime
async fn run_task_blocking(cfg: TrackerConfig, folder: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || run_task(&cfg, &folder))
        .await
        .context("Analysis worker aborted")?
}

async fn run_daemon(cfg: &TrackerConfig) -> Result<()> {
    info!("Tracker daemon starting");
    info!("Configuration loaded:");
    info!("  Data dir: {}", cfg.data_dir.display());
    info!("  Stages: {}", cfg.stages.len());
    info!("  Heartbeat interval: {}s", cfg.heartbeat_interval_secs);
    info!("  Stall timeout: {}s", cfg.stall_timeout_secs);
    info!("  Scan interval: {}s", cfg.scan_interval_secs);

    std::fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("Failed to create data directory: {}", cfg.data_dir.display()))?;

    // Tasks left running by a previous process will never finish on their own
    info!("🔄 Starting recovery checks...");
    let recovered = recovery::recover_stalled_tasks(cfg, Local::now())
        .context("Failed to recover stalled tasks on startup")?;
    if recovered > 0 {
        info!("✅ Startup recovery complete: {} task(s) marked as failed", recovered);
    } else {
        info!("✅ Startup recovery complete: no stalled tasks found");
    }

    loop {
        let tasks = scan::list_tasks(cfg).context("Failed to scan tasks")?;

        let pending_count = tasks.iter().filter(|t| t.status == TaskStatus::Pending).count();
        let running_count = tasks.iter().filter(|t| t.status == TaskStatus::Running).count();
        if pending_count > 0 || running_count > 0 {
            info!("Task status: {} pending, {} running", pending_count, running_count);
        }

        // Oldest pending task first; list_tasks is newest first
        let next = tasks.iter().rev().find(|t| t.status == TaskStatus::Pending).cloned();

        match next {
            Some(task) => {
                info!("Starting analysis for task {}: {}", task.task_id, task.course_name);
                match run_task_blocking(cfg.clone(), task.folder.clone()).await {
                    Ok(()) => {
                        info!("✅ Task {} completed successfully", task.task_id);
                        // More work may be queued; scan again right away
                        continue;
                    }
                    Err(e) => error!("❌ Task {} failed: {:#}", task.task_id, e),
                }
            }
            None => debug!("No pending tasks, waiting for next scan"),
        }

        let stalled = recovery::recover_stalled_tasks(cfg, Local::now());
        if let Err(e) = stalled {
            warn!("Periodic stall check failed: {:#}", e);
        }

        debug!("Sleeping for {} seconds before next scan", cfg.scan_interval_secs);
        tokio::time::sleep(tokio::time::Duration::from_secs(cfg.scan_interval_secs)).await;
    }
}
