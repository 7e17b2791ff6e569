mod budget;
mod checkpoint;
mod config;
mod coordinator;
mod driver;
mod error;
mod git;
mod lock;
mod log;
mod preflight;
mod queue_client;
mod recorder;
mod retry;
mod security;
mod supervisor;
mod types;
mod worker;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::config::{load_config, resolve_config, validate, RuntimeConfig};
use crate::coordinator::{run_team, TeamConfig};
use crate::driver::{CliAgentConfig, CliSessionDriver};
use crate::log::parse_log_level;
use crate::preflight::run_health_check;
use crate::queue_client::{QueueClient, QueueClientConfig};
use crate::worker::{run_worker, WorkerConfig};

#[derive(Parser)]
#[command(name = "axon-runtime", about = "Autonomous coding-agent runtime")]
struct Cli {
    /// Project root directory (defaults to current directory)
    #[arg(long, default_value = ".", global = true)]
    root: PathBuf,

    /// Path to a config file overriding `{root}/.agent/config.toml`
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single worker loop against the task queue
    Worker {
        #[arg(long, default_value_t = 0)]
        worker_id: u32,
        #[arg(long)]
        team: String,
        #[arg(long, default_value_t = 10)]
        max_tasks: u32,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value_t = 10)]
        poll_interval: u64,
    },
    /// Spawn and supervise N worker subprocesses
    Team {
        #[arg(long, default_value_t = 1)]
        num_workers: u32,
        #[arg(long)]
        team: String,
        #[arg(long, default_value_t = 10)]
        max_tasks: u32,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value_t = 10)]
        poll_interval: u64,
    },
    /// Run health checks and exit without starting a session
    Preflight,
    /// Check one shell command against the security allowlist and exit
    /// 0/1 accordingly. Intended to be wired up as the coding agent CLI's
    /// own permission-prompt hook, so the gate runs in-process rather than
    /// through a second external callback.
    ValidateCommand {
        command: String,
    },
}

/// §6 exit codes.
const EXIT_OK: i32 = 0;
const EXIT_RUNTIME_ERROR: i32 = 1;
const EXIT_PREFLIGHT_FAILURE: i32 = 2;
const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Commands::ValidateCommand { command } = &cli.command {
        std::process::exit(handle_validate_command(command));
    }

    match parse_log_level(&cli.log_level) {
        Ok(level) => crate::log::set_log_level(level),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(EXIT_RUNTIME_ERROR);
        }
    }

    let root = cli.root.clone();

    let overrides = match cli.config.as_deref() {
        Some(path) => config::load_config_at(path),
        None => load_config(&root),
    };
    let overrides = match overrides {
        Ok(o) => o,
        Err(e) => {
            crate::log_error!("failed to load config: {}", e);
            std::process::exit(EXIT_PREFLIGHT_FAILURE);
        }
    };
    let (runtime_config, mut parse_errors) = resolve_config(&overrides);
    parse_errors.extend(validate(&runtime_config));
    if !parse_errors.is_empty() {
        for e in &parse_errors {
            crate::log_error!("config: {}", e);
        }
        std::process::exit(EXIT_PREFLIGHT_FAILURE);
    }

    let cancel = CancellationToken::new();
    install_ctrlc_handler(cancel.clone());

    let exit_code = match cli.command {
        Commands::Preflight => handle_preflight(&runtime_config, &root).await,
        Commands::Worker { worker_id, team, max_tasks, model, poll_interval } => {
            handle_worker(&runtime_config, &root, worker_id, team, max_tasks, model, poll_interval, cancel).await
        }
        Commands::Team { num_workers, team, max_tasks, model, poll_interval } => {
            handle_team(&root, num_workers, team, max_tasks, model, poll_interval, cancel).await
        }
        Commands::ValidateCommand { .. } => unreachable!("handled before config resolution"),
    };

    std::process::exit(exit_code);
}

fn install_ctrlc_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            crate::log_warn!("interrupt received, shutting down");
            cancel.cancel();
        }
    });
}

fn handle_validate_command(command: &str) -> i32 {
    let result = crate::security::validate_command(command);
    if result.allowed {
        EXIT_OK
    } else {
        crate::log_error!("blocked: {}", result.reason.unwrap_or_default());
        EXIT_RUNTIME_ERROR
    }
}

async fn handle_preflight(config: &RuntimeConfig, root: &std::path::Path) -> i32 {
    let result = run_health_check(config, root, "axon-runtime", |d: Duration| async move {
        tokio::time::sleep(d).await
    })
    .await;

    if result.passed {
        crate::log_info!("preflight passed");
        EXIT_OK
    } else {
        crate::log_error!("preflight failed: {}", result.reason);
        EXIT_PREFLIGHT_FAILURE
    }
}

async fn handle_worker(
    config: &RuntimeConfig,
    root: &std::path::Path,
    worker_id: u32,
    team: String,
    max_tasks: u32,
    model: Option<String>,
    poll_interval: u64,
    cancel: CancellationToken,
) -> i32 {
    let preflight = run_health_check(config, root, "axon-runtime", |d: Duration| async move {
        tokio::time::sleep(d).await
    })
    .await;
    if !preflight.passed {
        crate::log_error!("preflight failed: {}", preflight.reason);
        return EXIT_PREFLIGHT_FAILURE;
    }

    let _guard = match lock::try_acquire(&root.join(".agent")) {
        Ok(guard) => guard,
        Err(e) => {
            crate::log_error!("{}", e);
            return EXIT_RUNTIME_ERROR;
        }
    };

    let agent = CliAgentConfig {
        model,
        timeout: Duration::from_secs(config.mcp_timeout_secs.max(600)),
        ..CliAgentConfig::default()
    };
    if let Err(e) = agent.verify_available() {
        crate::log_error!("{}", e);
        return EXIT_PREFLIGHT_FAILURE;
    }
    let driver = CliSessionDriver::new(agent, root.to_path_buf());

    let queue = QueueClient::new(QueueClientConfig {
        base_url: config.task_service_url.clone(),
        api_key: config.api_key.clone(),
    });
    let checkpoint = checkpoint::CheckpointStore::new(root);
    let recorder = recorder::SessionRecorder::new(root, config.max_session_files);
    let pause_path = root.join(".agent").join("PAUSED");

    let worker_config = WorkerConfig {
        worker_id,
        team,
        poll_interval: Duration::from_secs(poll_interval),
        max_tasks,
        max_iterations: 200,
        max_context_tokens: config.max_context_tokens,
    };

    let summary =
        run_worker(&driver, &queue, &checkpoint, &recorder, root, &pause_path, &worker_config, &cancel).await;
    crate::log_info!(
        "worker {} finished: {} completed, {} failed",
        worker_id,
        summary.tasks_completed,
        summary.tasks_failed
    );

    if cancel.is_cancelled() {
        EXIT_INTERRUPTED
    } else {
        EXIT_OK
    }
}

async fn handle_team(
    root: &std::path::Path,
    num_workers: u32,
    team: String,
    max_tasks: u32,
    model: Option<String>,
    poll_interval: u64,
    cancel: CancellationToken,
) -> i32 {
    let worker_binary = match std::env::current_exe() {
        Ok(path) => path,
        Err(e) => {
            crate::log_error!("failed to resolve own executable path: {}", e);
            return EXIT_RUNTIME_ERROR;
        }
    };

    let team_config = TeamConfig {
        worker_binary,
        num_workers,
        team,
        model,
        project_dir: root.to_path_buf(),
        poll_interval_secs: poll_interval,
        max_tasks,
    };

    let summary = run_team(team_config, cancel.clone()).await;
    crate::log_info!(
        "team finished in {:.1}s: {} completed, {} failed across {} workers",
        summary.duration_seconds,
        summary.completed,
        summary.failed,
        summary.worker_results.len()
    );
    for (worker_id, status) in &summary.worker_results {
        crate::log_info!(
            "  worker {}: {} ({} ok, {} failed, {} restarts){}",
            worker_id,
            status.state,
            status.tasks_completed,
            status.tasks_failed,
            status.restart_count,
            status.stopped_reason.as_ref().map(|r| format!(" — {}", r)).unwrap_or_default()
        );
    }

    if cancel.is_cancelled() {
        EXIT_INTERRUPTED
    } else {
        EXIT_OK
    }
}
