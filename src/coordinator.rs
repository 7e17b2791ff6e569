//! Team coordinator (§4.10): spawns `N` worker subprocesses, reads their
//! JSON-line event stream, restarts crashed workers with backoff, and
//! aggregates a final summary.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use crate::{log_debug, log_info, log_warn};

pub const MAX_WORKER_RESTARTS: u32 = 3;
pub const INITIAL_RESTART_DELAY: Duration = Duration::from_secs(5);
pub const MAX_RESTART_DELAY: Duration = Duration::from_secs(60);
pub const RESTART_BACKOFF_FACTOR: f64 = 2.0;
pub const STAGGER_DELAY: Duration = Duration::from_secs(2);
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct TeamConfig {
    pub worker_binary: PathBuf,
    pub num_workers: u32,
    pub team: String,
    pub model: Option<String>,
    pub project_dir: PathBuf,
    pub poll_interval_secs: u64,
    pub max_tasks: u32,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub state: String,
    pub current_task: Option<String>,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub restart_count: u32,
    pub stopped_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TeamSummary {
    pub completed: u32,
    pub failed: u32,
    pub duration_seconds: f64,
    pub worker_results: Vec<(u32, WorkerStatus)>,
}

struct RunningWorker {
    child: Child,
    pgid: i32,
    restart_count: u32,
    restart_delay: Duration,
}

fn worker_args(config: &TeamConfig, worker_id: u32) -> Vec<String> {
    let mut args = vec![
        "--root".to_string(),
        config.project_dir.display().to_string(),
        "worker".to_string(),
        "--worker-id".to_string(),
        worker_id.to_string(),
        "--team".to_string(),
        config.team.clone(),
        "--poll-interval".to_string(),
        config.poll_interval_secs.to_string(),
        "--max-tasks".to_string(),
        config.max_tasks.to_string(),
    ];
    if let Some(model) = &config.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    args
}

fn spawn_worker(config: &TeamConfig, worker_id: u32) -> Result<(Child, i32), String> {
    let mut cmd = tokio::process::Command::new(&config.worker_binary);
    cmd.args(worker_args(config, worker_id));
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::inherit());
    cmd.kill_on_drop(true);

    // SAFETY: pre_exec runs between fork() and exec(); setpgid is
    // async-signal-safe.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                .map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    let child = cmd
        .spawn()
        .map_err(|e| format!("failed to spawn worker {}: {}", worker_id, e))?;
    let pid = child
        .id()
        .ok_or_else(|| format!("failed to get PID for worker {}", worker_id))? as i32;
    Ok((child, pid))
}

/// Parse one stdout line from a worker into a `(event, payload)` pair, or
/// `None` if it is not a recognized event line (logged as debug text, never
/// crashes the coordinator).
fn parse_event_line(line: &str) -> Option<serde_json::Value> {
    if line.trim().is_empty() {
        return None;
    }
    serde_json::from_str(line).ok()
}

fn apply_event(status: &mut WorkerStatus, event: &serde_json::Value) {
    match event.get("event").and_then(|v| v.as_str()) {
        Some("state") => {
            if let Some(state) = event.get("state").and_then(|v| v.as_str()) {
                status.state = state.to_string();
            }
            status.current_task = event
                .get("task")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
        }
        Some("result") => {
            let success = event.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
            if success {
                status.tasks_completed += 1;
            } else {
                status.tasks_failed += 1;
            }
        }
        _ => {}
    }
}

/// Drain a worker's stdout, applying each event to its status. Runs until
/// the pipe closes (the process exited or its stdout was dropped).
async fn read_events(mut stdout: tokio::process::ChildStdout, worker_id: u32, status: std::sync::Arc<tokio::sync::Mutex<WorkerStatus>>) {
    let mut reader = BufReader::new(&mut stdout).lines();
    loop {
        match reader.next_line().await {
            Ok(Some(line)) => match parse_event_line(&line) {
                Some(event) => {
                    let mut guard = status.lock().await;
                    apply_event(&mut guard, &event);
                }
                None if line.trim().is_empty() => {}
                None => log_debug!("[worker {}] unparsed stdout: {}", worker_id, line),
            },
            Ok(None) => break,
            Err(e) => {
                log_debug!("[worker {}] stdout read error: {}", worker_id, e);
                break;
            }
        }
    }
}

async fn terminate_worker(pgid: i32, child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    let _ = killpg(Pid::from_raw(pgid), Signal::SIGTERM);

    let waited = tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await;
    if waited.is_err() {
        log_warn!("worker pgid {} did not exit within grace period, killing", pgid);
        let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
        let _ = child.wait().await;
    }
}

/// Run the team: spawn `config.num_workers` workers staggered by
/// `STAGGER_DELAY`, monitor them until every worker has stopped for good
/// (clean exit or restarts exhausted) or `cancel` fires, then aggregate a
/// summary.
pub async fn run_team(config: TeamConfig, cancel: CancellationToken) -> TeamSummary {
    let started = Instant::now();
    let mut workers: HashMap<u32, RunningWorker> = HashMap::new();
    let mut statuses: HashMap<u32, std::sync::Arc<tokio::sync::Mutex<WorkerStatus>>> = HashMap::new();
    let mut reader_handles = Vec::new();

    for worker_id in 0..config.num_workers {
        if worker_id > 0 {
            tokio::select! {
                _ = tokio::time::sleep(STAGGER_DELAY) => {}
                _ = cancel.cancelled() => break,
            }
        }
        match spawn_worker(&config, worker_id) {
            Ok((mut child, pgid)) => {
                log_info!("spawned worker {} (pid={})", worker_id, pgid);
                let status = statuses
                    .entry(worker_id)
                    .or_insert_with(|| std::sync::Arc::new(tokio::sync::Mutex::new(WorkerStatus::default())))
                    .clone();
                if let Some(stdout) = child.stdout.take() {
                    reader_handles.push(tokio::spawn(read_events(stdout, worker_id, status)));
                }
                workers.insert(
                    worker_id,
                    RunningWorker {
                        child,
                        pgid,
                        restart_count: 0,
                        restart_delay: INITIAL_RESTART_DELAY,
                    },
                );
            }
            Err(e) => log_warn!("{}", e),
        }
    }

    let mut stopped: HashMap<u32, WorkerStatus> = HashMap::new();

    loop {
        if workers.is_empty() {
            break;
        }
        if cancel.is_cancelled() {
            break;
        }

        let mut exited: Vec<(u32, Option<i32>)> = Vec::new();
        for (worker_id, worker) in workers.iter_mut() {
            if let Ok(Some(exit_status)) = worker.child.try_wait() {
                exited.push((*worker_id, exit_status.code()));
            }
        }

        for (worker_id, code) in exited {
            let worker = workers.remove(&worker_id).unwrap();

            if code == Some(0) {
                log_info!("worker {} stopped cleanly", worker_id);
                let mut status = statuses[&worker_id].lock().await.clone();
                status.state = "stopped".to_string();
                stopped.insert(worker_id, status);
            } else if worker.restart_count < MAX_WORKER_RESTARTS {
                log_warn!(
                    "worker {} exited with {:?}, restarting in {:?} (attempt {}/{})",
                    worker_id,
                    code,
                    worker.restart_delay,
                    worker.restart_count + 1,
                    MAX_WORKER_RESTARTS
                );
                let delay = worker.restart_delay;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        let mut status = statuses[&worker_id].lock().await.clone();
                        status.state = "stopped".to_string();
                        stopped.insert(worker_id, status);
                        continue;
                    }
                }
                match spawn_worker(&config, worker_id) {
                    Ok((mut child, pgid)) => {
                        let status = statuses[&worker_id].clone();
                        if let Some(stdout) = child.stdout.take() {
                            reader_handles.push(tokio::spawn(read_events(stdout, worker_id, status)));
                        }
                        workers.insert(
                            worker_id,
                            RunningWorker {
                                child,
                                pgid,
                                restart_count: worker.restart_count + 1,
                                restart_delay: Duration::from_secs_f64(
                                    (worker.restart_delay.as_secs_f64() * RESTART_BACKOFF_FACTOR)
                                        .min(MAX_RESTART_DELAY.as_secs_f64()),
                                ),
                            },
                        );
                    }
                    Err(e) => {
                        log_warn!("failed to restart worker {}: {}", worker_id, e);
                        let mut status = statuses[&worker_id].lock().await.clone();
                        status.state = "stopped".to_string();
                        status.stopped_reason = Some(format!("failed to restart: {}", e));
                        stopped.insert(worker_id, status);
                    }
                }
            } else {
                log_warn!("worker {} exhausted restarts, dropping from pool", worker_id);
                let mut status = statuses[&worker_id].lock().await.clone();
                status.state = "stopped".to_string();
                status.stopped_reason = Some("exhausted restarts".to_string());
                stopped.insert(worker_id, status);
            }
        }

        if !workers.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                _ = cancel.cancelled() => break,
            }
        }
    }

    // Graceful shutdown of anything still running (external cancel or a
    // loop exit with workers remaining).
    for (worker_id, mut worker) in workers.drain() {
        terminate_worker(worker.pgid, &mut worker.child).await;
        let mut status = match statuses.get(&worker_id) {
            Some(s) => s.lock().await.clone(),
            None => WorkerStatus::default(),
        };
        status.state = "stopped".to_string();
        stopped.insert(worker_id, status);
    }

    for handle in reader_handles {
        handle.abort();
    }

    let mut worker_results: Vec<(u32, WorkerStatus)> = stopped.into_iter().collect();
    worker_results.sort_by_key(|(id, _)| *id);

    let completed: u32 = worker_results.iter().map(|(_, s)| s.tasks_completed).sum();
    let failed: u32 = worker_results.iter().map(|(_, s)| s.tasks_failed).sum();

    TeamSummary {
        completed,
        failed,
        duration_seconds: started.elapsed().as_secs_f64(),
        worker_results,
    }
}
