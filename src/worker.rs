//! Single worker loop (§4.9): connect to the task queue, claim one issue at
//! a time, drive it through the supervisor, report the result, and repeat
//! until the queue looks empty or `max_tasks` is reached.

use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointStore;
use crate::log_info;
use crate::log_warn;
use crate::queue_client::QueueClient;
use crate::recorder::SessionRecorder;
use crate::supervisor::{run_supervisor, SessionDriver};
use crate::types::{Issue, SessionFileStatus, WorkerState};

const EMPTY_POLL_STOP: u32 = 3;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: u32,
    pub team: String,
    pub poll_interval: Duration,
    pub max_tasks: u32,
    pub max_iterations: u32,
    pub max_context_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub tasks_completed: u32,
    pub tasks_failed: u32,
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn emit_state(worker_id: u32, state: WorkerState, task: Option<&str>, message: Option<&str>) {
    let mut obj = serde_json::Map::new();
    obj.insert("event".to_string(), serde_json::Value::String("state".to_string()));
    obj.insert("ts".to_string(), serde_json::Value::from(now_unix()));
    obj.insert("worker_id".to_string(), serde_json::Value::from(worker_id));
    obj.insert(
        "state".to_string(),
        serde_json::to_value(state).unwrap_or(serde_json::Value::Null),
    );
    if let Some(task) = task {
        obj.insert("task".to_string(), serde_json::Value::String(task.to_string()));
    }
    if let Some(message) = message {
        obj.insert("message".to_string(), serde_json::Value::String(message.to_string()));
    }
    println!("{}", serde_json::Value::Object(obj));
}

fn emit_result(worker_id: u32, task: &str, success: bool, message: &str) {
    let mut obj = serde_json::Map::new();
    obj.insert("event".to_string(), serde_json::Value::String("result".to_string()));
    obj.insert("ts".to_string(), serde_json::Value::from(now_unix()));
    obj.insert("worker_id".to_string(), serde_json::Value::from(worker_id));
    obj.insert("task".to_string(), serde_json::Value::String(task.to_string()));
    obj.insert("success".to_string(), serde_json::Value::Bool(success));
    obj.insert("message".to_string(), serde_json::Value::String(message.to_string()));
    println!("{}", serde_json::Value::Object(obj));
}

/// Claim and run one issue to completion, emitting state/result events
/// along the way. Returns `true` if the issue was completed successfully.
async fn handle_issue<D: SessionDriver>(
    driver: &D,
    queue: &QueueClient,
    checkpoint: &CheckpointStore,
    recorder: &SessionRecorder,
    project_dir: &Path,
    pause_path: &Path,
    max_iterations: u32,
    max_context_tokens: u64,
    cancel: &CancellationToken,
    worker_id: u32,
    worker_label: &str,
    issue: &Issue,
) -> bool {
    emit_state(worker_id, WorkerState::Claiming, Some(&issue.id), None);
    emit_state(worker_id, WorkerState::Working, Some(&issue.id), None);

    if let Err(e) = recorder.start(&issue.id) {
        log_warn!("[{}] failed to start session recording for {}: {}", worker_label, issue.id, e);
    }

    let run_result = run_supervisor(
        driver,
        checkpoint,
        issue,
        project_dir,
        pause_path,
        max_iterations,
        max_context_tokens,
        cancel,
    )
    .await;

    let completed = match &run_result {
        Ok(true) => true,
        Ok(false) | Err(_) => false,
    };
    if let Err(e) = recorder.end(if completed { SessionFileStatus::Completed } else { SessionFileStatus::Failed }) {
        log_warn!("[{}] failed to finalize session recording for {}: {}", worker_label, issue.id, e);
    }

    match run_result {
        Ok(true) => {
            let outcome = queue.complete(&issue.id, worker_label, "issue completed").await;
            if !outcome.success {
                log_warn!("[{}] failed to mark {} complete: {}", worker_label, issue.id, outcome.error_message);
            }
            emit_state(worker_id, WorkerState::Completed, Some(&issue.id), None);
            emit_result(worker_id, &issue.id, true, "completed");
            true
        }
        Ok(false) => {
            let reason = "iteration cap reached without completion";
            let outcome = queue.fail(&issue.id, worker_label, reason).await;
            if !outcome.success {
                log_warn!("[{}] failed to report failure for {}: {}", worker_label, issue.id, outcome.error_message);
            }
            emit_state(worker_id, WorkerState::Failed, Some(&issue.id), Some(reason));
            emit_result(worker_id, &issue.id, false, reason);
            false
        }
        Err(message) => {
            let outcome = queue.fail(&issue.id, worker_label, &message).await;
            if !outcome.success {
                log_warn!("[{}] failed to report failure for {}: {}", worker_label, issue.id, outcome.error_message);
            }
            emit_state(worker_id, WorkerState::Failed, Some(&issue.id), Some(&message));
            emit_result(worker_id, &issue.id, false, &message);
            false
        }
    }
}

/// Run the worker loop until the queue is empty for `EMPTY_POLL_STOP`
/// consecutive polls, `max_tasks` issues have been completed, or `cancel`
/// fires.
pub async fn run_worker<D: SessionDriver>(
    driver: &D,
    queue: &QueueClient,
    checkpoint: &CheckpointStore,
    recorder: &SessionRecorder,
    project_dir: &Path,
    pause_path: &Path,
    config: &WorkerConfig,
    cancel: &CancellationToken,
) -> WorkerSummary {
    let worker_label = format!("worker-{}", config.worker_id);
    let mut summary = WorkerSummary::default();
    let mut empty_polls = 0u32;
    let mut tasks_done = 0u32;

    emit_state(config.worker_id, WorkerState::Idle, None, None);

    while tasks_done < config.max_tasks {
        if cancel.is_cancelled() {
            break;
        }

        let fetched = queue.get_todo_tasks(&config.team).await;
        if !fetched.success {
            log_warn!("[{}] failed to fetch tasks: {}", worker_label, fetched.error_message);
            break;
        }
        let issues = fetched.value.unwrap_or_default();

        if issues.is_empty() {
            empty_polls += 1;
            if empty_polls >= EMPTY_POLL_STOP {
                log_info!("[{}] queue empty after {} polls, stopping", worker_label, empty_polls);
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(config.poll_interval) => {}
                _ = cancel.cancelled() => break,
            }
            continue;
        }
        empty_polls = 0;

        for issue in &issues {
            let claimed = queue.claim(&issue.id, &worker_label).await;
            if !claimed.success {
                log_warn!("[{}] claim RPC failed for {}: {}", worker_label, issue.id, claimed.error_message);
                continue;
            }
            if claimed.value != Some(true) {
                // Another worker won the race; not an error.
                continue;
            }

            let completed = handle_issue(
                driver,
                queue,
                checkpoint,
                recorder,
                project_dir,
                pause_path,
                config.max_iterations,
                config.max_context_tokens,
                cancel,
                config.worker_id,
                &worker_label,
                issue,
            )
            .await;

            if completed {
                tasks_done += 1;
                summary.tasks_completed += 1;
            } else {
                summary.tasks_failed += 1;
            }
            break;
        }
    }

    emit_state(config.worker_id, WorkerState::Stopped, None, None);
    summary
}
