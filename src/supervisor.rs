//! Phase state machine and per-issue supervisor loop (§4.6).
//!
//! The actual LLM conversation is behind the [`SessionDriver`] trait so this
//! module stays testable without a live model: a driver runs exactly one
//! phase and reports what the agent said (a completion signal, a context
//! warning, or neither) plus the token cost of doing so.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::checkpoint::{self, CheckpointStore};
use crate::error::{classify_message, retry_strategy};
use crate::git;
use crate::log_info;
use crate::log_warn;
use crate::retry::delay_seconds;
use crate::types::{
    resume_phase, ContextBudget, ContextMode, FailureKind, Issue, Phase, RetryStrategy,
    SessionState, ALL_TASKS_DONE_SIGNAL, CONTEXT_LIMIT_SIGNAL,
};

pub const MAX_PHASE_RETRIES: u32 = 2;
pub const AUTO_CONTINUE_DELAY: Duration = Duration::from_secs(3);
pub const PAUSE_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// What the agent said while running one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseSignal {
    Normal,
    Done,
    ContextLimit,
}

/// Result of driving one phase to completion.
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub signal: PhaseSignal,
    pub tokens_used: std::collections::BTreeMap<String, u64>,
}

impl PhaseOutcome {
    pub fn normal(tokens_used: std::collections::BTreeMap<String, u64>) -> PhaseOutcome {
        PhaseOutcome {
            signal: PhaseSignal::Normal,
            tokens_used,
        }
    }
}

/// Detect a completion signal token anywhere in the agent's response text.
pub fn detect_signal(response_text: &str) -> PhaseSignal {
    if response_text.contains(ALL_TASKS_DONE_SIGNAL) {
        PhaseSignal::Done
    } else if response_text.contains(CONTEXT_LIMIT_SIGNAL) {
        PhaseSignal::ContextLimit
    } else {
        PhaseSignal::Normal
    }
}

/// Runs a single phase of the fixed eight-phase sequence against a live (or
/// fake, in tests) agent.
pub trait SessionDriver: Send + Sync {
    fn run_phase(
        &self,
        phase: Phase,
        issue: &Issue,
        recovery_block: Option<&str>,
        mode: ContextMode,
    ) -> impl Future<Output = Result<PhaseOutcome, String>> + Send;
}

/// Poll `pause_path` until it no longer exists, checking once per
/// `PAUSE_POLL_INTERVAL` (§5). Cancellable via `cancel`.
pub async fn wait_while_paused(pause_path: &Path, cancel: &CancellationToken) -> Result<(), String> {
    while pause_path.exists() {
        if cancel.is_cancelled() {
            return Err("cancelled while paused".to_string());
        }
        tokio::select! {
            _ = tokio::time::sleep(PAUSE_POLL_INTERVAL) => {}
            _ = cancel.cancelled() => return Err("cancelled while paused".to_string()),
        }
    }
    Ok(())
}

/// Build the "Recovery Mode" block injected into the first prompt of a
/// resumed session (§6).
pub fn build_recovery_block(state: &SessionState, resume: Phase) -> String {
    let mut lines = vec!["## Recovery Mode".to_string()];
    lines.push(format!("Interrupted issue: {}", state.issue_id));
    lines.push(format!("Last phase: {}", state.phase));
    lines.push(format!("Resume phase: {}", resume));
    lines.push(format!("Timestamp: {}", state.last_updated.to_rfc3339()));

    if !state.completed_phases.is_empty() {
        let names: Vec<&str> = state.completed_phases.iter().map(|p| p.as_str()).collect();
        lines.push(format!("Completed phases: {}", names.join(", ")));
    }
    if state.uncommitted_changes {
        lines.push("Warning: uncommitted changes were present at interruption.".to_string());
    }
    if !state.degraded_services.is_empty() {
        lines.push(format!("Degraded services: {}", state.degraded_services.join(", ")));
    }
    if let Some(err) = &state.last_error {
        lines.push(format!("Last error: {}", err));
    }
    if !state.error_log.is_empty() {
        lines.push(format!("Error count: {}", state.error_log.len()));
    }

    lines.push("Recovery Instructions:".to_string());
    lines.push("1. Skip any phase already listed under completed phases.".to_string());
    lines.push(format!("2. Resume work starting at the {} phase.", resume));
    lines.push(
        "3. If the resume phase is at or after commit, do not re-implement work already committed."
            .to_string(),
    );

    lines.join("\n")
}

/// Recover a checkpoint for `issue`, if one exists and is usable. Returns
/// the initial `SessionState` plus an optional recovery block to inject
/// into the first prompt.
fn recover_or_start(checkpoint: &CheckpointStore, issue: &Issue) -> (SessionState, Option<String>) {
    match checkpoint.load() {
        Some(state) if state.issue_id == issue.id && state.phase != Phase::MemoryFlush => {
            if checkpoint::is_stale(&state) {
                log_warn!("Stale checkpoint for {} ignored, starting fresh", issue.id);
                (SessionState::start(&issue.id), None)
            } else {
                let resume = resume_phase(&state);
                let block = build_recovery_block(&state, resume);
                let mut resumed = state;
                if resumed.phase != resume {
                    resumed.transition_to(resume);
                }
                (resumed, Some(block))
            }
        }
        _ => (SessionState::start(&issue.id), None),
    }
}

/// Run `driver.run_phase` up to `kind.max_attempts()` times, classifying the
/// failure kind from the first error and reusing that kind's backoff curve
/// for subsequent attempts. `sleep_fn` is injected for testability.
async fn run_phase_with_retry<D, S, SFut>(
    driver: &D,
    phase: Phase,
    issue: &Issue,
    recovery_block: Option<&str>,
    mode: ContextMode,
    mut sleep_fn: S,
) -> Result<PhaseOutcome, (FailureKind, String)>
where
    D: SessionDriver,
    S: FnMut(Duration) -> SFut,
    SFut: Future<Output = ()>,
{
    let first = driver.run_phase(phase, issue, recovery_block, mode).await;
    let first_error = match first {
        Ok(outcome) => return Ok(outcome),
        Err(message) => message,
    };

    let kind = classify_message(&first_error);
    let max_attempts = kind.max_attempts();
    let mut last_error = first_error;

    for attempt in 2..=max_attempts {
        let secs = delay_seconds(kind, attempt - 1);
        sleep_fn(Duration::from_secs_f64(secs)).await;

        match driver.run_phase(phase, issue, recovery_block, mode).await {
            Ok(outcome) => return Ok(outcome),
            Err(message) => last_error = message,
        }
    }

    Err((kind, last_error))
}

/// Drive one issue through the fixed phase sequence to completion,
/// recovering from any existing checkpoint first.
///
/// Returns `Ok(true)` once the agent signals completion, `Ok(false)` if the
/// iteration cap is reached first without completing.
pub async fn run_supervisor<D: SessionDriver>(
    driver: &D,
    checkpoint: &CheckpointStore,
    issue: &Issue,
    project_dir: &Path,
    pause_path: &Path,
    max_iterations: u32,
    max_context_tokens: u64,
    cancel: &CancellationToken,
) -> Result<bool, String> {
    let (mut state, mut recovery_block) = recover_or_start(checkpoint, issue);
    state.context_budget.max_tokens = max_context_tokens;
    checkpoint.save(&state)?;

    for _iteration in 0..max_iterations {
        if cancel.is_cancelled() {
            return Err("cancelled".to_string());
        }
        wait_while_paused(pause_path, cancel).await?;

        // Budget is per-phase, not cumulative across the session: a fresh
        // window every iteration, same as a fresh LLM client per pass.
        state.context_budget = ContextBudget::new(max_context_tokens);

        let phase = state.phase;
        let mode = state.context_budget.mode();

        let result = run_phase_with_retry(
            driver,
            phase,
            issue,
            recovery_block.as_deref(),
            mode,
            |d| async move { tokio::time::sleep(d).await },
        )
        .await;
        recovery_block = None;

        match result {
            Ok(outcome) => {
                for (category, tokens) in &outcome.tokens_used {
                    state.context_budget.add(category, *tokens);
                }

                if outcome.signal == PhaseSignal::ContextLimit
                    || state.context_budget.mode() == ContextMode::Critical
                {
                    checkpoint.save(&state)?;
                    tokio::time::sleep(AUTO_CONTINUE_DELAY).await;
                    continue;
                }

                if outcome.signal == PhaseSignal::Done {
                    checkpoint.clear()?;
                    return Ok(true);
                }

                if phase.is_terminal() {
                    checkpoint.clear()?;
                    return Ok(true);
                }

                let next = Phase::ALL[phase.order() as usize];
                state.transition_to(next);
                checkpoint.save(&state)?;
                tokio::time::sleep(AUTO_CONTINUE_DELAY).await;
            }
            Err((kind, message)) => {
                state.record_error(kind, &message);
                let attempts = state.attempts_for(phase);
                let strategy = retry_strategy(phase, attempts, MAX_PHASE_RETRIES);

                match strategy {
                    RetryStrategy::RetryCurrent => {
                        checkpoint.save(&state)?;
                    }
                    RetryStrategy::RetryFromOrient => {
                        state.transition_to(Phase::Orient);
                        // Only reset when the destination differs from the phase that just
                        // failed — resetting Orient's own counter on an Orient failure would
                        // erase the attempt record retry_strategy just used to decide this,
                        // making Escalate unreachable for it.
                        if phase != Phase::Orient {
                            state.reset_phase_attempts(Phase::Orient);
                        }
                        checkpoint.save(&state)?;
                    }
                    RetryStrategy::RetryImplementation => {
                        state.transition_to(Phase::Implementation);
                        if phase != Phase::Implementation {
                            state.reset_phase_attempts(Phase::Implementation);
                        }
                        checkpoint.save(&state)?;
                    }
                    RetryStrategy::Escalate => {
                        apply_escalation(&mut state, kind, phase, project_dir);
                        checkpoint.save(&state)?;
                    }
                }

                log_warn!(
                    "[{}] phase {} failed ({}): {} -> {:?}",
                    issue.id,
                    phase,
                    kind,
                    message,
                    strategy
                );

                let delay = delay_seconds(kind, attempts.max(1));
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
        }
    }

    log_info!("[{}] reached iteration cap without completing", issue.id);
    Ok(false)
}

/// Apply the `Escalate` branch of the retry-strategy table: mark a
/// skippable service degraded and move on, persist-and-stash an
/// uncommitted `commit`-phase diff, or just record the error for any other
/// non-skippable kind. In every case the phase advances so the worker does
/// not spin forever re-hitting the same exhausted retry budget.
fn apply_escalation(state: &mut SessionState, kind: FailureKind, phase: Phase, project_dir: &Path) {
    if kind.is_skippable(phase) {
        state.mark_degraded(phase.as_str());
    } else if kind == FailureKind::GitError && phase == Phase::Commit {
        state.uncommitted_changes = true;
        let agent_dir = project_dir.join(".agent");
        let rescue = rescue_uncommitted_changes(project_dir, &agent_dir)
            .unwrap_or_else(|e| format!("rescue failed: {}", e));
        state.last_error = Some(format!(
            "escalated: commit phase failed repeatedly ({}), {}",
            kind, rescue
        ));
    } else {
        state.last_error = Some(format!("escalated after exhausting retries for {}", kind));
    }

    if !phase.is_terminal() {
        let next = Phase::ALL[phase.order() as usize];
        state.transition_to(next);
    }
    state.reset_phase_attempts(phase);
}

/// Persist the current working tree's uncommitted diff to
/// `.agent/uncommitted_<timestamp>.diff`, falling back to a stash if the
/// diff itself cannot be captured. Called from the `commit`-phase escalation
/// path before the phase is abandoned.
pub fn rescue_uncommitted_changes(repo_dir: &Path, agent_dir: &Path) -> Result<String, String> {
    let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    match git::persist_diff(repo_dir, agent_dir, &timestamp) {
        Ok(path) => Ok(format!("diff persisted to {}", path.display())),
        Err(e) => {
            log_warn!("Failed to persist diff ({}), falling back to stash", e);
            git::stash_push(Some(repo_dir), &format!("escalated-commit-{}", timestamp))?;
            Ok("working tree stashed".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn issue(id: &str) -> Issue {
        Issue {
            id: id.to_string(),
            title: "test issue".to_string(),
            priority: crate::types::IssuePriority::Medium,
        }
    }

    struct ScriptedDriver {
        calls: AtomicU32,
        responses: Vec<Result<PhaseOutcome, String>>,
    }

    impl ScriptedDriver {
        fn new(responses: Vec<Result<PhaseOutcome, String>>) -> ScriptedDriver {
            ScriptedDriver {
                calls: AtomicU32::new(0),
                responses,
            }
        }
    }

    impl SessionDriver for ScriptedDriver {
        async fn run_phase(
            &self,
            _phase: Phase,
            _issue: &Issue,
            _recovery_block: Option<&str>,
            _mode: ContextMode,
        ) -> Result<PhaseOutcome, String> {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            self.responses
                .get(idx.min(self.responses.len() - 1))
                .cloned()
                .unwrap()
        }
    }

    fn ok_outcome() -> Result<PhaseOutcome, String> {
        Ok(PhaseOutcome::normal(BTreeMap::new()))
    }

    fn done_outcome() -> Result<PhaseOutcome, String> {
        Ok(PhaseOutcome {
            signal: PhaseSignal::Done,
            tokens_used: BTreeMap::new(),
        })
    }

    #[test]
    fn detect_signal_prefers_done_over_absence() {
        assert_eq!(detect_signal("working on it"), PhaseSignal::Normal);
        assert_eq!(detect_signal("done. ALL_TASKS_DONE: yes"), PhaseSignal::Done);
        assert_eq!(
            detect_signal("oops CONTEXT_LIMIT_REACHED: too much"),
            PhaseSignal::ContextLimit
        );
    }

    #[test]
    fn recovery_block_lists_resume_phase_and_warnings() {
        let mut state = SessionState::start("ENG-1");
        state.transition_to(Phase::StatusCheck);
        state.transition_to(Phase::Verification);
        state.uncommitted_changes = true;
        state.mark_degraded("notify");
        state.last_error = Some("boom".to_string());

        let block = build_recovery_block(&state, Phase::Orient);
        assert!(block.starts_with("## Recovery Mode"));
        assert!(block.contains("Resume phase: orient"));
        assert!(block.contains("uncommitted changes"));
        assert!(block.contains("notify"));
        assert!(block.contains("boom"));
        assert!(block.contains("not re-implement"));
    }

    #[tokio::test]
    async fn full_sequence_completes_on_done_signal() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = CheckpointStore::new(dir.path());
        let driver = ScriptedDriver::new(vec![
            ok_outcome(),
            ok_outcome(),
            ok_outcome(),
            ok_outcome(),
            ok_outcome(),
            ok_outcome(),
            ok_outcome(),
            done_outcome(),
        ]);
        let cancel = CancellationToken::new();
        let pause_path = dir.path().join("PAUSED");

        let result = run_supervisor(
            &driver,
            &checkpoint,
            &issue("ENG-1"),
            dir.path(),
            &pause_path,
            20,
            180_000,
            &cancel,
        )
        .await
        .unwrap();

        assert!(result);
        assert!(checkpoint.load().is_none());
    }

    #[tokio::test]
    async fn reaching_memory_flush_without_signal_still_completes() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = CheckpointStore::new(dir.path());
        let driver = ScriptedDriver::new(vec![ok_outcome()]);
        let cancel = CancellationToken::new();
        let pause_path = dir.path().join("PAUSED");

        let result = run_supervisor(
            &driver,
            &checkpoint,
            &issue("ENG-1"),
            dir.path(),
            &pause_path,
            8,
            180_000,
            &cancel,
        )
        .await
        .unwrap();

        assert!(result);
    }

    #[tokio::test]
    async fn iteration_cap_without_completion_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = CheckpointStore::new(dir.path());
        let driver = ScriptedDriver::new(vec![Err("boom".to_string())]);
        let cancel = CancellationToken::new();
        let pause_path = dir.path().join("PAUSED");

        let result = run_supervisor(
            &driver,
            &checkpoint,
            &issue("ENG-1"),
            dir.path(),
            &pause_path,
            1,
            180_000,
            &cancel,
        )
        .await
        .unwrap();

        assert!(!result);
        assert!(checkpoint.load().is_some());
    }

    #[tokio::test]
    async fn recovers_interrupted_session_and_injects_recovery_block_once() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = CheckpointStore::new(dir.path());
        let mut state = SessionState::start("ENG-1");
        state.transition_to(Phase::StatusCheck);
        checkpoint.save(&state).unwrap();

        let driver = Arc::new(ScriptedDriver::new(vec![
            ok_outcome(),
            ok_outcome(),
            ok_outcome(),
            ok_outcome(),
            ok_outcome(),
            ok_outcome(),
            ok_outcome(),
            done_outcome(),
        ]));
        let cancel = CancellationToken::new();
        let pause_path = dir.path().join("PAUSED");

        let result = run_supervisor(
            driver.as_ref(),
            &checkpoint,
            &issue("ENG-1"),
            dir.path(),
            &pause_path,
            20,
            180_000,
            &cancel,
        )
        .await
        .unwrap();

        assert!(result);
    }

    #[tokio::test]
    async fn repeated_orient_failures_eventually_escalate_past_orient() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = CheckpointStore::new(dir.path());
        let driver = ScriptedDriver::new(vec![Err("boom".to_string())]);
        let cancel = CancellationToken::new();
        let pause_path = dir.path().join("PAUSED");

        let result = run_supervisor(
            &driver,
            &checkpoint,
            &issue("ENG-1"),
            dir.path(),
            &pause_path,
            2,
            180_000,
            &cancel,
        )
        .await
        .unwrap();

        assert!(!result);
        let state = checkpoint.load().unwrap();
        // Two Orient failures hit MAX_PHASE_RETRIES and must escalate onward,
        // not reset Orient's own counter and retry it forever.
        assert_eq!(state.phase, Phase::StatusCheck);
    }

    #[tokio::test]
    async fn context_budget_resets_each_iteration_instead_of_stalling() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = CheckpointStore::new(dir.path());
        let mut heavy_tokens = BTreeMap::new();
        heavy_tokens.insert("tool_outputs".to_string(), 90u64);
        let driver = ScriptedDriver::new(vec![
            Ok(PhaseOutcome::normal(heavy_tokens)),
            ok_outcome(),
        ]);
        let cancel = CancellationToken::new();
        let pause_path = dir.path().join("PAUSED");

        let result = run_supervisor(
            &driver,
            &checkpoint,
            &issue("ENG-1"),
            dir.path(),
            &pause_path,
            2,
            100,
            &cancel,
        )
        .await
        .unwrap();

        assert!(!result);
        let state = checkpoint.load().unwrap();
        // First iteration pushes usage to Critical (90/100) and loops in
        // place; if the budget carried over instead of resetting, the second
        // iteration (which uses no tokens) would still read Critical and the
        // phase would never advance past Orient.
        assert_eq!(state.phase, Phase::StatusCheck);
    }

    #[tokio::test]
    async fn pause_file_blocks_until_removed() {
        let dir = tempfile::tempdir().unwrap();
        let pause_path = dir.path().join("PAUSED");
        std::fs::write(&pause_path, "").unwrap();
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();

        let pause_path2 = pause_path.clone();
        let waiter = tokio::spawn(async move { wait_while_paused(&pause_path2, &cancel2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        cancel.cancel();
        let result = waiter.await.unwrap();
        assert!(result.is_err());
    }
}
