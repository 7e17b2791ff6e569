use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One of the eight fixed steps a session progresses through, in a stable
/// order. `MemoryFlush` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Orient,
    StatusCheck,
    Verification,
    Implementation,
    Commit,
    MarkDone,
    Notify,
    MemoryFlush,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::Orient,
        Phase::StatusCheck,
        Phase::Verification,
        Phase::Implementation,
        Phase::Commit,
        Phase::MarkDone,
        Phase::Notify,
        Phase::MemoryFlush,
    ];

    /// 1-based position in the fixed phase order.
    pub fn order(&self) -> u8 {
        match self {
            Phase::Orient => 1,
            Phase::StatusCheck => 2,
            Phase::Verification => 3,
            Phase::Implementation => 4,
            Phase::Commit => 5,
            Phase::MarkDone => 6,
            Phase::Notify => 7,
            Phase::MemoryFlush => 8,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::MemoryFlush)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Orient => "orient",
            Phase::StatusCheck => "status_check",
            Phase::Verification => "verification",
            Phase::Implementation => "implementation",
            Phase::Commit => "commit",
            Phase::MarkDone => "mark_done",
            Phase::Notify => "notify",
            Phase::MemoryFlush => "memory_flush",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classified kind of a phase-execution failure (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    #[serde(rename = "mcp_timeout")]
    MCPTimeout,
    BrowserCrash,
    GitError,
    RateLimit,
    NetworkError,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::MCPTimeout => "mcp_timeout",
            FailureKind::BrowserCrash => "browser_crash",
            FailureKind::GitError => "git_error",
            FailureKind::RateLimit => "rate_limit",
            FailureKind::NetworkError => "network_error",
            FailureKind::Unknown => "unknown",
        }
    }

    /// Maximum retry attempts for this kind (§4.2 table).
    pub fn max_attempts(&self) -> u32 {
        match self {
            FailureKind::MCPTimeout => 3,
            FailureKind::BrowserCrash => 2,
            FailureKind::GitError => 3,
            FailureKind::RateLimit => 3,
            FailureKind::NetworkError => 3,
            FailureKind::Unknown => 2,
        }
    }

    /// True if `phase` may be skipped (service marked degraded, phase
    /// treated as successful) once this kind's retries are exhausted.
    pub fn is_skippable(&self, phase: Phase) -> bool {
        match self {
            FailureKind::MCPTimeout => matches!(phase, Phase::Notify | Phase::MarkDone),
            FailureKind::BrowserCrash => matches!(phase, Phase::Verification),
            _ => false,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Decision produced by the retry-strategy table (§4.6) once a phase's
/// retries are exhausted or a non-retryable condition forces a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    RetryCurrent,
    RetryFromOrient,
    RetryImplementation,
    Escalate,
}

/// Context-budget operating mode, derived from `ContextBudget::usage_ratio`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    Normal,
    Compact,
    Critical,
}

impl ContextMode {
    pub const COMPACT_THRESHOLD: f64 = 0.70;
    pub const CRITICAL_THRESHOLD: f64 = 0.85;

    pub fn from_ratio(ratio: f64) -> ContextMode {
        if ratio >= Self::CRITICAL_THRESHOLD {
            ContextMode::Critical
        } else if ratio >= Self::COMPACT_THRESHOLD {
            ContextMode::Compact
        } else {
            ContextMode::Normal
        }
    }
}

/// A single entry in `SessionState.phase_history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub phase: Phase,
    pub timestamp: DateTime<Utc>,
}

/// The persistent checkpoint for one worker's in-progress session (§3, §4.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub phase: Phase,
    pub issue_id: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub completed_phases: Vec<Phase>,
    pub phase_history: Vec<PhaseTransition>,
    pub phase_attempts: std::collections::BTreeMap<String, u32>,
    pub error_log: Vec<String>,
    pub uncommitted_changes: bool,
    pub degraded_services: Vec<String>,
    pub last_error: Option<String>,
    pub last_error_kind: Option<FailureKind>,
    /// Token usage for the phase currently in flight (§4.4). Reset at the
    /// start of every supervisor iteration, not cumulative across the
    /// session; persisted in the checkpoint purely so a resumed session has
    /// a well-formed value to reset from.
    pub context_budget: ContextBudget,
}

impl SessionState {
    /// Begin a new session for `issue_id` at the initial phase (`orient`).
    ///
    /// `phase_history` gets its first entry here; `completed_phases` starts
    /// empty.
    pub fn start(issue_id: impl Into<String>) -> SessionState {
        let now = Utc::now();
        SessionState {
            phase: Phase::Orient,
            issue_id: issue_id.into(),
            attempt: 1,
            started_at: now,
            last_updated: now,
            completed_phases: Vec::new(),
            phase_history: vec![PhaseTransition {
                phase: Phase::Orient,
                timestamp: now,
            }],
            phase_attempts: std::collections::BTreeMap::new(),
            error_log: Vec::new(),
            uncommitted_changes: false,
            degraded_services: Vec::new(),
            last_error: None,
            last_error_kind: None,
            context_budget: ContextBudget::default(),
        }
    }

    /// Transition to phase `p`: append the outgoing phase to
    /// `completed_phases` (if not already present), append `{p, now}` to
    /// `phase_history`, and update `phase`/`last_updated`.
    pub fn transition_to(&mut self, p: Phase) {
        let outgoing = self.phase;
        if !self.completed_phases.contains(&outgoing) {
            self.completed_phases.push(outgoing);
        }
        let now = Utc::now();
        self.phase_history.push(PhaseTransition {
            phase: p,
            timestamp: now,
        });
        self.phase = p;
        self.last_updated = now;
    }

    /// Record a classified failure in `error_log` and the `last_error*` fields.
    pub fn record_error(&mut self, kind: FailureKind, message: &str) {
        let now = Utc::now();
        self.error_log.push(format!(
            "[{}] {}: {} - {}",
            now.to_rfc3339(),
            self.phase,
            kind,
            message
        ));
        self.last_error = Some(message.to_string());
        self.last_error_kind = Some(kind);
        self.last_updated = now;

        let count = self
            .phase_attempts
            .entry(self.phase.as_str().to_string())
            .or_insert(0);
        *count += 1;
    }

    /// Mark `service` degraded. Idempotent: a repeated name leaves one entry.
    pub fn mark_degraded(&mut self, service: &str) {
        if !self.degraded_services.iter().any(|s| s == service) {
            self.degraded_services.push(service.to_string());
        }
        self.last_updated = Utc::now();
    }

    /// Reset the attempt counter for `phase` to zero.
    pub fn reset_phase_attempts(&mut self, phase: Phase) {
        self.phase_attempts.insert(phase.as_str().to_string(), 0);
        self.last_updated = Utc::now();
    }

    pub fn attempts_for(&self, phase: Phase) -> u32 {
        self.phase_attempts
            .get(phase.as_str())
            .copied()
            .unwrap_or(0)
    }
}

/// Compute the phase the supervisor should resume from, given a loaded,
/// non-stale checkpoint (§4.6 "Recovery on startup").
pub fn resume_phase(state: &SessionState) -> Phase {
    match state.phase {
        Phase::Orient | Phase::StatusCheck | Phase::Verification => Phase::Orient,
        Phase::Implementation => Phase::Implementation,
        p => p,
    }
}

/// `ContextBudget` fixed categories (§3).
pub const BUDGET_CATEGORIES: [&str; 6] = [
    "system_prompt",
    "files",
    "history",
    "memory",
    "issue",
    "tool_outputs",
];

pub const DEFAULT_MAX_TOKENS: u64 = 180_000;

/// Token accounting for one worker session (§3, §4.4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBudget {
    pub max_tokens: u64,
    pub breakdown: std::collections::BTreeMap<String, u64>,
}

impl ContextBudget {
    pub fn new(max_tokens: u64) -> ContextBudget {
        let mut breakdown = std::collections::BTreeMap::new();
        for cat in BUDGET_CATEGORIES {
            breakdown.insert(cat.to_string(), 0);
        }
        ContextBudget {
            max_tokens,
            breakdown,
        }
    }

    pub fn add(&mut self, category: &str, tokens: u64) {
        if let Some(v) = self.breakdown.get_mut(category) {
            *v += tokens;
        }
    }

    pub fn total_used(&self) -> u64 {
        self.breakdown.values().sum()
    }

    pub fn remaining(&self) -> u64 {
        self.max_tokens.saturating_sub(self.total_used())
    }

    pub fn usage_ratio(&self) -> f64 {
        if self.max_tokens == 0 {
            return 1.0;
        }
        self.total_used() as f64 / self.max_tokens as f64
    }

    pub fn mode(&self) -> ContextMode {
        ContextMode::from_ratio(self.usage_ratio())
    }
}

impl Default for ContextBudget {
    fn default() -> ContextBudget {
        ContextBudget::new(DEFAULT_MAX_TOKENS)
    }
}

/// Estimate a token count from text length: `ceil(len / 4)`.
pub fn estimate_tokens(text: &str) -> u64 {
    ((text.len() as u64) + 3) / 4
}

/// One recorded event within a session (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub t: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// Status of a persisted session file (`.agent/sessions/session-<N>.json`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionFileStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionFile {
    pub session_id: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub issue_id: String,
    pub status: SessionFileStatus,
    pub events: Vec<SessionEvent>,
}

/// Outcome of running the phase sequence for one supervisor iteration (§4.6).
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Complete,
    ContextLimit,
    Continue,
    Error { kind: FailureKind, message: String },
}

/// Priority on an external task, used for fetch ordering (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssuePriority {
    Urgent,
    High,
    Medium,
    Low,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub title: String,
    pub priority: IssuePriority,
}

/// Worker lifecycle state emitted in the JSON-line protocol (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Claiming,
    Working,
    Completed,
    Failed,
    Stopped,
}

/// Completion signal tokens the agent emits in its response text (§6, §9).
pub const ALL_TASKS_DONE_SIGNAL: &str = "ALL_TASKS_DONE:";
pub const CONTEXT_LIMIT_SIGNAL: &str = "CONTEXT_LIMIT_REACHED:";

pub fn ordered_degraded_services(services: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for s in services {
        if seen.insert(s.clone()) {
            out.push(s);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_order_matches_spec() {
        assert_eq!(Phase::Orient.order(), 1);
        assert_eq!(Phase::MemoryFlush.order(), 8);
        assert!(Phase::MemoryFlush.is_terminal());
        assert!(!Phase::Commit.is_terminal());
    }

    #[test]
    fn start_creates_single_history_entry() {
        let state = SessionState::start("ENG-1");
        assert_eq!(state.phase_history.len(), 1);
        assert_eq!(state.phase_history[0].phase, Phase::Orient);
        assert_eq!(state.phase_history[0].timestamp, state.started_at);
        assert!(state.completed_phases.is_empty());
    }

    #[test]
    fn transition_to_appends_outgoing_and_history() {
        let mut state = SessionState::start("ENG-1");
        state.transition_to(Phase::StatusCheck);
        assert_eq!(state.completed_phases, vec![Phase::Orient]);
        assert_eq!(state.phase_history.len(), 2);
        assert_eq!(state.phase, Phase::StatusCheck);
    }

    #[test]
    fn resume_phase_rules() {
        let mut state = SessionState::start("ENG-1");
        assert_eq!(resume_phase(&state), Phase::Orient);

        state.phase = Phase::Verification;
        assert_eq!(resume_phase(&state), Phase::Orient);

        state.phase = Phase::Implementation;
        assert_eq!(resume_phase(&state), Phase::Implementation);

        state.phase = Phase::Commit;
        assert_eq!(resume_phase(&state), Phase::Commit);
    }

    #[test]
    fn mark_degraded_is_idempotent() {
        let mut state = SessionState::start("ENG-1");
        state.mark_degraded("notify");
        state.mark_degraded("notify");
        assert_eq!(state.degraded_services, vec!["notify".to_string()]);
    }

    #[test]
    fn budget_mode_thresholds() {
        let mut budget = ContextBudget::new(100);
        budget.add("system_prompt", 50);
        budget.add("tool_outputs", 40);
        assert_eq!(budget.total_used(), 90);
        assert_eq!(budget.mode(), ContextMode::Critical);
    }

    #[test]
    fn estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn failure_kind_skippable_table() {
        assert!(FailureKind::MCPTimeout.is_skippable(Phase::Notify));
        assert!(FailureKind::MCPTimeout.is_skippable(Phase::MarkDone));
        assert!(!FailureKind::MCPTimeout.is_skippable(Phase::Commit));
        assert!(FailureKind::BrowserCrash.is_skippable(Phase::Verification));
        assert!(!FailureKind::GitError.is_skippable(Phase::Commit));
    }
}
