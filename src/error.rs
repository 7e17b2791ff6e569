use crate::types::{FailureKind, Phase};

/// Errors propagated within the runtime.
///
/// `Classified` carries a kind already known at construction (e.g. an RPC
/// client that parsed a `429` status directly). The other variants wrap
/// ambient I/O/serialization/config failures that are not part of the
/// phase-retry taxonomy; `classify()` still maps them to a `FailureKind` via
/// substring probing so the supervisor has one uniform path.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("{kind}: {message}")]
    Classified {
        kind: FailureKind,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("{0}")]
    Other(String),
}

impl RuntimeError {
    pub fn classified(kind: FailureKind, message: impl Into<String>) -> RuntimeError {
        RuntimeError::Classified {
            kind,
            message: message.into(),
        }
    }

    /// Map this error to a `FailureKind` (§4.2). Already-classified errors
    /// return their kind directly; everything else goes through
    /// `classify_message`.
    pub fn classify(&self) -> FailureKind {
        match self {
            RuntimeError::Classified { kind, .. } => *kind,
            other => classify_message(&other.to_string()),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, RuntimeError::Config(_))
    }
}

/// Classify a free-form error message by case-insensitive substring match,
/// in the fixed order from §4.2. First matching rule wins.
pub fn classify_message(message: &str) -> FailureKind {
    let lower = message.to_lowercase();

    if lower.contains("timeout") && (lower.contains("mcp") || lower.contains("sse")) {
        return FailureKind::MCPTimeout;
    }
    if lower.contains("playwright") || lower.contains("browser") {
        return FailureKind::BrowserCrash;
    }
    if lower.contains("git") {
        return FailureKind::GitError;
    }
    if lower.contains("rate") || lower.contains("limit") || lower.contains("429") {
        return FailureKind::RateLimit;
    }
    if lower.contains("network") || lower.contains("connection") || lower.contains("refused")
        || lower.contains("unreachable")
    {
        return FailureKind::NetworkError;
    }
    FailureKind::Unknown
}

/// Classify an error that additionally carries an HTTP-style status code,
/// per §4.2 rule 4's "object has `status_code == 429`" clause.
pub fn classify_with_status(message: &str, status_code: Option<u16>) -> FailureKind {
    if status_code == Some(429) {
        return FailureKind::RateLimit;
    }
    classify_message(message)
}

/// Apply the retry-strategy table (§4.6) given the current phase and the
/// number of attempts already recorded for it.
pub fn retry_strategy(phase: Phase, attempts: u32, max_phase_retries: u32) -> crate::types::RetryStrategy {
    use crate::types::RetryStrategy::*;

    if attempts >= max_phase_retries {
        return Escalate;
    }
    match phase {
        Phase::Orient | Phase::StatusCheck | Phase::Verification => RetryFromOrient,
        Phase::Implementation => RetryImplementation,
        Phase::Commit | Phase::MarkDone | Phase::Notify | Phase::MemoryFlush => RetryCurrent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_order_is_deterministic() {
        assert_eq!(classify_message("MCP timeout waiting for SSE"), FailureKind::MCPTimeout);
        assert_eq!(classify_message("Playwright crashed"), FailureKind::BrowserCrash);
        assert_eq!(classify_message("git commit failed"), FailureKind::GitError);
        assert_eq!(classify_message("HTTP 429 rate limited"), FailureKind::RateLimit);
        assert_eq!(classify_message("connection refused"), FailureKind::NetworkError);
        assert_eq!(classify_message("something weird"), FailureKind::Unknown);
    }

    #[test]
    fn classify_with_status_overrides_message() {
        assert_eq!(
            classify_with_status("internal server error", Some(429)),
            FailureKind::RateLimit
        );
    }

    #[test]
    fn retry_strategy_table() {
        use crate::types::RetryStrategy::*;
        assert_eq!(retry_strategy(Phase::Orient, 0, 2), RetryFromOrient);
        assert_eq!(retry_strategy(Phase::Implementation, 1, 2), RetryImplementation);
        assert_eq!(retry_strategy(Phase::Commit, 0, 2), RetryCurrent);
        assert_eq!(retry_strategy(Phase::Commit, 2, 2), Escalate);
    }
}
