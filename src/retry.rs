use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::types::FailureKind;

/// Per-attempt MCP-tool-call timeout (§4.3).
pub const MCP_TIMEOUT: Duration = Duration::from_secs(30);

/// Generic exponential-backoff parameters used when a kind has no fixed
/// curve (§4.2).
const GENERIC_INITIAL: f64 = 1.0;
const GENERIC_MULTIPLIER: f64 = 2.0;
const GENERIC_MAX_BACKOFF: f64 = 30.0;

/// Seconds to sleep before the `n`-th (1-based) retry attempt of `kind`.
///
/// Fixed curves from §4.2; `RateLimit` clamps to its last entry for
/// `n >= 3`. Kinds without a dedicated curve fall through to the generic
/// exponential-with-jitter formula.
pub fn delay_seconds(kind: FailureKind, n: u32) -> f64 {
    match kind {
        FailureKind::RateLimit => {
            const CURVE: [f64; 3] = [30.0, 60.0, 120.0];
            let idx = (n.saturating_sub(1)) as usize;
            CURVE[idx.min(CURVE.len() - 1)]
        }
        FailureKind::MCPTimeout => 5.0 * n as f64,
        FailureKind::NetworkError => 3.0 * n as f64,
        FailureKind::BrowserCrash | FailureKind::GitError | FailureKind::Unknown => 2.0 * n as f64,
    }
}

/// Generic exponential backoff with ±20% full jitter, never negative.
/// Used by callers outside the fixed-kind curves (e.g. ambient retries on
/// ancillary I/O).
pub fn generic_backoff_seconds(n: u32) -> f64 {
    let base = (GENERIC_INITIAL * GENERIC_MULTIPLIER.powi(n as i32 - 1)).min(GENERIC_MAX_BACKOFF);
    let jitter_frac = rand::thread_rng().gen_range(-0.2..=0.2);
    (base * (1.0 + jitter_frac)).max(0.0)
}

/// Result of a `retry` call (§4.3).
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub success: bool,
    pub value: Option<T>,
    pub fallback_used: bool,
    pub retries: u32,
    pub error_message: String,
}

/// Run `op` with retry according to `kind`'s max-attempts and backoff curve.
///
/// On exhaustion: if `(kind, phase)` is in the skippable table, returns a
/// fallback success (`success = true, fallback_used = true`); otherwise
/// returns `success = false` without raising. `sleep_fn` is injected so
/// tests can run without real delays.
pub async fn retry<T, F, Fut, S, SFut>(
    kind: FailureKind,
    skippable_phase: Option<crate::types::Phase>,
    mut op: F,
    mut sleep_fn: S,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, String>>,
    S: FnMut(Duration) -> SFut,
    SFut: Future<Output = ()>,
{
    let max_attempts = kind.max_attempts();
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        match op(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    success: true,
                    value: Some(value),
                    fallback_used: false,
                    retries: attempt - 1,
                    error_message: String::new(),
                };
            }
            Err(message) => {
                last_error = message;
                if attempt < max_attempts {
                    let secs = delay_seconds(kind, attempt);
                    sleep_fn(Duration::from_secs_f64(secs)).await;
                }
            }
        }
    }

    let fallback_used = skippable_phase
        .map(|p| kind.is_skippable(p))
        .unwrap_or(false);

    RetryOutcome {
        success: fallback_used,
        value: None,
        fallback_used,
        retries: max_attempts,
        error_message: last_error,
    }
}

/// Single-shot scoped guard (§4.3 `protected(kind)`): runs `op` once; on
/// failure records a failed result without retry.
pub async fn protected<T, F, Fut>(_kind: FailureKind, op: F) -> RetryOutcome<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    match op().await {
        Ok(value) => RetryOutcome {
            success: true,
            value: Some(value),
            fallback_used: false,
            retries: 0,
            error_message: String::new(),
        },
        Err(message) => RetryOutcome {
            success: false,
            value: None,
            fallback_used: false,
            retries: 0,
            error_message: message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Phase;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn rate_limit_curve_is_fixed_no_jitter() {
        assert_eq!(delay_seconds(FailureKind::RateLimit, 1), 30.0);
        assert_eq!(delay_seconds(FailureKind::RateLimit, 2), 60.0);
        assert_eq!(delay_seconds(FailureKind::RateLimit, 3), 120.0);
        assert_eq!(delay_seconds(FailureKind::RateLimit, 4), 120.0);
    }

    #[test]
    fn mcp_and_network_curves() {
        assert_eq!(delay_seconds(FailureKind::MCPTimeout, 2), 10.0);
        assert_eq!(delay_seconds(FailureKind::NetworkError, 2), 6.0);
        assert_eq!(delay_seconds(FailureKind::Unknown, 3), 6.0);
    }

    #[test]
    fn generic_backoff_never_negative_and_capped() {
        for n in 1..10 {
            let d = generic_backoff_seconds(n);
            assert!(d >= 0.0);
            assert!(d <= GENERIC_MAX_BACKOFF * 1.2 + 0.001);
        }
    }

    #[tokio::test]
    async fn retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = attempts.clone();
        let outcome = retry(
            FailureKind::Unknown,
            None,
            move |_n| {
                let attempts = attempts2.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n < 1 {
                        Err("boom".to_string())
                    } else {
                        Ok(42)
                    }
                }
            },
            |_d| async {},
        )
        .await;

        assert!(outcome.success);
        assert_eq!(outcome.value, Some(42));
        assert_eq!(outcome.retries, 1);
    }

    #[tokio::test]
    async fn retry_exhaustion_non_skippable_fails() {
        let outcome: RetryOutcome<()> = retry(
            FailureKind::GitError,
            Some(Phase::Commit),
            |_n| async { Err("git broke".to_string()) },
            |_d| async {},
        )
        .await;

        assert!(!outcome.success);
        assert!(!outcome.fallback_used);
    }

    #[tokio::test]
    async fn retry_exhaustion_skippable_falls_back() {
        let outcome: RetryOutcome<()> = retry(
            FailureKind::MCPTimeout,
            Some(Phase::Notify),
            |_n| async { Err("mcp timeout".to_string()) },
            |_d| async {},
        )
        .await;

        assert!(outcome.success);
        assert!(outcome.fallback_used);
    }

    #[tokio::test]
    async fn protected_runs_once_no_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let outcome: RetryOutcome<()> = protected(FailureKind::Unknown, move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            async { Err("nope".to_string()) }
        })
        .await;

        assert!(!outcome.success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
