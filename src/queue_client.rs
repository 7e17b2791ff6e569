//! RPC client against the external task-queue service (§4.8). Every call
//! goes through [`classify_and_retry`], with the failure kind inferred from
//! the transport/response error of the first attempt (so a 429 gets
//! `RateLimit`'s backoff curve, not a flat network-error one).

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;

use crate::error::classify_with_status;
use crate::retry::{delay_seconds, RetryOutcome};
use crate::types::{Issue, IssuePriority, Phase};

#[derive(Debug, Clone)]
pub struct QueueClientConfig {
    pub base_url: String,
    pub api_key: String,
}

pub struct QueueClient {
    http: reqwest::Client,
    config: QueueClientConfig,
}

#[derive(Debug, Deserialize)]
struct RawIssue {
    id: String,
    title: String,
    #[serde(default)]
    priority: Option<IssuePriority>,
    status: String,
}

impl QueueClient {
    pub fn new(config: QueueClientConfig) -> QueueClient {
        QueueClient {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, (String, Option<u16>)> {
        let response = request
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| (e.to_string(), e.status().map(|s| s.as_u16())))?;

        if let Err(e) = response.error_for_status_ref() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err((format!("{}: {}", e, body), Some(status)));
        }
        Ok(response)
    }

    /// List open issues for `team`, ordered ascending by priority
    /// (urgent < high < medium < low < none), ties in service order.
    pub async fn get_todo_tasks(&self, team: &str) -> RetryOutcome<Vec<Issue>> {
        classify_and_retry(None, |_attempt| async {
            let response = self
                .send(self.http.get(self.url(&format!("/teams/{}/issues", team))))
                .await?;

            let raw: Vec<RawIssue> = response
                .json()
                .await
                .map_err(|e| (format!("failed to decode issues response: {}", e), None))?;

            let mut issues: Vec<Issue> = raw
                .into_iter()
                .filter(|i| i.status.eq_ignore_ascii_case("todo"))
                .map(|i| Issue {
                    id: i.id,
                    title: i.title,
                    priority: i.priority.unwrap_or(IssuePriority::None),
                })
                .collect();
            issues.sort_by_key(|i| i.priority);
            Ok(issues)
        })
        .await
    }

    /// Claim `issue_id` for `worker_id`: fetch, check state is `Todo`,
    /// append a claim comment, transition to `In Progress`. Returns `false`
    /// (not an error) if another worker already claimed it first.
    pub async fn claim(&self, issue_id: &str, worker_id: &str) -> RetryOutcome<bool> {
        classify_and_retry(None, |_attempt| async {
            let response = self.send(self.http.get(self.url(&format!("/issues/{}", issue_id)))).await?;
            let raw: RawIssue = response
                .json()
                .await
                .map_err(|e| (format!("failed to decode issue response: {}", e), None))?;

            if !raw.status.eq_ignore_ascii_case("todo") {
                return Ok(false);
            }

            self.send(self.http.post(self.url(&format!("/issues/{}/comments", issue_id))).json(
                &serde_json::json!({ "body": format!("Claimed by worker {}", worker_id) }),
            ))
            .await?;

            self.send(
                self.http
                    .patch(self.url(&format!("/issues/{}", issue_id)))
                    .json(&serde_json::json!({ "status": "In Progress" })),
            )
            .await?;

            Ok(true)
        })
        .await
    }

    /// Append a summary comment and transition `issue_id` to `Done`.
    pub async fn complete(&self, issue_id: &str, worker_id: &str, summary: &str) -> RetryOutcome<()> {
        classify_and_retry(None, |_attempt| async {
            self.send(
                self.http.post(self.url(&format!("/issues/{}/comments", issue_id))).json(
                    &serde_json::json!({ "body": format!("[{}] {}", worker_id, summary) }),
                ),
            )
            .await?;

            self.send(
                self.http
                    .patch(self.url(&format!("/issues/{}", issue_id)))
                    .json(&serde_json::json!({ "status": "Done" })),
            )
            .await?;
            Ok(())
        })
        .await
    }

    /// Append a failure comment and transition `issue_id` back to `Todo`.
    pub async fn fail(&self, issue_id: &str, worker_id: &str, error: &str) -> RetryOutcome<()> {
        classify_and_retry(None, |_attempt| async {
            self.send(
                self.http.post(self.url(&format!("/issues/{}/comments", issue_id))).json(
                    &serde_json::json!({ "body": format!("[{}] failed: {}", worker_id, error) }),
                ),
            )
            .await?;

            self.send(
                self.http
                    .patch(self.url(&format!("/issues/{}", issue_id)))
                    .json(&serde_json::json!({ "status": "Todo" })),
            )
            .await?;
            Ok(())
        })
        .await
    }
}

/// Run `op` with retry, classifying the failure kind from the *first*
/// error (message + HTTP status, via [`classify_with_status`]) rather than
/// assuming one up front, then reusing that kind's max-attempts and
/// backoff curve for the remaining attempts. Mirrors
/// `supervisor::run_phase_with_retry`'s classify-then-retry shape; unlike
/// [`crate::retry::retry`] this never re-runs the first attempt, so a
/// side-effecting call (e.g. posting a comment) is never issued twice for
/// the sake of classification.
async fn classify_and_retry<T, F, Fut>(skippable_phase: Option<Phase>, mut op: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, (String, Option<u16>)>>,
{
    let (first_message, first_status) = match op(1).await {
        Ok(value) => {
            return RetryOutcome {
                success: true,
                value: Some(value),
                fallback_used: false,
                retries: 0,
                error_message: String::new(),
            }
        }
        Err(e) => e,
    };

    let kind = classify_with_status(&first_message, first_status);
    let max_attempts = kind.max_attempts();
    let mut last_error = first_message;

    for attempt in 2..=max_attempts {
        let secs = delay_seconds(kind, attempt - 1);
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;

        match op(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    success: true,
                    value: Some(value),
                    fallback_used: false,
                    retries: attempt - 1,
                    error_message: String::new(),
                }
            }
            Err((message, _status)) => last_error = message,
        }
    }

    let fallback_used = skippable_phase.map(|p| kind.is_skippable(p)).unwrap_or(false);
    RetryOutcome {
        success: fallback_used,
        value: None,
        fallback_used,
        retries: max_attempts,
        error_message: format!("{:?}: {}", kind, last_error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_is_ascending() {
        let mut issues = vec![
            Issue { id: "a".into(), title: "a".into(), priority: IssuePriority::Low },
            Issue { id: "b".into(), title: "b".into(), priority: IssuePriority::Urgent },
            Issue { id: "c".into(), title: "c".into(), priority: IssuePriority::Medium },
        ];
        issues.sort_by_key(|i| i.priority);
        let ids: Vec<&str> = issues.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn url_joins_base_and_path() {
        let client = QueueClient::new(QueueClientConfig {
            base_url: "http://localhost:8001/".to_string(),
            api_key: "k".to_string(),
        });
        assert_eq!(client.url("/teams/eng/issues"), "http://localhost:8001/teams/eng/issues");
    }

    #[tokio::test]
    async fn classify_and_retry_uses_rate_limit_curve_for_429() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let outcome: RetryOutcome<()> = classify_and_retry(None, move |_attempt| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(("rate limited".to_string(), Some(429)))
            }
        })
        .await;

        assert!(!outcome.success);
        assert_eq!(outcome.retries, crate::types::FailureKind::RateLimit.max_attempts());
        assert!(outcome.error_message.contains("RateLimit"));
        assert_eq!(calls.load(Ordering::SeqCst), crate::types::FailureKind::RateLimit.max_attempts());
    }

    #[tokio::test]
    async fn classify_and_retry_does_not_repeat_side_effect_on_success() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let outcome = classify_and_retry(None, move |_attempt| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, (String, Option<u16>)>(7)
            }
        })
        .await;

        assert!(outcome.success);
        assert_eq!(outcome.value, Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
