//! Health/preflight checks (§4.11): run before a worker or team starts,
//! verifying the environment is sane enough to begin a session.
//!
//! Three checks, mirrored from the project's health-check prototype:
//! required configuration is present, there is enough disk space in the
//! project directory, and no orphaned runtime process from a previous run
//! is still alive. Retries `config.health_check_retries` times with
//! `config.health_check_delay_secs` between attempts before giving up.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use sysinfo::{Pid, System};

use crate::config::RuntimeConfig;

const MINIMUM_DISK_SPACE_GB: f64 = 1.0;
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckResult {
    pub passed: bool,
    pub reason: String,
    pub details: BTreeMap<String, String>,
}

impl HealthCheckResult {
    fn ok(details: BTreeMap<String, String>) -> HealthCheckResult {
        HealthCheckResult { passed: true, reason: String::new(), details }
    }

    fn fail(reason: impl Into<String>, details: BTreeMap<String, String>) -> HealthCheckResult {
        HealthCheckResult { passed: false, reason: reason.into(), details }
    }
}

impl std::fmt::Display for HealthCheckResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.passed {
            write!(f, "health check passed")
        } else {
            write!(f, "health check failed: {}", self.reason)
        }
    }
}

/// Required settings are present: task/notify service URLs and the API
/// key. Does not attempt a live network call — reachability is the task
/// queue's own concern once a worker actually starts talking to it.
fn check_config(config: &RuntimeConfig) -> HealthCheckResult {
    let mut issues = Vec::new();
    let mut details = BTreeMap::new();

    if config.task_service_url.trim().is_empty() {
        issues.push("task service URL not configured".to_string());
    } else {
        details.insert("task_service_url".to_string(), config.task_service_url.clone());
    }
    if config.notify_service_url.trim().is_empty() {
        issues.push("notify service URL not configured".to_string());
    } else {
        details.insert("notify_service_url".to_string(), config.notify_service_url.clone());
    }
    if config.api_key.trim().is_empty() {
        issues.push("API key not configured".to_string());
    } else {
        let masked = if config.api_key.len() > 4 {
            format!("***{}", &config.api_key[config.api_key.len() - 4..])
        } else {
            "***".to_string()
        };
        details.insert("api_key".to_string(), masked);
    }

    if issues.is_empty() {
        HealthCheckResult::ok(details)
    } else {
        HealthCheckResult::fail(issues.join("; "), details)
    }
}

/// At least `min_gb` free in the filesystem backing `project_dir`.
fn check_disk_space(project_dir: &Path, min_gb: f64) -> HealthCheckResult {
    let mut details = BTreeMap::new();
    details.insert("path".to_string(), project_dir.display().to_string());

    let stat = match nix::sys::statvfs::statvfs(project_dir) {
        Ok(stat) => stat,
        Err(e) => {
            details.insert("error".to_string(), e.to_string());
            return HealthCheckResult::fail(format!("could not check disk space: {}", e), details);
        }
    };

    let free_bytes = stat.blocks_available() as f64 * stat.fragment_size() as f64;
    let free_gb = free_bytes / BYTES_PER_GB;
    details.insert("free_gb".to_string(), format!("{:.2}", free_gb));
    details.insert("required_gb".to_string(), format!("{}", min_gb));

    if free_gb < min_gb {
        HealthCheckResult::fail(
            format!("disk space low: {:.2}GB free, need at least {}GB", free_gb, min_gb),
            details,
        )
    } else {
        HealthCheckResult::ok(details)
    }
}

/// No other `axon-runtime worker`/`axon-runtime team` process still alive
/// from a previous run. Best-effort: if process enumeration itself fails
/// to find anything conclusive, the check passes rather than blocking
/// startup on an environment quirk.
fn check_orphan_processes(binary_name: &str) -> HealthCheckResult {
    let mut details = BTreeMap::new();
    let current_pid = std::process::id();

    let mut system = System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);

    let mut orphans = Vec::new();
    for (pid, process) in system.processes() {
        if pid.as_u32() == current_pid {
            continue;
        }
        let cmd_matches = process
            .cmd()
            .iter()
            .any(|arg| arg.to_string_lossy().contains(binary_name));
        if cmd_matches {
            orphans.push(*pid);
        }
        if orphans.len() >= 5 {
            break;
        }
    }

    details.insert("orphan_count".to_string(), orphans.len().to_string());
    if orphans.is_empty() {
        HealthCheckResult::ok(details)
    } else {
        let pids: Vec<String> = orphans.iter().map(|p: &Pid| p.as_u32().to_string()).collect();
        details.insert("orphan_pids".to_string(), pids.join(","));
        HealthCheckResult::fail(format!("found {} orphan runtime process(es)", orphans.len()), details)
    }
}

/// Run all three checks once, combining their failures into a single
/// result.
fn run_checks_once(config: &RuntimeConfig, project_dir: &Path, binary_name: &str) -> HealthCheckResult {
    let mut details = BTreeMap::new();
    let mut reasons = Vec::new();
    let mut passed = true;

    for (label, result) in [
        ("config", check_config(config)),
        ("disk", check_disk_space(project_dir, MINIMUM_DISK_SPACE_GB)),
        ("orphans", check_orphan_processes(binary_name)),
    ] {
        for (k, v) in result.details {
            details.insert(format!("{}.{}", label, k), v);
        }
        if !result.passed {
            passed = false;
            reasons.push(format!("{}: {}", label, result.reason));
        }
    }

    if passed {
        HealthCheckResult::ok(details)
    } else {
        HealthCheckResult::fail(reasons.join("; "), details)
    }
}

/// Run the checks with retry, sleeping `sleep_fn(delay)` between attempts.
/// `sleep_fn` is injected so tests run without real delays.
pub async fn run_health_check<S, SFut>(
    config: &RuntimeConfig,
    project_dir: &Path,
    binary_name: &str,
    mut sleep_fn: S,
) -> HealthCheckResult
where
    S: FnMut(Duration) -> SFut,
    SFut: std::future::Future<Output = ()>,
{
    let max_attempts = config.health_check_retries.max(1);
    let mut last = run_checks_once(config, project_dir, binary_name);

    for attempt in 1..max_attempts {
        if last.passed {
            return last;
        }
        crate::log_warn!(
            "preflight attempt {}/{} failed: {}",
            attempt,
            max_attempts,
            last.reason
        );
        sleep_fn(Duration::from_secs(config.health_check_delay_secs)).await;
        last = run_checks_once(config, project_dir, binary_name);
    }

    last
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> RuntimeConfig {
        RuntimeConfig {
            task_service_url: "http://localhost:8001".to_string(),
            notify_service_url: "http://localhost:8002".to_string(),
            api_key: "secretkey".to_string(),
            health_check_retries: 2,
            health_check_delay_secs: 0,
            ..RuntimeConfig::default()
        }
    }

    #[test]
    fn check_config_reports_each_missing_field() {
        let config = RuntimeConfig::default();
        let result = check_config(&config);
        assert!(!result.passed);
        assert!(result.reason.contains("task service URL"));
        assert!(result.reason.contains("notify service URL"));
        assert!(result.reason.contains("API key"));
    }

    #[test]
    fn check_config_passes_when_populated() {
        let result = check_config(&base_config());
        assert!(result.passed);
        assert_eq!(result.details.get("task_service_url").unwrap(), "http://localhost:8001");
    }

    #[test]
    fn check_disk_space_passes_for_real_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let result = check_disk_space(dir.path(), 0.0001);
        assert!(result.passed);
    }

    #[test]
    fn check_disk_space_fails_when_requirement_absurd() {
        let dir = tempfile::tempdir().unwrap();
        let result = check_disk_space(dir.path(), f64::MAX / BYTES_PER_GB);
        assert!(!result.passed);
    }

    #[test]
    fn check_orphan_processes_excludes_self() {
        // Our own process cmdline will not match this nonsense binary name,
        // so this should always pass.
        let result = check_orphan_processes("definitely-not-a-real-binary-name-xyz");
        assert!(result.passed);
    }

    #[tokio::test]
    async fn run_health_check_retries_then_passes_once_disk_and_config_ok() {
        let dir = tempfile::tempdir().unwrap();
        let config = base_config();
        let sleeps = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let sleeps2 = sleeps.clone();
        let result = run_health_check(&config, dir.path(), "definitely-not-a-real-binary-name-xyz", move |_d| {
            sleeps2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async {}
        })
        .await;
        assert!(result.passed);
        assert_eq!(sleeps.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_health_check_fails_after_exhausting_retries_on_bad_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config();
        config.task_service_url.clear();
        let attempts = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let attempts2 = attempts.clone();
        let result = run_health_check(&config, dir.path(), "definitely-not-a-real-binary-name-xyz", move |_d| {
            attempts2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async {}
        })
        .await;
        assert!(!result.passed);
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
