//! Runtime configuration (§4.12): environment-variable inputs plus an
//! optional TOML override file, loaded once at process startup.
//!
//! Grounded in the teacher's config loader: nested structs with
//! `#[serde(default)]`, a `validate()` returning `Vec<String>`, and a
//! `load_config_at(path)` / `load_config()` pair. Here the TOML file
//! supplies *defaults*; environment variables always win, since the env is
//! the documented external interface (§6) and the file is an operator
//! convenience layered under it.

use std::path::Path;

use serde::Deserialize;

const DEFAULT_MAX_CONTEXT_TOKENS: u64 = 180_000;
const DEFAULT_MAX_SESSION_FILES: u32 = 50;
const DEFAULT_PAUSE_POLL_SECS: u64 = 60;
const DEFAULT_HEALTH_CHECK_RETRIES: u32 = 3;
const DEFAULT_HEALTH_CHECK_DELAY_SECS: u64 = 30;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
const DEFAULT_MAX_PHASE_RETRIES: u32 = 2;
const DEFAULT_MCP_TIMEOUT_SECS: u64 = 30;

/// Fully resolved configuration for one process.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub task_service_url: String,
    pub notify_service_url: String,
    pub api_key: String,
    pub max_context_tokens: u64,
    pub max_session_files: u32,
    pub pause_poll_interval_secs: u64,
    pub health_check_retries: u32,
    pub health_check_delay_secs: u64,
    pub poll_interval_secs: u64,
    pub max_tasks: Option<u32>,
    pub num_workers: u32,
    pub max_phase_retries: u32,
    pub mcp_timeout_secs: u64,
    pub log_level: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            task_service_url: String::new(),
            notify_service_url: String::new(),
            api_key: String::new(),
            max_context_tokens: DEFAULT_MAX_CONTEXT_TOKENS,
            max_session_files: DEFAULT_MAX_SESSION_FILES,
            pause_poll_interval_secs: DEFAULT_PAUSE_POLL_SECS,
            health_check_retries: DEFAULT_HEALTH_CHECK_RETRIES,
            health_check_delay_secs: DEFAULT_HEALTH_CHECK_DELAY_SECS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            max_tasks: None,
            num_workers: 1,
            max_phase_retries: DEFAULT_MAX_PHASE_RETRIES,
            mcp_timeout_secs: DEFAULT_MCP_TIMEOUT_SECS,
            log_level: None,
        }
    }
}

/// Shape of the optional `<project>/.agent/config.toml` override file.
/// Every field is optional; present fields become the default that env
/// vars are then layered on top of.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileOverrides {
    pub task_service_url: Option<String>,
    pub notify_service_url: Option<String>,
    pub api_key: Option<String>,
    pub max_context_tokens: Option<u64>,
    pub max_session_files: Option<u32>,
    pub pause_poll_interval_secs: Option<u64>,
    pub health_check_retries: Option<u32>,
    pub health_check_delay_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub max_tasks: Option<u32>,
    pub num_workers: Option<u32>,
    pub max_phase_retries: Option<u32>,
    pub mcp_timeout_secs: Option<u64>,
    pub log_level: Option<String>,
}

/// Read one typed env var, falling back to `default` when unset and
/// appending a human-readable message to `errors` when set-but-unparseable
/// (never panics).
fn env_or<T: std::str::FromStr>(key: &str, default: T, errors: &mut Vec<String>) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            errors.push(format!("{} has an invalid value: '{}'", key, raw));
            default
        }),
        Err(_) => default,
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

/// Build a `RuntimeConfig` by layering env vars over `overrides`, which
/// itself layers over built-in defaults. Parse failures on an env var are
/// collected rather than panicking; the caller decides via `validate()`
/// whether to refuse to start.
pub fn resolve_config(overrides: &FileOverrides) -> (RuntimeConfig, Vec<String>) {
    let defaults = RuntimeConfig::default();
    let mut errors = Vec::new();

    let config = RuntimeConfig {
        task_service_url: env_string(
            "PG_TASK_SERVICE_URL",
            overrides.task_service_url.clone().unwrap_or(defaults.task_service_url),
        ),
        notify_service_url: env_string(
            "PG_NOTIFY_SERVICE_URL",
            overrides.notify_service_url.clone().unwrap_or(defaults.notify_service_url),
        ),
        api_key: env_string("PG_API_KEY", overrides.api_key.clone().unwrap_or(defaults.api_key)),
        max_context_tokens: env_or(
            "PG_MAX_CONTEXT_TOKENS",
            overrides.max_context_tokens.unwrap_or(defaults.max_context_tokens),
            &mut errors,
        ),
        max_session_files: env_or(
            "PG_MAX_SESSION_FILES",
            overrides.max_session_files.unwrap_or(defaults.max_session_files),
            &mut errors,
        ),
        pause_poll_interval_secs: env_or(
            "PG_PAUSE_POLL_SECS",
            overrides.pause_poll_interval_secs.unwrap_or(defaults.pause_poll_interval_secs),
            &mut errors,
        ),
        health_check_retries: env_or(
            "PG_HEALTH_CHECK_RETRIES",
            overrides.health_check_retries.unwrap_or(defaults.health_check_retries),
            &mut errors,
        ),
        health_check_delay_secs: env_or(
            "PG_HEALTH_CHECK_DELAY_SECS",
            overrides.health_check_delay_secs.unwrap_or(defaults.health_check_delay_secs),
            &mut errors,
        ),
        poll_interval_secs: env_or(
            "PG_POLL_INTERVAL_SECS",
            overrides.poll_interval_secs.unwrap_or(defaults.poll_interval_secs),
            &mut errors,
        ),
        max_tasks: overrides.max_tasks.or(defaults.max_tasks),
        num_workers: overrides.num_workers.unwrap_or(defaults.num_workers),
        max_phase_retries: overrides.max_phase_retries.unwrap_or(defaults.max_phase_retries),
        mcp_timeout_secs: overrides.mcp_timeout_secs.unwrap_or(defaults.mcp_timeout_secs),
        log_level: std::env::var("PG_LOG_LEVEL").ok().or_else(|| overrides.log_level.clone()),
    };

    (config, errors)
}

/// Validate a resolved config, returning every problem found (never just
/// the first) so a human can fix all of them in one pass.
pub fn validate(config: &RuntimeConfig) -> Vec<String> {
    let mut errors = Vec::new();

    if config.task_service_url.trim().is_empty() {
        errors.push("task_service_url must not be empty (set PG_TASK_SERVICE_URL)".to_string());
    }
    if config.notify_service_url.trim().is_empty() {
        errors.push("notify_service_url must not be empty (set PG_NOTIFY_SERVICE_URL)".to_string());
    }
    if config.api_key.trim().is_empty() {
        errors.push("api_key must not be empty (set PG_API_KEY)".to_string());
    }
    if config.max_context_tokens == 0 {
        errors.push("max_context_tokens must be > 0".to_string());
    }
    if config.max_session_files == 0 {
        errors.push("max_session_files must be > 0".to_string());
    }
    if config.num_workers == 0 {
        errors.push("num_workers must be >= 1".to_string());
    }
    if config.poll_interval_secs == 0 {
        errors.push("poll_interval_secs must be > 0".to_string());
    }
    if config.mcp_timeout_secs == 0 {
        errors.push("mcp_timeout_secs must be > 0".to_string());
    }

    errors
}

fn parse_overrides(contents: &str) -> Result<FileOverrides, String> {
    toml::from_str(contents).map_err(|e| format!("failed to parse config file: {}", e))
}

/// Load overrides from an explicit path. The file MUST exist.
pub fn load_config_at(path: &Path) -> Result<FileOverrides, String> {
    if !path.exists() {
        return Err(format!("config file not found: {}", path.display()));
    }
    let contents =
        std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_overrides(&contents)
}

/// Load overrides from `<project>/.agent/config.toml` if present, else
/// built-in defaults (no error: the file is optional).
pub fn load_config(project_root: &Path) -> Result<FileOverrides, String> {
    let path = project_root.join(".agent").join("config.toml");
    if !path.exists() {
        return Ok(FileOverrides::default());
    }
    load_config_at(&path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_context_tokens, 180_000);
        assert_eq!(config.max_session_files, 50);
        assert_eq!(config.pause_poll_interval_secs, 60);
        assert_eq!(config.max_phase_retries, 2);
        assert_eq!(config.mcp_timeout_secs, 30);
    }

    #[test]
    fn validate_rejects_empty_urls_and_zero_tokens() {
        let mut config = RuntimeConfig::default();
        config.max_context_tokens = 0;
        let errors = validate(&config);
        assert!(errors.iter().any(|e| e.contains("task_service_url")));
        assert!(errors.iter().any(|e| e.contains("notify_service_url")));
        assert!(errors.iter().any(|e| e.contains("api_key")));
        assert!(errors.iter().any(|e| e.contains("max_context_tokens")));
    }

    #[test]
    fn validate_passes_on_fully_populated_config() {
        let config = RuntimeConfig {
            task_service_url: "http://localhost:8001".to_string(),
            notify_service_url: "http://localhost:8002".to_string(),
            api_key: "secret".to_string(),
            ..RuntimeConfig::default()
        };
        assert!(validate(&config).is_empty());
    }

    #[test]
    fn missing_override_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = load_config(dir.path()).unwrap();
        assert_eq!(overrides, FileOverrides::default());
    }

    #[test]
    fn override_file_supplies_defaults_that_resolve_picks_up() {
        let contents = "task_service_url = \"http://file-default:8001\"\nnum_workers = 4\n";
        let overrides = parse_overrides(contents).unwrap();
        assert_eq!(overrides.task_service_url.as_deref(), Some("http://file-default:8001"));
        assert_eq!(overrides.num_workers, Some(4));

        // SAFETY: test runs single-threaded per process for this assertion;
        // no other test in this module reads PG_TASK_SERVICE_URL.
        std::env::remove_var("PG_TASK_SERVICE_URL");
        let (config, errors) = resolve_config(&overrides);
        assert!(errors.is_empty());
        assert_eq!(config.task_service_url, "http://file-default:8001");
        assert_eq!(config.num_workers, 4);
    }

    #[test]
    fn load_config_at_errors_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        assert!(load_config_at(&path).is_err());
    }
}
