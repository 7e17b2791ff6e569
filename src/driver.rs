//! Concrete [`SessionDriver`] (§4.14 CLI surface, §4.9): drives one phase by
//! shelling out to a configured coding-agent CLI, the same way the LLM
//! conversation is out of scope — this module only has to invoke whatever
//! binary the operator configured and interpret its final response text.
//!
//! Grounded in the subprocess-isolation pattern used for process groups
//! elsewhere in this crate (team coordinator, checkpoint locking): stdin
//! null, its own process group, SIGTERM-then-SIGKILL on timeout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::unistd::Pid;

use crate::budget::{should_trigger_shutdown, should_use_minimal_prompt};
use crate::log_debug;
use crate::log_warn;
use crate::supervisor::{detect_signal, PhaseOutcome, SessionDriver};
use crate::types::{estimate_tokens, ContextMode, Issue, Phase};

const TERM_GRACE: Duration = Duration::from_secs(5);

/// Which CLI binary to invoke and how to build its argument list. Two
/// shapes cover the agent CLIs actually seen in this ecosystem: a prompt
/// passed as a flag (`claude -p "..."`), or a prompt piped on stdin.
#[derive(Debug, Clone)]
pub struct CliAgentConfig {
    pub binary: String,
    pub model: Option<String>,
    pub timeout: Duration,
}

impl Default for CliAgentConfig {
    fn default() -> CliAgentConfig {
        CliAgentConfig {
            binary: "claude".to_string(),
            model: None,
            timeout: Duration::from_secs(600),
        }
    }
}

impl CliAgentConfig {
    fn build_args(&self, prompt: &str) -> Vec<String> {
        let mut args = vec!["--dangerously-skip-permissions".to_string()];
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.push("-p".to_string());
        args.push(prompt.to_string());
        args
    }

    /// Verify the binary is on `PATH` and responds to `--version`. Call
    /// once during preflight/startup, not per-phase.
    pub fn verify_available(&self) -> Result<(), String> {
        let output = std::process::Command::new(&self.binary)
            .arg("--version")
            .output()
            .map_err(|e| format!("{} not found on PATH: {}", self.binary, e))?;
        if !output.status.success() {
            return Err(format!("{} --version exited non-zero", self.binary));
        }
        Ok(())
    }
}

/// Drives phases by invoking [`CliAgentConfig`] once per phase, in
/// `project_dir`'s process-group-isolated subprocess.
pub struct CliSessionDriver {
    pub agent: CliAgentConfig,
    pub project_dir: PathBuf,
}

impl CliSessionDriver {
    pub fn new(agent: CliAgentConfig, project_dir: PathBuf) -> CliSessionDriver {
        CliSessionDriver { agent, project_dir }
    }

    fn build_prompt(&self, phase: Phase, issue: &Issue, recovery_block: Option<&str>, mode: ContextMode) -> String {
        let mut prompt = String::new();
        if let Some(block) = recovery_block {
            prompt.push_str(block);
            prompt.push_str("\n\n");
        }

        if should_use_minimal_prompt(mode) {
            prompt.push_str(&format!(
                "Continuing the '{}' phase for issue {}: {}.\n",
                phase.as_str(),
                issue.id,
                issue.title
            ));
            prompt.push_str(
                "Context budget is running low; skip restating background you already have and \
                 work from the minimum needed to keep going.\n",
            );
        } else {
            prompt.push_str(&format!(
                "You are running the '{}' phase of an autonomous coding session for issue {} ({}).\n",
                phase.as_str(),
                issue.id,
                issue.title
            ));
        }

        if should_trigger_shutdown(mode) {
            prompt.push_str(
                "Context budget is critical. Wrap up now: flush anything worth remembering and \
                 include the exact text CONTEXT_LIMIT_REACHED: followed by what remains to be done.\n",
            );
        }

        prompt.push_str(
            "Work only within the current project directory. When every phase of this issue \
             is complete, include the exact text ALL_TASKS_DONE: followed by a short summary. \
             If you run out of usable context before finishing, include CONTEXT_LIMIT_REACHED: \
             followed by what remains to be done.",
        );
        prompt
    }
}

impl SessionDriver for CliSessionDriver {
    async fn run_phase(
        &self,
        phase: Phase,
        issue: &Issue,
        recovery_block: Option<&str>,
        mode: ContextMode,
    ) -> Result<PhaseOutcome, String> {
        let prompt = self.build_prompt(phase, issue, recovery_block, mode);
        let response = run_agent_subprocess(&self.agent, &self.project_dir, &prompt).await?;

        let mut tokens_used = std::collections::BTreeMap::new();
        tokens_used.insert("tool_outputs".to_string(), estimate_tokens(&response));

        let mut outcome = PhaseOutcome::normal(tokens_used);
        outcome.signal = detect_signal(&response);
        Ok(outcome)
    }
}

/// Spawn `agent.binary` with `prompt`, isolated in its own process group,
/// enforcing `agent.timeout`. Returns the captured stdout text.
async fn run_agent_subprocess(
    agent: &CliAgentConfig,
    project_dir: &Path,
    prompt: &str,
) -> Result<String, String> {
    let mut cmd = tokio::process::Command::new(&agent.binary);
    cmd.args(agent.build_args(prompt));
    cmd.current_dir(project_dir);
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

    let mut child = cmd.spawn().map_err(|e| format!("failed to spawn {}: {}", agent.binary, e))?;
    let pid = child.id().ok_or_else(|| "failed to get agent PID".to_string())? as i32;

    let output = tokio::time::timeout(agent.timeout, child.wait_with_output()).await;

    match output {
        Ok(Ok(output)) => {
            if output.status.success() {
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            } else {
                Err(format!(
                    "{} exited with {:?}: {}",
                    agent.binary,
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr)
                ))
            }
        }
        Ok(Err(e)) => Err(format!("error waiting for {}: {}", agent.binary, e)),
        Err(_) => {
            log_warn!("{} timed out after {:?}, killing process group {}", agent.binary, agent.timeout, pid);
            terminate_pgid(pid).await;
            Err(format!("{} timed out after {:?}", agent.binary, agent.timeout))
        }
    }
}

async fn terminate_pgid(pid: i32) {
    use nix::sys::signal::{killpg, Signal};
    let pgid = Pid::from_raw(pid);
    let _ = killpg(pgid, Signal::SIGTERM);
    tokio::time::sleep(TERM_GRACE).await;
    if killpg(pgid, None).is_ok() {
        log_debug!("process group {} still alive after grace period, sending SIGKILL", pid);
        let _ = killpg(pgid, Signal::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IssuePriority;

    #[test]
    fn build_args_includes_model_and_prompt_flag() {
        let agent = CliAgentConfig {
            binary: "claude".to_string(),
            model: Some("sonnet".to_string()),
            timeout: Duration::from_secs(1),
        };
        let args = agent.build_args("do the thing");
        assert!(args.contains(&"--model".to_string()));
        assert!(args.contains(&"sonnet".to_string()));
        assert!(args.contains(&"-p".to_string()));
        assert!(args.contains(&"do the thing".to_string()));
    }

    #[test]
    fn prompt_includes_phase_issue_and_recovery_block() {
        let driver = CliSessionDriver::new(CliAgentConfig::default(), PathBuf::from("/tmp/proj"));
        let issue = Issue { id: "ENG-1".to_string(), title: "Fix thing".to_string(), priority: IssuePriority::High };
        let prompt = driver.build_prompt(Phase::Orient, &issue, Some("## Recovery Mode\nresuming"), ContextMode::Normal);
        assert!(prompt.contains("## Recovery Mode"));
        assert!(prompt.contains("ENG-1"));
        assert!(prompt.contains("orient"));
        assert!(prompt.contains("ALL_TASKS_DONE:"));
    }

    #[test]
    fn build_prompt_uses_minimal_shape_when_compact() {
        let driver = CliSessionDriver::new(CliAgentConfig::default(), PathBuf::from("/tmp/proj"));
        let issue = Issue { id: "ENG-1".to_string(), title: "Fix thing".to_string(), priority: IssuePriority::High };
        let prompt = driver.build_prompt(Phase::Implementation, &issue, None, ContextMode::Compact);
        assert!(prompt.contains("Continuing the 'implementation' phase"));
        assert!(prompt.contains("running low"));
    }

    #[test]
    fn build_prompt_requests_shutdown_when_critical() {
        let driver = CliSessionDriver::new(CliAgentConfig::default(), PathBuf::from("/tmp/proj"));
        let issue = Issue { id: "ENG-1".to_string(), title: "Fix thing".to_string(), priority: IssuePriority::High };
        let prompt = driver.build_prompt(Phase::Implementation, &issue, None, ContextMode::Critical);
        assert!(prompt.contains("CONTEXT_LIMIT_REACHED"));
        assert!(prompt.contains("Wrap up now"));
    }

    #[tokio::test]
    async fn run_agent_subprocess_reports_spawn_failure_for_missing_binary() {
        let agent = CliAgentConfig {
            binary: "definitely-not-a-real-binary-xyz".to_string(),
            model: None,
            timeout: Duration::from_secs(5),
        };
        let result = run_agent_subprocess(&agent, Path::new("."), "hello").await;
        assert!(result.is_err());
    }
}
