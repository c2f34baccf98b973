//! systemd Supervisor - `systemctl` Restart Requests
//!
//! Runs `systemctl restart <unit>` and `systemctl is-active <unit>`
//! through `tokio::process`, each bounded by a timeout.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, instrument};

use crate::error::SupervisorError;
use crate::ports::supervisor::{ServiceStatus, ServiceSupervisor};

/// Supervisor backed by the local systemd instance.
pub struct SystemdSupervisor {
    /// `systemctl` binary (overridable for `--user` wrappers and tests).
    program: String,
    /// Extra leading arguments, e.g. `["--user"]`.
    base_args: Vec<String>,
    timeout: Duration,
}

struct CommandOutput {
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl SystemdSupervisor {
    pub fn new(timeout: Duration) -> Self {
        Self::with_program("systemctl", Vec::new(), timeout)
    }

    pub fn with_program(program: impl Into<String>, base_args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            base_args,
            timeout,
        }
    }

    fn describe(&self, verb: &str, unit: &str) -> String {
        let mut parts = vec![self.program.as_str()];
        parts.extend(self.base_args.iter().map(String::as_str));
        parts.push(verb);
        parts.push(unit);
        parts.join(" ")
    }

    async fn run(&self, verb: &str, unit: &str) -> Result<CommandOutput, SupervisorError> {
        let command = self.describe(verb, unit);
        let child = Command::new(&self.program)
            .args(&self.base_args)
            .arg(verb)
            .arg(unit)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| SupervisorError::Timeout {
                command: command.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| SupervisorError::Spawn {
                command: command.clone(),
                source,
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl ServiceSupervisor for SystemdSupervisor {
    #[instrument(skip(self))]
    async fn restart(&self, service: &str) -> Result<(), SupervisorError> {
        let output = self.run("restart", service).await?;
        if output.code != Some(0) {
            return Err(SupervisorError::Failed {
                command: self.describe("restart", service),
                code: output.code,
                stderr: output.stderr,
            });
        }
        info!(service, "Restart requested via systemctl");
        Ok(())
    }

    async fn status(&self, service: &str) -> Result<ServiceStatus, SupervisorError> {
        // `is-active` exits non-zero for anything but active; the state
        // word on stdout is what matters.
        let output = self.run("is-active", service).await?;
        Ok(match output.stdout.as_str() {
            "active" | "reloading" | "activating" => ServiceStatus::Active,
            "inactive" | "deactivating" => ServiceStatus::Inactive,
            "failed" => ServiceStatus::Failed,
            other => ServiceStatus::Unknown(other.to_string()),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_command_is_ok() {
        // `true restart <unit>` exits 0.
        let supervisor = SystemdSupervisor::with_program("true", Vec::new(), Duration::from_secs(5));
        assert!(supervisor.restart("tidepool").await.is_ok());
    }

    #[tokio::test]
    async fn failing_command_reports_exit_code() {
        let supervisor = SystemdSupervisor::with_program("false", Vec::new(), Duration::from_secs(5));
        match supervisor.restart("tidepool").await {
            Err(SupervisorError::Failed { code, command, .. }) => {
                assert_eq!(code, Some(1));
                assert_eq!(command, "false restart tidepool");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    /// Stand-in for `systemctl is-active`: prints a state per unit and,
    /// like systemctl, exits non-zero for anything but active.
    fn fake_systemctl() -> SystemdSupervisor {
        let script = r#"case "$2" in
  web) echo active ;;
  batch) echo inactive; exit 3 ;;
  broken) echo failed; exit 3 ;;
  *) echo maintenance; exit 4 ;;
esac"#;
        SystemdSupervisor::with_program(
            "sh",
            vec!["-c".to_string(), script.to_string(), "systemctl".to_string()],
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn status_maps_state_words() {
        let supervisor = fake_systemctl();
        assert_eq!(supervisor.status("web").await.unwrap(), ServiceStatus::Active);
        assert_eq!(supervisor.status("batch").await.unwrap(), ServiceStatus::Inactive);
        assert_eq!(supervisor.status("broken").await.unwrap(), ServiceStatus::Failed);
        assert_eq!(
            supervisor.status("other").await.unwrap(),
            ServiceStatus::Unknown("maintenance".to_string())
        );
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let supervisor = SystemdSupervisor::with_program(
            "/nonexistent/systemctl",
            Vec::new(),
            Duration::from_secs(5),
        );
        assert!(matches!(
            supervisor.status("tidepool").await,
            Err(SupervisorError::Spawn { .. })
        ));
    }
}
