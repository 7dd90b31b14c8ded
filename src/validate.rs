//! Post-install validation probe.
//!
//! A formula's `test` command is run against the committed keg to prove the
//! installed tool starts. The probe sees a cleared environment whose `PATH`
//! starts with the keg's own `bin`, runs in a throwaway directory, and is
//! killed after a timeout. A failing probe is a degraded result recorded in
//! the receipt; whether the keg is kept is the caller's [`ValidationPolicy`].

use crate::error::{InstallError, Result};
use crate::executor::{self, DependencyKeg};
use crate::formula::FormulaRecord;
use crate::receipt::ValidationStatus;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// What to do with a keg whose probe fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ValidationPolicy {
    /// Keep the keg, record the failure in the receipt
    #[default]
    KeepAndWarn,
    /// Roll the keg back and fail the install
    RollBack,
}

pub struct ValidationRunner {
    build_path: String,
    timeout: Duration,
}

impl ValidationRunner {
    pub fn new(build_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            build_path: build_path.into(),
            timeout,
        }
    }

    /// Run the formula's probe against `keg`.
    ///
    /// Only cancellation is an error; a probe that cannot even start counts as failed.
    pub async fn run(
        &self,
        formula: &FormulaRecord,
        keg: &Path,
        dependencies: &[DependencyKeg],
        cancel: &CancellationToken,
    ) -> Result<ValidationStatus> {
        let Some((program, args)) = formula.test.as_deref().and_then(|argv| argv.split_first())
        else {
            return Ok(ValidationStatus::Skipped);
        };
        let command_line = formula.test.as_deref().unwrap_or_default().join(" ");

        let scratch = tempfile::tempdir()?;
        let path = executor::search_path(dependencies, Some(&keg.join("bin")), &self.build_path);

        tracing::debug!(formula = %formula.name, command = %command_line, "running validation probe");

        let spawned = Command::new(program)
            .args(args)
            .env_clear()
            .env("PATH", path)
            .env("HOME", scratch.path())
            .env("TMPDIR", scratch.path())
            .current_dir(scratch.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return Ok(ValidationStatus::Failed {
                    command: command_line,
                    exit_status: "spawn error".to_string(),
                    output: e.to_string(),
                });
            }
        };

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InstallError::Cancelled),
            _ = tokio::time::sleep(self.timeout) => {
                return Ok(ValidationStatus::Failed {
                    command: command_line,
                    exit_status: format!("timeout after {:?}", self.timeout),
                    output: String::new(),
                });
            }
            output = child.wait_with_output() => output?,
        };

        if output.status.success() {
            Ok(ValidationStatus::Passed)
        } else {
            Ok(ValidationStatus::Failed {
                command: command_line,
                exit_status: output.status.to_string(),
                output: executor::combined_output(&output.stdout, &output.stderr),
            })
        }
    }
}

impl Default for ValidationRunner {
    fn default() -> Self {
        Self::new(executor::DEFAULT_BUILD_PATH, DEFAULT_TIMEOUT)
    }
}

/// The error a failed probe becomes under [`ValidationPolicy::RollBack`]
pub fn failure_error(status: &ValidationStatus) -> Option<InstallError> {
    match status {
        ValidationStatus::Failed {
            command,
            exit_status,
            output,
        } => Some(InstallError::ValidationFailed {
            command: command.clone(),
            status: exit_status.clone(),
            output: output.clone(),
        }),
        _ => None,
    }
}
