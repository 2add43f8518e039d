//! External command execution for the traffic-control tooling.
//!
//! Every query and mutation of kernel state goes through here, so failed
//! commands are logged the same way no matter who issued them. A failing
//! command never aborts the process; callers decide how severe it is.
//!
//! # Example
//!
//! ```ignore
//! use lldp_mirror_common::shell::{self, TC_CMD, shellquote};
//!
//! let cmd = format!("{} filter show dev {} parent ffff:", TC_CMD, shellquote("bond0"));
//! let result = shell::exec(&cmd).await?;
//! ```

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{MirrorError, MirrorResult};

/// Path to the `ip` command for link queries.
pub const IP_CMD: &str = "/sbin/ip";

/// Path to the `tc` command for qdisc and filter management.
pub const TC_CMD: &str = "/sbin/tc";

/// Regex for characters that need escaping in shell double-quotes.
/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// The string is wrapped in double quotes and `$`, `` ` ``, `"`, `\` and
/// newline are escaped.
///
/// # Example
///
/// ```
/// use lldp_mirror_common::shell::shellquote;
///
/// assert_eq!(shellquote("bond0"), "\"bond0\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// The stdout output.
    pub stdout: String,
    /// The stderr output.
    pub stderr: String,
}

impl ExecResult {
    /// Builds a successful result carrying `stdout`.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Builds a failed result carrying `stderr`.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// Converts a non-zero exit into [`MirrorError::ShellCommandFailed`].
    pub fn into_result(self, cmd: &str) -> MirrorResult<String> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(MirrorError::ShellCommandFailed {
                command: cmd.to_string(),
                exit_code: self.exit_code,
                output: self.combined_output(),
            })
        }
    }
}

/// Executes a command line asynchronously through `/bin/sh -c`.
///
/// # Returns
///
/// * `Ok(ExecResult)` - The command execution result, successful or not
/// * `Err(MirrorError)` - If the command could not be spawned
pub async fn exec(cmd: &str) -> MirrorResult<ExecResult> {
    tracing::debug!(command = %cmd, "Executing command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| MirrorError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?;

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    let result = ExecResult {
        exit_code,
        stdout,
        stderr,
    };
    log_outcome(cmd, &result);

    Ok(result)
}

fn log_outcome(cmd: &str, result: &ExecResult) {
    if result.success() {
        tracing::trace!(command = %cmd, exit_code = result.exit_code, "Command succeeded");
    } else {
        tracing::warn!(
            command = %cmd,
            exit_code = result.exit_code,
            output = %result.combined_output(),
            "Command failed"
        );
    }
}

/// Issues commands to the traffic-control subsystem.
///
/// The engine and prober only ever talk to the kernel through this trait.
/// [`ShellRunner`] runs the commands for real.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `cmd` and reports its outcome. Only spawn failures are `Err`.
    async fn run(&self, cmd: &str) -> MirrorResult<ExecResult>;

    /// Runs `cmd`, treating a non-zero exit as an error.
    async fn run_or_throw(&self, cmd: &str) -> MirrorResult<String> {
        self.run(cmd).await?.into_result(cmd)
    }
}

/// Runs commands on the host through `/bin/sh`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, cmd: &str) -> MirrorResult<ExecResult> {
        exec(cmd).await
    }
}
