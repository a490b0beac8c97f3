//! Sandboxed command execution.
//!
//! Every launch runs the verified shell with initialisation files disabled
//! (`--norc --noprofile`), the allow-listed environment from `wardsh-env`,
//! an `LD_PRELOAD` directive pointing at the Landlock sandbox library, and
//! a pre-exec hook that sets `PR_SET_NO_NEW_PRIVS`.
//!
//! The division of labour matters: no-new-privs must be set between fork
//! and exec in the parent, while the Landlock ruleset must be installed
//! inside the shell process before it runs user code — `exec` would discard
//! a ruleset installed out here. Hence the preload library (verified by the
//! config integrity gate) owns Landlock; this crate owns NNP and the launch
//! argument vector.

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use wardsh_config::integrity::IntegrityError;
use wardsh_config::{Config, Mode, SHELL_PATH};

/// Reference copy of the shell denylist enforced by the preload library.
/// The authoritative set lives in the library itself; this one is for
/// display and status reporting only.
pub const DENIED_SHELLS: &[&str] = &[
    "/bin/sh",
    "/bin/bash",
    "/bin/dash",
    "/bin/zsh",
    "/bin/ksh",
    "/bin/csh",
    "/bin/tcsh",
    "/usr/bin/sh",
    "/usr/bin/bash",
    "/usr/bin/dash",
    "/usr/bin/zsh",
    "/usr/bin/fish",
    "/usr/bin/busybox",
];

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to launch shell: {0}")]
    Launch(#[from] std::io::Error),
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

/// Captured result of a resolution launch.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Launches hardened shell children. Owns the preload bookkeeping so the
/// missing-library warning fires once per session, not once per command.
pub struct Executor {
    config: Config,
    preload_warned: bool,
}

impl Executor {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            preload_warned: false,
        }
    }

    /// Run a command interactively: stdio inherited, exit code returned so
    /// the operator sees the shell's native `$?` semantics. The previous
    /// exit code is made visible to the command via an `(exit N); ` prefix.
    pub async fn execute_interactive(
        &mut self,
        command: &str,
        last_exit_code: i32,
    ) -> Result<i32, ExecError> {
        self.verify_shell()?;
        let wrapped = format!("(exit {last_exit_code}); {command}");
        let mut child = self.shell_command(&wrapped).spawn()?;
        let status = child.wait().await?;
        Ok(exit_code_of(status))
    }

    /// Run a command with captured output and a hard timeout. Used by the
    /// substitution resolver; the same launch hardening applies.
    pub async fn execute_captured(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<CapturedOutput, ExecError> {
        self.verify_shell()?;
        let mut child = self
            .shell_command(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                // wait_with_output consumed the child; the kill-on-drop flag
                // set in shell_command reaps it.
                return Err(ExecError::Timeout(timeout));
            }
        };

        Ok(CapturedOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: exit_code_of(output.status),
        })
    }

    /// In production mode the shell binary is re-verified at every launch,
    /// unless the config-file-only escape hatch is set.
    fn verify_shell(&self) -> Result<(), ExecError> {
        if self.config.mode() == Mode::Production {
            self.config.validate_shell_binary()?;
        }
        Ok(())
    }

    fn shell_command(&mut self, command: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(SHELL_PATH);
        cmd.arg("--norc")
            .arg("--noprofile")
            .arg("-c")
            .arg(command)
            .env_clear()
            .envs(wardsh_env::safe_env())
            .kill_on_drop(true);

        let sandboxer = self.config.sandboxer_path();
        if sandboxer.exists() {
            cmd.env("LD_PRELOAD", &sandboxer);
        } else if self.config.mode() == Mode::Production {
            // Unreachable after the startup gate, but never launch
            // unsandboxed in production if it somehow is.
            cmd.env("LD_PRELOAD", &sandboxer);
        } else if !self.preload_warned {
            self.preload_warned = true;
            warn!(
                path = %sandboxer.display(),
                "sandbox library not found; development launches run without Landlock"
            );
        }

        #[cfg(unix)]
        {
            // SAFETY: called between fork and exec; prctl is
            // async-signal-safe and the hook makes no allocations.
            unsafe {
                cmd.pre_exec(|| set_no_new_privs());
            }
        }

        cmd
    }
}

/// Exit code of a finished child: the code itself, or 128 + signal when the
/// child was signalled (bash convention).
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Set `PR_SET_NO_NEW_PRIVS` for the about-to-exec child. Inherited across
/// execve and cannot be unset, so no child of the shell can gain privileges
/// through setuid or file capabilities.
#[cfg(unix)]
fn set_no_new_privs() -> std::io::Result<()> {
    const PR_SET_NO_NEW_PRIVS: libc::c_int = 38;
    // SAFETY: prctl with these arguments is async-signal-safe.
    if unsafe { libc::prctl(PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;

    fn dev_executor() -> Executor {
        let config =
            Config::load_from(Path::new("/nonexistent/wardsh-config"), HashMap::new()).unwrap();
        Executor::new(config)
    }

    #[tokio::test]
    async fn captured_output_and_exit_code() {
        let mut executor = dev_executor();
        let out = executor
            .execute_captured("echo hi; exit 3", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout, "hi\n");
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn interactive_propagates_exit_code() {
        let mut executor = dev_executor();
        let code = executor.execute_interactive("exit 7", 0).await.unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn previous_exit_code_visible_as_dollar_question() {
        let mut executor = dev_executor();
        let code = executor.execute_interactive("exit $?", 42).await.unwrap();
        assert_eq!(code, 42);
    }

    #[tokio::test]
    async fn captured_launch_times_out() {
        let mut executor = dev_executor();
        let err = executor
            .execute_captured("sleep 5", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout(_)));
    }

    #[tokio::test]
    async fn child_environment_is_allow_listed() {
        let mut executor = dev_executor();
        let out = executor
            .execute_captured("env", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.stdout.contains("PATH="));
        // Dangerous names never survive; the sandbox library is absent in
        // development, so no preload directive either.
        assert!(!out.stdout.contains("BASH_FUNC_"));
        assert!(!out.stdout.contains("LD_PRELOAD="));
        assert!(!out.stdout.contains("PROMPT_COMMAND="));
    }

    #[tokio::test]
    async fn stderr_captured_separately() {
        let mut executor = dev_executor();
        let out = executor
            .execute_captured("echo out; echo err >&2", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
    }

    #[test]
    fn denied_shell_reference_set_covers_the_basics() {
        assert!(DENIED_SHELLS.contains(&"/bin/bash"));
        assert!(DENIED_SHELLS.contains(&"/bin/sh"));
    }
}
