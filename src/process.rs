//! External command execution.
//!
//! Every mount, unmount and packing step shells out to a host tool. [`Cmd`]
//! wraps [`std::process::Command`] so that failures carry the program,
//! exit status and captured output all the way up to the user.
//!
//! # Example
//!
//! ```rust,ignore
//! use livefs_edit::process::Cmd;
//!
//! Cmd::new("mount")
//!     .args(["-t", "squashfs", "-o", "loop,ro"])
//!     .arg_path(image)
//!     .arg_path(target)
//!     .error_msg("mounting squashfs failed")
//!     .run()?;
//! ```

use anyhow::{Context, Result};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

/// A host command that exited unsuccessfully.
#[derive(Debug, thiserror::Error)]
#[error("{message}: `{command_line}` exited with {status}")]
pub struct CommandError {
    /// Human-readable description of what was being attempted.
    pub message: String,
    /// The command line, shell-ish quoted for display.
    pub command_line: String,
    /// Exit status of the process.
    pub status: ExitStatus,
    /// Captured standard output (empty for interactive runs).
    pub stdout: String,
    /// Captured standard error (empty for interactive runs).
    pub stderr: String,
}

/// Output of a finished command.
#[derive(Debug)]
pub struct CommandResult {
    /// Exit status of the process.
    pub status: ExitStatus,
    /// Captured standard output, lossily decoded.
    pub stdout: String,
    /// Captured standard error, lossily decoded.
    pub stderr: String,
}

impl CommandResult {
    /// Whether the command exited with status zero.
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Builder for a single external command invocation.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    envs: Vec<(String, OsString)>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    /// Start building an invocation of `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
            error_msg: None,
            allow_fail: false,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Append a path argument without forcing it through UTF-8.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_os_string());
        self
    }

    /// Run the command from `dir`.
    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl AsRef<OsStr>) -> Self {
        self.envs.push((key.into(), value.as_ref().to_os_string()));
        self
    }

    /// Message used when the command fails.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return the result instead of an error on non-zero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        cmd
    }

    fn failure(&self, status: ExitStatus, stdout: String, stderr: String) -> CommandError {
        CommandError {
            message: self
                .error_msg
                .clone()
                .unwrap_or_else(|| format!("{} failed", self.program)),
            command_line: self.to_string(),
            status,
            stdout,
            stderr,
        }
    }

    /// Run with captured output.
    pub fn run(self) -> Result<CommandResult> {
        tracing::debug!("running {self}");
        let output = self
            .command()
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("spawning {}", self.program))?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() && !self.allow_fail {
            return Err(self.failure(result.status, result.stdout, result.stderr).into());
        }
        Ok(result)
    }

    /// Run with the terminal attached (stdin/stdout/stderr inherited).
    pub fn run_interactive(self) -> Result<()> {
        tracing::debug!("running (interactive) {self}");
        let status = self
            .command()
            .status()
            .with_context(|| format!("spawning {}", self.program))?;

        if !status.success() && !self.allow_fail {
            return Err(self.failure(status, String::new(), String::new()).into());
        }
        Ok(())
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Check if a program is available on `PATH`.
pub fn exists(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Find the innermost [`CommandError`] in an error chain, if any.
pub fn find_command_error(err: &anyhow::Error) -> Option<&CommandError> {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<CommandError>())
        .last()
}
