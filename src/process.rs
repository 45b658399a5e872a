//! Host command runner.
//!
//! A small builder over [`std::process::Command`] that captures output and
//! turns a non-zero exit into an error carrying the caller's message plus
//! whatever the tool wrote to stderr.
//!
//! ```rust,ignore
//! use isoboot::process::Cmd;
//!
//! let out = Cmd::new("losetup")
//!     .args(["--find", "--show", "--read-only"])
//!     .arg_path(image)
//!     .error_msg("losetup failed to bind image")
//!     .run()?;
//! let device = out.stdout.trim();
//! ```

use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::path::Path;
use std::process::{Command, ExitStatus};

/// Captured result of a finished command.
#[derive(Debug)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Builder for a host command.
#[derive(Debug)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_os_string());
        self
    }

    /// Message used as the error head when the command exits non-zero.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return the result instead of failing on a non-zero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Human-readable rendering of the command line, for logs.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    pub fn run(self) -> Result<CommandResult> {
        tracing::debug!("running: {}", self.display());

        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .with_context(|| format!("failed to spawn '{}'", self.program))?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() && !self.allow_fail {
            let head = self
                .error_msg
                .unwrap_or_else(|| format!("'{}' failed", self.program));
            bail!("{} ({}): {}", head, result.status, result.stderr.trim());
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_stdout() {
        let result = Cmd::new("echo").args(["hello", "world"]).run().unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello world");
    }

    #[test]
    fn test_run_failure_uses_error_msg() {
        let err = Cmd::new("sh")
            .args(["-c", "echo boom >&2; exit 3"])
            .error_msg("shell exploded")
            .run()
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("shell exploded"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn test_allow_fail_returns_status() {
        let result = Cmd::new("sh")
            .args(["-c", "exit 1"])
            .allow_fail()
            .run()
            .unwrap();
        assert!(!result.success());
    }

    #[test]
    fn test_spawn_failure() {
        assert!(Cmd::new("definitely_not_a_real_command_12345").run().is_err());
    }

    #[test]
    fn test_display() {
        let cmd = Cmd::new("mount")
            .args(["-t", "iso9660"])
            .arg_path(Path::new("/dev/loop0"));
        assert_eq!(cmd.display(), "mount -t iso9660 /dev/loop0");
    }
}
