//! External command execution.
//!
//! Distro package managers, dependency scripts and notification hooks are all
//! opaque child processes. They go through [`CommandRunner`] so the policy
//! code around them can be exercised without touching the host.

use anyhow::{Context, Result};
use duct::cmd;

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

pub trait CommandRunner {
    /// Run a shell command line, discarding output; `Ok(true)` on exit 0.
    fn status(&self, command_line: &str) -> Result<bool>;

    /// Run a program with arguments and capture its output.
    fn output(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Runs commands on the host via `duct`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostRunner;

impl CommandRunner for HostRunner {
    fn status(&self, command_line: &str) -> Result<bool> {
        let output = cmd!("/bin/sh", "-c", command_line)
            .stdout_null()
            .stderr_null()
            .unchecked()
            .run()
            .with_context(|| format!("running {command_line}"))?;
        Ok(output.status.success())
    }

    fn output(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let output = cmd(program, args)
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .run()
            .with_context(|| format!("running {program}"))?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::cell::RefCell;

    /// Answers commands from a fixed table and records every invocation.
    #[derive(Default)]
    pub struct ScriptedRunner {
        succeeding: Vec<String>,
        pub calls: RefCell<Vec<String>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Commands equal to `line` succeed; everything else fails.
        pub fn succeed(mut self, line: impl Into<String>) -> Self {
            self.succeeding.push(line.into());
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }

        pub fn was_called(&self, line: &str) -> bool {
            self.calls.borrow().iter().any(|c| c == line)
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn status(&self, command_line: &str) -> Result<bool> {
            self.calls.borrow_mut().push(command_line.to_string());
            Ok(self.succeeding.iter().any(|s| s == command_line))
        }

        fn output(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
            let line = std::iter::once(program.to_string())
                .chain(args.iter().cloned())
                .collect::<Vec<_>>()
                .join(" ");
            let success = self.status(&line)?;
            Ok(CommandOutput {
                success,
                ..CommandOutput::default()
            })
        }
    }
}
