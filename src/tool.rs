//! Launching TOPP tools as child processes.
//!
//! Every TOPP tool follows the same calling convention:
//! `<tool> -write_ini <path>` writes its default parameters, and
//! `<tool> -ini <path>` runs it with a parameter file. An exit code of
//! zero means success.
use std::env::consts::EXE_SUFFIX;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

mod cancel;
mod progress;
mod runner;

pub use cancel::CancellationToken;
pub use progress::{LogProgress, NoProgress, ProgressSink, ToolProgressParser, PHASE_MARKERS};
pub use runner::ProcessRunner;

/// The environment variable TOPP tools read to find their shared data directory
pub const SHARE_ENV_VAR: &str = "OPENMS_DATA_PATH";

/**
All the ways running an external tool can go wrong
*/
#[derive(Debug, Error)]
pub enum ToolError {
    /// The tool could not be started, or failed to produce its default configuration
    #[error("{tool} could not be invoked: {reason}")]
    Invocation {
        tool: String,
        reason: String,
        #[source]
        source: Option<io::Error>,
    },
    /// The tool ran but exited with a non-zero code
    #[error("{tool} failed with exit code {code}")]
    Execution {
        tool: String,
        code: i32,
        stderr: String,
    },
    #[error("{tool} was cancelled")]
    Cancelled { tool: String },
}

impl ToolError {
    pub fn tool(&self) -> &str {
        match self {
            Self::Invocation { tool, .. } | Self::Execution { tool, .. } | Self::Cancelled { tool } => tool,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// How to launch one TOPP tool
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub executable: PathBuf,
    /// Arguments placed before the tool's own arguments, e.g. a script for an interpreter
    pub leading_args: Vec<OsString>,
    pub share_dir: Option<PathBuf>,
    pub share_env_var: String,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            leading_args: Vec::new(),
            share_dir: None,
            share_env_var: SHARE_ENV_VAR.to_string(),
        }
    }

    /// The tool `name` installed in `tool_dir` under the platform's executable naming
    pub fn in_directory(tool_dir: &Path, name: impl Into<String>) -> Self {
        let name = name.into();
        let executable = tool_dir.join(format!("{name}{EXE_SUFFIX}"));
        Self::new(name, executable)
    }

    pub fn with_share_dir(mut self, share_dir: Option<PathBuf>) -> Self {
        self.share_dir = share_dir;
        self
    }

    pub fn with_leading_args<S: Into<OsString>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// What is left of a finished tool run once its streams have been drained
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout_lines: usize,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ToolOutput {
    pub fn new(stdout_lines: usize, stderr: String, elapsed: Duration) -> Self {
        Self {
            stdout_lines,
            stderr,
            elapsed,
        }
    }
}

/// Something that can run TOPP tools. [`ProcessRunner`] launches real processes.
pub trait ToolExecutor {
    /// Run `tool -write_ini <path>`
    fn write_default_config(
        &self,
        tool: &ToolSpec,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError>;

    /// Run `tool -ini <config_path>` in `working_dir` and block until it exits
    fn run_and_wait(
        &self,
        tool: &ToolSpec,
        config_path: &Path,
        working_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError>;
}
