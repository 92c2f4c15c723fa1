//! Error types for the codex build pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for pipeline stages.
///
/// Every stage failure is fatal; the variant names the stage that failed and
/// [`Error::exit_code`] decides what the process exits with.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed command-line arguments.
    #[error("usage error: {0}")]
    Usage(String),

    /// The target (or source) root is not an existing directory.
    #[error("path error: {path}: {reason}")]
    Path { path: PathBuf, reason: String },

    /// Pipeline configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The toolchain manifest in the source tree could not be read or parsed.
    #[error("toolchain manifest {path}: {reason}")]
    ToolchainManifest { path: PathBuf, reason: String },

    /// The execution environment failed to start or exited abnormally.
    #[error("sandbox error: {message}")]
    Sandbox {
        message: String,
        code: Option<i32>,
    },

    /// OS package or toolchain installation exited non-zero.
    #[error("toolchain install failed at `{step}` (exit code {})", fmt_code(.code))]
    ToolchainInstall { step: String, code: Option<i32> },

    /// The release build exited non-zero.
    #[error("build of `{package}` failed (exit code {})", fmt_code(.code))]
    Build { package: String, code: Option<i32> },

    /// The built artifact could not be installed.
    #[error("failed to install {from} to {to}: {reason}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        reason: String,
    },

    /// A disallowed package or token was found in the build closure.
    #[error("dependency constraints violated: {0}")]
    ConstraintViolation(String),

    /// The run was interrupted (SIGINT) before it finished.
    #[error("interrupted")]
    Interrupted,

    /// The run was asked to terminate (SIGTERM) before it finished.
    #[error("terminated")]
    Terminated,

    /// IO error outside of a specific stage.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none, terminated by signal".to_string(),
    }
}

impl Error {
    /// Builds a sandbox error with no exit code of its own.
    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::Sandbox {
            message: message.into(),
            code: None,
        }
    }

    /// Returns the process exit code for this error.
    ///
    /// Failures of sandboxed steps propagate the step's own exit code
    /// verbatim, an interrupt exits with `130`, a termination request with
    /// `143`, and everything else exits with `1`.
    pub fn exit_code(&self) -> i32 {
        let propagated = match self {
            Self::Interrupted => return 130,
            Self::Terminated => return 143,
            Self::Sandbox { code, .. }
            | Self::ToolchainInstall { code, .. }
            | Self::Build { code, .. } => *code,
            _ => None,
        };

        match propagated {
            Some(code) if code != 0 => code,
            _ => 1,
        }
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
