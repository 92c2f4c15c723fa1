//! Sandbox provider traits and session types.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::request::BuildRequest;

/// Access mode of a bind mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountMode {
    #[serde(rename = "rw")]
    ReadWrite,
    #[serde(rename = "ro")]
    ReadOnly,
}

impl MountMode {
    fn as_flag(self) -> &'static str {
        match self {
            Self::ReadWrite => "rw",
            Self::ReadOnly => "ro",
        }
    }
}

/// A host directory made available inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub mode: MountMode,
}

impl Mount {
    /// Creates a read-write bind mount.
    pub fn read_write(host_path: impl Into<PathBuf>, container_path: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            mode: MountMode::ReadWrite,
        }
    }

    /// Renders the mount as a `--volume` value (`host:container:mode`).
    pub fn volume_arg(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host_path.display(),
            self.container_path.display(),
            self.mode.as_flag()
        )
    }
}

/// Everything needed to start one sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSession {
    /// Version-pinned base image.
    pub image: String,
    /// Bind mounts, in order.
    pub mounts: Vec<Mount>,
    /// Working directory for every step.
    pub working_dir: PathBuf,
    /// Environment applied to every step.
    pub env: BTreeMap<String, String>,
    /// Upper bound on the sandbox's lifetime, in seconds. The sandbox stops
    /// on its own once this elapses, even if teardown never runs.
    pub max_lifetime_secs: u64,
}

impl SandboxSession {
    /// Builds the session for a validated request: the source root and the
    /// target root, both read-write, working inside the source's build
    /// subtree.
    pub fn for_request(request: &BuildRequest, config: &PipelineConfig) -> Self {
        Self {
            image: config.sandbox.image.clone(),
            mounts: vec![
                Mount::read_write(request.source_root(), &config.sandbox.source_mount),
                Mount::read_write(request.target_root(), &config.sandbox.target_mount),
            ],
            working_dir: config.sandbox_build_dir(),
            env: BTreeMap::from([(
                "DEBIAN_FRONTEND".to_string(),
                "noninteractive".to_string(),
            )]),
            max_lifetime_secs: config.sandbox.max_lifetime_secs,
        }
    }
}

/// A single command run inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub program: String,
    pub args: Vec<String>,
}

impl Step {
    /// Creates a step running `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The command line as a single string, for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a [`Step`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutput {
    /// Exit code, `None` if the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl StepOutput {
    /// Returns true if the step exited with code zero.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Represents a running sandbox.
#[async_trait]
pub trait Sandbox: Send {
    /// Returns an identifier for logs (the container name, for example).
    fn id(&self) -> &str;

    /// Runs one step to completion and captures its output.
    ///
    /// A non-zero exit is reported through [`StepOutput::code`], not as an
    /// error; errors mean the step could not be run at all.
    async fn run(&mut self, step: &Step) -> Result<StepOutput>;

    /// Tears the sandbox down. Must be idempotent.
    fn cleanup(&mut self) -> Result<()>;
}

/// Provider for starting sandboxes.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// The type of sandbox this provider creates.
    type Sandbox: Sandbox;

    /// Starts a sandbox for the given session.
    async fn create(&self, session: SandboxSession) -> Result<Self::Sandbox>;
}
