//! codex-builder - reproducible sandboxed release builds of the codex CLI
//!
//! This library builds one workspace member of a pinned source tree inside an
//! ephemeral container, verifies that its dependency graph stays free of a
//! fixed set of disallowed crates, and installs the binary into a target tree.

pub mod build;
pub mod config;
pub mod error;
pub mod install;
pub mod pipeline;
pub mod request;
pub mod sandbox;
pub mod toolchain;
pub mod verify;

pub use error::{Error, Result};
pub use install::InstalledArtifact;
pub use pipeline::{Pipeline, PipelineState, VerifyMode};
pub use request::BuildRequest;
pub use sandbox::{ContainerSandbox, Sandbox, SandboxProvider, SandboxSession, Step, StepOutput};
pub use toolchain::ToolchainSpec;
pub use verify::{Constraint, DisallowedToken, VerificationReport};

pub use config::{PipelineConfig, Validate, ValidationResult};
