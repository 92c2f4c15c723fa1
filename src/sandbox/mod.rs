//! Sandbox module for isolated build environments.
//!
//! This module provides the [`SandboxProvider`] and [`Sandbox`] traits that
//! the pipeline drives, and the [`ContainerSandbox`] implementation backed by
//! a docker-compatible container engine.

mod container;
mod provider;

pub use container::{ContainerSandbox, ContainerSandboxInstance};
pub use provider::{Mount, MountMode, Sandbox, SandboxProvider, SandboxSession, Step, StepOutput};
