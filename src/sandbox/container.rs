//! Container-engine sandbox implementation.
//!
//! Drives any docker-compatible CLI (`docker`, `podman`). The container is
//! started detached with `--rm` and kept alive by a bounded `sleep`, so it
//! exits and is reaped by the engine even if this process is killed before
//! teardown. Each step runs through `exec`, and teardown force-removes it.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::error::{Error, Result};

use super::provider::{Sandbox, SandboxProvider, SandboxSession, Step, StepOutput};

/// A running container.
pub struct ContainerSandboxInstance {
    /// Container engine CLI.
    engine: String,
    /// Container name.
    name: String,
    /// The session used to start this container.
    session: SandboxSession,
    /// Whether the container has been removed.
    cleaned_up: bool,
}

#[async_trait]
impl Sandbox for ContainerSandboxInstance {
    fn id(&self) -> &str {
        &self.name
    }

    async fn run(&mut self, step: &Step) -> Result<StepOutput> {
        let args = exec_args(&self.name, &self.session, step);

        tracing::info!(sandbox = %self.name, command = %step.display(), "running step");

        let mut child = Command::new(&self.engine)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::sandbox(format!("failed to run {} exec: {}", self.engine, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::sandbox("exec stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::sandbox("exec stderr was not captured"))?;

        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();

        let mut output = StepOutput::default();
        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout_reader.next_line(), if stdout_open => {
                    match line {
                        Ok(Some(line)) => {
                            tracing::debug!(sandbox = %self.name, line = %line, "stdout");
                            output.stdout.push_str(&line);
                            output.stdout.push('\n');
                        }
                        Ok(None) => stdout_open = false,
                        Err(e) => {
                            tracing::error!(error = %e, "error reading stdout");
                            stdout_open = false;
                        }
                    }
                }
                line = stderr_reader.next_line(), if stderr_open => {
                    match line {
                        Ok(Some(line)) => {
                            tracing::info!(sandbox = %self.name, line = %line, "stderr");
                            output.stderr.push_str(&line);
                            output.stderr.push('\n');
                        }
                        Ok(None) => stderr_open = false,
                        Err(e) => {
                            tracing::error!(error = %e, "error reading stderr");
                            stderr_open = false;
                        }
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| Error::sandbox(format!("failed to wait for {} exec: {}", self.engine, e)))?;

        output.code = status.code();
        Ok(output)
    }

    fn cleanup(&mut self) -> Result<()> {
        if self.cleaned_up {
            return Ok(());
        }

        let output = std::process::Command::new(&self.engine)
            .args(rm_args(&self.name))
            .stdin(Stdio::null())
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // `--rm` may already have reaped it.
            if !stderr.contains("No such container") && !stderr.contains("no such container") {
                return Err(Error::Sandbox {
                    message: format!("failed to remove container {}: {}", self.name, stderr.trim()),
                    code: output.status.code(),
                });
            }
        }

        tracing::info!(sandbox = %self.name, "removed sandbox container");
        self.cleaned_up = true;
        Ok(())
    }
}

impl Drop for ContainerSandboxInstance {
    fn drop(&mut self) {
        if !self.cleaned_up {
            if let Err(e) = self.cleanup() {
                tracing::error!(error = %e, sandbox = %self.name, "failed to remove sandbox on drop");
            }
        }
    }
}

/// Provider that starts sandboxes as containers.
#[derive(Debug, Clone)]
pub struct ContainerSandbox {
    /// Container engine CLI (`docker`, `podman`, or a path to one).
    engine: String,
}

impl ContainerSandbox {
    /// Creates a provider driving the given engine CLI.
    pub fn new(engine: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
        }
    }

    fn generate_name() -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("codex-build-{}", &id[..12])
    }
}

#[async_trait]
impl SandboxProvider for ContainerSandbox {
    type Sandbox = ContainerSandboxInstance;

    async fn create(&self, session: SandboxSession) -> Result<Self::Sandbox> {
        let name = Self::generate_name();
        let args = run_args(&name, &session);

        // An abandoned start (e.g. interrupted during an image pull) must not
        // leave the engine CLI running to start an orphaned container.
        let output = Command::new(&self.engine)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                Error::sandbox(format!("container engine `{}` is not available: {}", self.engine, e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Sandbox {
                message: format!("failed to start {}: {}", session.image, stderr.trim()),
                code: output.status.code(),
            });
        }

        tracing::info!(
            sandbox = %name,
            image = %session.image,
            working_dir = ?session.working_dir,
            "started sandbox container"
        );

        Ok(ContainerSandboxInstance {
            engine: self.engine.clone(),
            name,
            session,
            cleaned_up: false,
        })
    }
}

fn run_args(name: &str, session: &SandboxSession) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--detach".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        name.to_string(),
    ];

    for mount in &session.mounts {
        args.push("--volume".to_string());
        args.push(mount.volume_arg());
    }

    args.push("--workdir".to_string());
    args.push(session.working_dir.display().to_string());
    args.push("--entrypoint".to_string());
    args.push("sleep".to_string());
    args.push(session.image.clone());
    args.push(session.max_lifetime_secs.to_string());
    args
}

fn exec_args(name: &str, session: &SandboxSession, step: &Step) -> Vec<String> {
    let mut args = vec![
        "exec".to_string(),
        "--workdir".to_string(),
        session.working_dir.display().to_string(),
    ];

    for (key, value) in &session.env {
        args.push("--env".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(name.to_string());
    args.push(step.program.clone());
    args.extend(step.args.iter().cloned());
    args
}

fn rm_args(name: &str) -> [&str; 3] {
    ["rm", "--force", name]
}
