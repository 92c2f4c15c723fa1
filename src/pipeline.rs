//! The build-and-verify pipeline.
//!
//! Stages run strictly in order and the first failure is fatal:
//!
//! ```text
//! Start → Validated → SandboxReady → ToolchainReady → Built → [Verified] → Installed → Done
//! ```
//!
//! Any stage may instead move to `Failed`. The sandbox is torn down on every
//! path out of the sandboxed stages, and again by its `Drop` if the pipeline
//! future is abandoned mid-run.

use serde::Serialize;

use crate::build;
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::install::{install_artifact, InstalledArtifact};
use crate::request::BuildRequest;
use crate::sandbox::{Sandbox, SandboxProvider, SandboxSession};
use crate::toolchain::{self, ToolchainSpec};
use crate::verify::{self, VerificationReport};

/// Where the pipeline is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum PipelineState {
    Start,
    Validated,
    SandboxReady,
    ToolchainReady,
    Built,
    Verified,
    Installed,
    Done,
    Failed(String),
}

impl PipelineState {
    /// Returns true for `Done` and `Failed`; nothing resumes from either.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }
}

/// How constraint verification takes part in a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyMode {
    /// Verify after building; any violation fails the run before install.
    #[default]
    Enforce,
    /// Verify after building; violations are logged only.
    Advisory,
    /// Do not verify.
    Skip,
}

impl VerifyMode {
    /// The mode implied by the configuration alone.
    pub fn from_config(config: &PipelineConfig) -> Self {
        if config.verify.enforce {
            Self::Enforce
        } else {
            Self::Advisory
        }
    }
}

/// Drives one request through the pipeline using sandboxes from `P`.
pub struct Pipeline<P: SandboxProvider> {
    provider: P,
    config: PipelineConfig,
    verify_mode: VerifyMode,
    state: PipelineState,
    history: Vec<PipelineState>,
}

impl<P: SandboxProvider> Pipeline<P> {
    /// Creates a pipeline; the verify mode follows the configuration.
    pub fn new(provider: P, config: PipelineConfig) -> Self {
        let verify_mode = VerifyMode::from_config(&config);
        Self {
            provider,
            config,
            verify_mode,
            state: PipelineState::Start,
            history: vec![PipelineState::Start],
        }
    }

    /// Overrides the verify mode.
    pub fn with_verify_mode(mut self, mode: VerifyMode) -> Self {
        self.verify_mode = mode;
        self
    }

    /// The current state.
    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Every state visited so far, in order.
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    /// Returns the configuration in use.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn advance(&mut self, next: PipelineState) {
        tracing::info!(from = ?self.state, to = ?next, "pipeline transition");
        self.history.push(next.clone());
        self.state = next;
    }

    fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.advance(PipelineState::Done),
            Err(e) => self.advance(PipelineState::Failed(e.to_string())),
        }
        result
    }

    /// Builds, verifies and installs the artifact for `request`.
    pub async fn run(&mut self, request: &BuildRequest) -> Result<InstalledArtifact> {
        if self.state().is_terminal() {
            return Err(Error::Config("pipeline has already finished".to_string()));
        }
        let result = self.execute(request).await;
        self.finish(result)
    }

    /// Runs only the constraint verification, in its own sandbox.
    pub async fn verify_only(&mut self, request: &BuildRequest) -> Result<VerificationReport> {
        if self.state().is_terminal() {
            return Err(Error::Config("pipeline has already finished".to_string()));
        }
        let result = self.execute_verify(request).await;
        self.finish(result)
    }

    async fn execute(&mut self, request: &BuildRequest) -> Result<InstalledArtifact> {
        let spec = ToolchainSpec::load(request.source_root(), &self.config.toolchain.manifest)?;
        self.advance(PipelineState::Validated);

        let mut sandbox = self.start_sandbox(request).await?;
        let outcome = self.build_in(&mut sandbox, &spec, request).await;
        teardown(&mut sandbox);
        outcome?;

        let artifact = install_artifact(
            &self.config.artifact_source(request.source_root()),
            &self.config.artifact_destination(request.target_root()),
        )?;
        self.advance(PipelineState::Installed);
        Ok(artifact)
    }

    async fn execute_verify(&mut self, request: &BuildRequest) -> Result<VerificationReport> {
        let spec = ToolchainSpec::load(request.source_root(), &self.config.toolchain.manifest)?;
        self.advance(PipelineState::Validated);

        let mut sandbox = self.start_sandbox(request).await?;
        let outcome = self.verify_in(&mut sandbox, &spec, request).await;
        teardown(&mut sandbox);
        outcome
    }

    async fn start_sandbox(&mut self, request: &BuildRequest) -> Result<P::Sandbox> {
        let session = SandboxSession::for_request(request, &self.config);
        let sandbox = self.provider.create(session).await?;
        self.advance(PipelineState::SandboxReady);
        Ok(sandbox)
    }

    async fn build_in(
        &mut self,
        sandbox: &mut P::Sandbox,
        spec: &ToolchainSpec,
        request: &BuildRequest,
    ) -> Result<()> {
        toolchain::provision(sandbox, spec, &self.config).await?;
        self.advance(PipelineState::ToolchainReady);

        build::build(sandbox, spec, &self.config).await?;
        self.advance(PipelineState::Built);

        if self.verify_mode == VerifyMode::Skip {
            tracing::warn!("constraint verification skipped");
            return Ok(());
        }

        let report = verify::verify(sandbox, spec, &self.config, request.source_root()).await?;
        let violations = report.violations();
        if !violations.is_empty() {
            if self.verify_mode == VerifyMode::Enforce {
                return Err(Error::ConstraintViolation(violations.join("; ")));
            }
            for violation in &violations {
                tracing::warn!(%violation, "constraint violation (advisory)");
            }
        }
        self.advance(PipelineState::Verified);
        Ok(())
    }

    async fn verify_in(
        &mut self,
        sandbox: &mut P::Sandbox,
        spec: &ToolchainSpec,
        request: &BuildRequest,
    ) -> Result<VerificationReport> {
        toolchain::provision(sandbox, spec, &self.config).await?;
        self.advance(PipelineState::ToolchainReady);

        let report = verify::verify(sandbox, spec, &self.config, request.source_root()).await?;
        self.advance(PipelineState::Verified);
        Ok(report)
    }
}

fn teardown<S: Sandbox + ?Sized>(sandbox: &mut S) {
    if let Err(e) = sandbox.cleanup() {
        tracing::error!(error = %e, sandbox = %sandbox.id(), "failed to tear down sandbox");
    }
}
