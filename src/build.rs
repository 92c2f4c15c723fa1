//! Release build of the configured workspace member.

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::sandbox::{Sandbox, Step};
use crate::toolchain::ToolchainSpec;

/// The cargo invocation for a release build of one workspace member.
pub fn build_step(spec: &ToolchainSpec, config: &PipelineConfig) -> Step {
    Step::new("cargo")
        .arg(spec.toolchain_arg())
        .args(["build", "--release", "-p"])
        .arg(config.build.package.clone())
        .arg("--bin")
        .arg(config.build.binary.clone())
}

/// Runs the release build inside `sandbox`. No retries.
pub async fn build<S>(sandbox: &mut S, spec: &ToolchainSpec, config: &PipelineConfig) -> Result<()>
where
    S: Sandbox + ?Sized,
{
    let step = build_step(spec, config);
    let output = sandbox.run(&step).await?;

    if !output.success() {
        return Err(Error::Build {
            package: config.build.package.clone(),
            code: output.code,
        });
    }

    tracing::info!(package = %config.build.package, "release build finished");
    Ok(())
}
