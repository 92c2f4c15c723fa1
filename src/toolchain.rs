//! Toolchain manifest parsing and in-sandbox provisioning.
//!
//! The toolchain version always comes from the manifest shipped with the
//! source tree (`rust-toolchain.toml`, or the legacy single-line
//! `rust-toolchain`), so bumping the pin there changes the build without
//! touching the pipeline.

use std::path::Path;

use serde::Deserialize;

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::sandbox::{Sandbox, Step};

/// The pinned toolchain resolved from the source tree.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ToolchainSpec {
    /// Release channel or exact version, e.g. `1.90.0`.
    pub channel: String,
    /// rustup profile; `minimal` when the manifest does not say.
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Deserialize)]
struct ManifestFile {
    toolchain: Option<ToolchainSpec>,
}

impl ToolchainSpec {
    /// Reads the manifest at `manifest` (relative to `source_root`).
    ///
    /// When a `rust-toolchain.toml` is configured but only the legacy
    /// `rust-toolchain` file exists next to it, the legacy file is used.
    pub fn load(source_root: &Path, manifest: &Path) -> Result<Self> {
        let mut path = source_root.join(manifest);
        if !path.exists() {
            let legacy = path.with_extension("");
            if path.extension().is_some_and(|ext| ext == "toml") && legacy.is_file() {
                path = legacy;
            }
        }

        let content = std::fs::read_to_string(&path).map_err(|e| Error::ToolchainManifest {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let spec = Self::parse(&content).map_err(|reason| Error::ToolchainManifest {
            path: path.clone(),
            reason,
        })?;

        tracing::info!(channel = %spec.channel, manifest = ?path, "resolved pinned toolchain");
        Ok(spec)
    }

    /// Parses manifest content in either format.
    pub fn parse(content: &str) -> std::result::Result<Self, String> {
        let spec = match toml::from_str::<ManifestFile>(content) {
            Ok(ManifestFile {
                toolchain: Some(spec),
            }) => spec,
            Ok(ManifestFile { toolchain: None }) => {
                return Err("missing [toolchain] table".to_string());
            }
            Err(toml_err) => {
                let trimmed = content.trim();
                if trimmed.is_empty() || trimmed.lines().count() != 1 {
                    return Err(format!("not a toolchain manifest: {}", toml_err));
                }
                Self {
                    channel: trimmed.to_string(),
                    profile: None,
                    components: Vec::new(),
                    targets: Vec::new(),
                }
            }
        };

        if spec.channel.is_empty() || spec.channel.chars().any(char::is_whitespace) {
            return Err(format!("invalid channel '{}'", spec.channel));
        }

        Ok(spec)
    }

    /// The rustup profile to install with.
    pub fn profile(&self) -> &str {
        self.profile.as_deref().unwrap_or("minimal")
    }

    /// The `+<channel>` override passed to cargo and rustc.
    pub fn toolchain_arg(&self) -> String {
        format!("+{}", self.channel)
    }
}

/// Returns the provisioning steps, in order: OS packages, then the pinned
/// toolchain, then a version probe of the installed compiler.
pub fn provision_steps(spec: &ToolchainSpec, os_packages: &[String]) -> Vec<Step> {
    let mut steps = Vec::new();

    if !os_packages.is_empty() {
        steps.push(Step::new("apt-get").arg("update"));
        steps.push(
            Step::new("apt-get")
                .args(["install", "-y", "--no-install-recommends"])
                .args(os_packages.iter().cloned()),
        );
    }

    let mut install = Step::new("rustup")
        .args(["toolchain", "install"])
        .arg(spec.channel.clone())
        .args(["--profile", spec.profile()]);
    for component in &spec.components {
        install = install.args(["--component", component.as_str()]);
    }
    for target in &spec.targets {
        install = install.args(["--target", target.as_str()]);
    }
    steps.push(install);

    steps.push(Step::new("rustc").arg(spec.toolchain_arg()).arg("--version"));
    steps
}

/// Installs OS prerequisites and the pinned toolchain inside `sandbox`.
///
/// The first non-zero step aborts provisioning.
pub async fn provision<S>(sandbox: &mut S, spec: &ToolchainSpec, config: &PipelineConfig) -> Result<()>
where
    S: Sandbox + ?Sized,
{
    for step in provision_steps(spec, &config.toolchain.os_packages) {
        let output = sandbox.run(&step).await?;
        if !output.success() {
            return Err(Error::ToolchainInstall {
                step: step.display(),
                code: output.code,
            });
        }
        if step.program == "rustc" {
            tracing::info!(version = %output.stdout.trim(), "toolchain ready");
        }
    }

    Ok(())
}
