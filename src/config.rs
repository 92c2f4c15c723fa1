//! Pipeline configuration and validation.
//!
//! The defaults reproduce the fixed layout of the codex release build: the
//! source tree is mounted at `/workspace`, the target tree at `/platform`,
//! and the binary lands at `mooreCube/bin/codex/codex`. A TOML file can
//! override any of it; the toolchain version is never configured here, it is
//! always read from the manifest in the source tree.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::verify::{default_allowed_paths, default_constraints, default_tokens};
use crate::verify::{Constraint, DisallowedToken};

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

/// Container sandbox settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Container engine CLI (`docker` or `podman`).
    #[serde(default = "default_engine")]
    pub engine: String,
    /// Version-pinned base image.
    #[serde(default = "default_image")]
    pub image: String,
    /// Where the source tree is mounted inside the sandbox.
    #[serde(default = "default_source_mount")]
    pub source_mount: PathBuf,
    /// Where the target tree is mounted inside the sandbox.
    #[serde(default = "default_target_mount")]
    pub target_mount: PathBuf,
    /// Cargo workspace directory, relative to the source root.
    #[serde(default = "default_build_subdir")]
    pub build_subdir: PathBuf,
    /// Seconds after which the container stops by itself.
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
}

fn default_engine() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "rust:1.90.0-bookworm".to_string()
}

fn default_source_mount() -> PathBuf {
    PathBuf::from("/workspace")
}

fn default_target_mount() -> PathBuf {
    PathBuf::from("/platform")
}

fn default_build_subdir() -> PathBuf {
    PathBuf::from("codex-rs")
}

fn default_max_lifetime_secs() -> u64 {
    4 * 60 * 60
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            image: default_image(),
            source_mount: default_source_mount(),
            target_mount: default_target_mount(),
            build_subdir: default_build_subdir(),
            max_lifetime_secs: default_max_lifetime_secs(),
        }
    }
}

/// Toolchain provisioning settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainConfig {
    /// Toolchain manifest, relative to the source root.
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,
    /// OS packages installed before the toolchain.
    #[serde(default = "default_os_packages")]
    pub os_packages: Vec<String>,
}

fn default_manifest() -> PathBuf {
    PathBuf::from("codex-rs/rust-toolchain.toml")
}

fn default_os_packages() -> Vec<String> {
    ["build-essential", "pkg-config", "git", "ca-certificates"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            manifest: default_manifest(),
            os_packages: default_os_packages(),
        }
    }
}

/// Release build settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Workspace member to build.
    #[serde(default = "default_package")]
    pub package: String,
    /// Binary target produced by the member.
    #[serde(default = "default_binary")]
    pub binary: String,
}

fn default_package() -> String {
    "codex-cli".to_string()
}

fn default_binary() -> String {
    "codex".to_string()
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            package: default_package(),
            binary: default_binary(),
        }
    }
}

/// Artifact installation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Install path, relative to the target root.
    #[serde(default = "default_destination")]
    pub destination: PathBuf,
}

fn default_destination() -> PathBuf {
    PathBuf::from("mooreCube/bin/codex/codex")
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            destination: default_destination(),
        }
    }
}

/// Dependency constraint verification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Whether a violation blocks installation.
    #[serde(default = "default_enforce")]
    pub enforce: bool,
    /// Packages checked against the resolved dependency graph.
    #[serde(default = "default_constraints")]
    pub constraints: Vec<Constraint>,
    /// Tokens searched for in the source tree.
    #[serde(default = "default_tokens")]
    pub tokens: Vec<DisallowedToken>,
    /// Globs (relative to the source root) where token matches are allowed.
    #[serde(default = "default_allowed_paths")]
    pub allowed_paths: Vec<String>,
    /// Directory names never descended into by the token scan.
    #[serde(default = "default_skip_dirs")]
    pub skip_dirs: Vec<String>,
}

fn default_enforce() -> bool {
    true
}

fn default_skip_dirs() -> Vec<String> {
    [".git", "target", "node_modules"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            enforce: default_enforce(),
            constraints: default_constraints(),
            tokens: default_tokens(),
            allowed_paths: default_allowed_paths(),
            skip_dirs: default_skip_dirs(),
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub toolchain: ToolchainConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub install: InstallConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
}

impl PipelineConfig {
    /// Loads the configuration from a TOML file, or the built-in defaults
    /// when no file is given. The result is validated before it is returned.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                toml::from_str(&content).map_err(|e| {
                    Error::Config(format!("cannot parse {}: {}", path.display(), e))
                })?
            }
            None => Self::default(),
        };

        for warning in config.validate().into_result()? {
            tracing::warn!(%warning, "pipeline configuration");
        }

        Ok(config)
    }

    /// Working directory of the build inside the sandbox.
    pub fn sandbox_build_dir(&self) -> PathBuf {
        self.sandbox.source_mount.join(&self.sandbox.build_subdir)
    }

    /// Host path of the build output, seen through the source mount.
    pub fn artifact_source(&self, source_root: &Path) -> PathBuf {
        source_root
            .join(&self.sandbox.build_subdir)
            .join("target")
            .join("release")
            .join(&self.build.binary)
    }

    /// Host path where the artifact is installed.
    pub fn artifact_destination(&self, target_root: &Path) -> PathBuf {
        target_root.join(&self.install.destination)
    }
}

/// Returns true if `path` is relative and never climbs out of its base.
fn is_contained_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

impl Validate for SandboxConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.engine.trim().is_empty() {
            result.add_error("sandbox.engine cannot be empty");
        }

        if self.image.trim().is_empty() {
            result.add_error("sandbox.image cannot be empty");
        } else {
            let last = self.image.rsplit('/').next().unwrap_or(&self.image);
            if !last.contains(':') && !self.image.contains('@') {
                result.add_warning(format!("sandbox.image '{}' is not version-pinned", self.image));
            } else if last.ends_with(":latest") {
                result.add_warning(format!(
                    "sandbox.image '{}' uses the floating 'latest' tag",
                    self.image
                ));
            }
        }

        if !self.source_mount.is_absolute() {
            result.add_error("sandbox.source_mount must be an absolute path");
        }
        if !self.target_mount.is_absolute() {
            result.add_error("sandbox.target_mount must be an absolute path");
        }
        if self.source_mount == self.target_mount {
            result.add_error("sandbox.source_mount and sandbox.target_mount must differ");
        }

        if !is_contained_relative(&self.build_subdir) {
            result.add_error("sandbox.build_subdir must be a relative path inside the source tree");
        }

        if self.max_lifetime_secs == 0 {
            result.add_error("sandbox.max_lifetime_secs must be greater than zero");
        }

        result
    }
}

impl Validate for PipelineConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = self.sandbox.validate();

        if !is_contained_relative(&self.toolchain.manifest) {
            result.add_error("toolchain.manifest must be a relative path inside the source tree");
        }

        if self.build.package.trim().is_empty() {
            result.add_error("build.package cannot be empty");
        }
        if self.build.binary.trim().is_empty() {
            result.add_error("build.binary cannot be empty");
        }

        if !is_contained_relative(&self.install.destination) {
            result.add_error("install.destination must be a relative path inside the target tree");
        }

        result.merge(self.verify.validate());
        result
    }
}

impl Validate for VerifyConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if !self.enforce {
            result.add_warning("verify.enforce is off; constraint violations will not block installs");
        }

        if !self.constraints.iter().any(|c| c.disallowed) {
            result.add_warning("verify.constraints has no disallowed packages");
        }

        for token in &self.tokens {
            if let Err(e) = regex::Regex::new(&token.pattern) {
                result.add_error(format!("invalid token pattern '{}': {}", token.pattern, e));
            }
        }

        for pattern in &self.allowed_paths {
            if let Err(e) = glob::Pattern::new(pattern) {
                result.add_error(format!("invalid allowed path '{}': {}", pattern, e));
            }
        }

        result
    }
}
