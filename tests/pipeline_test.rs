//! Pipeline behavior against a scripted sandbox.
//!
//! The fake sandbox records every step instead of running it, writes a build
//! artifact into the mounted source tree when the release build runs, and
//! answers dependency queries from a configurable set of present packages.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use codex_builder::{
    BuildRequest, Error, Pipeline, PipelineConfig, PipelineState, Result, Sandbox,
    SandboxProvider, SandboxSession, Step, StepOutput, VerifyMode,
};

#[derive(Default)]
struct Record {
    created: usize,
    cleanups: usize,
    steps: Vec<String>,
}

#[derive(Clone, Default)]
struct FakeProvider {
    record: Arc<Mutex<Record>>,
    /// Fail the first step whose command line starts with this prefix.
    fail_on: Option<(String, i32)>,
    /// Exit code of a failed sandbox start.
    start_failure: Option<i32>,
    /// Packages reported present by dependency queries.
    present: Vec<String>,
    /// Packages resolved at several versions, which cargo reports as an
    /// ambiguous specification.
    ambiguous: Vec<String>,
    /// Steps whose command line starts with this prefix never finish.
    hang_on: Option<String>,
}

impl FakeProvider {
    fn failing_on(prefix: &str, code: i32) -> Self {
        Self {
            fail_on: Some((prefix.to_string(), code)),
            ..Default::default()
        }
    }

    fn steps(&self) -> Vec<String> {
        self.record.lock().unwrap().steps.clone()
    }

    fn created(&self) -> usize {
        self.record.lock().unwrap().created
    }

    fn cleanups(&self) -> usize {
        self.record.lock().unwrap().cleanups
    }
}

struct FakeSandbox {
    provider: FakeProvider,
    session: SandboxSession,
    cleaned_up: bool,
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn id(&self) -> &str {
        "fake"
    }

    async fn run(&mut self, step: &Step) -> Result<StepOutput> {
        let line = step.display();
        self.provider.record.lock().unwrap().steps.push(line.clone());

        if let Some(prefix) = &self.provider.hang_on {
            if line.starts_with(prefix.as_str()) {
                std::future::pending::<()>().await;
            }
        }

        if let Some((prefix, code)) = &self.provider.fail_on {
            if line.starts_with(prefix.as_str()) {
                return Ok(StepOutput {
                    code: Some(*code),
                    ..Default::default()
                });
            }
        }

        if step.program == "cargo" && step.args.get(1).map(String::as_str) == Some("build") {
            let source = &self.session.mounts[0].host_path;
            let release = source.join("codex-rs/target/release");
            std::fs::create_dir_all(&release)?;
            std::fs::write(release.join("codex"), "#!/bin/sh\necho codex\n")?;
        }

        if step.program == "cargo" && step.args.get(1).map(String::as_str) == Some("tree") {
            let package = step.args.last().cloned().unwrap_or_default();
            if self.provider.ambiguous.contains(&package) {
                return Ok(StepOutput {
                    code: Some(101),
                    stdout: String::new(),
                    stderr: format!(
                        "error: There are multiple `{0}` packages in your project, and the specification `{0}` is ambiguous.\n\
                         Please re-run this command with one of the following specifications:\n  {0}@0.1.5\n  {0}@0.2.12\n",
                        package
                    ),
                });
            }
            if self.provider.present.contains(&package) {
                return Ok(StepOutput {
                    code: Some(0),
                    stdout: format!("{} v1.0.0\n└── codex-cli v0.0.0\n", package),
                    stderr: String::new(),
                });
            }
            return Ok(StepOutput {
                code: Some(101),
                stdout: String::new(),
                stderr: format!(
                    "error: package ID specification `{}` did not match any packages\n",
                    package
                ),
            });
        }

        Ok(StepOutput {
            code: Some(0),
            ..Default::default()
        })
    }

    fn cleanup(&mut self) -> Result<()> {
        if !self.cleaned_up {
            self.provider.record.lock().unwrap().cleanups += 1;
            self.cleaned_up = true;
        }
        Ok(())
    }
}

impl Drop for FakeSandbox {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    type Sandbox = FakeSandbox;

    async fn create(&self, session: SandboxSession) -> Result<Self::Sandbox> {
        if let Some(code) = self.start_failure {
            return Err(Error::Sandbox {
                message: "image not found".to_string(),
                code: Some(code),
            });
        }
        self.record.lock().unwrap().created += 1;
        Ok(FakeSandbox {
            provider: self.clone(),
            session,
            cleaned_up: false,
        })
    }
}

/// Source tree with a pinned toolchain manifest.
fn source_tree() -> TempDir {
    let source = TempDir::new().expect("failed to create source dir");
    let workspace = source.path().join("codex-rs");
    std::fs::create_dir_all(&workspace).unwrap();
    std::fs::write(
        workspace.join("rust-toolchain.toml"),
        "[toolchain]\nchannel = \"1.90.0\"\n",
    )
    .unwrap();
    source
}

/// Target tree with the install directory already in place.
fn target_tree() -> TempDir {
    let target = TempDir::new().expect("failed to create target dir");
    std::fs::create_dir_all(target.path().join("mooreCube/bin/codex")).unwrap();
    target
}

fn installed_path(target: &Path) -> PathBuf {
    target.join("mooreCube/bin/codex/codex")
}

fn request(source: &TempDir, target: &TempDir) -> BuildRequest {
    BuildRequest::new(Some(target.path()), source.path()).expect("valid request")
}

#[tokio::test]
async fn successful_run_installs_executable_artifact() {
    let source = source_tree();
    let target = target_tree();
    let provider = FakeProvider::default();
    let mut pipeline = Pipeline::new(provider.clone(), PipelineConfig::default());

    let artifact = pipeline.run(&request(&source, &target)).await.expect("run failed");

    let installed = installed_path(&target.path().canonicalize().unwrap());
    assert_eq!(artifact.installed_path, installed);
    assert_eq!(std::fs::read_to_string(&installed).unwrap(), "#!/bin/sh\necho codex\n");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&installed).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111, "artifact must be executable");
    }

    assert_eq!(
        pipeline.history(),
        &[
            PipelineState::Start,
            PipelineState::Validated,
            PipelineState::SandboxReady,
            PipelineState::ToolchainReady,
            PipelineState::Built,
            PipelineState::Verified,
            PipelineState::Installed,
            PipelineState::Done,
        ]
    );
    assert_eq!(provider.created(), 1);
    assert_eq!(provider.cleanups(), 1);
}

#[tokio::test]
async fn steps_run_in_pipeline_order_with_pinned_toolchain() {
    let source = source_tree();
    let target = target_tree();
    let provider = FakeProvider::default();
    let mut pipeline = Pipeline::new(provider.clone(), PipelineConfig::default());

    pipeline.run(&request(&source, &target)).await.expect("run failed");

    let steps = provider.steps();
    assert_eq!(steps[0], "apt-get update");
    assert!(steps[1].starts_with("apt-get install -y --no-install-recommends"));
    assert_eq!(steps[2], "rustup toolchain install 1.90.0 --profile minimal");
    assert_eq!(steps[3], "rustc +1.90.0 --version");
    assert_eq!(steps[4], "cargo +1.90.0 build --release -p codex-cli --bin codex");

    let queries: Vec<&String> = steps[5..].iter().collect();
    assert_eq!(queries.len(), PipelineConfig::default().verify.constraints.len());
    assert!(queries.iter().all(|q| q.starts_with("cargo +1.90.0 tree -p codex-cli")));
}

#[tokio::test]
async fn manifest_pin_changes_toolchain_without_config_change() {
    let source = source_tree();
    std::fs::write(
        source.path().join("codex-rs/rust-toolchain.toml"),
        "[toolchain]\nchannel = \"1.91.1\"\n",
    )
    .unwrap();
    let target = target_tree();
    let provider = FakeProvider::default();
    let mut pipeline = Pipeline::new(provider.clone(), PipelineConfig::default());

    pipeline.run(&request(&source, &target)).await.expect("run failed");

    assert!(provider
        .steps()
        .contains(&"cargo +1.91.1 build --release -p codex-cli --bin codex".to_string()));
}

#[tokio::test]
async fn running_twice_leaves_one_artifact() {
    let source = source_tree();
    let target = target_tree();

    for _ in 0..2 {
        let mut pipeline = Pipeline::new(FakeProvider::default(), PipelineConfig::default());
        pipeline.run(&request(&source, &target)).await.expect("run failed");
    }

    let entries: Vec<_> = std::fs::read_dir(target.path().join("mooreCube/bin/codex"))
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(entries, vec![std::ffi::OsString::from("codex")]);
}

#[tokio::test]
async fn build_failure_installs_nothing_and_propagates_code() {
    let source = source_tree();
    let target = target_tree();
    let provider = FakeProvider::failing_on("cargo +1.90.0 build", 101);
    let mut pipeline = Pipeline::new(provider.clone(), PipelineConfig::default());

    let err = pipeline.run(&request(&source, &target)).await.unwrap_err();

    assert!(matches!(err, Error::Build { code: Some(101), .. }));
    assert_eq!(err.exit_code(), 101);
    assert!(!installed_path(target.path()).exists());
    assert!(matches!(pipeline.state(), PipelineState::Failed(_)));
    assert!(!pipeline.history().contains(&PipelineState::Built));
    assert_eq!(provider.cleanups(), 1, "sandbox must be torn down on failure");
}

#[tokio::test]
async fn toolchain_failure_aborts_before_build() {
    let source = source_tree();
    let target = target_tree();
    let provider = FakeProvider::failing_on("apt-get install", 100);
    let mut pipeline = Pipeline::new(provider.clone(), PipelineConfig::default());

    let err = pipeline.run(&request(&source, &target)).await.unwrap_err();

    match &err {
        Error::ToolchainInstall { step, code } => {
            assert!(step.starts_with("apt-get install"));
            assert_eq!(*code, Some(100));
        }
        other => panic!("expected toolchain install error, got {other:?}"),
    }
    assert!(provider.steps().iter().all(|s| !s.starts_with("cargo")));
    assert_eq!(provider.cleanups(), 1);
}

#[tokio::test]
async fn sandbox_start_failure_is_fatal_and_runs_nothing() {
    let source = source_tree();
    let target = target_tree();
    let provider = FakeProvider {
        start_failure: Some(125),
        ..Default::default()
    };
    let mut pipeline = Pipeline::new(provider.clone(), PipelineConfig::default());

    let err = pipeline.run(&request(&source, &target)).await.unwrap_err();

    assert_eq!(err.exit_code(), 125);
    assert!(provider.steps().is_empty());
    assert_eq!(
        pipeline.history(),
        &[
            PipelineState::Start,
            PipelineState::Validated,
            PipelineState::Failed(err.to_string()),
        ]
    );
}

#[tokio::test]
async fn missing_toolchain_manifest_fails_before_sandbox() {
    let source = TempDir::new().unwrap();
    let target = target_tree();
    let provider = FakeProvider::default();
    let mut pipeline = Pipeline::new(provider.clone(), PipelineConfig::default());

    let err = pipeline.run(&request(&source, &target)).await.unwrap_err();

    assert!(matches!(err, Error::ToolchainManifest { .. }));
    assert_eq!(provider.created(), 0);
}

#[tokio::test]
async fn disallowed_package_blocks_install() {
    let source = source_tree();
    let target = target_tree();
    let provider = FakeProvider {
        present: vec!["sentry".to_string()],
        ..Default::default()
    };
    let mut pipeline = Pipeline::new(provider.clone(), PipelineConfig::default());

    let err = pipeline.run(&request(&source, &target)).await.unwrap_err();

    assert!(matches!(err, Error::ConstraintViolation(_)));
    assert!(err.to_string().contains("`sentry` is in the dependency graph"));
    assert_eq!(err.exit_code(), 1);
    assert!(!installed_path(target.path()).exists());
    assert_eq!(provider.cleanups(), 1);
}

#[tokio::test]
async fn package_at_two_versions_blocks_install() {
    let source = source_tree();
    let target = target_tree();
    let provider = FakeProvider {
        ambiguous: vec!["native-tls".to_string()],
        ..Default::default()
    };
    let mut pipeline = Pipeline::new(provider, PipelineConfig::default());

    let err = pipeline.run(&request(&source, &target)).await.unwrap_err();

    assert!(matches!(err, Error::ConstraintViolation(_)));
    assert_eq!(err.exit_code(), 1);
    assert!(!installed_path(target.path()).exists());
}

#[tokio::test]
async fn package_at_two_versions_is_reported_in_advisory_mode() {
    let source = source_tree();
    let target = target_tree();
    let provider = FakeProvider {
        ambiguous: vec!["openssl-sys".to_string()],
        ..Default::default()
    };
    let mut pipeline = Pipeline::new(provider, PipelineConfig::default())
        .with_verify_mode(VerifyMode::Advisory);

    let report = pipeline
        .verify_only(&request(&source, &target))
        .await
        .expect("ambiguous query must not fail verification");

    assert!(!report.passed());
    assert!(report.violations()[0].contains("`openssl-sys` is in the dependency graph"));
}

#[tokio::test]
async fn abandoned_run_tears_down_sandbox() {
    let source = source_tree();
    let target = target_tree();
    let provider = FakeProvider {
        hang_on: Some("cargo +1.90.0 build".to_string()),
        ..Default::default()
    };
    let mut pipeline = Pipeline::new(provider.clone(), PipelineConfig::default());

    let outcome = tokio::time::timeout(
        Duration::from_millis(200),
        pipeline.run(&request(&source, &target)),
    )
    .await;

    assert!(outcome.is_err(), "run should still be blocked in the build");
    assert_eq!(provider.created(), 1);
    assert_eq!(provider.cleanups(), 1);
    assert!(!installed_path(target.path()).exists());
    assert_eq!(pipeline.state(), &PipelineState::ToolchainReady);
}

#[tokio::test]
async fn advisory_mode_installs_despite_violations() {
    let source = source_tree();
    let target = target_tree();
    let provider = FakeProvider {
        present: vec!["native-tls".to_string()],
        ..Default::default()
    };
    let mut pipeline = Pipeline::new(provider, PipelineConfig::default())
        .with_verify_mode(VerifyMode::Advisory);

    pipeline.run(&request(&source, &target)).await.expect("advisory run failed");

    assert!(installed_path(target.path()).exists());
    assert!(pipeline.history().contains(&PipelineState::Verified));
}

#[tokio::test]
async fn skip_mode_runs_no_queries() {
    let source = source_tree();
    let target = target_tree();
    let provider = FakeProvider::default();
    let mut pipeline =
        Pipeline::new(provider.clone(), PipelineConfig::default()).with_verify_mode(VerifyMode::Skip);

    pipeline.run(&request(&source, &target)).await.expect("run failed");

    assert!(provider.steps().iter().all(|s| !s.contains(" tree ")));
    assert!(!pipeline.history().contains(&PipelineState::Verified));
}

#[tokio::test]
async fn token_in_build_manifest_blocks_install() {
    let source = source_tree();
    std::fs::create_dir_all(source.path().join("codex-rs/feedback")).unwrap();
    std::fs::write(
        source.path().join("codex-rs/feedback/Cargo.toml"),
        "[dependencies]\nsentry = \"0.34\"\n",
    )
    .unwrap();
    std::fs::write(
        source.path().join("CHANGELOG.md"),
        "- dropped `sentry = \"0.34\"` from feedback\n",
    )
    .unwrap();
    let target = target_tree();
    let mut pipeline = Pipeline::new(FakeProvider::default(), PipelineConfig::default());

    let err = pipeline.run(&request(&source, &target)).await.unwrap_err();

    let message = err.to_string();
    assert!(message.contains("codex-rs/feedback/Cargo.toml:2"));
    assert!(!message.contains("CHANGELOG.md"));
}

#[tokio::test]
async fn verify_only_reports_without_building() {
    let source = source_tree();
    std::fs::create_dir_all(source.path().join("docs")).unwrap();
    std::fs::write(
        source.path().join("docs/history.md"),
        "Feedback used `sentry::init` before it went local-only.\n",
    )
    .unwrap();
    let target = target_tree();
    let provider = FakeProvider::default();
    let mut pipeline = Pipeline::new(provider.clone(), PipelineConfig::default());

    let report = pipeline
        .verify_only(&request(&source, &target))
        .await
        .expect("verification failed");

    assert!(report.passed());
    assert_eq!(report.member, "codex-cli");
    assert!(report
        .dependencies
        .iter()
        .all(|d| d.outcome == codex_builder::verify::QueryOutcome::Absent));
    assert_eq!(report.tokens.len(), 1);
    assert!(report.tokens[0].allowed);

    assert!(provider.steps().iter().all(|s| !s.contains(" build ")));
    assert!(!installed_path(target.path()).exists());
    assert_eq!(pipeline.state(), &PipelineState::Done);
    assert_eq!(provider.cleanups(), 1);
}

#[tokio::test]
async fn missing_install_directory_is_copy_error() {
    let source = source_tree();
    let target = TempDir::new().unwrap();
    let mut pipeline = Pipeline::new(FakeProvider::default(), PipelineConfig::default());

    let err = pipeline.run(&request(&source, &target)).await.unwrap_err();

    assert!(matches!(err, Error::Copy { .. }));
    assert!(!target.path().join("mooreCube").exists());
}

#[tokio::test]
async fn finished_pipeline_cannot_be_resumed() {
    let source = source_tree();
    let target = target_tree();
    let mut pipeline = Pipeline::new(
        FakeProvider::failing_on("cargo +1.90.0 build", 1),
        PipelineConfig::default(),
    );

    pipeline.run(&request(&source, &target)).await.unwrap_err();
    let err = pipeline.run(&request(&source, &target)).await.unwrap_err();

    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn deleted_target_root_is_rejected() {
    let source = source_tree();
    let target = target_tree();
    let platform = target.path().to_path_buf();
    drop(target);

    let err = BuildRequest::new(Some(&platform), source.path()).unwrap_err();
    assert_eq!(err.exit_code(), 1);
    assert!(!installed_path(&platform).exists());
}
