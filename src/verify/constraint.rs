//! Dependency constraints and `cargo tree` queries.

use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::sandbox::{Step, StepOutput};
use crate::toolchain::ToolchainSpec;

/// A package whose presence in the build closure is checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    /// Crate name as it appears in the resolved graph.
    pub package: String,
    /// Whether the package must be absent.
    #[serde(default = "default_disallowed")]
    pub disallowed: bool,
    #[serde(default)]
    pub rationale: String,
}

fn default_disallowed() -> bool {
    true
}

impl Constraint {
    fn disallow(package: &str, rationale: &str) -> Self {
        Self {
            package: package.to_string(),
            disallowed: true,
            rationale: rationale.to_string(),
        }
    }
}

/// A full-text pattern identifying a forbidden dependency in source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisallowedToken {
    /// Regular expression matched against each line.
    pub pattern: String,
    #[serde(default)]
    pub rationale: String,
}

/// The fixed constraint set: native TLS bindings, alternate TLS backends and
/// the telemetry upload SDK.
pub fn default_constraints() -> Vec<Constraint> {
    vec![
        Constraint::disallow("native-tls", "legacy TLS binding that links OpenSSL"),
        Constraint::disallow("openssl-sys", "native OpenSSL linkage"),
        Constraint::disallow("sentry", "telemetry SDK that uploads logs off-box"),
        Constraint::disallow("hyper-tls", "alternate TLS backend built on native-tls"),
        Constraint::disallow("tokio-native-tls", "alternate TLS backend built on native-tls"),
    ]
}

/// Tokens that only appear where a forbidden crate is actually used: a
/// manifest key, a feature string or a crate path.
pub fn default_tokens() -> Vec<DisallowedToken> {
    vec![
        DisallowedToken {
            pattern: r#"\bsentry(?:-[a-z]+)?(?:\s*=|::|")"#.to_string(),
            rationale: "telemetry upload SDK".to_string(),
        },
        DisallowedToken {
            pattern: r#"\bnative[-_]tls(?:\s*=|::|")"#.to_string(),
            rationale: "native TLS backend".to_string(),
        },
        DisallowedToken {
            pattern: r#"\bopenssl(?:-sys)?(?:\s*=|::|")"#.to_string(),
            rationale: "OpenSSL linkage".to_string(),
        },
    ]
}

/// Paths where token matches are expected: documentation and history.
pub fn default_allowed_paths() -> Vec<String> {
    ["*.md", "**/*.md", "docs/**", "**/docs/**", "CHANGELOG*", "**/CHANGELOG*"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Result of asking the resolved graph about one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum QueryOutcome {
    /// The package is not in the graph.
    Absent,
    /// The package is in the graph; `tree` is the inverted dependency tree.
    Present { tree: Vec<String> },
}

/// The inverted `cargo tree` query for `package` against the built member.
pub fn dependency_query(spec: &ToolchainSpec, config: &PipelineConfig, package: &str) -> Step {
    Step::new("cargo")
        .arg(spec.toolchain_arg())
        .arg("tree")
        .arg("-p")
        .arg(config.build.package.clone())
        .args(["--target", "all", "-e", "normal,build", "-i"])
        .arg(package)
}

/// Interprets the output of [`dependency_query`].
///
/// cargo reports an unknown package specification as an error, which here
/// means the package is absent from the graph. A package resolved at several
/// versions makes the specification ambiguous; that is also an error from
/// cargo, but it means the package is present, and the candidate `pkg@ver`
/// lines it lists become the tree.
pub fn interpret_query(package: &str, output: &StepOutput) -> Result<QueryOutcome> {
    if output.success() {
        let tree: Vec<String> = output
            .stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(String::from)
            .collect();
        return Ok(if tree.is_empty() {
            QueryOutcome::Absent
        } else {
            QueryOutcome::Present { tree }
        });
    }

    if output.stderr.contains("did not match any packages") {
        return Ok(QueryOutcome::Absent);
    }

    if output.stderr.contains("is ambiguous") {
        let prefix = format!("{}@", package);
        let mut tree: Vec<String> = output
            .stderr
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with(&prefix))
            .map(String::from)
            .collect();
        if tree.is_empty() {
            tree.push(package.to_string());
        }
        return Ok(QueryOutcome::Present { tree });
    }

    let reason = output
        .stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("no output");
    Err(Error::Sandbox {
        message: format!("dependency query for `{}` failed: {}", package, reason.trim()),
        code: output.code,
    })
}
