//! Dependency constraint verification.
//!
//! Two checks against the same sandbox that built the artifact: an inverted
//! `cargo tree` query per disallowed package, and a full-text scan of the
//! source tree whose matches must stay inside documentation and history
//! files.

mod constraint;
mod scan;

pub use constraint::{
    default_allowed_paths, default_constraints, default_tokens, dependency_query,
    interpret_query, Constraint, DisallowedToken, QueryOutcome,
};
pub use scan::{TokenMatch, TokenScanner};

use std::path::Path;

use serde::Serialize;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::sandbox::Sandbox;
use crate::toolchain::ToolchainSpec;

/// Outcome of the graph query for one constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyCheck {
    pub package: String,
    pub rationale: String,
    pub outcome: QueryOutcome,
}

/// Everything the verifier found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    /// The workspace member that was queried.
    pub member: String,
    pub dependencies: Vec<DependencyCheck>,
    pub tokens: Vec<TokenMatch>,
}

impl VerificationReport {
    /// Human-readable descriptions of every violation.
    pub fn violations(&self) -> Vec<String> {
        let packages = self
            .dependencies
            .iter()
            .filter(|check| matches!(check.outcome, QueryOutcome::Present { .. }))
            .map(|check| {
                format!(
                    "`{}` is in the dependency graph of `{}` ({})",
                    check.package, self.member, check.rationale
                )
            });

        let tokens = self.tokens.iter().filter(|m| !m.allowed).map(|m| {
            format!(
                "{}:{} matches `{}`: {}",
                m.path.display(),
                m.line,
                m.token,
                m.excerpt
            )
        });

        packages.chain(tokens).collect()
    }

    /// Returns true if nothing disallowed was found.
    pub fn passed(&self) -> bool {
        self.violations().is_empty()
    }
}

/// Runs both checks. Queries run inside `sandbox`; the token scan runs
/// against `source_root` on the host, which is the same tree the sandbox
/// has mounted.
pub async fn verify<S>(
    sandbox: &mut S,
    spec: &ToolchainSpec,
    config: &PipelineConfig,
    source_root: &Path,
) -> Result<VerificationReport>
where
    S: Sandbox + ?Sized,
{
    let scanner = TokenScanner::new(&config.verify)?;

    let mut dependencies = Vec::new();
    for constraint in config.verify.constraints.iter().filter(|c| c.disallowed) {
        let step = dependency_query(spec, config, &constraint.package);
        let output = sandbox.run(&step).await?;
        let outcome = interpret_query(&constraint.package, &output)?;

        tracing::info!(package = %constraint.package, outcome = ?outcome, "dependency query");
        dependencies.push(DependencyCheck {
            package: constraint.package.clone(),
            rationale: constraint.rationale.clone(),
            outcome,
        });
    }

    let tokens = scanner.scan(source_root)?;
    for m in tokens.iter().filter(|m| !m.allowed) {
        tracing::warn!(path = ?m.path, line = m.line, token = %m.token, "disallowed token");
    }

    Ok(VerificationReport {
        member: config.build.package.clone(),
        dependencies,
        tokens,
    })
}
