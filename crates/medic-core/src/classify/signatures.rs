//! Check-failure signatures.
//!
//! A failed check is judged by matching its name and output summary against
//! two pattern sets. Transient signatures describe infrastructure flakes that
//! a rebuild usually clears; persistent signatures describe failures caused
//! by the change itself.

use lazy_static::lazy_static;
use regex::Regex;

use crate::config::ClassificationConfig;
use crate::types::CheckFailure;

lazy_static! {
    // =========================================================================
    // TRANSIENT (INFRASTRUCTURE) SIGNATURES
    // =========================================================================

    /// Timeouts at any layer
    static ref TIMEOUT_PATTERN: Regex = Regex::new(
        r"(?i)\b(timed?[\s_-]?out|timeout|deadline exceeded)\b"
    ).unwrap();

    /// CI runner or agent disappeared mid-job
    static ref RUNNER_LOST_PATTERN: Regex = Regex::new(
        r"(?i)(runner (lost|has received a shutdown)|lost communication|agent (disconnected|went away)|the operation was canceled)"
    ).unwrap();

    /// Network resets and DNS failures
    static ref NETWORK_PATTERN: Regex = Regex::new(
        r"(?i)(connection (reset|refused|closed)|ECONNRESET|ETIMEDOUT|EAI_AGAIN|temporary failure in name resolution|could not resolve host|TLS handshake)"
    ).unwrap();

    /// Upstream 5xx and rate limiting
    static ref UPSTREAM_ERROR_PATTERN: Regex = Regex::new(
        r"(?i)(\b50[234]\b|bad gateway|service unavailable|rate limit(ed)?|too many requests)"
    ).unwrap();

    /// Agent killed for resources
    static ref RESOURCE_PATTERN: Regex = Regex::new(
        r"(?i)(oom[\s_-]?killed|out of memory|no space left on device|exit code 137)"
    ).unwrap();

    // =========================================================================
    // PERSISTENT (CODE) SIGNATURES
    // =========================================================================

    /// Compiler and type errors
    static ref COMPILE_PATTERN: Regex = Regex::new(
        r"(?i)(compil(e|ation) (error|failed)|error\[E\d{4}\]|cannot find symbol|syntax ?error|type ?error|undefined reference)"
    ).unwrap();

    /// Test assertions
    static ref ASSERTION_PATTERN: Regex = Regex::new(
        r"(?i)(assert(ion)?(error| failed)|expected .+ but (got|was)|\d+ tests? failed)"
    ).unwrap();

    /// Linters and formatters
    static ref LINT_PATTERN: Regex = Regex::new(
        r"(?i)(lint (error|failed)|clippy|eslint|rustfmt|checkstyle|would reformat)"
    ).unwrap();

    /// Dependency resolution and vulnerability gates
    static ref DEPENDENCY_PATTERN: Regex = Regex::new(
        r"(?i)(could not resolve dependencies|version conflict|unsatisfiable|vulnerabilit(y|ies) found)"
    ).unwrap();
}

fn builtin_transient() -> Vec<Regex> {
    vec![
        TIMEOUT_PATTERN.clone(),
        RUNNER_LOST_PATTERN.clone(),
        NETWORK_PATTERN.clone(),
        UPSTREAM_ERROR_PATTERN.clone(),
        RESOURCE_PATTERN.clone(),
    ]
}

fn builtin_persistent() -> Vec<Regex> {
    vec![
        COMPILE_PATTERN.clone(),
        ASSERTION_PATTERN.clone(),
        LINT_PATTERN.clone(),
        DEPENDENCY_PATTERN.clone(),
    ]
}

/// Verdict over a set of check failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Worth a rebuild; the retry budget bounds the attempts.
    Transient,
    /// The change itself is broken; a rebuild cannot help.
    Persistent,
}

/// Compiled transient and persistent signature sets.
#[derive(Debug, Clone)]
pub struct FailureSignatures {
    transient: Vec<Regex>,
    persistent: Vec<Regex>,
}

impl Default for FailureSignatures {
    fn default() -> Self {
        Self::builtin()
    }
}

impl FailureSignatures {
    /// The built-in signatures only.
    pub fn builtin() -> Self {
        Self {
            transient: builtin_transient(),
            persistent: builtin_persistent(),
        }
    }

    /// Built-in signatures extended with the configured ones.
    ///
    /// Invalid patterns are skipped with a warning; `MedicConfig::validate`
    /// rejects them before a config ever reaches here.
    pub fn from_config(config: &ClassificationConfig) -> Self {
        let mut signatures = Self::builtin();
        signatures
            .transient
            .extend(compile_all(&config.transient_signatures));
        signatures
            .persistent
            .extend(compile_all(&config.persistent_signatures));
        signatures
    }

    fn matches_any(patterns: &[Regex], failure: &CheckFailure) -> bool {
        patterns
            .iter()
            .any(|p| p.is_match(&failure.name) || p.is_match(&failure.summary))
    }

    pub fn is_transient(&self, failure: &CheckFailure) -> bool {
        Self::matches_any(&self.transient, failure)
    }

    pub fn is_persistent(&self, failure: &CheckFailure) -> bool {
        Self::matches_any(&self.persistent, failure)
    }

    /// Persistent only when some failure carries a persistent signature and
    /// none carries a transient one. No details at all reads as transient.
    pub fn judge(&self, failures: &[CheckFailure]) -> FailureVerdict {
        let any_transient = failures.iter().any(|f| self.is_transient(f));
        let any_persistent = failures.iter().any(|f| self.is_persistent(f));

        if any_persistent && !any_transient {
            FailureVerdict::Persistent
        } else {
            FailureVerdict::Transient
        }
    }
}

fn compile_all(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(pattern = %p, error = %e, "Skipping invalid failure signature");
                None
            }
        })
        .collect()
}
