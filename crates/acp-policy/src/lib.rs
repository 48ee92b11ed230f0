// SPDX-License-Identifier: MIT OR Apache-2.0
//! Execution policy DSL.
//!
//! Policies are UTF-8 text, one `key = value` per line, `#` comments.
//! Unknown keys are accepted for forward compatibility but evaluation
//! pattern-matches a fixed option set; there is no runtime field lookup.
//! The canonical serialization emits recognized keys in ascending order,
//! so textually different but semantically identical policies share a
//! fingerprint, and any semantic edit changes it.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use acp_hash::sha256_hex;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Parse failures, with the 1-based offending line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyParseError {
    /// A line is not of the form `key = value`.
    #[error("line {line}: expected 'key = value'")]
    MalformedLine {
        /// 1-based line number.
        line: usize,
    },

    /// A recognized key carries an unparsable or out-of-range value.
    #[error("line {line}: invalid value for '{key}': {value}")]
    InvalidValue {
        /// 1-based line number.
        line: usize,
        /// The recognized key.
        key: String,
        /// The rejected value text.
        value: String,
    },
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// A parsed policy. Unset options impose no constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// Schema version.
    pub version: Option<i64>,
    /// Deny non-deterministic inputs.
    pub require_deterministic: Option<bool>,
    /// Deny unsigned inputs.
    pub require_signed: Option<bool>,
    /// Deny inputs with more external dependencies than this.
    pub max_external_dependencies: Option<i64>,
    /// Deny inputs with unpinned plugins.
    pub require_plugin_pinned: Option<bool>,
    /// Deny inputs whose reproducibility score (0–100) is below this;
    /// a score of −1 means "not yet measured" and is skipped.
    pub min_reproducibility_rate: Option<i64>,
    /// Deny chaos mode on main/master branches.
    pub forbid_chaos_on_main: Option<bool>,
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

impl PolicyDocument {
    /// Parse policy source text.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyParseError`] naming the first bad line. Unknown keys
    /// parse cleanly and are ignored.
    pub fn parse(source: &str) -> Result<Self, PolicyParseError> {
        let mut doc = Self::default();

        for (idx, raw_line) in source.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(PolicyParseError::MalformedLine { line: line_no });
            };
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() || value.is_empty() {
                return Err(PolicyParseError::MalformedLine { line: line_no });
            }

            let invalid = || PolicyParseError::InvalidValue {
                line: line_no,
                key: key.to_string(),
                value: value.to_string(),
            };

            match key {
                "version" => {
                    doc.version = Some(value.parse().map_err(|_| invalid())?);
                }
                "require_deterministic" => {
                    doc.require_deterministic = Some(parse_bool(value).ok_or_else(invalid)?);
                }
                "require_signed" => {
                    doc.require_signed = Some(parse_bool(value).ok_or_else(invalid)?);
                }
                "max_external_dependencies" => {
                    let n: i64 = value.parse().map_err(|_| invalid())?;
                    if n < 0 {
                        return Err(invalid());
                    }
                    doc.max_external_dependencies = Some(n);
                }
                "require_plugin_pinned" => {
                    doc.require_plugin_pinned = Some(parse_bool(value).ok_or_else(invalid)?);
                }
                "min_reproducibility_rate" => {
                    let n: i64 = value.parse().map_err(|_| invalid())?;
                    if !(0..=100).contains(&n) {
                        return Err(invalid());
                    }
                    doc.min_reproducibility_rate = Some(n);
                }
                "forbid_chaos_on_main" => {
                    doc.forbid_chaos_on_main = Some(parse_bool(value).ok_or_else(invalid)?);
                }
                // Forward compatibility: unknown keys are accepted and
                // deliberately not retained.
                _ => {}
            }
        }
        Ok(doc)
    }

    /// Canonical serialization: recognized, set keys in ascending order.
    #[must_use]
    pub fn canonical_source(&self) -> String {
        let mut out = String::new();
        if let Some(v) = self.forbid_chaos_on_main {
            let _ = writeln!(out, "forbid_chaos_on_main = {v}");
        }
        if let Some(v) = self.max_external_dependencies {
            let _ = writeln!(out, "max_external_dependencies = {v}");
        }
        if let Some(v) = self.min_reproducibility_rate {
            let _ = writeln!(out, "min_reproducibility_rate = {v}");
        }
        if let Some(v) = self.require_deterministic {
            let _ = writeln!(out, "require_deterministic = {v}");
        }
        if let Some(v) = self.require_plugin_pinned {
            let _ = writeln!(out, "require_plugin_pinned = {v}");
        }
        if let Some(v) = self.require_signed {
            let _ = writeln!(out, "require_signed = {v}");
        }
        if let Some(v) = self.version {
            let _ = writeln!(out, "version = {v}");
        }
        out
    }

    /// Fingerprint: SHA-256 hex of the canonical source.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        sha256_hex(self.canonical_source().as_bytes())
    }

    /// Evaluate this policy against an input. Pure: the same policy and
    /// input always produce the same report.
    #[must_use]
    pub fn evaluate(&self, input: &PolicyInput) -> PolicyReport {
        let mut violations = Vec::new();

        if self.require_deterministic == Some(true) && !input.is_deterministic {
            violations.push(Violation {
                code: ViolationCode::NotDeterministic,
                message: "input is not deterministic".into(),
            });
        }

        if self.require_signed == Some(true) && !input.is_signed {
            violations.push(Violation {
                code: ViolationCode::NotSigned,
                message: "input is not signed".into(),
            });
        }

        if let Some(max) = self.max_external_dependencies
            && input.external_dependency_count > max
        {
            violations.push(Violation {
                code: ViolationCode::TooManyExternalDependencies,
                message: format!(
                    "{} external dependencies exceed the limit of {max}",
                    input.external_dependency_count
                ),
            });
        }

        if self.require_plugin_pinned == Some(true) && !input.all_plugins_pinned {
            violations.push(Violation {
                code: ViolationCode::PluginNotPinned,
                message: "one or more plugins are not pinned".into(),
            });
        }

        if let Some(min) = self.min_reproducibility_rate
            && input.reproducibility_score >= 0
            && input.reproducibility_score < min
        {
            violations.push(Violation {
                code: ViolationCode::ReproducibilityBelowMinimum,
                message: format!(
                    "reproducibility score {} below the minimum of {min}",
                    input.reproducibility_score
                ),
            });
        }

        if self.forbid_chaos_on_main == Some(true)
            && input.is_chaos_mode
            && matches!(input.branch.as_str(), "main" | "master")
        {
            violations.push(Violation {
                code: ViolationCode::ChaosOnMainBranch,
                message: format!("chaos mode is forbidden on branch '{}'", input.branch),
            });
        }

        let allowed = violations.is_empty();
        let summary = if allowed {
            "allowed".to_string()
        } else {
            format!("denied: {} violation(s)", violations.len())
        };

        PolicyReport {
            run_id: input.run_id.clone(),
            policy_fingerprint: self.fingerprint(),
            allowed,
            violations,
            summary,
        }
    }
}

// ---------------------------------------------------------------------------
// Input / report
// ---------------------------------------------------------------------------

/// The facts a policy is evaluated against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyInput {
    /// Run the evaluation is for.
    pub run_id: String,
    /// Whether the run is deterministic.
    pub is_deterministic: bool,
    /// Whether the input artifact is signed.
    pub is_signed: bool,
    /// Number of external dependencies.
    pub external_dependency_count: i64,
    /// Whether every plugin is pinned to a version.
    pub all_plugins_pinned: bool,
    /// Reproducibility score 0–100; −1 means not yet measured.
    pub reproducibility_score: i64,
    /// Whether chaos mode is active.
    pub is_chaos_mode: bool,
    /// Branch the run executes against.
    pub branch: String,
}

/// Stable violation codes; callers dispatch on these, never the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationCode {
    /// `require_deterministic` failed.
    NotDeterministic,
    /// `require_signed` failed.
    NotSigned,
    /// `max_external_dependencies` exceeded.
    TooManyExternalDependencies,
    /// `require_plugin_pinned` failed.
    PluginNotPinned,
    /// `min_reproducibility_rate` not met.
    ReproducibilityBelowMinimum,
    /// `forbid_chaos_on_main` tripped.
    ChaosOnMainBranch,
}

/// One denied rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    /// Stable machine code.
    pub code: ViolationCode,
    /// Human-readable explanation.
    pub message: String,
}

/// Result of one evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyReport {
    /// Run the evaluation was for.
    pub run_id: String,
    /// Fingerprint of the evaluated policy.
    pub policy_fingerprint: String,
    /// `true` when no rule denied the input.
    pub allowed: bool,
    /// Every denied rule, in evaluation order.
    pub violations: Vec<Violation>,
    /// One-line outcome description.
    pub summary: String,
}
