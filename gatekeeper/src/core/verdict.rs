//! Gate verdict parsing.
//!
//! Reviewers answer a pending gate with `GATE_REVIEW: PASS - <rationale>` or
//! `GATE_REVIEW: FAIL - <rationale>`. The bare `PASS - <rationale>` form is only
//! accepted when the verdict arrives through the dedicated verdict field, since
//! free-form user text mentioning "pass" must not clear a gate by accident.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VerdictOutcome {
    Pass,
    Fail,
}

/// Where a verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    /// Dedicated verdict field produced in response to a gate review prompt.
    GateProduced,
    /// Free-form text supplied by the user.
    UserSupplied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub outcome: VerdictOutcome,
    pub rationale: String,
    pub source: VerdictSource,
}

impl GateVerdict {
    pub fn pass(rationale: impl Into<String>, source: VerdictSource) -> Self {
        Self {
            outcome: VerdictOutcome::Pass,
            rationale: rationale.into(),
            source,
        }
    }

    pub fn fail(rationale: impl Into<String>, source: VerdictSource) -> Self {
        Self {
            outcome: VerdictOutcome::Fail,
            rationale: rationale.into(),
            source,
        }
    }

    pub fn is_pass(&self) -> bool {
        self.outcome == VerdictOutcome::Pass
    }
}

static PREFIXED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*GATE[_ ](?:REVIEW|VERDICT)\s*:\s*(PASS|FAIL)\s*(?:[-:\u{2013}\u{2014}]\s*(.*))?$")
        .expect("valid verdict regex")
});

static BARE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(PASS|FAIL)\s*[-:\u{2013}\u{2014}]\s*(.+)$").expect("valid bare verdict regex")
});

/// Parse a verdict from reviewer text.
///
/// Returns `None` when no verdict is present or when the rationale is empty.
pub fn parse_verdict(text: &str, source: VerdictSource) -> Option<GateVerdict> {
    let captures = PREFIXED_RE.captures(text).or_else(|| match source {
        VerdictSource::GateProduced => BARE_RE.captures(text.trim()),
        VerdictSource::UserSupplied => None,
    })?;

    let outcome = match captures.get(1)?.as_str().to_ascii_uppercase().as_str() {
        "PASS" => VerdictOutcome::Pass,
        _ => VerdictOutcome::Fail,
    };
    let rationale = captures
        .get(2)
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();
    if rationale.is_empty() {
        return None;
    }
    Some(GateVerdict {
        outcome,
        rationale,
        source,
    })
}
