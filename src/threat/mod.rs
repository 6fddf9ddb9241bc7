//! Pattern-based threat detection over request surfaces.
//!
//! The scanner is pure and synchronous: it never suspends, never allocates
//! more than the parsed request, and returns every finding it saw. The
//! admission pipeline rejects on the first one.
//!
//! # Surfaces
//!
//! | Surface | Checks |
//! |---------|--------|
//! | Path | traversal family only |
//! | Query parameters | keys and values, all families |
//! | Body (JSON / form / text) | keys and string leaves, all families |
//! | Selected headers | values, all families |
//! | `User-Agent` | scanner tool tokens, missing/short agent |
//! | Size | declared or buffered bytes above `MAX_PAYLOAD_BYTES` |
//! | Parameter count | flattened leaves above `MAX_PARAM_COUNT` |

mod patterns;
mod scanner;

use serde::Serialize;

pub use patterns::{SUSPICIOUS_AGENTS, classify};
pub use scanner::{RequestSurfaces, ScanReport, ThreatScanner};

/// Longest sample kept from an offending input, in characters.
pub const MAX_SAMPLE_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatCategory {
    SqlInjection,
    Xss,
    PathTraversal,
    CommandInjection,
    OversizedPayload,
    ExcessiveParameters,
    SuspiciousAgent,
}

impl ThreatCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatCategory::SqlInjection => "sql_injection",
            ThreatCategory::Xss => "xss",
            ThreatCategory::PathTraversal => "path_traversal",
            ThreatCategory::CommandInjection => "command_injection",
            ThreatCategory::OversizedPayload => "oversized_payload",
            ThreatCategory::ExcessiveParameters => "excessive_parameters",
            ThreatCategory::SuspiciousAgent => "suspicious_agent",
        }
    }
}

impl std::fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detection. Logged server side only; never echoed to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreatFinding {
    pub category: ThreatCategory,
    /// Where the input came from, e.g. `query.q`, `body.user.name`, `header.referer`.
    pub locator: String,
    /// Offending input, truncated to [`MAX_SAMPLE_CHARS`].
    pub sample: String,
}

impl ThreatFinding {
    pub fn new(category: ThreatCategory, locator: impl Into<String>, sample: &str) -> Self {
        Self {
            category,
            locator: locator.into(),
            sample: truncate_sample(sample),
        }
    }
}

/// Truncate on a character boundary.
pub fn truncate_sample(input: &str) -> String {
    input.chars().take(MAX_SAMPLE_CHARS).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_truncated_to_limit() {
        let long = "a".repeat(500);
        let finding = ThreatFinding::new(ThreatCategory::Xss, "query.q", &long);
        assert_eq!(finding.sample.chars().count(), MAX_SAMPLE_CHARS);
    }

    #[test]
    fn test_sample_truncation_respects_char_boundaries() {
        let long = "é".repeat(150);
        let sample = truncate_sample(&long);
        assert_eq!(sample.chars().count(), MAX_SAMPLE_CHARS);
        assert!(sample.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_category_serializes_snake_case() {
        let json = serde_json::to_string(&ThreatCategory::SqlInjection).unwrap();
        assert_eq!(json, "\"sql_injection\"");
        assert_eq!(ThreatCategory::PathTraversal.to_string(), "path_traversal");
    }
}
