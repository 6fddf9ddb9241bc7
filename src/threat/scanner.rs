use std::borrow::Cow;

use axum::http::{HeaderMap, header};
use serde_json::Value;

use super::patterns::{classify, is_traversal, suspicious_agent};
use super::{ThreatCategory, ThreatFinding};
use crate::config::Config;

/// Header values scanned against the pattern families.
const SCANNED_HEADERS: [&str; 5] = [
    "user-agent",
    "referer",
    "x-forwarded-host",
    "x-original-url",
    "x-rewrite-url",
];

/// Agents shorter than this are a weak signal.
const MIN_USER_AGENT_LEN: usize = 10;

/// Findings beyond this are dropped; one is enough to reject.
const MAX_FINDINGS: usize = 16;

/// Borrowed view of everything the scanner inspects.
#[derive(Debug, Clone, Copy)]
pub struct RequestSurfaces<'a> {
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
}

/// Result of one scan.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub findings: Vec<ThreatFinding>,
    /// Missing or very short `User-Agent`.
    pub weak_user_agent: bool,
    /// Flattened query + body parameter count.
    pub param_count: usize,
}

impl ScanReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn first(&self) -> Option<&ThreatFinding> {
        self.findings.first()
    }

    fn push(&mut self, finding: ThreatFinding) {
        if self.findings.len() < MAX_FINDINGS {
            self.findings.push(finding);
        }
    }

    fn is_full(&self) -> bool {
        self.findings.len() >= MAX_FINDINGS
    }
}

enum ParsedBody<'a> {
    Empty,
    Json(Value),
    Form(Vec<(Cow<'a, str>, Cow<'a, str>)>),
    Text(&'a str),
    /// Binary or multipart content; size-checked only.
    Opaque,
}

impl ParsedBody<'_> {
    fn param_count(&self) -> usize {
        match self {
            ParsedBody::Json(value) => count_leaves(value),
            ParsedBody::Form(pairs) => pairs.len(),
            ParsedBody::Empty | ParsedBody::Text(_) | ParsedBody::Opaque => 0,
        }
    }
}

/// Stateless threat scanner. Cheap to clone and share.
#[derive(Debug, Clone)]
pub struct ThreatScanner {
    max_payload_bytes: usize,
    max_param_count: usize,
    reject_missing_user_agent: bool,
}

impl ThreatScanner {
    pub fn new(
        max_payload_bytes: usize,
        max_param_count: usize,
        reject_missing_user_agent: bool,
    ) -> Self {
        Self {
            max_payload_bytes,
            max_param_count,
            reject_missing_user_agent,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.max_payload_bytes,
            config.max_param_count,
            config.reject_missing_user_agent,
        )
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    /// Size check usable before the body is buffered.
    pub fn oversized(&self, declared: Option<u64>, buffered: usize) -> Option<ThreatFinding> {
        let buffered = u64::try_from(buffered).unwrap_or(u64::MAX);
        let limit = u64::try_from(self.max_payload_bytes).unwrap_or(u64::MAX);
        let size = declared.unwrap_or(0).max(buffered);
        (size > limit).then(|| {
            ThreatFinding::new(
                ThreatCategory::OversizedPayload,
                "body",
                &format!("{size} bytes"),
            )
        })
    }

    /// Scan all surfaces of one request.
    pub fn scan(&self, surfaces: &RequestSurfaces<'_>) -> ScanReport {
        let mut report = ScanReport::default();

        if let Some(finding) = self.oversized(declared_length(surfaces.headers), surfaces.body.len())
        {
            report.push(finding);
            return report;
        }

        self.check_user_agent(surfaces.headers, &mut report);

        let query_pairs: Vec<(Cow<'_, str>, Cow<'_, str>)> = surfaces
            .query
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).collect())
            .unwrap_or_default();
        let body = parse_body(surfaces.headers, surfaces.body);

        report.param_count = query_pairs.len() + body.param_count();
        if report.param_count > self.max_param_count {
            report.push(ThreatFinding::new(
                ThreatCategory::ExcessiveParameters,
                "params",
                &report.param_count.to_string(),
            ));
            return report;
        }

        if is_traversal(surfaces.path) {
            report.push(ThreatFinding::new(
                ThreatCategory::PathTraversal,
                "path",
                surfaces.path,
            ));
        }

        for (key, value) in &query_pairs {
            check(&mut report, key, || format!("query.{key} (key)"));
            check(&mut report, value, || format!("query.{key}"));
        }

        match &body {
            ParsedBody::Json(value) => {
                let mut locator = String::from("body");
                walk_json(value, &mut locator, &mut report);
            }
            ParsedBody::Form(pairs) => {
                for (key, value) in pairs {
                    check(&mut report, key, || format!("body.{key} (key)"));
                    check(&mut report, value, || format!("body.{key}"));
                }
            }
            ParsedBody::Text(text) => check(&mut report, text, || "body".to_string()),
            ParsedBody::Empty | ParsedBody::Opaque => {}
        }

        for name in SCANNED_HEADERS {
            if let Some(value) = surfaces.headers.get(name).and_then(|v| v.to_str().ok()) {
                check(&mut report, value, || format!("header.{name}"));
            }
        }

        report
    }

    fn check_user_agent(&self, headers: &HeaderMap, report: &mut ScanReport) {
        let agent = headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .unwrap_or_default();

        if let Some(token) = suspicious_agent(agent) {
            report.push(ThreatFinding::new(
                ThreatCategory::SuspiciousAgent,
                "header.user-agent",
                token,
            ));
        }

        if agent.chars().count() < MIN_USER_AGENT_LEN {
            report.weak_user_agent = true;
            if self.reject_missing_user_agent {
                report.push(ThreatFinding::new(
                    ThreatCategory::SuspiciousAgent,
                    "header.user-agent",
                    agent,
                ));
            }
        }
    }
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn parse_body<'a>(headers: &HeaderMap, body: &'a [u8]) -> ParsedBody<'a> {
    if body.is_empty() {
        return ParsedBody::Empty;
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("multipart/") || content_type.starts_with("application/octet-stream")
    {
        return ParsedBody::Opaque;
    }

    if content_type.contains("json")
        && let Ok(value) = serde_json::from_slice::<Value>(body)
    {
        return ParsedBody::Json(value);
    }

    if content_type.starts_with("application/x-www-form-urlencoded") {
        return ParsedBody::Form(url::form_urlencoded::parse(body).collect());
    }

    // Unparsable JSON and untyped bodies are scanned as one text leaf
    match std::str::from_utf8(body) {
        Ok(text) => ParsedBody::Text(text),
        Err(_) => ParsedBody::Opaque,
    }
}

fn count_leaves(value: &Value) -> usize {
    match value {
        Value::Array(items) => items.iter().map(count_leaves).sum(),
        Value::Object(map) => map.values().map(count_leaves).sum(),
        _ => 1,
    }
}

fn walk_json(value: &Value, locator: &mut String, report: &mut ScanReport) {
    if report.is_full() {
        return;
    }

    match value {
        Value::String(text) => check(report, text, || locator.clone()),
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                let len = locator.len();
                locator.push_str(&format!("[{index}]"));
                walk_json(item, locator, report);
                locator.truncate(len);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                let len = locator.len();
                locator.push('.');
                locator.push_str(key);
                check(report, key, || format!("{locator} (key)"));
                walk_json(item, locator, report);
                locator.truncate(len);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

#[inline]
fn check(report: &mut ScanReport, text: &str, locator: impl FnOnce() -> String) {
    if text.is_empty() || report.is_full() {
        return;
    }
    if let Some(category) = classify(text) {
        report.push(ThreatFinding::new(category, locator(), text));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const BROWSER_UA: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:120.0) Gecko/20100101 Firefox/120.0";

    fn scanner() -> ThreatScanner {
        ThreatScanner::new(1024, 10, false)
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert("user-agent", BROWSER_UA.parse().unwrap());
        for (name, value) in pairs {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    fn scan(
        scanner: &ThreatScanner,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        body: &[u8],
    ) -> ScanReport {
        scanner.scan(&RequestSurfaces {
            path,
            query,
            headers,
            body,
        })
    }

    #[test]
    fn test_clean_request() {
        let h = headers(&[("content-type", "application/json")]);
        let report = scan(
            &scanner(),
            "/api/products",
            Some("q=Please+select+your+size&page=2"),
            &h,
            br#"{"note":"select the blue one","qty":2}"#,
        );

        assert!(report.is_clean(), "{:?}", report.findings);
        assert!(!report.weak_user_agent);
        assert_eq!(report.param_count, 4);
    }

    #[test]
    fn test_sql_injection_in_query() {
        let report = scan(
            &scanner(),
            "/api/users",
            Some("name=%27%20OR%20%271%27%3D%271"),
            &headers(&[]),
            b"",
        );

        let finding = report.first().unwrap();
        assert_eq!(finding.category, ThreatCategory::SqlInjection);
        assert_eq!(finding.locator, "query.name");
    }

    #[test]
    fn test_xss_in_nested_json() {
        let h = headers(&[("content-type", "application/json")]);
        let report = scan(
            &scanner(),
            "/api/comments",
            None,
            &h,
            br#"{"post":{"comments":[{"text":"hi"},{"text":"<script>alert(1)</script>"}]}}"#,
        );

        let finding = report.first().unwrap();
        assert_eq!(finding.category, ThreatCategory::Xss);
        assert_eq!(finding.locator, "body.post.comments[1].text");
    }

    #[test]
    fn test_object_keys_are_scanned() {
        let h = headers(&[("content-type", "application/json")]);
        let report = scan(
            &scanner(),
            "/api/x",
            None,
            &h,
            br#"{"<script>":"value"}"#,
        );

        assert_eq!(report.first().unwrap().category, ThreatCategory::Xss);
        assert!(report.first().unwrap().locator.ends_with("(key)"));
    }

    #[test]
    fn test_form_body_scanned() {
        let h = headers(&[("content-type", "application/x-www-form-urlencoded")]);
        let report = scan(
            &scanner(),
            "/login",
            None,
            &h,
            b"user=admin%27--&pass=x",
        );

        assert_eq!(report.first().unwrap().category, ThreatCategory::SqlInjection);
        assert_eq!(report.first().unwrap().locator, "body.user");
    }

    #[test]
    fn test_text_body_is_single_leaf() {
        let h = headers(&[("content-type", "text/plain")]);
        let report = scan(&scanner(), "/notes", None, &h, b"see ../../etc/passwd");

        assert_eq!(report.first().unwrap().category, ThreatCategory::PathTraversal);
        assert_eq!(report.first().unwrap().locator, "body");
    }

    #[test]
    fn test_path_traversal_in_path() {
        let report = scan(&scanner(), "/files/..%2f..%2fsecret", None, &headers(&[]), b"");
        assert_eq!(report.first().unwrap().category, ThreatCategory::PathTraversal);
        assert_eq!(report.first().unwrap().locator, "path");
    }

    #[test]
    fn test_header_scanned() {
        let h = headers(&[("referer", "https://x.test/?id=1 UNION SELECT 1")]);
        let report = scan(&scanner(), "/", None, &h, b"");
        assert_eq!(report.first().unwrap().locator, "header.referer");
    }

    #[test]
    fn test_oversized_declared_length() {
        let h = headers(&[("content-length", "4096")]);
        let report = scan(&scanner(), "/upload", None, &h, b"");

        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.first().unwrap().category, ThreatCategory::OversizedPayload);
    }

    #[test]
    fn test_oversized_buffered_body() {
        let body = vec![b'a'; 2048];
        let report = scan(&scanner(), "/upload", None, &headers(&[]), &body);
        assert_eq!(report.first().unwrap().category, ThreatCategory::OversizedPayload);
    }

    #[test]
    fn test_excessive_parameters() {
        let query = (0..11).map(|i| format!("k{i}=v")).collect::<Vec<_>>().join("&");
        let report = scan(&scanner(), "/search", Some(&query), &headers(&[]), b"");

        assert_eq!(report.param_count, 11);
        assert_eq!(
            report.first().unwrap().category,
            ThreatCategory::ExcessiveParameters
        );
    }

    #[test]
    fn test_json_leaves_count_toward_parameters() {
        let h = headers(&[("content-type", "application/json")]);
        let body = serde_json::to_vec(&(0..20).collect::<Vec<_>>()).unwrap();
        let report = scan(&ThreatScanner::new(4096, 10, false), "/bulk", None, &h, &body);

        assert_eq!(
            report.first().unwrap().category,
            ThreatCategory::ExcessiveParameters
        );
    }

    #[test]
    fn test_scanner_agent_rejected() {
        let mut h = HeaderMap::new();
        h.insert("user-agent", "sqlmap/1.7.2#stable (https://sqlmap.org)".parse().unwrap());
        let report = scan(&scanner(), "/", None, &h, b"");

        assert_eq!(report.first().unwrap().category, ThreatCategory::SuspiciousAgent);
        assert_eq!(report.first().unwrap().sample, "sqlmap");
    }

    #[test]
    fn test_missing_agent_is_signal_only() {
        let report = scan(&scanner(), "/", None, &HeaderMap::new(), b"");
        assert!(report.is_clean());
        assert!(report.weak_user_agent);
    }

    #[test]
    fn test_missing_agent_rejected_when_strict() {
        let strict = ThreatScanner::new(1024, 10, true);
        let report = scan(&strict, "/", None, &HeaderMap::new(), b"");
        assert_eq!(report.first().unwrap().category, ThreatCategory::SuspiciousAgent);
    }

    #[test]
    fn test_binary_body_not_pattern_scanned() {
        let h = headers(&[("content-type", "application/octet-stream")]);
        let report = scan(&scanner(), "/upload", None, &h, b"<script>");
        assert!(report.is_clean());
    }

    #[test]
    fn test_sample_never_exceeds_limit() {
        let h = headers(&[("content-type", "text/plain")]);
        let body = format!("<script>{}</script>", "x".repeat(600));
        let report = scan(&ThreatScanner::new(4096, 10, false), "/", None, &h, body.as_bytes());
        assert!(report.first().unwrap().sample.chars().count() <= super::super::MAX_SAMPLE_CHARS);
    }
}
