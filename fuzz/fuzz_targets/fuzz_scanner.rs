//! Fuzz testing for the threat scanner.
//!
//! Feeds arbitrary paths, query strings, header values and bodies through
//! `ThreatScanner::scan` and checks that it:
//!
//! - Never panics, including on malformed JSON, form and UTF-8 input
//! - Keeps samples within `MAX_SAMPLE_CHARS`
//! - Rejects anything over the payload limit
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! # Install cargo-fuzz (requires nightly)
//! cargo +nightly install cargo-fuzz
//!
//! # Run the scanner fuzz target
//! cargo +nightly fuzz run fuzz_scanner
//!
//! # Run with a time limit (e.g., 60 seconds)
//! cargo +nightly fuzz run fuzz_scanner -- -max_total_time=60
//! ```

#![no_main]

use admission_guard::threat::{MAX_SAMPLE_CHARS, RequestSurfaces, ThreatCategory, ThreatScanner};
use arbitrary::Arbitrary;
use http::{HeaderMap, HeaderValue, header};
use libfuzzer_sys::fuzz_target;

const MAX_PAYLOAD: usize = 4096;

#[derive(Debug, Arbitrary)]
enum BodyKind {
    Json,
    Form,
    Text,
    Multipart,
    None,
}

#[derive(Debug, Arbitrary)]
struct Input<'a> {
    path: &'a str,
    query: Option<&'a str>,
    user_agent: &'a str,
    referer: &'a str,
    kind: BodyKind,
    body: &'a [u8],
}

fuzz_target!(|input: Input<'_>| {
    let scanner = ThreatScanner::new(MAX_PAYLOAD, 200, false);

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(input.user_agent) {
        headers.insert(header::USER_AGENT, value);
    }
    if let Ok(value) = HeaderValue::from_str(input.referer) {
        headers.insert(header::REFERER, value);
    }
    let content_type = match input.kind {
        BodyKind::Json => Some("application/json"),
        BodyKind::Form => Some("application/x-www-form-urlencoded"),
        BodyKind::Text => Some("text/plain; charset=utf-8"),
        BodyKind::Multipart => Some("multipart/form-data; boundary=x"),
        BodyKind::None => None,
    };
    if let Some(content_type) = content_type {
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    }

    let report = scanner.scan(&RequestSurfaces {
        path: input.path,
        query: input.query,
        headers: &headers,
        body: input.body,
    });

    for finding in &report.findings {
        assert!(finding.sample.chars().count() <= MAX_SAMPLE_CHARS);
    }
    if input.body.len() > MAX_PAYLOAD {
        assert!(report
            .findings
            .iter()
            .any(|f| f.category == ThreatCategory::OversizedPayload));
    }
});
