//! Failure classification for execution records.
//!
//! `classify` is a pure function of an [`ExecutionRecord`]. Detectors run in
//! a fixed priority order and the first match wins:
//!
//! 1. corporate proxy block
//! 2. network unreachable / DNS failure
//! 3. execution timeout
//! 4. infrastructure failure (spawn error, runner crash)
//! 5. content failure (default)
//!
//! Matching is case-insensitive and line oriented, so truncated or garbled
//! output still classifies. Anything unrecognised falls through to
//! `ContentFailure`.

use crate::types::{
    Classification, ExecutionRecord, TransientKind, CANCELLED_EXIT_CODE, SPAWN_ERROR_EXIT_CODE,
};
use regex::Regex;
use std::sync::LazyLock;

/// Maximum characters kept for a piece of evidence.
const MAX_EVIDENCE_CHARS: usize = 240;

/// Maximum summary lines extracted for content failures.
const MAX_SUMMARY_LINES: usize = 20;

/// Lines of raw output kept when no assertion summary parses.
const FALLBACK_TAIL_LINES: usize = 40;

/// Maximum characters in a content failure's details.
const MAX_DETAILS_CHARS: usize = 4000;

/// Explicit proxy responses, matched on their own.
const PROXY_SIGNATURES: &[&str] = &[
    "407 proxy authentication required",
    "proxy authentication required",
    "http 407",
    "status code 407",
    "status: 407",
    "tunneling socket could not be established, statuscode=407",
    "blocked by your organization",
    "blocked by your administrator",
    "blocked by corporate policy",
    "access denied by policy",
    "this site has been blocked",
    "web page blocked",
    "website blocked",
];

/// Web-filter category phrases. Ordinary test text uses these words too, so
/// they only count next to [`CATEGORY_BLOCK_CONTEXT`] on the same line.
const CATEGORY_SIGNATURES: &[&str] = &["url category", "blocked category", "categorized as"];

/// Words that place a category phrase in a proxy response.
const CATEGORY_BLOCK_CONTEXT: &[&str] = &["blocked", "access denied", "proxy", "403"];

/// TLS interception symptoms. These only count as a proxy block when a
/// security product is also named in the output.
const TLS_INTERCEPTION_SIGNATURES: &[&str] = &[
    "self signed certificate in certificate chain",
    "self-signed certificate in certificate chain",
    "unable to get local issuer certificate",
    "unable to verify the first certificate",
    "certificate verify failed",
    "certificate_verify_failed",
    "pkix path building failed",
    "invalid peer certificate",
    "unknownissuer",
    "x509: certificate signed by unknown authority",
];

/// Interception products whose CA shows up in rewritten certificate chains.
const PROXY_PRODUCTS: &[&str] = &[
    "zscaler",
    "netskope",
    "bluecoat",
    "blue coat",
    "forcepoint",
    "websense",
    "fortinet",
    "fortigate",
    "palo alto networks",
    "cisco umbrella",
    "mcafee web gateway",
    "symantec web",
    "sophos",
    "checkpoint",
    "check point",
    "squid",
];

const DNS_SIGNATURES: &[&str] = &[
    "getaddrinfo enotfound",
    "getaddrinfo eai_again",
    "eai_again",
    "enotfound",
    "could not resolve host",
    "couldn't resolve host",
    "name or service not known",
    "temporary failure in name resolution",
    "nodename nor servname provided",
    "no such host",
    "dns lookup failed",
    "failed to lookup address information",
    "name resolution failed",
    "unknownhostexception",
];

const NETWORK_SIGNATURES: &[&str] = &[
    "econnrefused",
    "connection refused",
    "econnreset",
    "connection reset by peer",
    "connection reset",
    "enetunreach",
    "network is unreachable",
    "ehostunreach",
    "no route to host",
    "etimedout",
    "esockettimedout",
    "socket timeout",
    "sockettimeoutexception",
    "connect timed out",
    "connection timed out",
    "socket hang up",
    "connectexception",
];

/// Crash signatures of the test runner itself (not of code under test).
const RUNNER_CRASH_SIGNATURES: &[&str] = &[
    "internalerror>",
    "javascript heap out of memory",
    "fatal error: reached heap limit",
    "fatal error: ineffective mark-compacts",
    "java.lang.outofmemoryerror",
    "error: could not find or load main class",
    "the build daemon disappeared unexpectedly",
    "a worker process has quit unexpectedly",
    "test runner crashed",
    "error: test harness panicked",
];

/// Lines that usually summarise a failing assertion.
static SUMMARY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bassert(ion)?(error| failed| failure)?\b\s*[:!(]",
        r"(?i)\bassertion\b.*\bfail",
        r"(?i)^\s*(expected|received|actual|left|right)\b.{0,20}[:=]",
        r"(?i)\bexpected\b.+\b(to (equal|be|match|contain|have)|but (got|was|received))\b",
        r"(?i)^\s*(✕|✗|×|not ok\b|FAIL\b|FAILED\b|--- FAIL:)",
        r"(?i)\btest result: FAILED\b",
        r"(?i)\b\d+ (failed|failing|failures?)\b",
        r"(?i)\bpanicked at\b",
        r"(?i)^E\s{2,}\S",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("summary pattern is valid"))
    .collect()
});

/// Classify an execution record.
pub fn classify(record: &ExecutionRecord) -> Classification {
    if record.cancelled || record.exit_code == CANCELLED_EXIT_CODE {
        return Classification::InfrastructureFailure {
            reason: "cancelled by abort signal".to_string(),
        };
    }

    if record.is_clean_exit() {
        return Classification::Success;
    }

    let output = record.combined_output();

    if let Some(evidence) = detect_proxy_block(&output) {
        return Classification::TransientFailure {
            subtype: TransientKind::CorporateProxyBlock,
            evidence,
        };
    }

    if let Some((subtype, evidence)) = detect_network_failure(&output) {
        return Classification::TransientFailure { subtype, evidence };
    }

    if record.timed_out {
        return Classification::TransientFailure {
            subtype: TransientKind::Timeout,
            evidence: format!("no exit after {} ms; process tree killed", record.duration_ms),
        };
    }

    if let Some(reason) = detect_infrastructure_failure(record, &output) {
        return Classification::InfrastructureFailure { reason };
    }

    Classification::ContentFailure {
        details: extract_failure_details(record, &output),
    }
}

/// Detect interception-proxy signatures.
fn detect_proxy_block(output: &str) -> Option<String> {
    if let Some(line) = find_line(output, PROXY_SIGNATURES) {
        return Some(line);
    }
    if let Some(line) = find_category_block(output) {
        return Some(line);
    }

    let tls_line = find_line(output, TLS_INTERCEPTION_SIGNATURES)?;
    let lower = output.to_lowercase();
    let product = PROXY_PRODUCTS.iter().find(|p| lower.contains(*p))?;
    Some(clip(&format!("{tls_line} (issuer: {product})"), MAX_EVIDENCE_CHARS))
}

/// A web-filter category phrase with block context on the same line.
fn find_category_block(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let lower = line.to_lowercase();
        let category = CATEGORY_SIGNATURES.iter().any(|sig| lower.contains(sig));
        let context = CATEGORY_BLOCK_CONTEXT.iter().any(|c| lower.contains(c))
            || PROXY_PRODUCTS.iter().any(|p| lower.contains(p));
        (category && context).then(|| clip(line.trim(), MAX_EVIDENCE_CHARS))
    })
}

/// Detect DNS and connectivity failures. DNS signatures are checked first.
fn detect_network_failure(output: &str) -> Option<(TransientKind, String)> {
    if let Some(line) = find_line(output, DNS_SIGNATURES) {
        return Some((TransientKind::DnsFailure, line));
    }
    find_line(output, NETWORK_SIGNATURES).map(|line| (TransientKind::NetworkUnreachable, line))
}

/// Detect failures of the execution environment rather than the tests.
fn detect_infrastructure_failure(record: &ExecutionRecord, output: &str) -> Option<String> {
    if let Some(err) = &record.spawn_error {
        return Some(format!("failed to spawn command: {err}"));
    }
    if record.exit_code == SPAWN_ERROR_EXIT_CODE {
        return Some("failed to spawn command".to_string());
    }

    // Shell conventions for "found but not executable" and "not found".
    match record.exit_code {
        126 => return Some("command is not executable (exit 126)".to_string()),
        127 => return Some("command not found (exit 127)".to_string()),
        _ => {}
    }

    if record.signal == Some(9) {
        return Some("runner killed by SIGKILL (possibly out of memory)".to_string());
    }

    find_line(output, RUNNER_CRASH_SIGNATURES).map(|line| format!("test runner crashed: {line}"))
}

/// Extract a failing-assertion summary, falling back to the raw output tail.
fn extract_failure_details(record: &ExecutionRecord, output: &str) -> String {
    let mut summary: Vec<&str> = Vec::new();
    for line in output.lines() {
        let trimmed = line.trim_end();
        if trimmed.trim().is_empty() || summary.contains(&trimmed) {
            continue;
        }
        if SUMMARY_PATTERNS.iter().any(|re| re.is_match(trimmed)) {
            summary.push(trimmed);
            if summary.len() >= MAX_SUMMARY_LINES {
                break;
            }
        }
    }

    let mut details = if summary.is_empty() {
        let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(FALLBACK_TAIL_LINES);
        lines[start..].join("\n")
    } else {
        summary.join("\n")
    };

    if details.trim().is_empty() {
        details = format!("command exited with code {}; no output captured", record.exit_code);
    }
    if record.truncated {
        details.push_str("\n[output truncated]");
    }
    clip(&details, MAX_DETAILS_CHARS)
}

/// Return the first line (trimmed, clipped) containing any signature.
fn find_line(output: &str, signatures: &[&str]) -> Option<String> {
    output.lines().find_map(|line| {
        let lower = line.to_lowercase();
        signatures
            .iter()
            .any(|sig| lower.contains(sig))
            .then(|| clip(line.trim(), MAX_EVIDENCE_CHARS))
    })
}

/// Truncate to at most `max` characters on a char boundary.
fn clip(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
