//! Shared-secret gate.
//!
//! The secret may arrive in any of these places, checked in order:
//! 1. `Authorization: <secret>`
//! 2. `Authorization: Bearer <secret>`
//! 3. `X-Auth: <secret>`
//! 4. query parameter `auth` or `token`
//! 5. JSON body field `auth` or `token`
//!
//! A request is authorized when any presented candidate matches. An empty
//! configured secret authorizes nothing.

use axum::http::{HeaderMap, Method, header::AUTHORIZATION};
use serde_json::Value;
use std::collections::HashMap;

pub const X_AUTH: &str = "x-auth";

const CREDENTIAL_KEYS: [&str; 2] = ["auth", "token"];

/// Paths reachable without the secret.
pub fn is_exempt(method: &Method, path: &str) -> bool {
    method == Method::OPTIONS || path == "/health"
}

/// Constant-time comparison against the configured secret.
pub fn secret_matches(expected: &str, presented: &str) -> bool {
    if expected.is_empty() || expected.len() != presented.len() {
        return false;
    }
    expected
        .bytes()
        .zip(presented.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Candidate secrets carried in the headers.
pub fn header_candidates(headers: &HeaderMap) -> Vec<&str> {
    let mut out = Vec::new();
    if let Some(raw) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        let raw = raw.trim();
        out.push(raw);
        if let Some(token) = strip_bearer(raw) {
            out.push(token);
        }
    }
    if let Some(x) = headers.get(X_AUTH).and_then(|v| v.to_str().ok()) {
        out.push(x.trim());
    }
    out
}

fn strip_bearer(raw: &str) -> Option<&str> {
    let (scheme, rest) = raw.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| rest.trim())
}

/// Candidate secrets from query parameters.
pub fn query_candidates(query: &HashMap<String, String>) -> Vec<&str> {
    CREDENTIAL_KEYS
        .iter()
        .filter_map(|k| query.get(*k).map(String::as_str))
        .collect()
}

/// Candidate secrets from a JSON object body.
pub fn body_candidates(body: &Value) -> Vec<&str> {
    CREDENTIAL_KEYS
        .iter()
        .filter_map(|k| body.get(*k).and_then(Value::as_str))
        .collect()
}

pub fn any_matches<'a, I>(expected: &str, candidates: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    candidates.into_iter().any(|c| secret_matches(expected, c))
}
