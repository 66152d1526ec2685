//! Request parameters and alias resolution.
//!
//! Every actuation route accepts either a GET query string or a POST JSON
//! object. Both are flattened into [`Params`], and field aliases
//! (`command`/`cmd`, `text`/`message`/`msg`, `duration`/`ms`) are resolved here
//! and nowhere else.

use axum::extract::{FromRequest, Query, Request};
use axum::http::Method;
use bytes::Bytes;
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

use crate::http::ApiError;

/// Default vibration length when none is given.
pub const DEFAULT_VIBRATE_MS: u64 = 500;

/// Default recording length when none is given.
pub const DEFAULT_LISTEN_SECS: u64 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("missing required field: {0}")]
    Missing(&'static str),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Flattened request parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(Map<String, Value>);

impl Params {
    pub fn from_query(query: HashMap<String, String>) -> Self {
        Self(query.into_iter().map(|(k, v)| (k, Value::String(v))).collect())
    }

    /// Parse a JSON body. Empty bodies are an empty object; anything but an
    /// object is rejected.
    pub fn from_json(body: &[u8]) -> Result<Self, ApiError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(map)) => Ok(Self(map)),
            Ok(_) => Err(ApiError::BadRequest("JSON body must be an object".to_string())),
            Err(e) => Err(ApiError::BadRequest(format!("malformed JSON: {e}"))),
        }
    }

    /// First present, non-empty string among `keys`.
    pub fn text(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|k| match self.0.get(*k)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    /// First present number among `keys`. Numeric strings are accepted.
    pub fn number(&self, field: &'static str, keys: &[&str]) -> Result<Option<f64>, RequestError> {
        let Some(v) = keys.iter().find_map(|k| self.0.get(*k).filter(|v| !v.is_null())) else {
            return Ok(None);
        };
        let n = match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) if s.trim().is_empty() => return Ok(None),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        match n {
            Some(n) if n.is_finite() && n >= 0.0 => Ok(Some(n)),
            _ => Err(RequestError::Invalid {
                field,
                reason: format!("expected a non-negative number, got {v}"),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

impl<S: Send + Sync> FromRequest<S> for Params {
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        if req.method() == Method::GET {
            let Query(query) = Query::<HashMap<String, String>>::try_from_uri(req.uri())
                .map_err(|e| ApiError::BadRequest(format!("invalid query string: {e}")))?;
            return Ok(Self::from_query(query));
        }
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::BadRequest(format!("unreadable body: {e}")))?;
        Self::from_json(&body)
    }
}

// ─── Typed requests ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ExecRequest {
    pub command: String,
    pub timeout_secs: Option<f64>,
}

impl ExecRequest {
    pub fn from_params(p: &Params) -> Result<Self, RequestError> {
        let command = p.text(&["command", "cmd"]).ok_or(RequestError::Missing("command"))?;
        let timeout_secs = p.number("timeout", &["timeout"])?;
        Ok(Self {
            command,
            timeout_secs,
        })
    }
}

/// Body of `/toast` and `/speak`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRequest {
    pub text: String,
}

impl TextRequest {
    pub fn from_params(p: &Params) -> Result<Self, RequestError> {
        let text = p.text(&["text", "message", "msg"]).ok_or(RequestError::Missing("text"))?;
        Ok(Self { text })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VibrateRequest {
    pub duration_ms: u64,
}

impl VibrateRequest {
    pub fn from_params(p: &Params) -> Result<Self, RequestError> {
        let duration_ms = p
            .number("duration", &["duration", "ms"])?
            .map_or(DEFAULT_VIBRATE_MS, |n| n.round() as u64);
        Ok(Self { duration_ms })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenRequest {
    pub duration_secs: u64,
}

impl ListenRequest {
    pub fn from_params(p: &Params) -> Result<Self, RequestError> {
        let duration_secs = p
            .number("duration", &["duration"])?
            .map_or(DEFAULT_LISTEN_SECS, |n| n.round() as u64);
        Ok(Self { duration_secs })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFileRequest {
    pub path: String,
    pub content: String,
}

impl WriteFileRequest {
    pub fn from_params(p: &Params) -> Result<Self, RequestError> {
        let path = p.text(&["path"]).ok_or(RequestError::Missing("path"))?;
        let content = match p.get("content") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => return Err(RequestError::Missing("content")),
            Some(other) => other.to_string(),
        };
        Ok(Self { path, content })
    }
}
