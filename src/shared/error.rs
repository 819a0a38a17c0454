//! Usage: Error model (infra `CODE: message` errors + the gateway failure taxonomy).

use crate::shared::security::mask_token;
use std::sync::Arc;

pub type AppResult<T> = Result<T, AppError>;

pub type GatewayResult<T> = Result<T, GatewayError>;

const ERROR_BODY_SNIPPET_MAX_CHARS: usize = 240;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct AppError {
    code: String,
    message: String,
    #[source]
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        code: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

fn split_code_message(raw: &str) -> Option<(&str, &str)> {
    let msg = raw.trim();
    let msg = msg.strip_prefix("Error:").unwrap_or(msg).trim();
    if msg.is_empty() {
        return None;
    }

    let (maybe_code, rest) = msg.split_once(':')?;
    let code = maybe_code.trim();
    let mut chars = code.chars();
    let first = chars.next()?;
    if !first.is_ascii_uppercase() {
        return None;
    }
    if !chars.all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit() || ch == '_') {
        return None;
    }
    Some((code, rest.trim()))
}

impl From<String> for AppError {
    fn from(value: String) -> Self {
        if let Some((code, rest)) = split_code_message(&value) {
            let message = if rest.is_empty() { value.trim() } else { rest };
            return AppError::new(code.to_string(), message.to_string());
        }
        AppError::new("INTERNAL_ERROR", value)
    }
}

impl From<&'static str> for AppError {
    fn from(value: &'static str) -> Self {
        AppError::from(value.to_string())
    }
}

/// Outcome taxonomy of every call that goes through the gateway.
///
/// `Unauthenticated` means there is no session to send with. `SessionExpired`
/// means the request's own session is over: it was logged out, unless a newer
/// login had already replaced it, in which case the newer session is kept.
/// `RequestFailed` and `Transport` leave the session intact.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("AUTH_UNAUTHENTICATED: no active session")]
    Unauthenticated,
    #[error("AUTH_SESSION_EXPIRED: session expired, sign in again")]
    SessionExpired,
    #[error("REQUEST_FAILED: status={status} body={}", body_snippet(.body))]
    RequestFailed { status: u16, body: String },
    #[error("TRANSPORT_ERROR: {message}")]
    Transport { message: String, timed_out: bool },
    #[error("AUTH_REFRESH_REJECTED: status={status} code={} rotated={rotated}", .code.as_deref().unwrap_or("-"))]
    RefreshRejected {
        status: u16,
        code: Option<String>,
        rotated: bool,
    },
    #[error("INVALID_RESPONSE: {0}")]
    InvalidResponse(String),
    #[error("SEC_INVALID_INPUT: {0}")]
    InvalidInput(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthenticated => "AUTH_UNAUTHENTICATED",
            GatewayError::SessionExpired => "AUTH_SESSION_EXPIRED",
            GatewayError::RequestFailed { .. } => "REQUEST_FAILED",
            GatewayError::Transport { .. } => "TRANSPORT_ERROR",
            GatewayError::RefreshRejected { .. } => "AUTH_REFRESH_REJECTED",
            GatewayError::InvalidResponse(_) => "INVALID_RESPONSE",
            GatewayError::InvalidInput(_) => "SEC_INVALID_INPUT",
        }
    }

    /// True for failures that ended the session.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::Unauthenticated | GatewayError::SessionExpired
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::RequestFailed { status, .. }
            | GatewayError::RefreshRejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, GatewayError::Transport { timed_out: true, .. })
    }

    pub(crate) fn transport(context: &str, err: reqwest::Error) -> Self {
        GatewayError::Transport {
            message: format!("{context}: {err}"),
            timed_out: err.is_timeout(),
        }
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let key_lc = key.trim().to_ascii_lowercase();
    key_lc.contains("token")
        || key_lc.contains("secret")
        || key_lc.contains("password")
        || key_lc == "access"
        || key_lc == "refresh"
        || key_lc == "authorization"
}

fn redact_sensitive_json_fields(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, nested) in map {
                if is_sensitive_key(key) {
                    if let Some(raw) = nested.as_str() {
                        *nested = serde_json::Value::String(mask_token(raw));
                        continue;
                    }
                }
                redact_sensitive_json_fields(nested);
            }
        }
        serde_json::Value::Array(items) => {
            for nested in items {
                redact_sensitive_json_fields(nested);
            }
        }
        _ => {}
    }
}

/// Truncated body text safe to log: JSON token fields are masked.
pub(crate) fn body_snippet(body: &str) -> String {
    if let Ok(mut value) = serde_json::from_str::<serde_json::Value>(body) {
        redact_sensitive_json_fields(&mut value);
        if let Ok(encoded) = serde_json::to_string(&value) {
            return encoded.chars().take(ERROR_BODY_SNIPPET_MAX_CHARS).collect();
        }
    }
    body.chars().take(ERROR_BODY_SNIPPET_MAX_CHARS).collect()
}
