//! Usage: Login and refresh endpoint helpers (request bodies, response parsing, error details).

use crate::domain::session::UserIdentity;
use crate::shared::error::{body_snippet, GatewayError, GatewayResult};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

#[derive(Clone, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// What the login endpoint hands back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub user: Option<UserIdentity>,
}

/// What the refresh endpoint hands back. `refresh_token` is set when the
/// backend rotated it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

pub(crate) async fn request_login(
    client: &reqwest::Client,
    url: &str,
    credentials: &Credentials,
    timeout: Duration,
) -> GatewayResult<LoginGrant> {
    if credentials.username.trim().is_empty() || credentials.password.is_empty() {
        return Err(GatewayError::InvalidInput(
            "username and password are required".to_string(),
        ));
    }

    let response = client
        .post(url)
        .timeout(timeout)
        .json(credentials)
        .send()
        .await
        .map_err(|e| GatewayError::transport("login request failed", e))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| GatewayError::transport("login response read failed", e))?;

    if !status.is_success() {
        tracing::info!(
            status = status.as_u16(),
            body = %body_snippet(&body),
            "login rejected"
        );
        return Err(GatewayError::RequestFailed {
            status: status.as_u16(),
            body,
        });
    }

    parse_login_response(&body)
}

pub(crate) async fn request_refresh(
    client: &reqwest::Client,
    url: &str,
    refresh_token: &str,
    timeout: Duration,
) -> GatewayResult<RefreshGrant> {
    let response = client
        .post(url)
        .timeout(timeout)
        .json(&serde_json::json!({ "refresh": refresh_token.trim() }))
        .send()
        .await
        .map_err(|e| GatewayError::transport("refresh request failed", e))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| GatewayError::transport("refresh response read failed", e))?;

    if !status.is_success() {
        let (code, message) = parse_error_details(&body);
        let rotated = is_refresh_token_rotated_error(code.as_deref(), message.as_deref());
        tracing::debug!(
            status = status.as_u16(),
            code = code.as_deref().unwrap_or("-"),
            rotated,
            body = %body_snippet(&body),
            "refresh endpoint rejected token"
        );
        return Err(GatewayError::RefreshRejected {
            status: status.as_u16(),
            code,
            rotated,
        });
    }

    parse_refresh_response(&body)
}

fn non_empty_str(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        value
            .get(*key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    })
}

fn parse_json_object(body: &str, what: &str) -> GatewayResult<Value> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| GatewayError::InvalidResponse(format!("{what} response json invalid: {e}")))?;
    if !value.is_object() {
        return Err(GatewayError::InvalidResponse(format!(
            "{what} response is not a json object"
        )));
    }
    Ok(value)
}

pub(crate) fn parse_login_response(body: &str) -> GatewayResult<LoginGrant> {
    let value = parse_json_object(body, "login")?;

    let access_token = non_empty_str(&value, &["access", "access_token"]).ok_or_else(|| {
        GatewayError::InvalidResponse("login response missing access token".to_string())
    })?;
    let refresh_token = non_empty_str(&value, &["refresh", "refresh_token"]);

    let user = match value.get("user") {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => {
            let mut map = map.clone();
            // Some deployments return the role next to the user instead of inside it.
            if !map.contains_key("role") {
                if let Some(role) = value.get("role").cloned() {
                    map.insert("role".to_string(), role);
                }
            }
            let user: UserIdentity = serde_json::from_value(Value::Object(map)).map_err(|e| {
                GatewayError::InvalidResponse(format!("login response user invalid: {e}"))
            })?;
            Some(user)
        }
        Some(_) => {
            return Err(GatewayError::InvalidResponse(
                "login response user is not an object".to_string(),
            ))
        }
    };

    Ok(LoginGrant {
        access_token,
        refresh_token,
        user,
    })
}

pub(crate) fn parse_refresh_response(body: &str) -> GatewayResult<RefreshGrant> {
    let value = parse_json_object(body, "refresh")?;

    let access_token = non_empty_str(&value, &["access", "access_token"]).ok_or_else(|| {
        GatewayError::InvalidResponse("refresh response missing access token".to_string())
    })?;

    Ok(RefreshGrant {
        access_token,
        refresh_token: non_empty_str(&value, &["refresh", "refresh_token"]),
    })
}

/// `(code, message)` from the usual error payload shapes:
/// `{detail, code}`, `{error, error_description}`, `{error: {code|type, message}}`.
pub(crate) fn parse_error_details(body: &str) -> (Option<String>, Option<String>) {
    let value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return (None, None),
    };

    let mut code = non_empty_str(&value, &["code"]);
    let mut message = non_empty_str(&value, &["detail", "error_description", "message"]);

    if let Some(error_value) = value.get("error") {
        if let Some(err_str) = error_value.as_str() {
            if code.is_none() {
                code = Some(err_str.trim().to_string()).filter(|v| !v.is_empty());
            }
        } else if error_value.is_object() {
            if code.is_none() {
                code = non_empty_str(error_value, &["code", "type"]);
            }
            if message.is_none() {
                message = non_empty_str(error_value, &["message", "detail"]);
            }
        }
    }

    (code, message)
}

/// The backend signals a refresh token that was already rotated or blacklisted.
pub(crate) fn is_refresh_token_rotated_error(code: Option<&str>, message: Option<&str>) -> bool {
    let code_hit = code.map(str::trim).is_some_and(|v| {
        v.eq_ignore_ascii_case("refresh_token_reused")
            || v.eq_ignore_ascii_case("token_blacklisted")
    });
    if code_hit {
        return true;
    }
    message.map(str::to_ascii_lowercase).is_some_and(|v| {
        v.contains("blacklisted") || v.contains("has already been used")
    })
}
