//! Usage: Authenticated request entry point (bearer attach, 401 -> refresh -> one retry, logout on terminal failure).

use crate::domain::session::SessionStatus;
use crate::gateway::claims::{access_token_expires_at, should_refresh_now};
use crate::gateway::refresh::RefreshCoordinator;
use crate::infra::settings::{join_url, PortalSettings};
use crate::shared::error::{body_snippet, GatewayError, GatewayResult};
use crate::shared::time::now_unix_seconds;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A request is retried at most this many times after a 401.
pub const MAX_AUTH_RETRIES: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutProfile {
    #[default]
    Standard,
    LongRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    pub max_retries: u8,
    pub timeout: TimeoutProfile,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            max_retries: MAX_AUTH_RETRIES,
            timeout: TimeoutProfile::Standard,
        }
    }
}

impl SendOptions {
    pub fn long_running() -> Self {
        Self {
            timeout: TimeoutProfile::LongRunning,
            ..Self::default()
        }
    }

    /// Fail with `SessionExpired` on the first 401 instead of refreshing.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// One caller's outstanding call, tied to the session it started under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingRequest {
    pub(crate) id: u64,
    pub(crate) epoch: u64,
    pub(crate) retries_remaining: u8,
    pub(crate) refresh_used: bool,
}

impl PendingRequest {
    pub(crate) fn new(id: u64, epoch: u64, max_retries: u8) -> Self {
        Self {
            id,
            epoch,
            retries_remaining: max_retries.min(MAX_AUTH_RETRIES),
            refresh_used: false,
        }
    }

    /// Whether a 401 may still be answered with a refresh and a retry.
    pub(crate) fn can_retry_after_refresh(&self) -> bool {
        self.retries_remaining > 0 && !self.refresh_used
    }
}

/// Handed to request factories: the shared client and base URL. The gateway
/// adds the bearer token and the timeout to whatever the factory builds.
#[derive(Debug, Clone)]
pub struct RequestContext {
    client: reqwest::Client,
    base_url: String,
}

impl RequestContext {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `path` relative to the base URL; absolute URLs pass through.
    pub fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    pub fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client.request(method, self.url(path))
    }

    pub fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(Method::PUT, path)
    }

    pub fn patch(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(Method::PATCH, path)
    }

    pub fn delete(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(Method::DELETE, path)
    }
}

/// A successful (2xx) response with its body fully read.
#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ParsedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> GatewayResult<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            GatewayError::InvalidResponse(format!(
                "status={} json decode failed: {e}; body={}",
                self.status,
                body_snippet(&self.text())
            ))
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

pub struct RequestGateway {
    context: RequestContext,
    coordinator: Arc<RefreshCoordinator>,
    standard_timeout: Duration,
    long_running_timeout: Duration,
    refresh_lead_seconds: i64,
    next_request: AtomicU64,
}

impl RequestGateway {
    pub fn new(
        client: reqwest::Client,
        settings: &PortalSettings,
        coordinator: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            context: RequestContext::new(client, settings.base_url.trim()),
            coordinator,
            standard_timeout: settings.standard_timeout(),
            long_running_timeout: settings.long_running_timeout(),
            refresh_lead_seconds: i64::from(settings.refresh_lead_seconds),
            next_request: AtomicU64::new(0),
        }
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    fn timeout_for(&self, profile: TimeoutProfile) -> Duration {
        match profile {
            TimeoutProfile::Standard => self.standard_timeout,
            TimeoutProfile::LongRunning => self.long_running_timeout,
        }
    }

    fn expires_soon(&self, token: &str) -> bool {
        self.refresh_lead_seconds > 0
            && should_refresh_now(
                access_token_expires_at(token),
                self.refresh_lead_seconds,
                now_unix_seconds(),
            )
    }

    /// End the request's session and report it as expired. A session that
    /// already ended or was replaced by a newer login is left alone.
    fn expire(&self, pending: &PendingRequest, reason: &'static str) -> GatewayError {
        if self.coordinator.machine().logout_if(pending.epoch, reason) {
            tracing::info!(request = pending.id, reason, "request ended the session");
        }
        GatewayError::SessionExpired
    }

    /// Token to send with before the first attempt. Joining a refresh that is
    /// already running, or refreshing ahead of expiry, uses up the request's
    /// one refresh.
    async fn initial_token(&self, pending: &mut PendingRequest) -> GatewayResult<String> {
        let (epoch, session) = self.coordinator.machine().snapshot();
        pending.epoch = epoch;
        let token = match session.status {
            SessionStatus::Anonymous => return Err(GatewayError::Unauthenticated),
            SessionStatus::Refreshing => {
                pending.refresh_used = true;
                tracing::debug!(request = pending.id, "waiting for in-flight refresh");
                match self.coordinator.await_in_flight_for(epoch).await {
                    Some(token) => token,
                    None => return Err(self.expire(pending, "refresh_failed_before_send")),
                }
            }
            SessionStatus::Authenticated => match session.access_token {
                Some(token) => token,
                None => return Err(GatewayError::Unauthenticated),
            },
        };

        if pending.refresh_used || !self.expires_soon(&token) {
            return Ok(token);
        }
        pending.refresh_used = true;
        tracing::debug!(request = pending.id, "access token about to expire; refreshing first");
        match self.coordinator.refresh_stale_for(pending.epoch, &token).await {
            Some(token) => Ok(token),
            None => Err(self.expire(pending, "proactive_refresh_failed")),
        }
    }

    /// Send an authenticated request built by `factory`.
    ///
    /// The factory runs once per attempt, so a retry after a refresh is
    /// rebuilt with the new token. One call makes at most two requests to the
    /// resource and causes at most one refresh.
    pub async fn send<F>(&self, factory: F, options: SendOptions) -> GatewayResult<ParsedResponse>
    where
        F: Fn(&RequestContext) -> reqwest::RequestBuilder,
    {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed) + 1;
        let mut pending = PendingRequest::new(id, 0, options.max_retries);
        let timeout = self.timeout_for(options.timeout);
        let mut token = self.initial_token(&mut pending).await?;

        loop {
            let response = factory(&self.context)
                .bearer_auth(&token)
                .timeout(timeout)
                .send()
                .await;
            let response = match response {
                Ok(response) => response,
                Err(err) if err.is_builder() => {
                    return Err(GatewayError::InvalidInput(format!("request build failed: {err}")))
                }
                Err(err) => {
                    let err = GatewayError::transport("request failed", err);
                    tracing::warn!(request = id, timed_out = err.is_timeout(), "{}", err);
                    return Err(err);
                }
            };

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                if self.coordinator.machine().status() == SessionStatus::Anonymous {
                    tracing::debug!(request = id, "401 after the session already ended");
                    return Err(GatewayError::Unauthenticated);
                }
                if !pending.can_retry_after_refresh() {
                    return Err(self.expire(&pending, "unauthorized_after_refresh"));
                }
                pending.refresh_used = true;
                tracing::debug!(request = id, "401; asking for a fresh access token");
                match self
                    .coordinator
                    .refresh_stale_for(pending.epoch, &token)
                    .await
                {
                    Some(fresh) => {
                        token = fresh;
                        pending.retries_remaining -= 1;
                        continue;
                    }
                    None => return Err(self.expire(&pending, "refresh_failed")),
                }
            }

            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(|err| {
                let err = GatewayError::transport("response read failed", err);
                tracing::warn!(request = id, timed_out = err.is_timeout(), "{}", err);
                err
            })?;

            if !status.is_success() {
                let body = String::from_utf8_lossy(&body).into_owned();
                tracing::debug!(
                    request = id,
                    status = status.as_u16(),
                    body = %body_snippet(&body),
                    "request failed"
                );
                return Err(GatewayError::RequestFailed {
                    status: status.as_u16(),
                    body,
                });
            }

            return Ok(ParsedResponse {
                status: status.as_u16(),
                headers,
                body,
            });
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> GatewayResult<T> {
        self.send(|ctx| ctx.get(path), SendOptions::default())
            .await?
            .json()
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> GatewayResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send_json(Method::POST, path, body, SendOptions::default())
            .await
    }

    pub async fn send_json<B, T>(
        &self,
        method: Method,
        path: &str,
        body: &B,
        options: SendOptions,
    ) -> GatewayResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(|ctx| ctx.request(method.clone(), path).json(body), options)
            .await?
            .json()
    }
}
