//! Usage: `AuthBackend` trait (login + refresh endpoints) and its reqwest implementation.
//!
//! The coordinator and the portal only talk to the authentication endpoints
//! through this trait, which keeps the refresh protocol swappable and lets the
//! single-flight logic be exercised without a network.

use crate::gateway::token_exchange::{
    request_login, request_refresh, Credentials, LoginGrant, RefreshGrant,
};
use crate::infra::settings::PortalSettings;
use crate::shared::error::GatewayResult;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = GatewayResult<T>> + Send + 'a>>;

pub trait AuthBackend: Send + Sync {
    /// Exchange credentials for a session. Rejections come back as
    /// `GatewayError::RequestFailed`.
    fn login<'a>(&'a self, credentials: &'a Credentials) -> BackendFuture<'a, LoginGrant>;

    /// Exchange a refresh token for a new access token. Rejections come back
    /// as `GatewayError::RefreshRejected`.
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BackendFuture<'a, RefreshGrant>;
}

#[derive(Debug, Clone)]
pub struct HttpAuthBackend {
    client: reqwest::Client,
    login_url: String,
    refresh_url: String,
    timeout: Duration,
}

impl HttpAuthBackend {
    pub fn new(client: reqwest::Client, settings: &PortalSettings) -> Self {
        Self {
            client,
            login_url: settings.endpoint_url(&settings.login_path),
            refresh_url: settings.endpoint_url(&settings.refresh_path),
            timeout: settings.standard_timeout(),
        }
    }

    pub fn login_url(&self) -> &str {
        &self.login_url
    }

    pub fn refresh_url(&self) -> &str {
        &self.refresh_url
    }
}

impl AuthBackend for HttpAuthBackend {
    fn login<'a>(&'a self, credentials: &'a Credentials) -> BackendFuture<'a, LoginGrant> {
        Box::pin(request_login(
            &self.client,
            &self.login_url,
            credentials,
            self.timeout,
        ))
    }

    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BackendFuture<'a, RefreshGrant> {
        Box::pin(request_refresh(
            &self.client,
            &self.refresh_url,
            refresh_token,
            self.timeout,
        ))
    }
}
