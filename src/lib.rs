//! Session & request gateway for the education portal REST API.
//!
//! Feature code sends requests through [`Portal::send`] (or the JSON helpers);
//! the gateway attaches the access token, refreshes it once on a 401 with a
//! single shared refresh per process, retries once, and ends the session when
//! the refresh fails. UI layers follow the session through
//! [`Portal::subscribe`] and [`RouteGuard`].

mod app;
mod domain;
mod gateway;
mod infra;
mod shared;

pub use app::logging::{init as init_logging, LoggingGuard};
pub use app::portal::{Portal, RouteGuard};
pub use domain::session::{Role, Session, SessionStatus, UserIdentity};
pub use gateway::backend::{AuthBackend, BackendFuture, HttpAuthBackend};
pub use gateway::observers::{SessionListener, SessionObservers, Subscription};
pub use gateway::refresh::RefreshCoordinator;
pub use gateway::request::{
    ParsedResponse, RequestContext, RequestGateway, SendOptions, TimeoutProfile, MAX_AUTH_RETRIES,
};
pub use gateway::state_machine::{RefreshLease, SessionStateMachine};
pub use gateway::token_exchange::{Credentials, LoginGrant, RefreshGrant};
pub use gateway::token_store::{
    TokenStore, KEY_ACCESS_TOKEN, KEY_REFRESH_TOKEN, KEY_ROLE, KEY_USER,
};
pub use infra::cookies::{Cookie, CookieJar, CookiePolicy, SameSite};
pub use infra::storage::{JsonFileStore, KeyValueStore, MemoryStore};
pub use shared::error::{AppError, AppResult, GatewayError, GatewayResult};

/// Settings file schema and its read/write helpers.
pub mod config {
    pub use crate::infra::settings::{
        read, sanitize, validate, write, PortalSettings, DEFAULT_BASE_URL,
        DEFAULT_COOKIE_MAX_AGE_SECONDS, DEFAULT_COOKIE_NAME, DEFAULT_LOGIN_PATH,
        DEFAULT_LONG_RUNNING_TIMEOUT_SECONDS, DEFAULT_REFRESH_LEAD_SECONDS,
        DEFAULT_REFRESH_PATH, DEFAULT_STANDARD_TIMEOUT_SECONDS, SCHEMA_VERSION,
    };
}

pub use config::PortalSettings;
