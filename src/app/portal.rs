//! Usage: Assembled session gateway (settings -> http client -> stores -> state machine -> refresh -> requests).

use crate::domain::session::{Role, Session, SessionStatus};
use crate::gateway::backend::{AuthBackend, HttpAuthBackend};
use crate::gateway::observers::{SessionObservers, Subscription};
use crate::gateway::refresh::RefreshCoordinator;
use crate::gateway::request::{ParsedResponse, RequestContext, RequestGateway, SendOptions};
use crate::gateway::state_machine::SessionStateMachine;
use crate::gateway::token_exchange::Credentials;
use crate::gateway::token_store::TokenStore;
use crate::infra::cookies::CookieJar;
use crate::infra::settings::{self, PortalSettings};
use crate::infra::storage::{JsonFileStore, KeyValueStore, MemoryStore};
use crate::shared::error::{AppError, AppResult, GatewayResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Token-presence check for route protection. It only looks at the route
/// cookie, like the middleware it stands in for.
#[derive(Clone)]
pub struct RouteGuard {
    store: Arc<TokenStore>,
}

impl RouteGuard {
    pub fn allows(&self) -> bool {
        self.store.route_cookie_present()
    }

    /// Presence plus a role check against the session snapshot.
    pub fn allows_role(&self, roles: &[Role]) -> bool {
        self.allows() && self.store.get().role().is_some_and(|r| roles.contains(&r))
    }
}

pub struct Portal {
    settings: PortalSettings,
    backend: Arc<dyn AuthBackend>,
    machine: Arc<SessionStateMachine>,
    gateway: RequestGateway,
    cookies: Arc<CookieJar>,
}

pub(crate) fn build_http_client(settings: &PortalSettings) -> AppResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder().user_agent(format!(
        "portal-session/{}",
        env!("CARGO_PKG_VERSION")
    ));
    if !settings.use_system_proxy {
        builder = builder.no_proxy();
    }
    builder
        .build()
        .map_err(|e| AppError::with_source("HTTP_CLIENT_INIT", "failed to build http client", e))
}

fn open_stores(
    settings: &PortalSettings,
) -> (Arc<dyn KeyValueStore>, Option<Arc<dyn KeyValueStore>>) {
    let primary: Arc<dyn KeyValueStore> = match settings.session_store_path.as_deref() {
        Some(path) => Arc::new(JsonFileStore::new(path)),
        None => Arc::new(MemoryStore::new()),
    };
    let legacy = settings
        .legacy_store_path
        .as_deref()
        .map(|path| Arc::new(JsonFileStore::new(path)) as Arc<dyn KeyValueStore>);
    (primary, legacy)
}

impl Portal {
    /// Build against the HTTP login/refresh endpoints named in `settings`.
    pub fn from_settings(settings: PortalSettings) -> AppResult<Self> {
        let settings = validated(settings)?;
        let client = build_http_client(&settings)?;
        let backend = Arc::new(HttpAuthBackend::new(client.clone(), &settings));
        Ok(Self::assemble(settings, client, backend))
    }

    /// Build with a custom authentication backend. Resource requests still go
    /// over HTTP to `settings.base_url`.
    pub fn with_backend(settings: PortalSettings, backend: Arc<dyn AuthBackend>) -> AppResult<Self> {
        let settings = validated(settings)?;
        let client = build_http_client(&settings)?;
        Ok(Self::assemble(settings, client, backend))
    }

    fn assemble(
        settings: PortalSettings,
        client: reqwest::Client,
        backend: Arc<dyn AuthBackend>,
    ) -> Self {
        let (primary, legacy) = open_stores(&settings);
        let cookies = Arc::new(CookieJar::new());
        let store = Arc::new(TokenStore::open(
            primary,
            legacy,
            Arc::clone(&cookies),
            settings.cookie_policy(),
        ));
        let machine = Arc::new(SessionStateMachine::new(store, SessionObservers::new()));
        let coordinator = Arc::new(RefreshCoordinator::new(
            Arc::clone(&machine),
            Arc::clone(&backend),
        ));
        let gateway = RequestGateway::new(client, &settings, coordinator);

        tracing::info!(
            base_url = %settings.base_url,
            status = %machine.status(),
            durable = settings.session_store_path.is_some(),
            "portal session ready"
        );
        Self {
            settings,
            backend,
            machine,
            gateway,
            cookies,
        }
    }

    pub fn settings(&self) -> &PortalSettings {
        &self.settings
    }

    pub fn session(&self) -> Session {
        self.machine.session()
    }

    pub fn status(&self) -> SessionStatus {
        self.machine.status()
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(SessionStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.machine.subscribe(listener)
    }

    pub fn route_guard(&self) -> RouteGuard {
        RouteGuard {
            store: Arc::clone(self.machine.store()),
        }
    }

    /// Cookies the host should mirror to the browser (`Set-Cookie` values).
    pub fn cookies(&self) -> &Arc<CookieJar> {
        &self.cookies
    }

    pub fn gateway(&self) -> &RequestGateway {
        &self.gateway
    }

    pub fn state_machine(&self) -> &Arc<SessionStateMachine> {
        &self.machine
    }

    /// Exchange credentials for a session. A rejected login leaves the current
    /// session as it was.
    pub async fn login(&self, credentials: &Credentials) -> GatewayResult<Session> {
        let grant = match self.backend.login(credentials).await {
            Ok(grant) => grant,
            Err(err) => {
                tracing::info!(username = %credentials.username, "login failed: {}", err);
                return Err(err);
            }
        };
        self.machine
            .login(grant.access_token, grant.refresh_token, grant.user)
    }

    /// `false` when there was no session to end.
    pub fn logout(&self) -> bool {
        self.machine.logout()
    }

    pub async fn send<F>(&self, factory: F, options: SendOptions) -> GatewayResult<ParsedResponse>
    where
        F: Fn(&RequestContext) -> reqwest::RequestBuilder,
    {
        self.gateway.send(factory, options).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> GatewayResult<T> {
        self.gateway.get_json(path).await
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> GatewayResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.gateway.post_json(path, body).await
    }
}

fn validated(mut settings: PortalSettings) -> AppResult<PortalSettings> {
    if settings::sanitize(&mut settings) {
        tracing::warn!("portal settings contained out-of-range values; using repaired copy");
    }
    settings::validate(&settings)?;
    Ok(settings)
}
