//! Shared test helpers for the gateway modules.

use crate::domain::session::{Role, SessionStatus, UserIdentity};
use crate::gateway::backend::{AuthBackend, BackendFuture};
use crate::gateway::state_machine::SessionStateMachine;
use crate::gateway::token_exchange::{Credentials, LoginGrant, RefreshGrant};
use crate::gateway::token_store::TokenStore;
use crate::gateway::observers::{SessionObservers, Subscription};
use crate::infra::cookies::{CookieJar, CookiePolicy};
use crate::infra::storage::MemoryStore;
use crate::shared::error::{GatewayError, GatewayResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

pub(crate) fn student() -> UserIdentity {
    UserIdentity {
        id: "7".to_string(),
        role: Role::Student,
        display_name: "Ada".to_string(),
    }
}

pub(crate) struct MachineFixture {
    pub(crate) primary: Arc<MemoryStore>,
    pub(crate) cookies: Arc<CookieJar>,
    pub(crate) machine: Arc<SessionStateMachine>,
}

pub(crate) fn machine_fixture() -> MachineFixture {
    let primary = Arc::new(MemoryStore::new());
    let cookies = Arc::new(CookieJar::new());
    let store = Arc::new(TokenStore::open(
        primary.clone(),
        None,
        cookies.clone(),
        CookiePolicy::default(),
    ));
    let machine = Arc::new(SessionStateMachine::new(store, SessionObservers::new()));
    MachineFixture {
        primary,
        cookies,
        machine,
    }
}

pub(crate) fn signed_in_fixture(access: &str, refresh: &str) -> MachineFixture {
    let fx = machine_fixture();
    fx.machine
        .login(access.to_string(), Some(refresh.to_string()), Some(student()))
        .expect("login");
    fx
}

/// Collects every status a listener receives.
pub(crate) fn record_statuses(
    machine: &SessionStateMachine,
) -> (Subscription, Arc<Mutex<Vec<SessionStatus>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let sub = machine.subscribe(move |status| sink.lock().unwrap().push(status));
    (sub, seen)
}

/// Scripted refresh endpoint. Replies are consumed in order; every call waits
/// for a permit on `gate` first so tests can pile up callers mid-refresh.
pub(crate) struct FakeBackend {
    replies: Mutex<VecDeque<GatewayResult<RefreshGrant>>>,
    pub(crate) refresh_calls: AtomicUsize,
    pub(crate) seen_refresh_tokens: Mutex<Vec<String>>,
    pub(crate) gate: Semaphore,
}

impl FakeBackend {
    pub(crate) fn new(replies: Vec<GatewayResult<RefreshGrant>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            refresh_calls: AtomicUsize::new(0),
            seen_refresh_tokens: Mutex::new(Vec::new()),
            gate: Semaphore::new(Semaphore::MAX_PERMITS),
        })
    }

    /// Backend whose refresh calls block until [`FakeBackend::open_gate`].
    pub(crate) fn gated(replies: Vec<GatewayResult<RefreshGrant>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            refresh_calls: AtomicUsize::new(0),
            seen_refresh_tokens: Mutex::new(Vec::new()),
            gate: Semaphore::new(0),
        })
    }

    pub(crate) fn open_gate(&self) {
        self.gate.add_permits(1024);
    }

    pub(crate) fn calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

pub(crate) fn granted(access: &str) -> GatewayResult<RefreshGrant> {
    Ok(RefreshGrant {
        access_token: access.to_string(),
        refresh_token: None,
    })
}

pub(crate) fn rejected(rotated: bool) -> GatewayResult<RefreshGrant> {
    Err(GatewayError::RefreshRejected {
        status: 401,
        code: Some(if rotated { "token_blacklisted" } else { "token_not_valid" }.to_string()),
        rotated,
    })
}

impl AuthBackend for FakeBackend {
    fn login<'a>(&'a self, credentials: &'a Credentials) -> BackendFuture<'a, LoginGrant> {
        Box::pin(async move {
            Ok(LoginGrant {
                access_token: format!("A-{}", credentials.username),
                refresh_token: Some("R1".to_string()),
                user: Some(student()),
            })
        })
    }

    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BackendFuture<'a, RefreshGrant> {
        Box::pin(async move {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.seen_refresh_tokens
                .lock()
                .unwrap()
                .push(refresh_token.to_string());
            let _permit = self.gate.acquire().await.expect("gate open");
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| rejected(false))
        })
    }
}
