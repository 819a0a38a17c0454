//! Usage: Session lifecycle state machine (the only writer of session state).
//!
//! ```text
//! Anonymous --login--> Authenticated --unauthorized--> Refreshing
//! Refreshing --refresh_succeeded--> Authenticated
//! Refreshing --refresh_failed--> Anonymous
//! Authenticated|Refreshing --logout--> Anonymous
//! ```
//!
//! Every login and logout bumps the session epoch. Refresh results and
//! request-driven logouts carry the epoch they started under and are dropped
//! if it moved on, so a logout during a refresh is never undone by that
//! refresh finishing, and a request from an old session never ends a new one.

use crate::domain::session::{Session, SessionStatus, UserIdentity};
use crate::gateway::observers::{SessionObservers, Subscription};
use crate::gateway::token_exchange::RefreshGrant;
use crate::gateway::token_store::TokenStore;
use crate::shared::error::{GatewayError, GatewayResult};
use crate::shared::mutex_ext::MutexExt;
use crate::shared::security::mask_token;
use std::sync::{Arc, Mutex};

/// Handed out by [`SessionStateMachine::unauthorized`]: the refresh token to
/// spend and the epoch the refresh belongs to.
#[derive(Clone, PartialEq, Eq)]
pub struct RefreshLease {
    pub(crate) epoch: u64,
    pub(crate) refresh_token: String,
}

impl RefreshLease {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl std::fmt::Debug for RefreshLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshLease")
            .field("epoch", &self.epoch)
            .field("refresh_token", &mask_token(&self.refresh_token))
            .finish()
    }
}

pub struct SessionStateMachine {
    store: Arc<TokenStore>,
    observers: SessionObservers,
    // Held for the whole transition. Notifications are queued under it and
    // delivered after it is released, so listeners see transitions in order
    // and may call back into the machine.
    epoch: Mutex<u64>,
}

impl SessionStateMachine {
    pub fn new(store: Arc<TokenStore>, observers: SessionObservers) -> Self {
        Self {
            store,
            observers,
            epoch: Mutex::new(0),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.store.status()
    }

    pub fn session(&self) -> Session {
        self.store.get()
    }

    pub fn epoch(&self) -> u64 {
        *self.epoch.lock_or_recover()
    }

    /// Epoch and session read together; no transition can fall in between.
    pub fn snapshot(&self) -> (u64, Session) {
        let epoch = self.epoch.lock_or_recover();
        (*epoch, self.store.get())
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn observers(&self) -> &SessionObservers {
        &self.observers
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(SessionStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.observers.subscribe(listener)
    }

    /// Run `apply` under the transition lock, then deliver what it queued.
    fn transition<R>(&self, apply: impl FnOnce(&mut u64) -> R) -> R {
        let result = {
            let mut epoch = self.epoch.lock_or_recover();
            apply(&mut epoch)
        };
        self.observers.flush();
        result
    }

    /// `* -> Authenticated`. Replaces any existing session.
    pub fn login(
        &self,
        access_token: String,
        refresh_token: Option<String>,
        user: Option<UserIdentity>,
    ) -> GatewayResult<Session> {
        let access_token = access_token.trim().to_string();
        if access_token.is_empty() {
            return Err(GatewayError::InvalidInput(
                "login requires a non-empty access token".to_string(),
            ));
        }
        let refresh_token = refresh_token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        let session = Session::signed_in(
            access_token,
            refresh_token,
            user,
            SessionStatus::Authenticated,
        );
        self.transition(|epoch| {
            *epoch += 1;
            self.store.set(session.clone());
            tracing::info!(
                epoch = *epoch,
                role = session.role().map(|r| r.as_str()).unwrap_or("-"),
                "session started"
            );
            self.observers.enqueue(SessionStatus::Authenticated);
        });
        Ok(session)
    }

    /// `Authenticated -> Refreshing` for the current session.
    ///
    /// `None` while anonymous (no transition: the 401 is the caller's problem).
    /// A session without a refresh token cannot be renewed and is torn down.
    pub fn unauthorized(&self) -> Option<RefreshLease> {
        self.transition(|epoch| self.lease(epoch, None))
    }

    /// As [`SessionStateMachine::unauthorized`], but only while `expected` is
    /// still the current epoch; a superseded session gets `None` and nothing
    /// changes.
    pub fn unauthorized_at(&self, expected: u64) -> Option<RefreshLease> {
        self.transition(|epoch| self.lease(epoch, Some(expected)))
    }

    fn lease(&self, epoch: &mut u64, expected: Option<u64>) -> Option<RefreshLease> {
        if expected.is_some_and(|e| e != *epoch) {
            return None;
        }
        let mut session = self.store.get();
        match session.status {
            SessionStatus::Anonymous => None,
            SessionStatus::Authenticated | SessionStatus::Refreshing => {
                let Some(refresh_token) = session.refresh_token.clone() else {
                    tracing::warn!(epoch = *epoch, "no refresh token; ending session");
                    self.teardown(epoch, "missing_refresh_token");
                    return None;
                };
                if session.status == SessionStatus::Authenticated {
                    session.status = SessionStatus::Refreshing;
                    self.store.set(session);
                    self.observers.enqueue(SessionStatus::Refreshing);
                }
                Some(RefreshLease {
                    epoch: *epoch,
                    refresh_token,
                })
            }
        }
    }

    /// `Refreshing -> Authenticated` with the new tokens. A rotated refresh
    /// token replaces the stored one. `false` when the lease is stale.
    pub fn refresh_succeeded(&self, lease: &RefreshLease, grant: &RefreshGrant) -> bool {
        self.transition(|epoch| {
            let current = self.store.get();
            if *epoch != lease.epoch || current.status != SessionStatus::Refreshing {
                tracing::info!(
                    lease_epoch = lease.epoch,
                    epoch = *epoch,
                    status = %current.status,
                    "discarding refresh result for a superseded session"
                );
                return false;
            }

            let access_token = grant.access_token.trim().to_string();
            if access_token.is_empty() {
                tracing::warn!(epoch = *epoch, "refresh returned an empty access token");
                self.teardown(epoch, "empty_access_token");
                return false;
            }
            let rotated = grant.refresh_token.is_some();
            let refresh_token = grant
                .refresh_token
                .clone()
                .or_else(|| current.refresh_token.clone());
            self.store.set(Session::signed_in(
                access_token,
                refresh_token,
                current.user,
                SessionStatus::Authenticated,
            ));
            tracing::info!(epoch = *epoch, rotated, "access token refreshed");
            self.observers.enqueue(SessionStatus::Authenticated);
            true
        })
    }

    /// `Refreshing -> Anonymous`. `false` when the lease is stale.
    pub fn refresh_failed(&self, lease: &RefreshLease) -> bool {
        self.logout_if(lease.epoch, "refresh_failed")
    }

    /// `Authenticated|Refreshing -> Anonymous`. Idempotent: `false` (and no
    /// notification) when already anonymous.
    pub fn logout(&self) -> bool {
        self.transition(|epoch| self.teardown(epoch, "logout"))
    }

    /// Logout on behalf of whoever holds `expected`: a no-op once the session
    /// it belonged to has already ended or been replaced.
    pub fn logout_if(&self, expected: u64, reason: &'static str) -> bool {
        self.transition(|epoch| {
            if *epoch != expected {
                tracing::debug!(
                    expected,
                    epoch = *epoch,
                    reason,
                    "ignoring logout for a superseded session"
                );
                return false;
            }
            self.teardown(epoch, reason)
        })
    }

    fn teardown(&self, epoch: &mut u64, reason: &'static str) -> bool {
        if self.store.status() == SessionStatus::Anonymous {
            return false;
        }
        *epoch += 1;
        // Tokens are gone before any listener hears about the logout.
        self.store.clear();
        tracing::info!(epoch = *epoch, reason, "session ended");
        self.observers.enqueue(SessionStatus::Anonymous);
        true
    }
}
