//! Usage: Single-flight access token refresh shared by every request in the process.
//!
//! The first caller that needs a refresh spawns it and memoizes a ticket; later
//! callers subscribe to the same ticket until it settles. The refresh runs on
//! its own task, so a caller dropping its future does not cancel it for others.

use crate::domain::session::{Session, SessionStatus};
use crate::gateway::backend::AuthBackend;
use crate::gateway::state_machine::{RefreshLease, SessionStateMachine};
use crate::shared::error::GatewayError;
use crate::shared::mutex_ext::MutexExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// `None` until the refresh settles, then `Some(new access token or None)`.
type RefreshOutcome = Option<Option<String>>;

#[derive(Clone)]
struct RefreshTicket {
    id: u64,
    lease: RefreshLease,
    rx: watch::Receiver<RefreshOutcome>,
}

impl RefreshTicket {
    /// The task ended without publishing (panicked or was aborted).
    fn is_abandoned(&self) -> bool {
        self.rx.has_changed().is_err()
    }
}

enum Joined {
    Ready(Option<String>),
    Waiting(RefreshTicket),
}

pub struct RefreshCoordinator {
    machine: Arc<SessionStateMachine>,
    backend: Arc<dyn AuthBackend>,
    in_flight: Arc<Mutex<Option<RefreshTicket>>>,
    next_ticket: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(machine: Arc<SessionStateMachine>, backend: Arc<dyn AuthBackend>) -> Self {
        Self {
            machine,
            backend,
            in_flight: Arc::new(Mutex::new(None)),
            next_ticket: AtomicU64::new(0),
        }
    }

    pub fn machine(&self) -> &Arc<SessionStateMachine> {
        &self.machine
    }

    pub fn is_refreshing(&self) -> bool {
        self.live_ticket().is_some()
    }

    /// Start a refresh, or join the one already running. Resolves to the new
    /// access token, or `None` once the session has been torn down.
    pub async fn refresh(&self) -> Option<String> {
        self.settle(self.join_or_start(None, None)).await
    }

    /// Like [`RefreshCoordinator::refresh`], but when nothing is running and
    /// the current token already differs from `stale_access`, that token is
    /// returned without a network call.
    pub async fn refresh_stale(&self, stale_access: &str) -> Option<String> {
        self.settle(self.join_or_start(Some(stale_access), None)).await
    }

    /// [`RefreshCoordinator::refresh_stale`] on behalf of a caller that
    /// started under session `epoch`. Once that session has ended or been
    /// replaced this is `None`, and neither a refresh nor the newer session's
    /// token is handed out.
    pub async fn refresh_stale_for(&self, epoch: u64, stale_access: &str) -> Option<String> {
        self.settle(self.join_or_start(Some(stale_access), Some(epoch)))
            .await
    }

    /// Wait for a running refresh without starting one. With nothing running
    /// this is the current token while authenticated, `None` otherwise.
    pub async fn await_in_flight(&self) -> Option<String> {
        let (epoch, _) = self.machine.snapshot();
        self.await_in_flight_for(epoch).await
    }

    /// [`RefreshCoordinator::await_in_flight`] limited to session `epoch`.
    pub async fn await_in_flight_for(&self, epoch: u64) -> Option<String> {
        let ticket = {
            let mut slot = self.in_flight.lock_or_recover();
            let (current, session) = self.machine.snapshot();
            if current != epoch {
                return None;
            }
            match self.take_live(&mut slot, current) {
                Some(ticket) => ticket,
                None => return access_if_authenticated(session),
            }
        };
        self.wait(ticket).await
    }

    async fn settle(&self, joined: Joined) -> Option<String> {
        match joined {
            Joined::Ready(token) => token,
            Joined::Waiting(ticket) => self.wait(ticket).await,
        }
    }

    fn live_ticket(&self) -> Option<RefreshTicket> {
        let mut slot = self.in_flight.lock_or_recover();
        let epoch = self.machine.epoch();
        self.take_live(&mut slot, epoch)
    }

    /// The slot's ticket if it belongs to session `epoch` and its task is
    /// alive; anything else is dropped from the slot.
    fn take_live(&self, slot: &mut Option<RefreshTicket>, epoch: u64) -> Option<RefreshTicket> {
        let ticket = slot.as_ref()?;
        if ticket.lease.epoch() == epoch && !ticket.is_abandoned() {
            return Some(ticket.clone());
        }
        tracing::debug!(ticket = ticket.id, "dropping superseded refresh ticket");
        *slot = None;
        None
    }

    fn join_or_start(&self, stale_access: Option<&str>, expected_epoch: Option<u64>) -> Joined {
        let mut slot = self.in_flight.lock_or_recover();
        let (epoch, session) = self.machine.snapshot();
        if expected_epoch.is_some_and(|expected| expected != epoch) {
            tracing::debug!(epoch, "caller's session has ended; not refreshing");
            return Joined::Ready(None);
        }
        if let Some(ticket) = self.take_live(&mut slot, epoch) {
            tracing::debug!(ticket = ticket.id, "joining in-flight refresh");
            return Joined::Waiting(ticket);
        }

        if let Some(stale) = stale_access {
            if let Some(current) = access_if_authenticated(session) {
                if current != stale {
                    return Joined::Ready(Some(current));
                }
            }
        }

        let Some(lease) = self.machine.unauthorized_at(epoch) else {
            return Joined::Ready(None);
        };

        let id = self.next_ticket.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = watch::channel(None);
        let ticket = RefreshTicket {
            id,
            lease: lease.clone(),
            rx,
        };
        *slot = Some(ticket.clone());
        drop(slot);

        tracing::info!(ticket = id, epoch = lease.epoch(), "access token refresh started");
        tokio::spawn(run_refresh(
            Arc::clone(&self.machine),
            Arc::clone(&self.backend),
            Arc::clone(&self.in_flight),
            id,
            lease,
            tx,
        ));
        Joined::Waiting(ticket)
    }

    async fn wait(&self, mut ticket: RefreshTicket) -> Option<String> {
        match ticket.rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().flatten(),
            Err(_) => {
                tracing::error!(ticket = ticket.id, "refresh task ended without a result");
                self.machine.refresh_failed(&ticket.lease);
                None
            }
        }
    }
}

async fn run_refresh(
    machine: Arc<SessionStateMachine>,
    backend: Arc<dyn AuthBackend>,
    in_flight: Arc<Mutex<Option<RefreshTicket>>>,
    id: u64,
    lease: RefreshLease,
    tx: watch::Sender<RefreshOutcome>,
) {
    let result = backend.refresh(&lease.refresh_token).await;

    // The session is updated before the ticket goes away, so nobody can see
    // an empty slot while the status still says Refreshing.
    let outcome = {
        let mut slot = in_flight.lock_or_recover();
        let outcome = match result {
            Ok(grant) => {
                if machine.refresh_succeeded(&lease, &grant) {
                    Some(grant.access_token.trim().to_string())
                } else {
                    None
                }
            }
            Err(err) => {
                match &err {
                    GatewayError::RefreshRejected { rotated: true, .. } => tracing::warn!(
                        ticket = id,
                        "refresh token was already rotated or revoked; ending session: {}",
                        err
                    ),
                    _ => tracing::warn!(ticket = id, "access token refresh failed: {}", err),
                }
                machine.refresh_failed(&lease);
                None
            }
        };
        if slot.as_ref().is_some_and(|t| t.id == id) {
            *slot = None;
        }
        outcome
    };

    tracing::debug!(ticket = id, refreshed = outcome.is_some(), "refresh settled");
    // No receivers left is fine; every waiter may have been dropped.
    let _ = tx.send(Some(outcome));
}

fn access_if_authenticated(session: Session) -> Option<String> {
    if session.status == SessionStatus::Authenticated {
        session.access_token
    } else {
        None
    }
}
