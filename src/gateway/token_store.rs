//! Usage: Single owner of persisted session tokens (primary store, legacy store, route cookie).
//!
//! Readers only ever see the in-memory snapshot. Persistence is written through
//! on `set`/`clear` under the same lock, so the store, the cookie and the
//! snapshot never disagree for an observer going through this type. Other
//! processes sharing a file-backed store may still observe stale values until
//! they re-read.

use crate::domain::session::{Session, SessionStatus, UserIdentity};
use crate::infra::cookies::{Cookie, CookieJar, CookiePolicy};
use crate::infra::storage::KeyValueStore;
use crate::shared::mutex_ext::MutexExt;
use crate::shared::security::mask_opt;
use crate::shared::time::now_unix_seconds;
use std::sync::{Arc, Mutex};

pub const KEY_ACCESS_TOKEN: &str = "accessToken";
pub const KEY_REFRESH_TOKEN: &str = "refreshToken";
pub const KEY_USER: &str = "user";
pub const KEY_ROLE: &str = "role";

const ALL_KEYS: [&str; 4] = [KEY_ACCESS_TOKEN, KEY_REFRESH_TOKEN, KEY_USER, KEY_ROLE];

pub struct TokenStore {
    primary: Arc<dyn KeyValueStore>,
    legacy: Option<Arc<dyn KeyValueStore>>,
    cookies: Arc<CookieJar>,
    cookie_policy: CookiePolicy,
    snapshot: Mutex<Session>,
}

#[derive(Debug, Default)]
struct PersistedTokens {
    access_token: Option<String>,
    refresh_token: Option<String>,
    user: Option<UserIdentity>,
}

impl PersistedTokens {
    fn load(store: &dyn KeyValueStore, location: &'static str) -> Self {
        let read = |key: &str| -> Option<String> {
            match store.get(key) {
                Ok(value) => value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()),
                Err(err) => {
                    tracing::warn!(location, key, "token store read failed: {}", err);
                    None
                }
            }
        };

        let user = read(KEY_USER).and_then(|raw| match serde_json::from_str(&raw) {
            Ok(user) => Some(user),
            Err(err) => {
                tracing::warn!(location, "ignoring unreadable persisted user: {}", err);
                None
            }
        });

        Self {
            access_token: read(KEY_ACCESS_TOKEN),
            refresh_token: read(KEY_REFRESH_TOKEN),
            user,
        }
    }

    fn into_session(self) -> Session {
        match self.access_token {
            Some(access) => Session::signed_in(
                access,
                self.refresh_token,
                self.user,
                SessionStatus::Authenticated,
            ),
            None => Session::anonymous(),
        }
    }
}

impl TokenStore {
    /// Build the store and hydrate the snapshot once from persistence.
    ///
    /// The primary store wins. When it has no access token, a legacy session is
    /// migrated into it. Legacy keys are removed either way.
    pub fn open(
        primary: Arc<dyn KeyValueStore>,
        legacy: Option<Arc<dyn KeyValueStore>>,
        cookies: Arc<CookieJar>,
        cookie_policy: CookiePolicy,
    ) -> Self {
        let store = Self {
            primary,
            legacy,
            cookies,
            cookie_policy,
            snapshot: Mutex::new(Session::anonymous()),
        };
        store.hydrate();
        store
    }

    fn hydrate(&self) {
        let mut guard = self.snapshot.lock_or_recover();

        let mut tokens = PersistedTokens::load(self.primary.as_ref(), "primary");
        let mut migrated = false;
        if let Some(legacy) = self.legacy.as_deref() {
            if tokens.access_token.is_none() {
                let legacy_tokens = PersistedTokens::load(legacy, "legacy");
                if legacy_tokens.access_token.is_some() {
                    tokens = legacy_tokens;
                    migrated = true;
                }
            }
        }

        if tokens.access_token.is_none() && tokens.refresh_token.is_some() {
            tracing::warn!("discarding persisted refresh token without an access token");
        }

        let session = tokens.into_session();
        if migrated || session.is_anonymous() {
            self.persist(&session);
        }
        // Legacy keys go only after the primary store holds the migrated copy.
        if let Some(legacy) = self.legacy.as_deref() {
            remove_keys(legacy, "legacy");
        }
        self.write_cookie(&session);

        tracing::debug!(
            status = %session.status,
            migrated,
            access_token = %mask_opt(session.access_token.as_deref()),
            "token store hydrated"
        );
        *guard = session;
    }

    /// Current snapshot. Never consults persistence.
    pub fn get(&self) -> Session {
        self.snapshot.lock_or_recover().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.snapshot.lock_or_recover().access_token.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.snapshot.lock_or_recover().status
    }

    /// Persist `session` and update the cookie, then publish the snapshot.
    /// Status-only changes skip the persistence write.
    pub(crate) fn set(&self, session: Session) {
        let mut guard = self.snapshot.lock_or_recover();
        if !guard.same_credentials(&session) {
            self.persist(&session);
            self.write_cookie(&session);
        }
        *guard = session;
    }

    /// Remove tokens from every location. Individual failures are logged and
    /// do not stop the remaining removals.
    pub(crate) fn clear(&self) {
        let mut guard = self.snapshot.lock_or_recover();
        remove_keys(self.primary.as_ref(), "primary");
        if let Some(legacy) = self.legacy.as_deref() {
            remove_keys(legacy, "legacy");
        }
        self.cookies.remove(&self.cookie_policy.name);
        *guard = Session::anonymous();
    }

    /// Token-presence flag read by the route guard.
    pub fn route_cookie_present(&self) -> bool {
        self.cookies.contains(&self.cookie_policy.name)
    }

    pub fn cookie_policy(&self) -> &CookiePolicy {
        &self.cookie_policy
    }

    fn persist(&self, session: &Session) {
        let user_json = match session.user.as_ref().map(serde_json::to_string).transpose() {
            Ok(user_json) => user_json,
            Err(err) => {
                tracing::warn!("failed to encode user for persistence: {}", err);
                None
            }
        };
        let role = session.role().map(|r| r.as_str());

        let batch = [
            (KEY_ACCESS_TOKEN, session.access_token.as_deref()),
            (KEY_REFRESH_TOKEN, session.refresh_token.as_deref()),
            (KEY_USER, user_json.as_deref()),
            (KEY_ROLE, role),
        ];
        if let Err(err) = self.primary.write_batch(&batch) {
            tracing::warn!("token store write failed; keeping in-memory session: {}", err);
        }
    }

    fn write_cookie(&self, session: &Session) {
        match session.access_token.as_deref() {
            Some(token) => self.cookies.set(Cookie::from_policy(
                &self.cookie_policy,
                token,
                now_unix_seconds(),
            )),
            None => {
                self.cookies.remove(&self.cookie_policy.name);
            }
        }
    }
}

fn remove_keys(store: &dyn KeyValueStore, location: &'static str) {
    let batch: Vec<(&str, Option<&str>)> = ALL_KEYS.iter().map(|key| (*key, None)).collect();
    if let Err(err) = store.write_batch(&batch) {
        tracing::warn!(location, "batch removal failed; removing keys one by one: {}", err);
        for key in ALL_KEYS {
            if let Err(err) = store.remove(key) {
                tracing::warn!(location, key, "token store removal failed: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testutil::student;
    use crate::infra::storage::MemoryStore;

    struct Fixture {
        primary: Arc<MemoryStore>,
        legacy: Arc<MemoryStore>,
        cookies: Arc<CookieJar>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                primary: Arc::new(MemoryStore::new()),
                legacy: Arc::new(MemoryStore::new()),
                cookies: Arc::new(CookieJar::new()),
            }
        }

        fn open(&self) -> TokenStore {
            TokenStore::open(
                self.primary.clone(),
                Some(self.legacy.clone()),
                self.cookies.clone(),
                CookiePolicy::default(),
            )
        }
    }

    fn signed_in(access: &str, refresh: &str) -> Session {
        Session::signed_in(
            access.to_string(),
            Some(refresh.to_string()),
            Some(student()),
            SessionStatus::Authenticated,
        )
    }

    #[test]
    fn empty_stores_hydrate_anonymous() {
        let fx = Fixture::new();
        let store = fx.open();
        assert_eq!(store.get(), Session::anonymous());
        assert!(!store.route_cookie_present());
    }

    #[test]
    fn set_writes_primary_and_cookie_before_returning() {
        let fx = Fixture::new();
        let store = fx.open();

        store.set(signed_in("A1", "R1"));

        assert_eq!(fx.primary.get(KEY_ACCESS_TOKEN).unwrap().as_deref(), Some("A1"));
        assert_eq!(fx.primary.get(KEY_REFRESH_TOKEN).unwrap().as_deref(), Some("R1"));
        assert_eq!(fx.primary.get(KEY_ROLE).unwrap().as_deref(), Some("student"));
        assert_eq!(fx.cookies.value("accessToken").as_deref(), Some("A1"));
        assert_eq!(store.get().access_token.as_deref(), Some("A1"));
    }

    #[test]
    fn primary_session_survives_reopen() {
        let fx = Fixture::new();
        fx.open().set(signed_in("A1", "R1"));

        let reopened = fx.open();
        let session = reopened.get();
        assert_eq!(session.status, SessionStatus::Authenticated);
        assert_eq!(session.access_token.as_deref(), Some("A1"));
        assert_eq!(session.user, Some(student()));
        assert!(reopened.route_cookie_present());
    }

    #[test]
    fn legacy_session_is_migrated_and_legacy_cleared() {
        let fx = Fixture::new();
        fx.legacy.set(KEY_ACCESS_TOKEN, "L1").unwrap();
        fx.legacy.set(KEY_REFRESH_TOKEN, "LR1").unwrap();

        let store = fx.open();

        assert_eq!(store.get().access_token.as_deref(), Some("L1"));
        assert_eq!(store.get().refresh_token.as_deref(), Some("LR1"));
        assert_eq!(fx.primary.get(KEY_ACCESS_TOKEN).unwrap().as_deref(), Some("L1"));
        assert!(fx.legacy.is_empty());
    }

    #[test]
    fn primary_wins_over_legacy() {
        let fx = Fixture::new();
        fx.primary.set(KEY_ACCESS_TOKEN, "P1").unwrap();
        fx.legacy.set(KEY_ACCESS_TOKEN, "L1").unwrap();

        let store = fx.open();
        assert_eq!(store.get().access_token.as_deref(), Some("P1"));
        assert!(fx.legacy.is_empty());
    }

    #[test]
    fn orphan_refresh_token_is_discarded() {
        let fx = Fixture::new();
        fx.primary.set(KEY_REFRESH_TOKEN, "R1").unwrap();

        let store = fx.open();
        assert_eq!(store.get(), Session::anonymous());
        assert!(fx.primary.is_empty());
    }

    #[test]
    fn clear_empties_every_location_and_is_repeatable() {
        let fx = Fixture::new();
        let store = fx.open();
        store.set(signed_in("A1", "R1"));
        fx.legacy.set(KEY_ACCESS_TOKEN, "stale").unwrap();

        store.clear();
        store.clear();

        assert_eq!(store.get(), Session::anonymous());
        assert!(fx.primary.is_empty());
        assert!(fx.legacy.is_empty());
        assert!(!store.route_cookie_present());
    }

    #[test]
    fn get_after_clear_ignores_values_written_behind_its_back() {
        let fx = Fixture::new();
        let store = fx.open();
        store.set(signed_in("A1", "R1"));
        store.clear();

        // Another context writes into the shared store after logout.
        fx.primary.set(KEY_ACCESS_TOKEN, "A-other").unwrap();
        fx.legacy.set(KEY_ACCESS_TOKEN, "L-other").unwrap();

        assert_eq!(store.get(), Session::anonymous());
    }

    #[test]
    fn status_only_change_skips_persistence() {
        let fx = Fixture::new();
        let store = fx.open();
        store.set(signed_in("A1", "R1"));
        fx.primary.remove(KEY_ROLE).unwrap();

        let mut refreshing = store.get();
        refreshing.status = SessionStatus::Refreshing;
        store.set(refreshing);

        assert_eq!(store.status(), SessionStatus::Refreshing);
        assert_eq!(fx.primary.get(KEY_ROLE).unwrap(), None);
    }
}
