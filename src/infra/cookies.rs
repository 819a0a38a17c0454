//! Usage: Readable cookie jar for the route guard's token-presence flag.

use crate::shared::mutex_ext::MutexExt;
use crate::shared::time::now_unix_seconds;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Lax,
    Strict,
    None,
}

impl SameSite {
    fn as_str(self) -> &'static str {
        match self {
            SameSite::Lax => "Lax",
            SameSite::Strict => "Strict",
            SameSite::None => "None",
        }
    }
}

/// Name and lifetime of the cookie written for the route guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookiePolicy {
    pub name: String,
    pub max_age_secs: i64,
    pub path: String,
    pub same_site: SameSite,
}

impl Default for CookiePolicy {
    fn default() -> Self {
        Self {
            name: "accessToken".to_string(),
            max_age_secs: 24 * 60 * 60,
            path: "/".to_string(),
            same_site: SameSite::Lax,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: String,
    pub same_site: SameSite,
    pub max_age_secs: i64,
    pub expires_at: i64,
}

impl Cookie {
    pub fn from_policy(policy: &CookiePolicy, value: &str, now_unix: i64) -> Self {
        let max_age_secs = policy.max_age_secs.max(0);
        Self {
            name: policy.name.clone(),
            value: value.to_string(),
            path: policy.path.clone(),
            same_site: policy.same_site,
            max_age_secs,
            expires_at: now_unix.saturating_add(max_age_secs),
        }
    }

    pub fn is_expired(&self, now_unix: i64) -> bool {
        self.expires_at <= now_unix
    }

    /// `Set-Cookie` header value.
    pub fn to_header_value(&self) -> String {
        format!(
            "{}={}; Max-Age={}; Path={}; SameSite={}",
            self.name,
            self.value,
            self.max_age_secs,
            self.path,
            self.same_site.as_str()
        )
    }
}

/// In-process cookie jar; expired cookies read as absent.
#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: Mutex<HashMap<String, Cookie>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, cookie: Cookie) {
        self.cookies
            .lock_or_recover()
            .insert(cookie.name.clone(), cookie);
    }

    pub fn remove(&self, name: &str) -> bool {
        self.cookies.lock_or_recover().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Cookie> {
        self.get_at(name, now_unix_seconds())
    }

    pub(crate) fn get_at(&self, name: &str, now_unix: i64) -> Option<Cookie> {
        let mut guard = self.cookies.lock_or_recover();
        match guard.get(name) {
            Some(cookie) if !cookie.is_expired(now_unix) => Some(cookie.clone()),
            Some(_) => {
                guard.remove(name);
                None
            }
            None => None,
        }
    }

    pub fn value(&self, name: &str) -> Option<String> {
        self.get(name).map(|c| c.value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}
