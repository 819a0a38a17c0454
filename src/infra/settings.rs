//! Usage: Persisted gateway settings (schema + read/write helpers).

use crate::infra::cookies::{CookiePolicy, SameSite};
use crate::infra::storage::write_file_atomic;
use crate::shared::error::AppResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_LOGIN_PATH: &str = "api/auth/login/";
pub const DEFAULT_REFRESH_PATH: &str = "api/auth/token/refresh/";
pub const DEFAULT_STANDARD_TIMEOUT_SECONDS: u32 = 30;
pub const DEFAULT_LONG_RUNNING_TIMEOUT_SECONDS: u32 = 300;
pub const DEFAULT_REFRESH_LEAD_SECONDS: u32 = 30;
pub const DEFAULT_COOKIE_NAME: &str = "accessToken";
pub const DEFAULT_COOKIE_MAX_AGE_SECONDS: u32 = 24 * 60 * 60;
const DEFAULT_LOG_FILTER: &str = "info";
const MAX_STANDARD_TIMEOUT_SECONDS: u32 = 10 * 60;
const MAX_LONG_RUNNING_TIMEOUT_SECONDS: u32 = 60 * 60;
const MAX_REFRESH_LEAD_SECONDS: u32 = 60 * 60;
const MAX_COOKIE_MAX_AGE_SECONDS: u32 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalSettings {
    pub schema_version: u32,
    pub base_url: String,
    pub login_path: String,
    pub refresh_path: String,
    pub standard_timeout_seconds: u32,
    // Bulk exports and report endpoints.
    pub long_running_timeout_seconds: u32,
    // Refresh ahead of a JWT `exp` claim; 0 disables proactive refresh.
    pub refresh_lead_seconds: u32,
    pub cookie_name: String,
    pub cookie_max_age_seconds: u32,
    // Primary store file; unset keeps tokens in memory for the process lifetime.
    pub session_store_path: Option<PathBuf>,
    // Older token file, read once for migration and then cleared.
    pub legacy_store_path: Option<PathBuf>,
    pub use_system_proxy: bool,
    pub log_filter: String,
    pub log_dir: Option<PathBuf>,
}

impl Default for PortalSettings {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            base_url: DEFAULT_BASE_URL.to_string(),
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            standard_timeout_seconds: DEFAULT_STANDARD_TIMEOUT_SECONDS,
            long_running_timeout_seconds: DEFAULT_LONG_RUNNING_TIMEOUT_SECONDS,
            refresh_lead_seconds: DEFAULT_REFRESH_LEAD_SECONDS,
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            cookie_max_age_seconds: DEFAULT_COOKIE_MAX_AGE_SECONDS,
            session_store_path: None,
            legacy_store_path: None,
            use_system_proxy: true,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            log_dir: None,
        }
    }
}

impl PortalSettings {
    pub fn standard_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.standard_timeout_seconds.max(1)))
    }

    pub fn long_running_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.long_running_timeout_seconds.max(1)))
    }

    pub fn cookie_policy(&self) -> CookiePolicy {
        CookiePolicy {
            name: self.cookie_name.clone(),
            max_age_secs: i64::from(self.cookie_max_age_seconds),
            path: "/".to_string(),
            same_site: SameSite::Lax,
        }
    }

    /// `base_url` joined with a relative endpoint path.
    pub fn endpoint_url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    let path = path.trim();
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base.trim().trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn sanitize_timeouts(settings: &mut PortalSettings) -> bool {
    let mut changed = false;

    if settings.standard_timeout_seconds == 0 {
        settings.standard_timeout_seconds = DEFAULT_STANDARD_TIMEOUT_SECONDS;
        changed = true;
    }
    if settings.standard_timeout_seconds > MAX_STANDARD_TIMEOUT_SECONDS {
        settings.standard_timeout_seconds = MAX_STANDARD_TIMEOUT_SECONDS;
        changed = true;
    }
    if settings.long_running_timeout_seconds == 0 {
        settings.long_running_timeout_seconds = DEFAULT_LONG_RUNNING_TIMEOUT_SECONDS;
        changed = true;
    }
    if settings.long_running_timeout_seconds > MAX_LONG_RUNNING_TIMEOUT_SECONDS {
        settings.long_running_timeout_seconds = MAX_LONG_RUNNING_TIMEOUT_SECONDS;
        changed = true;
    }
    if settings.long_running_timeout_seconds < settings.standard_timeout_seconds {
        settings.long_running_timeout_seconds = settings.standard_timeout_seconds;
        changed = true;
    }

    changed
}

fn sanitize_refresh_lead(settings: &mut PortalSettings) -> bool {
    if settings.refresh_lead_seconds > MAX_REFRESH_LEAD_SECONDS {
        settings.refresh_lead_seconds = MAX_REFRESH_LEAD_SECONDS;
        return true;
    }
    false
}

fn sanitize_cookie(settings: &mut PortalSettings) -> bool {
    let mut changed = false;

    let trimmed = settings.cookie_name.trim();
    if trimmed.is_empty() {
        settings.cookie_name = DEFAULT_COOKIE_NAME.to_string();
        changed = true;
    } else if trimmed.len() != settings.cookie_name.len() {
        settings.cookie_name = trimmed.to_string();
        changed = true;
    }

    if settings.cookie_max_age_seconds == 0 {
        settings.cookie_max_age_seconds = DEFAULT_COOKIE_MAX_AGE_SECONDS;
        changed = true;
    }
    if settings.cookie_max_age_seconds > MAX_COOKIE_MAX_AGE_SECONDS {
        settings.cookie_max_age_seconds = MAX_COOKIE_MAX_AGE_SECONDS;
        changed = true;
    }

    changed
}

fn sanitize_endpoint_paths(settings: &mut PortalSettings) -> bool {
    let mut changed = false;

    if settings.login_path.trim().is_empty() {
        settings.login_path = DEFAULT_LOGIN_PATH.to_string();
        changed = true;
    }
    if settings.refresh_path.trim().is_empty() {
        settings.refresh_path = DEFAULT_REFRESH_PATH.to_string();
        changed = true;
    }

    changed
}

fn migrate_schema_version(settings: &mut PortalSettings, schema_version_present: bool) -> bool {
    if schema_version_present && settings.schema_version >= SCHEMA_VERSION {
        return false;
    }

    // Missing schema_version forces a write so the file stops "migrating" on every read.
    settings.schema_version = SCHEMA_VERSION;
    true
}

pub fn validate(settings: &PortalSettings) -> AppResult<()> {
    let base_url = settings.base_url.trim();
    if base_url.is_empty() {
        return Err("SEC_INVALID_INPUT: base_url must not be empty".into());
    }
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        return Err(format!(
            "SEC_INVALID_INPUT: base_url must start with http:// or https://, got {base_url}"
        )
        .into());
    }
    if settings.cookie_name.contains([';', '=', ' ']) {
        return Err("SEC_INVALID_INPUT: cookie_name must not contain ';', '=' or spaces".into());
    }
    Ok(())
}

fn parse_settings_json(content: &str) -> AppResult<(PortalSettings, bool)> {
    let raw: serde_json::Value = serde_json::from_str(content)
        .map_err(|e| format!("CONFIG_ERROR: failed to parse settings.json: {e}"))?;
    let schema_version_present = raw.get("schema_version").is_some();
    let settings: PortalSettings = serde_json::from_value(raw)
        .map_err(|e| format!("CONFIG_ERROR: failed to parse settings.json: {e}"))?;
    Ok((settings, schema_version_present))
}

/// Sanitize in place; returns whether anything was repaired.
pub fn sanitize(settings: &mut PortalSettings) -> bool {
    let mut repaired = false;
    repaired |= sanitize_timeouts(settings);
    repaired |= sanitize_refresh_lead(settings);
    repaired |= sanitize_cookie(settings);
    repaired |= sanitize_endpoint_paths(settings);
    repaired
}

/// Read settings from `path`. A missing file yields defaults (and is created,
/// best-effort); repaired values are written back.
pub fn read(path: &Path) -> AppResult<PortalSettings> {
    if !path.exists() {
        let settings = PortalSettings::default();
        // Best-effort: make the config discoverable/editable.
        if let Err(err) = write(path, &settings) {
            tracing::warn!(path = %path.display(), "failed to create default settings: {}", err);
        }
        return Ok(settings);
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("CONFIG_ERROR: failed to read settings: {e}"))?;
    let (mut settings, schema_version_present) = parse_settings_json(&content)?;

    validate(&settings)?;

    let mut repaired = migrate_schema_version(&mut settings, schema_version_present);
    repaired |= sanitize(&mut settings);
    if repaired {
        tracing::info!(path = %path.display(), "settings repaired; persisting sanitized values");
        if let Err(err) = write(path, &settings) {
            tracing::warn!(path = %path.display(), "failed to persist repaired settings: {}", err);
        }
    }

    Ok(settings)
}

pub fn write(path: &Path, settings: &PortalSettings) -> AppResult<PortalSettings> {
    validate(settings)?;

    let mut settings = settings.clone();
    settings.schema_version = SCHEMA_VERSION;
    sanitize(&mut settings);

    let content = serde_json::to_vec_pretty(&settings)
        .map_err(|e| format!("CONFIG_ERROR: failed to serialize settings: {e}"))?;
    write_file_atomic(path, &content)?;

    Ok(settings)
}
