#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use portal_session::{Portal, PortalSettings, SessionStatus, Subscription};
use serde_json::{json, Value};

pub const PASSWORD: &str = "secret";

/// Scripted answer of the refresh endpoint.
pub enum RefreshReply {
    Grant {
        access: String,
        refresh: Option<String>,
    },
    Reject {
        status: u16,
        body: Value,
    },
}

impl RefreshReply {
    pub fn grant(access: &str) -> Self {
        RefreshReply::Grant {
            access: access.to_string(),
            refresh: None,
        }
    }

    pub fn rotate(access: &str, refresh: &str) -> Self {
        RefreshReply::Grant {
            access: access.to_string(),
            refresh: Some(refresh.to_string()),
        }
    }

    pub fn expired() -> Self {
        RefreshReply::Reject {
            status: 401,
            body: json!({"detail": "Token is invalid or expired", "code": "token_not_valid"}),
        }
    }

    pub fn blacklisted() -> Self {
        RefreshReply::Reject {
            status: 401,
            body: json!({"detail": "Token is blacklisted", "code": "token_not_valid"}),
        }
    }
}

#[derive(Default)]
pub struct MockState {
    pub login_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub resource_calls: AtomicUsize,
    pub seen_tokens: Mutex<Vec<String>>,
    pub seen_refresh_tokens: Mutex<Vec<String>>,
    valid_tokens: Mutex<HashSet<String>>,
    refresh_replies: Mutex<VecDeque<RefreshReply>>,
    refresh_delay: Mutex<Duration>,
}

impl MockState {
    pub fn accept(&self, token: &str) {
        self.valid_tokens.lock().unwrap().insert(token.to_string());
    }

    /// The backend stops accepting `token` (it expired server-side).
    pub fn revoke(&self, token: &str) {
        self.valid_tokens.lock().unwrap().remove(token);
    }

    pub fn queue_refresh(&self, reply: RefreshReply) {
        self.refresh_replies.lock().unwrap().push_back(reply);
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock().unwrap() = delay;
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn resource_count(&self) -> usize {
        self.resource_calls.load(Ordering::SeqCst)
    }

    pub fn seen_tokens(&self) -> Vec<String> {
        self.seen_tokens.lock().unwrap().clone()
    }

    fn authorize(&self, headers: &HeaderMap) -> Option<String> {
        self.resource_calls.fetch_add(1, Ordering::SeqCst);
        let token = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string)?;
        self.seen_tokens.lock().unwrap().push(token.clone());
        self.valid_tokens
            .lock()
            .unwrap()
            .contains(&token)
            .then_some(token)
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"detail": "Given token not valid for any token type", "code": "token_not_valid"})),
    )
        .into_response()
}

/// JWT-shaped token (unsigned) whose `exp` is `expires_in` seconds from now.
pub fn jwt_expiring_in(expires_in: i64) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(json!({"exp": now + expires_in, "user_id": 7}).to_string());
    format!("{header}.{payload}.c2ln")
}

async fn login(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    state.login_calls.fetch_add(1, Ordering::SeqCst);
    let username = body["username"].as_str().unwrap_or_default().to_string();
    if body["password"].as_str() != Some(PASSWORD) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "No active account found with the given credentials"})),
        )
            .into_response();
    }

    // "ada" always gets A1, "soon" a JWT that is about to expire.
    let access = match username.as_str() {
        "ada" => "A1".to_string(),
        "soon" => jwt_expiring_in(5),
        other => format!("A-{other}"),
    };
    state.accept(&access);
    Json(json!({
        "access": access,
        "refresh": "R1",
        "user": {"id": 7, "role": "student", "name": username},
    }))
    .into_response()
}

async fn refresh(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    state
        .seen_refresh_tokens
        .lock()
        .unwrap()
        .push(body["refresh"].as_str().unwrap_or_default().to_string());

    let delay = *state.refresh_delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let reply = state
        .refresh_replies
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(RefreshReply::expired);
    match reply {
        RefreshReply::Grant { access, refresh } => {
            state.accept(&access);
            let mut body = json!({"access": access});
            if let Some(refresh) = refresh {
                body["refresh"] = Value::String(refresh);
            }
            Json(body).into_response()
        }
        RefreshReply::Reject { status, body } => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::UNAUTHORIZED),
            Json(body),
        )
            .into_response(),
    }
}

async fn classes(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    match state.authorize(&headers) {
        Some(token) => Json(json!({"count": 2, "results": ["math", "art"], "token": token}))
            .into_response(),
        None => unauthorized(),
    }
}

async fn echo(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    match state.authorize(&headers) {
        Some(_) => (StatusCode::CREATED, Json(body)).into_response(),
        None => unauthorized(),
    }
}

async fn slow(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    state.authorize(&headers);
    tokio::time::sleep(Duration::from_secs(3)).await;
    Json(json!({"done": true})).into_response()
}

/// Answers 401 only after a while, so the session can change meanwhile.
async fn slow_unauthorized(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    state.authorize(&headers);
    tokio::time::sleep(Duration::from_millis(500)).await;
    unauthorized()
}

async fn missing(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    state.authorize(&headers);
    (StatusCode::NOT_FOUND, Json(json!({"detail": "Not found."}))).into_response()
}

async fn broken(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    state.authorize(&headers);
    (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded").into_response()
}

async fn always_unauthorized(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    state.authorize(&headers);
    unauthorized()
}

/// Portal REST backend on an ephemeral localhost port.
pub struct MockBackend {
    pub state: Arc<MockState>,
    pub base_url: String,
    task: tokio::task::JoinHandle<()>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/api/auth/login/", post(login))
            .route("/api/auth/token/refresh/", post(refresh))
            .route("/api/classes/", get(classes))
            .route("/api/echo/", post(echo))
            .route("/api/slow/", get(slow))
            .route("/api/slow-401/", get(slow_unauthorized))
            .route("/api/missing/", get(missing))
            .route("/api/broken/", get(broken))
            .route("/api/always-401/", get(always_unauthorized))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("bind mock backend");
        let addr = listener.local_addr().expect("local addr");
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve mock backend");
        });

        Self {
            state,
            base_url: format!("http://{addr}"),
            task,
        }
    }

    pub fn settings(&self) -> PortalSettings {
        PortalSettings {
            base_url: self.base_url.clone(),
            standard_timeout_seconds: 1,
            use_system_proxy: false,
            ..PortalSettings::default()
        }
    }

    pub fn portal(&self) -> Portal {
        Portal::from_settings(self.settings()).expect("portal")
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn signed_in_portal(backend: &MockBackend) -> Portal {
    let portal = backend.portal();
    portal
        .login(&portal_session::Credentials::new("ada", PASSWORD))
        .await
        .expect("login");
    portal
}

pub fn record_statuses(portal: &Portal) -> (Subscription, Arc<Mutex<Vec<SessionStatus>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let sub = portal.subscribe(move |status| sink.lock().unwrap().push(status));
    (sub, seen)
}

/// An address nothing listens on.
pub fn closed_port_url() -> String {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    format!("http://{addr}/api/classes/")
}
