//! In-process authorization server for tests
//!
//! Serves `/device/code`, `/token`, `/authorize` and `/jwks` on an ephemeral
//! loopback port. Behaviour is steered through `MockState`; every form posted
//! to `/token` is recorded so tests can count grants.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Form, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use reqwest::Url;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;

use crate::token::DEVICE_CODE_GRANT;

pub const DEVICE_CODE: &str = "dev-code";
pub const USER_CODE: &str = "WDJB-MJHT";
pub const AUTH_CODE: &str = "auth-code";

/// Knobs and recordings shared with the running server.
pub struct MockState {
    requests: Mutex<Vec<HashMap<String, String>>>,
    pending_polls: AtomicUsize,
    slow_down_polls: AtomicUsize,
    device_error: Mutex<Option<String>>,
    device_interval: AtomicI64,
    device_expires_in: AtomicU64,
    refresh_fails: AtomicBool,
    token_failure: Mutex<Option<(StatusCode, String)>>,
    rotate_refresh: AtomicBool,
    token_lifetime: AtomicU64,
    id_token: Mutex<Option<String>>,
    challenge: Mutex<Option<String>>,
    forged_state: Mutex<Option<String>>,
    authorize_error: Mutex<Option<String>>,
    jwks: Mutex<Value>,
    jwks_fetches: AtomicUsize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            pending_polls: AtomicUsize::new(0),
            slow_down_polls: AtomicUsize::new(0),
            device_error: Mutex::new(None),
            device_interval: AtomicI64::new(1),
            device_expires_in: AtomicU64::new(600),
            refresh_fails: AtomicBool::new(false),
            token_failure: Mutex::new(None),
            rotate_refresh: AtomicBool::new(true),
            token_lifetime: AtomicU64::new(3600),
            id_token: Mutex::new(None),
            challenge: Mutex::new(None),
            forged_state: Mutex::new(None),
            authorize_error: Mutex::new(None),
            jwks: Mutex::new(json!({ "keys": [] })),
            jwks_fetches: AtomicUsize::new(0),
        }
    }
}

impl MockState {
    pub fn set_pending_polls(&self, n: usize) {
        self.pending_polls.store(n, Ordering::SeqCst);
    }

    pub fn set_slow_down_polls(&self, n: usize) {
        self.slow_down_polls.store(n, Ordering::SeqCst);
    }

    pub fn set_device_error(&self, error: Option<&str>) {
        *lock(&self.device_error) = error.map(str::to_owned);
    }

    pub fn set_device_interval(&self, secs: i64) {
        self.device_interval.store(secs, Ordering::SeqCst);
    }

    pub fn set_device_expires_in(&self, secs: u64) {
        self.device_expires_in.store(secs, Ordering::SeqCst);
    }

    pub fn fail_refresh(&self, fail: bool) {
        self.refresh_fails.store(fail, Ordering::SeqCst);
    }

    /// Answer every `/token` request with `status` and a plain-text body.
    pub fn fail_token_endpoint(&self, status: u16, body: &str) {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        *lock(&self.token_failure) = Some((status, body.to_owned()));
    }

    pub fn rotate_refresh(&self, rotate: bool) {
        self.rotate_refresh.store(rotate, Ordering::SeqCst);
    }

    pub fn set_token_lifetime(&self, secs: u64) {
        self.token_lifetime.store(secs, Ordering::SeqCst);
    }

    pub fn set_id_token(&self, id_token: Option<&str>) {
        *lock(&self.id_token) = id_token.map(str::to_owned);
    }

    pub fn forge_state(&self, state: Option<&str>) {
        *lock(&self.forged_state) = state.map(str::to_owned);
    }

    pub fn set_authorize_error(&self, error: Option<&str>) {
        *lock(&self.authorize_error) = error.map(str::to_owned);
    }

    pub fn set_jwks(&self, jwks: Value) {
        *lock(&self.jwks) = jwks;
    }

    pub fn jwks_fetches(&self) -> usize {
        self.jwks_fetches.load(Ordering::SeqCst)
    }

    /// Number of `/token` requests made with `grant_type`.
    pub fn grants(&self, grant_type: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|form| form.get("grant_type").map(String::as_str) == Some(grant_type))
            .count()
    }

    pub fn device_polls(&self) -> usize {
        self.grants(DEVICE_CODE_GRANT)
    }

    pub fn last_request(&self, grant_type: &str) -> Option<HashMap<String, String>> {
        lock(&self.requests)
            .iter()
            .rev()
            .find(|form| form.get("grant_type").map(String::as_str) == Some(grant_type))
            .cloned()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Handle to a running mock server. The server task lives until the
/// runtime shuts down.
pub struct MockAuthServer {
    pub base_url: String,
    pub state: Arc<MockState>,
}

impl MockAuthServer {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/device/code", post(device_code))
            .route("/token", post(token))
            .route("/authorize", get(authorize))
            .route("/jwks", get(jwks))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

fn oauth_error(error: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": error }))).into_response()
}

fn issue(state: &MockState, access_token: &str, refresh_token: Option<&str>) -> Response {
    let mut body = json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": state.token_lifetime.load(Ordering::SeqCst),
    });
    if let Some(refresh) = refresh_token {
        body["refresh_token"] = json!(refresh);
    }
    if let Some(id_token) = lock(&state.id_token).clone() {
        body["id_token"] = json!(id_token);
    }
    Json(body).into_response()
}

async fn device_code(
    State(state): State<Arc<MockState>>,
    Form(_form): Form<HashMap<String, String>>,
) -> Json<Value> {
    Json(json!({
        "device_code": DEVICE_CODE,
        "user_code": USER_CODE,
        "verification_uri": "https://auth.example.com/device",
        "expires_in": state.device_expires_in.load(Ordering::SeqCst),
        "interval": state.device_interval.load(Ordering::SeqCst),
    }))
}

async fn token(
    State(state): State<Arc<MockState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    lock(&state.requests).push(form.clone());
    let grant = form.get("grant_type").cloned().unwrap_or_default();
    if let Some((status, body)) = lock(&state.token_failure).clone() {
        return (status, body).into_response();
    }

    match grant.as_str() {
        DEVICE_CODE_GRANT => {
            if form.get("device_code").map(String::as_str) != Some(DEVICE_CODE) {
                return oauth_error("invalid_grant");
            }
            if let Some(error) = lock(&state.device_error).clone() {
                return oauth_error(&error);
            }
            if take_one(&state.slow_down_polls) {
                return oauth_error("slow_down");
            }
            if take_one(&state.pending_polls) {
                return oauth_error("authorization_pending");
            }
            issue(&state, "device-access", Some("device-refresh"))
        }
        "authorization_code" => {
            let verifier = form.get("code_verifier").cloned().unwrap_or_default();
            let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
            let expected = lock(&state.challenge).clone();
            if form.get("code").map(String::as_str) != Some(AUTH_CODE)
                || expected.as_deref() != Some(challenge.as_str())
            {
                return oauth_error("invalid_grant");
            }
            issue(&state, "code-access", Some("code-refresh"))
        }
        "refresh_token" => {
            if state.refresh_fails.load(Ordering::SeqCst) {
                return oauth_error("invalid_grant");
            }
            let rotated = state
                .rotate_refresh
                .load(Ordering::SeqCst)
                .then_some("rotated-refresh");
            issue(&state, "refreshed-access", rotated)
        }
        _ => oauth_error("unsupported_grant_type"),
    }
}

async fn authorize(
    State(state): State<Arc<MockState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let (Some(redirect_uri), Some(request_state)) = (query.get("redirect_uri"), query.get("state"))
    else {
        return (StatusCode::BAD_REQUEST, "missing redirect_uri or state").into_response();
    };
    *lock(&state.challenge) = query.get("code_challenge").cloned();

    let returned_state = lock(&state.forged_state)
        .clone()
        .unwrap_or_else(|| request_state.clone());
    let Ok(mut location) = Url::parse(redirect_uri) else {
        return (StatusCode::BAD_REQUEST, "bad redirect_uri").into_response();
    };
    {
        let mut pairs = location.query_pairs_mut();
        match lock(&state.authorize_error).clone() {
            Some(error) => {
                pairs
                    .append_pair("error", &error)
                    .append_pair("error_description", "the user said no");
            }
            None => {
                pairs.append_pair("code", AUTH_CODE);
            }
        }
        pairs.append_pair("state", &returned_state);
    }
    (
        StatusCode::FOUND,
        [(header::LOCATION, String::from(location))],
    )
        .into_response()
}

async fn jwks(State(state): State<Arc<MockState>>) -> Json<Value> {
    state.jwks_fetches.fetch_add(1, Ordering::SeqCst);
    Json(lock(&state.jwks).clone())
}
