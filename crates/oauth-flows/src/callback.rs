//! Loopback redirect listener for the authorization-code flow
//!
//! Binds `127.0.0.1` only, serves exactly one redirect on the configured
//! path, answers it with a small HTML page and shuts down. Requests to any
//! other path get a 404 and do not consume the redirect.

use std::collections::HashMap;
use std::future::IntoFuture;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{AuthError, Result};

const SUCCESS_PAGE: &str = "<!doctype html><html><head><title>Signed in</title></head>\
<body><h1>Authentication complete</h1><p>You can close this window.</p></body></html>";

const FAILURE_PAGE: &str = "<!doctype html><html><head><title>Sign-in failed</title></head>\
<body><h1>Authentication failed</h1><p>Return to the application for details.</p></body></html>";

/// Query parameters delivered on the redirect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackParams {
    fn from_query(mut query: HashMap<String, String>) -> Self {
        Self {
            code: query.remove("code"),
            state: query.remove("state"),
            error: query.remove("error"),
            error_description: query.remove("error_description"),
        }
    }
}

#[derive(Clone)]
struct CallbackState {
    sender: Arc<Mutex<Option<oneshot::Sender<CallbackParams>>>>,
    received: CancellationToken,
}

/// A bound, not yet serving, loopback listener.
pub struct CallbackListener {
    listener: TcpListener,
    addr: SocketAddr,
    path: String,
}

impl CallbackListener {
    /// Bind `127.0.0.1:port`; port `0` lets the OS pick.
    pub async fn bind(port: u16, path: &str) -> Result<Self> {
        if !path.starts_with('/') {
            return Err(AuthError::Configuration(format!(
                "redirect path must start with '/': {path:?}"
            )));
        }
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|e| {
                AuthError::Configuration(format!("failed to bind loopback port {port}: {e}"))
            })?;
        let addr = listener
            .local_addr()
            .map_err(|e| AuthError::Configuration(format!("loopback listener address: {e}")))?;
        debug!(%addr, path, "redirect listener bound");
        Ok(Self {
            listener,
            addr,
            path: path.to_string(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://{}{}", self.addr, self.path)
    }

    /// Serve until one redirect arrives, `deadline` passes or `cancel` fires.
    ///
    /// The listener is closed on every exit path.
    pub async fn wait(self, deadline: Instant, cancel: &CancellationToken) -> Result<CallbackParams> {
        let (tx, mut rx) = oneshot::channel();
        let received = CancellationToken::new();
        let state = CallbackState {
            sender: Arc::new(Mutex::new(Some(tx))),
            received: received.clone(),
        };
        let app = Router::new()
            .route(&self.path, get(handle_redirect))
            .with_state(state);

        let server = axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { received.cancelled().await })
            .into_future();

        // A delivered redirect wins over the deadline; connection tasks finish
        // their graceful shutdown on their own once `received` fires.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AuthError::Cancelled),
            delivered = &mut rx => delivered.map_err(|_| {
                AuthError::Protocol("redirect listener stopped without receiving a redirect".into())
            }),
            served = server => match served {
                Err(e) => Err(AuthError::Protocol(format!("redirect listener failed: {e}"))),
                Ok(()) => Err(AuthError::Protocol(
                    "redirect listener stopped without receiving a redirect".into(),
                )),
            },
            _ = tokio::time::sleep_until(deadline) => {
                Err(AuthError::Timeout("no authorization redirect received in time".into()))
            }
        }
    }
}

async fn handle_redirect(
    State(state): State<CallbackState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let Some(sender) = state.sender.lock().await.take() else {
        return (StatusCode::GONE, "authorization already completed").into_response();
    };
    let params = CallbackParams::from_query(query);
    let page = if params.error.is_some() {
        FAILURE_PAGE
    } else {
        SUCCESS_PAGE
    };
    info!(has_code = params.code.is_some(), "authorization redirect received");
    let _ = sender.send(params);
    state.received.cancel();
    (
        StatusCode::OK,
        [(header::CONNECTION, "close")],
        Html(page),
    )
        .into_response()
}
