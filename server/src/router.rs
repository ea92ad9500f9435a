//! HTTP control plane: a single `POST /rpc` route dispatching on the `id`
//! header to registered handler chains.
//!
//! Handlers are plain synchronous functions `(state, user, request,
//! response)`; they run in registration order and the first error stops
//! the chain with HTTP 400 carrying the error text. The `session` header
//! (32 hex chars) resolves the calling user up front; handlers that
//! require one put [`rpc_assert_user`] at the head of their chain.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State as RouterState};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use log::{debug, info, warn};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::state::{State, User};

/// One step of an RPC handler chain.
pub type RpcHandler = Arc<
    dyn Fn(&Arc<State>, Option<&Arc<User>>, &RpcRequest, &mut Vec<u8>) -> anyhow::Result<()>
        + Send
        + Sync,
>;

pub struct RpcRequest {
    pub body: Vec<u8>,
    pub remote_addr: SocketAddr,
}

pub struct Router {
    state: Arc<State>,
    handlers: RwLock<HashMap<String, Vec<RpcHandler>>>,
}

impl Router {
    pub fn new(state: Arc<State>) -> Arc<Router> {
        Arc::new(Router { state, handlers: RwLock::new(HashMap::new()) })
    }

    pub fn register_rpc(&self, id: impl Into<String>, handlers: Vec<RpcHandler>) {
        let id = id.into();
        info!("Registered rpc: {id}");
        self.handlers.write().insert(id, handlers);
    }

    /// The axum application serving this router.
    pub fn axum_router(self: Arc<Self>) -> axum::Router {
        axum::Router::new()
            .route("/rpc", post(rpc_endpoint))
            .with_state(self)
    }

    /// Serves plain HTTP until the listener dies.
    pub async fn serve(self: Arc<Self>, addr: &str) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        warn!("HTTP server is running without ssl.");
        axum::serve(
            listener,
            self.axum_router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }
}

async fn rpc_endpoint(
    RouterState(router): RouterState<Arc<Router>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(id) = headers.get("id").and_then(|value| value.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, "rpc call needs id in headers").into_response();
    };

    let Some(handlers) = router.handlers.read().get(id).cloned() else {
        return (StatusCode::BAD_REQUEST, "unknown rpc id").into_response();
    };

    // An absent or malformed session header resolves to no user; the
    // handler chain decides whether that is acceptable.
    let session = headers
        .get("session")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::try_parse(value).ok())
        .unwrap_or(Uuid::nil());
    let user = router.state.get_user(session, Uuid::nil());

    debug!("Rpc call: id: {id} session: {session}");

    let request = RpcRequest { body: body.to_vec(), remote_addr };
    let mut response = Vec::new();
    for handler in &handlers {
        if let Err(err) = handler(&router.state, user.as_ref(), &request, &mut response) {
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    }

    response.into_response()
}

/// Chain head for RPCs that require an authenticated caller.
pub fn rpc_assert_user(
    _state: &Arc<State>,
    user: Option<&Arc<User>>,
    _request: &RpcRequest,
    _response: &mut Vec<u8>,
) -> anyhow::Result<()> {
    if user.is_none() {
        return Err(anyhow!("invalid session"));
    }
    Ok(())
}
