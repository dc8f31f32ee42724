/// HTTP API for quartz-kv.
///
/// A thin JSON-over-HTTP transport in front of the operation dispatcher.
/// The same routes are served in every replicated mode; the single-node
/// router omits the replication surface and adds the index search routes.
///
/// # Routes
///
/// ## Client operations
/// - `GET /get?key=`: read a value (followers answer 307 + redirect body)
/// - `POST /set`: `{key, value, simulate_failure?}`
/// - `POST /delete`: `{key, simulate_failure?}`
/// - `POST /bulk_set`: `{items: [{key, value}], simulate_failure?}`
///
/// ## Node-to-node
/// - `POST /vote`, `POST /heartbeat`, `POST /replicate` (leader mode)
/// - `POST /replicate_set`, `GET /replicate_get?key=`, `POST /gossip`
///   (leaderless mode)
/// - `GET /ping`: liveness
///
/// ## Search (single mode)
/// - `GET /search/text?q=`: inverted-index AND search
/// - `GET /search/similar?q=&top_k=`: embedding cosine search
use crate::dispatch::{NodeHandle, Request, Response, SingleNode};
use crate::error::{KvError, KvResult};
use crate::peer::{
    GossipBody, HeartbeatBody, ReplicateGetReply, ReplicateSetBody, VoteBody, VoteReply,
};
use crate::types::{KvPair, Operation, VectorClock};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Shared handle to whichever node mode is serving.
pub type SharedNode = Arc<dyn NodeHandle>;

/// `?key=` query parameter.
#[derive(Debug, Deserialize)]
struct KeyParams {
    key: Option<String>,
}

/// Body of `/set`.
#[derive(Debug, Deserialize)]
struct SetBody {
    key: String,
    value: String,
    #[serde(default)]
    simulate_failure: bool,
}

/// Body of `/delete`.
#[derive(Debug, Deserialize)]
struct DeleteBody {
    key: String,
    #[serde(default)]
    simulate_failure: bool,
}

/// Body of `/bulk_set`.
#[derive(Debug, Deserialize)]
struct BulkSetBody {
    items: Vec<KvPair>,
    #[serde(default)]
    simulate_failure: bool,
}

/// Search query parameters.
#[derive(Debug, Deserialize)]
struct SearchParams {
    q: Option<String>,
    top_k: Option<usize>,
}

/// Successful read reply.
#[derive(Debug, Serialize)]
struct ValueReply {
    key: String,
    value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    clock: Option<VectorClock>,
}

/// Error reply body.
#[derive(Debug, Serialize)]
struct ErrorReply {
    error: String,
}

/// The full protocol surface for a replicated node.
pub fn router(node: SharedNode) -> Router {
    Router::new()
        .route("/get", get(handle_get))
        .route("/set", post(handle_set))
        .route("/delete", post(handle_delete))
        .route("/bulk_set", post(handle_bulk_set))
        .route("/vote", post(handle_vote))
        .route("/heartbeat", post(handle_heartbeat))
        .route("/replicate", post(handle_replicate))
        .route("/replicate_set", post(handle_replicate_set))
        .route("/replicate_get", get(handle_replicate_get))
        .route("/gossip", post(handle_gossip))
        .route("/ping", get(handle_ping))
        .fallback(handle_not_found)
        .with_state(node)
}

/// Client routes plus index search for a single node; no replication
/// surface is mounted.
pub fn single_router(node: Arc<SingleNode>) -> Router {
    let core: SharedNode = node.clone();
    Router::new()
        .route("/get", get(handle_get))
        .route("/set", post(handle_set))
        .route("/delete", post(handle_delete))
        .route("/bulk_set", post(handle_bulk_set))
        .route("/ping", get(handle_ping))
        .with_state(core)
        .merge(
            Router::new()
                .route("/search/text", get(handle_search_text))
                .route("/search/similar", get(handle_search_similar))
                .with_state(node),
        )
        .fallback(handle_not_found)
}

/// A bound but not yet serving HTTP server.
///
/// Binding is split from serving so callers (and tests) can bind port 0
/// and learn the actual address before the first request arrives.
pub struct ApiServer {
    listener: TcpListener,
    router: Router,
}

impl ApiServer {
    /// Bind the server to an address.
    pub async fn bind(addr: impl tokio::net::ToSocketAddrs, router: Router) -> KvResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::from_listener(listener, router))
    }

    /// Wrap an already-bound listener. Useful when the cluster's
    /// addresses must be known before the nodes are constructed.
    pub fn from_listener(listener: TcpListener, router: Router) -> Self {
        Self { listener, router }
    }

    /// The actual bound address (resolves port 0).
    pub fn local_addr(&self) -> KvResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the process ends.
    pub async fn serve(self) -> KvResult<()> {
        axum::serve(self.listener, self.router)
            .await
            .map_err(|e| KvError::Internal(format!("server error: {e}")))
    }

    /// Serve until `shutdown` resolves, then drain and return.
    pub async fn serve_with_shutdown(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> KvResult<()> {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| KvError::Internal(format!("server error: {e}")))
    }
}

/// Map a dispatch error to its HTTP rendering.
fn error_response(error: KvError) -> axum::response::Response {
    let (status, message) = match &error {
        KvError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        KvError::KeyNotFound { .. } => (StatusCode::NOT_FOUND, "Key not found".to_string()),
        KvError::NoPrimary => (
            StatusCode::SERVICE_UNAVAILABLE,
            "No primary available".to_string(),
        ),
        KvError::QuorumUnmet { .. } => (StatusCode::SERVICE_UNAVAILABLE, error.to_string()),
        KvError::Io(_) | KvError::Serialization(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
        }
        KvError::PeerUnreachable(_) | KvError::Internal(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
        }
    };
    (status, Json(ErrorReply { error: message })).into_response()
}

/// Render the non-error dispatch outcomes a client path can produce.
fn client_response(response: Response) -> axum::response::Response {
    match response {
        Response::Value { key, value, clock } => {
            Json(ValueReply { key, value, clock }).into_response()
        }
        Response::Ok { success } => Json(json!({ "success": success })).into_response(),
        Response::Count { count } => Json(json!({ "count": count })).into_response(),
        Response::Redirect { location } => (
            StatusCode::TEMPORARY_REDIRECT,
            Json(json!({ "redirect": location })),
        )
            .into_response(),
        other => {
            tracing::error!("unexpected dispatch outcome on client path: {other:?}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_get(
    State(node): State<SharedNode>,
    Query(params): Query<KeyParams>,
) -> axum::response::Response {
    let Some(key) = params.key.filter(|k| !k.is_empty()) else {
        return error_response(KvError::BadRequest("Missing key parameter".to_string()));
    };
    match node.dispatch(Request::Get { key }).await {
        Ok(response) => client_response(response),
        Err(error) => error_response(error),
    }
}

async fn handle_set(
    State(node): State<SharedNode>,
    Json(body): Json<SetBody>,
) -> axum::response::Response {
    if body.key.is_empty() {
        return error_response(KvError::BadRequest("Missing key or value".to_string()));
    }
    let request = Request::Set {
        key: body.key,
        value: body.value,
        simulate_failure: body.simulate_failure,
    };
    match node.dispatch(request).await {
        Ok(response) => client_response(response),
        Err(error) => error_response(error),
    }
}

async fn handle_delete(
    State(node): State<SharedNode>,
    Json(body): Json<DeleteBody>,
) -> axum::response::Response {
    if body.key.is_empty() {
        return error_response(KvError::BadRequest("Missing key".to_string()));
    }
    let request = Request::Delete {
        key: body.key,
        simulate_failure: body.simulate_failure,
    };
    match node.dispatch(request).await {
        Ok(response) => client_response(response),
        Err(error) => error_response(error),
    }
}

async fn handle_bulk_set(
    State(node): State<SharedNode>,
    Json(body): Json<BulkSetBody>,
) -> axum::response::Response {
    if body.items.is_empty() {
        return error_response(KvError::BadRequest("Missing or invalid items".to_string()));
    }
    let request = Request::BulkSet {
        items: body.items,
        simulate_failure: body.simulate_failure,
    };
    match node.dispatch(request).await {
        Ok(response) => client_response(response),
        Err(error) => error_response(error),
    }
}

async fn handle_vote(
    State(node): State<SharedNode>,
    Json(body): Json<VoteBody>,
) -> axum::response::Response {
    let request = Request::Vote {
        term: body.term,
        candidate_id: body.candidate_id,
    };
    match node.dispatch(request).await {
        Ok(Response::Vote { granted, term }) => Json(VoteReply {
            vote_granted: granted,
            term,
        })
        .into_response(),
        Ok(other) => {
            tracing::error!("unexpected dispatch outcome for vote: {other:?}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(error) => error_response(error),
    }
}

async fn handle_heartbeat(
    State(node): State<SharedNode>,
    Json(body): Json<HeartbeatBody>,
) -> axum::response::Response {
    let request = Request::Heartbeat {
        term: body.term,
        leader_id: body.leader_id,
        leader_endpoint: body.leader_endpoint,
    };
    match node.dispatch(request).await {
        Ok(_) => Json(json!({ "status": "ok" })).into_response(),
        Err(error) => error_response(error),
    }
}

async fn handle_replicate(
    State(node): State<SharedNode>,
    Json(op): Json<Operation>,
) -> axum::response::Response {
    match node.dispatch(Request::ReplicateApply { op }).await {
        Ok(_) => Json(json!({ "status": "ok" })).into_response(),
        Err(error) => error_response(error),
    }
}

async fn handle_replicate_set(
    State(node): State<SharedNode>,
    Json(body): Json<ReplicateSetBody>,
) -> axum::response::Response {
    let request = Request::ReplicateSet {
        key: body.key,
        value: body.value,
        clock: body.clock,
    };
    match node.dispatch(request).await {
        Ok(Response::Ok { success }) => Json(json!({ "accepted": success })).into_response(),
        Ok(other) => {
            tracing::error!("unexpected dispatch outcome for replicate_set: {other:?}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(error) => error_response(error),
    }
}

async fn handle_replicate_get(
    State(node): State<SharedNode>,
    Query(params): Query<KeyParams>,
) -> axum::response::Response {
    let Some(key) = params.key.filter(|k| !k.is_empty()) else {
        return error_response(KvError::BadRequest("Missing key parameter".to_string()));
    };
    match node.dispatch(Request::ReplicateGet { key }).await {
        Ok(Response::PeerValue { value, clock }) => {
            Json(ReplicateGetReply { value, clock }).into_response()
        }
        Ok(other) => {
            tracing::error!("unexpected dispatch outcome for replicate_get: {other:?}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(error) => error_response(error),
    }
}

async fn handle_gossip(
    State(node): State<SharedNode>,
    Json(body): Json<GossipBody>,
) -> axum::response::Response {
    let request = Request::Gossip {
        node_id: body.node_id,
        clock: body.clock,
        value_clocks: body.value_clocks,
    };
    match node.dispatch(request).await {
        Ok(_) => Json(json!({ "status": "ok" })).into_response(),
        Err(error) => error_response(error),
    }
}

async fn handle_ping(State(node): State<SharedNode>) -> axum::response::Response {
    match node.dispatch(Request::Ping).await {
        Ok(_) => Json(json!({ "status": "ok" })).into_response(),
        Err(error) => error_response(error),
    }
}

async fn handle_search_text(
    State(node): State<Arc<SingleNode>>,
    Query(params): Query<SearchParams>,
) -> axum::response::Response {
    let Some(query) = params.q.filter(|q| !q.is_empty()) else {
        return error_response(KvError::BadRequest("Missing q parameter".to_string()));
    };
    let keys = node.indexed().search_text(&query);
    Json(json!({ "keys": keys })).into_response()
}

async fn handle_search_similar(
    State(node): State<Arc<SingleNode>>,
    Query(params): Query<SearchParams>,
) -> axum::response::Response {
    let Some(query) = params.q.filter(|q| !q.is_empty()) else {
        return error_response(KvError::BadRequest("Missing q parameter".to_string()));
    };
    let top_k = params.top_k.unwrap_or(10);
    let results = node.indexed().search_similar(&query, top_k);
    Json(json!({ "results": results })).into_response()
}

async fn handle_not_found() -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorReply {
            error: "Not found".to_string(),
        }),
    )
        .into_response()
}
