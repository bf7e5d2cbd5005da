//! Operator endpoints for peer connections and pairing.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::SharedState;
use crate::error::Result;
use crate::models::peer_connection::PeerConnection;
use crate::services::circuit_breaker::CircuitState;
use crate::services::pairing::PairingCodeView;

/// Create peer routes (nested under /api/v1/peers)
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_peers))
        .route("/handshake", post(handshake))
        .route("/connect", post(connect))
        .route("/:id", get(get_peer).delete(terminate_peer))
        .route("/:id/verify", post(verify_peer))
        .route("/:id/url", put(update_url))
        .route("/:id/reject", post(reject_peer))
}

// --- Request/Response types ---

#[derive(Debug, Deserialize)]
pub struct HandshakeBody {
    pub url: String,
    pub pairing_code: String,
    pub shared_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectBody {
    pub name: Option<String>,
    pub url: String,
    pub shared_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUrlBody {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct PeerResponse {
    #[serde(flatten)]
    pub peer: PeerConnection,
    pub bidirectional: bool,
    pub circuit: CircuitState,
}

fn to_response(state: &SharedState, peer: PeerConnection) -> PeerResponse {
    PeerResponse {
        bidirectional: peer.effective_bidirectional(),
        circuit: state.breakers.get(peer.id).state(),
        peer,
    }
}

// --- Handlers ---

pub async fn get_pairing_code(State(state): State<SharedState>) -> Json<PairingCodeView> {
    Json(state.pairing.current())
}

pub async fn list_peers(State(state): State<SharedState>) -> Result<Json<Vec<PeerResponse>>> {
    let peers = state.trust_store.list().await?;
    Ok(Json(
        peers.into_iter().map(|p| to_response(&state, p)).collect(),
    ))
}

pub async fn get_peer(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PeerResponse>> {
    let peer = state.trust_store.get(id).await?;
    Ok(Json(to_response(&state, peer)))
}

pub async fn handshake(
    State(state): State<SharedState>,
    Json(body): Json<HandshakeBody>,
) -> Result<(StatusCode, Json<PeerResponse>)> {
    let peer = state
        .handshake
        .initiate_handshake(&body.url, &body.pairing_code, body.shared_secret.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(to_response(&state, peer))))
}

pub async fn connect(
    State(state): State<SharedState>,
    Json(body): Json<ConnectBody>,
) -> Result<(StatusCode, Json<PeerResponse>)> {
    let peer = state
        .handshake
        .connect(
            body.name.as_deref(),
            &body.url,
            body.shared_secret.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(to_response(&state, peer))))
}

pub async fn verify_peer(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PeerResponse>> {
    let peer = state.handshake.verify_peer(id).await?;
    Ok(Json(to_response(&state, peer)))
}

pub async fn update_url(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateUrlBody>,
) -> Result<Json<PeerResponse>> {
    let peer = state.handshake.update_peer_url(id, &body.url).await?;
    Ok(Json(to_response(&state, peer)))
}

pub async fn terminate_peer(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    state.handshake.terminate(id).await?;
    state.breakers.reset(id);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn reject_peer(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    state.handshake.reject(id).await?;
    state.breakers.reset(id);
    Ok(StatusCode::NO_CONTENT)
}
