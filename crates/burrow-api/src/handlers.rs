//! RPC endpoint handlers
//!
//! Every handler forwards to the shared `TunnelService`; none of them touch
//! sockets or sessions directly.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use burrow_proto::{
    ConnectRequest, ConnectResponse, ConnectionRequest, KillConnectionRequest,
    KillSessionRequest, LoginRequest, LoginResponse, MonitorResponse, ReadResponse,
    SessionRequest, VersionInfo, WriteRequest,
};
use std::sync::Arc;
use tracing::debug;

use crate::error::ApiError;
use crate::AppState;

type JsonBody<T> = Result<Json<T>, JsonRejection>;

pub async fn login(
    State(state): State<Arc<AppState>>,
    payload: JsonBody<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let Json(req) = payload?;
    debug!("Login request for user {}", req.username);

    let session_id = state.service.login(&req.username, &req.password).await?;
    Ok(Json(LoginResponse { session_id }))
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    payload: JsonBody<SessionRequest>,
) -> Result<StatusCode, ApiError> {
    let Json(req) = payload?;
    state.service.logout(&req.session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn version(State(state): State<Arc<AppState>>) -> Result<Json<VersionInfo>, ApiError> {
    Ok(Json(state.service.version().await?))
}

pub async fn ping(State(state): State<Arc<AppState>>) -> Result<StatusCode, ApiError> {
    state.service.ping().await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn connect(
    State(state): State<Arc<AppState>>,
    payload: JsonBody<ConnectRequest>,
) -> Result<Json<ConnectResponse>, ApiError> {
    let Json(req) = payload?;
    debug!("Connect request to {}", req.target);

    let connection_id = state.service.connect(&req.session_id, &req.target).await?;
    Ok(Json(ConnectResponse { connection_id }))
}

pub async fn disconnect(
    State(state): State<Arc<AppState>>,
    payload: JsonBody<ConnectionRequest>,
) -> Result<StatusCode, ApiError> {
    let Json(req) = payload?;
    state
        .service
        .disconnect(&req.session_id, req.connection_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn read(
    State(state): State<Arc<AppState>>,
    payload: JsonBody<ConnectionRequest>,
) -> Result<Json<ReadResponse>, ApiError> {
    let Json(req) = payload?;
    let response = state
        .service
        .read(&req.session_id, req.connection_id)
        .await?;
    Ok(Json(response))
}

pub async fn write(
    State(state): State<Arc<AppState>>,
    payload: JsonBody<WriteRequest>,
) -> Result<StatusCode, ApiError> {
    let Json(req) = payload?;
    state
        .service
        .write(&req.session_id, req.connection_id, req.data)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn monitor(
    State(state): State<Arc<AppState>>,
    payload: JsonBody<SessionRequest>,
) -> Result<Json<MonitorResponse>, ApiError> {
    let Json(req) = payload?;
    let sessions = state.service.monitor(&req.session_id).await?;
    Ok(Json(MonitorResponse { sessions }))
}

pub async fn kill_session(
    State(state): State<Arc<AppState>>,
    payload: JsonBody<KillSessionRequest>,
) -> Result<StatusCode, ApiError> {
    let Json(req) = payload?;
    state
        .service
        .kill_session(&req.session_id, &req.target_session_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn kill_connection(
    State(state): State<Arc<AppState>>,
    payload: JsonBody<KillConnectionRequest>,
) -> Result<StatusCode, ApiError> {
    let Json(req) = payload?;
    state
        .service
        .kill_connection(&req.session_id, &req.target_session_id, req.connection_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
