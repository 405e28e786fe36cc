use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use geobridge_shared::{AnnotationRecord, ProcedureDescriptor};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::logic::apply_client_frame;
use crate::remote::{RemoteError, PROTOCOL_PROCEDURE};
use crate::sessions::{
    call_map_client, close_session, ensure_catalog, get_or_create_session, get_session,
    normalize_session_id, refresh_catalog,
};
use crate::sld::{multiband_raster_sld, single_band_raster_sld, MultibandOptions, SingleBandOptions, SldError};
use crate::state::{AppState, ClientLink, Session};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unknown session")]
    UnknownSession,
    #[error("invalid request body: {0}")]
    Body(String),
    #[error(transparent)]
    Style(#[from] SldError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::UnknownSession => StatusCode::NOT_FOUND,
            ApiError::Body(_) | ApiError::Style(_) => StatusCode::BAD_REQUEST,
            ApiError::Remote(error) => match error {
                RemoteError::NoCatalog | RemoteError::NotConnected | RemoteError::Disconnected => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                RemoteError::UnknownProcedure(_) => StatusCode::NOT_FOUND,
                RemoteError::Arity { .. }
                | RemoteError::MissingParam { .. }
                | RemoteError::UnknownParam { .. }
                | RemoteError::BadParams => StatusCode::BAD_REQUEST,
                RemoteError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                RemoteError::Rpc(_) | RemoteError::BadCatalog(_) => StatusCode::BAD_GATEWAY,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match &self {
            ApiError::Remote(RemoteError::Rpc(error)) => json!({
                "error": error.message,
                "code": error.code,
                "data": error.data,
            }),
            other => json!({ "error": other.to_string() }),
        };
        (self.status(), Json(body)).into_response()
    }
}

async fn existing_session(
    state: &AppState,
    session_id: &str,
) -> Result<Arc<RwLock<Session>>, ApiError> {
    let session_id = normalize_session_id(session_id).ok_or(ApiError::UnknownSession)?;
    get_session(state, &session_id)
        .await
        .ok_or(ApiError::UnknownSession)
}

pub async fn ws_handler(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let session_id = match normalize_session_id(&session_id) {
        Some(id) => id,
        None => return StatusCode::NOT_FOUND.into_response(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, session_id: String) {
    let (mut socket_sender, mut socket_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let connection_id = Uuid::new_v4();
    let replies = tx.clone();

    let session = get_or_create_session(&state, &session_id).await;
    session
        .write()
        .await
        .attach(ClientLink { connection_id, tx });
    tracing::info!(session = %session_id, conn = %connection_id, "map client connected");

    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if socket_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });
    let protocol_task = tokio::spawn(fetch_protocol(
        session.clone(),
        session_id.clone(),
        state.call_timeout,
    ));

    while let Some(Ok(message)) = socket_receiver.next().await {
        match message {
            Message::Text(text) => {
                let reply = apply_client_frame(&mut *session.write().await, &text);
                if let Some(reply) = reply {
                    if replies.send(reply).is_err() {
                        break;
                    }
                }
            }
            Message::Binary(_) => {
                tracing::warn!(session = %session_id, "binary frame ignored");
            }
            Message::Close(frame) => {
                if let Some(frame) = &frame {
                    tracing::debug!(
                        session = %session_id,
                        code = frame.code,
                        reason = %frame.reason,
                        "close frame"
                    );
                }
                break;
            }
            _ => {}
        }
    }

    protocol_task.abort();
    send_task.abort();
    let detached = session.write().await.detach(connection_id);
    tracing::info!(session = %session_id, conn = %connection_id, "map client disconnected");
    if detached {
        close_session(&state, &session_id, &session).await;
    }
}

/// First attempt at the client's catalog. Later requests retry through
/// `ensure_catalog` if this one fails.
async fn fetch_protocol(session: Arc<RwLock<Session>>, session_id: String, timeout: Duration) {
    if let Err(error) = refresh_catalog(&session, timeout).await {
        tracing::warn!(session = %session_id, "could not fetch map client protocol: {error}");
    }
}

pub async fn protocol_handler(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<ProcedureDescriptor>>, ApiError> {
    let session = existing_session(&state, &session_id).await?;
    let catalog = ensure_catalog(&session, state.call_timeout).await?;
    Ok(Json(catalog))
}

/// Body is the JSON params (array, object or empty).
pub async fn call_handler(
    Path((session_id, procedure)): Path<(String, String)>,
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let params = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).map_err(|error| ApiError::Body(error.to_string()))?
    };
    let session = existing_session(&state, &session_id).await?;
    if procedure == PROTOCOL_PROCEDURE {
        let catalog = refresh_catalog(&session, state.call_timeout).await?;
        return Ok(Json(json!(catalog)));
    }
    ensure_catalog(&session, state.call_timeout).await?;
    let result = call_map_client(&session, &procedure, params, state.call_timeout).await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct WmsRequest {
    pub layer_name: String,
    pub base_url: String,
    #[serde(default)]
    pub style: Option<WmsStyle>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WmsStyle {
    Multiband {
        #[serde(default)]
        options: MultibandOptions,
    },
    SingleBand {
        band: i64,
        #[serde(default)]
        options: SingleBandOptions,
    },
}

impl WmsRequest {
    /// Positional params for the map client's `add_wms_layer`.
    pub fn params(&self) -> Result<Value, SldError> {
        let sld = match &self.style {
            None => return Ok(json!([self.layer_name, self.base_url])),
            Some(WmsStyle::Multiband { options }) => {
                multiband_raster_sld(&self.layer_name, options)?
            }
            Some(WmsStyle::SingleBand { band, options }) => {
                single_band_raster_sld(&self.layer_name, *band, options)
            }
        };
        Ok(json!([self.layer_name, self.base_url, { "SLD_BODY": sld }]))
    }
}

pub async fn wms_handler(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<WmsRequest>,
) -> Result<Json<Value>, ApiError> {
    let params = request.params()?;
    let session = existing_session(&state, &session_id).await?;
    ensure_catalog(&session, state.call_timeout).await?;
    let result = call_map_client(&session, "add_wms_layer", params, state.call_timeout).await?;
    tracing::info!(session = %session_id, layer = %request.layer_name, "wms layer requested");
    Ok(Json(result))
}

pub async fn annotations_handler(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<AnnotationRecord>>, ApiError> {
    let session_id = normalize_session_id(&session_id).ok_or(ApiError::UnknownSession)?;
    let session = get_or_create_session(&state, &session_id).await;
    let annotations = session.read().await.annotations.list();
    Ok(Json(annotations))
}
