use std::sync::Arc;
use std::time::Duration;

use geobridge_shared::{ProcedureDescriptor, RpcError};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::logic::Annotations;
use crate::remote::{await_reply, RemoteError, PROTOCOL_PROCEDURE};
use crate::state::{AppState, Session};
use crate::storage::Storage;

pub fn normalize_session_id(value: &str) -> Option<String> {
    let parsed = Uuid::parse_str(value).ok()?;
    Some(parsed.to_string())
}

pub async fn get_session(state: &AppState, session_id: &str) -> Option<Arc<RwLock<Session>>> {
    state.sessions.read().await.get(session_id).cloned()
}

pub async fn get_or_create_session(state: &AppState, session_id: &str) -> Arc<RwLock<Session>> {
    if let Some(session) = get_session(state, session_id).await {
        return session;
    }
    let annotations = match state.storage.load_session(session_id).await {
        Ok(Some(snapshot)) => {
            tracing::info!(session = session_id, "session restored");
            Annotations::from_snapshot(snapshot)
        }
        Ok(None) => {
            tracing::info!(session = session_id, "session created");
            Annotations::default()
        }
        Err(error) => {
            tracing::error!(session = session_id, "failed to load session: {error}");
            Annotations::default()
        }
    };
    let session = Arc::new(RwLock::new(Session::new(annotations)));
    let mut sessions = state.sessions.write().await;
    sessions
        .entry(session_id.to_string())
        .or_insert_with(|| session.clone())
        .clone()
}

/// Writes the session's annotations if they changed since the last save.
pub async fn save_session_if_dirty(state: &AppState, session_id: &str, session: &RwLock<Session>) {
    let Some(snapshot) = session.write().await.annotations.take_dirty() else {
        return;
    };
    let count = snapshot.annotations.len();
    match state.storage.save_session(session_id, &snapshot).await {
        Ok(()) => tracing::info!(session = session_id, annotations = count, "session saved"),
        Err(error) => {
            tracing::error!(session = session_id, "failed to save session: {error}");
            // Try again on the next pass.
            session.write().await.annotations.mark_dirty();
        }
    }
}

/// Saves what is left of a session whose client went away and drops it from
/// memory once nothing would be lost. Returns true if it was evicted.
pub async fn close_session(
    state: &AppState,
    session_id: &str,
    session: &Arc<RwLock<Session>>,
) -> bool {
    save_session_if_dirty(state, session_id, session).await;
    let mut sessions = state.sessions.write().await;
    {
        let current = session.read().await;
        if current.client.is_some() {
            return false;
        }
        if current.annotations.is_dirty() {
            tracing::warn!(session = session_id, "keeping unsaved session in memory");
            return false;
        }
    }
    match sessions.get(session_id) {
        Some(current) if Arc::ptr_eq(current, session) => {
            sessions.remove(session_id);
            tracing::debug!(session = session_id, "session evicted");
            true
        }
        _ => false,
    }
}

pub async fn save_all_sessions(state: &AppState) {
    let sessions: Vec<_> = state
        .sessions
        .read()
        .await
        .iter()
        .map(|(session_id, session)| (session_id.clone(), session.clone()))
        .collect();
    for (session_id, session) in sessions {
        save_session_if_dirty(state, &session_id, &session).await;
    }
}

/// Calls a procedure on the session's map client and waits for the answer.
pub async fn call_map_client(
    session: &RwLock<Session>,
    procedure: &str,
    params: Value,
    timeout: Duration,
) -> Result<Value, RemoteError> {
    let (request, reply) = {
        let mut session = session.write().await;
        if session.client.is_none() {
            return Err(RemoteError::NotConnected);
        }
        let (request, reply) = session.remote.prepare_call(procedure, params)?;
        let sent = serde_json::to_string(&request)
            .map_err(|error| RemoteError::Rpc(RpcError::internal(error.to_string())))
            .and_then(|text| session.send(text));
        if let Err(error) = sent {
            session.remote.forget(&request);
            return Err(error);
        }
        (request, reply)
    };
    tracing::debug!(procedure, "waiting for map client");
    let outcome = await_reply(reply, procedure, timeout).await;
    if matches!(outcome, Err(RemoteError::Timeout(_))) {
        session.write().await.remote.forget(&request);
    }
    outcome
}

/// Asks the map client for its procedures and installs them as the
/// session's catalog.
pub async fn refresh_catalog(
    session: &RwLock<Session>,
    timeout: Duration,
) -> Result<Vec<ProcedureDescriptor>, RemoteError> {
    let value = call_map_client(session, PROTOCOL_PROCEDURE, Value::Array(Vec::new()), timeout).await?;
    let catalog: Vec<ProcedureDescriptor> =
        serde_json::from_value(value).map_err(|error| RemoteError::BadCatalog(error.to_string()))?;
    session.write().await.remote.install_catalog(catalog.clone());
    Ok(catalog)
}

/// The installed catalog, fetched first if the client has not reported one.
pub async fn ensure_catalog(
    session: &RwLock<Session>,
    timeout: Duration,
) -> Result<Vec<ProcedureDescriptor>, RemoteError> {
    if let Some(catalog) = session.read().await.remote.catalog() {
        return Ok(catalog.to_vec());
    }
    refresh_catalog(session, timeout).await
}
