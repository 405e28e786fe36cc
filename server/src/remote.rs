//! Host-side view of a connected map client: the procedures it reported
//! and the calls still waiting for its answer.

use std::collections::HashMap;
use std::time::Duration;

use geobridge_shared::{ProcedureDescriptor, RpcError, RpcRequest, RpcResponse};
use serde_json::Value;
use tokio::sync::oneshot;

pub const PROTOCOL_PROCEDURE: &str = "get_protocol";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    #[error("map client has not reported its protocol yet")]
    NoCatalog,
    #[error("map client reported an unreadable protocol: {0}")]
    BadCatalog(String),
    #[error("no map client connected")]
    NotConnected,
    #[error("unknown procedure '{0}'")]
    UnknownProcedure(String),
    #[error("{procedure} takes {min}..={max} positional arguments, got {got}")]
    Arity {
        procedure: String,
        min: usize,
        max: usize,
        got: usize,
    },
    #[error("{procedure} is missing required parameter '{name}'")]
    MissingParam { procedure: String, name: String },
    #[error("{procedure} has no parameter '{name}'")]
    UnknownParam { procedure: String, name: String },
    #[error("params must be an array or an object")]
    BadParams,
    #[error("{0} timed out")]
    Timeout(String),
    #[error("map client disconnected before answering")]
    Disconnected,
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

pub type Reply = oneshot::Receiver<RpcResponse>;

#[derive(Default)]
pub struct Remote {
    catalog: Option<Vec<ProcedureDescriptor>>,
    last_id: u64,
    pending: HashMap<u64, oneshot::Sender<RpcResponse>>,
}

impl Remote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install_catalog(&mut self, catalog: Vec<ProcedureDescriptor>) {
        tracing::info!(procedures = catalog.len(), "map client protocol installed");
        self.catalog = Some(catalog);
    }

    pub fn catalog(&self) -> Option<&[ProcedureDescriptor]> {
        self.catalog.as_deref()
    }

    /// Forgets the catalog, e.g. when a new map client takes over.
    pub fn reset(&mut self) {
        self.catalog = None;
        self.fail_all();
    }

    /// The one call that needs no catalog.
    pub fn protocol_request(&mut self) -> (RpcRequest, Reply) {
        self.register(PROTOCOL_PROCEDURE, Value::Array(Vec::new()))
    }

    /// Checks `params` against the reported signature and registers the
    /// call. Nothing is registered when validation fails.
    pub fn prepare_call(
        &mut self,
        procedure: &str,
        params: Value,
    ) -> Result<(RpcRequest, Reply), RemoteError> {
        if procedure == PROTOCOL_PROCEDURE {
            return Ok(self.protocol_request());
        }
        let catalog = self.catalog.as_ref().ok_or(RemoteError::NoCatalog)?;
        let descriptor = catalog
            .iter()
            .find(|entry| entry.procedure == procedure)
            .ok_or_else(|| RemoteError::UnknownProcedure(procedure.to_string()))?;
        validate(descriptor, &params)?;
        Ok(self.register(procedure, params))
    }

    fn register(&mut self, procedure: &str, params: Value) -> (RpcRequest, Reply) {
        self.last_id += 1;
        let id = self.last_id;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        tracing::debug!(procedure, id, "call registered");
        (RpcRequest::new(procedure, params, id), rx)
    }

    pub fn resolve(&mut self, response: RpcResponse) -> bool {
        let Some(tx) = response
            .numeric_id()
            .and_then(|id| self.pending.remove(&id))
        else {
            tracing::warn!(id = ?response.id, "response for unknown call");
            return false;
        };
        let _ = tx.send(response);
        true
    }

    /// Drops a call nobody waits for anymore.
    pub fn forget(&mut self, request: &RpcRequest) {
        if let Some(id) = request.id.as_ref().and_then(Value::as_u64) {
            self.pending.remove(&id);
        }
    }

    pub fn fail_all(&mut self) -> usize {
        let dropped = self.pending.drain().count();
        if dropped > 0 {
            tracing::warn!(dropped, "map client calls abandoned");
        }
        dropped
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

fn validate(descriptor: &ProcedureDescriptor, params: &Value) -> Result<(), RemoteError> {
    let procedure = &descriptor.procedure;
    match params {
        Value::Null => check_arity(descriptor, 0),
        Value::Array(items) => check_arity(descriptor, items.len()),
        Value::Object(named) => {
            if let Some(missing) = descriptor
                .required
                .iter()
                .find(|param| !named.contains_key(&param.name))
            {
                return Err(RemoteError::MissingParam {
                    procedure: procedure.clone(),
                    name: missing.name.clone(),
                });
            }
            if let Some(unknown) = named
                .keys()
                .find(|key| !descriptor.params().any(|param| &param.name == *key))
            {
                return Err(RemoteError::UnknownParam {
                    procedure: procedure.clone(),
                    name: unknown.clone(),
                });
            }
            Ok(())
        }
        _ => Err(RemoteError::BadParams),
    }
}

fn check_arity(descriptor: &ProcedureDescriptor, got: usize) -> Result<(), RemoteError> {
    let arity = descriptor.arity();
    if arity.contains(&got) {
        return Ok(());
    }
    Err(RemoteError::Arity {
        procedure: descriptor.procedure.clone(),
        min: *arity.start(),
        max: *arity.end(),
        got,
    })
}

/// Waits for the map client's answer to one call.
pub async fn await_reply(
    reply: Reply,
    procedure: &str,
    timeout: Duration,
) -> Result<Value, RemoteError> {
    match tokio::time::timeout(timeout, reply).await {
        Err(_) => Err(RemoteError::Timeout(procedure.to_string())),
        Ok(Err(_)) => Err(RemoteError::Disconnected),
        Ok(Ok(response)) => Ok(response.into_result()?),
    }
}
