use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use futures_util::future::LocalBoxFuture;
use futures_util::FutureExt;
use geobridge_shared::{AnnotationKind, AnnotationMeta, Point, RpcError, RpcRequest, RpcResponse};
use serde_json::{json, Value};
use tokio::sync::oneshot;

pub type HostFuture = LocalBoxFuture<'static, Result<(), RpcError>>;

/// Procedures the host exposes to the map client.
pub trait Host {
    fn add_annotation(
        &self,
        kind: AnnotationKind,
        coordinates: Vec<Point>,
        meta: AnnotationMeta,
    ) -> HostFuture;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("transport unavailable: {0}")]
pub struct TransportError(pub String);

/// Sends one text frame towards the host.
pub trait Outbound {
    fn send(&self, text: String) -> Result<(), TransportError>;
}

impl<F> Outbound for F
where
    F: Fn(String) -> Result<(), TransportError>,
{
    fn send(&self, text: String) -> Result<(), TransportError> {
        self(text)
    }
}

/// JSON-RPC client half: numbers outgoing requests and completes them when
/// the matching response frame arrives.
pub struct RpcHost<T> {
    outbound: T,
    last_id: Cell<u64>,
    pending: RefCell<HashMap<u64, oneshot::Sender<RpcResponse>>>,
}

impl<T: Outbound> RpcHost<T> {
    pub fn new(outbound: T) -> Self {
        Self {
            outbound,
            last_id: Cell::new(0),
            pending: RefCell::new(HashMap::new()),
        }
    }

    pub fn call(
        &self,
        method: &str,
        params: Value,
    ) -> LocalBoxFuture<'static, Result<Value, RpcError>> {
        let id = self.last_id.get() + 1;
        self.last_id.set(id);
        let request = RpcRequest::new(method, params, id);
        let text = match serde_json::to_string(&request) {
            Ok(text) => text,
            Err(error) => return rejected(RpcError::internal(error.to_string())),
        };

        let (tx, rx) = oneshot::channel();
        self.pending.borrow_mut().insert(id, tx);
        if let Err(error) = self.outbound.send(text) {
            self.pending.borrow_mut().remove(&id);
            tracing::warn!(method, id, "host call not sent: {error}");
            return rejected(RpcError::internal(error.to_string()));
        }
        tracing::debug!(method, id, "host call sent");

        async move {
            match rx.await {
                Ok(response) => response.into_result(),
                Err(_) => Err(RpcError::internal("connection to host lost")),
            }
        }
        .boxed_local()
    }

    /// Completes the call `response` answers. Returns false for responses
    /// nobody is waiting on.
    pub fn resolve(&self, response: RpcResponse) -> bool {
        let Some(id) = response.numeric_id() else {
            tracing::warn!(id = ?response.id, "host response without a usable id");
            return false;
        };
        let Some(tx) = self.pending.borrow_mut().remove(&id) else {
            tracing::warn!(id, "host response for unknown call");
            return false;
        };
        // The caller may have dropped its future; nothing to do then.
        let _ = tx.send(response);
        true
    }

    /// Rejects every in-flight call, e.g. after the connection dropped.
    pub fn fail_pending(&self) -> usize {
        let dropped = self.pending.borrow_mut().drain().count();
        if dropped > 0 {
            tracing::warn!(dropped, "failing in-flight host calls");
        }
        dropped
    }

    pub fn pending(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn outbound(&self) -> &T {
        &self.outbound
    }
}

fn rejected(error: RpcError) -> LocalBoxFuture<'static, Result<Value, RpcError>> {
    futures_util::future::ready(Err(error)).boxed_local()
}

impl<T: Outbound> Host for RpcHost<T> {
    fn add_annotation(
        &self,
        kind: AnnotationKind,
        coordinates: Vec<Point>,
        meta: AnnotationMeta,
    ) -> HostFuture {
        self.call("add_annotation", json!([kind, coordinates, meta]))
            .map(|result| result.map(|_| ()))
            .boxed_local()
    }
}
