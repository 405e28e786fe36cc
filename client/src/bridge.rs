use std::cell::RefCell;
use std::rc::Rc;

use geobridge_shared::{RpcMessage, RpcResponse};

use crate::annotations::{AnnotationError, DrawEvent, Submission};
use crate::commands::MapClient;
use crate::diagnostics::DiagnosticSink;
use crate::engine::{DrawSurface, MapEngine};
use crate::host::{Outbound, RpcHost};
use crate::state::ClientConfig;

/// Connects a [`MapClient`] to one host over a text transport. Frames
/// from the host are either calls into the map or answers to our own
/// `add_annotation` calls.
pub struct ClientBridge<M, T> {
    client: MapClient<M>,
    host: Rc<RpcHost<T>>,
}

impl<M, T> ClientBridge<M, T>
where
    M: MapEngine + DrawSurface + 'static,
    T: Outbound + 'static,
{
    pub fn new(
        map: Rc<RefCell<M>>,
        outbound: T,
        sink: Rc<dyn DiagnosticSink>,
        config: ClientConfig,
    ) -> Self {
        let host = Rc::new(RpcHost::new(outbound));
        let client = MapClient::with_config(map, host.clone(), sink, config);
        Self { client, host }
    }

    /// Handles one incoming frame and returns the reply to send, if any.
    pub fn handle_frame(&mut self, text: &str) -> Option<String> {
        let reply = match RpcMessage::parse(text) {
            Ok(RpcMessage::Request(request)) => self.client.dispatch(&request)?,
            Ok(RpcMessage::Response(response)) => {
                self.host.resolve(response);
                return None;
            }
            Err(error) => {
                tracing::warn!(code = error.code, "bad frame from host: {}", error.message);
                RpcResponse::failure(None, error)
            }
        };
        match serde_json::to_string(&reply) {
            Ok(text) => Some(text),
            Err(error) => {
                tracing::error!("failed to encode reply: {error}");
                None
            }
        }
    }

    pub fn handle_draw_event(
        &mut self,
        event: DrawEvent,
    ) -> Result<Option<Submission>, AnnotationError> {
        self.client.handle_draw_event(event)
    }

    /// Fails every call still waiting on the host.
    pub fn connection_lost(&self) -> usize {
        self.host.fail_pending()
    }

    pub fn client(&self) -> &MapClient<M> {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut MapClient<M> {
        &mut self.client
    }

    pub fn host(&self) -> &RpcHost<T> {
        &self.host
    }
}
