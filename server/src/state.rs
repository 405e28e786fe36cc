use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::logic::Annotations;
use crate::remote::{Remote, RemoteError};
use crate::storage::Storage;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
pub const BACKUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<RwLock<HashMap<String, Arc<RwLock<Session>>>>>,
    pub storage: Arc<dyn Storage>,
    pub call_timeout: Duration,
}

impl AppState {
    pub fn new(storage: Arc<dyn Storage>, call_timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            storage,
            call_timeout,
        }
    }
}

/// The websocket of the map client currently driving a session.
pub struct ClientLink {
    pub connection_id: Uuid,
    pub tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
pub struct Session {
    pub annotations: Annotations,
    pub remote: Remote,
    pub client: Option<ClientLink>,
}

impl Session {
    pub fn new(annotations: Annotations) -> Self {
        Self {
            annotations,
            ..Self::default()
        }
    }

    /// Makes `link` the session's map client. A previous client loses its
    /// pending calls and catalog.
    pub fn attach(&mut self, link: ClientLink) {
        self.annotations.start_client_session();
        if let Some(previous) = self.client.replace(link) {
            tracing::info!(conn = %previous.connection_id, "map client replaced");
            self.remote.reset();
        }
    }

    /// Returns false if `connection_id` was already replaced.
    pub fn detach(&mut self, connection_id: Uuid) -> bool {
        match &self.client {
            Some(link) if link.connection_id == connection_id => {
                self.client = None;
                self.remote.reset();
                true
            }
            _ => false,
        }
    }

    pub fn send(&self, text: String) -> Result<(), RemoteError> {
        let link = self.client.as_ref().ok_or(RemoteError::NotConnected)?;
        link.tx.send(text).map_err(|_| RemoteError::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> (ClientLink, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ClientLink {
                connection_id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    #[test]
    fn sending_requires_a_client() {
        let session = Session::default();
        assert_eq!(session.send("x".into()), Err(RemoteError::NotConnected));
    }

    #[test]
    fn a_new_client_replaces_the_old_one() {
        let mut session = Session::default();
        let (first, _first_rx) = link();
        let first_id = first.connection_id;
        session.attach(first);
        let _reply = session.remote.protocol_request();

        let (second, mut second_rx) = link();
        session.attach(second);
        assert_eq!(session.remote.pending(), 0);
        assert!(!session.detach(first_id));

        session.send("hello".into()).unwrap();
        assert_eq!(second_rx.try_recv().unwrap(), "hello");
    }

    #[test]
    fn reconnecting_clients_start_their_ids_over() {
        use geobridge_shared::{AnnotationKind, AnnotationMeta, Point};

        let meta = || AnnotationMeta {
            id: 1,
            name: "point-1".into(),
            rgb: "#db5f57".into(),
        };
        let mut session = Session::default();
        let (first, _first_rx) = link();
        let first_id = first.connection_id;
        session.attach(first);
        session
            .annotations
            .add(AnnotationKind::Point, vec![Point::new(0.0, 0.0)], meta())
            .unwrap();
        assert!(session.detach(first_id));

        let (second, _second_rx) = link();
        session.attach(second);
        session
            .annotations
            .add(AnnotationKind::Point, vec![Point::new(1.0, 1.0)], meta())
            .unwrap();
        assert_eq!(session.annotations.len(), 2);
    }
}
