//! Turns finished drawings into host-tracked annotation records.
//!
//! Every accepted draw event allocates an id and a color synchronously and
//! issues exactly one `add_annotation` call. The call's outcome is handled
//! by the [`Submission`] task, which the event loop must spawn; the draw
//! handler never waits on the host.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use futures_util::future::LocalBoxFuture;
use futures_util::FutureExt;
use geobridge_shared::{AnnotationKind, AnnotationRecord, Point, RpcError};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::diagnostics::DiagnosticSink;
use crate::engine::{DrawSurface, FeatureStyle};
use crate::host::Host;
use crate::state::ClientSession;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DrawEvent {
    Create { feature: Feature },
    State { feature: Feature },
    Update { feature: Feature },
    Delete { feature: Feature },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Feature {
    #[serde(default)]
    pub id: Option<Value>,
    pub geometry: Geometry,
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
}

impl Feature {
    /// The draw surface's handle for this feature, if it gave one.
    pub fn feature_id(&self) -> Option<String> {
        match self.id.as_ref()? {
            Value::String(id) => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }

    fn explicit_name(&self) -> Option<&str> {
        self.properties
            .as_ref()?
            .get("name")?
            .as_str()
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Geometry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub coordinates: Value,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AnnotationError {
    #[error("unsupported geometry type '{0}'")]
    UnsupportedGeometry(String),
    #[error("invalid {kind} coordinates: {reason}")]
    InvalidCoordinates { kind: AnnotationKind, reason: String },
}

/// The geometries that can become annotations.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Point(Point),
    /// Outer ring only.
    Polygon(Vec<Point>),
    Rectangle(Vec<Point>),
}

impl Shape {
    pub fn from_geometry(geometry: &Geometry) -> Result<Self, AnnotationError> {
        match geometry.kind.as_str() {
            "Point" | "point" => {
                let position = parse_position(AnnotationKind::Point, &geometry.coordinates)?;
                Ok(Shape::Point(position))
            }
            "Polygon" | "polygon" => {
                outer_ring(AnnotationKind::Polygon, &geometry.coordinates).map(Shape::Polygon)
            }
            "Rectangle" | "rectangle" => {
                outer_ring(AnnotationKind::Rectangle, &geometry.coordinates).map(Shape::Rectangle)
            }
            other => Err(AnnotationError::UnsupportedGeometry(other.to_string())),
        }
    }

    pub fn kind(&self) -> AnnotationKind {
        match self {
            Shape::Point(_) => AnnotationKind::Point,
            Shape::Polygon(_) => AnnotationKind::Polygon,
            Shape::Rectangle(_) => AnnotationKind::Rectangle,
        }
    }

    pub fn into_points(self) -> Vec<Point> {
        match self {
            Shape::Point(point) => vec![point],
            Shape::Polygon(ring) | Shape::Rectangle(ring) => ring,
        }
    }
}

fn invalid(kind: AnnotationKind, reason: impl Into<String>) -> AnnotationError {
    AnnotationError::InvalidCoordinates {
        kind,
        reason: reason.into(),
    }
}

fn parse_position(kind: AnnotationKind, value: &Value) -> Result<Point, AnnotationError> {
    let Some(items) = value.as_array() else {
        return Err(invalid(kind, "position is not an array"));
    };
    match (items.first().and_then(Value::as_f64), items.get(1).and_then(Value::as_f64)) {
        (Some(lon), Some(lat)) => Ok(Point::from_lon_lat([lon, lat])),
        _ => Err(invalid(kind, "position needs numeric longitude and latitude")),
    }
}

fn outer_ring(kind: AnnotationKind, value: &Value) -> Result<Vec<Point>, AnnotationError> {
    let ring = value
        .as_array()
        .and_then(|rings| rings.first())
        .and_then(Value::as_array)
        .ok_or_else(|| invalid(kind, "missing outer ring"))?;
    if ring.is_empty() {
        return Err(invalid(kind, "outer ring is empty"));
    }
    ring.iter()
        .map(|position| parse_position(kind, position))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncState {
    Drawn,
    Submitting,
    Synced,
    Failed(RpcError),
}

#[derive(Debug, Clone)]
struct Tracked {
    record: AnnotationRecord,
    feature_id: Option<String>,
    state: SyncState,
}

type Registry = Rc<RefCell<BTreeMap<u64, Tracked>>>;

/// A record on its way to the host. `task` resolves once the host answered
/// and the local state has been updated.
pub struct Submission {
    pub record: AnnotationRecord,
    pub task: LocalBoxFuture<'static, SyncState>,
}

impl fmt::Debug for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submission")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

pub struct AnnotationSync {
    session: ClientSession,
    surface: Rc<RefCell<dyn DrawSurface>>,
    host: Rc<dyn Host>,
    sink: Rc<dyn DiagnosticSink>,
    tracked: Registry,
}

impl AnnotationSync {
    pub fn new(
        session: ClientSession,
        surface: Rc<RefCell<dyn DrawSurface>>,
        host: Rc<dyn Host>,
        sink: Rc<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            session,
            surface,
            host,
            sink,
            tracked: Rc::new(RefCell::new(BTreeMap::new())),
        }
    }

    pub fn handle_event(&mut self, event: DrawEvent) -> Result<Option<Submission>, AnnotationError> {
        match event {
            DrawEvent::Create { feature } | DrawEvent::State { feature } => {
                self.submit(&feature).map(Some)
            }
            DrawEvent::Update { feature } => {
                tracing::debug!(feature = ?feature.feature_id(), "draw update ignored");
                Ok(None)
            }
            DrawEvent::Delete { feature } => {
                tracing::debug!(feature = ?feature.feature_id(), "draw delete ignored");
                Ok(None)
            }
        }
    }

    fn submit(&mut self, feature: &Feature) -> Result<Submission, AnnotationError> {
        let shape = Shape::from_geometry(&feature.geometry)?;
        let kind = shape.kind();
        let id = self.session.next_id();
        let rgb = self.session.next_color();
        let name = feature
            .explicit_name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{kind}-{id}"));
        let record = AnnotationRecord {
            id,
            name,
            kind,
            coordinates: shape.into_points(),
            rgb,
        };

        let feature_id = feature.feature_id();
        if let Some(feature_id) = &feature_id {
            let style = FeatureStyle::annotation(record.rgb.clone());
            if !self.surface.borrow_mut().set_style(feature_id, &style) {
                tracing::debug!(feature = %feature_id, "feature gone before it could be styled");
            }
        }
        self.tracked.borrow_mut().insert(
            id,
            Tracked {
                record: record.clone(),
                feature_id,
                state: SyncState::Drawn,
            },
        );
        let call = self
            .host
            .add_annotation(kind, record.coordinates.clone(), record.meta());
        set_state(&self.tracked, id, SyncState::Submitting);
        tracing::debug!(id, %kind, "annotation submitted");

        let tracked = self.tracked.clone();
        let surface = self.surface.clone();
        let sink = self.sink.clone();
        let task = async move {
            let outcome = call.await;
            complete(&tracked, &surface, sink.as_ref(), id, outcome)
        }
        .boxed_local();

        Ok(Submission { record, task })
    }

    /// Drops every drawn feature and its sync state without telling the
    /// host. Calls still in flight complete against nothing.
    pub fn clear(&mut self) -> usize {
        let removed = self.surface.borrow_mut().remove_all();
        let forgotten = std::mem::take(&mut *self.tracked.borrow_mut()).len();
        tracing::debug!(removed, forgotten, "annotations cleared");
        removed
    }

    pub fn state(&self, id: u64) -> Option<SyncState> {
        self.tracked.borrow().get(&id).map(|tracked| tracked.state.clone())
    }

    pub fn records(&self) -> Vec<AnnotationRecord> {
        self.tracked
            .borrow()
            .values()
            .map(|tracked| tracked.record.clone())
            .collect()
    }
}

fn set_state(tracked: &Registry, id: u64, state: SyncState) -> bool {
    match tracked.borrow_mut().get_mut(&id) {
        Some(entry) => {
            entry.state = state;
            true
        }
        None => false,
    }
}

fn complete(
    tracked: &Registry,
    surface: &Rc<RefCell<dyn DrawSurface>>,
    sink: &dyn DiagnosticSink,
    id: u64,
    outcome: Result<(), RpcError>,
) -> SyncState {
    let state = match outcome {
        Ok(()) => SyncState::Synced,
        Err(error) => {
            sink.rpc_error(&error);
            SyncState::Failed(error)
        }
    };
    if !set_state(tracked, id, state.clone()) {
        tracing::debug!(id, "host answered for a cleared annotation");
        return state;
    }
    if state == SyncState::Synced {
        let feature_id = tracked
            .borrow()
            .get(&id)
            .and_then(|entry| entry.feature_id.clone());
        if let Some(feature_id) = feature_id {
            surface.borrow_mut().mark_synced(&feature_id);
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::engine::HeadlessMap;
    use crate::host::HostFuture;
    use crate::palette::ANNOTATION_PALETTE;
    use geobridge_shared::AnnotationMeta;
    use serde_json::json;
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct ScriptedHost {
        calls: RefCell<Vec<(AnnotationKind, Vec<Point>, AnnotationMeta)>>,
        replies: RefCell<Vec<oneshot::Sender<Result<(), RpcError>>>>,
    }

    impl Host for ScriptedHost {
        fn add_annotation(
            &self,
            kind: AnnotationKind,
            coordinates: Vec<Point>,
            meta: AnnotationMeta,
        ) -> HostFuture {
            self.calls.borrow_mut().push((kind, coordinates, meta));
            let (tx, rx) = oneshot::channel();
            self.replies.borrow_mut().push(tx);
            async move { rx.await.unwrap_or_else(|_| Err(RpcError::internal("dropped"))) }
                .boxed_local()
        }
    }

    impl ScriptedHost {
        fn reply(&self, index: usize, outcome: Result<(), RpcError>) {
            let tx = std::mem::replace(
                &mut self.replies.borrow_mut()[index],
                oneshot::channel().0,
            );
            tx.send(outcome).unwrap();
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        errors: RefCell<Vec<RpcError>>,
        debugs: Cell<usize>,
    }

    impl DiagnosticSink for RecordingSink {
        fn rpc_error(&self, error: &RpcError) {
            self.errors.borrow_mut().push(error.clone());
        }

        fn debug(&self, _message: &str) {
            self.debugs.set(self.debugs.get() + 1);
        }
    }

    struct Fixture {
        sync: AnnotationSync,
        map: Rc<RefCell<HeadlessMap>>,
        host: Rc<ScriptedHost>,
        sink: Rc<RecordingSink>,
    }

    fn fixture() -> Fixture {
        let map = Rc::new(RefCell::new(HeadlessMap::new()));
        let host = Rc::new(ScriptedHost::default());
        let sink = Rc::new(RecordingSink::default());
        let sync = AnnotationSync::new(
            ClientSession::default(),
            map.clone(),
            host.clone(),
            sink.clone(),
        );
        Fixture {
            sync,
            map,
            host,
            sink,
        }
    }

    fn event(value: Value) -> DrawEvent {
        serde_json::from_value(value).unwrap()
    }

    fn point_event(id: &str, lon: f64, lat: f64) -> DrawEvent {
        event(json!({
            "type": "create",
            "feature": {"id": id, "geometry": {"type": "Point", "coordinates": [lon, lat]}}
        }))
    }

    #[test]
    fn polygon_becomes_record_with_outer_ring() {
        let mut f = fixture();
        let submission = f
            .sync
            .handle_event(event(json!({
                "type": "create",
                "feature": {
                    "id": "f1",
                    "geometry": {
                        "type": "Polygon",
                        "coordinates": [
                            [[0, 0], [0, 1], [1, 1], [1, 0], [0, 0]],
                            [[0.2, 0.2], [0.2, 0.4], [0.4, 0.4], [0.2, 0.2]]
                        ]
                    }
                }
            })))
            .unwrap()
            .unwrap();

        let record = &submission.record;
        assert_eq!(record.kind, AnnotationKind::Polygon);
        assert_eq!(record.name, "polygon-1");
        assert_eq!(record.rgb, ANNOTATION_PALETTE[0]);
        assert_eq!(
            record.coordinates,
            [(0.0, 0.0), (0.0, 1.0), (1.0, 1.0), (1.0, 0.0), (0.0, 0.0)]
                .map(|(x, y)| Point::new(x, y))
        );
        let calls = f.host.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, AnnotationKind::Polygon);
        assert_eq!(calls[0].1, record.coordinates);
        assert_eq!(calls[0].2, record.meta());
    }

    #[test]
    fn drawn_feature_is_painted_with_its_color() {
        let mut f = fixture();
        f.map.borrow_mut().draw_feature("a");
        f.map.borrow_mut().draw_feature("b");
        f.sync.handle_event(point_event("a", 0.0, 0.0)).unwrap().unwrap();
        f.sync.handle_event(point_event("b", 1.0, 1.0)).unwrap().unwrap();

        let map = f.map.borrow();
        let first = map.style("a").unwrap();
        assert_eq!(first.fill_color, ANNOTATION_PALETTE[0]);
        assert_eq!(first.fill_opacity, 0.8);
        assert_eq!(first.stroke_width, 2.0);
        assert_eq!(map.style("b").unwrap().fill_color, ANNOTATION_PALETTE[1]);
    }

    #[test]
    fn unsupported_geometry_makes_no_call_and_allocates_nothing() {
        let mut f = fixture();
        let error = f
            .sync
            .handle_event(event(json!({
                "type": "create",
                "feature": {"geometry": {"type": "LineString", "coordinates": [[0, 0], [1, 1]]}}
            })))
            .unwrap_err();
        assert_eq!(error, AnnotationError::UnsupportedGeometry("LineString".into()));
        assert!(f.host.calls.borrow().is_empty());

        let next = f.sync.handle_event(point_event("p", 1.0, 1.0)).unwrap().unwrap();
        assert_eq!(next.record.id, 1);
        assert_eq!(next.record.rgb, ANNOTATION_PALETTE[0]);
    }

    #[test]
    fn ids_and_colors_follow_event_order() {
        let mut f = fixture();
        for n in 0..12u64 {
            let submission = f
                .sync
                .handle_event(point_event(&format!("p{n}"), 0.0, 0.0))
                .unwrap()
                .unwrap();
            assert_eq!(submission.record.id, n + 1);
            assert_eq!(submission.record.rgb, ANNOTATION_PALETTE[n as usize % 10]);
            assert_eq!(submission.record.name, format!("point-{}", n + 1));
        }
    }

    #[test]
    fn rectangle_from_state_event_and_explicit_name() {
        let mut f = fixture();
        let submission = f
            .sync
            .handle_event(event(json!({
                "type": "state",
                "feature": {
                    "geometry": {
                        "type": "rectangle",
                        "coordinates": [[[0, 0], [2, 0], [2, 1], [0, 1]]]
                    },
                    "properties": {"name": "field A"}
                }
            })))
            .unwrap()
            .unwrap();
        assert_eq!(submission.record.kind, AnnotationKind::Rectangle);
        assert_eq!(submission.record.name, "field A");
        assert_eq!(submission.record.coordinates.len(), 4);
    }

    #[test]
    fn update_and_delete_are_only_logged() {
        let mut f = fixture();
        for kind in ["update", "delete"] {
            let outcome = f.sync.handle_event(event(json!({
                "type": kind,
                "feature": {"geometry": {"type": "Point", "coordinates": [0, 0]}}
            })));
            assert!(outcome.unwrap().is_none());
        }
        assert!(f.host.calls.borrow().is_empty());
    }

    #[test]
    fn malformed_coordinates_are_rejected() {
        let mut f = fixture();
        let error = f
            .sync
            .handle_event(event(json!({
                "type": "create",
                "feature": {"geometry": {"type": "Point", "coordinates": ["a", 1]}}
            })))
            .unwrap_err();
        assert!(matches!(error, AnnotationError::InvalidCoordinates { .. }));
        assert!(f.host.calls.borrow().is_empty());
    }

    #[tokio::test]
    async fn success_marks_feature_synced() {
        let mut f = fixture();
        f.map.borrow_mut().draw_feature("p1");
        let submission = f.sync.handle_event(point_event("p1", 3.0, 4.0)).unwrap().unwrap();
        assert_eq!(f.sync.state(1), Some(SyncState::Submitting));
        assert!(!f.map.borrow().is_synced("p1"));

        f.host.reply(0, Ok(()));
        assert_eq!(submission.task.await, SyncState::Synced);
        assert_eq!(f.sync.state(1), Some(SyncState::Synced));
        assert!(f.map.borrow().is_synced("p1"));
    }

    #[tokio::test]
    async fn failure_goes_to_sink_and_keeps_feature() {
        let mut f = fixture();
        f.map.borrow_mut().draw_feature("p1");
        let submission = f.sync.handle_event(point_event("p1", 3.0, 4.0)).unwrap().unwrap();

        let error = RpcError::new(-32602, "rejected");
        f.host.reply(0, Err(error.clone()));
        assert_eq!(submission.task.await, SyncState::Failed(error.clone()));
        assert_eq!(*f.sink.errors.borrow(), [error]);
        assert!(f.map.borrow().is_drawn("p1"));
        assert!(!f.map.borrow().is_synced("p1"));
        assert_eq!(f.host.calls.borrow().len(), 1);
    }

    #[tokio::test]
    async fn completions_may_arrive_out_of_order() {
        let mut f = fixture();
        f.map.borrow_mut().draw_feature("a");
        f.map.borrow_mut().draw_feature("b");
        let first = f.sync.handle_event(point_event("a", 0.0, 0.0)).unwrap().unwrap();
        let second = f.sync.handle_event(point_event("b", 0.0, 0.0)).unwrap().unwrap();

        f.host.reply(1, Ok(()));
        assert_eq!(second.task.await, SyncState::Synced);
        assert_eq!(f.sync.state(1), Some(SyncState::Submitting));

        f.host.reply(0, Err(RpcError::new(1, "late")));
        assert!(matches!(first.task.await, SyncState::Failed(_)));
        assert!(f.map.borrow().is_synced("b"));
        assert!(!f.map.borrow().is_synced("a"));
    }

    #[tokio::test]
    async fn clear_does_not_retract_in_flight_calls() {
        let mut f = fixture();
        f.map.borrow_mut().draw_feature("p1");
        let submission = f.sync.handle_event(point_event("p1", 0.0, 0.0)).unwrap().unwrap();
        assert_eq!(f.sync.clear(), 1);
        assert!(f.sync.records().is_empty());

        f.host.reply(0, Ok(()));
        assert_eq!(submission.task.await, SyncState::Synced);
        assert_eq!(f.sync.state(1), None);
        assert!(!f.map.borrow().is_synced("p1"));
        assert_eq!(f.host.calls.borrow().len(), 1);

        let next = f.sync.handle_event(point_event("p2", 0.0, 0.0)).unwrap().unwrap();
        assert_eq!(next.record.id, 2);
    }
}
