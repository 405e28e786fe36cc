use std::collections::BTreeSet;

use geobridge_shared::session_format::AnnotationSnapshot;
use geobridge_shared::{
    AnnotationKind, AnnotationMeta, AnnotationRecord, Point, RpcError, RpcMessage, RpcRequest,
    RpcResponse,
};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::state::Session;

pub const ADD_ANNOTATION: &str = "add_annotation";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AnnotationError {
    #[error("a point annotation needs exactly one coordinate, got {0}")]
    PointArity(usize),
    #[error("a {kind} annotation needs at least {min} coordinates, got {got}")]
    TooFewCoordinates {
        kind: AnnotationKind,
        min: usize,
        got: usize,
    },
    #[error("coordinates must be finite numbers")]
    NonFinite,
    #[error("annotation {0} already exists")]
    Duplicate(u64),
}

fn min_coordinates(kind: AnnotationKind) -> usize {
    match kind {
        AnnotationKind::Point => 1,
        AnnotationKind::Polygon => 3,
        AnnotationKind::Rectangle => 4,
    }
}

fn check_shape(kind: AnnotationKind, coordinates: &[Point]) -> Result<(), AnnotationError> {
    let got = coordinates.len();
    match kind {
        AnnotationKind::Point if got != 1 => return Err(AnnotationError::PointArity(got)),
        _ if got < min_coordinates(kind) => {
            return Err(AnnotationError::TooFewCoordinates {
                kind,
                min: min_coordinates(kind),
                got,
            })
        }
        _ => {}
    }
    if !coordinates.iter().all(Point::is_finite) {
        return Err(AnnotationError::NonFinite);
    }
    Ok(())
}

/// Annotations the map client reported for one session, in arrival order.
/// Ids are assigned by the client and restart at 1 on every connection, so
/// they are only unique within `client_ids`.
#[derive(Debug, Default)]
pub struct Annotations {
    records: Vec<AnnotationRecord>,
    client_ids: BTreeSet<u64>,
    dirty: bool,
}

impl Annotations {
    /// Restores a saved snapshot, dropping records that would not pass
    /// validation today.
    pub fn from_snapshot(snapshot: AnnotationSnapshot) -> Self {
        let records = snapshot
            .annotations
            .into_iter()
            .filter(|record| {
                let valid = check_shape(record.kind, &record.coordinates).is_ok();
                if !valid {
                    tracing::warn!(id = record.id, "dropping invalid saved annotation");
                }
                valid
            })
            .collect();
        Self {
            records,
            client_ids: BTreeSet::new(),
            dirty: false,
        }
    }

    pub fn snapshot(&self) -> AnnotationSnapshot {
        AnnotationSnapshot {
            annotations: self.list(),
        }
    }

    /// A new map client connected. Its ids start over.
    pub fn start_client_session(&mut self) {
        self.client_ids.clear();
    }

    pub fn add(
        &mut self,
        kind: AnnotationKind,
        coordinates: Vec<Point>,
        meta: AnnotationMeta,
    ) -> Result<&AnnotationRecord, AnnotationError> {
        check_shape(kind, &coordinates)?;
        if !self.client_ids.insert(meta.id) {
            return Err(AnnotationError::Duplicate(meta.id));
        }
        self.records.push(AnnotationRecord {
            id: meta.id,
            name: meta.name,
            kind,
            coordinates,
            rgb: meta.rgb,
        });
        self.dirty = true;
        Ok(&self.records[self.records.len() - 1])
    }

    pub fn list(&self) -> Vec<AnnotationRecord> {
        self.records.clone()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Returns a snapshot if anything changed since the last call.
    pub fn take_dirty(&mut self) -> Option<AnnotationSnapshot> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(self.snapshot())
    }
}

/// Runs one request the map client sent to the host.
pub fn apply_client_request(annotations: &mut Annotations, request: &RpcRequest) -> Option<RpcResponse> {
    let result = match request.method.as_str() {
        ADD_ANNOTATION => add_annotation(annotations, &request.params),
        other => Err(RpcError::method_not_found(other)),
    };
    if let Err(error) = &result {
        tracing::warn!(method = %request.method, code = error.code, "{}", error.message);
    }
    let id = request.id.clone()?;
    Some(match result {
        Ok(value) => RpcResponse::success(Some(id), value),
        Err(error) => RpcResponse::failure(Some(id), error),
    })
}

fn add_annotation(annotations: &mut Annotations, params: &Value) -> Result<Value, RpcError> {
    let (kind, coordinates, meta): (AnnotationKind, Vec<Point>, AnnotationMeta) = match params {
        Value::Array(items) if items.len() == 3 => (
            argument("type", &items[0])?,
            argument("coordinates", &items[1])?,
            argument("meta", &items[2])?,
        ),
        Value::Array(items) => {
            return Err(RpcError::invalid_params(format!(
                "add_annotation takes 3 arguments, got {}",
                items.len()
            )))
        }
        Value::Object(named) => (
            argument("type", named.get("type").unwrap_or(&Value::Null))?,
            argument("coordinates", named.get("coordinates").unwrap_or(&Value::Null))?,
            argument("meta", named.get("meta").unwrap_or(&Value::Null))?,
        ),
        _ => return Err(RpcError::invalid_params("params must be an array or an object")),
    };
    let record = annotations
        .add(kind, coordinates, meta)
        .map_err(|error| RpcError::invalid_params(error.to_string()))?;
    tracing::info!(id = record.id, kind = %record.kind, "annotation added");
    Ok(Value::Null)
}

fn argument<T: DeserializeOwned>(name: &str, value: &Value) -> Result<T, RpcError> {
    serde_json::from_value(value.clone())
        .map_err(|error| RpcError::invalid_params(format!("bad '{name}': {error}")))
}

/// Handles one text frame from the map client and returns the reply to
/// send back, if any.
pub fn apply_client_frame(session: &mut Session, text: &str) -> Option<String> {
    let reply = match RpcMessage::parse(text) {
        Ok(RpcMessage::Request(request)) => {
            apply_client_request(&mut session.annotations, &request)?
        }
        Ok(RpcMessage::Response(response)) => {
            session.remote.resolve(response);
            return None;
        }
        Err(error) => {
            tracing::warn!(code = error.code, "bad frame from map client: {}", error.message);
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

#[cfg(test)]
mod tests {
    use super::*;
    use geobridge_shared::rpc::{INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR};
    use serde_json::json;

    fn meta(id: u64) -> Value {
        json!({"id": id, "name": format!("polygon-{id}"), "rgb": "#db5f57"})
    }

    fn request(params: Value) -> RpcRequest {
        RpcRequest::new(ADD_ANNOTATION, params, 1)
    }

    fn error_code(response: Option<RpcResponse>) -> i64 {
        response.unwrap().into_result().unwrap_err().code
    }

    #[test]
    fn positional_add_registers_the_record() {
        let mut annotations = Annotations::default();
        let triangle = json!([{"x": 0, "y": 0}, {"x": 1, "y": 0}, {"x": 1, "y": 1}]);
        let response = apply_client_request(
            &mut annotations,
            &request(json!(["polygon", triangle, meta(1)])),
        )
        .unwrap();
        assert_eq!(response.into_result(), Ok(Value::Null));
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations.list()[0].name, "polygon-1");
        assert!(annotations.is_dirty());
    }

    #[test]
    fn named_params_are_accepted() {
        let mut annotations = Annotations::default();
        let params = json!({
            "type": "point",
            "coordinates": [{"x": 5.0, "y": 6.0}],
            "meta": {"id": 7, "name": "point-7", "rgb": "#57d3db"}
        });
        let response = apply_client_request(&mut annotations, &request(params)).unwrap();
        assert!(response.into_result().is_ok());
        assert_eq!(annotations.list()[0].coordinates, vec![Point::new(5.0, 6.0)]);
    }

    #[test]
    fn shapes_are_validated() {
        let mut annotations = Annotations::default();
        let two = json!([{"x": 0, "y": 0}, {"x": 1, "y": 0}]);
        for params in [
            json!(["point", two, meta(1)]),
            json!(["polygon", two, meta(2)]),
            json!(["rectangle", [{"x": 0, "y": 0}, {"x": 1, "y": 0}, {"x": 1, "y": 1}], meta(3)]),
            json!(["circle", [{"x": 0, "y": 0}], meta(4)]),
            json!(["point", [{"x": 0, "y": 0}]]),
        ] {
            let response = apply_client_request(&mut annotations, &request(params));
            assert_eq!(error_code(response), INVALID_PARAMS);
        }
        assert!(annotations.is_empty());
        assert!(!annotations.is_dirty());
    }

    #[test]
    fn non_finite_coordinates_are_rejected() {
        let mut annotations = Annotations::default();
        let error = annotations
            .add(
                AnnotationKind::Point,
                vec![Point::new(f64::NAN, 0.0)],
                AnnotationMeta {
                    id: 1,
                    name: "point-1".into(),
                    rgb: "#db5f57".into(),
                },
            )
            .unwrap_err();
        assert_eq!(error, AnnotationError::NonFinite);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut annotations = Annotations::default();
        let point = json!([{"x": 0, "y": 0}]);
        let first = apply_client_request(&mut annotations, &request(json!(["point", point, meta(1)])));
        assert!(first.unwrap().into_result().is_ok());
        let second = apply_client_request(&mut annotations, &request(json!(["point", point, meta(1)])));
        assert_eq!(error_code(second), INVALID_PARAMS);
        assert_eq!(annotations.len(), 1);
    }

    #[test]
    fn reconnected_client_may_reuse_ids() {
        let mut annotations = Annotations::from_snapshot(AnnotationSnapshot {
            annotations: vec![AnnotationRecord {
                id: 1,
                name: "point-1".into(),
                kind: AnnotationKind::Point,
                coordinates: vec![Point::new(9.0, 9.0)],
                rgb: "#db5f57".into(),
            }],
        });
        let point = json!([{"x": 0, "y": 0}]);
        let first = apply_client_request(&mut annotations, &request(json!(["point", point, meta(1)])));
        assert!(first.unwrap().into_result().is_ok());

        annotations.start_client_session();
        let again = apply_client_request(&mut annotations, &request(json!(["point", point, meta(1)])));
        assert!(again.unwrap().into_result().is_ok());
        assert_eq!(annotations.len(), 3);
        let coordinates: Vec<_> = annotations.list().iter().map(|r| r.coordinates[0]).collect();
        assert_eq!(coordinates[0], Point::new(9.0, 9.0));
    }

    #[test]
    fn unknown_methods_and_notifications() {
        let mut annotations = Annotations::default();
        let unknown = RpcRequest::new("delete_everything", json!([]), 2);
        assert_eq!(
            error_code(apply_client_request(&mut annotations, &unknown)),
            METHOD_NOT_FOUND
        );

        let notification = RpcRequest::notification(
            ADD_ANNOTATION,
            json!(["point", [{"x": 0, "y": 0}], meta(9)]),
        );
        assert!(apply_client_request(&mut annotations, &notification).is_none());
        assert_eq!(annotations.len(), 1);
    }

    #[test]
    fn dirty_flag_is_consumed_by_take_dirty() {
        let mut annotations = Annotations::default();
        assert!(annotations.take_dirty().is_none());
        annotations
            .add(
                AnnotationKind::Point,
                vec![Point::new(1.0, 1.0)],
                AnnotationMeta {
                    id: 1,
                    name: "point-1".into(),
                    rgb: "#db5f57".into(),
                },
            )
            .unwrap();
        assert_eq!(annotations.take_dirty().unwrap().annotations.len(), 1);
        assert!(annotations.take_dirty().is_none());
    }

    #[test]
    fn invalid_saved_records_are_dropped() {
        let good = AnnotationRecord {
            id: 1,
            name: "point-1".into(),
            kind: AnnotationKind::Point,
            coordinates: vec![Point::new(0.0, 0.0)],
            rgb: "#db5f57".into(),
        };
        let bad = AnnotationRecord {
            id: 2,
            kind: AnnotationKind::Polygon,
            ..good.clone()
        };
        let annotations = Annotations::from_snapshot(AnnotationSnapshot {
            annotations: vec![good.clone(), bad],
        });
        assert_eq!(annotations.list(), vec![good]);
        assert!(!annotations.is_dirty());
    }

    #[tokio::test]
    async fn frames_route_requests_and_responses() {
        let mut session = Session::default();
        let reply = apply_client_frame(&mut session, "][").unwrap();
        let reply: RpcResponse = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply.id, None);
        assert_eq!(reply.into_result().unwrap_err().code, PARSE_ERROR);

        let add = request(json!(["point", [{"x": 0, "y": 0}], meta(1)]));
        let reply = apply_client_frame(&mut session, &serde_json::to_string(&add).unwrap()).unwrap();
        assert!(serde_json::from_str::<RpcResponse>(&reply).unwrap().into_result().is_ok());

        let (call, reply) = session.remote.protocol_request();
        let answer = RpcResponse::success(call.id, json!([]));
        assert_eq!(apply_client_frame(&mut session, &serde_json::to_string(&answer).unwrap()), None);
        assert_eq!(reply.await.unwrap().into_result(), Ok(json!([])));
    }
}
