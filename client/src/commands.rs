use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use geobridge_shared::rpc::INVALID_PARAMS;
use geobridge_shared::{ProcedureDescriptor, RpcError, RpcRequest, RpcResponse};
use serde_json::{json, Value};

use crate::annotations::{AnnotationError, AnnotationSync, DrawEvent, Submission};
use crate::diagnostics::{DiagnosticSink, TracingSink};
use crate::engine::{source_id, DrawSurface, EngineError, MapEngine, RasterLayer, RasterSource};
use crate::host::Host;
use crate::protocol::{build_catalog, ProcedureTable, ProtocolError, Signature, MSG_TYPES};
use crate::state::{ClientConfig, ClientSession};
use crate::wms::{tile_url, WmsParams, TILE_SIZE};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("{message}")]
    InvalidParams { code: i64, message: String },
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl CommandError {
    pub fn invalid_params(message: impl Into<String>) -> Self {
        CommandError::InvalidParams {
            code: INVALID_PARAMS,
            message: message.into(),
        }
    }

    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            CommandError::InvalidParams { code, message } => RpcError::new(*code, message.clone()),
            CommandError::Engine(error) => RpcError::server(error.to_string()),
            CommandError::Protocol(error) => error.to_rpc_error(),
        }
    }
}

/// The map client's command surface: every procedure the host may call,
/// plus the entry point for draw events.
pub struct MapClient<M> {
    map: Rc<RefCell<M>>,
    table: ProcedureTable,
    annotations: AnnotationSync,
    annotation_layers: Vec<String>,
    sink: Rc<dyn DiagnosticSink>,
}

impl<M: MapEngine + DrawSurface + 'static> MapClient<M> {
    pub fn new(map: Rc<RefCell<M>>, host: Rc<dyn Host>) -> Self {
        Self::with_config(map, host, Rc::new(TracingSink), ClientConfig::default())
    }

    pub fn with_config(
        map: Rc<RefCell<M>>,
        host: Rc<dyn Host>,
        sink: Rc<dyn DiagnosticSink>,
        config: ClientConfig,
    ) -> Self {
        let surface: Rc<RefCell<dyn DrawSurface>> = map.clone();
        let annotations =
            AnnotationSync::new(ClientSession::new(&config), surface, host, sink.clone());
        Self {
            map,
            table: ProcedureTable::map_client(),
            annotations,
            annotation_layers: vec![config.annotation_layer],
            sink,
        }
    }

    pub fn procedures(&self) -> &ProcedureTable {
        &self.table
    }

    /// Handler table, for swapping signatures at runtime.
    pub fn procedures_mut(&mut self) -> &mut ProcedureTable {
        &mut self.table
    }

    pub fn annotations(&self) -> &AnnotationSync {
        &self.annotations
    }

    pub fn annotation_layers(&self) -> &[String] {
        &self.annotation_layers
    }

    pub fn get_protocol(&self) -> Result<Vec<ProcedureDescriptor>, ProtocolError> {
        build_catalog(&MSG_TYPES, &self.table)
    }

    pub fn set_center(&mut self, x: f64, y: f64, z: f64) -> Result<[f64; 3], CommandError> {
        if !(-180.0..=180.0).contains(&x) || !(-90.0..=90.0).contains(&y) {
            return Err(CommandError::invalid_params(
                "Invalid parameters sent to set_center!",
            ));
        }
        self.map.borrow_mut().fly_to([x, y], z);
        Ok([x, y, z])
    }

    pub fn debug(&self, msg: &str) {
        self.sink.debug(msg);
    }

    /// Adds a WMS raster layer, replacing any layer of the same name.
    pub fn add_wms_layer(
        &mut self,
        layer_name: &str,
        base_url: &str,
        params: &WmsParams,
    ) -> Result<String, CommandError> {
        require_name("layer_name", layer_name)?;
        require_name("base_url", base_url)?;

        if self.map.borrow().has_layer(layer_name) {
            self.remove_layer(layer_name)?;
        }

        let source = source_id(layer_name);
        let mut map = self.map.borrow_mut();
        map.add_source(
            &source,
            RasterSource::new(vec![tile_url(base_url, params)], TILE_SIZE),
        )?;
        if let Err(error) = map.add_layer(RasterLayer::new(layer_name, &source)) {
            // Leave no orphaned source behind.
            if let Err(cleanup) = map.remove_source(&source) {
                tracing::warn!(layer = layer_name, "source rollback failed: {cleanup}");
            }
            return Err(error.into());
        }
        tracing::info!(layer = layer_name, "wms layer added");
        Ok(layer_name.to_string())
    }

    pub fn replace_wms_layer(
        &mut self,
        layer_name: &str,
        base_url: &str,
        params: &WmsParams,
    ) -> Result<String, CommandError> {
        self.add_wms_layer(layer_name, base_url, params)
    }

    /// Accepts an OSM tile layer name. Tile wiring belongs to the engine.
    pub fn add_osm_layer(
        &mut self,
        layer_name: &str,
        _url: &str,
        _params: &Value,
    ) -> Result<String, CommandError> {
        require_name("layer_name", layer_name)?;
        Ok(layer_name.to_string())
    }

    pub fn remove_layer(&mut self, layer_name: &str) -> Result<String, CommandError> {
        let mut map = self.map.borrow_mut();
        map.remove_layer(layer_name)?;
        map.remove_source(&source_id(layer_name))?;
        tracing::info!(layer = layer_name, "layer removed");
        Ok(layer_name.to_string())
    }

    pub fn add_annotation_layer(
        &mut self,
        layer_name: &str,
        _params: &Value,
    ) -> Result<String, CommandError> {
        require_name("layer_name", layer_name)?;
        if !self.annotation_layers.iter().any(|name| name == layer_name) {
            self.annotation_layers.push(layer_name.to_string());
        }
        Ok(layer_name.to_string())
    }

    /// Local-only: the host is not told about the removed features.
    pub fn clear_annotations(&mut self) -> bool {
        self.annotations.clear();
        true
    }

    pub fn handle_draw_event(
        &mut self,
        event: DrawEvent,
    ) -> Result<Option<Submission>, AnnotationError> {
        self.annotations.handle_event(event)
    }

    /// Runs one JSON-RPC request. Notifications run too but get no
    /// response.
    pub fn dispatch(&mut self, request: &RpcRequest) -> Option<RpcResponse> {
        let result = self.invoke(&request.method, &request.params);
        if let Err(error) = &result {
            tracing::warn!(procedure = %request.method, code = error.code, "{}", error.message);
        }
        let id = request.id.clone()?;
        Some(match result {
            Ok(value) => RpcResponse::success(Some(id), value),
            Err(error) => RpcResponse::failure(Some(id), error),
        })
    }

    fn invoke(&mut self, method: &str, params: &Value) -> Result<Value, RpcError> {
        if !MSG_TYPES.iter().any(|name| *name == method) {
            return Err(RpcError::method_not_found(method));
        }
        let signature = *self
            .table
            .signature(method)
            .ok_or_else(|| RpcError::method_not_found(method))?;
        let args = Arguments::bind(&signature, params).map_err(|error| error.to_rpc_error())?;
        tracing::debug!(procedure = method, "dispatching");
        self.run(method, &args).map_err(|error| error.to_rpc_error())
    }

    fn run(&mut self, method: &str, args: &Arguments) -> Result<Value, CommandError> {
        match method {
            "get_protocol" => Ok(json!(self.get_protocol()?)),
            "set_center" => {
                let [x, y, z] = [args.number("x")?, args.number("y")?, args.number("z")?];
                Ok(json!(self.set_center(x, y, z)?))
            }
            "_debug" => {
                match args.value("msg") {
                    Value::String(text) => self.debug(text),
                    other => self.debug(&other.to_string()),
                }
                Ok(Value::Null)
            }
            "add_wms_layer" | "replace_wms_layer" => {
                let params = args.wms_params("params")?;
                let name = self.replace_wms_layer(
                    args.string("layer_name")?,
                    args.string("base_url")?,
                    &params,
                )?;
                Ok(json!(name))
            }
            "add_osm_layer" => {
                let name = self.add_osm_layer(
                    args.string("layer_name")?,
                    args.string("url")?,
                    args.object("params")?,
                )?;
                Ok(json!(name))
            }
            "add_annotation_layer" => {
                let name =
                    self.add_annotation_layer(args.string("layer_name")?, args.object("params")?)?;
                Ok(json!(name))
            }
            "clear_annotations" => Ok(json!(self.clear_annotations())),
            "remove_layer" => Ok(json!(self.remove_layer(args.string("layer_name")?)?)),
            other => Err(ProtocolError::UnknownProcedure(other.to_string()).into()),
        }
    }
}

fn require_name(param: &str, value: &str) -> Result<(), CommandError> {
    if value.trim().is_empty() {
        return Err(CommandError::invalid_params(format!(
            "'{param}' must not be empty"
        )));
    }
    Ok(())
}

/// Request params bound to a procedure signature, with defaults filled in.
struct Arguments {
    values: BTreeMap<&'static str, Value>,
}

impl Arguments {
    fn bind(signature: &Signature, params: &Value) -> Result<Self, CommandError> {
        let mut values = BTreeMap::new();
        match params {
            Value::Null => {}
            Value::Array(items) => {
                if items.len() > signature.params.len() {
                    return Err(CommandError::invalid_params(format!(
                        "{} takes at most {} arguments, got {}",
                        signature.name,
                        signature.params.len(),
                        items.len()
                    )));
                }
                for (spec, item) in signature.params.iter().zip(items) {
                    values.insert(spec.name, item.clone());
                }
            }
            Value::Object(map) => {
                for (key, item) in map {
                    let spec = signature
                        .params
                        .iter()
                        .find(|spec| spec.name == key)
                        .ok_or_else(|| {
                            CommandError::invalid_params(format!(
                                "{} has no parameter '{key}'",
                                signature.name
                            ))
                        })?;
                    values.insert(spec.name, item.clone());
                }
            }
            _ => {
                return Err(CommandError::invalid_params(
                    "params must be an array or an object",
                ))
            }
        }

        for spec in signature.params {
            if values.contains_key(spec.name) {
                continue;
            }
            match spec.default {
                Some(default) => {
                    values.insert(spec.name, default.to_json());
                }
                None => {
                    return Err(CommandError::invalid_params(format!(
                        "{} is missing required parameter '{}'",
                        signature.name, spec.name
                    )))
                }
            }
        }
        Ok(Self { values })
    }

    fn value(&self, name: &str) -> &Value {
        self.values.get(name).unwrap_or(&Value::Null)
    }

    fn number(&self, name: &str) -> Result<f64, CommandError> {
        self.value(name)
            .as_f64()
            .ok_or_else(|| CommandError::invalid_params(format!("'{name}' must be a number")))
    }

    fn string(&self, name: &str) -> Result<&str, CommandError> {
        self.value(name)
            .as_str()
            .ok_or_else(|| CommandError::invalid_params(format!("'{name}' must be a string")))
    }

    fn object(&self, name: &str) -> Result<&Value, CommandError> {
        match self.value(name) {
            value @ (Value::Object(_) | Value::Null) => Ok(value),
            _ => Err(CommandError::invalid_params(format!(
                "'{name}' must be an object"
            ))),
        }
    }

    fn wms_params(&self, name: &str) -> Result<WmsParams, CommandError> {
        match self.object(name)? {
            Value::Null => Ok(WmsParams::default()),
            value => serde_json::from_value(value.clone())
                .map_err(|error| CommandError::invalid_params(format!("'{name}': {error}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::HeadlessMap;
    use crate::host::HostFuture;
    use futures_util::FutureExt;
    use geobridge_shared::rpc::METHOD_NOT_FOUND;
    use geobridge_shared::{AnnotationKind, AnnotationMeta, Point};

    struct NullHost;

    impl Host for NullHost {
        fn add_annotation(&self, _: AnnotationKind, _: Vec<Point>, _: AnnotationMeta) -> HostFuture {
            futures_util::future::ready(Ok(())).boxed_local()
        }
    }

    fn client() -> (MapClient<HeadlessMap>, Rc<RefCell<HeadlessMap>>) {
        let map = Rc::new(RefCell::new(HeadlessMap::new()));
        (MapClient::new(map.clone(), Rc::new(NullHost)), map)
    }

    fn call(client: &mut MapClient<HeadlessMap>, method: &str, params: Value) -> Result<Value, RpcError> {
        client
            .dispatch(&RpcRequest::new(method, params, 1))
            .expect("request with id gets a response")
            .into_result()
    }

    #[test]
    fn set_center_accepts_valid_coordinates() {
        let (mut client, map) = client();
        assert_eq!(client.set_center(-122.4, 37.7, 10.0), Ok([-122.4, 37.7, 10.0]));
        let camera = map.borrow().camera().unwrap();
        assert_eq!(camera.center, [-122.4, 37.7]);
        assert_eq!(camera.zoom, 10.0);
        assert_eq!(client.set_center(180.0, -90.0, 0.0), Ok([180.0, -90.0, 0.0]));
    }

    #[test]
    fn set_center_rejects_out_of_range_without_moving() {
        let (mut client, map) = client();
        for (x, y) in [(200.0, 0.0), (-180.5, 0.0), (0.0, 90.1), (0.0, -91.0), (f64::NAN, 0.0)] {
            let error = client.set_center(x, y, 4.0).unwrap_err();
            assert!(matches!(error, CommandError::InvalidParams { code: INVALID_PARAMS, .. }));
        }
        assert_eq!(map.borrow().camera(), None);
        assert_eq!(map.borrow().mutations(), 0);
    }

    #[test]
    fn add_wms_layer_twice_keeps_one_pair() {
        let (mut client, map) = client();
        let params = WmsParams::default();
        client.add_wms_layer("dem", "http://a/wms?", &params).unwrap();
        client.add_wms_layer("dem", "http://b/wms?", &params).unwrap();

        let map = map.borrow();
        assert_eq!(map.layer_ids(), ["dem"]);
        assert_eq!(map.source_count(), 1);
        let source = map.source("dem-source").unwrap();
        assert!(source.tiles[0].starts_with("http://b/wms?&SERVICE=WMS"));
        assert_eq!(source.tile_size, 512);
        // add, add, remove, remove, add, add
        assert_eq!(map.mutations(), 6);
    }

    #[test]
    fn remove_layer_twice_surfaces_not_found() {
        let (mut client, map) = client();
        client.add_wms_layer("dem", "http://a/wms?", &WmsParams::default()).unwrap();
        assert_eq!(client.remove_layer("dem"), Ok("dem".to_string()));
        assert_eq!(map.borrow().source_count(), 0);
        assert_eq!(
            client.remove_layer("dem"),
            Err(CommandError::Engine(EngineError::LayerNotFound("dem".into())))
        );
    }

    #[test]
    fn dispatch_binds_positional_and_named_params() {
        let (mut client, _map) = client();
        assert_eq!(call(&mut client, "set_center", json!([1, 2, 3])), Ok(json!([1.0, 2.0, 3.0])));
        assert_eq!(
            call(&mut client, "set_center", json!({"z": 5, "x": 10, "y": 20})),
            Ok(json!([10.0, 20.0, 5.0]))
        );
    }

    #[test]
    fn dispatch_reports_invalid_params() {
        let (mut client, _map) = client();
        let error = call(&mut client, "set_center", json!([200, 0, 4])).unwrap_err();
        assert_eq!(error.code, INVALID_PARAMS);
        assert_eq!(error.message, "Invalid parameters sent to set_center!");

        for params in [json!([1, 2]), json!([1, 2, 3, 4]), json!({"x": 1, "y": 2, "zoom": 3}), json!("x")] {
            let error = call(&mut client, "set_center", params).unwrap_err();
            assert_eq!(error.code, INVALID_PARAMS);
        }
        let error = call(&mut client, "set_center", json!(["a", 2, 3])).unwrap_err();
        assert_eq!(error.message, "'x' must be a number");
    }

    #[test]
    fn dispatch_fills_optional_params() {
        let (mut client, map) = client();
        assert_eq!(call(&mut client, "add_wms_layer", json!(["dem", "http://a/wms?"])), Ok(json!("dem")));
        assert_eq!(
            call(
                &mut client,
                "replace_wms_layer",
                json!(["dem", "http://a/wms?", {"SLD_BODY": "<x/>"}])
            ),
            Ok(json!("dem"))
        );
        assert!(map.borrow().source("dem-source").unwrap().tiles[0].ends_with("&SLD_BODY=%3Cx%2F%3E"));

        let error = call(&mut client, "add_wms_layer", json!(["dem", "u", {"SLD_BODY": 5}])).unwrap_err();
        assert_eq!(error.code, INVALID_PARAMS);
    }

    #[test]
    fn dispatch_only_routes_whitelisted_procedures() {
        let (mut client, _map) = client();
        for method in ["add_annotation", "annotation_color_palette", "get_layer"] {
            assert_eq!(call(&mut client, method, Value::Null).unwrap_err().code, METHOD_NOT_FOUND);
        }
    }

    #[test]
    fn engine_errors_propagate_through_dispatch() {
        let (mut client, _map) = client();
        let error = call(&mut client, "remove_layer", json!(["missing"])).unwrap_err();
        assert_eq!(error.code, geobridge_shared::rpc::SERVER_ERROR);
        assert_eq!(error.message, "layer 'missing' does not exist");
    }

    #[test]
    fn get_protocol_through_dispatch() {
        let (mut client, _map) = client();
        let catalog: Vec<ProcedureDescriptor> =
            serde_json::from_value(call(&mut client, "get_protocol", json!([])).unwrap()).unwrap();
        assert_eq!(catalog.len(), MSG_TYPES.len());
        assert_eq!(catalog[2].procedure, "_debug");
    }

    #[test]
    fn broken_handler_table_fails_get_protocol_only() {
        let (mut client, _map) = client();
        let removed = client.procedures_mut().unregister("add_osm_layer").unwrap();
        let error = call(&mut client, "get_protocol", Value::Null).unwrap_err();
        assert_eq!(error.code, METHOD_NOT_FOUND);
        assert_eq!(call(&mut client, "set_center", json!([0, 0, 1])), Ok(json!([0.0, 0.0, 1.0])));

        if let crate::protocol::Member::Procedure(signature) = removed {
            client.procedures_mut().register(signature);
        }
        assert!(call(&mut client, "get_protocol", Value::Null).is_ok());
    }

    #[test]
    fn notifications_run_without_response() {
        let (mut client, map) = client();
        let response = client.dispatch(&RpcRequest::notification("set_center", json!([1, 1, 1])));
        assert!(response.is_none());
        assert!(map.borrow().camera().is_some());
    }

    #[test]
    fn layer_commands_echo_names() {
        let (mut client, _map) = client();
        assert_eq!(call(&mut client, "add_osm_layer", json!(["osm", "http://tile"])), Ok(json!("osm")));
        assert_eq!(call(&mut client, "add_annotation_layer", json!(["notes"])), Ok(json!("notes")));
        assert_eq!(call(&mut client, "add_annotation_layer", json!(["notes", {}])), Ok(json!("notes")));
        assert_eq!(client.annotation_layers(), ["annotation", "notes"]);
        assert_eq!(call(&mut client, "_debug", json!(["hello"])), Ok(Value::Null));
        assert_eq!(call(&mut client, "clear_annotations", Value::Null), Ok(json!(true)));
        let error = call(&mut client, "add_osm_layer", json!(["", "u"])).unwrap_err();
        assert_eq!(error.code, INVALID_PARAMS);
    }

    #[test]
    fn clear_annotations_removes_drawn_features() {
        let (mut client, map) = client();
        map.borrow_mut().draw_feature("a");
        let event: DrawEvent = serde_json::from_value(json!({
            "type": "create",
            "feature": {"id": "a", "geometry": {"type": "Point", "coordinates": [1, 2]}}
        }))
        .unwrap();
        client.handle_draw_event(event).unwrap();
        assert_eq!(client.annotations().records().len(), 1);
        assert!(client.clear_annotations());
        assert!(!map.borrow().is_drawn("a"));
        assert!(client.annotations().records().is_empty());
    }
}
