//! Browser bindings: drives a mapbox-gl map and its draw control from JS.
//!
//! ```js
//! const bridge = new GeoBridge(map, draw, (text) => comm.send(text));
//! comm.onMessage((text) => bridge.handleMessage(text));
//! map.on('draw.create', (e) => bridge.handleDrawEvent({ type: 'create', feature: e.features[0] }));
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use js_sys::{Array, Function, Reflect, JSON};
use serde::Serialize;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;

use geobridge_shared::RpcError;

use crate::annotations::DrawEvent;
use crate::bridge::ClientBridge;
use crate::diagnostics::DiagnosticSink;
use crate::engine::{DrawSurface, EngineError, FeatureStyle, MapEngine, RasterLayer, RasterSource};
use crate::host::TransportError;
use crate::state::ClientConfig;

fn call_method(target: &JsValue, name: &str, args: &[JsValue]) -> Result<JsValue, JsValue> {
    let method: Function = Reflect::get(target, &JsValue::from_str(name))?.dyn_into()?;
    let array = Array::new();
    for arg in args {
        array.push(arg);
    }
    method.apply(target, &array)
}

fn to_js<T: Serialize>(value: &T) -> Result<JsValue, EngineError> {
    let text =
        serde_json::to_string(value).map_err(|error| EngineError::Backend(error.to_string()))?;
    JSON::parse(&text).map_err(backend_error)
}

fn backend_error(error: JsValue) -> EngineError {
    EngineError::Backend(
        error
            .as_string()
            .or_else(|| {
                JSON::stringify(&error)
                    .ok()
                    .map(String::from)
            })
            .unwrap_or_else(|| "unknown error".to_string()),
    )
}

fn is_present(value: &JsValue) -> bool {
    !(value.is_undefined() || value.is_null())
}

struct JsMap {
    map: JsValue,
    draw: JsValue,
}

impl JsMap {
    fn lookup(&self, getter: &str, id: &str) -> bool {
        call_method(&self.map, getter, &[JsValue::from_str(id)])
            .map(|value| is_present(&value))
            .unwrap_or(false)
    }
}

#[derive(Serialize)]
struct FlyTo {
    center: [f64; 2],
    zoom: f64,
}

impl MapEngine for JsMap {
    fn fly_to(&mut self, center: [f64; 2], zoom: f64) {
        let result = to_js(&FlyTo { center, zoom })
            .and_then(|options| call_method(&self.map, "flyTo", &[options]).map_err(backend_error));
        if let Err(error) = result {
            web_sys::console::error_1(&format!("flyTo failed: {error}").into());
        }
    }

    fn has_layer(&self, id: &str) -> bool {
        self.lookup("getLayer", id)
    }

    fn add_source(&mut self, id: &str, source: RasterSource) -> Result<(), EngineError> {
        if self.lookup("getSource", id) {
            return Err(EngineError::DuplicateSource(id.to_string()));
        }
        let source = to_js(&source)?;
        call_method(&self.map, "addSource", &[JsValue::from_str(id), source])
            .map(|_| ())
            .map_err(backend_error)
    }

    fn remove_source(&mut self, id: &str) -> Result<(), EngineError> {
        if !self.lookup("getSource", id) {
            return Err(EngineError::SourceNotFound(id.to_string()));
        }
        call_method(&self.map, "removeSource", &[JsValue::from_str(id)])
            .map(|_| ())
            .map_err(backend_error)
    }

    fn add_layer(&mut self, layer: RasterLayer) -> Result<(), EngineError> {
        if self.has_layer(&layer.id) {
            return Err(EngineError::DuplicateLayer(layer.id));
        }
        let options = to_js(&layer)?;
        Reflect::set(&options, &JsValue::from_str("paint"), &js_sys::Object::new())
            .map_err(backend_error)?;
        call_method(&self.map, "addLayer", &[options])
            .map(|_| ())
            .map_err(backend_error)
    }

    fn remove_layer(&mut self, id: &str) -> Result<(), EngineError> {
        if !self.has_layer(id) {
            return Err(EngineError::LayerNotFound(id.to_string()));
        }
        call_method(&self.map, "removeLayer", &[JsValue::from_str(id)])
            .map(|_| ())
            .map_err(backend_error)
    }
}

impl DrawSurface for JsMap {
    fn remove_all(&mut self) -> usize {
        let count = call_method(&self.draw, "getAll", &[])
            .and_then(|all| Reflect::get(&all, &JsValue::from_str("features")))
            .ok()
            .and_then(|features| features.dyn_into::<Array>().ok())
            .map(|features| features.length() as usize)
            .unwrap_or(0);
        if let Err(error) = call_method(&self.draw, "deleteAll", &[]) {
            web_sys::console::error_2(&"draw.deleteAll failed".into(), &error);
        }
        count
    }

    fn mark_synced(&mut self, feature_id: &str) -> bool {
        let id = JsValue::from_str(feature_id);
        let drawn = call_method(&self.draw, "get", &[id.clone()])
            .map(|feature| is_present(&feature))
            .unwrap_or(false);
        if !drawn {
            return false;
        }
        call_method(
            &self.draw,
            "setFeatureProperty",
            &[id, JsValue::from_str("synced"), JsValue::TRUE],
        )
        .is_ok()
    }

    fn set_style(&mut self, feature_id: &str, style: &FeatureStyle) -> bool {
        let id = JsValue::from_str(feature_id);
        let drawn = call_method(&self.draw, "get", &[id.clone()])
            .map(|feature| is_present(&feature))
            .unwrap_or(false);
        if !drawn {
            return false;
        }
        let properties = [
            ("fillColor", JsValue::from_str(&style.fill_color)),
            ("fillOpacity", JsValue::from_f64(style.fill_opacity)),
            ("strokeWidth", JsValue::from_f64(style.stroke_width)),
        ];
        properties.into_iter().all(|(name, value)| {
            call_method(
                &self.draw,
                "setFeatureProperty",
                &[id.clone(), JsValue::from_str(name), value],
            )
            .is_ok()
        })
    }
}

struct ConsoleSink;

impl DiagnosticSink for ConsoleSink {
    fn rpc_error(&self, error: &RpcError) {
        web_sys::console::log_1(&error.to_string().into());
    }

    fn debug(&self, message: &str) {
        web_sys::console::log_1(&message.into());
    }
}

type JsOutbound = Box<dyn Fn(String) -> Result<(), TransportError>>;

#[wasm_bindgen]
pub struct GeoBridge {
    inner: Rc<RefCell<ClientBridge<JsMap, JsOutbound>>>,
    send: Function,
}

#[wasm_bindgen]
impl GeoBridge {
    #[wasm_bindgen(constructor)]
    pub fn new(map: JsValue, draw: JsValue, send: Function) -> GeoBridge {
        console_error_panic_hook::set_once();
        let sender = send.clone();
        let outbound: JsOutbound = Box::new(move |text: String| {
            sender
                .call1(&JsValue::NULL, &JsValue::from_str(&text))
                .map(|_| ())
                .map_err(|error| TransportError(backend_error(error).to_string()))
        });
        let map = Rc::new(RefCell::new(JsMap { map, draw }));
        let bridge = ClientBridge::new(map, outbound, Rc::new(ConsoleSink), ClientConfig::default());
        GeoBridge {
            inner: Rc::new(RefCell::new(bridge)),
            send,
        }
    }

    /// Feeds one frame from the host; any reply is passed to `send`.
    #[wasm_bindgen(js_name = handleMessage)]
    pub fn handle_message(&self, text: &str) -> Result<(), JsValue> {
        let reply = self.inner.borrow_mut().handle_frame(text);
        if let Some(reply) = reply {
            self.send.call1(&JsValue::NULL, &JsValue::from_str(&reply))?;
        }
        Ok(())
    }

    /// Feeds one `{type, feature}` draw event. The host call runs in the
    /// background.
    #[wasm_bindgen(js_name = handleDrawEvent)]
    pub fn handle_draw_event(&self, event: JsValue) -> Result<(), JsValue> {
        let text = String::from(JSON::stringify(&event)?);
        let event: DrawEvent = serde_json::from_str(&text)
            .map_err(|error| JsValue::from_str(&error.to_string()))?;
        let submission = self
            .inner
            .borrow_mut()
            .handle_draw_event(event)
            .map_err(|error| JsValue::from_str(&error.to_string()))?;
        if let Some(submission) = submission {
            wasm_bindgen_futures::spawn_local(async move {
                submission.task.await;
            });
        }
        Ok(())
    }

    #[wasm_bindgen(js_name = connectionLost)]
    pub fn connection_lost(&self) -> u32 {
        self.inner.borrow().connection_lost() as u32
    }
}
