use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("layer '{0}' does not exist")]
    LayerNotFound(String),
    #[error("source '{0}' does not exist")]
    SourceNotFound(String),
    #[error("layer '{0}' already exists")]
    DuplicateLayer(String),
    #[error("source '{0}' already exists")]
    DuplicateSource(String),
    #[error("source '{source_id}' is still used by layer '{layer_id}'")]
    SourceInUse { source_id: String, layer_id: String },
    #[error("map engine error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RasterSource {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub tiles: Vec<String>,
    #[serde(rename = "tileSize")]
    pub tile_size: u32,
}

impl RasterSource {
    pub fn new(tiles: Vec<String>, tile_size: u32) -> Self {
        Self {
            kind: "raster",
            tiles,
            tile_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RasterLayer {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub source: String,
}

impl RasterLayer {
    pub fn new(id: &str, source: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: "raster",
            source: source.to_string(),
        }
    }
}

/// The rendering engine the client drives. Implemented over the browser
/// map object in wasm builds and by [`HeadlessMap`] elsewhere.
pub trait MapEngine {
    fn fly_to(&mut self, center: [f64; 2], zoom: f64);
    fn has_layer(&self, id: &str) -> bool;
    fn add_source(&mut self, id: &str, source: RasterSource) -> Result<(), EngineError>;
    fn remove_source(&mut self, id: &str) -> Result<(), EngineError>;
    fn add_layer(&mut self, layer: RasterLayer) -> Result<(), EngineError>;
    fn remove_layer(&mut self, id: &str) -> Result<(), EngineError>;
}

/// The drawing control that owns user-drawn features.
pub trait DrawSurface {
    /// Removes every drawn feature and returns how many there were.
    fn remove_all(&mut self) -> usize;
    /// Marks a feature as acknowledged by the host. Returns false when the
    /// feature is no longer drawn.
    fn mark_synced(&mut self, feature_id: &str) -> bool;
    /// Paints a feature with its annotation color. Returns false when the
    /// feature is no longer drawn.
    fn set_style(&mut self, feature_id: &str, style: &FeatureStyle) -> bool;
}

pub const ANNOTATION_FILL_OPACITY: f64 = 0.8;
pub const ANNOTATION_STROKE_WIDTH: f64 = 2.0;

/// Per-feature paint applied to a freshly drawn annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureStyle {
    pub fill_color: String,
    pub fill_opacity: f64,
    pub stroke_width: f64,
}

impl FeatureStyle {
    pub fn annotation(fill_color: impl Into<String>) -> Self {
        Self {
            fill_color: fill_color.into(),
            fill_opacity: ANNOTATION_FILL_OPACITY,
            stroke_width: ANNOTATION_STROKE_WIDTH,
        }
    }
}

/// Name of the source backing layer `layer_name`.
pub fn source_id(layer_name: &str) -> String {
    format!("{layer_name}-source")
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub center: [f64; 2],
    pub zoom: f64,
}

/// In-memory map and draw surface with the same failure modes as the
/// browser engine.
#[derive(Debug, Default)]
pub struct HeadlessMap {
    sources: BTreeMap<String, RasterSource>,
    layers: Vec<RasterLayer>,
    camera: Option<Camera>,
    features: BTreeSet<String>,
    synced: BTreeSet<String>,
    styles: BTreeMap<String, FeatureStyle>,
    mutations: usize,
}

impl HeadlessMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn camera(&self) -> Option<Camera> {
        self.camera
    }

    pub fn source(&self, id: &str) -> Option<&RasterSource> {
        self.sources.get(id)
    }

    pub fn layer(&self, id: &str) -> Option<&RasterLayer> {
        self.layers.iter().find(|layer| layer.id == id)
    }

    pub fn layer_ids(&self) -> Vec<&str> {
        self.layers.iter().map(|layer| layer.id.as_str()).collect()
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Number of successful engine mutations so far.
    pub fn mutations(&self) -> usize {
        self.mutations
    }

    /// Simulates the user finishing a feature on the draw control.
    pub fn draw_feature(&mut self, feature_id: &str) {
        self.features.insert(feature_id.to_string());
    }

    pub fn is_drawn(&self, feature_id: &str) -> bool {
        self.features.contains(feature_id)
    }

    pub fn is_synced(&self, feature_id: &str) -> bool {
        self.synced.contains(feature_id)
    }

    pub fn style(&self, feature_id: &str) -> Option<&FeatureStyle> {
        self.styles.get(feature_id)
    }
}

impl MapEngine for HeadlessMap {
    fn fly_to(&mut self, center: [f64; 2], zoom: f64) {
        self.camera = Some(Camera { center, zoom });
        self.mutations += 1;
    }

    fn has_layer(&self, id: &str) -> bool {
        self.layer(id).is_some()
    }

    fn add_source(&mut self, id: &str, source: RasterSource) -> Result<(), EngineError> {
        if self.sources.contains_key(id) {
            return Err(EngineError::DuplicateSource(id.to_string()));
        }
        self.sources.insert(id.to_string(), source);
        self.mutations += 1;
        Ok(())
    }

    fn remove_source(&mut self, id: &str) -> Result<(), EngineError> {
        if let Some(layer) = self.layers.iter().find(|layer| layer.source == id) {
            return Err(EngineError::SourceInUse {
                source_id: id.to_string(),
                layer_id: layer.id.clone(),
            });
        }
        self.sources
            .remove(id)
            .ok_or_else(|| EngineError::SourceNotFound(id.to_string()))?;
        self.mutations += 1;
        Ok(())
    }

    fn add_layer(&mut self, layer: RasterLayer) -> Result<(), EngineError> {
        if self.has_layer(&layer.id) {
            return Err(EngineError::DuplicateLayer(layer.id));
        }
        if !self.sources.contains_key(&layer.source) {
            return Err(EngineError::SourceNotFound(layer.source));
        }
        self.layers.push(layer);
        self.mutations += 1;
        Ok(())
    }

    fn remove_layer(&mut self, id: &str) -> Result<(), EngineError> {
        let index = self
            .layers
            .iter()
            .position(|layer| layer.id == id)
            .ok_or_else(|| EngineError::LayerNotFound(id.to_string()))?;
        self.layers.remove(index);
        self.mutations += 1;
        Ok(())
    }
}

impl DrawSurface for HeadlessMap {
    fn remove_all(&mut self) -> usize {
        let removed = self.features.len();
        self.features.clear();
        self.synced.clear();
        self.styles.clear();
        removed
    }

    fn mark_synced(&mut self, feature_id: &str) -> bool {
        if !self.features.contains(feature_id) {
            return false;
        }
        self.synced.insert(feature_id.to_string());
        true
    }

    fn set_style(&mut self, feature_id: &str, style: &FeatureStyle) -> bool {
        if !self.features.contains(feature_id) {
            return false;
        }
        self.styles.insert(feature_id.to_string(), style.clone());
        true
    }
}
