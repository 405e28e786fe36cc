use std::fmt;

use bincode::{Decode, Encode};
use serde::{Deserialize, Deserializer, Serialize};

pub mod rpc;
pub mod session_format;

pub use rpc::{RpcError, RpcMessage, RpcRequest, RpcResponse};

/// A map coordinate in EPSG:4326, `x` is longitude and `y` latitude.
#[derive(Serialize, Deserialize, Encode, Decode, Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn from_lon_lat([lon, lat]: [f64; 2]) -> Self {
        Self { x: lon, y: lat }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[derive(Serialize, Deserialize, Encode, Decode, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationKind {
    Point,
    Polygon,
    Rectangle,
}

impl AnnotationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnotationKind::Point => "point",
            AnnotationKind::Polygon => "polygon",
            AnnotationKind::Rectangle => "rectangle",
        }
    }
}

impl fmt::Display for AnnotationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Third argument of the host's `add_annotation` procedure.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AnnotationMeta {
    pub id: u64,
    pub name: String,
    pub rgb: String,
}

#[derive(Serialize, Deserialize, Encode, Decode, Clone, Debug, PartialEq)]
pub struct AnnotationRecord {
    pub id: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AnnotationKind,
    pub coordinates: Vec<Point>,
    pub rgb: String,
}

impl AnnotationRecord {
    pub fn meta(&self) -> AnnotationMeta {
        AnnotationMeta {
            id: self.id,
            name: self.name.clone(),
            rgb: self.rgb.clone(),
        }
    }
}

/// One formal parameter of a procedure. A parameter is optional iff it
/// carries a default.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ParamDescriptor {
    pub name: String,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub default: Option<serde_json::Value>,
}

/// A `default` key that is present keeps its value, `null` included.
fn present<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

impl ParamDescriptor {
    pub fn required(name: &str) -> Self {
        Self {
            name: name.to_string(),
            default: None,
        }
    }

    pub fn optional(name: &str, default: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            default: Some(default),
        }
    }

    pub fn is_optional(&self) -> bool {
        self.default.is_some()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProcedureDescriptor {
    pub procedure: String,
    pub required: Vec<ParamDescriptor>,
    pub optional: Vec<ParamDescriptor>,
}

impl ProcedureDescriptor {
    pub fn arity(&self) -> std::ops::RangeInclusive<usize> {
        self.required.len()..=self.required.len() + self.optional.len()
    }

    /// All parameters, required first, each group in declaration order.
    pub fn params(&self) -> impl Iterator<Item = &ParamDescriptor> {
        self.required.iter().chain(self.optional.iter())
    }
}
