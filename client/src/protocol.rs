//! Procedure catalog published to the host through `get_protocol`.
//!
//! Handler signatures are declared statically and collected into a
//! [`ProcedureTable`]. The catalog is rebuilt from the table on every
//! request, so registering or dropping a handler shows up immediately.

use std::collections::BTreeMap;

use geobridge_shared::{ParamDescriptor, ProcedureDescriptor, RpcError};
use serde_json::Value;

/// Procedures exposed to the host, in catalog order.
pub const MSG_TYPES: [&str; 9] = [
    "get_protocol",
    "set_center",
    "_debug",
    "add_wms_layer",
    "replace_wms_layer",
    "add_osm_layer",
    "add_annotation_layer",
    "clear_annotations",
    "remove_layer",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DefaultValue {
    Null,
    EmptyObject,
    Bool(bool),
    Number(f64),
    Str(&'static str),
}

impl DefaultValue {
    pub fn to_json(self) -> Value {
        match self {
            DefaultValue::Null => Value::Null,
            DefaultValue::EmptyObject => Value::Object(Default::default()),
            DefaultValue::Bool(value) => Value::Bool(value),
            DefaultValue::Number(value) => serde_json::Number::from_f64(value)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            DefaultValue::Str(value) => Value::String(value.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub default: Option<DefaultValue>,
}

impl ParamSpec {
    pub const fn required(name: &'static str) -> Self {
        Self {
            name,
            default: None,
        }
    }

    pub const fn optional(name: &'static str, default: DefaultValue) -> Self {
        Self {
            name,
            default: Some(default),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Signature {
    pub name: &'static str,
    pub params: &'static [ParamSpec],
}

/// Anything reachable by name on the map client. Only procedures can be
/// introspected.
#[derive(Debug, Clone, PartialEq)]
pub enum Member {
    Procedure(Signature),
    Value { kind: &'static str },
}

pub trait MemberLookup {
    fn member(&self, name: &str) -> Option<&Member>;
}

const LAYER_PARAMS: DefaultValue = DefaultValue::EmptyObject;

pub const MAP_CLIENT_SIGNATURES: [Signature; 9] = [
    Signature {
        name: "get_protocol",
        params: &[],
    },
    Signature {
        name: "set_center",
        params: &[
            ParamSpec::required("x"),
            ParamSpec::required("y"),
            ParamSpec::required("z"),
        ],
    },
    Signature {
        name: "_debug",
        params: &[ParamSpec::required("msg")],
    },
    Signature {
        name: "add_wms_layer",
        params: &[
            ParamSpec::required("layer_name"),
            ParamSpec::required("base_url"),
            ParamSpec::optional("params", LAYER_PARAMS),
        ],
    },
    Signature {
        name: "replace_wms_layer",
        params: &[
            ParamSpec::required("layer_name"),
            ParamSpec::required("base_url"),
            ParamSpec::optional("params", LAYER_PARAMS),
        ],
    },
    Signature {
        name: "add_osm_layer",
        params: &[
            ParamSpec::required("layer_name"),
            ParamSpec::required("url"),
            ParamSpec::optional("params", LAYER_PARAMS),
        ],
    },
    Signature {
        name: "add_annotation_layer",
        params: &[
            ParamSpec::required("layer_name"),
            ParamSpec::optional("params", LAYER_PARAMS),
        ],
    },
    Signature {
        name: "clear_annotations",
        params: &[],
    },
    Signature {
        name: "remove_layer",
        params: &[ParamSpec::required("layer_name")],
    },
];

#[derive(Debug, Clone, Default)]
pub struct ProcedureTable {
    members: BTreeMap<String, Member>,
}

impl ProcedureTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table for the map client's command set.
    pub fn map_client() -> Self {
        let mut table = Self::new();
        for signature in MAP_CLIENT_SIGNATURES {
            table.register(signature);
        }
        table.register_value("annotation_color_palette", "palette");
        table
    }

    pub fn register(&mut self, signature: Signature) -> Option<Member> {
        self.members
            .insert(signature.name.to_string(), Member::Procedure(signature))
    }

    pub fn register_value(&mut self, name: &str, kind: &'static str) -> Option<Member> {
        self.members.insert(name.to_string(), Member::Value { kind })
    }

    pub fn unregister(&mut self, name: &str) -> Option<Member> {
        self.members.remove(name)
    }

    pub fn signature(&self, name: &str) -> Option<&Signature> {
        match self.members.get(name) {
            Some(Member::Procedure(signature)) => Some(signature),
            _ => None,
        }
    }
}

impl MemberLookup for ProcedureTable {
    fn member(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown procedure '{0}'")]
    UnknownProcedure(String),
    #[error("cannot introspect '{name}': {reason}")]
    Introspection { name: String, reason: String },
}

impl ProtocolError {
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            ProtocolError::UnknownProcedure(name) => RpcError::method_not_found(name),
            ProtocolError::Introspection { .. } => RpcError::internal(self.to_string()),
        }
    }
}

/// Parameter list of one member, in declaration order.
pub fn annotate(name: &str, member: &Member) -> Result<Vec<ParamDescriptor>, ProtocolError> {
    let signature = match member {
        Member::Procedure(signature) => signature,
        Member::Value { kind } => {
            return Err(ProtocolError::Introspection {
                name: name.to_string(),
                reason: format!("member is a {kind}, not a procedure"),
            })
        }
    };

    let mut params = Vec::with_capacity(signature.params.len());
    for (index, spec) in signature.params.iter().enumerate() {
        if signature.params[..index]
            .iter()
            .any(|earlier| earlier.name == spec.name)
        {
            return Err(ProtocolError::Introspection {
                name: name.to_string(),
                reason: format!("parameter '{}' is declared twice", spec.name),
            });
        }
        params.push(match spec.default {
            Some(default) => ParamDescriptor::optional(spec.name, default.to_json()),
            None => ParamDescriptor::required(spec.name),
        });
    }
    Ok(params)
}

/// One descriptor per whitelisted name, in whitelist order. Any name that
/// fails to resolve aborts the whole build.
pub fn build_catalog(
    whitelist: &[&str],
    members: &impl MemberLookup,
) -> Result<Vec<ProcedureDescriptor>, ProtocolError> {
    whitelist
        .iter()
        .map(|name| {
            let member = members
                .member(name)
                .ok_or_else(|| ProtocolError::UnknownProcedure(name.to_string()))?;
            let (optional, required): (Vec<_>, Vec<_>) = annotate(name, member)?
                .into_iter()
                .partition(ParamDescriptor::is_optional);
            Ok(ProcedureDescriptor {
                procedure: name.to_string(),
                required,
                optional,
            })
        })
        .collect()
}
