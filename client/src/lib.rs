pub mod annotations;
pub mod bridge;
pub mod commands;
pub mod diagnostics;
pub mod engine;
pub mod host;
pub mod palette;
pub mod protocol;
pub mod state;
pub mod wms;

#[cfg(target_arch = "wasm32")]
mod wasm;

pub use annotations::{AnnotationSync, DrawEvent, Submission, SyncState};
pub use bridge::ClientBridge;
pub use commands::{CommandError, MapClient};
pub use engine::{DrawSurface, FeatureStyle, HeadlessMap, MapEngine};
pub use host::{Host, Outbound, RpcHost, TransportError};
pub use state::ClientConfig;
#[cfg(target_arch = "wasm32")]
pub use wasm::GeoBridge;
