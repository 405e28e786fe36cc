use geobridge_shared::RpcError;

/// Where failures that can no longer reach a caller end up, such as a host
/// rejecting an annotation after the draw handler returned.
pub trait DiagnosticSink {
    fn rpc_error(&self, error: &RpcError);
    fn debug(&self, message: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn rpc_error(&self, error: &RpcError) {
        tracing::error!(code = error.code, "{error}");
    }

    fn debug(&self, message: &str) {
        tracing::info!(target: "geobridge::debug", "{message}");
    }
}
