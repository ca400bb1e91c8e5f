use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::context::Context;
use crate::metadata::Metadata;
use crate::status::Status;
use crate::transport::ServerStreamHandle;

/// Application-side callbacks for one inbound call. Any Err return cancels
/// the stream with CANCELLED carrying the status as cause.
pub trait ServerCallListener: Send + 'static {
    fn on_message(&mut self, message: Bytes) -> Result<(), Status>;
    /// All client messages have been delivered.
    fn on_half_close(&mut self) -> Result<(), Status>;
    fn on_ready(&mut self) -> Result<(), Status> {
        Ok(())
    }
    /// Terminal: the call died without completing.
    fn on_cancel(&mut self, status: Status);
    /// Terminal: the response (including trailers) was fully sent.
    fn on_complete(&mut self);
}

/// Produces a listener for each call of one registered method.
pub trait ServerCallHandler: Send + Sync {
    fn start_call(&self, call: ServerCall, metadata: Metadata) -> Box<dyn ServerCallListener>;
}

/// Handle the application uses to drive the response side of a call.
#[derive(Clone)]
pub struct ServerCall {
    stream: Arc<dyn ServerStreamHandle>,
    context: Context,
    method: String,
}

impl ServerCall {
    pub(crate) fn new(
        stream: Arc<dyn ServerStreamHandle>,
        context: Context,
        method: String,
    ) -> Self {
        Self {
            stream,
            context,
            method,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The per-call context; cancelled when the client goes away or the
    /// call's deadline expires.
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn send_headers(&self, metadata: Metadata) {
        self.stream.send_headers(metadata);
    }

    pub fn send_message(&self, message: Bytes) {
        self.stream.send_message(message);
    }

    /// Completes the call with the final status and trailers.
    pub fn close(&self, status: Status, trailers: Metadata) {
        self.stream.close(status, trailers);
    }

    /// Permits up to n more inbound messages.
    pub fn request(&self, n: u32) {
        self.stream.request(n);
    }

    /// Abandons the call with RST_STREAM(CANCEL).
    pub fn cancel(&self, status: Status) {
        self.stream.cancel(status);
    }
}

/// Lookup table from fully qualified method name ("pkg.Service/Method") to
/// its handler.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: HashMap<String, Arc<dyn ServerCallHandler>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_method<S: Into<String>>(
        &mut self,
        full_name: S,
        handler: Arc<dyn ServerCallHandler>,
    ) -> &mut Self {
        self.methods.insert(full_name.into(), handler);
        self
    }

    pub fn lookup(&self, full_name: &str) -> Option<Arc<dyn ServerCallHandler>> {
        self.methods.get(full_name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}
