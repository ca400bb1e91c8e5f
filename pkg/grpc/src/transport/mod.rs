//! Abstractions between the call/channel layer and concrete transports,
//! plus the transport pooling machinery built on top of them.

pub mod delayed;
pub mod set;

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::http2::codec::CodecPair;
use crate::http2::ping::PingCallback;
use crate::http2::types::Http2ErrorCode;
use crate::metadata::Metadata;
use crate::status::Status;

/// An ordered set of socket addresses treated as one logical backend.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AddressGroup {
    pub addresses: Vec<SocketAddr>,
}

impl AddressGroup {
    pub fn new(addresses: Vec<SocketAddr>) -> Self {
        Self { addresses }
    }

    pub fn single(address: SocketAddr) -> Self {
        Self {
            addresses: vec![address],
        }
    }
}

/// Everything needed to open one stream on a client transport.
pub struct NewStreamArgs {
    /// Fully qualified method, e.g. "pkg.Service/Method" (no leading '/').
    pub method: String,
    pub authority: String,
    pub timeout: Option<Duration>,
    pub metadata: Metadata,
    pub user_agent: String,
    pub message_encoding: Option<String>,
    pub listener: Box<dyn ClientStreamListener>,
}

/// Callbacks for inbound events on one client stream.
///
/// Invoked from the transport's connection task; implementations hand off
/// to the application through a serializing executor. on_close is always
/// the final callback and is invoked exactly once.
pub trait ClientStreamListener: Send + 'static {
    fn on_headers(&mut self, metadata: Metadata);
    fn on_message(&mut self, message: Bytes);
    fn on_ready(&mut self);
    fn on_close(&mut self, status: Status, trailers: Metadata);
}

/// Outbound operations on one client stream. All non-blocking: operations
/// enqueue commands processed by the connection task in submission order.
pub trait ClientStreamHandle: Send + Sync {
    fn send_message(&self, message: Bytes);
    fn half_close(&self);
    fn request(&self, n: u32);
    fn cancel(&self, status: Status);
}

pub trait ClientTransport: Send + Sync {
    fn new_stream(&self, args: NewStreamArgs) -> Box<dyn ClientStreamHandle>;

    fn ping(&self, callback: PingCallback);

    /// Graceful: in-flight streams complete, no new streams.
    fn shutdown(&self);

    /// Abrupt: all streams fail with the status.
    fn shutdown_now(&self, status: Status);
}

/// Connection-level events reported by a client transport to its owner
/// (the TransportSet).
pub trait TransportLifecycle: Send + Sync {
    fn on_ready(&self);
    /// Edge-triggered: fires on 0 <-> >=1 active stream transitions.
    fn on_in_use(&self, in_use: bool);
    fn on_shutdown(&self, status: &Status);
    /// The peer sent GOAWAY with the given code.
    fn on_goaway(&self, code: Http2ErrorCode, status: &Status) {
        let _ = (code, status);
    }
    fn on_terminated(&self);
}

/// Lifecycle sink for transports nobody needs to observe (tests, failing
/// transports).
pub struct NullLifecycle;

impl TransportLifecycle for NullLifecycle {
    fn on_ready(&self) {}
    fn on_in_use(&self, _in_use: bool) {}
    fn on_shutdown(&self, _status: &Status) {}
    fn on_terminated(&self) {}
}

/// Establishes framed connections to individual socket addresses. The
/// actual HTTP/2 codec behind the pair is outside this crate.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: SocketAddr) -> Result<CodecPair, Status>;
}

/// Accepts inbound framed connections for a server.
#[async_trait]
pub trait TransportAcceptor: Send {
    async fn accept(&mut self) -> Result<CodecPair, Status>;
}

/// Callbacks for inbound events on one server stream.
pub trait ServerStreamListener: Send + 'static {
    fn on_message(&mut self, message: Bytes);
    /// The client sent end-of-stream; all messages have been delivered.
    fn on_half_close(&mut self);
    fn on_ready(&mut self);
    /// Terminal: the stream died without completing (RST, connection loss,
    /// forced shutdown).
    fn on_cancel(&mut self, status: Status);
    /// Terminal: the final frame of the response was flushed.
    fn on_complete(&mut self);
}

/// Outbound operations on one server stream.
pub trait ServerStreamHandle: Send + Sync {
    fn send_headers(&self, metadata: Metadata);
    fn send_message(&self, message: Bytes);
    /// Sends trailers (or a trailers-only response) carrying the final
    /// status and ends the stream.
    fn close(&self, status: Status, trailers: Metadata);
    /// Abandons the stream with RST_STREAM(CANCEL).
    fn cancel(&self, status: Status);
    fn request(&self, n: u32);
}

/// Implemented by the server to receive streams from a server transport.
pub trait ServerTransportListener: Send + 'static {
    fn stream_created(
        &mut self,
        stream: Box<dyn ServerStreamHandle>,
        method: String,
        metadata: Metadata,
    ) -> Box<dyn ServerStreamListener>;

    fn transport_terminated(&mut self);
}

/// Transport on which every stream fails immediately with a fixed status.
/// Returned to calls when the channel cannot provide a real transport
/// (shut down, resolution failed without wait-for-ready).
pub struct FailingClientTransport {
    status: Status,
}

impl FailingClientTransport {
    pub fn new(status: Status) -> Self {
        Self { status }
    }
}

/// Handle whose operations go nowhere; used once a stream has already
/// terminated.
pub struct NoopStreamHandle;

impl ClientStreamHandle for NoopStreamHandle {
    fn send_message(&self, _message: Bytes) {}
    fn half_close(&self) {}
    fn request(&self, _n: u32) {}
    fn cancel(&self, _status: Status) {}
}

impl ClientTransport for FailingClientTransport {
    fn new_stream(&self, args: NewStreamArgs) -> Box<dyn ClientStreamHandle> {
        let mut listener = args.listener;
        listener.on_close(self.status.clone(), Metadata::new());
        Box::new(NoopStreamHandle)
    }

    fn ping(&self, callback: PingCallback) {
        callback(Err(self.status.clone()));
    }

    fn shutdown(&self) {}

    fn shutdown_now(&self, _status: Status) {}
}
