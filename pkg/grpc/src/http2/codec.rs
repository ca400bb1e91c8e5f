use async_trait::async_trait;
use bytes::Bytes;

use crate::http2::types::{Http2ErrorCode, StreamId};

/// One decoded header, name already lowercased by the codec. The value is
/// kept as bytes: HTTP/2 header values are opaque octets and binary
/// metadata only becomes ASCII after base64 encoding at the gRPC layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub value: Bytes,
}

impl HeaderField {
    pub fn new(name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

/// A single HTTP/2 frame, already decoded by (or about to be encoded by)
/// the external framing codec. The same shape serves both directions.
#[derive(Clone, Debug)]
pub enum Frame {
    Headers {
        stream_id: StreamId,
        headers: Vec<HeaderField>,
        end_stream: bool,
    },
    Data {
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    },
    RstStream {
        stream_id: StreamId,
        code: Http2ErrorCode,
    },
    GoAway {
        last_stream_id: StreamId,
        code: Http2ErrorCode,
        debug_data: Bytes,
    },
    Ping {
        payload: [u8; 8],
        ack: bool,
    },
    Settings {
        initial_window_size: Option<u32>,
        max_concurrent_streams: Option<u32>,
        ack: bool,
    },
    WindowUpdate {
        stream_id: StreamId,
        increment: u32,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection protocol error: {0}")]
    Protocol(String),
}

/// Read half of the framing codec.
///
/// recv() must be cancel safe: the transport select!s it against its
/// command queue.
#[async_trait]
pub trait FrameReceiver: Send {
    /// Next frame, or None once the peer has closed the connection.
    async fn recv(&mut self) -> Result<Option<Frame>, CodecError>;
}

/// Write half of the framing codec.
#[async_trait]
pub trait FrameSender: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), CodecError>;
}

/// A connected pair of codec halves, as produced by a connector or an
/// accepted listener socket.
pub struct CodecPair {
    pub receiver: Box<dyn FrameReceiver>,
    pub sender: Box<dyn FrameSender>,
}
