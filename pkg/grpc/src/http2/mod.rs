//! Translation between gRPC stream commands and HTTP/2 frames.
//!
//! The HTTP/2 framing codec itself (frame parsing, HPACK) is an external
//! collaborator behind the FrameReceiver/FrameSender traits; this module
//! owns everything above it: stream id allocation, per-stream state, flow
//! control, GOAWAY and ping handling.

pub mod client;
pub mod codec;
pub mod flow_control;
pub mod headers;
pub mod ping;
pub mod pipe;
pub mod server;
pub mod types;

pub use client::{Http2ClientTransport, Http2Options};
pub use codec::{CodecError, Frame, FrameReceiver, FrameSender, HeaderField};
pub use server::Http2ServerTransport;
pub use types::{Http2ErrorCode, StreamId, WindowSize, MAX_STREAM_ID};
