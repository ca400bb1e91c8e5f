//! A gRPC runtime over HTTP/2: client channels with name resolution, load
//! balancing and transport pooling, per-call state machines with deadlines
//! and cancellation, and a managed server with method dispatch.
//!
//! The HTTP/2 framing codec, TLS, and message serialization are external
//! collaborators: frames cross the [`http2::codec`] traits as typed
//! events, and messages are opaque length-prefixed byte payloads.

pub mod backoff;
pub mod balancer;
pub mod call_options;
pub mod channel;
pub mod context;
pub mod deadline;
pub mod exec;
pub mod framing;
pub mod http2;
pub mod metadata;
pub mod resolver;
pub mod server;
pub mod status;
pub mod timeout;
pub mod transport;

pub use call_options::{CallOptions, OptionKey};
pub use channel::call::{CallListener, ClientCall};
pub use channel::{Channel, ChannelOptions};
pub use context::{Context, ContextKey};
pub use deadline::Deadline;
pub use metadata::{Metadata, MetadataValue};
pub use server::registry::{MethodRegistry, ServerCall, ServerCallHandler, ServerCallListener};
pub use server::{Server, ServerOptions};
pub use status::{Code, Status};
