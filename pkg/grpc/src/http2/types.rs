use crate::status::{Code, Status};

pub type StreamId = u32;

/// Flow control window size. May legally go negative after a SETTINGS
/// initial-window-size decrease.
pub type WindowSize = i32;

/// Largest usable stream id (31 bits).
pub const MAX_STREAM_ID: StreamId = (1 << 31) - 1;

pub const DEFAULT_WINDOW_SIZE: WindowSize = 65_535;

/// HTTP/2 error codes as carried by RST_STREAM and GOAWAY frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Http2ErrorCode {
    NoError,
    ProtocolError,
    InternalError,
    FlowControlError,
    SettingsTimeout,
    StreamClosed,
    FrameSizeError,
    RefusedStream,
    Cancel,
    CompressionError,
    ConnectError,
    EnhanceYourCalm,
    InadequateSecurity,
    Http11Required,
    Unknown(u32),
}

impl Http2ErrorCode {
    pub fn from_wire(value: u32) -> Self {
        match value {
            0x0 => Http2ErrorCode::NoError,
            0x1 => Http2ErrorCode::ProtocolError,
            0x2 => Http2ErrorCode::InternalError,
            0x3 => Http2ErrorCode::FlowControlError,
            0x4 => Http2ErrorCode::SettingsTimeout,
            0x5 => Http2ErrorCode::StreamClosed,
            0x6 => Http2ErrorCode::FrameSizeError,
            0x7 => Http2ErrorCode::RefusedStream,
            0x8 => Http2ErrorCode::Cancel,
            0x9 => Http2ErrorCode::CompressionError,
            0xa => Http2ErrorCode::ConnectError,
            0xb => Http2ErrorCode::EnhanceYourCalm,
            0xc => Http2ErrorCode::InadequateSecurity,
            0xd => Http2ErrorCode::Http11Required,
            other => Http2ErrorCode::Unknown(other),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            Http2ErrorCode::NoError => 0x0,
            Http2ErrorCode::ProtocolError => 0x1,
            Http2ErrorCode::InternalError => 0x2,
            Http2ErrorCode::FlowControlError => 0x3,
            Http2ErrorCode::SettingsTimeout => 0x4,
            Http2ErrorCode::StreamClosed => 0x5,
            Http2ErrorCode::FrameSizeError => 0x6,
            Http2ErrorCode::RefusedStream => 0x7,
            Http2ErrorCode::Cancel => 0x8,
            Http2ErrorCode::CompressionError => 0x9,
            Http2ErrorCode::ConnectError => 0xa,
            Http2ErrorCode::EnhanceYourCalm => 0xb,
            Http2ErrorCode::InadequateSecurity => 0xc,
            Http2ErrorCode::Http11Required => 0xd,
            Http2ErrorCode::Unknown(other) => other,
        }
    }

    /// gRPC status reported to a call whose stream was reset with this
    /// code.
    pub fn to_status(self) -> Status {
        let code = match self {
            Http2ErrorCode::NoError | Http2ErrorCode::RefusedStream => Code::Unavailable,
            Http2ErrorCode::Cancel => Code::Cancelled,
            Http2ErrorCode::EnhanceYourCalm => Code::ResourceExhausted,
            Http2ErrorCode::InadequateSecurity => Code::PermissionDenied,
            Http2ErrorCode::Http11Required => Code::Unknown,
            Http2ErrorCode::ProtocolError
            | Http2ErrorCode::InternalError
            | Http2ErrorCode::FlowControlError
            | Http2ErrorCode::SettingsTimeout
            | Http2ErrorCode::StreamClosed
            | Http2ErrorCode::FrameSizeError
            | Http2ErrorCode::CompressionError
            | Http2ErrorCode::ConnectError
            | Http2ErrorCode::Unknown(_) => Code::Internal,
        };
        Status::new(code).with_message(format!("HTTP/2 stream reset: {:?}", self))
    }
}
