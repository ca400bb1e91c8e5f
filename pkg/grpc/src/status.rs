use std::fmt;
use std::sync::Arc;

/// Canonical gRPC status codes.
///
/// The numeric values are fixed by the protocol and are what appears in the
/// 'grpc-status' trailer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    pub fn value(self) -> i32 {
        self as i32
    }

    /// Looks up a code by its wire value. Values outside the defined range
    /// have no code (callers usually substitute Unknown).
    pub fn from_value(value: i32) -> Option<Code> {
        Some(match value {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => return None,
        })
    }
}

/// Outcome of an RPC: a code plus an optional human readable message and an
/// optional underlying cause.
///
/// Statuses are immutable. with_message()/with_cause() return modified
/// copies so that a shared Status can never be mutated behind a caller's
/// back.
///
/// NOTE: The cause is never sent over the wire. It only exists for local
/// debugging of locally generated statuses.
#[derive(Clone)]
pub struct Status {
    code: Code,
    message: Option<Arc<str>>,
    cause: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Status {
    pub const OK: Status = Status {
        code: Code::Ok,
        message: None,
        cause: None,
    };

    pub fn new(code: Code) -> Self {
        Self {
            code,
            message: None,
            cause: None,
        }
    }

    pub fn with_message<S: Into<String>>(&self, message: S) -> Self {
        let mut s = self.clone();
        s.message = Some(message.into().into());
        s
    }

    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(&self, cause: E) -> Self {
        let mut s = self.clone();
        s.cause = Some(Arc::new(cause));
        s
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }

    /// Status for a 'grpc-status' wire value. Out of range values produce
    /// UNKNOWN describing the raw value.
    pub fn from_code_value(value: i32) -> Self {
        match Code::from_value(value) {
            Some(code) => Status::new(code),
            None => Status::new(Code::Unknown)
                .with_message(format!("Unknown grpc-status code: {}", value)),
        }
    }

    pub fn cancelled<S: Into<String>>(message: S) -> Self {
        Status::new(Code::Cancelled).with_message(message)
    }

    pub fn unknown<S: Into<String>>(message: S) -> Self {
        Status::new(Code::Unknown).with_message(message)
    }

    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Status::new(Code::InvalidArgument).with_message(message)
    }

    pub fn deadline_exceeded<S: Into<String>>(message: S) -> Self {
        Status::new(Code::DeadlineExceeded).with_message(message)
    }

    pub fn resource_exhausted<S: Into<String>>(message: S) -> Self {
        Status::new(Code::ResourceExhausted).with_message(message)
    }

    pub fn unimplemented<S: Into<String>>(message: S) -> Self {
        Status::new(Code::Unimplemented).with_message(message)
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Status::new(Code::Internal).with_message(message)
    }

    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Status::new(Code::Unavailable).with_message(message)
    }

    pub fn data_loss<S: Into<String>>(message: S) -> Self {
        Status::new(Code::DataLoss).with_message(message)
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Status");
        s.field("code", &self.code);
        if let Some(message) = &self.message {
            s.field("message", message);
        }
        if let Some(cause) = &self.cause {
            s.field("cause", cause);
        }
        s.finish()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.code)?;
        if let Some(message) = &self.message {
            write!(f, ": {}", message)?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl PartialEq for Status {
    fn eq(&self, other: &Self) -> bool {
        // The cause is intentionally excluded: two statuses describing the
        // same outcome compare equal regardless of local error chains.
        self.code == other.code && self.message == other.message
    }
}

/// Encodes a 'grpc-message' trailer value.
///
/// Printable ASCII except '%' passes through unchanged. Everything else
/// (including '%' itself) becomes a %XX escape so that the value stays a
/// valid ASCII header value.
pub fn percent_encode_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for &b in message.as_bytes() {
        if (0x20..=0x7e).contains(&b) && b != b'%' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Decodes a 'grpc-message' trailer value.
///
/// Decoding is lenient: malformed escapes are passed through verbatim and
/// non-UTF8 results are replaced lossily, since a bad message must never
/// fail an otherwise valid RPC.
pub fn percent_decode_message(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &value[i + 1..i + 3];
            if let Ok(b) = u8::from_str_radix(hex, 16) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_values_round_trip() {
        for value in 0..=16 {
            let code = Code::from_value(value).unwrap();
            assert_eq!(code.value(), value);
        }
        assert_eq!(Code::from_value(17), None);
        assert_eq!(Code::from_value(-1), None);
    }

    #[test]
    fn with_message_does_not_mutate_original() {
        let a = Status::new(Code::Unavailable);
        let b = a.with_message("backend down");
        assert_eq!(a.message(), None);
        assert_eq!(b.message(), Some("backend down"));
        assert_eq!(b.code(), Code::Unavailable);
    }

    #[test]
    fn cause_is_preserved_and_excluded_from_eq() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let a = Status::internal("broken").with_cause(io);
        let b = Status::internal("broken");
        assert!(a.cause().is_some());
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_wire_value_maps_to_unknown() {
        let status = Status::from_code_value(1000);
        assert_eq!(status.code(), Code::Unknown);
        assert!(status.message().unwrap().contains("1000"));
    }

    #[test]
    fn percent_encoding_round_trips() {
        assert_eq!(percent_encode_message("plain text"), "plain text");
        assert_eq!(percent_encode_message("50%"), "50%25");
        assert_eq!(percent_encode_message("\u{00e9}"), "%C3%A9");

        for input in ["plain text", "50%", "\u{00e9}", "new\nline", ""] {
            assert_eq!(percent_decode_message(&percent_encode_message(input)), input);
        }
    }

    #[test]
    fn percent_decoding_is_lenient() {
        assert_eq!(percent_decode_message("100%"), "100%");
        assert_eq!(percent_decode_message("%zzgood"), "%zzgood");
    }
}
