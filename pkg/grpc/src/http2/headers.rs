//! Building and parsing of the gRPC header sets carried in HTTP/2 HEADERS
//! frames: request headers, response headers, and trailers.

use std::time::Duration;

use crate::http2::codec::HeaderField;
use crate::metadata::Metadata;
use crate::status::{percent_decode_message, percent_encode_message, Code, Status};
use crate::timeout::encode_timeout;

pub const CONTENT_TYPE_GRPC: &str = "application/grpc";

/// Headers managed by the library. User supplied metadata is scrubbed of
/// these before canonical values are re-added.
pub const RESERVED_HEADERS: [&str; 4] = [
    "user-agent",
    "grpc-encoding",
    "grpc-accept-encoding",
    "grpc-timeout",
];

/// Whether a content-type announces gRPC, allowing suffixed variants like
/// 'application/grpc+proto' and parameterized ones.
pub fn is_grpc_content_type(value: &str) -> bool {
    match value.strip_prefix(CONTENT_TYPE_GRPC) {
        Some("") => true,
        Some(rest) => rest.starts_with('+') || rest.starts_with(';'),
        None => false,
    }
}

pub struct RequestHeaders {
    pub method: String,
    pub authority: String,
    pub scheme: String,
    pub timeout: Option<Duration>,
    pub user_agent: String,
    pub message_encoding: Option<String>,
    pub metadata: Metadata,
}

/// Assembles the HEADERS frame payload opening a client stream.
/// Pseudo-headers first, per HTTP/2, then transport headers, then user
/// metadata.
pub fn build_request_headers(request: RequestHeaders) -> Vec<HeaderField> {
    let mut out = Vec::with_capacity(8 + request.metadata.len());
    out.push(HeaderField::new(":method", "POST"));
    out.push(HeaderField::new(":scheme", request.scheme));
    out.push(HeaderField::new(
        ":path",
        format!("/{}", request.method),
    ));
    out.push(HeaderField::new(":authority", request.authority));
    out.push(HeaderField::new("te", "trailers"));
    out.push(HeaderField::new("content-type", CONTENT_TYPE_GRPC));
    out.push(HeaderField::new("user-agent", request.user_agent));
    if let Some(timeout) = request.timeout {
        out.push(HeaderField::new("grpc-timeout", encode_timeout(timeout)));
    }
    if let Some(encoding) = request.message_encoding {
        out.push(HeaderField::new("grpc-encoding", encoding));
    }
    out.push(HeaderField::new("grpc-accept-encoding", "identity"));
    push_metadata(&mut out, &request.metadata);
    out
}

fn push_metadata(out: &mut Vec<HeaderField>, metadata: &Metadata) {
    for (name, value) in metadata.serialize() {
        out.push(HeaderField { name, value });
    }
}

fn find<'a>(headers: &'a [HeaderField], name: &str) -> Option<&'a HeaderField> {
    headers.iter().find(|h| h.name == name)
}

/// Why an inbound request stream was refused before dispatch.
pub struct RequestRejection {
    pub reason: String,
}

pub struct ParsedRequest {
    pub method: String,
    pub metadata: Metadata,
    /// Set when the 'te' header is missing or not 'trailers'. Lenient:
    /// proxies strip it, so the caller only logs.
    pub te_missing: bool,
}

/// Validates the HEADERS of a new server stream per the gRPC HTTP/2
/// mapping. A rejection translates to RST_STREAM(REFUSED_STREAM) without
/// dispatching a method.
pub fn parse_request_headers(headers: &[HeaderField]) -> Result<ParsedRequest, RequestRejection> {
    match find(headers, ":method").and_then(|h| h.value_str()) {
        Some("POST") => {}
        other => {
            return Err(RequestRejection {
                reason: format!(":method must be POST, got {:?}", other),
            })
        }
    }

    match find(headers, "content-type").and_then(|h| h.value_str()) {
        Some(value) if is_grpc_content_type(value) => {}
        other => {
            return Err(RequestRejection {
                reason: format!("missing or non-grpc content-type: {:?}", other),
            })
        }
    }

    let path = match find(headers, ":path").and_then(|h| h.value_str()) {
        Some(path) if path.starts_with('/') && path.len() > 1 => path,
        other => {
            return Err(RequestRejection {
                reason: format!("malformed :path: {:?}", other),
            })
        }
    };

    let te_missing = !matches!(
        find(headers, "te").and_then(|h| h.value_str()),
        Some("trailers")
    );

    let metadata = Metadata::parse(
        headers
            .iter()
            .map(|h| (h.name.as_str(), h.value.as_ref())),
    )
    .map_err(|e| RequestRejection {
        reason: format!("bad request metadata: {}", e),
    })?;

    Ok(ParsedRequest {
        method: path[1..].to_string(),
        metadata,
        te_missing,
    })
}

/// Initial response headers: ':status 200' plus the gRPC content type.
pub fn build_response_headers(metadata: &Metadata) -> Vec<HeaderField> {
    let mut out = Vec::with_capacity(2 + metadata.len());
    out.push(HeaderField::new(":status", "200"));
    out.push(HeaderField::new("content-type", CONTENT_TYPE_GRPC));
    push_metadata(&mut out, metadata);
    out
}

/// Trailers carrying the final status. For a trailers-only response (no
/// prior headers or messages) the response headers are folded in.
pub fn build_trailers(status: &Status, metadata: &Metadata, trailers_only: bool) -> Vec<HeaderField> {
    let mut out = Vec::new();
    if trailers_only {
        out.push(HeaderField::new(":status", "200"));
        out.push(HeaderField::new("content-type", CONTENT_TYPE_GRPC));
    }
    out.push(HeaderField::new(
        "grpc-status",
        status.code().value().to_string(),
    ));
    if let Some(message) = status.message() {
        out.push(HeaderField::new(
            "grpc-message",
            percent_encode_message(message),
        ));
    }
    push_metadata(&mut out, metadata);
    out
}

/// What a client saw in a HEADERS frame on a response stream.
pub enum ResponseHeaders {
    /// Valid initial headers preceding messages.
    Initial { metadata: Metadata },
    /// Terminal headers: either explicit trailers-only or a failed HTTP
    /// level response.
    Closed { status: Status, metadata: Metadata },
}

/// Maps a non-200 HTTP status to the gRPC code used when a response never
/// reaches the gRPC protocol layer.
fn http_status_to_grpc(code: u32) -> Code {
    match code {
        400 => Code::Internal,
        401 => Code::Unauthenticated,
        403 => Code::PermissionDenied,
        404 => Code::Unimplemented,
        429 | 502 | 503 | 504 => Code::Unavailable,
        _ => Code::Unknown,
    }
}

/// Parses the first HEADERS frame of a response.
pub fn parse_response_headers(headers: &[HeaderField], end_stream: bool) -> ResponseHeaders {
    let metadata = match Metadata::parse(
        headers
            .iter()
            .map(|h| (h.name.as_str(), h.value.as_ref())),
    ) {
        Ok(m) => m,
        Err(e) => {
            return ResponseHeaders::Closed {
                status: Status::internal(format!("bad response metadata: {}", e)),
                metadata: Metadata::new(),
            }
        }
    };

    let http_status = find(headers, ":status").and_then(|h| h.value_str());
    match http_status.and_then(|s| s.parse::<u32>().ok()) {
        Some(200) => {}
        Some(code) => {
            return ResponseHeaders::Closed {
                status: Status::new(http_status_to_grpc(code))
                    .with_message(format!("HTTP status {}", code)),
                metadata,
            }
        }
        None => {
            return ResponseHeaders::Closed {
                status: Status::internal("response missing :status"),
                metadata,
            }
        }
    }

    // Trailers-only response: the stream ends here with a status.
    if metadata.contains_key("grpc-status") || end_stream {
        let (status, metadata) = parse_trailers_metadata(metadata);
        return ResponseHeaders::Closed { status, metadata };
    }

    match metadata.get_ascii("content-type") {
        Some(value) if is_grpc_content_type(value) => {}
        value => {
            return ResponseHeaders::Closed {
                status: Status::unknown(format!(
                    "invalid content-type on response: {:?}",
                    value
                )),
                metadata,
            }
        }
    }

    ResponseHeaders::Initial { metadata }
}

/// Extracts the final status from trailer metadata, removing the status
/// headers from what the application sees.
pub fn parse_trailers_metadata(mut metadata: Metadata) -> (Status, Metadata) {
    let code = metadata
        .remove_all("grpc-status")
        .into_iter()
        .next()
        .and_then(|v| v.as_str().and_then(|s| s.parse::<i32>().ok()).map(Status::from_code_value));

    let message = metadata
        .remove_all("grpc-message")
        .into_iter()
        .next()
        .and_then(|v| v.as_str().map(percent_decode_message));

    let status = match code {
        Some(status) => match message {
            Some(message) if !status.is_ok() => status.with_message(message),
            _ => status,
        },
        None => Status::unknown("missing grpc-status in trailers"),
    };

    (status, metadata)
}

/// Parses a trailing HEADERS frame (after initial headers were seen).
pub fn parse_trailers(headers: &[HeaderField]) -> (Status, Metadata) {
    match Metadata::parse(
        headers
            .iter()
            .map(|h| (h.name.as_str(), h.value.as_ref())),
    ) {
        Ok(metadata) => parse_trailers_metadata(metadata),
        Err(e) => (
            Status::internal(format!("bad trailer metadata: {}", e)),
            Metadata::new(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RequestHeaders {
        RequestHeaders {
            method: "pkg.Echo/Say".to_string(),
            authority: "example.com".to_string(),
            scheme: "http".to_string(),
            timeout: Some(Duration::from_secs(2)),
            user_agent: "grpc-rust-h2/0.1.0".to_string(),
            message_encoding: None,
            metadata: Metadata::new(),
        }
    }

    fn header_value<'a>(headers: &'a [HeaderField], name: &str) -> Option<&'a str> {
        find(headers, name).and_then(|h| h.value_str())
    }

    #[test]
    fn request_headers_carry_the_grpc_surface() {
        let mut md = Metadata::new();
        md.add_ascii("x-token", "abc").unwrap();
        let mut req = request();
        req.metadata = md;

        let headers = build_request_headers(req);
        assert_eq!(header_value(&headers, ":method"), Some("POST"));
        assert_eq!(header_value(&headers, ":path"), Some("/pkg.Echo/Say"));
        assert_eq!(header_value(&headers, ":authority"), Some("example.com"));
        assert_eq!(header_value(&headers, "te"), Some("trailers"));
        assert_eq!(header_value(&headers, "content-type"), Some("application/grpc"));
        assert_eq!(header_value(&headers, "grpc-timeout"), Some("2000000u"));
        assert_eq!(header_value(&headers, "x-token"), Some("abc"));

        // Pseudo-headers come before all regular headers.
        let first_regular = headers.iter().position(|h| !h.name.starts_with(':')).unwrap();
        assert!(headers[..first_regular].iter().all(|h| h.name.starts_with(':')));
    }

    #[test]
    fn round_trip_request_parse() {
        let headers = build_request_headers(request());
        let parsed = parse_request_headers(&headers).ok().unwrap();
        assert_eq!(parsed.method, "pkg.Echo/Say");
        assert!(!parsed.te_missing);
        assert_eq!(parsed.metadata.get_ascii("grpc-timeout"), Some("2000000u"));
    }

    #[test]
    fn non_post_method_is_rejected() {
        let mut headers = build_request_headers(request());
        headers[0] = HeaderField::new(":method", "GET");
        assert!(parse_request_headers(&headers).is_err());
    }

    #[test]
    fn missing_content_type_is_rejected() {
        let headers: Vec<HeaderField> = build_request_headers(request())
            .into_iter()
            .filter(|h| h.name != "content-type")
            .collect();
        let rejection = parse_request_headers(&headers).err().unwrap();
        assert!(rejection.reason.contains("content-type"));
    }

    #[test]
    fn content_type_variants() {
        assert!(is_grpc_content_type("application/grpc"));
        assert!(is_grpc_content_type("application/grpc+proto"));
        assert!(is_grpc_content_type("application/grpc; charset=utf-8"));
        assert!(!is_grpc_content_type("application/grpcweb"));
        assert!(!is_grpc_content_type("application/json"));
    }

    #[test]
    fn missing_te_is_flagged_not_rejected() {
        let headers: Vec<HeaderField> = build_request_headers(request())
            .into_iter()
            .filter(|h| h.name != "te")
            .collect();
        let parsed = parse_request_headers(&headers).ok().unwrap();
        assert!(parsed.te_missing);
    }

    #[test]
    fn response_headers_round_trip() {
        let mut md = Metadata::new();
        md.add_ascii("x-info", "yes").unwrap();
        let headers = build_response_headers(&md);

        match parse_response_headers(&headers, false) {
            ResponseHeaders::Initial { metadata } => {
                assert_eq!(metadata.get_ascii("x-info"), Some("yes"));
            }
            ResponseHeaders::Closed { status, .. } => panic!("unexpected close: {}", status),
        }
    }

    #[test]
    fn bad_content_type_close_names_the_header_and_value() {
        let headers = vec![
            HeaderField::new(":status", "200"),
            HeaderField::new("content-type", "application/bad"),
        ];
        match parse_response_headers(&headers, false) {
            ResponseHeaders::Closed { status, metadata } => {
                assert_eq!(status.code(), Code::Unknown);
                assert!(status.message().unwrap().contains("content-type"));
                assert_eq!(metadata.get_ascii("content-type"), Some("application/bad"));
            }
            ResponseHeaders::Initial { .. } => panic!("must close"),
        }
    }

    #[test]
    fn http_error_statuses_map_to_grpc_codes() {
        for (http, grpc) in [
            (401u32, Code::Unauthenticated),
            (403, Code::PermissionDenied),
            (404, Code::Unimplemented),
            (503, Code::Unavailable),
            (500, Code::Unknown),
        ] {
            let headers = vec![HeaderField::new(":status", http.to_string())];
            match parse_response_headers(&headers, false) {
                ResponseHeaders::Closed { status, .. } => assert_eq!(status.code(), grpc),
                ResponseHeaders::Initial { .. } => panic!("must close"),
            }
        }
    }

    #[test]
    fn trailers_only_response_parses_status() {
        let status = Status::new(Code::NotFound).with_message("no such thing: 50%");
        let trailers = build_trailers(&status, &Metadata::new(), true);
        match parse_response_headers(&trailers, true) {
            ResponseHeaders::Closed { status, .. } => {
                assert_eq!(status.code(), Code::NotFound);
                assert_eq!(status.message(), Some("no such thing: 50%"));
            }
            ResponseHeaders::Initial { .. } => panic!("must close"),
        }
    }

    #[test]
    fn trailers_strip_status_headers_from_metadata() {
        let mut md = Metadata::new();
        md.add_ascii("x-final", "1").unwrap();
        let status = Status::new(Code::Aborted).with_message("raced");
        let headers = build_trailers(&status, &md, false);

        let (parsed_status, trailers) = parse_trailers(&headers);
        assert_eq!(parsed_status.code(), Code::Aborted);
        assert_eq!(parsed_status.message(), Some("raced"));
        assert!(!trailers.contains_key("grpc-status"));
        assert!(!trailers.contains_key("grpc-message"));
        assert_eq!(trailers.get_ascii("x-final"), Some("1"));
    }

    #[test]
    fn missing_grpc_status_in_trailers_is_unknown() {
        let (status, _) = parse_trailers(&[HeaderField::new("x-meta", "v")]);
        assert_eq!(status.code(), Code::Unknown);
        assert!(status.message().unwrap().contains("grpc-status"));
    }
}
