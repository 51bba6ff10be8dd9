//! Standardized HTTP status/cause pairs used by the validation pre-handler
//! and the default `receive_error` formatting, plus the RST_STREAM/GOAWAY
//! error code encoding used when a stream's status is < 100.

use h2::Reason;

/// An HTTP status paired with a machine-readable `cause`, as used by
/// [`crate::server::RequestHandler::receive_error`].
#[derive(Debug, Clone, Copy)]
pub struct StandardError {
    pub status: u16,
    pub cause: &'static str,
}

impl StandardError {
    const fn new(status: u16, cause: &'static str) -> Self {
        StandardError { status, cause }
    }
}

pub const WRONG_URI: StandardError = StandardError::new(404, "");
pub const WRONG_API_NAME_OR_VERSION: StandardError = StandardError::new(400, "INVALID_API");
pub const SYSTEM_FAILURE: StandardError = StandardError::new(500, "SYSTEM_FAILURE");
pub const INCORRECT_LENGTH: StandardError = StandardError::new(411, "INCORRECT_LENGTH");
pub const UNSUPPORTED_MEDIA_TYPE: StandardError = StandardError::new(415, "UNSUPPORTED_MEDIA_TYPE");
pub const METHOD_NOT_ALLOWED: StandardError = StandardError::new(405, "METHOD_NOT_ALLOWED");
pub const METHOD_NOT_IMPLEMENTED: StandardError = StandardError::new(501, "METHOD_NOT_IMPLEMENTED");
pub const SERVICE_UNAVAILABLE: StandardError = StandardError::new(503, "SERVICE_UNAVAILABLE");

/// Maps a `status_code < 100` onto an HTTP/2 stream-reset reason:
/// `Stream::commit` treats such a "status" as an instruction to reset the
/// stream rather than write a response.
pub fn reason_for_code(code: u32) -> Reason {
    match code {
        0x0 => Reason::NO_ERROR,
        0x1 => Reason::PROTOCOL_ERROR,
        0x2 => Reason::INTERNAL_ERROR,
        0x3 => Reason::FLOW_CONTROL_ERROR,
        0x7 => Reason::REFUSED_STREAM,
        0x8 => Reason::CANCEL,
        0xB => Reason::STREAM_CLOSED,
        other => Reason::from(other),
    }
}

/// The inverse of [`reason_for_code`]: used to translate a transport error
/// observed while reading a request body or writing a response into the
/// `rst_stream_goaway_error_code` recorded by [`crate::server::stream::Stream::error`].
pub fn code_for_reason(reason: Reason) -> u32 {
    u32::from(reason)
}

/// Best-effort mapping from an `h2::Error` to a wire error code, for cases
/// where the underlying reason isn't exposed (framing/IO errors outside the
/// RST_STREAM/GOAWAY vocabulary fall back to INTERNAL_ERROR).
pub fn code_for_h2_error(err: &h2::Error) -> u32 {
    err.reason().map(code_for_reason).unwrap_or(0x2)
}
