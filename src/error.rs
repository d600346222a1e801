use std::fmt;

use serde::{Deserialize, Serialize};

use crate::transport::{FailureHint, TransportFailure};

/// Failure kind stored on a session, either a named condition or a
/// transport status code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Manual cancellation of the request.
    Aborted,
    /// The transport gave up waiting.
    Timeout,
    /// The response body could not be decoded.
    ParserError,
    /// HTTP status code; `0` when the transport failed before a status
    /// was available (connect/DNS errors).
    Status(u16),
    /// Arbitrary code supplied by a failing pipeline task.
    Named(String),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Aborted => f.write_str("aborted"),
            ErrorCode::Timeout => f.write_str("timeout"),
            ErrorCode::ParserError => f.write_str("parser_error"),
            ErrorCode::Status(status) => write!(f, "{status}"),
            ErrorCode::Named(name) => f.write_str(name),
        }
    }
}

/// Error stored on a session and surfaced through `fail`/`always` events.
///
/// This is observable data, not a `std::error::Error`: the engine never
/// returns it from public methods, callers see it via events or the
/// session's status queries. It serializes for logging or persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestError {
    pub code: ErrorCode,
    pub message: String,
}

impl RequestError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The error recorded when a request is aborted.
    pub fn aborted() -> Self {
        Self::new(
            ErrorCode::Aborted,
            status_message(&ErrorCode::Aborted).unwrap_or_default(),
        )
    }

    /// Classifies a raw transport failure into a stored session error.
    ///
    /// The classification hint wins over the numeric status; when the
    /// message table has no entry for the resulting code, the transport's
    /// own detail text is used.
    pub fn classify(failure: &TransportFailure) -> Self {
        let code = match failure.hint {
            FailureHint::Abort => ErrorCode::Aborted,
            FailureHint::Timeout => ErrorCode::Timeout,
            FailureHint::ParserError => ErrorCode::ParserError,
            FailureHint::Http | FailureHint::Network => {
                ErrorCode::Status(failure.status.unwrap_or(0))
            }
        };
        let message = status_message(&code)
            .map(str::to_owned)
            .unwrap_or_else(|| {
                if failure.detail.is_empty() {
                    "request error".to_owned()
                } else {
                    failure.detail.clone()
                }
            });
        Self { code, message }
    }

    pub fn is_aborted(&self) -> bool {
        self.code == ErrorCode::Aborted
    }
}

/// Canonical message for well-known failure codes.
pub fn status_message(code: &ErrorCode) -> Option<&'static str> {
    let message = match code {
        ErrorCode::Aborted => "Manual abort request",
        ErrorCode::Timeout => "Request timeout",
        ErrorCode::ParserError => "Parse response failed",
        ErrorCode::Status(status) => match status {
            204 => "Server has received the request but there is no information to send back",
            400 => "The request had bad syntax or was inherently impossible to be satisfied",
            401 => "The parameter to this message gives a specification of authorization schemes which are acceptable",
            403 => "The request is for something forbidden",
            404 => "The server has not found anything matching the URI given",
            405 => "Method not allowed",
            406 => "Not acceptable",
            408 => "Request timeout",
            413 => "Payload too large",
            414 => "URI too long",
            429 => "Too many requests",
            431 => "Request header fields too large",
            500 => "The server encountered an unexpected condition which prevented it from fulfilling the request",
            501 => "The server does not support the facility required",
            _ => return None,
        },
        ErrorCode::Named(_) => return None,
    };
    Some(message)
}

/// Configuration and registry misuse, returned from constructors and
/// registry operations only. Unknown pipeline task names are not covered
/// here: they surface at request time as a pipeline [`RequestError`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No option profile registered under this name.
    #[error("unknown options profile: {0}")]
    UnknownProfile(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_prefers_hint_over_status() {
        let failure = TransportFailure {
            hint: FailureHint::Abort,
            status: Some(500),
            detail: "connection dropped".to_owned(),
        };
        let error = RequestError::classify(&failure);
        assert_eq!(error.code, ErrorCode::Aborted);
        assert_eq!(error.message, "Manual abort request");
    }

    #[test]
    fn classify_known_status_uses_message_table() {
        let failure = TransportFailure {
            hint: FailureHint::Http,
            status: Some(404),
            detail: "Not Found".to_owned(),
        };
        let error = RequestError::classify(&failure);
        assert_eq!(error.code, ErrorCode::Status(404));
        assert_eq!(
            error.message,
            "The server has not found anything matching the URI given"
        );
    }

    #[test]
    fn classify_unknown_status_falls_back_to_detail() {
        let failure = TransportFailure {
            hint: FailureHint::Http,
            status: Some(418),
            detail: "I'm a teapot".to_owned(),
        };
        let error = RequestError::classify(&failure);
        assert_eq!(error.code, ErrorCode::Status(418));
        assert_eq!(error.message, "I'm a teapot");
    }

    #[test]
    fn error_serializes_for_logging() {
        let aborted = RequestError::aborted();
        assert_eq!(
            serde_json::to_value(&aborted).expect("serializes"),
            serde_json::json!({"code": "aborted", "message": "Manual abort request"})
        );

        let status = RequestError::new(ErrorCode::Status(404), "missing");
        let value = serde_json::to_value(&status).expect("serializes");
        assert_eq!(value, serde_json::json!({"code": {"status": 404}, "message": "missing"}));
        let parsed: RequestError = serde_json::from_value(value).expect("round-trips");
        assert_eq!(parsed, status);
    }

    #[test]
    fn classify_network_failure_without_status_is_code_zero() {
        let failure = TransportFailure {
            hint: FailureHint::Network,
            status: None,
            detail: "dns lookup failed".to_owned(),
        };
        let error = RequestError::classify(&failure);
        assert_eq!(error.code, ErrorCode::Status(0));
        assert_eq!(error.message, "dns lookup failed");
    }
}
