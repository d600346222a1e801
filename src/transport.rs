use std::future::Future;
use std::time::Duration;

use serde_json::Value;

/// HTTP verb for a resolved attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Head,
    Patch,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Patch => "PATCH",
        }
    }

    /// Verbs whose payload is encoded into the query string instead of a
    /// request body.
    pub fn sends_query_data(&self) -> bool {
        matches!(self, Method::Get | Method::Head | Method::Delete)
    }
}

/// How the transport should decode a successful response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    /// JSON when the response content type says so, plain text otherwise.
    #[default]
    Auto,
    Json,
    Text,
}

/// A fully-resolved attempt, free of engine knobs and event handlers.
///
/// This is what crosses the transport boundary; the same value is reused
/// verbatim for every retry of the attempt.
#[derive(Debug, Clone, Default)]
pub struct TransportRequest {
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub data: Option<Value>,
    pub timeout: Option<Duration>,
    pub response_format: ResponseFormat,
}

/// Classification hint attached to a transport failure, analogous to a
/// status text: it tells the engine how to file the failure before any
/// numeric status is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureHint {
    /// The call was cancelled.
    Abort,
    /// The call exceeded its time budget.
    Timeout,
    /// The response arrived but could not be decoded.
    ParserError,
    /// A response arrived with a non-success status.
    Http,
    /// The call failed below the HTTP layer (DNS, connect, reset).
    Network,
}

/// Raw failure reported by a transport.
#[derive(Debug, Clone)]
pub struct TransportFailure {
    pub hint: FailureHint,
    /// HTTP status when one was received.
    pub status: Option<u16>,
    /// Human-readable detail (status text, decode error, IO error).
    pub detail: String,
}

impl TransportFailure {
    pub fn new(hint: FailureHint, status: Option<u16>, detail: impl Into<String>) -> Self {
        Self {
            hint,
            status,
            detail: detail.into(),
        }
    }
}

/// The transport collaborator: performs one physical attempt.
///
/// Each call resolves to exactly one of a decoded success payload or a
/// classified failure; resolution of the returned future is the attempt's
/// final settlement signal. Cancellation is cooperative: the session drops
/// the future when the attempt is aborted, so implementations must not
/// rely on running to completion.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: TransportRequest,
    ) -> impl Future<Output = Result<Value, TransportFailure>> + Send;
}
