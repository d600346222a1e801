//! `reqflow` is a transport-agnostic HTTP request lifecycle engine.
//!
//! A [`Session`] owns one logical request: its attempts, retries, abort
//! handling, payload/response task pipelines, and lifecycle events. The
//! actual network call is behind the [`Transport`] trait; [`HttpTransport`]
//! is the bundled `reqwest` implementation.
//!
//! ```no_run
//! use std::time::Duration;
//! use reqflow::{HttpTransport, OptionsPatch, Session};
//!
//! #[tokio::main]
//! async fn main() {
//!     let session = Session::new(HttpTransport::new());
//!     session.on_done(|response| println!("got {response}"));
//!     session.on_fail(|message, code| eprintln!("failed [{code}]: {message}"));
//!
//!     session
//!         .request(
//!             OptionsPatch::new()
//!                 .url("https://api.example.com/v1/items")
//!                 .retry(3)
//!                 .retry_delay(Duration::from_millis(200)),
//!         )
//!         .await;
//! }
//! ```
//!
//! Outcomes are observed through events and status queries
//! ([`Session::is_success`], [`Session::is_aborted`], …); the engine never
//! returns request errors from its public methods.

mod error;
mod events;
mod http;
mod options;
mod session;
mod tasks;
mod transport;

pub use error::{status_message, EngineError, ErrorCode, RequestError};
pub use events::{
    Emitter, EventKind, ListenerId, SessionEvent, PRIORITY_DEFAULT, PRIORITY_HIGHEST,
};
pub use http::HttpTransport;
pub use options::{
    AlwaysHandler, BeforeSendHook, Continue, DoneHandler, FailHandler, OptionsPatch,
    OptionsRegistry, RequestOptions, DEFAULT_PROFILE,
};
pub use session::{Phase, Session};
pub use tasks::{StepOutcome, TaskRegistry, TaskSpec, TaskStep};
pub use transport::{
    FailureHint, Method, ResponseFormat, Transport, TransportFailure, TransportRequest,
};

pub type Result<T> = std::result::Result<T, EngineError>;
