//! Request options, the overlay patch used for overrides, and the named
//! default-options registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::error::{EngineError, ErrorCode, RequestError};
use crate::tasks::TaskSpec;
use crate::transport::{Method, ResponseFormat, TransportRequest};

/// Continuation predicate consulted by the retry policy once the
/// structural preconditions hold.
#[derive(Clone, Default)]
pub enum Continue {
    /// Retry up to the limit on any retryable error.
    #[default]
    Always,
    Never,
    /// Decide from the current error.
    When(Arc<dyn Fn(&RequestError) -> bool + Send + Sync>),
}

impl Continue {
    /// Wraps a predicate closure.
    pub fn when<F>(predicate: F) -> Self
    where
        F: Fn(&RequestError) -> bool + Send + Sync + 'static,
    {
        Continue::When(Arc::new(predicate))
    }

    pub fn allows(&self, error: &RequestError) -> bool {
        match self {
            Continue::Always => true,
            Continue::Never => false,
            Continue::When(predicate) => predicate(error),
        }
    }
}

impl From<bool> for Continue {
    fn from(allowed: bool) -> Self {
        if allowed {
            Continue::Always
        } else {
            Continue::Never
        }
    }
}

impl fmt::Debug for Continue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Continue::Always => f.write_str("Always"),
            Continue::Never => f.write_str("Never"),
            Continue::When(_) => f.write_str("When(<predicate>)"),
        }
    }
}

/// Merged configuration for a session; immutable once an attempt starts.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub url: String,
    pub method: Method,
    pub data: Option<Value>,
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub response_format: ResponseFormat,
    /// Ordered response pipeline step names.
    pub response_tasks: Vec<TaskSpec>,
    /// Ordered outgoing-data pipeline steps with per-step configuration.
    pub data_tasks: Vec<TaskSpec>,
    /// Abort a previous outstanding attempt before starting a new one.
    pub auto_abort: bool,
    /// Retry limit; zero disables retries.
    pub retry: u32,
    /// Delay before each retry attempt; zero re-attempts immediately.
    pub retry_delay: Duration,
    pub is_continue: Continue,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: Method::Get,
            data: None,
            headers: Vec::new(),
            timeout: None,
            response_format: ResponseFormat::Auto,
            response_tasks: Vec::new(),
            data_tasks: Vec::new(),
            auto_abort: true,
            retry: 0,
            retry_delay: Duration::ZERO,
            is_continue: Continue::Always,
        }
    }
}

impl RequestOptions {
    /// Applies an overlay patch field-wise; unset patch fields keep the
    /// current values. Handler fields are not stored here, the session
    /// extracts them into subscriptions at resolve time.
    pub fn apply(&mut self, patch: &OptionsPatch) {
        if let Some(url) = &patch.url {
            self.url = url.clone();
        }
        if let Some(method) = patch.method {
            self.method = method;
        }
        if let Some(data) = &patch.data {
            self.data = Some(data.clone());
        }
        if let Some(headers) = &patch.headers {
            self.headers = headers.clone();
        }
        if let Some(timeout) = patch.timeout {
            self.timeout = Some(timeout);
        }
        if let Some(format) = patch.response_format {
            self.response_format = format;
        }
        if let Some(tasks) = &patch.response_tasks {
            self.response_tasks = tasks.clone();
        }
        if let Some(tasks) = &patch.data_tasks {
            self.data_tasks = tasks.clone();
        }
        if let Some(auto_abort) = patch.auto_abort {
            self.auto_abort = auto_abort;
        }
        if let Some(retry) = patch.retry {
            self.retry = retry;
        }
        if let Some(delay) = patch.retry_delay {
            self.retry_delay = delay;
        }
        if let Some(is_continue) = &patch.is_continue {
            self.is_continue = is_continue.clone();
        }
    }

    pub fn merged(&self, patch: &OptionsPatch) -> Self {
        let mut merged = self.clone();
        merged.apply(patch);
        merged
    }
}

pub type DoneHandler = Arc<dyn Fn(&Value) + Send + Sync>;
pub type FailHandler = Arc<dyn Fn(&str, &ErrorCode) + Send + Sync>;
pub type AlwaysHandler = Arc<dyn Fn(Option<&RequestError>, Option<&Value>) + Send + Sync>;
/// Pre-flight hook; returning `false` vetoes the attempt.
pub type BeforeSendHook = Arc<dyn Fn(&TransportRequest) -> bool + Send + Sync>;

/// All-optional overlay over [`RequestOptions`], plus the per-request
/// event handlers and pre-flight hook that are extracted into
/// subscriptions rather than merged into the option set.
#[derive(Clone, Default)]
pub struct OptionsPatch {
    pub url: Option<String>,
    pub method: Option<Method>,
    pub data: Option<Value>,
    pub headers: Option<Vec<(String, String)>>,
    pub timeout: Option<Duration>,
    pub response_format: Option<ResponseFormat>,
    pub response_tasks: Option<Vec<TaskSpec>>,
    pub data_tasks: Option<Vec<TaskSpec>>,
    pub auto_abort: Option<bool>,
    pub retry: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub is_continue: Option<Continue>,
    pub on_done: Option<DoneHandler>,
    pub on_fail: Option<FailHandler>,
    pub on_always: Option<AlwaysHandler>,
    pub before_send: Option<BeforeSendHook>,
}

impl OptionsPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(Vec::new)
            .push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }

    pub fn response_tasks(mut self, tasks: Vec<TaskSpec>) -> Self {
        self.response_tasks = Some(tasks);
        self
    }

    pub fn data_tasks(mut self, tasks: Vec<TaskSpec>) -> Self {
        self.data_tasks = Some(tasks);
        self
    }

    pub fn auto_abort(mut self, auto_abort: bool) -> Self {
        self.auto_abort = Some(auto_abort);
        self
    }

    pub fn retry(mut self, limit: u32) -> Self {
        self.retry = Some(limit);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn is_continue(mut self, is_continue: impl Into<Continue>) -> Self {
        self.is_continue = Some(is_continue.into());
        self
    }

    pub fn on_done<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.on_done = Some(Arc::new(handler));
        self
    }

    pub fn on_fail<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &ErrorCode) + Send + Sync + 'static,
    {
        self.on_fail = Some(Arc::new(handler));
        self
    }

    pub fn on_always<F>(mut self, handler: F) -> Self
    where
        F: Fn(Option<&RequestError>, Option<&Value>) + Send + Sync + 'static,
    {
        self.on_always = Some(Arc::new(handler));
        self
    }

    pub fn before_send<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TransportRequest) -> bool + Send + Sync + 'static,
    {
        self.before_send = Some(Arc::new(hook));
        self
    }
}

/// Name of the profile every registry carries from construction.
pub const DEFAULT_PROFILE: &str = "default";

/// Named default-option profiles, registered once at startup and read at
/// session-construction time. Sessions never write back to the registry.
pub struct OptionsRegistry {
    profiles: Mutex<HashMap<String, RequestOptions>>,
}

impl Default for OptionsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OptionsRegistry {
    pub fn new() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert(DEFAULT_PROFILE.to_owned(), RequestOptions::default());
        Self {
            profiles: Mutex::new(profiles),
        }
    }

    /// Registers (or replaces) a named profile.
    pub fn define(&self, name: impl Into<String>, options: RequestOptions) {
        self.profiles
            .lock()
            .expect("options registry mutex must not be poisoned")
            .insert(name.into(), options);
    }

    /// Patches an existing profile in place.
    pub fn update(&self, name: &str, patch: &OptionsPatch) -> Result<(), EngineError> {
        let mut profiles = self
            .profiles
            .lock()
            .expect("options registry mutex must not be poisoned");
        let options = profiles
            .get_mut(name)
            .ok_or_else(|| EngineError::UnknownProfile(name.to_owned()))?;
        options.apply(patch);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<RequestOptions, EngineError> {
        self.profiles
            .lock()
            .expect("options registry mutex must not be poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownProfile(name.to_owned()))
    }

    /// Profile options with a caller patch layered on top.
    pub fn get_with(&self, name: &str, patch: &OptionsPatch) -> Result<RequestOptions, EngineError> {
        Ok(self.get(name)?.merged(patch))
    }
}
