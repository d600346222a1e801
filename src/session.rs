//! The request session: one logical request's attempts, retries, abort
//! handling, and lifecycle events.

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::error::{EngineError, ErrorCode, RequestError};
use crate::events::{
    Emitter, EventKind, ListenerId, SessionEvent, PRIORITY_DEFAULT, PRIORITY_HIGHEST,
};
use crate::options::{BeforeSendHook, OptionsPatch, OptionsRegistry, RequestOptions};
use crate::tasks::TaskRegistry;
use crate::transport::{Method, Transport, TransportRequest};

/// Session lifecycle phase.
///
/// `FailedRetrying` loops back into `Requesting`; the other non-initial
/// phases are terminal until a new logical request is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No attempt ever made.
    Ready,
    /// An attempt is outstanding.
    Requesting,
    /// The last attempt failed and another one is scheduled or starting.
    FailedRetrying,
    Success,
    Failed,
    Aborted,
}

impl Phase {
    fn is_terminal(self) -> bool {
        matches!(self, Phase::Success | Phase::Failed | Phase::Aborted)
    }
}

struct SessionState {
    /// Session-level options, mutated by `option()`/`data()`.
    base: RequestOptions,
    /// Merged options for the current logical request; what the retry
    /// policy and response pipeline consult.
    active: RequestOptions,
    phase: Phase,
    attempt_count: u32,
    retry_count: u32,
    is_retrying: bool,
    /// Resolved attempt reused verbatim on retries; present exactly while
    /// an attempt is outstanding or about to be retried.
    last_resolved: Option<TransportRequest>,
    response: Option<Value>,
    error: Option<RequestError>,
    response_meaning_failed: bool,
    /// Abort signal for the outstanding call or the pending retry delay.
    abort_tx: Option<watch::Sender<bool>>,
    /// Pre-flight hook, kept across logical requests until replaced.
    before_send: Option<BeforeSendHook>,
    /// Handlers supplied through `option()` that have not yet been
    /// extracted into subscriptions.
    pending_handlers: OptionsPatch,
    /// Bumped per `request()` call; a superseded driver task stops
    /// mutating shared state once its epoch is stale.
    epoch: u64,
}

struct SessionInner<T> {
    transport: T,
    tasks: Arc<TaskRegistry>,
    state: Mutex<SessionState>,
    emitter: Mutex<Emitter>,
}

/// A cheaply-cloneable handle to one logical request's lifecycle.
///
/// Clones share state: one task can drive [`Session::request`] while
/// another observes status queries or calls [`Session::abort`].
pub struct Session<T: Transport> {
    inner: Arc<SessionInner<T>>,
}

impl<T: Transport> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

enum Settlement {
    Aborted,
    Final,
    Retry {
        was_retry: bool,
        retry_count: u32,
        is_last: bool,
        error: RequestError,
        delay: std::time::Duration,
        abort_rx: Option<watch::Receiver<bool>>,
    },
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T) -> Self {
        Self::with_tasks(transport, Arc::new(TaskRegistry::new()))
    }

    /// Session sharing a task registry with other sessions.
    pub fn with_tasks(transport: T, tasks: Arc<TaskRegistry>) -> Self {
        Self::build(transport, tasks, RequestOptions::default())
    }

    /// Session seeded from a named profile of an options registry, with a
    /// caller patch layered on top.
    pub fn from_profile(
        transport: T,
        tasks: Arc<TaskRegistry>,
        registry: &OptionsRegistry,
        profile: &str,
        patch: &OptionsPatch,
    ) -> Result<Self, EngineError> {
        let options = registry.get_with(profile, patch)?;
        let session = Self::build(transport, tasks, options);
        session.stash_handlers(patch);
        Ok(session)
    }

    fn build(transport: T, tasks: Arc<TaskRegistry>, options: RequestOptions) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                transport,
                tasks,
                state: Mutex::new(SessionState {
                    active: options.clone(),
                    base: options,
                    phase: Phase::Ready,
                    attempt_count: 0,
                    retry_count: 0,
                    is_retrying: false,
                    last_resolved: None,
                    response: None,
                    error: None,
                    response_meaning_failed: false,
                    abort_tx: None,
                    before_send: None,
                    pending_handlers: OptionsPatch::default(),
                    epoch: 0,
                }),
                emitter: Mutex::new(Emitter::new()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.inner
            .state
            .lock()
            .expect("session state mutex must not be poisoned")
    }

    // ── configuration ────────────────────────────────────────────────────

    /// Merges a patch into the session-level options. Handler fields take
    /// effect at the next `request()`.
    pub fn option(&self, patch: &OptionsPatch) -> &Self {
        self.state().base.apply(patch);
        self.stash_handlers(patch);
        self
    }

    /// Replaces the outgoing payload.
    pub fn data(&self, data: Value) -> &Self {
        self.state().base.data = Some(data);
        self
    }

    /// Merges one member into the outgoing payload, turning a non-object
    /// payload into an object first.
    pub fn add_data(&self, key: impl Into<String>, value: Value) -> &Self {
        let mut state = self.state();
        match &mut state.base.data {
            Some(Value::Object(map)) => {
                map.insert(key.into(), value);
            }
            other => {
                let mut map = Map::new();
                map.insert(key.into(), value);
                *other = Some(Value::Object(map));
            }
        }
        self
    }

    fn stash_handlers(&self, patch: &OptionsPatch) {
        let mut state = self.state();
        if let Some(handler) = &patch.on_done {
            state.pending_handlers.on_done = Some(Arc::clone(handler));
        }
        if let Some(handler) = &patch.on_fail {
            state.pending_handlers.on_fail = Some(Arc::clone(handler));
        }
        if let Some(handler) = &patch.on_always {
            state.pending_handlers.on_always = Some(Arc::clone(handler));
        }
        if let Some(hook) = &patch.before_send {
            state.pending_handlers.before_send = Some(Arc::clone(hook));
        }
    }

    // ── subscriptions ────────────────────────────────────────────────────

    /// Subscribes to any lifecycle event at default priority.
    pub fn on_event<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner
            .emitter
            .lock()
            .expect("session emitter mutex must not be poisoned")
            .subscribe(kind, Arc::new(handler), PRIORITY_DEFAULT)
    }

    pub fn off(&self, id: ListenerId) {
        self.inner
            .emitter
            .lock()
            .expect("session emitter mutex must not be poisoned")
            .unsubscribe(id);
    }

    /// Success callback. When the session has already succeeded, the
    /// handler is also invoked immediately with the stored response.
    pub fn on_done<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let subscribed = Arc::clone(&handler);
        let id = self.on_event(EventKind::Done, move |event| {
            if let SessionEvent::Done(response) = event {
                subscribed(response);
            }
        });
        let replay = {
            let state = self.state();
            if is_success_locked(&state) {
                state.response.clone()
            } else {
                None
            }
        };
        if let Some(response) = replay {
            handler(&response);
        }
        id
    }

    /// Failure callback. When the session has already failed, the handler
    /// is also invoked immediately with the stored error.
    pub fn on_fail<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&str, &ErrorCode) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let subscribed = Arc::clone(&handler);
        let id = self.on_event(EventKind::Fail, move |event| {
            if let SessionEvent::Fail { message, code } = event {
                subscribed(message, code);
            }
        });
        let replay = {
            let state = self.state();
            if is_failed_locked(&state) {
                state.error.clone()
            } else {
                None
            }
        };
        if let Some(error) = replay {
            handler(&error.message, &error.code);
        }
        id
    }

    /// Settlement callback. When the session has already settled, the
    /// handler is also invoked immediately with the stored outcome.
    pub fn on_always<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(Option<&RequestError>, Option<&Value>) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let subscribed = Arc::clone(&handler);
        let id = self.on_event(EventKind::Always, move |event| {
            if let SessionEvent::Always { error, response } = event {
                subscribed(error.as_ref(), response.as_ref());
            }
        });
        let replay = {
            let state = self.state();
            if is_done_locked(&state) {
                Some((state.error.clone(), state.response.clone()))
            } else {
                None
            }
        };
        if let Some((error, response)) = replay {
            handler(error.as_ref(), response.as_ref());
        }
        id
    }

    // ── status queries ───────────────────────────────────────────────────

    pub fn is_ready(&self) -> bool {
        self.state().phase == Phase::Ready
    }

    pub fn is_requesting(&self) -> bool {
        self.state().phase == Phase::Requesting
    }

    pub fn is_retrying(&self) -> bool {
        self.state().is_retrying
    }

    /// Settled and not between retry attempts.
    pub fn is_done(&self) -> bool {
        is_done_locked(&self.state())
    }

    pub fn is_success(&self) -> bool {
        is_success_locked(&self.state())
    }

    pub fn is_failed(&self) -> bool {
        is_failed_locked(&self.state())
    }

    /// Whether the stored error is a manual abort.
    pub fn is_aborted(&self) -> bool {
        self.state()
            .error
            .as_ref()
            .is_some_and(RequestError::is_aborted)
    }

    /// Whether the stored error came from the response pipeline rather
    /// than the transport.
    pub fn is_response_meaning_failed(&self) -> bool {
        let state = self.state();
        is_failed_locked(&state) && state.response_meaning_failed
    }

    /// True while the retry that exhausts the budget is in flight.
    pub fn is_last_retry_time(&self) -> bool {
        let state = self.state();
        state.is_retrying && state.active.retry > 0 && state.retry_count >= state.active.retry
    }

    /// Whether the current error would be retried.
    pub fn is_retryable(&self) -> bool {
        is_retryable_locked(&self.state())
    }

    /// Last pipeline-transformed response payload.
    pub fn response(&self) -> Option<Value> {
        self.state().response.clone()
    }

    /// Current stored error.
    pub fn error(&self) -> Option<RequestError> {
        self.state().error.clone()
    }

    /// Physical attempts issued so far, across logical requests.
    pub fn attempt_count(&self) -> u32 {
        self.state().attempt_count
    }

    /// Retry (non-initial) attempts issued for the current logical request.
    pub fn retry_count(&self) -> u32 {
        self.state().retry_count
    }

    // ── request driving ──────────────────────────────────────────────────

    /// Drives one logical request (initial attempt plus retries) to
    /// settlement, firing lifecycle events along the way.
    ///
    /// Outcomes are observed through events and status queries; this
    /// method itself never returns an error.
    pub async fn request(&self, patch: OptionsPatch) {
        // Resolve the attempt, or settle immediately when the outgoing
        // pipeline rejects the payload.
        //
        // The state guard must go out of scope unconditionally before the
        // first await; a conditional `drop(state)` leaves the guard in the
        // future's captured state and makes the future non-`Send`.
        enum Prepared {
            Reuse {
                resolved: TransportRequest,
                hook: Option<BeforeSendHook>,
            },
            Fresh {
                merged: RequestOptions,
                handlers: OptionsPatch,
                hook: Option<BeforeSendHook>,
            },
        }

        let (epoch, prepared) = {
            let mut state = self.state();
            state.epoch += 1;
            let epoch = state.epoch;

            if state.is_retrying && state.last_resolved.is_some() {
                // Re-entry while a retry is due: reuse the resolved attempt.
                let resolved = state
                    .last_resolved
                    .clone()
                    .expect("last_resolved present while retrying");
                let hook = state.before_send.clone();
                (epoch, Prepared::Reuse { resolved, hook })
            } else {
                let merged = state.base.merged(&patch);

                if state.phase == Phase::Requesting && merged.auto_abort {
                    if let Some(abort_tx) = &state.abort_tx {
                        let _ = abort_tx.send(true);
                    }
                }

                let mut handlers = std::mem::take(&mut state.pending_handlers);
                overlay_handlers(&mut handlers, &patch);
                if let Some(hook) = &handlers.before_send {
                    state.before_send = Some(Arc::clone(hook));
                }
                let hook = state.before_send.clone();
                (
                    epoch,
                    Prepared::Fresh {
                        merged,
                        handlers,
                        hook,
                    },
                )
            }
        };

        let (merged, handlers, hook) = match prepared {
            Prepared::Reuse { resolved, hook } => {
                self.drive(epoch, resolved, hook).await;
                return;
            }
            Prepared::Fresh {
                merged,
                handlers,
                hook,
            } => (merged, handlers, hook),
        };

        self.extract_handlers(&handlers);

        let data = match self.run_data_tasks(&merged) {
            Ok(data) => data,
            Err(error) => {
                self.settle_before_send(epoch, &merged, error);
                return;
            }
        };

        let resolved = TransportRequest {
            url: merged.url.clone(),
            method: merged.method,
            headers: merged.headers.clone(),
            data,
            timeout: merged.timeout,
            response_format: merged.response_format,
        };

        {
            let mut state = self.state();
            if state.epoch != epoch {
                return;
            }
            state.active = merged;
            state.last_resolved = Some(resolved.clone());
        }

        self.drive(epoch, resolved, hook).await;
    }

    /// Aborts the outstanding attempt or the pending retry delay.
    ///
    /// Settlement still happens inside the driving `request()` future: the
    /// abort path there emits `aborted` and finalizes.
    pub fn abort(&self) {
        let state = self.state();
        if matches!(state.phase, Phase::Requesting | Phase::FailedRetrying) {
            if let Some(abort_tx) = &state.abort_tx {
                let _ = abort_tx.send(true);
            }
        }
    }

    // ── internals ────────────────────────────────────────────────────────

    fn emit(&self, event: SessionEvent) {
        let handlers = {
            self.inner
                .emitter
                .lock()
                .expect("session emitter mutex must not be poisoned")
                .handlers_for(event.kind())
        };
        for handler in handlers {
            handler(&event);
        }
    }

    /// Registers option-derived handlers as keyed highest-priority
    /// listeners, replacing any previously extracted ones.
    fn extract_handlers(&self, handlers: &OptionsPatch) {
        let mut emitter = self
            .inner
            .emitter
            .lock()
            .expect("session emitter mutex must not be poisoned");
        if let Some(on_done) = &handlers.on_done {
            let on_done = Arc::clone(on_done);
            emitter.subscribe_keyed(
                EventKind::Done,
                "options:done",
                Arc::new(move |event| {
                    if let SessionEvent::Done(response) = event {
                        on_done(response);
                    }
                }),
                PRIORITY_HIGHEST,
            );
        }
        if let Some(on_fail) = &handlers.on_fail {
            let on_fail = Arc::clone(on_fail);
            emitter.subscribe_keyed(
                EventKind::Fail,
                "options:fail",
                Arc::new(move |event| {
                    if let SessionEvent::Fail { message, code } = event {
                        on_fail(message, code);
                    }
                }),
                PRIORITY_HIGHEST,
            );
        }
        if let Some(on_always) = &handlers.on_always {
            let on_always = Arc::clone(on_always);
            emitter.subscribe_keyed(
                EventKind::Always,
                "options:always",
                Arc::new(move |event| {
                    if let SessionEvent::Always { error, response } = event {
                        on_always(error.as_ref(), response.as_ref());
                    }
                }),
                PRIORITY_HIGHEST,
            );
        }
    }

    /// Runs the outgoing-data pipeline over a clone of the payload.
    fn run_data_tasks(&self, options: &RequestOptions) -> Result<Option<Value>, RequestError> {
        if options.data_tasks.is_empty() {
            return Ok(options.data.clone());
        }
        let payload = options.data.clone().unwrap_or(Value::Null);
        let transformed = self.inner.tasks.apply(payload, &options.data_tasks)?;
        Ok(Some(transformed))
    }

    /// Settles as failed without any transport activity: the outgoing
    /// pipeline rejected the payload. Never consults the retry policy.
    fn settle_before_send(&self, epoch: u64, merged: &RequestOptions, error: RequestError) {
        {
            let mut state = self.state();
            if state.epoch != epoch {
                return;
            }
            state.active = merged.clone();
            state.error = Some(error.clone());
            state.response = None;
            state.response_meaning_failed = false;
            state.phase = Phase::Failed;
            state.last_resolved = None;
            state.is_retrying = false;
            state.abort_tx = None;
        }
        self.emit(SessionEvent::Fail {
            message: error.message.clone(),
            code: error.code.clone(),
        });
        self.emit(SessionEvent::Always {
            error: Some(error),
            response: None,
        });
    }

    /// The attempt loop: sends, classifies, consults the retry policy,
    /// sleeps between retries, and finalizes.
    async fn drive(
        &self,
        epoch: u64,
        resolved: TransportRequest,
        hook: Option<BeforeSendHook>,
    ) {
        loop {
            // Pre-flight hook; skipped while retrying.
            let retrying_entry = self.state().is_retrying;
            if !retrying_entry {
                if let Some(hook) = &hook {
                    if !hook(&resolved) {
                        self.settle_vetoed(epoch);
                        return;
                    }
                }
            }

            let (mut abort_rx, was_retry) = {
                let mut state = self.state();
                if state.epoch != epoch {
                    return;
                }
                state.attempt_count += 1;
                state.error = None;
                state.response = None;
                state.response_meaning_failed = false;
                state.phase = Phase::Requesting;
                let was_retry = state.is_retrying;
                if was_retry {
                    state.retry_count += 1;
                } else {
                    state.retry_count = 0;
                }
                let (abort_tx, abort_rx) = watch::channel(false);
                state.abort_tx = Some(abort_tx);
                (abort_rx, was_retry)
            };

            #[cfg(feature = "tracing")]
            tracing::debug!(
                url = %resolved.url,
                method = resolved.method.as_str(),
                retry = was_retry,
                "starting attempt"
            );

            self.emit(if was_retry {
                SessionEvent::Retry
            } else {
                SessionEvent::Request
            });

            let outcome = tokio::select! {
                reply = self.inner.transport.send(resolved.clone()) => Some(reply),
                _ = wait_aborted(&mut abort_rx) => None,
            };

            // Record the attempt's outcome and fire done/fail.
            match outcome {
                None => {
                    let mut state = self.state();
                    if state.epoch != epoch {
                        drop(state);
                        // Superseded by auto-abort: still announce this
                        // request's own cancellation to observers.
                        self.emit(SessionEvent::Aborted);
                        self.emit(SessionEvent::Always {
                            error: Some(RequestError::aborted()),
                            response: None,
                        });
                        return;
                    }
                    state.error = Some(RequestError::aborted());
                }
                Some(reply) => {
                    let mut state = self.state();
                    if state.epoch != epoch {
                        return;
                    }
                    match reply {
                        Ok(payload) => {
                            let steps = state.active.response_tasks.clone();
                            drop(state);
                            match self.inner.tasks.apply(payload, &steps) {
                                Ok(data) => {
                                    let mut state = self.state();
                                    if state.epoch != epoch {
                                        return;
                                    }
                                    state.response = Some(data.clone());
                                    drop(state);
                                    self.emit(SessionEvent::Done(data));
                                }
                                Err(error) => {
                                    let mut state = self.state();
                                    if state.epoch != epoch {
                                        return;
                                    }
                                    state.response_meaning_failed = true;
                                    state.error = Some(error.clone());
                                    let retryable = is_retryable_locked(&state);
                                    drop(state);
                                    if !retryable {
                                        self.emit(SessionEvent::Fail {
                                            message: error.message,
                                            code: error.code,
                                        });
                                    }
                                }
                            }
                        }
                        Err(failure) => {
                            let error = RequestError::classify(&failure);
                            state.error = Some(error.clone());
                            let retryable = is_retryable_locked(&state);
                            drop(state);
                            if !retryable && !error.is_aborted() {
                                self.emit(SessionEvent::Fail {
                                    message: error.message,
                                    code: error.code,
                                });
                            }
                        }
                    }
                }
            }

            // Settle the attempt.
            let settlement = {
                let mut state = self.state();
                if state.epoch != epoch {
                    return;
                }
                state.abort_tx = None;
                if state.error.as_ref().is_some_and(RequestError::is_aborted) {
                    state.phase = Phase::Aborted;
                    Settlement::Aborted
                } else if is_retryable_locked(&state) {
                    let was_retry = state.is_retrying;
                    let error = state
                        .error
                        .clone()
                        .expect("retryable implies an error is stored");
                    let retry_count = state.retry_count;
                    let is_last = state.active.retry > 0 && retry_count >= state.active.retry;
                    let delay = state.active.retry_delay;
                    state.is_retrying = true;
                    state.phase = Phase::FailedRetrying;
                    // Install the delay's abort signal under the same lock
                    // so an abort cannot slip between settling and sleeping.
                    let abort_rx = if delay.is_zero() {
                        None
                    } else {
                        let (abort_tx, abort_rx) = watch::channel(false);
                        state.abort_tx = Some(abort_tx);
                        Some(abort_rx)
                    };
                    Settlement::Retry {
                        was_retry,
                        retry_count,
                        is_last,
                        error,
                        delay,
                        abort_rx,
                    }
                } else {
                    state.phase = if state.error.is_some() {
                        Phase::Failed
                    } else {
                        Phase::Success
                    };
                    Settlement::Final
                }
            };

            match settlement {
                Settlement::Aborted => {
                    self.emit(SessionEvent::Aborted);
                    self.finalize(epoch);
                    return;
                }
                Settlement::Final => {
                    self.finalize(epoch);
                    return;
                }
                Settlement::Retry {
                    was_retry,
                    retry_count,
                    is_last,
                    error,
                    delay,
                    abort_rx,
                } => {
                    if was_retry {
                        self.emit(SessionEvent::RetryComplete {
                            retry_count,
                            is_last,
                            error,
                        });
                    }

                    #[cfg(feature = "tracing")]
                    tracing::debug!(delay_ms = delay.as_millis() as u64, "retry scheduled");

                    if let Some(mut abort_rx) = abort_rx {
                        let aborted = tokio::select! {
                            _ = tokio::time::sleep(delay) => false,
                            _ = wait_aborted(&mut abort_rx) => true,
                        };
                        let mut state = self.state();
                        if state.epoch != epoch {
                            return;
                        }
                        state.abort_tx = None;
                        if aborted {
                            // The prior attempt's error stays in place; only
                            // the pending timer is cancelled.
                            state.phase = Phase::Aborted;
                            drop(state);
                            self.emit(SessionEvent::Aborted);
                            self.finalize(epoch);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// The pre-flight hook vetoed the attempt: proceed as aborted before
    /// start, without any transport activity.
    fn settle_vetoed(&self, epoch: u64) {
        {
            let mut state = self.state();
            if state.epoch != epoch {
                return;
            }
            state.error = Some(RequestError::aborted());
            state.response = None;
            state.response_meaning_failed = false;
            state.phase = Phase::Aborted;
            state.abort_tx = None;
        }
        self.emit(SessionEvent::Aborted);
        self.finalize(epoch);
    }

    /// Final settlement of the logical request: clear per-request state
    /// and fire `always` exactly once.
    fn finalize(&self, epoch: u64) {
        let (error, response) = {
            let mut state = self.state();
            if state.epoch != epoch {
                return;
            }
            state.last_resolved = None;
            state.is_retrying = false;
            state.abort_tx = None;
            (state.error.clone(), state.response.clone())
        };
        self.emit(SessionEvent::Always { error, response });
    }

    // ── REST-verb shorthands ─────────────────────────────────────────────

    pub async fn get(&self, url: impl Into<String>, data: Option<Value>) {
        self.request_with_method(Method::Get, url.into(), data).await;
    }

    pub async fn post(&self, url: impl Into<String>, data: Option<Value>) {
        self.request_with_method(Method::Post, url.into(), data).await;
    }

    pub async fn put(&self, url: impl Into<String>, data: Option<Value>) {
        self.request_with_method(Method::Put, url.into(), data).await;
    }

    pub async fn delete(&self, url: impl Into<String>, data: Option<Value>) {
        self.request_with_method(Method::Delete, url.into(), data).await;
    }

    /// GET expecting a JSON response.
    pub async fn get_json(&self, url: impl Into<String>, data: Option<Value>) {
        let mut patch = OptionsPatch::new()
            .method(Method::Get)
            .url(url.into())
            .response_format(crate::transport::ResponseFormat::Json);
        patch.data = data;
        self.request(patch).await;
    }

    /// POST expecting a JSON response.
    pub async fn post_json(&self, url: impl Into<String>, data: Option<Value>) {
        let mut patch = OptionsPatch::new()
            .method(Method::Post)
            .url(url.into())
            .response_format(crate::transport::ResponseFormat::Json);
        patch.data = data;
        self.request(patch).await;
    }

    /// GET with the session's current options.
    pub async fn query(&self, data: Option<Value>) {
        let mut patch = OptionsPatch::new().method(Method::Get);
        patch.data = data;
        self.request(patch).await;
    }

    /// POST with the session's current options.
    pub async fn send_data(&self, data: Option<Value>) {
        let mut patch = OptionsPatch::new().method(Method::Post);
        patch.data = data;
        self.request(patch).await;
    }

    async fn request_with_method(&self, method: Method, url: String, data: Option<Value>) {
        let mut patch = OptionsPatch::new().method(method).url(url);
        patch.data = data;
        self.request(patch).await;
    }
}

fn overlay_handlers(handlers: &mut OptionsPatch, patch: &OptionsPatch) {
    if let Some(handler) = &patch.on_done {
        handlers.on_done = Some(Arc::clone(handler));
    }
    if let Some(handler) = &patch.on_fail {
        handlers.on_fail = Some(Arc::clone(handler));
    }
    if let Some(handler) = &patch.on_always {
        handlers.on_always = Some(Arc::clone(handler));
    }
    if let Some(hook) = &patch.before_send {
        handlers.before_send = Some(Arc::clone(hook));
    }
}

fn is_done_locked(state: &SessionState) -> bool {
    !state.is_retrying && state.phase.is_terminal()
}

fn is_success_locked(state: &SessionState) -> bool {
    is_done_locked(state) && state.error.is_none()
}

fn is_failed_locked(state: &SessionState) -> bool {
    is_done_locked(state) && state.error.is_some()
}

/// Retry policy: an error is present, it is neither an abort nor a
/// response-meaning failure, the retry budget allows another attempt, and
/// the continuation predicate agrees.
fn is_retryable_locked(state: &SessionState) -> bool {
    let Some(error) = &state.error else {
        return false;
    };
    if error.is_aborted() || state.response_meaning_failed {
        return false;
    }
    if state.active.retry == 0 || state.retry_count >= state.active.retry {
        return false;
    }
    state.active.is_continue.allows(error)
}

/// Resolves when the abort flag is raised; pends forever when the sender
/// side goes away without raising it.
async fn wait_aborted(abort_rx: &mut watch::Receiver<bool>) {
    loop {
        if *abort_rx.borrow() {
            return;
        }
        if abort_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
