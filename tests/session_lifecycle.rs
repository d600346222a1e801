use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use reqflow::{
    Continue, ErrorCode, EventKind, FailureHint, OptionsPatch, RequestError, Session,
    SessionEvent, StepOutcome, TaskRegistry, TaskSpec, Transport, TransportFailure,
    TransportRequest,
};

/// One scripted transport reply.
#[derive(Clone)]
enum Reply {
    Success(Value),
    Failure(FailureHint, Option<u16>, &'static str),
    SuccessAfter(Duration, Value),
    /// Never resolves; the attempt can only end by abort.
    Hang,
}

#[derive(Clone, Default)]
struct ScriptedTransport {
    replies: Arc<Mutex<VecDeque<Reply>>>,
    hits: Arc<AtomicUsize>,
    sent: Arc<Mutex<Vec<TransportRequest>>>,
}

impl ScriptedTransport {
    fn scripted(replies: Vec<Reply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            ..Self::default()
        }
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Transport for ScriptedTransport {
    async fn send(&self, request: TransportRequest) -> Result<Value, TransportFailure> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        self.sent
            .lock()
            .expect("sent-request mutex must not be poisoned")
            .push(request);
        let reply = {
            self.replies
                .lock()
                .expect("reply queue mutex must not be poisoned")
                .pop_front()
                .unwrap_or(Reply::Failure(
                    FailureHint::Http,
                    Some(500),
                    "no scripted reply available",
                ))
        };
        match reply {
            Reply::Success(payload) => Ok(payload),
            Reply::Failure(hint, status, detail) => Err(TransportFailure::new(hint, status, detail)),
            Reply::SuccessAfter(delay, payload) => {
                tokio::time::sleep(delay).await;
                Ok(payload)
            }
            Reply::Hang => std::future::pending().await,
        }
    }
}

fn failing(status: u16) -> Reply {
    Reply::Failure(FailureHint::Http, Some(status), "scripted failure")
}

/// Subscribes to every lifecycle event and records compact tags in firing
/// order.
fn record_events(session: &Session<ScriptedTransport>) -> Arc<Mutex<Vec<String>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    for kind in [
        EventKind::Request,
        EventKind::Retry,
        EventKind::RetryComplete,
        EventKind::Done,
        EventKind::Fail,
        EventKind::Aborted,
        EventKind::Always,
    ] {
        let log = Arc::clone(&log);
        session.on_event(kind, move |event| {
            let tag = match event {
                SessionEvent::Request => "request".to_owned(),
                SessionEvent::Retry => "retry".to_owned(),
                SessionEvent::RetryComplete {
                    retry_count,
                    is_last,
                    ..
                } => format!("retry_complete:{retry_count}:{is_last}"),
                SessionEvent::Done(_) => "done".to_owned(),
                SessionEvent::Fail { code, .. } => format!("fail:{code}"),
                SessionEvent::Aborted => "aborted".to_owned(),
                SessionEvent::Always { .. } => "always".to_owned(),
            };
            log.lock().expect("event log mutex must not be poisoned").push(tag);
        });
    }
    log
}

fn taken(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    log.lock().expect("event log mutex must not be poisoned").clone()
}

#[tokio::test]
async fn success_settles_with_response_only() {
    let transport = ScriptedTransport::scripted(vec![Reply::Success(json!({"id": 1}))]);
    let session = Session::new(transport.clone());
    let events = record_events(&session);

    session
        .request(OptionsPatch::new().url("https://api.test/items"))
        .await;

    assert!(session.is_done());
    assert!(session.is_success());
    assert!(!session.is_failed());
    assert_eq!(session.response(), Some(json!({"id": 1})));
    assert_eq!(session.error(), None);
    assert_eq!(transport.hits(), 1);
    assert_eq!(taken(&events), vec!["request", "done", "always"]);
}

#[tokio::test]
async fn failure_settles_with_error_only() {
    let transport = ScriptedTransport::scripted(vec![failing(500)]);
    let session = Session::new(transport.clone());
    let events = record_events(&session);

    session
        .request(OptionsPatch::new().url("https://api.test/items"))
        .await;

    assert!(session.is_failed());
    assert!(!session.is_success());
    assert_eq!(session.response(), None);
    let error = session.error().expect("error stored");
    assert_eq!(error.code, ErrorCode::Status(500));
    assert_eq!(taken(&events), vec!["request", "fail:500", "always"]);
}

#[tokio::test]
async fn retry_limit_yields_n_plus_one_attempts() {
    let transport = ScriptedTransport::scripted(vec![
        failing(500),
        failing(502),
        failing(503),
        failing(500),
    ]);
    let session = Session::new(transport.clone());
    let events = record_events(&session);

    session
        .request(OptionsPatch::new().url("https://api.test/items").retry(3))
        .await;

    assert_eq!(transport.hits(), 4);
    assert!(session.is_failed());
    assert_eq!(session.retry_count(), 3);
    assert_eq!(
        taken(&events),
        vec![
            "request",
            "retry",
            "retry_complete:1:false",
            "retry",
            "retry_complete:2:false",
            "retry",
            "fail:500",
            "always",
        ]
    );
}

#[tokio::test]
async fn abort_during_outstanding_attempt_never_retries() {
    let transport = ScriptedTransport::scripted(vec![Reply::Hang]);
    let session = Session::new(transport.clone());
    let events = record_events(&session);

    let driver = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .request(OptionsPatch::new().url("https://api.test/items").retry(5))
                .await;
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.is_requesting());
    session.abort();
    driver.await.expect("driver task completes");

    assert!(session.is_aborted());
    assert!(session.is_done());
    assert_eq!(session.retry_count(), 0);
    assert_eq!(transport.hits(), 1);
    assert_eq!(
        session.error().map(|error| error.code),
        Some(ErrorCode::Aborted)
    );
    assert_eq!(session.response(), None);
    assert_eq!(taken(&events), vec!["request", "aborted", "always"]);
}

#[tokio::test]
async fn retry_delay_paces_the_next_attempt() {
    let transport =
        ScriptedTransport::scripted(vec![failing(500), Reply::Success(json!({"ok": true}))]);
    let session = Session::new(transport.clone());

    let started = Instant::now();
    session
        .request(
            OptionsPatch::new()
                .url("https://api.test/items")
                .retry(1)
                .retry_delay(Duration::from_millis(150)),
        )
        .await;

    assert!(session.is_success());
    assert_eq!(transport.hits(), 2);
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn abort_while_retry_is_pending_prevents_the_next_attempt() {
    let transport = ScriptedTransport::scripted(vec![failing(500)]);
    let session = Session::new(transport.clone());
    let events = record_events(&session);

    let driver = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .request(
                    OptionsPatch::new()
                        .url("https://api.test/items")
                        .retry(2)
                        .retry_delay(Duration::from_secs(5)),
                )
                .await;
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(session.is_retrying());
    session.abort();
    driver.await.expect("driver task completes");

    // Only the timer was cancelled: the prior attempt's error stays.
    assert_eq!(transport.hits(), 1);
    assert!(!session.is_retrying());
    assert!(session.is_done());
    assert_eq!(
        session.error().map(|error| error.code),
        Some(ErrorCode::Status(500))
    );
    assert_eq!(taken(&events), vec!["request", "aborted", "always"]);
}

#[tokio::test]
async fn response_pipeline_failure_short_circuits_and_never_retries() {
    let invoked_b = Arc::new(AtomicUsize::new(0));
    let mut tasks = TaskRegistry::new();
    tasks.register_fn("a", |_payload, _config| {
        StepOutcome::Fail(RequestError::new(
            ErrorCode::Named("schema".to_owned()),
            "payload rejected by schema",
        ))
    });
    let counter = Arc::clone(&invoked_b);
    tasks.register_fn("b", move |_payload, _config| {
        counter.fetch_add(1, Ordering::SeqCst);
        StepOutcome::Unchanged
    });

    let transport = ScriptedTransport::scripted(vec![Reply::Success(json!({"id": 1}))]);
    let session = Session::with_tasks(transport.clone(), Arc::new(tasks));
    let events = record_events(&session);

    session
        .request(
            OptionsPatch::new()
                .url("https://api.test/items")
                .retry(3)
                .response_tasks(vec![TaskSpec::new("a"), TaskSpec::new("b")]),
        )
        .await;

    assert_eq!(invoked_b.load(Ordering::SeqCst), 0);
    assert_eq!(transport.hits(), 1);
    assert!(session.is_failed());
    assert!(session.is_response_meaning_failed());
    let error = session.error().expect("error stored");
    assert_eq!(error.code, ErrorCode::Named("schema".to_owned()));
    assert_eq!(error.message, "payload rejected by schema");
    assert_eq!(taken(&events), vec!["request", "fail:schema", "always"]);
}

#[tokio::test]
async fn late_done_subscription_replays_terminal_payload() {
    let transport = ScriptedTransport::scripted(vec![Reply::Success(json!({"id": 1}))]);
    let session = Session::new(transport.clone());

    session
        .request(OptionsPatch::new().url("https://api.test/items"))
        .await;
    assert!(session.is_success());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    session.on_done(move |response| {
        sink.lock().expect("seen mutex must not be poisoned").push(response.clone());
    });

    assert_eq!(
        *seen.lock().expect("seen mutex must not be poisoned"),
        vec![json!({"id": 1})]
    );
    assert_eq!(transport.hits(), 1, "replay must not start a new attempt");
}

#[tokio::test]
async fn late_fail_and_always_subscriptions_replay_terminal_error() {
    let transport = ScriptedTransport::scripted(vec![failing(404)]);
    let session = Session::new(transport.clone());
    session
        .request(OptionsPatch::new().url("https://api.test/missing"))
        .await;
    assert!(session.is_failed());

    let fail_seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&fail_seen);
    session.on_fail(move |message, code| {
        sink.lock()
            .expect("fail log mutex must not be poisoned")
            .push(format!("{code}:{message}"));
    });
    assert_eq!(
        *fail_seen.lock().expect("fail log mutex must not be poisoned"),
        vec!["404:The server has not found anything matching the URI given".to_owned()]
    );

    let settled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&settled);
    session.on_always(move |error, response| {
        assert!(error.is_some());
        assert!(response.is_none());
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(settled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn continuation_predicate_gates_retries_by_status() {
    let predicate = || {
        Continue::when(|error| !matches!(error.code, ErrorCode::Status(404)))
    };

    // 404 is declared final: no retries even with budget left.
    let transport = ScriptedTransport::scripted(vec![failing(404)]);
    let session = Session::new(transport.clone());
    session
        .request(
            OptionsPatch::new()
                .url("https://api.test/items")
                .retry(3)
                .is_continue(predicate()),
        )
        .await;
    assert_eq!(transport.hits(), 1);
    assert!(session.is_failed());

    // 500 keeps retrying up to the limit.
    let transport = ScriptedTransport::scripted(vec![
        failing(500),
        failing(500),
        failing(500),
        failing(500),
    ]);
    let session = Session::new(transport.clone());
    session
        .request(
            OptionsPatch::new()
                .url("https://api.test/items")
                .retry(3)
                .is_continue(predicate()),
        )
        .await;
    assert_eq!(transport.hits(), 4);
    assert_eq!(session.retry_count(), 3);
}

#[tokio::test]
async fn data_task_failure_settles_without_transport_activity() {
    // Pre-send pipeline failures are treated as non-retryable, matching
    // the response-pipeline rule.
    let mut tasks = TaskRegistry::new();
    tasks.register_fn("sign", |_payload, _config| {
        StepOutcome::Fail(RequestError::new(
            ErrorCode::Named("unsigned".to_owned()),
            "payload could not be signed",
        ))
    });

    let transport = ScriptedTransport::scripted(vec![Reply::Success(json!({}))]);
    let session = Session::with_tasks(transport.clone(), Arc::new(tasks));
    let events = record_events(&session);

    session
        .request(
            OptionsPatch::new()
                .url("https://api.test/items")
                .retry(5)
                .data(json!({"id": 9}))
                .data_tasks(vec![TaskSpec::new("sign")]),
        )
        .await;

    assert_eq!(transport.hits(), 0, "the attempt must never reach the transport");
    assert!(session.is_failed());
    assert!(!session.is_response_meaning_failed());
    assert_eq!(
        session.error().map(|error| error.code),
        Some(ErrorCode::Named("unsigned".to_owned()))
    );
    assert_eq!(taken(&events), vec!["fail:unsigned", "always"]);
}

#[tokio::test]
async fn data_tasks_transform_outgoing_payload_once() {
    let mut tasks = TaskRegistry::new();
    tasks.register_fn("stamp", |payload, config| {
        let mut payload = payload.clone();
        if let Value::Object(map) = &mut payload {
            map.insert("stamp".to_owned(), config.clone());
        }
        StepOutcome::Replace(payload)
    });

    let transport = ScriptedTransport::scripted(vec![
        failing(500),
        Reply::Success(json!({"ok": true})),
    ]);
    let session = Session::with_tasks(transport.clone(), Arc::new(tasks));

    session
        .request(
            OptionsPatch::new()
                .url("https://api.test/items")
                .method(reqflow::Method::Post)
                .retry(1)
                .data(json!({"id": 9}))
                .data_tasks(vec![TaskSpec::with_config("stamp", json!("v1"))]),
        )
        .await;

    assert!(session.is_success());
    let sent = transport.sent.lock().expect("sent-request mutex must not be poisoned");
    assert_eq!(sent.len(), 2);
    // Retries reuse the resolved attempt verbatim.
    for request in sent.iter() {
        assert_eq!(request.data, Some(json!({"id": 9, "stamp": "v1"})));
    }
}

#[tokio::test]
async fn before_send_veto_settles_as_aborted_before_start() {
    let transport = ScriptedTransport::scripted(vec![Reply::Success(json!({}))]);
    let session = Session::new(transport.clone());
    let events = record_events(&session);

    session
        .request(
            OptionsPatch::new()
                .url("https://api.test/items")
                .before_send(|_request| false),
        )
        .await;

    assert_eq!(transport.hits(), 0);
    assert!(session.is_aborted());
    assert!(session.is_done());
    assert_eq!(taken(&events), vec!["aborted", "always"]);
}

#[tokio::test]
async fn before_send_runs_once_per_logical_request_not_on_retries() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let transport =
        ScriptedTransport::scripted(vec![failing(500), failing(500), failing(500)]);
    let session = Session::new(transport.clone());

    session
        .request(
            OptionsPatch::new()
                .url("https://api.test/items")
                .retry(2)
                .before_send(move |_request| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    true
                }),
        )
        .await;

    assert_eq!(transport.hits(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn option_handlers_fire_before_plain_listeners() {
    let order = Arc::new(Mutex::new(Vec::new()));

    let transport = ScriptedTransport::scripted(vec![Reply::Success(json!(1))]);
    let session = Session::new(transport);

    let plain = Arc::clone(&order);
    session.on_done(move |_response| {
        plain.lock().expect("order mutex must not be poisoned").push("plain")
    });

    let from_options = Arc::clone(&order);
    session
        .request(
            OptionsPatch::new()
                .url("https://api.test/items")
                .on_done(move |_response| {
                    from_options
                        .lock()
                        .expect("order mutex must not be poisoned")
                        .push("options")
                }),
        )
        .await;

    assert_eq!(
        *order.lock().expect("order mutex must not be poisoned"),
        vec!["options", "plain"]
    );
}

#[tokio::test]
async fn new_logical_request_resets_retry_state() {
    let transport = ScriptedTransport::scripted(vec![
        failing(500),
        failing(500),
        Reply::Success(json!({"second": true})),
    ]);
    let session = Session::new(transport.clone());

    session
        .request(OptionsPatch::new().url("https://api.test/items").retry(1))
        .await;
    assert!(session.is_failed());
    assert_eq!(session.retry_count(), 1);
    assert_eq!(session.attempt_count(), 2);

    session.request(OptionsPatch::new()).await;
    assert!(session.is_success());
    assert_eq!(session.retry_count(), 0);
    assert_eq!(session.attempt_count(), 3);
    assert_eq!(session.response(), Some(json!({"second": true})));
    assert_eq!(session.error(), None);
}

#[tokio::test]
async fn auto_abort_supersedes_an_outstanding_attempt() {
    let transport = ScriptedTransport::scripted(vec![
        Reply::Hang,
        Reply::Success(json!({"fresh": true})),
    ]);
    let session = Session::new(transport.clone());
    let events = record_events(&session);

    let first = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .request(OptionsPatch::new().url("https://api.test/items"))
                .await;
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.is_requesting());

    session
        .request(OptionsPatch::new().url("https://api.test/items"))
        .await;
    first.await.expect("superseded driver completes");

    assert!(session.is_success());
    assert_eq!(session.response(), Some(json!({"fresh": true})));
    let log = taken(&events);
    assert!(log.contains(&"aborted".to_owned()), "superseded request reports abort");
    assert!(log.contains(&"done".to_owned()));
    assert_eq!(transport.hits(), 2);
}

#[tokio::test]
async fn is_last_retry_time_is_observable_during_the_final_retry() {
    let transport = ScriptedTransport::scripted(vec![
        failing(500),
        Reply::SuccessAfter(Duration::from_millis(80), json!({"ok": true})),
    ]);
    let session = Session::new(transport.clone());

    let driver = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .request(OptionsPatch::new().url("https://api.test/items").retry(1))
                .await;
        })
    };

    tokio::time::sleep(Duration::from_millis(40)).await;
    // The retry that exhausts the budget is in flight.
    assert!(session.is_last_retry_time());
    driver.await.expect("driver task completes");

    assert!(session.is_success());
    assert!(!session.is_last_retry_time());
}
