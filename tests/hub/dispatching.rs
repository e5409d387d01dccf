//! Queue-driven execution: outcomes, retry budget and idempotent redelivery.

use dispatch_hub::{
    Condition, DispatchMessage, DispatchOutcome, DispatchWorker, Dispatcher, DrainResult,
    EventSink, HandlerOutcome, HandlerRegistry, InMemoryQueue, InMemoryRepository, Processed,
    Publisher, QueueMessage, ReadStore, ResultStatus, RetryPolicy, Route, RoutingConfig,
};
use serde_json::{json, Value};

use crate::support::{init_tracing, FaultyRepository, Hub, Scripted};

fn single_route(
    destination: &str,
    max_retries: u32,
    policy: Option<RetryPolicy>,
) -> RoutingConfig {
    let mut route = Route::new(Condition::exists("$.order"), destination)
        .with_max_retries(max_retries);
    route.retry_delay = policy;
    RoutingConfig::new(vec![route])
}

#[test]
fn delivered_event_completes() {
    let email = Scripted::always(HandlerOutcome::Complete);
    let hub = Hub::new(
        single_route("email", 0, None),
        HandlerRegistry::new().register("email", email.handler()),
    );

    let created = hub.sink.put_event(vec![json!({ "order": 42 })]).unwrap();
    let id = created[0].dispatches[0].id();

    let drained = hub.worker.drain(10).unwrap();
    assert_eq!(
        drained,
        DrainResult {
            acked: 1,
            retried: 0,
            undecodable: 0,
        }
    );
    assert_eq!(email.payloads(), vec![json!({ "order": 42 })]);

    let stored = hub.repo.get_dispatch(id).unwrap().unwrap();
    assert_eq!(stored.status().result(), Some(ResultStatus::Complete));
    assert_eq!(hub.queue.pending(), 0);
}

#[test]
fn duplicate_delivery_of_a_resolved_dispatch_is_a_no_op() {
    let email = Scripted::always(HandlerOutcome::Ignored);
    let hub = Hub::new(
        single_route("email", 3, None),
        HandlerRegistry::new().register("email", email.handler()),
    );

    let created = hub.sink.put_event(vec![json!({ "order": 1 })]).unwrap();
    let dispatch = created[0].dispatches[0].clone();

    // The queue hands the same dispatch out twice.
    hub.queue
        .publish_batch(vec![
            QueueMessage::encode(&DispatchMessage::for_dispatch(&dispatch), None).unwrap(),
        ])
        .unwrap();

    assert_eq!(
        hub.worker.process_one().unwrap(),
        Some(Processed::Acked(DispatchOutcome::Ignored))
    );
    let resolved = hub.repo.get_dispatch(dispatch.id()).unwrap().unwrap();

    assert_eq!(
        hub.worker.process_one().unwrap(),
        Some(Processed::Acked(DispatchOutcome::NotFound))
    );
    assert_eq!(email.calls(), 1);
    assert_eq!(
        hub.repo.get_dispatch(dispatch.id()).unwrap().unwrap(),
        resolved
    );
    assert_eq!(hub.queue.pending(), 0);
}

#[test]
fn failures_are_redelivered_until_the_budget_runs_out() {
    let flaky = Scripted::failing();
    let hub = Hub::new(
        single_route("flaky", 2, Some(RetryPolicy::Constant { interval: 30 })),
        HandlerRegistry::new().register("flaky", flaky.handler()),
    );

    let created = hub.sink.put_event(vec![json!({ "order": 9 })]).unwrap();
    let id = created[0].dispatches[0].id();

    for attempt in 1..=3 {
        let processed = hub.worker.process_one().unwrap();
        assert_eq!(
            processed,
            Some(Processed::Retried {
                delay_seconds: Some(30)
            }),
            "attempt {attempt}"
        );

        let stored = hub.repo.get_dispatch(id).unwrap().unwrap();
        assert_eq!(stored.execution_log().len(), attempt);
        if attempt <= 2 {
            assert!(stored.is_ongoing(), "attempt {attempt} is within budget");
        } else {
            assert_eq!(stored.status().result(), Some(ResultStatus::Failed));
        }

        assert_eq!(
            hub.worker.process_one().unwrap(),
            None,
            "hidden until backoff elapses"
        );
        hub.clock.advance_secs(30);
    }

    // The message left over from the final failure is now stale.
    assert_eq!(
        hub.worker.process_one().unwrap(),
        Some(Processed::Acked(DispatchOutcome::NotFound))
    );
    assert_eq!(flaky.calls(), 3);
}

#[test]
fn failure_then_success_completes_within_budget() {
    let handler = Scripted::new(vec![
        Err("timeout".to_string()),
        Ok(HandlerOutcome::Failed),
        Ok(HandlerOutcome::Complete),
    ]);
    let hub = Hub::new(
        single_route("api", 5, None),
        HandlerRegistry::new().register("api", handler.handler()),
    );

    let created = hub.sink.put_event(vec![json!({ "order": 3 })]).unwrap();
    let id = created[0].dispatches[0].id();

    // No policy: the queue's default delay applies.
    for _ in 0..2 {
        assert_eq!(
            hub.worker.process_one().unwrap(),
            Some(Processed::Retried {
                delay_seconds: None
            })
        );
        hub.clock.advance_secs(3600);
    }
    assert_eq!(
        hub.worker.process_one().unwrap(),
        Some(Processed::Acked(DispatchOutcome::Complete))
    );

    let stored = hub.repo.get_dispatch(id).unwrap().unwrap();
    let results: Vec<_> = stored.execution_log().iter().map(|e| e.result).collect();
    assert_eq!(results.len(), 3);
    assert_eq!(stored.status().result(), Some(ResultStatus::Complete));
}

#[test]
fn exponential_backoff_stays_within_bounds() {
    let hub = Hub::new(
        single_route("flaky", 10, Some(RetryPolicy::Exponential { base: 2, max: 20 })),
        HandlerRegistry::new().register("flaky", Scripted::failing().handler()),
    );
    hub.sink.put_event(vec![json!({ "order": 5 })]).unwrap();

    for _ in 0..6 {
        match hub.worker.process_one().unwrap() {
            Some(Processed::Retried {
                delay_seconds: Some(delay),
            }) => assert!((2..=20).contains(&delay), "delay {delay} out of bounds"),
            other => panic!("unexpected {other:?}"),
        }
        hub.clock.advance_secs(20);
    }
}

#[test]
fn unknown_destination_is_misconfigured_and_acked() {
    let hub = Hub::new(single_route("ghost", 3, None), HandlerRegistry::new());
    let created = hub.sink.put_event(vec![json!({ "order": 1 })]).unwrap();

    assert_eq!(
        hub.worker.process_one().unwrap(),
        Some(Processed::Acked(DispatchOutcome::Misconfigured))
    );
    let stored = hub
        .repo
        .get_dispatch(created[0].dispatches[0].id())
        .unwrap()
        .unwrap();
    assert_eq!(stored.status().result(), Some(ResultStatus::Misconfigured));
}

#[test]
fn panicking_handler_counts_as_failure() {
    let hub = Hub::new(
        single_route("buggy", 0, None),
        HandlerRegistry::new().register("buggy", |_: &Value| panic!("index out of range")),
    );
    let created = hub.sink.put_event(vec![json!({ "order": 1 })]).unwrap();

    assert!(matches!(
        hub.worker.process_one().unwrap(),
        Some(Processed::Retried { .. })
    ));
    let stored = hub
        .repo
        .get_dispatch(created[0].dispatches[0].id())
        .unwrap()
        .unwrap();
    assert_eq!(stored.status().result(), Some(ResultStatus::Failed));
    assert_eq!(hub.repo.tracked_locks(), 0);
}

#[test]
fn storage_fault_fails_the_attempt_and_keeps_the_message() {
    init_tracing();
    let repo = InMemoryRepository::new();
    let queue = InMemoryQueue::new();
    let routing = single_route("email", 3, Some(RetryPolicy::Constant { interval: 30 }));
    let sink = EventSink::new(repo.clone(), queue.clone(), routing);
    let created = sink.put_event(vec![json!({ "order": 7 })]).unwrap();
    let dispatch = created[0].dispatches[0].clone();

    let storage = FaultyRepository::new(repo.clone());
    storage.fail_saves_of(dispatch.id());
    let email = Scripted::always(HandlerOutcome::Complete);
    let handlers = HandlerRegistry::new().register("email", email.handler());
    let worker = DispatchWorker::new(Dispatcher::new(storage, handlers), queue.clone());

    assert_eq!(
        worker
            .dispatcher()
            .dispatch(&DispatchMessage::for_dispatch(&dispatch)),
        DispatchOutcome::Failed
    );
    assert_eq!(
        worker.process_one().unwrap(),
        Some(Processed::Retried {
            delay_seconds: Some(30)
        })
    );

    assert_eq!(email.calls(), 2);
    let stored = repo.get_dispatch(dispatch.id()).unwrap().unwrap();
    assert!(stored.is_ongoing());
    assert!(stored.execution_log().is_empty());
    assert_eq!(queue.pending(), 1);
    assert_eq!(queue.acknowledged(), 0);
    assert_eq!(repo.tracked_locks(), 0);
}

#[test]
fn inverted_backoff_set_in_code_never_undercuts_base() {
    let route = Route::new(Condition::exists("$.order"), "flaky")
        .with_max_retries(4)
        .with_retry_delay(RetryPolicy::Exponential { base: 45, max: 5 });
    let hub = Hub::new(
        RoutingConfig::new(vec![route]),
        HandlerRegistry::new().register("flaky", Scripted::failing().handler()),
    );
    hub.sink.put_event(vec![json!({ "order": 2 })]).unwrap();

    for _ in 0..3 {
        assert_eq!(
            hub.worker.process_one().unwrap(),
            Some(Processed::Retried {
                delay_seconds: Some(45)
            })
        );
        hub.clock.advance_secs(45);
    }
}
