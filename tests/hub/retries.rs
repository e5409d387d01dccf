//! Manual retries of resolved dispatches.

use dispatch_hub::{
    Condition, DispatchFilter, DispatchOutcome, HandlerOutcome, HandlerRegistry, HubError,
    ListOptions, Processed, ReadStore, ResultStatus, RetryOverrides, RetryPolicy, Route,
    RoutingConfig,
};
use serde_json::json;

use crate::support::{Hub, Scripted};

fn hub_with(handler: &Scripted) -> Hub {
    let routing = RoutingConfig::new(vec![
        Route::new(Condition::exists("$.user"), "crm").with_delay_seconds(2),
    ]);
    Hub::new(
        routing,
        HandlerRegistry::new().register("crm", handler.handler()),
    )
}

#[test]
fn retrying_a_failed_dispatch_delivers_it_again() {
    let crm = Scripted::new(vec![Err("503".to_string()), Ok(HandlerOutcome::Complete)]);
    let hub = hub_with(&crm);

    let created = hub.sink.put_event(vec![json!({ "user": "ana" })]).unwrap();
    let original = created[0].dispatches[0].id();

    hub.clock.advance_secs(2);
    assert!(matches!(
        hub.worker.process_one().unwrap(),
        Some(Processed::Retried { .. })
    ));
    assert_eq!(
        hub.repo
            .get_dispatch(original)
            .unwrap()
            .unwrap()
            .status()
            .result(),
        Some(ResultStatus::Failed)
    );

    let retry = hub
        .sink
        .retry_dispatch(original, RetryOverrides::default())
        .unwrap();
    assert_ne!(retry.id(), original);
    assert_eq!(retry.delay_seconds(), Some(2));

    hub.clock.advance_secs(30);
    let mut outcomes = Vec::new();
    while let Some(processed) = hub.worker.process_one().unwrap() {
        outcomes.push(processed);
    }
    assert!(outcomes.contains(&Processed::Acked(DispatchOutcome::Complete)));

    let history = hub
        .repo
        .list_dispatches(
            &DispatchFilter::for_event(created[0].event.id),
            &ListOptions::default(),
        )
        .unwrap();
    let statuses: Vec<_> = history
        .items
        .iter()
        .map(|d| d.status().result())
        .collect();
    assert_eq!(
        statuses,
        vec![Some(ResultStatus::Failed), Some(ResultStatus::Complete)]
    );
    assert_eq!(crm.payloads(), vec![json!({ "user": "ana" }); 2]);
}

#[test]
fn overrides_replace_the_copied_parameters() {
    let crm = Scripted::always(HandlerOutcome::Ignored);
    let hub = hub_with(&crm);

    let created = hub.sink.put_event(vec![json!({ "user": "bo" })]).unwrap();
    let original = created[0].dispatches[0].id();
    hub.clock.advance_secs(2);
    hub.worker.drain(1).unwrap();

    let retry = hub
        .sink
        .retry_dispatch(
            original,
            RetryOverrides {
                delay_seconds: Some(0),
                max_retries: Some(7),
                retry_delay: Some(RetryPolicy::Constant { interval: 1 }),
            },
        )
        .unwrap();

    assert_eq!(retry.delay_seconds(), Some(0));
    assert_eq!(retry.max_retries(), 7);
    assert_eq!(
        retry.retry_delay(),
        Some(&RetryPolicy::Constant { interval: 1 })
    );
    assert_eq!(retry.destination(), "crm");
    assert_eq!(retry.event_id(), created[0].event.id);
}

#[test]
fn ongoing_dispatch_cannot_be_retried() {
    let hub = hub_with(&Scripted::always(HandlerOutcome::Complete));
    let created = hub.sink.put_event(vec![json!({ "user": "cy" })]).unwrap();
    let id = created[0].dispatches[0].id();

    let err = hub
        .sink
        .retry_dispatch(id, RetryOverrides::default())
        .unwrap_err();
    assert!(matches!(err, HubError::DispatchOngoing(found) if found == id));
    assert_eq!(hub.queue.len(), 1, "nothing new was enqueued");
}

#[test]
fn lost_dispatch_can_be_retried() {
    let crm = Scripted::always(HandlerOutcome::Complete);
    let hub = hub_with(&crm);
    let created = hub.sink.put_event(vec![json!({ "user": "di" })]).unwrap();
    let id = created[0].dispatches[0].id();

    hub.clock.advance_secs(3600 + 2);
    let marked = hub.sink.mark_lost_dispatches(None, None, None).unwrap();
    assert_eq!(marked.dispatches.len(), 1);

    let retry = hub
        .sink
        .retry_dispatch(id, RetryOverrides::default())
        .unwrap();
    assert!(retry.is_ongoing());
    assert_eq!(
        hub.repo
            .get_dispatch(id)
            .unwrap()
            .unwrap()
            .status()
            .result(),
        Some(ResultStatus::Lost)
    );
}
