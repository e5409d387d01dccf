//! Listing completeness and filtering through continuation tokens.

use std::collections::HashSet;

use dispatch_hub::{
    Clock, Condition, ContinuationToken, DispatchFilter, DispatchId, EventFilter, EventId,
    HandlerOutcome, HandlerRegistry, ListOptions, Operator, Page, PaginationError, ReadStore,
    RepositoryError, ResultStatus, Route, RoutingConfig, SortOrder, StatusFilter,
};
use proptest::prelude::*;
use serde_json::{json, Value};

use crate::support::Hub;

fn routing() -> RoutingConfig {
    RoutingConfig::new(vec![
        Route::new(Condition::exists("$.n"), "all"),
        Route::new(Condition::compare("$.n", Operator::Gte(5.0)), "big"),
    ])
}

fn collect_pages<T>(
    k: usize,
    order: SortOrder,
    mut fetch: impl FnMut(&ListOptions) -> Result<Page<T>, RepositoryError>,
) -> Vec<T> {
    let mut options = ListOptions::new(k);
    options.order = order;
    let mut items = Vec::new();
    loop {
        let page = fetch(&options).unwrap();
        assert!(page.items.len() <= k);
        items.extend(page.items);
        match page.continuation {
            Some(token) => options = options.after(Some(token)),
            None => break,
        }
    }
    items
}

/// Creates `batches` worth of events, advancing the clock between batches so
/// some share a timestamp and some do not.
fn populate(hub: &Hub, batches: &[usize]) {
    let mut n = 0;
    for &size in batches {
        let payloads: Vec<Value> = (0..size)
            .map(|_| {
                n += 1;
                json!({ "n": n % 10 })
            })
            .collect();
        hub.sink.put_event(payloads).unwrap();
        hub.clock.advance_secs(1);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(40))]

    #[test]
    fn every_dispatch_appears_exactly_once_in_order(
        batches in prop::collection::vec(0usize..6, 0..6),
        k in 1usize..9,
        descending in any::<bool>(),
    ) {
        let hub = Hub::new(routing(), HandlerRegistry::new());
        populate(&hub, &batches);
        let order = if descending { SortOrder::Desc } else { SortOrder::Asc };

        let listed = collect_pages(k, order, |options| {
            hub.repo.list_dispatches(&DispatchFilter::default(), options)
        });

        let oldest_first = hub
            .repo
            .list_dispatches(&DispatchFilter::default(), &ListOptions::new(10_000))
            .unwrap()
            .items;
        for pair in oldest_first.windows(2) {
            prop_assert!(pair[0].created_at() <= pair[1].created_at());
        }
        let mut expected: Vec<DispatchId> = oldest_first.iter().map(|d| d.id()).collect();
        if descending {
            expected.reverse();
        }

        let got: Vec<DispatchId> = listed.iter().map(|d| d.id()).collect();
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn every_event_appears_exactly_once(
        batches in prop::collection::vec(0usize..6, 0..6),
        k in 1usize..9,
    ) {
        let hub = Hub::new(routing(), HandlerRegistry::new());
        populate(&hub, &batches);

        let listed = collect_pages(k, SortOrder::Asc, |options| {
            hub.repo.list_events(&EventFilter::default(), options)
        });

        let total: usize = batches.iter().sum();
        prop_assert_eq!(listed.len(), total);
        let ids: HashSet<EventId> = listed.iter().map(|e| e.event.id).collect();
        prop_assert_eq!(ids.len(), total);
        for pair in listed.windows(2) {
            prop_assert!(pair[0].event.created_at <= pair[1].event.created_at);
        }
    }
}

#[test]
fn inserts_behind_the_cursor_do_not_disturb_paging() {
    let hub = Hub::new(routing(), HandlerRegistry::new());
    populate(&hub, &[3, 3]);

    let first = hub
        .repo
        .list_dispatches(&DispatchFilter::default(), &ListOptions::new(4))
        .unwrap();
    let seen: Vec<DispatchId> = first.items.iter().map(|d| d.id()).collect();

    // New rows sort after everything already listed.
    populate(&hub, &[2]);

    let rest = collect_pages(4, SortOrder::Asc, |options| {
        let options = if options.continuation.is_none() {
            options.clone().after(first.continuation.clone())
        } else {
            options.clone()
        };
        hub.repo.list_dispatches(&DispatchFilter::default(), &options)
    });

    let all = hub
        .repo
        .list_dispatches(&DispatchFilter::default(), &ListOptions::new(1000))
        .unwrap()
        .items;
    let mut combined = seen;
    combined.extend(rest.iter().map(|d| d.id()));
    assert_eq!(combined, all.iter().map(|d| d.id()).collect::<Vec<_>>());
}

#[test]
fn filters_narrow_the_listing() {
    let hub = Hub::new(
        routing(),
        HandlerRegistry::new().register("big", |_: &Value| Ok(HandlerOutcome::Complete)),
    );
    let start = hub.clock.now();
    let created = hub
        .sink
        .put_event(vec![json!({ "n": 1 }), json!({ "n": 7 })])
        .unwrap();
    hub.worker.drain(10).unwrap();

    let big = hub
        .repo
        .list_dispatches(
            &DispatchFilter {
                destination: Some("big".into()),
                ..Default::default()
            },
            &ListOptions::default(),
        )
        .unwrap();
    assert_eq!(big.items.len(), 1);

    let complete = hub
        .repo
        .list_dispatches(
            &DispatchFilter {
                status: Some(StatusFilter::Is(ResultStatus::Complete)),
                ..Default::default()
            },
            &ListOptions::default(),
        )
        .unwrap();
    assert_eq!(complete.items.len(), 1);
    assert_eq!(complete.items[0].destination(), "big");

    // "all" has no handler, so both of its dispatches resolved as misconfigured.
    let resolved = hub
        .repo
        .list_dispatches(
            &DispatchFilter {
                status: Some(StatusFilter::Resulted),
                ..Default::default()
            },
            &ListOptions::default(),
        )
        .unwrap();
    assert_eq!(resolved.items.len(), 3);

    let for_second = hub
        .repo
        .list_dispatches(
            &DispatchFilter::for_event(created[1].event.id),
            &ListOptions::default(),
        )
        .unwrap();
    assert_eq!(for_second.items.len(), 2);

    let later = hub
        .repo
        .list_events(
            &EventFilter {
                created_after: Some(start),
                created_before: None,
            },
            &ListOptions::default(),
        )
        .unwrap();
    assert!(
        later.items.is_empty(),
        "both events share the start instant"
    );
}

#[test]
fn malformed_and_mismatched_tokens_are_reported() {
    let hub = Hub::new(routing(), HandlerRegistry::new());
    populate(&hub, &[4]);

    let garbage = ListOptions::new(2).after(Some(ContinuationToken::from("not-a-token")));
    assert_eq!(
        hub.repo
            .list_dispatches(&DispatchFilter::default(), &garbage)
            .unwrap_err(),
        RepositoryError::Pagination(PaginationError::InvalidToken)
    );

    let ascending = hub
        .repo
        .list_dispatches(&DispatchFilter::default(), &ListOptions::new(2))
        .unwrap();
    let flipped = ListOptions::new(2)
        .descending()
        .after(ascending.continuation);
    assert!(matches!(
        hub.repo.list_dispatches(&DispatchFilter::default(), &flipped),
        Err(RepositoryError::Pagination(PaginationError::OrderMismatch { .. }))
    ));
}
