mod common;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{ItemAdded, PostgresTestFixture, item_added, resolver};
use futures::StreamExt;
use serde_json::json;
use streamstore::{
    EventRecord, EventStoreError, MatchOperator, MessageProperty, MetadataMatcher, PageSize,
    SequenceNumber, TypeRegistry,
};
use streamstore_postgres::StreamLoad;

#[tokio::test]
async fn merged_read_orders_events_by_creation_time() {
    // Given: Streams A and B written alternately A1, B1, A2
    let fixture = PostgresTestFixture::new().await;
    let a = fixture.new_stream("merge-a").await;
    let b = fixture.new_stream("merge-b").await;
    let base = Utc::now();
    let at = |ms: i64| base + chrono::TimeDelta::milliseconds(ms);

    let _ = fixture
        .store
        .append_to(&a, &[item_added("c-1", 1, "a1").with_created_at(at(0))])
        .await
        .expect("should append a1");
    let _ = fixture
        .store
        .append_to(&b, &[item_added("c-2", 1, "b1").with_created_at(at(10))])
        .await
        .expect("should append b1");
    let _ = fixture
        .store
        .append_to(&a, &[item_added("c-1", 2, "a2").with_created_at(at(20))])
        .await
        .expect("should append a2");

    // When: Developer merge-loads both streams
    let events = fixture
        .store
        .merge_and_load(0, &[StreamLoad::new(a.clone()), StreamLoad::new(b.clone())], resolver())
        .await
        .expect("should open merged cursor")
        .drain_to_list()
        .await
        .expect("should read merged events");

    // Then: All three come back in creation order regardless of sequence numbers
    let order: Vec<(String, String, u64)> = events
        .iter()
        .map(|e| {
            (
                e.stream().expect("stream injected").to_string(),
                e.payload().sku.clone(),
                e.sequence().map_or(0, u64::from),
            )
        })
        .collect();
    assert_eq!(
        order,
        vec![
            (a.to_string(), "a1".to_string(), 1),
            (b.to_string(), "b1".to_string(), 1),
            (a.to_string(), "a2".to_string(), 2),
        ]
    );
}

#[tokio::test]
async fn merged_read_limit_applies_to_the_union() {
    // Given: Two streams with two events each
    let fixture = PostgresTestFixture::new().await;
    let a = fixture.new_stream("limit-a").await;
    let b = fixture.new_stream("limit-b").await;
    for stream in [&a, &b] {
        let _ = fixture
            .store
            .append_to(stream, &[item_added("c", 1, "x"), item_added("c", 2, "y")])
            .await
            .expect("should append");
    }

    // When: Developer merge-loads with a total limit of three
    let events = fixture
        .store
        .merge_and_load(3, &[StreamLoad::new(a), StreamLoad::new(b)], resolver())
        .await
        .expect("should open merged cursor")
        .drain_to_list()
        .await
        .expect("should read merged events");

    // Then: Three events are returned in total
    assert_eq!(events.len(), 3);
}

#[tokio::test]
async fn merging_nothing_is_rejected() {
    // Given: An installed store
    let fixture = PostgresTestFixture::new().await;

    // When: Developer merge-loads no streams
    let result = fixture.store.merge_and_load(0, &[], resolver()).await;

    // Then: The empty merge is a validation error
    assert!(matches!(result, Err(EventStoreError::EmptyMerge)));
}

#[tokio::test]
async fn metadata_matchers_filter_numerically_and_by_boolean() {
    // Given: Events tagged (integer=2, bool=true) and (integer=3, bool=true)
    let fixture = PostgresTestFixture::new().await;
    let stream = fixture.new_stream("match").await;
    let _ = fixture
        .store
        .append_to(
            &stream,
            &[
                item_added("c-1", 1, "two")
                    .with_metadata_entry("integer", 2)
                    .with_metadata_entry("bool", true),
                item_added("c-1", 2, "three")
                    .with_metadata_entry("integer", 3)
                    .with_metadata_entry("bool", true),
            ],
        )
        .await
        .expect("should append");

    // When: Developer loads with {integer <= 2, bool = true}
    let matcher = MetadataMatcher::new()
        .with_metadata_match("integer", MatchOperator::LowerThanEquals, 2)
        .with_metadata_match("bool", MatchOperator::Equals, true);
    let events = fixture
        .store
        .load(&stream, SequenceNumber::first(), 0, &matcher, resolver())
        .await
        .expect("should open cursor")
        .drain_to_list()
        .await
        .expect("should read events");

    // Then: Only the first event matches
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload().sku, "two");
}

#[tokio::test]
async fn dotted_metadata_keys_match_nested_values() {
    // Given: Events whose tenant region is nested inside the metadata
    let fixture = PostgresTestFixture::new().await;
    let stream = fixture.new_stream("nested").await;
    let _ = fixture
        .store
        .append_to(
            &stream,
            &[
                item_added("c-1", 1, "eu-item")
                    .with_metadata_entry("tenant", json!({"region": "eu", "tier": 2})),
                item_added("c-2", 1, "us-item")
                    .with_metadata_entry("tenant", json!({"region": "us", "tier": 1})),
            ],
        )
        .await
        .expect("should append");

    // When: Developer filters on tenant.region and tenant.tier
    let matcher = MetadataMatcher::new()
        .with_metadata_match("tenant.region", MatchOperator::Equals, "eu")
        .with_metadata_match("tenant.tier", MatchOperator::GreaterThanEquals, 2);
    let events = fixture
        .store
        .load(&stream, SequenceNumber::first(), 0, &matcher, resolver())
        .await
        .expect("should open cursor")
        .drain_to_list()
        .await
        .expect("should read events");

    // Then: Only the nested eu event matches
    let skus: Vec<_> = events.into_iter().map(|e| e.into_payload().sku).collect();
    assert_eq!(skus, vec!["eu-item"]);
}

#[tokio::test]
async fn property_and_set_matchers_combine() {
    // Given: Three carts in one stream
    let fixture = PostgresTestFixture::new().await;
    let stream = fixture.new_stream("props").await;
    let _ = fixture
        .store
        .append_to(
            &stream,
            &[
                item_added("c-1", 1, "a").with_metadata_entry("region", "eu"),
                item_added("c-2", 1, "b").with_metadata_entry("region", "us"),
                item_added("c-3", 1, "c").with_metadata_entry("region", "apac"),
            ],
        )
        .await
        .expect("should append");

    // When: Developer filters on region membership and a sequence bound
    let matcher = MetadataMatcher::new()
        .with_metadata_match("region", MatchOperator::In, "('eu', 'apac')")
        .with_property_match(MessageProperty::Sequence, MatchOperator::GreaterThan, 1)
        .with_property_match(MessageProperty::AggregateId, MatchOperator::Regex, "^c-");
    let events = fixture
        .store
        .load(&stream, SequenceNumber::first(), 0, &matcher, resolver())
        .await
        .expect("should open cursor")
        .drain_to_list()
        .await
        .expect("should read events");

    // Then: Only c-3 qualifies
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload().sku, "c");
}

#[tokio::test]
async fn reading_starts_at_the_requested_sequence() {
    // Given: A stream with four events
    let fixture = PostgresTestFixture::new().await;
    let stream = fixture.new_stream("from").await;
    let batch: Vec<_> = (1..=4).map(|v| item_added("c-1", v, &format!("s{v}"))).collect();
    let _ = fixture
        .store
        .append_to(&stream, &batch)
        .await
        .expect("should append");

    // When: Developer loads from sequence 3
    let events = fixture
        .store
        .load(&stream, SequenceNumber::new(3), 0, &MetadataMatcher::new(), resolver())
        .await
        .expect("should open cursor")
        .drain_to_list()
        .await
        .expect("should read events");

    // Then: Sequences 3 and 4 are returned
    let skus: Vec<_> = events.into_iter().map(|e| e.into_payload().sku).collect();
    assert_eq!(skus, vec!["s3", "s4"]);
}

#[tokio::test]
async fn exact_page_boundary_costs_one_empty_fetch() {
    // Given: A store paging two rows at a time and a stream with exactly two events
    let fixture = PostgresTestFixture::new().await;
    let store = fixture.store.clone().with_limits(
        Duration::from_secs(30),
        PageSize::new(NonZeroUsize::new(2).expect("non-zero")),
    );
    let stream = fixture.new_stream("paging").await;
    let _ = store
        .append_to(&stream, &[item_added("c-1", 1, "a"), item_added("c-1", 2, "b")])
        .await
        .expect("should append");

    // When: Developer advances until exhaustion
    let mut cursor = store
        .load(&stream, SequenceNumber::first(), 0, &MetadataMatcher::new(), resolver())
        .await
        .expect("should open cursor");
    let mut seen = 0;
    while cursor.advance().await.expect("should advance") {
        seen += 1;
    }

    // Then: Both events were seen over exactly two fetches
    assert_eq!(seen, 2);
    assert_eq!(cursor.fetch_count(), 2);
}

#[tokio::test]
async fn cursor_can_be_rewound_and_streamed() {
    // Given: A stream with three events
    let fixture = PostgresTestFixture::new().await;
    let stream = fixture.new_stream("rewind").await;
    let _ = fixture
        .store
        .append_to(
            &stream,
            &[item_added("c", 1, "a"), item_added("c", 2, "b"), item_added("c", 3, "c")],
        )
        .await
        .expect("should append");

    // When: Developer reads one event, rewinds, then streams everything
    let mut cursor = fixture
        .store
        .load(&stream, SequenceNumber::first(), 0, &MetadataMatcher::new(), resolver())
        .await
        .expect("should open cursor");
    assert!(!cursor.is_empty().await.expect("should check emptiness"));
    cursor.rewind();
    let streamed: Vec<_> = cursor.into_stream().collect().await;

    // Then: All three events are delivered from the start
    let skus: Vec<_> = streamed
        .into_iter()
        .map(|r| r.expect("should decode").into_payload().sku)
        .collect();
    assert_eq!(skus, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn unknown_event_type_latches_the_cursor() {
    // Given: A stream holding an event type the resolver does not know
    let fixture = PostgresTestFixture::new().await;
    let stream = fixture.new_stream("unknown").await;
    let _ = fixture
        .store
        .append_to(
            &stream,
            &[EventRecord::new("CartAbandoned", json!({})).with_aggregate("cart", "c-1", 1)],
        )
        .await
        .expect("should append");

    // When: Developer reads with an ItemAdded-only resolver
    let mut cursor = fixture
        .store
        .load(&stream, SequenceNumber::first(), 0, &MetadataMatcher::new(), resolver())
        .await
        .expect("should open cursor");
    let first = cursor.advance().await;
    let second = cursor.current().await.map(|event| event.cloned());

    // Then: The same error is returned on every call
    let expected = EventStoreError::UnknownEventType {
        event_type: "CartAbandoned".to_string(),
    };
    assert_eq!(first, Err(expected.clone()));
    assert_eq!(second, Err(expected));
}

#[tokio::test]
async fn invalid_matchers_are_rejected_when_building_the_query() {
    // Given: An existing stream
    let fixture = PostgresTestFixture::new().await;
    let stream = fixture.new_stream("invalid-matcher").await;

    // When: Developer filters on an unknown message property
    let matcher = MetadataMatcher::new().with_match(streamstore::MetadataMatch::new(
        "colour",
        streamstore::FieldDomain::MessageProperty,
        MatchOperator::Equals,
        "red",
    ));
    let result = fixture
        .store
        .build_query(&stream, SequenceNumber::first(), &matcher)
        .await;

    // Then: The matcher is rejected
    assert!(matches!(result, Err(EventStoreError::InvalidMatcher { .. })));
}

#[tokio::test]
#[tracing_test::traced_test]
async fn reads_and_writes_emit_tracing_spans() {
    // Given: A stream with one event
    let fixture = PostgresTestFixture::new().await;
    let stream = fixture.new_stream("traced").await;
    let _ = fixture
        .store
        .append_to(&stream, &[item_added("c-1", 1, "a")])
        .await
        .expect("should append");

    // When: Developer reads it back through a raw JSON registry
    let raw = Arc::new(TypeRegistry::<serde_json::Value>::new().register_with("ItemAdded", Ok));
    let events = fixture
        .store
        .load(&stream, SequenceNumber::first(), 0, &MetadataMatcher::new(), raw)
        .await
        .expect("should open cursor")
        .drain_to_list()
        .await
        .expect("should read events");

    // Then: The payload decodes and both spans were recorded
    let decoded: ItemAdded =
        serde_json::from_value(events[0].payload().clone()).expect("payload is an ItemAdded");
    assert_eq!(decoded.sku, "a");
    assert!(
        logs_contain("postgres.append_to") && logs_contain("postgres.load"),
        "postgres adapter should emit append and load tracing spans",
    );
}
