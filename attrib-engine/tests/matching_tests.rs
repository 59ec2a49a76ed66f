//! Integration tests for conversion matching
//!
//! Tier priority, attribution models, IP list handling, and journey bounds.

mod helpers;

use attrib_common::store::MemoryRecordStore;
use attrib_engine::models::{AttributionMethod, AttributionModel, MatchOptions};
use attrib_engine::{AttributionEngine, EngineError};
use helpers::{
    base_time, build, engine_with, put_conversion, put_visit, read_conversion, test_config, visit,
    UnavailableGeoProvider,
};
use serde_json::json;
use std::sync::Arc;

async fn setup(
    visits: Vec<(&str, serde_json::Value)>,
) -> (Arc<MemoryRecordStore>, AttributionEngine) {
    let store = Arc::new(MemoryRecordStore::new());
    for (key, value) in visits {
        put_visit(store.as_ref(), key, value).await;
    }
    let provider = Arc::new(UnavailableGeoProvider::default());
    let engine = engine_with(store.clone(), provider, test_config());
    build(&engine).await;
    (store, engine)
}

fn options(model: AttributionModel) -> MatchOptions {
    MatchOptions {
        model,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_session_tier_beats_ip_tier() {
    let (store, engine) = setup(vec![
        ("visit:a", visit(120, "198.51.100.7", Some("sess-abc"))),
        ("visit:b", visit(30, "203.0.113.9", Some("sess-other"))),
    ])
    .await;
    put_conversion(
        store.as_ref(),
        "c1",
        json!({
            "timestamp": base_time().to_rfc3339(),
            "email": "buyer@example.com",
            "session_token": "sess-abc",
            "ip": "203.0.113.9",
        }),
    )
    .await;

    let ctx = engine.new_run_context(0);
    let record = engine
        .resolve_attribution(&ctx, "c1", &options(AttributionModel::LastTouch), false)
        .await
        .unwrap();

    let matched = record.matched().expect("matched");
    assert_eq!(matched.method, AttributionMethod::SessionToken);
    assert_eq!(matched.visit.key, "visit:a");
    assert_eq!(matched.matched_key, "idx:session:sess-abc");
    assert_eq!(
        matched.matched_tiers,
        vec![AttributionMethod::SessionToken, AttributionMethod::PrimaryIp]
    );
    assert_eq!(matched.journey.touchpoints.len(), 2);
    assert_eq!(matched.journey.touchpoints[0].visit.key, "visit:a");

    // Not persisted without --persist
    assert!(read_conversion(store.as_ref(), "c1").await.attribution.is_none());
}

#[tokio::test]
async fn test_first_touch_and_last_touch() {
    let (store, engine) = setup(vec![
        ("visit:1", visit(3 * 24 * 60, "198.51.100.7", None)),
        ("visit:2", visit(2 * 24 * 60, "198.51.100.7", None)),
        ("visit:3", visit(60, "198.51.100.7", None)),
    ])
    .await;
    put_conversion(
        store.as_ref(),
        "c1",
        json!({"timestamp": base_time().to_rfc3339(), "ip": "198.51.100.7"}),
    )
    .await;

    let ctx = engine.new_run_context(0);
    let first = engine
        .resolve_attribution(&ctx, "c1", &options(AttributionModel::FirstTouch), false)
        .await
        .unwrap();
    let last = engine
        .resolve_attribution(&ctx, "conversion:c1", &options(AttributionModel::LastTouch), false)
        .await
        .unwrap();

    let first = first.matched().unwrap();
    let last = last.matched().unwrap();
    assert_eq!(first.method, AttributionMethod::PrimaryIp);
    assert_eq!(first.visit.key, "visit:1");
    assert_eq!(last.visit.key, "visit:3");
    assert!(first.visit.timestamp < last.visit.timestamp);
    assert_eq!(first.journey.touchpoints.len(), 3);
}

#[tokio::test]
async fn test_ipv6_and_ipv4_list_matches_ipv4_entry() {
    let (store, engine) = setup(vec![("visit:v4", visit(45, "203.0.113.5", None))]).await;
    put_conversion(
        store.as_ref(),
        "c1",
        json!({"timestamp": base_time().to_rfc3339(), "ip": "2001:db8::1, 203.0.113.5"}),
    )
    .await;

    let ctx = engine.new_run_context(0);
    let record = engine
        .resolve_attribution(&ctx, "c1", &MatchOptions::default(), false)
        .await
        .unwrap();

    let matched = record.matched().expect("matched through the IPv4 address");
    assert_eq!(matched.method, AttributionMethod::PrimaryIp);
    assert_eq!(matched.visit.key, "visit:v4");
    assert_eq!(matched.matched_key, "idx:ip:203.0.113.5");
}

#[tokio::test]
async fn test_journey_excludes_visits_at_or_after_conversion() {
    let (store, engine) = setup(vec![
        ("visit:past", visit(60, "198.51.100.7", None)),
        ("visit:same", visit(0, "198.51.100.7", None)),
        ("visit:future", visit(-10, "198.51.100.7", None)),
    ])
    .await;
    put_conversion(
        store.as_ref(),
        "c1",
        json!({"timestamp": base_time().to_rfc3339(), "ip": "198.51.100.7"}),
    )
    .await;

    let ctx = engine.new_run_context(0);
    let record = engine
        .resolve_attribution(&ctx, "c1", &options(AttributionModel::LastTouch), false)
        .await
        .unwrap();

    let matched = record.matched().unwrap();
    assert_eq!(matched.visit.key, "visit:past");
    assert_eq!(matched.journey.touchpoints.len(), 1);
    assert!(matched
        .journey
        .touchpoints
        .iter()
        .all(|t| t.visit.timestamp < base_time()));
}

#[tokio::test]
async fn test_visits_outside_lookback_do_not_match() {
    let (store, engine) =
        setup(vec![("visit:old", visit(40 * 24 * 60, "198.51.100.7", None))]).await;
    put_conversion(
        store.as_ref(),
        "c1",
        json!({"timestamp": base_time().to_rfc3339(), "ip": "198.51.100.7"}),
    )
    .await;

    let ctx = engine.new_run_context(0);
    let record = engine
        .resolve_attribution(&ctx, "c1", &MatchOptions::default(), false)
        .await
        .unwrap();
    assert!(record.matched().is_none());

    let wide = MatchOptions {
        lookback_days: 60,
        ..Default::default()
    };
    let record = engine.resolve_attribution(&ctx, "c1", &wide, false).await.unwrap();
    assert_eq!(record.method(), Some(AttributionMethod::PrimaryIp));
}

#[tokio::test]
async fn test_persisted_resolution_keeps_history_and_extra_fields() {
    let (store, engine) = setup(vec![("visit:1", visit(30, "198.51.100.7", Some("sess-1")))]).await;
    put_conversion(
        store.as_ref(),
        "c1",
        json!({
            "timestamp": base_time().timestamp_millis(),
            "customerEmail": "Buyer@Example.com",
            "ip": "198.51.100.7",
            "line_items": [{"sku": "A-1", "qty": 2}],
        }),
    )
    .await;

    let ctx = engine.new_run_context(0);
    engine
        .resolve_attribution(&ctx, "c1", &MatchOptions::default(), true)
        .await
        .unwrap();
    let second = engine
        .resolve_attribution(&ctx, "c1", &MatchOptions::default(), true)
        .await
        .unwrap();

    assert_eq!(second.run_id, ctx.run_id().to_string());
    let previous = second.previous.as_ref().expect("prior result kept");
    assert!(previous.previous.is_none());

    let stored = read_conversion(store.as_ref(), "c1").await;
    assert_eq!(stored.email.as_deref(), Some("Buyer@Example.com"));
    assert_eq!(stored.extra["line_items"][0]["sku"], "A-1");
    assert_eq!(stored.attribution.unwrap().method(), Some(AttributionMethod::PrimaryIp));
}

#[tokio::test]
async fn test_missing_conversion_is_not_found() {
    let (_store, engine) = setup(Vec::new()).await;
    let ctx = engine.new_run_context(0);
    let result = engine
        .resolve_attribution(&ctx, "nope", &MatchOptions::default(), false)
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}
