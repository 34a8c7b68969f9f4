//! Mapping passes over an in-memory store: determinism, idempotence, and
//! named-skip accounting.

use codh_backfill::{
    run_mapping, BackfillError, ExecutiveActionsMapper, GazetteMapper, IndicatorsMapper,
    MoneyMapper,
};
use codh_core::IngestMode;
use codh_store::records::upsert_source_record;
use codh_store::sources::{upsert_source, SourceSeed};
use codh_store::SqliteConnection;
use serde_json::json;

async fn seed(conn: &mut SqliteConnection, code: &str) -> i64 {
    upsert_source(
        conn,
        &SourceSeed {
            code,
            name: "Raw feed",
            scope: None,
            default_url: None,
            format: Some("json"),
            mode: IngestMode::SourceRecordsOnly,
            min_records: None,
            active: true,
        },
    )
    .await
    .expect("seed")
}

async fn store_record(conn: &mut SqliteConnection, sid: i64, id: &str, payload: serde_json::Value) {
    upsert_source_record(conn, sid, id, &payload.to_string(), None, Some("2024-06-30"))
        .await
        .expect("record");
}

async fn count(conn: &mut SqliteConnection, table: &str) -> i64 {
    codh_store::count_rows(conn, table).await.expect("count")
}

#[tokio::test]
async fn executive_pass_maps_counts_skips_and_is_idempotent() {
    let mut conn = codh_store::open_in_memory().await.expect("db");
    let sid = seed(&mut conn, "council").await;

    store_record(
        &mut conn,
        sid,
        "a-1",
        json!({"title": "Acuerdo uno", "url": "https://example.org/1", "published_date": "2024-05-14"}),
    )
    .await;
    store_record(
        &mut conn,
        sid,
        "a-2",
        json!({"kind": "index", "title": "Listado", "url": "https://example.org/list"}),
    )
    .await;
    store_record(&mut conn, sid, "a-3", json!({"title": "Sin enlace"})).await;

    let stats = run_mapping(&mut conn, &ExecutiveActionsMapper, &["council"])
        .await
        .expect("pass");
    assert_eq!(stats.seen, 3);
    assert_eq!(stats.mapped, 1);
    assert_eq!(stats.skipped, 2);
    assert_eq!(stats.skip_reasons.get("index-row"), Some(&1));
    assert_eq!(stats.skip_reasons.get("missing-source-url"), Some(&1));
    assert_eq!(stats.events_total, 1);
    assert_eq!(stats.events_traceable, 1);
    assert_eq!(count(&mut conn, "policy_events").await, 1);

    // Second pass over unchanged records changes nothing.
    let again = run_mapping(&mut conn, &ExecutiveActionsMapper, &["council"])
        .await
        .expect("second pass");
    assert_eq!(again.mapped, 1);
    assert_eq!(count(&mut conn, "policy_events").await, 1);

    let event_date: Option<String> =
        sqlx::query_scalar("SELECT event_date FROM policy_events LIMIT 1")
            .fetch_one(&mut conn)
            .await
            .expect("event date");
    assert_eq!(event_date, None);
}

#[tokio::test]
async fn gazette_reference_collapses_duplicate_announcements() {
    let mut conn = codh_store::open_in_memory().await.expect("db");
    let sid = seed(&mut conn, "gazette").await;

    // Same BOE reference seen through two different records.
    store_record(
        &mut conn,
        sid,
        "g-1",
        json!({"title": "Resolución BOE-A-2024-11001", "url": "https://boe.example/a"}),
    )
    .await;
    store_record(
        &mut conn,
        sid,
        "g-2",
        json!({"title": "Corrección BOE-A-2024-11001", "url": "https://boe.example/b"}),
    )
    .await;

    let stats = run_mapping(&mut conn, &GazetteMapper, &["gazette"])
        .await
        .expect("pass");
    assert_eq!(stats.mapped, 2);
    assert_eq!(count(&mut conn, "policy_events").await, 1);
}

#[tokio::test]
async fn money_pass_parses_amounts_and_keeps_traceability() {
    let mut conn = codh_store::open_in_memory().await.expect("db");
    let sid = seed(&mut conn, "contracts").await;

    store_record(
        &mut conn,
        sid,
        "c-1",
        json!({"title": "Contrato", "url": "https://example.org/c1", "amount": "2.500.000,00", "currency": "EUR"}),
    )
    .await;
    store_record(
        &mut conn,
        sid,
        "c-2",
        json!({"title": "Subvención sin importe", "url": "https://example.org/c2"}),
    )
    .await;

    let stats = run_mapping(&mut conn, &MoneyMapper, &["contracts"])
        .await
        .expect("pass");
    assert_eq!(stats.mapped, 2);
    assert_eq!(stats.events_total, 2);
    assert_eq!(stats.events_traceable, 2);

    let amount: Option<f64> =
        sqlx::query_scalar("SELECT amount FROM money_records WHERE event_id = 'money:contracts:c-1'")
            .fetch_one(&mut conn)
            .await
            .expect("amount");
    assert_eq!(amount, Some(2_500_000.0));

    let untraceable: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM money_records WHERE length(source_url) = 0",
    )
    .fetch_one(&mut conn)
    .await
    .expect("untraceable");
    assert_eq!(untraceable, 0);
}

#[tokio::test]
async fn indicator_pass_builds_series_and_points() {
    let mut conn = codh_store::open_in_memory().await.expect("db");
    let sid = seed(&mut conn, "stats").await;

    for (id, period, value) in [("p-1", "2024-Q1", "21.560,3"), ("p-2", "2024-Q2", "21.601,0")] {
        store_record(
            &mut conn,
            sid,
            id,
            json!({"series": "Población Activa", "period": period, "value": value, "url": "https://ine.example/epa"}),
        )
        .await;
    }

    let stats = run_mapping(&mut conn, &IndicatorsMapper, &["stats"])
        .await
        .expect("pass");
    assert_eq!(stats.mapped, 2);
    assert_eq!(stats.events_total, 2);
    assert_eq!(stats.events_traceable, 2);
    assert_eq!(count(&mut conn, "indicator_series").await, 1);
    assert_eq!(count(&mut conn, "indicator_points").await, 2);

    // Re-observing a period overwrites the point, never duplicates it.
    run_mapping(&mut conn, &IndicatorsMapper, &["stats"])
        .await
        .expect("second pass");
    assert_eq!(count(&mut conn, "indicator_points").await, 2);
}

#[tokio::test]
async fn unknown_source_code_fails_before_any_write() {
    let mut conn = codh_store::open_in_memory().await.expect("db");
    let err = run_mapping(&mut conn, &MoneyMapper, &["never-seeded"])
        .await
        .expect_err("unknown source");
    assert!(matches!(
        err,
        BackfillError::Store(codh_store::StoreError::UnknownSource(_))
    ));
    assert_eq!(count(&mut conn, "money_records").await, 0);
}
