mod common;

use common::{HEARTBEAT_SCHEMA, TestDb, insert_heartbeat, sample_value};
use sql_exporter::{collectors::registry::CollectorRegistry, config::Config};
use std::time::Duration;

fn registry(db: &TestDb, body: &str) -> CollectorRegistry {
    let config = Config::from_toml(&format!(
        r#"
        [target]
        name = "replica"
        data_source_name = "{dsn}"
        collectors = ["replication*"]

        {body}
        "#,
        dsn = db.dsn(),
    ))
    .unwrap();

    CollectorRegistry::new(&config, None).unwrap()
}

const LAG_COLLECTOR: &str = r#"
    [[collectors]]
    name = "replication_lag"

    [[collectors.metrics]]
    metric_name = "replication_lag_seconds"
    help = "Seconds since the last replicated write"
    key_labels = ["env"]
    values = ["lag_seconds"]
    query_ref = "last_write"
    row_filters = [{ column = "env", operator = "in", values = ["prod"] }]
    lag_calculations = [{ source_column = "updated_at", output_column = "lag_seconds" }]

    [[collectors.queries]]
    name = "last_write"
    query = "SELECT env, updated_at FROM heartbeat"
"#;

#[tokio::test]
async fn test_lag_for_filtered_environment() {
    let db = TestDb::new(HEARTBEAT_SCHEMA).await.unwrap();
    insert_heartbeat(&db, "prod", None, 30, None).await.unwrap();
    insert_heartbeat(&db, "staging", None, 600, None).await.unwrap();

    let r = registry(&db, LAG_COLLECTOR);
    let text = r.collect_all(Duration::from_secs(5)).await.unwrap();

    assert!(text.contains("up{target=\"replica\"} 1\n"), "{text}");
    assert!(text.contains("# TYPE replication_lag_seconds gauge"));
    assert!(!text.contains("env=\"staging\""), "{text}");

    let lag = sample_value(&text, "replication_lag_seconds{env=\"prod\"}").unwrap();
    assert!((29.0..120.0).contains(&lag), "unexpected lag {lag}");

    assert_eq!(
        sample_value(
            &text,
            "sql_exporter_collector_last_scrape_success{collector=\"replication_lag\"}"
        ),
        Some(1.0),
        "{text}"
    );

    r.close().await;
}

#[tokio::test]
async fn test_repeated_scrapes_reuse_prepared_query() {
    let db = TestDb::new(HEARTBEAT_SCHEMA).await.unwrap();
    insert_heartbeat(&db, "prod", None, 30, None).await.unwrap();

    let r = registry(&db, LAG_COLLECTOR);
    for _ in 0..3 {
        let text = r.collect_all(Duration::from_secs(5)).await.unwrap();
        assert!(sample_value(&text, "replication_lag_seconds{env=\"prod\"}").is_some());
    }

    let text = r.collect_all(Duration::from_secs(5)).await.unwrap();
    assert_eq!(sample_value(&text, "sql_exporter_scrapes_total"), Some(4.0));

    r.close().await;
}

#[tokio::test]
async fn test_unprepared_multi_value_query() {
    let db = TestDb::new(HEARTBEAT_SCHEMA).await.unwrap();
    insert_heartbeat(&db, "prod", Some("eu"), 5, Some(7)).await.unwrap();
    insert_heartbeat(&db, "staging", None, 5, None).await.unwrap();

    let r = registry(
        &db,
        r#"
        [[collectors]]
        name = "replication_backlog"

        [[collectors.metrics]]
        metric_name = "replication_backlog"
        type = "counter"
        help = "Pending writes"
        key_labels = ["env", "region"]
        static_labels = { cluster = "main" }
        values = ["pending", "total"]
        value_label = "kind"
        query = "SELECT env, region, pending, pending * 2 AS total FROM heartbeat"
        no_prepared_statement = true
        "#,
    );

    let text = r.collect_all(Duration::from_secs(5)).await.unwrap();

    assert!(text.contains("# TYPE replication_backlog counter"), "{text}");
    assert_eq!(
        sample_value(
            &text,
            "replication_backlog{cluster=\"main\",env=\"prod\",kind=\"pending\",region=\"eu\"}"
        ),
        Some(7.0),
        "{text}"
    );
    assert_eq!(
        sample_value(
            &text,
            "replication_backlog{cluster=\"main\",env=\"prod\",kind=\"total\",region=\"eu\"}"
        ),
        Some(14.0)
    );
    // NULL values are skipped
    assert!(!text.contains("env=\"staging\""), "{text}");

    r.close().await;
}

const MISSING_COLUMN: &str = r#"
    [[collectors]]
    name = "replication_missing"

    [[collectors.metrics]]
    metric_name = "replication_pending"
    key_labels = ["env"]
    values = ["not_there"]
    query = "SELECT env, pending FROM heartbeat"
"#;

#[tokio::test]
async fn test_missing_column_fails_collector() {
    let db = TestDb::new(HEARTBEAT_SCHEMA).await.unwrap();
    insert_heartbeat(&db, "prod", None, 5, Some(1)).await.unwrap();

    let r = registry(&db, MISSING_COLUMN);
    let text = r.collect_all(Duration::from_secs(5)).await.unwrap();

    assert!(!text.contains("replication_pending{"), "{text}");
    assert!(text.contains("up{target=\"replica\"} 1\n"));
    assert_eq!(
        sample_value(
            &text,
            "sql_exporter_collector_last_scrape_success{collector=\"replication_missing\"}"
        ),
        Some(0.0),
        "{text}"
    );

    r.close().await;
}

#[tokio::test]
async fn test_missing_column_ignored() {
    let db = TestDb::new(HEARTBEAT_SCHEMA).await.unwrap();
    insert_heartbeat(&db, "prod", None, 5, Some(1)).await.unwrap();

    let r = registry(
        &db,
        &format!("[global]\nignore_missing_values = true\n{MISSING_COLUMN}"),
    );
    let text = r.collect_all(Duration::from_secs(5)).await.unwrap();

    assert!(!text.contains("replication_pending{"), "{text}");
    assert_eq!(
        sample_value(
            &text,
            "sql_exporter_collector_last_scrape_success{collector=\"replication_missing\"}"
        ),
        Some(1.0),
        "{text}"
    );

    r.close().await;
}

#[tokio::test]
async fn test_empty_result_set() {
    let db = TestDb::new(HEARTBEAT_SCHEMA).await.unwrap();

    let r = registry(&db, LAG_COLLECTOR);
    let text = r.collect_all(Duration::from_secs(5)).await.unwrap();

    assert!(!text.contains("replication_lag_seconds{"), "{text}");
    assert!(text.contains("up{target=\"replica\"} 1\n"));

    r.close().await;
}

#[tokio::test]
async fn test_unprepared_empty_result_checks_missing_column() {
    let db = TestDb::new(HEARTBEAT_SCHEMA).await.unwrap();
    let unprepared = MISSING_COLUMN.replace("query = ", "no_prepared_statement = true\n    query = ");

    let r = registry(&db, &unprepared);
    let text = r.collect_all(Duration::from_secs(5)).await.unwrap();

    assert!(text.contains("up{target=\"replica\"} 1\n"));
    assert_eq!(
        sample_value(
            &text,
            "sql_exporter_collector_last_scrape_success{collector=\"replication_missing\"}"
        ),
        Some(0.0),
        "{text}"
    );

    r.close().await;
}

#[tokio::test]
async fn test_dsn_override() {
    let db = TestDb::new(HEARTBEAT_SCHEMA).await.unwrap();
    insert_heartbeat(&db, "prod", None, 30, None).await.unwrap();

    let config = Config::from_toml(&format!(
        r#"
        [target]
        data_source_name = "sqlite:///nonexistent/dir/db.sqlite?mode=ro"
        collectors = ["replication*"]
        {LAG_COLLECTOR}
        "#
    ))
    .unwrap();

    let r = CollectorRegistry::new(&config, Some(db.dsn().into())).unwrap();
    let text = r.collect_all(Duration::from_secs(5)).await.unwrap();

    assert!(text.contains("up 1\n"), "{text}");
    assert!(sample_value(&text, "replication_lag_seconds{env=\"prod\"}").is_some());
    assert!(r.ping().await.is_ok());

    r.close().await;
}
