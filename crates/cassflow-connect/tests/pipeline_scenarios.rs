//! End-to-end pipeline scenarios against in-memory destinations.
//!
//! These drive the orchestrator the way the binary does — reader items in,
//! committed rows and offsets out — and check the delivery invariants:
//! exactly-once-or-DLQ, monotone offsets, intra-partition ordering, masking,
//! schema-change handling, and slow-destination independence.

use cassflow_cdc::{OffsetManager, ReaderItem, SchemaCache};
use cassflow_connect::config::MaskingConfig;
use cassflow_connect::dlq::DlqWriter;
use cassflow_connect::error::ConnectorError;
use cassflow_connect::health::{HealthState, SharedHealthState};
use cassflow_connect::masking::MaskingRules;
use cassflow_connect::metrics::{MetricsRegistry, SharedMetrics};
use cassflow_connect::pipeline::{Pipeline, PipelineConfig, PipelineHandle};
use cassflow_connect::retry::RetryPolicy;
use cassflow_connect::sinks::{MemorySink, Sink};
use cassflow_core::{
    ChangeEvent, ChangeOp, Column, ColumnChange, Compatibility, CqlType, CqlValue, Destination,
    EventKind, LogPosition, Row, SchemaChange,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use uuid::Uuid;

struct Harness {
    sinks: Vec<Arc<MemorySink>>,
    handle: PipelineHandle,
    reader_tx: mpsc::Sender<ReaderItem>,
    schema_tx: mpsc::Sender<SchemaChange>,
    dlq: Arc<DlqWriter>,
    metrics: SharedMetrics,
    _health: SharedHealthState,
}

fn test_config() -> PipelineConfig {
    PipelineConfig {
        batch_size: 10,
        max_batch_bytes: 1024 * 1024,
        max_batch_age: Duration::from_millis(20),
        workers_per_destination: 2,
        max_inflight_batches: 8,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(2),
            multiplier: 2.0,
            max_delay: Duration::from_millis(20),
            jitter_frac: 0.0,
        },
        dlq_write_timeout: Duration::from_secs(2),
        shutdown_deadline: Duration::from_secs(10),
    }
}

async fn start_with(
    sinks: Vec<Arc<MemorySink>>,
    dlq_dir: &Path,
    offsets: Arc<OffsetManager>,
) -> Harness {
    for sink in &sinks {
        sink.connect().await.unwrap();
    }
    let dyn_sinks: Vec<Arc<dyn Sink>> = sinks
        .iter()
        .map(|s| Arc::clone(s) as Arc<dyn Sink>)
        .collect();

    let masking = Arc::new(MaskingRules::from_config(&MaskingConfig {
        salt: "pepper".into(),
        key: "hush".into(),
        key_id: "phi-key-1".into(),
        ..Default::default()
    }));
    let schema_cache: SchemaCache = Arc::new(RwLock::new(HashMap::new()));
    let dlq = Arc::new(DlqWriter::new(dlq_dir).await.unwrap());
    let metrics = MetricsRegistry::new();
    let health = HealthState::new();

    let (reader_tx, reader_rx) = mpsc::channel(1024);
    let (schema_tx, schema_rx) = mpsc::channel(8);
    let (stop_tx, _stop_rx) = watch::channel(false);

    let handle = Pipeline::new(
        test_config(),
        dyn_sinks,
        masking,
        schema_cache,
        offsets,
        Arc::clone(&dlq),
        Arc::clone(&metrics),
        Arc::clone(&health),
    )
    .start(reader_rx, schema_rx, stop_tx);

    Harness {
        sinks,
        handle,
        reader_tx,
        schema_tx,
        dlq,
        metrics,
        _health: health,
    }
}

async fn start() -> (Harness, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let sinks: Vec<Arc<MemorySink>> = Destination::ALL
        .iter()
        .map(|d| Arc::new(MemorySink::new(*d)))
        .collect();
    let harness = start_with(sinks, dir.path(), Arc::new(OffsetManager::new())).await;
    (harness, dir)
}

fn user_pk(user: u128) -> Row {
    Row::from_columns(vec![Column::new(
        "user_id",
        CqlType::Uuid,
        CqlValue::Uuid(Uuid::from_u128(user)),
    )])
}

fn insert_item(user: u128, email: &str, age: i32, ts: i64, pos: u64) -> ReaderItem {
    let event = ChangeEvent::new(
        EventKind::Insert,
        "ecommerce",
        "users",
        user_pk(user),
        Row::new(),
        Row::from_columns(vec![
            Column::new("email", CqlType::Text, CqlValue::Text(email.into())),
            Column::new("age", CqlType::Int, CqlValue::Int(age)),
        ]),
        ts,
        None,
    )
    .unwrap();
    ReaderItem::Event {
        event,
        token: LogPosition::new("CommitLog-7-1.log", pos),
    }
}

/// Finish the stream and drain the pipeline.
async fn quiesce(harness: Harness) -> (Vec<Arc<MemorySink>>, Arc<DlqWriter>, SharedMetrics) {
    let Harness {
        sinks,
        handle,
        reader_tx,
        schema_tx,
        dlq,
        metrics,
        ..
    } = harness;
    drop(reader_tx);
    drop(schema_tx);
    assert!(handle.shutdown().await, "pipeline failed to drain in time");
    (sinks, dlq, metrics)
}

#[tokio::test]
async fn test_basic_replication_all_destinations() {
    let (harness, _dir) = start().await;

    for i in 0..1000u64 {
        harness
            .reader_tx
            .send(insert_item(
                i as u128 + 1,
                &format!("u{i}@example.com"),
                i as i32 % 90,
                1_700_000_000_000_000 + i as i64,
                (i + 1) * 100,
            ))
            .await
            .unwrap();
    }
    let (sinks, dlq, metrics) = quiesce(harness).await;

    for sink in &sinks {
        assert_eq!(
            sink.row_count("ecommerce", "users").await,
            1000,
            "{} row count",
            sink.destination()
        );
        let replicated: u64 = sink
            .offsets()
            .await
            .iter()
            .map(|o| o.events_replicated_count)
            .sum();
        assert_eq!(replicated, 1000, "{} offset count", sink.destination());
        assert_eq!(metrics.processed_total(sink.destination()).await, 1000);
    }
    assert_eq!(dlq.count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_restart_replays_without_duplicates_or_loss() {
    let dir = tempfile::tempdir().unwrap();
    let sinks: Vec<Arc<MemorySink>> = Destination::ALL
        .iter()
        .map(|d| Arc::new(MemorySink::new(*d)))
        .collect();

    let items: Vec<ReaderItem> = (0..500u64)
        .map(|i| {
            insert_item(
                i as u128 + 1,
                &format!("u{i}@example.com"),
                30,
                1_700_000_000_000_000 + i as i64,
                (i + 1) * 100,
            )
        })
        .collect();

    // First run: only 250 events are acknowledged before the "crash".
    let harness = start_with(sinks.clone(), dir.path(), Arc::new(OffsetManager::new())).await;
    for item in items.iter().take(250) {
        harness.reader_tx.send(item.clone()).await.unwrap();
    }
    quiesce(harness).await;
    for sink in &sinks {
        assert_eq!(sink.row_count("ecommerce", "users").await, 250);
    }

    // Restart: recover offsets from the destinations and replay the full
    // stream from the beginning, as the reader would.
    let offsets = Arc::new(OffsetManager::new());
    for sink in &sinks {
        for offset in sink.load_offsets().await.unwrap() {
            offsets.seed(offset).await;
        }
    }
    let harness = start_with(sinks.clone(), dir.path(), offsets).await;
    for item in &items {
        harness.reader_tx.send(item.clone()).await.unwrap();
    }
    let (sinks, dlq, _) = quiesce(harness).await;

    for sink in &sinks {
        assert_eq!(
            sink.row_count("ecommerce", "users").await,
            500,
            "{}: no loss, no duplicates",
            sink.destination()
        );
        let replicated: u64 = sink
            .offsets()
            .await
            .iter()
            .map(|o| o.events_replicated_count)
            .sum();
        assert_eq!(replicated, 500, "{} offset count", sink.destination());
    }
    assert_eq!(dlq.count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_masking_applied_before_delivery() {
    let (harness, _dir) = start().await;
    harness
        .reader_tx
        .send(insert_item(7, "a@b.com", 30, 1_700_000_000_000_000, 100))
        .await
        .unwrap();
    let (sinks, _, _) = quiesce(harness).await;

    for sink in &sinks {
        let email = sink
            .column_value("ecommerce", "users", &user_pk(7), "email")
            .await
            .unwrap();
        match email {
            CqlValue::Text(digest) => {
                assert_eq!(digest.len(), 64);
                assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
                assert_ne!(digest, "a@b.com");
            }
            other => panic!("expected masked text, got {other:?}"),
        }
        assert_eq!(
            sink.column_value("ecommerce", "users", &user_pk(7), "age")
                .await,
            Some(CqlValue::Int(30))
        );
    }
}

#[tokio::test]
async fn test_intra_partition_order_latest_state_wins() {
    let (harness, _dir) = start().await;
    // one partition, fifty updates in source order
    for i in 0..50u64 {
        harness
            .reader_tx
            .send(insert_item(
                42,
                "a@b.com",
                i as i32,
                1_700_000_000_000_000 + i as i64,
                (i + 1) * 100,
            ))
            .await
            .unwrap();
    }
    let (sinks, _, _) = quiesce(harness).await;

    for sink in &sinks {
        assert_eq!(sink.row_count("ecommerce", "users").await, 1);
        assert_eq!(
            sink.column_value("ecommerce", "users", &user_pk(42), "age")
                .await,
            Some(CqlValue::Int(49))
        );
    }
}

#[tokio::test]
async fn test_add_column_schema_change_flows_through() {
    let (harness, _dir) = start().await;

    harness
        .schema_tx
        .send(SchemaChange {
            keyspace: "ecommerce".into(),
            table: "users".into(),
            old_version: 1,
            new_version: 2,
            changes: vec![ColumnChange {
                op: ChangeOp::Add,
                column: "city".into(),
                old_type: None,
                new_type: Some(CqlType::Text),
                compatibility: Compatibility::Compatible,
            }],
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let event = ChangeEvent::new(
        EventKind::Insert,
        "ecommerce",
        "users",
        user_pk(9),
        Row::new(),
        Row::from_columns(vec![
            Column::new("email", CqlType::Text, CqlValue::Text("c@d.com".into())),
            Column::new("age", CqlType::Int, CqlValue::Int(25)),
            Column::new("city", CqlType::Text, CqlValue::Text("NYC".into())),
        ]),
        1_700_000_000_000_000,
        None,
    )
    .unwrap();
    harness
        .reader_tx
        .send(ReaderItem::Event {
            event,
            token: LogPosition::new("CommitLog-7-1.log", 100),
        })
        .await
        .unwrap();
    let (sinks, dlq, _) = quiesce(harness).await;

    for sink in &sinks {
        let applied = sink.applied_schema_changes().await;
        assert_eq!(applied.len(), 1, "{} DDL applied", sink.destination());
        assert_eq!(applied[0].new_version, 2);
        assert_eq!(
            sink.column_value("ecommerce", "users", &user_pk(9), "city")
                .await,
            Some(CqlValue::Text("NYC".into()))
        );
    }
    assert_eq!(dlq.count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_incompatible_alter_dead_letters_table_others_flow() {
    let (harness, _dir) = start().await;

    harness
        .schema_tx
        .send(SchemaChange {
            keyspace: "ecommerce".into(),
            table: "users".into(),
            old_version: 1,
            new_version: 2,
            changes: vec![ColumnChange {
                op: ChangeOp::AlterType,
                column: "age".into(),
                old_type: Some(CqlType::Int),
                new_type: Some(CqlType::Text),
                compatibility: Compatibility::Incompatible,
            }],
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // users event matching the new schema: terminal for every destination
    let rejected = ChangeEvent::new(
        EventKind::Insert,
        "ecommerce",
        "users",
        user_pk(11),
        Row::new(),
        Row::from_columns(vec![
            Column::new("email", CqlType::Text, CqlValue::Text("x@y.com".into())),
            Column::new("age", CqlType::Text, CqlValue::Text("31".into())),
        ]),
        1_700_000_000_000_000,
        None,
    )
    .unwrap();
    harness
        .reader_tx
        .send(ReaderItem::Event {
            event: rejected,
            token: LogPosition::new("CommitLog-7-1.log", 100),
        })
        .await
        .unwrap();

    // a different table keeps replicating
    let orders = ChangeEvent::new(
        EventKind::Insert,
        "ecommerce",
        "orders",
        Row::from_columns(vec![Column::new(
            "order_id",
            CqlType::Uuid,
            CqlValue::Uuid(Uuid::from_u128(77)),
        )]),
        Row::new(),
        Row::from_columns(vec![Column::new(
            "total",
            CqlType::Double,
            CqlValue::Double(9.99),
        )]),
        1_700_000_000_000_001,
        None,
    )
    .unwrap();
    harness
        .reader_tx
        .send(ReaderItem::Event {
            event: orders,
            token: LogPosition::new("CommitLog-7-1.log", 200),
        })
        .await
        .unwrap();

    let (sinks, dlq, _) = quiesce(harness).await;

    let records = dlq.read_all().await.unwrap();
    assert_eq!(records.len(), sinks.len(), "one DLQ record per destination");
    for record in &records {
        assert_eq!(record.error_category, "SchemaIncompatible");
        assert!(record.error_message.contains("age"));
        assert_eq!(record.original_event.table(), "users");
    }

    for sink in &sinks {
        assert_eq!(sink.row_count("ecommerce", "users").await, 0);
        assert_eq!(sink.row_count("ecommerce", "orders").await, 1);
        // the offset moved past the dead-lettered event
        let users_offsets = sink.offsets().await;
        assert!(users_offsets
            .iter()
            .any(|o| o.key.table == "users" && o.log.position == 100));
    }
}

#[tokio::test]
async fn test_terminal_failure_dead_letters_and_advances() {
    let (harness, _dir) = start().await;
    harness.sinks[0]
        .fail_next_writes(vec![ConnectorError::PermissionDenied("revoked".into())])
        .await;

    harness
        .reader_tx
        .send(insert_item(3, "a@b.com", 30, 1_700_000_000_000_000, 100))
        .await
        .unwrap();
    let (sinks, dlq, _) = quiesce(harness).await;

    let failed = &sinks[0];
    let records = dlq.read_all().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].destination, failed.destination());
    assert_eq!(records[0].error_category, "Terminal");
    assert!(records[0].error_message.contains("revoked"));

    // failed destination: no row, but offset advanced past the event
    assert_eq!(failed.row_count("ecommerce", "users").await, 0);
    assert!(failed
        .offsets()
        .await
        .iter()
        .any(|o| o.log.position == 100));

    // healthy destinations committed normally
    for sink in &sinks[1..] {
        assert_eq!(sink.row_count("ecommerce", "users").await, 1);
    }
}

#[tokio::test]
async fn test_transient_failure_retries_to_success() {
    let (harness, _dir) = start().await;
    harness.sinks[0]
        .fail_next_writes(vec![ConnectorError::timeout("blip")])
        .await;

    harness
        .reader_tx
        .send(insert_item(5, "a@b.com", 30, 1_700_000_000_000_000, 100))
        .await
        .unwrap();
    let (sinks, dlq, metrics) = quiesce(harness).await;

    for sink in &sinks {
        assert_eq!(sink.row_count("ecommerce", "users").await, 1);
    }
    assert_eq!(dlq.count(None).await.unwrap(), 0);
    // the retry shows up in metrics, not in the destinations
    let rendered = metrics.render().await;
    assert!(rendered.contains("cdc_retry_attempts_total{destination=\"postgres\"} 1"));
}

#[tokio::test]
async fn test_slow_destination_does_not_block_others() {
    let (harness, _dir) = start().await;
    harness.sinks[1]
        .set_write_delay(Some(Duration::from_millis(150)))
        .await;

    for i in 0..40u64 {
        harness
            .reader_tx
            .send(insert_item(
                i as u128 + 1,
                &format!("u{i}@example.com"),
                30,
                1_700_000_000_000_000 + i as i64,
                (i + 1) * 100,
            ))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let fast = harness.sinks[0].row_count("ecommerce", "users").await;
    let slow = harness.sinks[1].row_count("ecommerce", "users").await;
    assert!(
        fast >= slow,
        "fast destination ({fast}) should not trail the stalled one ({slow})"
    );

    // stall ends; everything converges without loss
    harness.sinks[1].set_write_delay(None).await;
    let (sinks, dlq, _) = quiesce(harness).await;
    for sink in &sinks {
        assert_eq!(sink.row_count("ecommerce", "users").await, 40);
    }
    assert_eq!(dlq.count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unsupported_type_rejected_per_destination() {
    let (harness, _dir) = start().await;

    let event = ChangeEvent::new(
        EventKind::Insert,
        "ecommerce",
        "stats",
        Row::from_columns(vec![Column::new(
            "stat_id",
            CqlType::Uuid,
            CqlValue::Uuid(Uuid::from_u128(1)),
        )]),
        Row::new(),
        Row::from_columns(vec![Column::new(
            "visits",
            CqlType::Counter,
            CqlValue::Counter(12),
        )]),
        1_700_000_000_000_000,
        None,
    )
    .unwrap();
    harness
        .reader_tx
        .send(ReaderItem::Event {
            event,
            token: LogPosition::new("CommitLog-7-1.log", 100),
        })
        .await
        .unwrap();
    let (sinks, dlq, _) = quiesce(harness).await;

    let records = dlq.read_all().await.unwrap();
    assert_eq!(records.len(), sinks.len());
    for record in &records {
        assert_eq!(record.error_category, "SchemaIncompatible");
        assert!(record.error_message.contains("visits"));
    }
}
