//! Query Engine Integration Tests
//!
//! Runs whole statements against an in-memory segment store and checks what
//! arrives at the result sink:
//! - TAIL, LAST, ORDER BY and LIMIT over merged partitions
//! - GROUP BY with COUNT and SUM, numeric keys merged by value
//! - Windowed JOIN on JSON fields
//! - Guardrail and configuration rejections, source failures reported to
//!   the client
//! - Cancellation and closed clients

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use segql_core::{InMemorySegmentStore, Record, SegmentDecoder, SegmentLister, SegmentRef};
use segql_query::{
    AggregateFunc, ChannelSink, Column, ColumnRef, CompareOp, Expr, QueryConfig, QueryEngine,
    SelectStatement, SinkMessage, SqlError, TableRef,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn test_config() -> QueryConfig {
    QueryConfig {
        default_limit: 1000,
        max_unbounded: 10_000,
        require_time_bound: true,
    }
}

fn engine(store: Arc<InMemorySegmentStore>) -> QueryEngine {
    QueryEngine::new(
        test_config(),
        Arc::clone(&store) as Arc<dyn SegmentLister>,
        store as Arc<dyn SegmentDecoder>,
    )
}

fn value_path(qualifier: Option<&str>, path: &str) -> Expr {
    Expr::json_value(
        ColumnRef {
            qualifier: qualifier.map(str::to_string),
            column: Column::Value,
        },
        path,
    )
}

/// Drain everything the sink produced.
fn drain(rx: &mut mpsc::Receiver<SinkMessage>) -> Vec<SinkMessage> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

fn data_rows(messages: &[SinkMessage]) -> Vec<Vec<Option<String>>> {
    messages
        .iter()
        .filter_map(|m| match m {
            SinkMessage::DataRow(row) => Some(row.clone()),
            _ => None,
        })
        .collect()
}

fn text(s: &str) -> Option<String> {
    Some(s.to_string())
}

async fn add(store: &InMemorySegmentStore, topic: &str, partition: u32, key: &str, records: Vec<Record>) {
    store
        .add_segment(
            SegmentRef::new(topic, partition, key, format!("{}.idx", key)),
            records,
        )
        .await;
}

/// TAIL 2 over offsets 1..=3 keeps the last two
#[tokio::test]
async fn test_tail_returns_most_recent_records() {
    let store = Arc::new(InMemorySegmentStore::new());
    let ts = now_ms();
    add(
        &store,
        "orders",
        0,
        "orders-0-0",
        vec![
            Record::new("orders", 0, 1, ts),
            Record::new("orders", 0, 2, ts),
            Record::new("orders", 0, 3, ts),
        ],
    )
    .await;

    let stmt = SelectStatement::from_topic("orders")
        .project(Expr::column(Column::Offset))
        .tail(2);

    let (mut sink, mut rx) = ChannelSink::new(64);
    let rows = engine(store)
        .execute_select(&CancellationToken::new(), &mut sink, &stmt)
        .await
        .unwrap();
    assert_eq!(rows, 2);

    let messages = drain(&mut rx);
    assert!(matches!(messages.first(), Some(SinkMessage::RowDescription(cols)) if cols[0].name == "_offset"));
    assert_eq!(data_rows(&messages), vec![vec![text("2")], vec![text("3")]]);
    assert_eq!(
        messages.last(),
        Some(&SinkMessage::CommandComplete("SELECT 2".to_string()))
    );
}

#[tokio::test]
async fn test_order_by_timestamp_desc_limit_one() {
    let store = Arc::new(InMemorySegmentStore::new());
    let ts = now_ms();
    add(
        &store,
        "orders",
        0,
        "orders-0-10",
        vec![
            Record::new("orders", 0, 10, ts - 2_000),
            Record::new("orders", 0, 11, ts - 1_000),
        ],
    )
    .await;

    let stmt = SelectStatement::from_topic("orders")
        .project(Expr::column(Column::Offset))
        .order_by(Expr::column(Column::Timestamp), true)
        .limit(1)
        .last(Duration::from_secs(3600));

    let (mut sink, mut rx) = ChannelSink::new(64);
    engine(store)
        .execute_select(&CancellationToken::new(), &mut sink, &stmt)
        .await
        .unwrap();

    assert_eq!(data_rows(&drain(&mut rx)), vec![vec![text("11")]]);
}

#[tokio::test]
async fn test_group_by_partition_count_and_sum() {
    let store = Arc::new(InMemorySegmentStore::new());
    let ts = now_ms();
    add(
        &store,
        "orders",
        0,
        "orders-0-1",
        vec![Record::new("orders", 0, 1, ts), Record::new("orders", 0, 2, ts)],
    )
    .await;
    add(&store, "orders", 1, "orders-1-3", vec![Record::new("orders", 1, 3, ts)]).await;

    let stmt = SelectStatement::from_topic("orders")
        .project(Expr::column(Column::Partition))
        .project_as(Expr::count_star(), "total")
        .project_as(
            Expr::aggregate(AggregateFunc::Sum, Expr::column(Column::Offset)),
            "sum_offset",
        )
        .group_by(Expr::column(Column::Partition))
        .last(Duration::from_secs(3600));

    let (mut sink, mut rx) = ChannelSink::new(64);
    engine(store)
        .execute_select(&CancellationToken::new(), &mut sink, &stmt)
        .await
        .unwrap();

    let messages = drain(&mut rx);
    match &messages[0] {
        SinkMessage::RowDescription(cols) => {
            let names: Vec<_> = cols.iter().map(|c| c.name.as_str()).collect();
            assert_eq!(names, vec!["_partition", "total", "sum_offset"]);
        }
        other => panic!("expected row description, got {:?}", other),
    }
    assert_eq!(
        data_rows(&messages),
        vec![
            vec![text("0"), text("2"), text("3")],
            vec![text("1"), text("1"), text("3")],
        ]
    );
}

/// `{"k":1}` and `{"k":1.0}` are the same group key
#[tokio::test]
async fn test_group_by_merges_numerically_equal_keys() {
    let store = Arc::new(InMemorySegmentStore::new());
    let ts = now_ms();
    add(
        &store,
        "events",
        0,
        "events-0-0",
        vec![
            Record::new("events", 0, 0, ts).with_value(r#"{"k":1}"#),
            Record::new("events", 0, 1, ts).with_value(r#"{"k":1.0}"#),
        ],
    )
    .await;

    let stmt = SelectStatement::from_topic("events")
        .project(value_path(None, "$.k"))
        .project(Expr::count_star())
        .group_by(value_path(None, "$.k"))
        .last(Duration::from_secs(60));

    let (mut sink, mut rx) = ChannelSink::new(64);
    let rows = engine(store)
        .execute_select(&CancellationToken::new(), &mut sink, &stmt)
        .await
        .unwrap();
    assert_eq!(rows, 1);

    let messages = drain(&mut rx);
    assert_eq!(data_rows(&messages), vec![vec![text("1"), text("2")]]);
    assert_eq!(
        messages.last(),
        Some(&SinkMessage::CommandComplete("SELECT 1".to_string()))
    );
}

#[tokio::test]
async fn test_join_within_window() {
    let store = Arc::new(InMemorySegmentStore::new());
    let ts = now_ms();
    add(
        &store,
        "orders",
        0,
        "orders-0-0",
        vec![
            Record::new("orders", 0, 0, ts - 60_000).with_value(r#"{"id":"a"}"#),
            Record::new("orders", 0, 1, ts - 60_000).with_value(r#"{"id":"late"}"#),
        ],
    )
    .await;
    add(
        &store,
        "payments",
        0,
        "payments-0-0",
        vec![
            Record::new("payments", 0, 0, ts - 30_000).with_value(r#"{"id":"a"}"#),
            Record::new("payments", 0, 1, ts - 30_000).with_value(r#"{"id":"b"}"#),
            Record::new("payments", 0, 2, ts).with_value(r#"{"id":"late"}"#),
        ],
    )
    .await;
    // Twenty minutes before the "late" payment, so outside WITHIN 10m.
    add(
        &store,
        "orders",
        1,
        "orders-1-0",
        vec![Record::new("orders", 1, 0, ts - 20 * 60_000).with_value(r#"{"id":"late"}"#)],
    )
    .await;

    let stmt = SelectStatement::from_table(TableRef::aliased("orders", "o"))
        .project(Expr::qualified("o", Column::Offset))
        .project(Expr::qualified("p", Column::Offset))
        .join(
            TableRef::aliased("payments", "p"),
            value_path(Some("o"), "$.id"),
            value_path(Some("p"), "$.id"),
            Duration::from_secs(600),
        )
        .last(Duration::from_secs(3600));

    let (mut sink, mut rx) = ChannelSink::new(64);
    engine(store)
        .execute_select(&CancellationToken::new(), &mut sink, &stmt)
        .await
        .unwrap();

    let rows = data_rows(&drain(&mut rx));
    assert_eq!(
        rows,
        vec![vec![text("0"), text("0")], vec![text("1"), text("2")]]
    );
}

#[tokio::test]
async fn test_join_with_malformed_payloads_yields_no_rows() {
    let store = Arc::new(InMemorySegmentStore::new());
    let ts = now_ms();
    add(
        &store,
        "orders",
        0,
        "orders-0-0",
        vec![Record::new("orders", 0, 0, ts).with_value("not json")],
    )
    .await;
    add(
        &store,
        "payments",
        0,
        "payments-0-0",
        vec![Record::new("payments", 0, 0, ts).with_value(r#"{"id":"a"}"#)],
    )
    .await;

    let stmt = SelectStatement::from_table(TableRef::aliased("orders", "o"))
        .project(Expr::qualified("o", Column::Offset))
        .join(
            TableRef::aliased("payments", "p"),
            value_path(Some("o"), "$.id"),
            value_path(Some("p"), "$.id"),
            Duration::from_secs(600),
        )
        .last(Duration::from_secs(3600));

    let (mut sink, mut rx) = ChannelSink::new(64);
    let rows = engine(store)
        .execute_select(&CancellationToken::new(), &mut sink, &stmt)
        .await
        .unwrap();
    assert_eq!(rows, 0);

    let messages = drain(&mut rx);
    assert!(data_rows(&messages).is_empty());
    assert_eq!(
        messages.last(),
        Some(&SinkMessage::CommandComplete("SELECT 0".to_string()))
    );
}

#[tokio::test]
async fn test_last_window_excludes_old_records() {
    let store = Arc::new(InMemorySegmentStore::new());
    let ts = now_ms();
    add(
        &store,
        "orders",
        0,
        "orders-0-0",
        vec![
            Record::new("orders", 0, 0, ts - 2 * 3_600_000),
            Record::new("orders", 0, 1, ts - 60_000),
        ],
    )
    .await;

    let stmt = SelectStatement::from_topic("orders")
        .project(Expr::column(Column::Offset))
        .last(Duration::from_secs(3600));

    let (mut sink, mut rx) = ChannelSink::new(64);
    engine(store)
        .execute_select(&CancellationToken::new(), &mut sink, &stmt)
        .await
        .unwrap();

    assert_eq!(data_rows(&drain(&mut rx)), vec![vec![text("1")]]);
}

#[tokio::test]
async fn test_where_filter_on_json_field() {
    let store = Arc::new(InMemorySegmentStore::new());
    let ts = now_ms();
    add(
        &store,
        "orders",
        0,
        "orders-0-0",
        vec![
            Record::new("orders", 0, 0, ts).with_value(r#"{"amount":50}"#),
            Record::new("orders", 0, 1, ts).with_value(r#"{"amount":150}"#),
            Record::new("orders", 0, 2, ts).with_value("garbage"),
            Record::new("orders", 0, 3, ts),
        ],
    )
    .await;

    let stmt = SelectStatement::from_topic("orders")
        .project(Expr::column(Column::Offset))
        .project_as(value_path(None, "$.amount"), "amount")
        .filter(value_path(None, "$.amount"), CompareOp::Gt, serde_json::json!(100))
        .tail(10);

    let (mut sink, mut rx) = ChannelSink::new(64);
    engine(store)
        .execute_select(&CancellationToken::new(), &mut sink, &stmt)
        .await
        .unwrap();

    assert_eq!(
        data_rows(&drain(&mut rx)),
        vec![vec![text("1"), text("150")]]
    );
}

#[tokio::test]
async fn test_unbounded_query_rejected_by_guardrail() {
    let store = Arc::new(InMemorySegmentStore::new());
    add(&store, "orders", 0, "orders-0-0", vec![Record::new("orders", 0, 0, now_ms())]).await;

    let stmt = SelectStatement::from_topic("orders").project(Expr::column(Column::Offset));

    let (mut sink, mut rx) = ChannelSink::new(64);
    let err = engine(store)
        .execute_select(&CancellationToken::new(), &mut sink, &stmt)
        .await
        .unwrap_err();
    assert!(matches!(err, SqlError::Guardrail(_)));

    let messages = drain(&mut rx);
    assert_eq!(messages.len(), 1, "only the error is reported: {:?}", messages);
    match &messages[0] {
        SinkMessage::Error { code, .. } => assert_eq!(code, "54000"),
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unbounded_query_allowed_when_time_bound_optional() {
    let store = Arc::new(InMemorySegmentStore::new());
    add(
        &store,
        "orders",
        0,
        "orders-0-0",
        vec![Record::new("orders", 0, 0, 0), Record::new("orders", 0, 1, 0)],
    )
    .await;

    let config = QueryConfig {
        require_time_bound: false,
        ..test_config()
    };
    let engine = QueryEngine::new(
        config,
        Arc::clone(&store) as Arc<dyn SegmentLister>,
        store as Arc<dyn SegmentDecoder>,
    );
    let stmt = SelectStatement::from_topic("orders").project(Expr::column(Column::Offset));

    let (mut sink, _rx) = ChannelSink::new(64);
    let rows = engine
        .execute_select(&CancellationToken::new(), &mut sink, &stmt)
        .await
        .unwrap();
    assert_eq!(rows, 2);

    let (mut sink, _rx) = ChannelSink::new(64);
    let err = engine
        .execute_select(&CancellationToken::new(), &mut sink, &stmt.clone().limit(10_001))
        .await
        .unwrap_err();
    assert!(matches!(err, SqlError::Guardrail(_)));
}

#[tokio::test]
async fn test_empty_topic_still_describes_and_completes() {
    let store = Arc::new(InMemorySegmentStore::new());
    let stmt = SelectStatement::from_topic("orders")
        .project(Expr::column(Column::Offset))
        .tail(5);

    let (mut sink, mut rx) = ChannelSink::new(64);
    let rows = engine(store)
        .execute_select(&CancellationToken::new(), &mut sink, &stmt)
        .await
        .unwrap();
    assert_eq!(rows, 0);

    let messages = drain(&mut rx);
    assert_eq!(messages.len(), 2);
    assert!(matches!(messages[0], SinkMessage::RowDescription(_)));
    assert_eq!(messages[1], SinkMessage::CommandComplete("SELECT 0".to_string()));
}

struct FailingDecoder;

#[async_trait]
impl SegmentDecoder for FailingDecoder {
    async fn decode(
        &self,
        segment_key: &str,
        _index_key: &str,
        _topic: &str,
        _partition: u32,
    ) -> segql_core::Result<Vec<Record>> {
        Err(segql_core::Error::Decode {
            segment: segment_key.to_string(),
            message: "truncated index".to_string(),
        })
    }
}

#[tokio::test]
async fn test_decode_failure_is_reported() {
    let store = Arc::new(InMemorySegmentStore::new());
    add(&store, "orders", 0, "orders-0-0", vec![]).await;

    let engine = QueryEngine::new(
        test_config(),
        store as Arc<dyn SegmentLister>,
        Arc::new(FailingDecoder),
    );
    let stmt = SelectStatement::from_topic("orders")
        .project(Expr::column(Column::Offset))
        .tail(5);

    let (mut sink, mut rx) = ChannelSink::new(64);
    let err = engine
        .execute_select(&CancellationToken::new(), &mut sink, &stmt)
        .await
        .unwrap_err();
    assert!(matches!(err, SqlError::Resolution(_)));

    let messages = drain(&mut rx);
    match messages.as_slice() {
        [SinkMessage::Error { code, message }] => {
            assert_eq!(code, "58030");
            assert!(message.contains("orders-0-0"));
        }
        other => panic!("expected a single error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cancelled_query_writes_nothing() {
    let store = Arc::new(InMemorySegmentStore::new());
    add(&store, "orders", 0, "orders-0-0", vec![Record::new("orders", 0, 0, now_ms())]).await;

    let cancel = CancellationToken::new();
    cancel.cancel();

    let stmt = SelectStatement::from_topic("orders")
        .project(Expr::column(Column::Offset))
        .tail(5);
    let (mut sink, mut rx) = ChannelSink::new(64);
    let err = engine(store)
        .execute_select(&cancel, &mut sink, &stmt)
        .await
        .unwrap_err();
    assert!(matches!(err, SqlError::Cancelled));
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_closed_client_aborts_query() {
    let store = Arc::new(InMemorySegmentStore::new());
    add(&store, "orders", 0, "orders-0-0", vec![Record::new("orders", 0, 0, now_ms())]).await;

    let stmt = SelectStatement::from_topic("orders")
        .project(Expr::column(Column::Offset))
        .tail(5);
    let (mut sink, rx) = ChannelSink::new(64);
    drop(rx);

    let err = engine(store)
        .execute_select(&CancellationToken::new(), &mut sink, &stmt)
        .await
        .unwrap_err();
    assert!(matches!(err, SqlError::Sink(_)));
}

#[tokio::test]
async fn test_invalid_query_reported() {
    let store = Arc::new(InMemorySegmentStore::new());
    let stmt = SelectStatement::from_topic("orders")
        .project(Expr::qualified("missing", Column::Offset))
        .tail(5);

    let (mut sink, mut rx) = ChannelSink::new(64);
    let err = engine(store)
        .execute_select(&CancellationToken::new(), &mut sink, &stmt)
        .await
        .unwrap_err();
    assert!(matches!(err, SqlError::InvalidQuery(_)));
    assert!(matches!(
        drain(&mut rx).as_slice(),
        [SinkMessage::Error { code, .. }] if code == "42000"
    ));
}

#[tokio::test]
async fn test_invalid_guardrail_config_is_reported() {
    let store = Arc::new(InMemorySegmentStore::new());
    add(&store, "orders", 0, "orders-0-0", vec![Record::new("orders", 0, 0, now_ms())]).await;

    let engine = QueryEngine::new(
        QueryConfig {
            default_limit: 0,
            max_unbounded: 0,
            require_time_bound: false,
        },
        Arc::clone(&store) as Arc<dyn SegmentLister>,
        store as Arc<dyn SegmentDecoder>,
    );
    let stmt = SelectStatement::from_topic("orders").project(Expr::column(Column::Offset));

    let (mut sink, mut rx) = ChannelSink::new(64);
    let err = engine
        .execute_select(&CancellationToken::new(), &mut sink, &stmt)
        .await
        .unwrap_err();
    assert!(matches!(err, SqlError::Config(_)));
    assert!(matches!(
        drain(&mut rx).as_slice(),
        [SinkMessage::Error { code, .. }] if code == "F0000"
    ));
}
