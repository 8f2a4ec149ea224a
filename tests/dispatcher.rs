//! Dispatcher lifecycle and dispatch tests
//!
//! These drive a dispatcher through the in-memory mock connection, so they
//! need neither docker nor a MySQL server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use binlog_core::{RawBinlogEvent, RawEventData, RawRows, RawRowsEvent};
use binlog_triggers::testing::{
    delete_event, insert_event, rotate_event, update_event, MockConnection, MockHandle, TestTable,
};
use binlog_triggers::{
    handler_fn, DispatchError, Dispatcher, DispatcherSignal, DispatcherState, EventType,
    NormalizedEvent, Row, RowValue, Statement, TriggerError, TriggerHandler,
};
use tokio::sync::{broadcast, mpsc, Notify};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter("binlog_triggers=debug")
        .try_init()
        .ok();
}

struct Harness {
    dispatcher: Dispatcher<MockConnection>,
    handle: MockHandle,
    signals: broadcast::Receiver<DispatcherSignal>,
}

fn harness() -> Harness {
    init_logging();
    let (connection, handle) = MockConnection::new();
    let dispatcher = Dispatcher::new(connection);
    let signals = dispatcher.subscribe();
    Harness {
        dispatcher,
        handle,
        signals,
    }
}

/// Handler forwarding every event it receives.
fn recorder() -> (
    impl TriggerHandler,
    mpsc::UnboundedReceiver<Arc<NormalizedEvent>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event);
            Ok::<_, anyhow::Error>(())
        }
    });
    (handler, rx)
}

fn users() -> TestTable {
    TestTable::new(42, "app", "users")
}

fn user(id: i64, name: &str, email: &str) -> Row {
    Row::new()
        .with("id", id)
        .with("name", name)
        .with("email", email)
}

async fn next_signal(signals: &mut broadcast::Receiver<DispatcherSignal>) -> DispatcherSignal {
    tokio::time::timeout(WAIT, signals.recv())
        .await
        .expect("timed out waiting for a signal")
        .expect("signal channel closed")
}

/// Skip signals until one with `name` arrives.
async fn wait_for_signal(
    signals: &mut broadcast::Receiver<DispatcherSignal>,
    name: &str,
) -> DispatcherSignal {
    loop {
        let signal = next_signal(signals).await;
        if signal.name() == name {
            return signal;
        }
    }
}

async fn assert_no_signal(signals: &mut broadcast::Receiver<DispatcherSignal>) {
    if let Ok(signal) = tokio::time::timeout(QUIET, signals.recv()).await {
        panic!("unexpected signal: {signal:?}");
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Arc<NormalizedEvent>>) -> Arc<NormalizedEvent> {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a trigger call")
        .expect("trigger channel closed")
}

async fn assert_no_event(rx: &mut mpsc::UnboundedReceiver<Arc<NormalizedEvent>>) {
    if let Ok(Some(event)) = tokio::time::timeout(QUIET, rx.recv()).await {
        panic!("unexpected trigger call: {event:?}");
    }
}

#[tokio::test]
async fn test_lifecycle_signals() -> Result<(), Box<dyn std::error::Error>> {
    let mut h = harness();
    assert_eq!(h.dispatcher.state(), DispatcherState::Stopped);
    assert!(!h.dispatcher.is_started());

    h.dispatcher.start().await?;
    assert_eq!(next_signal(&mut h.signals).await.name(), DispatcherSignal::STARTED);
    assert!(h.dispatcher.is_started());
    assert!(h.handle.is_connected());
    assert!(h.handle.is_feed_running());

    h.dispatcher.pause().await;
    assert_eq!(next_signal(&mut h.signals).await.name(), DispatcherSignal::PAUSED);
    assert!(h.dispatcher.is_paused());
    assert!(h.dispatcher.is_started());
    assert!(h.handle.is_paused());

    h.dispatcher.resume().await;
    assert_eq!(next_signal(&mut h.signals).await.name(), DispatcherSignal::RESUMED);
    assert!(!h.dispatcher.is_paused());
    assert!(!h.handle.is_paused());

    h.dispatcher.stop().await?;
    assert_eq!(next_signal(&mut h.signals).await.name(), DispatcherSignal::STOPPED);
    assert_eq!(h.dispatcher.state(), DispatcherState::Stopped);
    assert!(!h.handle.is_connected());
    assert!(!h.handle.is_feed_running());
    assert_eq!(h.handle.end_count(), 1);

    Ok(())
}

#[tokio::test]
async fn test_lifecycle_noops() -> Result<(), Box<dyn std::error::Error>> {
    let mut h = harness();

    // Nothing happens while stopped
    h.dispatcher.pause().await;
    h.dispatcher.resume().await;
    h.dispatcher.stop().await?;
    assert_no_signal(&mut h.signals).await;
    assert_eq!(h.handle.end_count(), 0);

    h.dispatcher.start().await?;
    h.dispatcher.start().await?;
    assert_eq!(next_signal(&mut h.signals).await.name(), DispatcherSignal::STARTED);
    assert_eq!(h.handle.connect_count(), 1);

    // Resume only acts when paused, pause only when started
    h.dispatcher.resume().await;
    h.dispatcher.pause().await;
    h.dispatcher.pause().await;
    assert_eq!(next_signal(&mut h.signals).await.name(), DispatcherSignal::PAUSED);

    // Starting a paused dispatcher does nothing either
    h.dispatcher.start().await?;
    assert_no_signal(&mut h.signals).await;

    // Stop works from paused
    h.dispatcher.stop().await?;
    assert_eq!(next_signal(&mut h.signals).await.name(), DispatcherSignal::STOPPED);
    assert!(!h.dispatcher.is_paused());

    Ok(())
}

#[tokio::test]
async fn test_restart_after_stop() -> Result<(), Box<dyn std::error::Error>> {
    let mut h = harness();
    let (handler, mut calls) = recorder();
    h.dispatcher
        .add_trigger("users", "app.users", Statement::Insert, handler)?;

    h.dispatcher.start().await?;
    h.dispatcher.stop().await?;
    h.dispatcher.start().await?;
    assert_eq!(h.handle.connect_count(), 2);

    h.handle
        .send(insert_event(&users(), vec![user(1, "ada", "ada@example.com")]))
        .await?;
    let event = next_event(&mut calls).await;
    assert_eq!(event.event_type, EventType::Insert);

    let names: Vec<_> = [
        next_signal(&mut h.signals).await,
        next_signal(&mut h.signals).await,
        next_signal(&mut h.signals).await,
    ]
    .iter()
    .map(|s| s.name())
    .collect();
    assert_eq!(
        names,
        vec![
            DispatcherSignal::STARTED,
            DispatcherSignal::STOPPED,
            DispatcherSignal::STARTED
        ]
    );

    h.dispatcher.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_insert_reaches_trigger() -> Result<(), Box<dyn std::error::Error>> {
    let mut h = harness();
    let (handler, mut calls) = recorder();
    h.dispatcher
        .add_trigger("new-users", "app.users", Statement::Insert, handler)?;
    h.dispatcher.start().await?;

    let row = Row::new().with("id", 1i64).with("name", "ada");
    h.handle.send(insert_event(&users(), vec![row.clone()])).await?;

    let event = next_event(&mut calls).await;
    assert_eq!(event.event_type, EventType::Insert);
    assert_eq!(event.schema, "app");
    assert_eq!(event.table, "users");
    assert_eq!(event.affected_rows.len(), 1);
    assert!(event.affected_rows[0].before.is_none());
    assert_eq!(event.affected_rows[0].after.as_ref(), Some(&row));
    assert_eq!(event.affected_columns, vec!["id", "name"]);

    // Every raw event is announced before dispatch
    wait_for_signal(&mut h.signals, DispatcherSignal::BINLOG).await;
    assert_no_event(&mut calls).await;

    h.dispatcher.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_statement_and_table_filtering() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness();
    let (deletes, mut delete_calls) = recorder();
    let (everything, mut all_calls) = recorder();
    h.dispatcher
        .add_trigger("deletes", "app.users", Statement::Delete, deletes)?;
    h.dispatcher
        .add_trigger("everything", "*", Statement::All, everything)?;
    h.dispatcher.start().await?;

    let orders = TestTable::new(7, "shop", "orders");
    h.handle
        .send(insert_event(&orders, vec![Row::new().with("id", 10i64)]))
        .await?;
    h.handle
        .send(delete_event(&users(), vec![user(1, "ada", "ada@example.com")]))
        .await?;

    // Trigger tasks run concurrently, so compare without order
    let mut seen = vec![
        next_event(&mut all_calls).await,
        next_event(&mut all_calls).await,
    ]
    .iter()
    .map(|e| format!("{} {}.{}", e.event_type, e.schema, e.table))
    .collect::<Vec<_>>();
    seen.sort();
    assert_eq!(seen, vec!["DELETE app.users", "INSERT shop.orders"]);

    let deleted = next_event(&mut delete_calls).await;
    assert_eq!(deleted.table, "users");
    assert!(deleted.affected_rows[0].after.is_none());
    assert_no_event(&mut delete_calls).await;

    h.dispatcher.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_column_filter() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness();
    let (handler, mut calls) = recorder();
    h.dispatcher
        .add_trigger("email-changed", "app.users.email", Statement::All, handler)?;
    h.dispatcher.start().await?;

    // Only the id changes
    h.handle
        .send(update_event(
            &users(),
            vec![(
                user(1, "ada", "ada@example.com"),
                user(2, "ada", "ada@example.com"),
            )],
        ))
        .await?;
    assert_no_event(&mut calls).await;

    // Neither do inserts or deletes on another table
    h.handle
        .send(insert_event(
            &TestTable::new(7, "app", "orders"),
            vec![Row::new().with("email", "ada@example.com")],
        ))
        .await?;
    assert_no_event(&mut calls).await;

    h.handle
        .send(update_event(
            &users(),
            vec![(
                user(1, "ada", "ada@example.com"),
                user(1, "ada", "ada@lovelace.dev"),
            )],
        ))
        .await?;
    let event = next_event(&mut calls).await;
    assert_eq!(event.affected_columns, vec!["email"]);
    let delta = &event.affected_rows[0];
    assert_eq!(
        delta.before.as_ref().and_then(|r| r.get("email")),
        Some(&RowValue::from("ada@example.com"))
    );
    assert_eq!(
        delta.after.as_ref().and_then(|r| r.get("email")),
        Some(&RowValue::from("ada@lovelace.dev"))
    );

    h.dispatcher.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_slow_trigger_does_not_hold_up_later_events() -> Result<(), Box<dyn std::error::Error>>
{
    let h = harness();
    let release = Arc::new(Notify::new());
    let (finished_tx, mut finished_rx) = mpsc::unbounded_channel();

    let gate = Arc::clone(&release);
    h.dispatcher.add_trigger(
        "slow",
        "app.users",
        Statement::Insert,
        handler_fn(move |event| {
            let gate = Arc::clone(&gate);
            let finished_tx = finished_tx.clone();
            async move {
                let id = event.affected_rows[0]
                    .after
                    .as_ref()
                    .and_then(|row| row.get("id"))
                    .and_then(RowValue::as_i64);
                if id == Some(1) {
                    gate.notified().await;
                }
                let _ = finished_tx.send(id);
                Ok::<_, anyhow::Error>(())
            }
        }),
    )?;
    let (fast, mut fast_calls) = recorder();
    h.dispatcher
        .add_trigger("fast", "app.users", Statement::Insert, fast)?;
    h.dispatcher.start().await?;

    h.handle
        .send(insert_event(&users(), vec![user(1, "ada", "ada@example.com")]))
        .await?;
    h.handle
        .send(insert_event(&users(), vec![user(2, "grace", "grace@example.com")]))
        .await?;

    // Event 2 reaches the fast trigger while the slow one still holds event 1
    let mut ids = Vec::new();
    for _ in 0..2 {
        let event = next_event(&mut fast_calls).await;
        ids.push(
            event.affected_rows[0]
                .after
                .as_ref()
                .and_then(|row| row.get("id"))
                .and_then(RowValue::as_i64),
        );
    }
    ids.sort();
    assert_eq!(ids, vec![Some(1), Some(2)]);

    let first_finished = tokio::time::timeout(WAIT, finished_rx.recv())
        .await?
        .expect("slow trigger channel closed");
    assert_eq!(first_finished, Some(2));

    release.notify_one();
    let second_finished = tokio::time::timeout(WAIT, finished_rx.recv())
        .await?
        .expect("slow trigger channel closed");
    assert_eq!(second_finished, Some(1));

    h.dispatcher.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_drop_releases_feed() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness();
    h.dispatcher.start().await?;
    assert!(h.handle.is_feed_running());

    drop(h.dispatcher);
    assert!(!h.handle.is_feed_running());
    Ok(())
}

#[tokio::test]
async fn test_failing_trigger_is_isolated() -> Result<(), Box<dyn std::error::Error>> {
    let mut h = harness();
    let (handler, mut calls) = recorder();
    h.dispatcher.add_trigger(
        "broken",
        "app",
        Statement::All,
        handler_fn(|_event| async { Err(anyhow::anyhow!("webhook unreachable")) }),
    )?;
    h.dispatcher.add_trigger(
        "panicky",
        "app.users",
        Statement::All,
        handler_fn(|event| async move {
            if event.table == "users" {
                panic!("unexpected row");
            }
            Ok::<_, anyhow::Error>(())
        }),
    )?;
    h.dispatcher
        .add_trigger("healthy", "app.users", Statement::Insert, handler)?;
    h.dispatcher.start().await?;

    h.handle
        .send(insert_event(&users(), vec![user(1, "ada", "ada@example.com")]))
        .await?;
    next_event(&mut calls).await;

    let mut failures = HashMap::new();
    for _ in 0..2 {
        if let DispatcherSignal::TriggerError { trigger, error } =
            wait_for_signal(&mut h.signals, DispatcherSignal::TRIGGER_ERROR).await
        {
            failures.insert(trigger.name.clone(), format!("{error:#}"));
        }
    }
    assert_eq!(failures["broken"], "webhook unreachable");
    assert!(failures["panicky"].contains("unexpected row"));

    // The dispatcher keeps going
    h.handle
        .send(insert_event(&users(), vec![user(2, "grace", "grace@example.com")]))
        .await?;
    let event = next_event(&mut calls).await;
    assert_eq!(
        event.affected_rows[0].after.as_ref().and_then(|r| r.get("id")),
        Some(&RowValue::Int(2))
    );

    h.dispatcher.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_events_dropped_while_paused() -> Result<(), Box<dyn std::error::Error>> {
    let mut h = harness();
    let (handler, mut calls) = recorder();
    h.dispatcher
        .add_trigger("users", "app.users", Statement::All, handler)?;
    h.dispatcher.start().await?;
    h.dispatcher.pause().await;

    h.handle
        .send(insert_event(&users(), vec![user(1, "ada", "ada@example.com")]))
        .await?;
    assert_no_event(&mut calls).await;

    h.dispatcher.resume().await;
    h.handle
        .send(insert_event(&users(), vec![user(2, "grace", "grace@example.com")]))
        .await?;
    let event = next_event(&mut calls).await;
    assert_eq!(
        event.affected_rows[0].after.as_ref().and_then(|r| r.get("id")),
        Some(&RowValue::Int(2))
    );

    let names: Vec<_> = [
        next_signal(&mut h.signals).await,
        next_signal(&mut h.signals).await,
        next_signal(&mut h.signals).await,
        next_signal(&mut h.signals).await,
    ]
    .iter()
    .map(|s| s.name())
    .collect();
    assert_eq!(
        names,
        vec![
            DispatcherSignal::STARTED,
            DispatcherSignal::PAUSED,
            DispatcherSignal::RESUMED,
            DispatcherSignal::BINLOG
        ]
    );

    h.dispatcher.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_rotate_tags_binlog_name() -> Result<(), Box<dyn std::error::Error>> {
    let mut h = harness();
    let (handler, mut calls) = recorder();
    h.dispatcher
        .add_trigger("users", "app.users", Statement::All, handler)?;
    h.dispatcher.start().await?;

    h.handle.send(rotate_event("mysql-bin.000007", 4)).await?;
    h.handle
        .send(insert_event(&users(), vec![user(1, "ada", "ada@example.com")]))
        .await?;

    let event = next_event(&mut calls).await;
    assert_eq!(event.binlog_name.as_deref(), Some("mysql-bin.000007"));

    let DispatcherSignal::Binlog(rotate) =
        wait_for_signal(&mut h.signals, DispatcherSignal::BINLOG).await
    else {
        unreachable!()
    };
    assert_eq!(rotate.event_name(), "rotate");
    assert_eq!(rotate.binlog_name.as_deref(), Some("mysql-bin.000007"));

    // Rotate events never reach triggers
    assert_no_event(&mut calls).await;

    h.dispatcher.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_unknown_table_reports_feed_error() -> Result<(), Box<dyn std::error::Error>> {
    let mut h = harness();
    let (handler, mut calls) = recorder();
    h.dispatcher.add_trigger("all", "*", Statement::All, handler)?;
    h.dispatcher.start().await?;

    let orphan = RawBinlogEvent::new(
        0,
        0,
        RawEventData::Rows(RawRowsEvent {
            table_id: 99,
            table_map: HashMap::new(),
            rows: RawRows::Write(vec![Row::new().with("id", 1i64)]),
        }),
    );
    h.handle.send(orphan).await?;

    let DispatcherSignal::FeedError(error) =
        wait_for_signal(&mut h.signals, DispatcherSignal::FEED_ERROR).await
    else {
        unreachable!()
    };
    assert!(error.to_string().contains("99"));
    assert_no_event(&mut calls).await;

    // Later events are still dispatched
    h.handle
        .send(insert_event(&users(), vec![user(1, "ada", "ada@example.com")]))
        .await?;
    next_event(&mut calls).await;

    h.dispatcher.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_upstream_errors_are_forwarded() -> Result<(), Box<dyn std::error::Error>> {
    let mut h = harness();
    h.dispatcher.start().await?;

    h.handle.send_feed_error("bad row image").await?;
    h.handle.send_connection_error("server has gone away").await?;

    let feed = wait_for_signal(&mut h.signals, DispatcherSignal::FEED_ERROR).await;
    assert_eq!(feed.to_string(), "feedError: bad row image");
    let connection = next_signal(&mut h.signals).await;
    assert_eq!(connection.to_string(), "connectionError: server has gone away");
    assert!(connection.is_error());

    // Errors do not change the lifecycle
    assert_eq!(h.dispatcher.state(), DispatcherState::Started);

    h.dispatcher.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_connect_failure_leaves_dispatcher_stopped() {
    let mut h = harness();
    h.handle.fail_connect(true);

    let err = h.dispatcher.start().await.unwrap_err();
    assert!(matches!(err, DispatchError::Connect(_)));
    assert_eq!(err.to_string(), "Failed to connect: connection refused");
    assert_eq!(h.dispatcher.state(), DispatcherState::Stopped);
    assert_no_signal(&mut h.signals).await;

    h.handle.fail_connect(false);
    h.dispatcher.start().await.unwrap();
    assert_eq!(next_signal(&mut h.signals).await.name(), DispatcherSignal::STARTED);
    h.dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_feed_start_failure_leaves_dispatcher_stopped() {
    let mut h = harness();
    h.handle.fail_feed_start(true);

    let err = h.dispatcher.start().await.unwrap_err();
    assert!(matches!(err, DispatchError::FeedStart(_)));
    assert_eq!(h.dispatcher.state(), DispatcherState::Stopped);
    assert!(!h.handle.is_feed_running());
    assert_no_signal(&mut h.signals).await;

    // The connection is reused on the next attempt
    h.handle.fail_feed_start(false);
    h.dispatcher.start().await.unwrap();
    assert_eq!(h.handle.connect_count(), 1);
    assert!(h.handle.is_feed_running());
    h.dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_teardown_failure_keeps_state() {
    let mut h = harness();
    h.dispatcher.start().await.unwrap();
    wait_for_signal(&mut h.signals, DispatcherSignal::STARTED).await;

    h.handle.fail_end(true);
    let err = h.dispatcher.stop().await.unwrap_err();
    assert!(matches!(err, DispatchError::ConnectionTeardown(_)));
    assert_eq!(h.dispatcher.state(), DispatcherState::Started);
    assert_no_signal(&mut h.signals).await;

    h.handle.fail_end(false);
    h.dispatcher.stop().await.unwrap();
    assert_eq!(h.dispatcher.state(), DispatcherState::Stopped);
    assert_eq!(next_signal(&mut h.signals).await.name(), DispatcherSignal::STOPPED);
    assert_eq!(h.handle.end_count(), 1);
}

#[tokio::test]
async fn test_trigger_registration() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness();
    let (handler, _calls) = recorder();
    h.dispatcher
        .add_trigger("audit", "app.users", Statement::Insert, handler)?;

    let (duplicate, _) = recorder();
    let err = h
        .dispatcher
        .add_trigger("audit", "app.users", Statement::Insert, duplicate)
        .unwrap_err();
    assert!(matches!(err, TriggerError::DuplicateTrigger { .. }));

    // Same name under another statement is a different trigger
    let (other, _) = recorder();
    h.dispatcher
        .add_trigger("audit", "app.users", Statement::Delete, other)?;
    assert_eq!(h.dispatcher.registry().len(), 2);

    assert!(!h.dispatcher.remove_trigger("missing", "app.users", Statement::Insert));
    assert!(h.dispatcher.remove_trigger("audit", "app.users", Statement::Insert));
    assert_eq!(h.dispatcher.registry().len(), 1);

    let (empty, _) = recorder();
    assert!(matches!(
        h.dispatcher.add_trigger("", "app", Statement::All, empty),
        Err(TriggerError::Validation(_))
    ));

    Ok(())
}

#[tokio::test]
async fn test_triggers_added_while_running() -> Result<(), Box<dyn std::error::Error>> {
    let h = harness();
    h.dispatcher.start().await?;

    let (handler, mut calls) = recorder();
    h.dispatcher
        .add_trigger("late", "app.users", Statement::All, handler)?;
    h.handle
        .send(insert_event(&users(), vec![user(1, "ada", "ada@example.com")]))
        .await?;
    next_event(&mut calls).await;

    h.dispatcher.remove_trigger("late", "app.users", Statement::All);
    h.handle
        .send(insert_event(&users(), vec![user(2, "grace", "grace@example.com")]))
        .await?;
    assert_no_event(&mut calls).await;

    h.dispatcher.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_feed_options_are_passed_through() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let (connection, handle) = MockConnection::new();
    let mut config = binlog_triggers::DispatcherConfig::default();
    config.feed.server_id = Some(4242);
    config.feed.start_at_end = false;
    let dispatcher = Dispatcher::with_config(connection, config);

    dispatcher.start().await?;
    let options = handle.feed_options().expect("feed was created");
    assert_eq!(options.server_id, Some(4242));
    assert!(!options.start_at_end);

    dispatcher.stop().await?;
    Ok(())
}
