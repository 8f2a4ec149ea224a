//! The dispatcher: lifecycle of the upstream feed and fan-out of matching
//! events to triggers.
//!
//! A started dispatcher owns one consumer task that reads the feed channel in
//! order. For each raw event it emits [`DispatcherSignal::Binlog`], normalizes
//! the event, matches it against a snapshot of the registry and spawns one
//! task per matched trigger. Trigger tasks are never awaited by the consumer,
//! so a slow trigger does not hold up later events.
//!
//! ```text
//!            ┌──────────────┐  FeedMessage   ┌──────────────┐  spawn   ┌─────────┐
//! MySQL ───▶ │  BinlogFeed  │ ─────────────▶ │   consumer   │ ───────▶ │ trigger │
//!            └──────────────┘  (mpsc)        └──────┬───────┘          └────┬────┘
//!                                                   │ DispatcherSignal      │ TriggerError
//!                                                   ▼ (broadcast)           ▼
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use binlog_core::{
    normalize_event, BinlogEvent, BinlogFeed, ConnectionResource, FeedMessage, FeedReceiver,
    NormalizedEvent, RawBinlogEvent, RawEventData, Statement,
};
use futures::FutureExt;
use mysql_binlog_source::{ConnectionSource, MySQLConnection};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::DispatcherConfig;
use crate::error::{DispatchError, TriggerError};
use crate::matcher::find_triggers;
use crate::registry::{Trigger, TriggerHandler, TriggerRegistry};
use crate::signal::DispatcherSignal;

/// Lifecycle state of a [`Dispatcher`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatcherState {
    #[default]
    Stopped,
    Started,
    Paused,
}

struct Consumer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Lifecycle<C: ConnectionResource> {
    connection: C,
    feed: Option<C::Feed>,
    consumer: Option<Consumer>,
}

/// Dispatches binlog row events to registered triggers.
pub struct Dispatcher<C: ConnectionResource> {
    registry: Arc<TriggerRegistry>,
    signals: broadcast::Sender<DispatcherSignal>,
    state: watch::Sender<DispatcherState>,
    config: DispatcherConfig,
    lifecycle: Mutex<Lifecycle<C>>,
}

/// A dispatcher reading from MySQL.
pub type MySQLDispatcher = Dispatcher<MySQLConnection>;

impl Dispatcher<MySQLConnection> {
    /// Dispatcher for a MySQL url, descriptor or existing pool.
    pub fn mysql(source: impl Into<ConnectionSource>, config: DispatcherConfig) -> Self {
        Self::with_config(MySQLConnection::new(source), config)
    }
}

impl<C: ConnectionResource> Dispatcher<C> {
    pub fn new(connection: C) -> Self {
        Self::with_config(connection, DispatcherConfig::default())
    }

    pub fn with_config(connection: C, config: DispatcherConfig) -> Self {
        let (signals, _) = broadcast::channel(config.signal_capacity.max(1));
        let (state, _) = watch::channel(DispatcherState::Stopped);

        Self {
            registry: Arc::new(TriggerRegistry::new()),
            signals,
            state,
            config,
            lifecycle: Mutex::new(Lifecycle {
                connection,
                feed: None,
                consumer: None,
            }),
        }
    }

    /// Connect, start the feed and begin dispatching. A no-op unless stopped.
    pub async fn start(&self) -> Result<(), DispatchError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.state() != DispatcherState::Stopped {
            return Ok(());
        }

        debug!("connecting to mysql");
        lifecycle
            .connection
            .connect()
            .await
            .map_err(DispatchError::Connect)?;

        debug!("initializing binlog feed");
        let mut feed = lifecycle
            .connection
            .create_feed(&self.config.feed)
            .map_err(DispatchError::FeedStart)?;

        let (tx, rx) = mpsc::channel(self.config.feed_buffer.max(1));
        feed.start(tx).await.map_err(DispatchError::FeedStart)?;

        // Set before the consumer runs so the first events are not dropped
        self.state.send_replace(DispatcherState::Started);

        let cancel = CancellationToken::new();
        let task = ConsumerTask {
            rx,
            registry: Arc::clone(&self.registry),
            signals: self.signals.clone(),
            state: self.state.subscribe(),
            cancel: cancel.clone(),
            binlog_name: None,
        };
        let handle = tokio::spawn(task.run());

        lifecycle.feed = Some(feed);
        lifecycle.consumer = Some(Consumer { cancel, handle });

        info!("Dispatcher started");
        self.emit(DispatcherSignal::Started);
        Ok(())
    }

    /// Stop the feed and release the connection. A no-op when stopped.
    ///
    /// If releasing the connection fails the error is returned and the
    /// dispatcher keeps its previous state; calling `stop` again retries.
    pub async fn stop(&self) -> Result<(), DispatchError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.state() == DispatcherState::Stopped {
            return Ok(());
        }

        debug!("disconnecting from mysql");
        if let Some(mut feed) = lifecycle.feed.take() {
            feed.stop().await;
        }
        if let Some(consumer) = lifecycle.consumer.take() {
            consumer.cancel.cancel();
            if let Err(e) = consumer.handle.await {
                error!("Dispatcher consumer task failed: {}", e);
            }
        }

        lifecycle
            .connection
            .end()
            .await
            .map_err(DispatchError::ConnectionTeardown)?;

        debug!("disconnected");
        self.state.send_replace(DispatcherState::Stopped);
        info!("Dispatcher stopped");
        self.emit(DispatcherSignal::Stopped);
        Ok(())
    }

    /// Suspend consumption. Only acts when started.
    pub async fn pause(&self) {
        let lifecycle = self.lifecycle.lock().await;
        if self.state() != DispatcherState::Started {
            return;
        }

        debug!("pausing connection");
        lifecycle.connection.pause();
        self.state.send_replace(DispatcherState::Paused);
        self.emit(DispatcherSignal::Paused);
    }

    /// Resume consumption. Only acts when paused.
    pub async fn resume(&self) {
        let lifecycle = self.lifecycle.lock().await;
        if self.state() != DispatcherState::Paused {
            return;
        }

        debug!("resuming connection");
        lifecycle.connection.resume();
        self.state.send_replace(DispatcherState::Started);
        self.emit(DispatcherSignal::Resumed);
    }

    /// Register a trigger. See [`TriggerRegistry::add`].
    pub fn add_trigger(
        &self,
        name: impl Into<String>,
        expression: impl Into<String>,
        statement: Statement,
        handler: impl TriggerHandler,
    ) -> Result<Arc<Trigger>, TriggerError> {
        self.registry.add(name, expression, statement, handler)
    }

    /// Remove a trigger; unknown triggers are ignored.
    pub fn remove_trigger(&self, name: &str, expression: &str, statement: Statement) -> bool {
        self.registry.remove(name, expression, statement)
    }

    /// Receive signals emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatcherSignal> {
        self.signals.subscribe()
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    /// Started or paused.
    pub fn is_started(&self) -> bool {
        self.state() != DispatcherState::Stopped
    }

    pub fn is_paused(&self) -> bool {
        self.state() == DispatcherState::Paused
    }

    pub fn registry(&self) -> &Arc<TriggerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    fn emit(&self, signal: DispatcherSignal) {
        // No subscribers is not an error
        let _ = self.signals.send(signal);
    }
}

impl<C: ConnectionResource> Drop for Dispatcher<C> {
    fn drop(&mut self) {
        if let Some(consumer) = self.lifecycle.get_mut().consumer.take() {
            consumer.cancel.cancel();
        }
    }
}

/// The single consumer of a started dispatcher's feed channel.
struct ConsumerTask {
    rx: FeedReceiver,
    registry: Arc<TriggerRegistry>,
    signals: broadcast::Sender<DispatcherSignal>,
    state: watch::Receiver<DispatcherState>,
    cancel: CancellationToken,
    /// Current binlog file, followed through rotate events
    binlog_name: Option<String>,
}

impl ConsumerTask {
    async fn run(mut self) {
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = self.rx.recv() => match message {
                    Some(message) => message,
                    None => {
                        debug!("feed channel closed");
                        break;
                    }
                },
            };

            match message {
                FeedMessage::Binlog(event) => self.handle_event(event),
                FeedMessage::FeedError(e) => {
                    warn!("Binlog feed error: {:#}", e);
                    self.emit(DispatcherSignal::FeedError(Arc::new(e)));
                }
                FeedMessage::ConnectionError(e) => {
                    warn!("Connection error: {:#}", e);
                    self.emit(DispatcherSignal::ConnectionError(Arc::new(e)));
                }
            }
        }
    }

    fn handle_event(&mut self, mut event: RawBinlogEvent) {
        if let RawEventData::Rotate { binlog_name, .. } = &event.data {
            self.binlog_name = Some(binlog_name.clone());
        }

        if *self.state.borrow() != DispatcherState::Started {
            trace!("dropping {} event while paused", event.event_name());
            return;
        }

        if event.binlog_name.is_none() {
            event.binlog_name.clone_from(&self.binlog_name);
        }
        let event = Arc::new(event);
        self.emit(DispatcherSignal::Binlog(Arc::clone(&event)));

        let normalized = match normalize_event(&event) {
            Ok(normalized) => normalized,
            Err(e) => {
                warn!("Skipping {} event: {}", event.event_name(), e);
                self.emit(DispatcherSignal::FeedError(Arc::new(e.into())));
                return;
            }
        };

        let triggers = find_triggers(&normalized, &self.registry);
        let BinlogEvent::Rows(normalized) = normalized else {
            return;
        };
        trace!(
            "{} on {}.{} matched {} trigger(s)",
            normalized.event_type,
            normalized.schema,
            normalized.table,
            triggers.len()
        );
        if triggers.is_empty() {
            return;
        }

        let normalized = Arc::new(normalized);
        for trigger in triggers {
            tokio::spawn(invoke_trigger(
                trigger,
                Arc::clone(&normalized),
                self.signals.clone(),
            ));
        }
    }

    fn emit(&self, signal: DispatcherSignal) {
        let _ = self.signals.send(signal);
    }
}

/// Run one trigger, turning an error or panic into a trigger error signal.
async fn invoke_trigger(
    trigger: Arc<Trigger>,
    event: Arc<NormalizedEvent>,
    signals: broadcast::Sender<DispatcherSignal>,
) {
    let result = AssertUnwindSafe(trigger.on_event(event))
        .catch_unwind()
        .await;

    let error = match result {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e,
        Err(panic) => anyhow::anyhow!("Trigger panicked: {}", panic_message(panic.as_ref())),
    };

    warn!("Trigger '{}' failed: {:#}", trigger.name, error);
    let _ = signals.send(DispatcherSignal::TriggerError {
        trigger,
        error: Arc::new(error),
    });
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}
