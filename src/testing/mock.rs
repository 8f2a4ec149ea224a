//! In-memory connection resource and feed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use binlog_core::{
    BinlogFeed, ConnectionResource, FeedMessage, FeedOptions, FeedSender, RawBinlogEvent,
};

#[derive(Default)]
struct MockState {
    sender: Mutex<Option<FeedSender>>,
    options: Mutex<Option<FeedOptions>>,
    connected: AtomicBool,
    paused: AtomicBool,
    connects: AtomicUsize,
    ends: AtomicUsize,
    fail_connect: AtomicBool,
    fail_feed_start: AtomicBool,
    fail_end: AtomicBool,
}

impl MockState {
    fn sender(&self) -> Option<FeedSender> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_sender(&self, sender: Option<FeedSender>) {
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) = sender;
    }
}

/// A [`ConnectionResource`] that never touches the network.
pub struct MockConnection {
    state: Arc<MockState>,
}

/// Control side of a [`MockConnection`].
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<MockState>,
}

impl MockConnection {
    pub fn new() -> (Self, MockHandle) {
        let state = Arc::new(MockState::default());
        (
            Self {
                state: Arc::clone(&state),
            },
            MockHandle { state },
        )
    }
}

impl MockHandle {
    async fn deliver(&self, message: FeedMessage) -> anyhow::Result<()> {
        let sender = self
            .state
            .sender()
            .context("Mock feed is not started")?;
        sender
            .send(message)
            .await
            .map_err(|_| anyhow::anyhow!("Mock feed receiver dropped"))
    }

    /// Deliver a binlog event through the running feed.
    pub async fn send(&self, event: RawBinlogEvent) -> anyhow::Result<()> {
        self.deliver(FeedMessage::Binlog(event)).await
    }

    pub async fn send_feed_error(&self, message: &str) -> anyhow::Result<()> {
        self.deliver(FeedMessage::FeedError(anyhow::anyhow!(message.to_string())))
            .await
    }

    pub async fn send_connection_error(&self, message: &str) -> anyhow::Result<()> {
        self.deliver(FeedMessage::ConnectionError(anyhow::anyhow!(
            message.to_string()
        )))
        .await
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_feed_start(&self, fail: bool) {
        self.state.fail_feed_start.store(fail, Ordering::SeqCst);
    }

    pub fn fail_end(&self, fail: bool) {
        self.state.fail_end.store(fail, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.state.paused.load(Ordering::SeqCst)
    }

    pub fn is_feed_running(&self) -> bool {
        self.state.sender().is_some()
    }

    /// Number of connects that actually established a connection.
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn end_count(&self) -> usize {
        self.state.ends.load(Ordering::SeqCst)
    }

    /// Options the last feed was created with.
    pub fn feed_options(&self) -> Option<FeedOptions> {
        self.state
            .options
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ConnectionResource for MockConnection {
    type Feed = MockFeed;

    async fn connect(&mut self) -> anyhow::Result<()> {
        if self.state.fail_connect.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        if !self.state.connected.swap(true, Ordering::SeqCst) {
            self.state.connects.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn create_feed(&self, options: &FeedOptions) -> anyhow::Result<MockFeed> {
        if !self.state.connected.load(Ordering::SeqCst) {
            anyhow::bail!("Cannot create a binlog feed before connecting");
        }
        *self
            .state
            .options
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(options.clone());
        Ok(MockFeed {
            state: Arc::clone(&self.state),
        })
    }

    fn pause(&self) {
        self.state.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.state.paused.store(false, Ordering::SeqCst);
    }

    async fn end(&mut self) -> anyhow::Result<()> {
        if self.state.fail_end.load(Ordering::SeqCst) {
            anyhow::bail!("connection already closed");
        }
        self.state.connected.store(false, Ordering::SeqCst);
        self.state.paused.store(false, Ordering::SeqCst);
        self.state.ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Feed created by [`MockConnection`]; events come from the [`MockHandle`].
pub struct MockFeed {
    state: Arc<MockState>,
}

#[async_trait]
impl BinlogFeed for MockFeed {
    async fn start(&mut self, sender: FeedSender) -> anyhow::Result<()> {
        if self.state.fail_feed_start.load(Ordering::SeqCst) {
            anyhow::bail!("binary logging is disabled");
        }
        self.state.set_sender(Some(sender));
        Ok(())
    }

    async fn stop(&mut self) {
        self.state.set_sender(None);
    }
}

impl Drop for MockFeed {
    fn drop(&mut self) {
        self.state.set_sender(None);
    }
}
