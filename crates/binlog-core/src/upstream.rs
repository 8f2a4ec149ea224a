//! Collaborator traits for the upstream replication feed.
//!
//! A [`ConnectionResource`] owns the database connection and creates
//! [`BinlogFeed`]s from it. A started feed pushes [`FeedMessage`]s onto a
//! bounded channel that the dispatcher consumes in order.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::event::RawBinlogEvent;

/// A message delivered by a running feed.
#[derive(Debug)]
pub enum FeedMessage {
    /// A decoded binlog event
    Binlog(RawBinlogEvent),
    /// The feed failed to read or decode the stream
    FeedError(anyhow::Error),
    /// The underlying connection reported an error
    ConnectionError(anyhow::Error),
}

pub type FeedSender = mpsc::Sender<FeedMessage>;
pub type FeedReceiver = mpsc::Receiver<FeedMessage>;

/// Tables selected for a schema in an include/exclude filter.
///
/// In TOML: `app = true` selects every table of `app`, `app = ["users"]`
/// selects only `users`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TableSelection {
    All(bool),
    Tables(Vec<String>),
}

impl TableSelection {
    fn contains(&self, table: &str) -> bool {
        match self {
            TableSelection::All(all) => *all,
            TableSelection::Tables(tables) => tables.iter().any(|t| t == table),
        }
    }
}

/// Options passed through to the feed when it is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedOptions {
    /// Replica server id; a random id in 1000000..2000000 is used when unset
    pub server_id: Option<u32>,

    /// Start from the current end of the binlog instead of the first file
    pub start_at_end: bool,

    /// Explicit binlog file to start from (overrides `start_at_end`)
    pub binlog_name: Option<String>,

    /// Position within `binlog_name`
    pub binlog_position: Option<u64>,

    /// Only emit rows events for these schemas/tables
    pub include_schema: Option<HashMap<String, TableSelection>>,

    /// Never emit rows events for these schemas/tables
    pub exclude_schema: HashMap<String, TableSelection>,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            server_id: None,
            start_at_end: true,
            binlog_name: None,
            binlog_position: None,
            include_schema: None,
            exclude_schema: HashMap::new(),
        }
    }
}

impl FeedOptions {
    /// Whether rows events for `schema.table` should be emitted.
    pub fn is_table_included(&self, schema: &str, table: &str) -> bool {
        if let Some(include) = &self.include_schema {
            match include.get(schema) {
                Some(selection) if selection.contains(table) => {}
                _ => return false,
            }
        }

        !self
            .exclude_schema
            .get(schema)
            .is_some_and(|selection| selection.contains(table))
    }
}

/// A replication feed created from a [`ConnectionResource`].
#[async_trait]
pub trait BinlogFeed: Send + 'static {
    /// Begin streaming into `sender`. Returns once the stream is established;
    /// events are delivered from a background task.
    async fn start(&mut self, sender: FeedSender) -> anyhow::Result<()>;

    /// Stop streaming. Safe to call when not started.
    async fn stop(&mut self);
}

/// The connection a dispatcher reads from.
#[async_trait]
pub trait ConnectionResource: Send + Sync + 'static {
    type Feed: BinlogFeed;

    /// Establish the connection. Calling it on a connected resource is a no-op.
    async fn connect(&mut self) -> anyhow::Result<()>;

    fn create_feed(&self, options: &FeedOptions) -> anyhow::Result<Self::Feed>;

    /// Suspend consumption of the stream.
    fn pause(&self);

    fn resume(&self);

    /// Release the connection.
    async fn end(&mut self) -> anyhow::Result<()>;
}
