//! Row-based binlog feed over a mysql_async replication stream.

use anyhow::{Context, Result};
use async_trait::async_trait;
use binlog_core::{BinlogFeed, FeedMessage, FeedOptions, FeedSender, RawEventData};
use futures::StreamExt;
use mysql_async::prelude::*;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, Pool};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::decoder::{read_event, ColumnNameCache, Decoded};

/// Replica server id in 1000000..2000000, unlikely to clash with real replicas.
pub fn random_server_id() -> u32 {
    rand::random::<u32>() % 1000000 + 1000000
}

/// Binlog file name and position to start streaming from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartPosition {
    pub binlog_name: String,
    pub position: u64,
}

/// Resolve where streaming starts: explicit coordinates, the current end of
/// the binlog, or the beginning of the oldest binlog file.
pub async fn resolve_start_position(conn: &mut Conn, options: &FeedOptions) -> Result<StartPosition> {
    if let Some(binlog_name) = &options.binlog_name {
        return Ok(StartPosition {
            binlog_name: binlog_name.clone(),
            position: options.binlog_position.unwrap_or(4),
        });
    }

    if options.start_at_end {
        // SHOW MASTER STATUS was renamed in MySQL 8.2
        let row: Option<mysql_async::Row> = match conn.query_first("SHOW BINARY LOG STATUS").await
        {
            Ok(row) => row,
            Err(_) => conn
                .query_first("SHOW MASTER STATUS")
                .await
                .context("Failed to query binlog position")?,
        };
        let row = row.context("No binlog status returned; binary logging may be disabled")?;
        let binlog_name: String = row
            .get(0)
            .ok_or_else(|| anyhow::anyhow!("Missing binlog file name"))?;
        let position: u64 = row
            .get(1)
            .ok_or_else(|| anyhow::anyhow!("Missing binlog position"))?;
        return Ok(StartPosition {
            binlog_name,
            position,
        });
    }

    let row: Option<mysql_async::Row> = conn
        .query_first("SHOW BINARY LOGS")
        .await
        .context("Failed to list binary logs")?;
    let row = row.context("No binary logs found; binary logging may be disabled")?;
    let binlog_name: String = row
        .get(0)
        .ok_or_else(|| anyhow::anyhow!("Missing binlog file name"))?;
    Ok(StartPosition {
        binlog_name,
        position: 4,
    })
}

struct FeedTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// A binlog feed created by [`crate::MySQLConnection`].
pub struct MySQLBinlogFeed {
    pool: Pool,
    options: FeedOptions,
    paused: watch::Receiver<bool>,
    task: Option<FeedTask>,
}

impl MySQLBinlogFeed {
    pub(crate) fn new(pool: Pool, options: FeedOptions, paused: watch::Receiver<bool>) -> Self {
        Self {
            pool,
            options,
            paused,
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }
}

#[async_trait]
impl BinlogFeed for MySQLBinlogFeed {
    async fn start(&mut self, sender: FeedSender) -> Result<()> {
        if self.task.is_some() {
            anyhow::bail!("Binlog feed is already started");
        }

        let mut conn = self
            .pool
            .get_conn()
            .await
            .context("Failed to get connection for binlog stream")?;

        let start = resolve_start_position(&mut conn, &self.options).await?;
        let server_id = self.options.server_id.unwrap_or_else(random_server_id);

        info!(
            "Starting binlog stream at {}:{} (server_id={})",
            start.binlog_name, start.position, server_id
        );

        let request = BinlogStreamRequest::new(server_id)
            .with_filename(start.binlog_name.as_bytes())
            .with_pos(start.position);
        let stream = conn
            .get_binlog_stream(request)
            .await
            .context("Failed to request binlog stream")?;

        let cancel = CancellationToken::new();
        let worker = FeedWorker {
            stream,
            columns: ColumnNameCache::new(self.pool.clone()),
            options: self.options.clone(),
            paused: self.paused.clone(),
            sender,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(worker.run());

        self.task = Some(FeedTask { cancel, handle });
        Ok(())
    }

    async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };

        debug!("stopping binlog stream");
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            error!("Binlog feed task failed: {}", e);
        }
    }
}

impl Drop for MySQLBinlogFeed {
    fn drop(&mut self) {
        // The worker owns the replication connection; stop it with the feed
        if let Some(task) = self.task.take() {
            task.cancel.cancel();
        }
    }
}

struct FeedWorker {
    stream: BinlogStream,
    columns: ColumnNameCache,
    options: FeedOptions,
    paused: watch::Receiver<bool>,
    sender: FeedSender,
    cancel: CancellationToken,
}

impl FeedWorker {
    async fn run(mut self) {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = self.stream.next() => next,
            };

            let message = match next {
                Some(Ok(event)) => {
                    let decoded = read_event(&self.stream, &event, &self.options);
                    match self.complete(decoded).await {
                        Some(message) => message,
                        None => continue,
                    }
                }
                Some(Err(e)) => classify_error(e),
                None => {
                    if !self.cancel.is_cancelled() {
                        let _ = self
                            .sender
                            .send(FeedMessage::ConnectionError(anyhow::anyhow!(
                                "Binlog stream closed by server"
                            )))
                            .await;
                    }
                    break;
                }
            };

            if self.sender.send(message).await.is_err() {
                debug!("feed receiver dropped");
                break;
            }
        }

        if let Err(e) = self.stream.close().await {
            warn!("Failed to close binlog stream: {}", e);
        }
        debug!("binlog stream closed");
    }

    /// Finish decoding; `None` when the event is dropped.
    async fn complete(&mut self, decoded: Result<Decoded>) -> Option<FeedMessage> {
        match decoded {
            Ok(Decoded::Event(event)) => {
                if let RawEventData::Query { query, .. } = &event.data {
                    self.columns.observe_query(query);
                }
                Some(FeedMessage::Binlog(event))
            }
            Ok(Decoded::Rows(pending)) => {
                if *self.paused.borrow() {
                    trace!("dropping rows event while paused");
                    return None;
                }

                let names = if pending.needs_column_names() {
                    match self.columns.columns(pending.info()).await {
                        Ok(names) => names,
                        Err(e) => return Some(FeedMessage::FeedError(e)),
                    }
                } else {
                    Vec::new()
                };
                Some(FeedMessage::Binlog(pending.into_event(&names)))
            }
            Ok(Decoded::Skip) => None,
            Err(e) => Some(FeedMessage::FeedError(e)),
        }
    }
}

/// Socket and protocol failures are connection errors; anything else is a
/// feed error.
fn classify_error(e: mysql_async::Error) -> FeedMessage {
    match e {
        mysql_async::Error::Io(_) | mysql_async::Error::Driver(_) => {
            FeedMessage::ConnectionError(e.into())
        }
        other => FeedMessage::FeedError(other.into()),
    }
}
