//! Binlog event decoding.
//!
//! Decoding happens in two steps. [`read_event`] extracts everything it needs
//! from the stream's table map synchronously; rows whose column names are
//! missing (servers without `binlog_row_metadata=FULL`) are then completed
//! from `information_schema` by [`ColumnNameCache`].

use std::collections::{HashMap, VecDeque};

use anyhow::{Context, Result};
use binlog_core::{
    FeedOptions, RawBinlogEvent, RawEventData, RawRows, RawRowsEvent, Row, RowChange, RowValue,
    TableInfo,
};
use mysql_async::binlog::events::{Event, EventData};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::prelude::*;
use mysql_async::{BinlogStream, Pool};
use tracing::{debug, trace};

use crate::value::binlog_value_to_row_value;

/// Column values of one row image, by ordinal. Names may be empty.
type DecodedRow = Vec<(String, RowValue)>;

/// Result of reading one event off the stream.
#[derive(Debug)]
pub(crate) enum Decoded {
    Event(RawBinlogEvent),
    Rows(PendingRows),
    /// Filtered out by the include/exclude options, or empty
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowsKind {
    Write,
    Update,
    Delete,
}

/// A rows event that still needs column names resolved.
#[derive(Debug)]
pub(crate) struct PendingRows {
    timestamp: i64,
    next_position: u64,
    table_id: u64,
    info: TableInfo,
    kind: RowsKind,
    rows: Vec<(Option<DecodedRow>, Option<DecodedRow>)>,
}

impl PendingRows {
    pub(crate) fn info(&self) -> &TableInfo {
        &self.info
    }

    pub(crate) fn needs_column_names(&self) -> bool {
        self.rows.iter().any(|(before, after)| {
            [before, after]
                .into_iter()
                .flatten()
                .any(|row| row.iter().any(|(name, _)| name.is_empty()))
        })
    }

    /// Build the raw event, naming unnamed columns from `names` by ordinal.
    pub(crate) fn into_event(self, names: &[String]) -> RawBinlogEvent {
        let to_row = |decoded: DecodedRow| -> Row {
            decoded
                .into_iter()
                .enumerate()
                .map(|(i, (name, value))| {
                    if name.is_empty() {
                        let fallback = names.get(i).cloned().unwrap_or_else(|| format!("@{i}"));
                        (fallback, value)
                    } else {
                        (name, value)
                    }
                })
                .collect()
        };

        let rows = match self.kind {
            RowsKind::Write => {
                RawRows::Write(self.rows.into_iter().filter_map(|(_, a)| a).map(to_row).collect())
            }
            RowsKind::Delete => {
                RawRows::Delete(self.rows.into_iter().filter_map(|(b, _)| b).map(to_row).collect())
            }
            RowsKind::Update => RawRows::Update(
                self.rows
                    .into_iter()
                    .filter_map(|(before, after)| Some((before?, after?)))
                    .map(|(before, after)| RowChange {
                        before: to_row(before),
                        after: to_row(after),
                    })
                    .collect(),
            ),
        };

        let mut table_map = HashMap::new();
        table_map.insert(self.table_id, self.info);

        RawBinlogEvent::new(
            self.timestamp,
            self.next_position,
            RawEventData::Rows(RawRowsEvent {
                table_id: self.table_id,
                table_map,
                rows,
            }),
        )
    }
}

/// Read one binlog event.
pub(crate) fn read_event(
    stream: &BinlogStream,
    event: &Event,
    options: &FeedOptions,
) -> Result<Decoded> {
    let header = event.header();
    let timestamp = header.timestamp() as i64 * 1000;
    let next_position = header.log_pos() as u64;

    let data = event
        .read_data()
        .context("Failed to read binlog event data")?;

    let data = match data {
        Some(EventData::RotateEvent(rotate)) => RawEventData::Rotate {
            binlog_name: rotate.name().into_owned(),
            position: rotate.position(),
        },
        Some(EventData::TableMapEvent(tme)) => RawEventData::TableMap {
            table_id: tme.table_id(),
            info: TableInfo::new(tme.database_name(), tme.table_name()),
        },
        Some(EventData::QueryEvent(query)) => RawEventData::Query {
            schema: query.schema().into_owned(),
            query: query.query().into_owned(),
        },
        Some(EventData::XidEvent(xid)) => RawEventData::Xid { xid: xid.xid },
        Some(EventData::RowsEvent(rows_event)) => {
            let table_id = rows_event.table_id();
            let tme = stream
                .get_tme(table_id)
                .with_context(|| format!("No table map event for table id {table_id}"))?;
            let info = TableInfo::new(tme.database_name(), tme.table_name());

            if !options.is_table_included(&info.schema, &info.table) {
                trace!("skipping rows event for {}.{}", info.schema, info.table);
                return Ok(Decoded::Skip);
            }

            let mut rows = Vec::new();
            for row in rows_event.rows(tme) {
                let (before, after) = row.context("Failed to decode binlog row")?;
                rows.push((
                    before.map(decode_row).transpose()?,
                    after.map(decode_row).transpose()?,
                ));
            }

            let kind = match rows.first() {
                Some((None, Some(_))) => RowsKind::Write,
                Some((Some(_), Some(_))) => RowsKind::Update,
                Some((Some(_), None)) => RowsKind::Delete,
                _ => return Ok(Decoded::Skip),
            };

            return Ok(Decoded::Rows(PendingRows {
                timestamp,
                next_position,
                table_id,
                info,
                kind,
                rows,
            }));
        }
        _ => RawEventData::Other {
            name: other_event_name(event),
        },
    };

    Ok(Decoded::Event(RawBinlogEvent::new(
        timestamp,
        next_position,
        data,
    )))
}

fn decode_row(row: BinlogRow) -> Result<DecodedRow> {
    let columns: Vec<_> = row
        .columns_ref()
        .iter()
        .map(|column| {
            (
                column.name_str().into_owned(),
                column.column_type(),
                column.flags(),
            )
        })
        .collect();

    columns
        .into_iter()
        .zip(row.unwrap())
        .map(|((name, column_type, flags), value)| {
            let value = binlog_value_to_row_value(value, column_type, flags)
                .with_context(|| format!("Failed to convert column '{name}'"))?;
            Ok((name, value))
        })
        .collect()
}

/// `FORMAT_DESCRIPTION_EVENT` → `formatdescription`
fn other_event_name(event: &Event) -> String {
    match event.header().event_type() {
        Ok(event_type) => event_name_from_type(&format!("{event_type:?}")),
        Err(_) => "unknown".to_string(),
    }
}

fn event_name_from_type(type_name: &str) -> String {
    type_name
        .trim_end_matches("_EVENT")
        .replace('_', "")
        .to_lowercase()
}

/// Column names per table from `information_schema`, with FIFO eviction.
pub(crate) struct ColumnNameCache {
    pool: Pool,
    tables: HashMap<(String, String), Vec<String>>,
    insertion_order: VecDeque<(String, String)>,
    max_entries: usize,
}

impl ColumnNameCache {
    const DEFAULT_MAX_ENTRIES: usize = 1000;

    pub(crate) fn new(pool: Pool) -> Self {
        Self {
            pool,
            tables: HashMap::new(),
            insertion_order: VecDeque::new(),
            max_entries: Self::DEFAULT_MAX_ENTRIES,
        }
    }

    pub(crate) async fn columns(&mut self, info: &TableInfo) -> Result<Vec<String>> {
        let key = (info.schema.clone(), info.table.clone());
        if let Some(columns) = self.cached(&key) {
            return Ok(columns);
        }

        debug!(
            "Loading column names for {}.{} from information_schema",
            info.schema, info.table
        );
        let mut conn = self.pool.get_conn().await?;
        let columns: Vec<String> = conn
            .exec(
                "SELECT COLUMN_NAME FROM INFORMATION_SCHEMA.COLUMNS
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
                 ORDER BY ORDINAL_POSITION",
                (info.schema.as_str(), info.table.as_str()),
            )
            .await
            .with_context(|| format!("Failed to load columns of {}.{}", info.schema, info.table))?;

        self.store(key, columns.clone());
        Ok(columns)
    }

    fn cached(&self, key: &(String, String)) -> Option<Vec<String>> {
        self.tables.get(key).cloned()
    }

    fn store(&mut self, key: (String, String), columns: Vec<String>) {
        if self.tables.insert(key.clone(), columns).is_none() {
            self.insertion_order.push_back(key);
        }
        while self.tables.len() > self.max_entries {
            match self.insertion_order.pop_front() {
                Some(oldest) => {
                    self.tables.remove(&oldest);
                }
                None => break,
            }
        }
    }

    /// Drop every cached table after a DDL statement.
    ///
    /// The query event only carries the session's default schema, while the
    /// statement may name any `schema.table`, so nothing narrower is safe.
    pub(crate) fn observe_query(&mut self, query: &str) {
        if is_ddl(query) {
            debug!("DDL seen, clearing {} cached table(s)", self.len());
            self.tables.clear();
            self.insertion_order.clear();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.tables.len()
    }
}

fn is_ddl(query: &str) -> bool {
    let head = query.trim_start().to_ascii_uppercase();
    ["ALTER", "CREATE", "DROP", "RENAME", "TRUNCATE"]
        .iter()
        .any(|keyword| head.starts_with(keyword))
}
