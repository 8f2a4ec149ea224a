//! Raw and normalized binlog event types.
//!
//! Raw events are what the upstream feed delivers: a header (timestamp and
//! next position), an optional binlog file name, and a payload. Only rows
//! events are normalized; everything else flows through as [`BinlogEvent::Other`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::values::Row;

/// Schema and table names for a binlog table id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    /// Database (schema) name
    pub schema: String,
    /// Table name
    pub table: String,
}

impl TableInfo {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

/// Before and after images of an updated row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub before: Row,
    pub after: Row,
}

/// Rows carried by a rows event, shaped by the operation that produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRows {
    /// Inserted row images
    Write(Vec<Row>),
    /// Updated rows with both images
    Update(Vec<RowChange>),
    /// Deleted row images
    Delete(Vec<Row>),
}

impl RawRows {
    pub fn event_type(&self) -> EventType {
        match self {
            RawRows::Write(_) => EventType::Insert,
            RawRows::Update(_) => EventType::Update,
            RawRows::Delete(_) => EventType::Delete,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RawRows::Write(rows) | RawRows::Delete(rows) => rows.len(),
            RawRows::Update(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A rows event together with the table map needed to resolve its table id.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRowsEvent {
    pub table_id: u64,
    pub table_map: HashMap<u64, TableInfo>,
    pub rows: RawRows,
}

/// Payload of a raw binlog event.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEventData {
    /// WRITE/UPDATE/DELETE rows
    Rows(RawRowsEvent),
    /// Table id → schema/table mapping announcement
    TableMap { table_id: u64, info: TableInfo },
    /// Switch to a new binlog file
    Rotate { binlog_name: String, position: u64 },
    /// Statement event (DDL, BEGIN, ...)
    Query { schema: String, query: String },
    /// Transaction commit
    Xid { xid: u64 },
    /// Any other event, identified by its type name
    Other { name: String },
}

/// A raw event as delivered by the upstream feed.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBinlogEvent {
    /// Event time, milliseconds since the Unix epoch
    pub timestamp: i64,
    /// Position of the next event in the current binlog file
    pub next_position: u64,
    /// Binlog file this event was read from, tagged by the dispatcher
    pub binlog_name: Option<String>,
    pub data: RawEventData,
}

impl RawBinlogEvent {
    pub fn new(timestamp: i64, next_position: u64, data: RawEventData) -> Self {
        Self {
            timestamp,
            next_position,
            binlog_name: None,
            data,
        }
    }

    /// Lowercase event name in the form used by binlog tooling
    /// (`writerows`, `updaterows`, `deleterows`, `tablemap`, `rotate`, ...).
    pub fn event_name(&self) -> &str {
        match &self.data {
            RawEventData::Rows(rows) => match rows.rows {
                RawRows::Write(_) => "writerows",
                RawRows::Update(_) => "updaterows",
                RawRows::Delete(_) => "deleterows",
            },
            RawEventData::TableMap { .. } => "tablemap",
            RawEventData::Rotate { .. } => "rotate",
            RawEventData::Query { .. } => "query",
            RawEventData::Xid { .. } => "xid",
            RawEventData::Other { name } => name,
        }
    }

    /// Whether this is an INSERT/UPDATE/DELETE rows event.
    pub fn is_mutation(&self) -> bool {
        matches!(self.data, RawEventData::Rows(_))
    }
}

/// Type of a normalized mutation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Insert,
    Update,
    Delete,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Insert => "INSERT",
            EventType::Update => "UPDATE",
            EventType::Delete => "DELETE",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation filter of a trigger: a specific event type or `ALL`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Statement {
    #[default]
    All,
    Insert,
    Update,
    Delete,
}

impl Statement {
    pub const VALUES: [Statement; 4] = [
        Statement::All,
        Statement::Insert,
        Statement::Update,
        Statement::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Statement::All => "ALL",
            Statement::Insert => "INSERT",
            Statement::Update => "UPDATE",
            Statement::Delete => "DELETE",
        }
    }
}

impl From<EventType> for Statement {
    fn from(event_type: EventType) -> Self {
        match event_type {
            EventType::Insert => Statement::Insert,
            EventType::Update => Statement::Update,
            EventType::Delete => Statement::Delete,
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown statement name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown statement: {0} (expected ALL, INSERT, UPDATE or DELETE)")]
pub struct UnknownStatement(pub String);

impl FromStr for Statement {
    type Err = UnknownStatement;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ALL" => Ok(Statement::All),
            "INSERT" => Ok(Statement::Insert),
            "UPDATE" => Ok(Statement::Update),
            "DELETE" => Ok(Statement::Delete),
            _ => Err(UnknownStatement(s.to_string())),
        }
    }
}

/// Before/after images of one affected row.
///
/// INSERT deltas have no `before`, DELETE deltas have no `after`, UPDATE
/// deltas have both.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowDelta {
    pub before: Option<Row>,
    pub after: Option<Row>,
}

/// Canonical form of a rows event handed to triggers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub schema: String,
    pub table: String,
    pub affected_rows: Vec<RowDelta>,
    /// Columns whose value differs between before and after, first-seen order
    pub affected_columns: Vec<String>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub next_position: u64,
    pub binlog_name: Option<String>,
}

/// A binlog event after normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum BinlogEvent {
    /// Normalized INSERT/UPDATE/DELETE
    Rows(NormalizedEvent),
    /// Any other event, tagged with the current binlog name
    Other(RawBinlogEvent),
}

impl BinlogEvent {
    /// Event type, present only for mutation events.
    pub fn event_type(&self) -> Option<EventType> {
        match self {
            BinlogEvent::Rows(event) => Some(event.event_type),
            BinlogEvent::Other(_) => None,
        }
    }

    pub fn as_rows(&self) -> Option<&NormalizedEvent> {
        match self {
            BinlogEvent::Rows(event) => Some(event),
            BinlogEvent::Other(_) => None,
        }
    }
}
