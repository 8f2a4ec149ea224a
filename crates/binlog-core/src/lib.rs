//! Core types for binlog-triggers.
//!
//! This crate provides the types shared by the dispatcher and the upstream
//! feed implementations:
//!
//! - [`RowValue`] / [`Row`] - Column values and ordered row images
//! - [`RawBinlogEvent`] - Events as delivered by a replication feed
//! - [`NormalizedEvent`] - Canonical INSERT/UPDATE/DELETE events for triggers
//! - [`FilterExpression`] - Parsed `schema.table.column.value` trigger filters
//! - [`normalize_event`] - Raw → normalized conversion
//! - [`ConnectionResource`] / [`BinlogFeed`] - Upstream feed collaborators
//!
//! # Architecture
//!
//! ```text
//! binlog-core (this crate)
//!    │
//!    ├─── mysql-binlog-source  (mysql_async binlog stream → RawBinlogEvent)
//!    │
//!    └─── binlog-triggers      (registry, matcher, dispatcher)
//! ```
//!
//! # Example
//!
//! ```rust
//! use std::collections::HashMap;
//! use binlog_core::{
//!     normalize_event, BinlogEvent, RawBinlogEvent, RawEventData, RawRows, RawRowsEvent, Row,
//!     TableInfo,
//! };
//!
//! let mut table_map = HashMap::new();
//! table_map.insert(1, TableInfo::new("app", "users"));
//!
//! let raw = RawBinlogEvent::new(
//!     1_700_000_000_000,
//!     500,
//!     RawEventData::Rows(RawRowsEvent {
//!         table_id: 1,
//!         table_map,
//!         rows: RawRows::Write(vec![Row::new().with("id", 1).with("name", "a")]),
//!     }),
//! );
//!
//! let BinlogEvent::Rows(event) = normalize_event(&raw).unwrap() else {
//!     unreachable!()
//! };
//! assert_eq!(event.affected_columns, vec!["id", "name"]);
//! ```

pub mod event;
pub mod expression;
pub mod normalize;
pub mod upstream;
pub mod values;

// Re-exports for convenience
pub use event::{
    BinlogEvent, EventType, NormalizedEvent, RawBinlogEvent, RawEventData, RawRows, RawRowsEvent,
    RowChange, RowDelta, Statement, TableInfo, UnknownStatement,
};
pub use expression::{ExpressionError, FilterExpression, Segment};
pub use normalize::{has_difference, normalize, normalize_event, NormalizeError};
pub use upstream::{
    BinlogFeed, ConnectionResource, FeedMessage, FeedOptions, FeedReceiver, FeedSender,
    TableSelection,
};
pub use values::{Row, RowValue};
