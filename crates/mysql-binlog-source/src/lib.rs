//! MySQL binlog feed for binlog-triggers
//!
//! Streams row-based replication events with `mysql_async` and delivers them
//! as [`binlog_core::RawBinlogEvent`]s. Requires `binlog_format=ROW`;
//! `binlog_row_metadata=FULL` avoids an `information_schema` lookup for
//! column names.

mod connection;
mod decoder;
mod feed;
pub mod testing;
mod value;

pub use connection::{new_mysql_pool, ConnectionDescriptor, ConnectionSource, MySQLConnection};
pub use feed::{random_server_id, resolve_start_position, MySQLBinlogFeed, StartPosition};
pub use value::{binlog_value_to_row_value, mysql_value_to_row_value, ConversionError};
