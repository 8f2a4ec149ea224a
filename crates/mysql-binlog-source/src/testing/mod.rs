//! Testing utilities for the MySQL binlog feed
//!
//! Docker container management for a MySQL server with row-based binary
//! logging enabled.

pub mod container;

pub use container::MySQLContainer;
