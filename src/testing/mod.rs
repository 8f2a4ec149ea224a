//! Test infrastructure for driving a dispatcher without a database.
//!
//! [`MockConnection`] implements the upstream collaborator traits in memory;
//! its [`MockHandle`] pushes events and errors into the running feed. The
//! [`events`] builders create raw binlog events for a table.

pub mod events;
pub mod mock;

pub use events::{delete_event, insert_event, rotate_event, update_event, TestTable};
pub use mock::{MockConnection, MockFeed, MockHandle};
