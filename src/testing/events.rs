//! Raw binlog event builders.

use std::collections::HashMap;

use binlog_core::{RawBinlogEvent, RawEventData, RawRows, RawRowsEvent, Row, RowChange, TableInfo};

/// A table as announced by a table map event.
#[derive(Debug, Clone)]
pub struct TestTable {
    pub table_id: u64,
    pub info: TableInfo,
}

impl TestTable {
    pub fn new(table_id: u64, schema: &str, table: &str) -> Self {
        Self {
            table_id,
            info: TableInfo::new(schema, table),
        }
    }

    fn rows_event(&self, rows: RawRows) -> RawBinlogEvent {
        let mut table_map = HashMap::new();
        table_map.insert(self.table_id, self.info.clone());
        RawBinlogEvent::new(
            chrono::Utc::now().timestamp_millis(),
            0,
            RawEventData::Rows(RawRowsEvent {
                table_id: self.table_id,
                table_map,
                rows,
            }),
        )
    }
}

pub fn insert_event(table: &TestTable, rows: Vec<Row>) -> RawBinlogEvent {
    table.rows_event(RawRows::Write(rows))
}

/// `changes` are (before, after) pairs.
pub fn update_event(table: &TestTable, changes: Vec<(Row, Row)>) -> RawBinlogEvent {
    table.rows_event(RawRows::Update(
        changes
            .into_iter()
            .map(|(before, after)| RowChange { before, after })
            .collect(),
    ))
}

pub fn delete_event(table: &TestTable, rows: Vec<Row>) -> RawBinlogEvent {
    table.rows_event(RawRows::Delete(rows))
}

pub fn rotate_event(binlog_name: &str, position: u64) -> RawBinlogEvent {
    RawBinlogEvent::new(
        0,
        position,
        RawEventData::Rotate {
            binlog_name: binlog_name.to_string(),
            position,
        },
    )
}
