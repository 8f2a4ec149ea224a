//! Row normalization: raw rows events → [`NormalizedEvent`].

use crate::event::{
    BinlogEvent, NormalizedEvent, RawBinlogEvent, RawEventData, RawRows, RawRowsEvent, RowDelta,
};
use crate::values::RowValue;

/// Error during normalization of a rows event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    /// The rows event references a table id that is not in its table map.
    #[error("No table map entry for table id {0}")]
    UnknownTable(u64),
}

/// Normalize any raw event.
///
/// Rows events become [`BinlogEvent::Rows`]; every other event is passed
/// through as [`BinlogEvent::Other`].
pub fn normalize_event(event: &RawBinlogEvent) -> Result<BinlogEvent, NormalizeError> {
    match &event.data {
        RawEventData::Rows(rows) => normalize(event, rows).map(BinlogEvent::Rows),
        _ => Ok(BinlogEvent::Other(event.clone())),
    }
}

/// Normalize a rows event carried by `event`.
pub fn normalize(
    event: &RawBinlogEvent,
    rows: &RawRowsEvent,
) -> Result<NormalizedEvent, NormalizeError> {
    let info = rows
        .table_map
        .get(&rows.table_id)
        .ok_or(NormalizeError::UnknownTable(rows.table_id))?;

    let affected_rows: Vec<RowDelta> = match &rows.rows {
        RawRows::Write(images) => images
            .iter()
            .map(|row| RowDelta {
                before: None,
                after: Some(row.clone().canonicalize()),
            })
            .collect(),
        RawRows::Update(changes) => changes
            .iter()
            .map(|change| RowDelta {
                before: Some(change.before.clone().canonicalize()),
                after: Some(change.after.clone().canonicalize()),
            })
            .collect(),
        RawRows::Delete(images) => images
            .iter()
            .map(|row| RowDelta {
                before: Some(row.clone().canonicalize()),
                after: None,
            })
            .collect(),
    };

    let mut affected_columns = Vec::new();
    for delta in &affected_rows {
        collect_affected_columns(delta, &mut affected_columns);
    }

    Ok(NormalizedEvent {
        event_type: rows.rows.event_type(),
        schema: info.schema.clone(),
        table: info.table.clone(),
        affected_rows,
        affected_columns,
        timestamp: event.timestamp,
        next_position: event.next_position,
        binlog_name: event.binlog_name.clone(),
    })
}

/// Whether a column changed between the two images.
///
/// A column missing from one side counts as changed, including when the
/// other side holds NULL.
pub fn has_difference(before: Option<&RowValue>, after: Option<&RowValue>) -> bool {
    before != after
}

fn collect_affected_columns(delta: &RowDelta, affected: &mut Vec<String>) {
    let Some(reference) = delta.after.as_ref().or(delta.before.as_ref()) else {
        return;
    };

    for column in reference.columns() {
        let before = delta.before.as_ref().and_then(|row| row.get(column));
        let after = delta.after.as_ref().and_then(|row| row.get(column));

        if has_difference(before, after) && !affected.iter().any(|c| c == column) {
            affected.push(column.to_string());
        }
    }
}
