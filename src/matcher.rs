//! Matching normalized events against registered triggers.

use std::sync::Arc;

use binlog_core::{BinlogEvent, NormalizedEvent, Statement};

use crate::registry::{Trigger, TriggerRegistry};

/// Triggers that should receive `event`.
///
/// Non-mutation events never match. For each matching expression, in
/// registration order, the `ALL` triggers come first, then the triggers for
/// the event's own statement.
pub fn find_triggers(event: &BinlogEvent, registry: &TriggerRegistry) -> Vec<Arc<Trigger>> {
    match event {
        BinlogEvent::Rows(event) => find_row_triggers(event, registry),
        BinlogEvent::Other(_) => Vec::new(),
    }
}

/// Triggers matching a normalized mutation event.
pub fn find_row_triggers(event: &NormalizedEvent, registry: &TriggerRegistry) -> Vec<Arc<Trigger>> {
    let statement = Statement::from(event.event_type);
    let expressions = registry.read();

    let mut triggers = Vec::new();
    for group in expressions.values() {
        if !group.filter.matches(event) {
            continue;
        }
        for bucket in [Statement::All, statement] {
            if let Some(bucket) = group.statements.get(&bucket) {
                triggers.extend(bucket.iter().cloned());
            }
        }
    }
    triggers
}
