//! Signals emitted by the dispatcher.

use std::fmt;
use std::sync::Arc;

use binlog_core::RawBinlogEvent;

use crate::registry::Trigger;

/// Lifecycle and error notifications, delivered to every
/// [`subscribe`](crate::Dispatcher::subscribe)r.
#[derive(Debug, Clone)]
pub enum DispatcherSignal {
    Started,
    Stopped,
    Paused,
    Resumed,
    /// Every raw event received while started, before normalization
    Binlog(Arc<RawBinlogEvent>),
    /// A trigger handler failed or panicked
    TriggerError {
        trigger: Arc<Trigger>,
        error: Arc<anyhow::Error>,
    },
    /// The upstream connection reported an error
    ConnectionError(Arc<anyhow::Error>),
    /// The upstream feed failed to read or decode an event
    FeedError(Arc<anyhow::Error>),
}

impl DispatcherSignal {
    pub const STARTED: &'static str = "started";
    pub const STOPPED: &'static str = "stopped";
    pub const PAUSED: &'static str = "paused";
    pub const RESUMED: &'static str = "resumed";
    pub const BINLOG: &'static str = "binlog";
    pub const TRIGGER_ERROR: &'static str = "triggerError";
    pub const CONNECTION_ERROR: &'static str = "connectionError";
    pub const FEED_ERROR: &'static str = "feedError";

    pub fn name(&self) -> &'static str {
        match self {
            DispatcherSignal::Started => Self::STARTED,
            DispatcherSignal::Stopped => Self::STOPPED,
            DispatcherSignal::Paused => Self::PAUSED,
            DispatcherSignal::Resumed => Self::RESUMED,
            DispatcherSignal::Binlog(_) => Self::BINLOG,
            DispatcherSignal::TriggerError { .. } => Self::TRIGGER_ERROR,
            DispatcherSignal::ConnectionError(_) => Self::CONNECTION_ERROR,
            DispatcherSignal::FeedError(_) => Self::FEED_ERROR,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            DispatcherSignal::TriggerError { .. }
                | DispatcherSignal::ConnectionError(_)
                | DispatcherSignal::FeedError(_)
        )
    }
}

impl fmt::Display for DispatcherSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatcherSignal::Binlog(event) => write!(f, "binlog ({})", event.event_name()),
            DispatcherSignal::TriggerError { trigger, error } => {
                write!(f, "triggerError ({}): {error:#}", trigger.name)
            }
            DispatcherSignal::ConnectionError(error) => write!(f, "connectionError: {error:#}"),
            DispatcherSignal::FeedError(error) => write!(f, "feedError: {error:#}"),
            other => f.write_str(other.name()),
        }
    }
}
