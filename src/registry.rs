//! Trigger registry.
//!
//! Triggers are grouped by expression and then by statement. Expression
//! groups keep their registration order, which is the order the matcher
//! visits them in.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use async_trait::async_trait;
use binlog_core::{FilterExpression, NormalizedEvent, Statement};
use indexmap::IndexMap;
use tracing::debug;

use crate::error::{TriggerError, ValidationError};

/// Subscriber invoked for every matching event.
///
/// Errors returned here (and panics) are reported as trigger errors by the
/// dispatcher and never reach other triggers.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use binlog_core::NormalizedEvent;
/// use binlog_triggers::TriggerHandler;
///
/// struct Audit;
///
/// #[async_trait::async_trait]
/// impl TriggerHandler for Audit {
///     async fn on_event(&self, event: Arc<NormalizedEvent>) -> anyhow::Result<()> {
///         println!("{} on {}.{}", event.event_type, event.schema, event.table);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait TriggerHandler: Send + Sync + 'static {
    async fn on_event(&self, event: Arc<NormalizedEvent>) -> anyhow::Result<()>;
}

/// Adapter that wraps an async closure into a [`TriggerHandler`].
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TriggerHandler for FnHandler<F>
where
    F: Fn(Arc<NormalizedEvent>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn on_event(&self, event: Arc<NormalizedEvent>) -> anyhow::Result<()> {
        (self.0)(event).await
    }
}

/// Build a [`TriggerHandler`] from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> impl TriggerHandler
where
    F: Fn(Arc<NormalizedEvent>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler(f)
}

/// A registered trigger.
pub struct Trigger {
    pub name: String,
    pub expression: String,
    pub statement: Statement,
    pub(crate) handler: Arc<dyn TriggerHandler>,
}

impl Trigger {
    /// Invoke the trigger's handler.
    pub async fn on_event(&self, event: Arc<NormalizedEvent>) -> anyhow::Result<()> {
        self.handler.on_event(event).await
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("name", &self.name)
            .field("expression", &self.expression)
            .field("statement", &self.statement)
            .finish_non_exhaustive()
    }
}

/// Triggers registered under one expression.
pub(crate) struct ExpressionTriggers {
    pub(crate) filter: FilterExpression,
    pub(crate) statements: HashMap<Statement, Vec<Arc<Trigger>>>,
}

/// Registry of triggers, shared between callers and the dispatcher.
#[derive(Default)]
pub struct TriggerRegistry {
    expressions: RwLock<IndexMap<String, ExpressionTriggers>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a trigger.
    ///
    /// Fails if `name` or `expression` is empty, if the expression does not
    /// parse, or if a trigger with the same name already exists for the same
    /// expression and statement.
    pub fn add(
        &self,
        name: impl Into<String>,
        expression: impl Into<String>,
        statement: Statement,
        handler: impl TriggerHandler,
    ) -> Result<Arc<Trigger>, TriggerError> {
        self.add_shared(name, expression, statement, Arc::new(handler))
    }

    /// Register a trigger with a handler that may be shared with other triggers.
    pub fn add_shared(
        &self,
        name: impl Into<String>,
        expression: impl Into<String>,
        statement: Statement,
        handler: Arc<dyn TriggerHandler>,
    ) -> Result<Arc<Trigger>, TriggerError> {
        let name = name.into();
        let expression = expression.into();

        if name.is_empty() {
            return Err(ValidationError::MissingName.into());
        }
        if expression.is_empty() {
            return Err(ValidationError::MissingExpression.into());
        }
        let filter = FilterExpression::parse(&expression).map_err(ValidationError::from)?;

        let mut expressions = self
            .expressions
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let group = expressions
            .entry(expression.clone())
            .or_insert_with(|| ExpressionTriggers {
                filter,
                statements: HashMap::new(),
            });
        let triggers = group.statements.entry(statement).or_default();

        if triggers.iter().any(|trigger| trigger.name == name) {
            return Err(TriggerError::DuplicateTrigger {
                name,
                expression,
                statement,
            });
        }

        debug!(
            "adding trigger '{}' for expression '{}' ({})",
            name, expression, statement
        );
        let trigger = Arc::new(Trigger {
            name,
            expression,
            statement,
            handler,
        });
        triggers.push(Arc::clone(&trigger));
        Ok(trigger)
    }

    /// Remove a trigger. Returns whether one was removed; removing an unknown
    /// trigger is a no-op.
    pub fn remove(&self, name: &str, expression: &str, statement: Statement) -> bool {
        let mut expressions = self
            .expressions
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(group) = expressions.get_mut(expression) else {
            return false;
        };
        let Some(triggers) = group.statements.get_mut(&statement) else {
            return false;
        };
        let Some(index) = triggers.iter().position(|trigger| trigger.name == name) else {
            return false;
        };

        debug!(
            "removing trigger '{}' for expression '{}' ({})",
            name, expression, statement
        );
        triggers.remove(index);

        // Prune emptied buckets and groups
        if triggers.is_empty() {
            group.statements.remove(&statement);
        }
        if group.statements.is_empty() {
            expressions.shift_remove(expression);
        }
        true
    }

    /// All registered triggers, in expression order.
    pub fn triggers(&self) -> Vec<Arc<Trigger>> {
        let expressions = self.read();
        expressions
            .values()
            .flat_map(|group| {
                Statement::VALUES
                    .iter()
                    .filter_map(|statement| group.statements.get(statement))
                    .flatten()
                    .cloned()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read()
            .values()
            .flat_map(|group| group.statements.values())
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, IndexMap<String, ExpressionTriggers>> {
        self.expressions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerRegistry")
            .field("triggers", &self.triggers())
            .finish()
    }
}
