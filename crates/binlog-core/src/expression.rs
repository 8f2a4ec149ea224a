//! Trigger filter expressions.
//!
//! An expression is a dot-delimited path of up to four segments:
//!
//! ```text
//! schema[.table[.column[.value]]]
//! ```
//!
//! A `*` segment matches anything. Omitted (or empty) table, column and value
//! segments match anything as well, so `"app"` selects every table in the
//! `app` schema and `"*"` selects everything. The schema segment is always
//! present and is compared literally unless it is `*`.

use std::fmt;
use std::str::FromStr;

use crate::event::NormalizedEvent;

/// Wildcard segment.
pub const WILDCARD: &str = "*";

/// Maximum number of segments in an expression.
pub const MAX_SEGMENTS: usize = 4;

/// Error parsing a filter expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpressionError {
    #[error("Trigger expression is empty")]
    Empty,
    #[error("Trigger expression '{expression}' has {segments} segments, at most 4 are allowed")]
    TooManySegments { expression: String, segments: usize },
}

/// One segment of an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// `*`, or omitted
    Any,
    Literal(String),
}

impl Segment {
    fn optional(part: Option<&str>) -> Self {
        match part {
            None | Some("") | Some(WILDCARD) => Segment::Any,
            Some(literal) => Segment::Literal(literal.to_string()),
        }
    }

    pub fn matches(&self, candidate: &str) -> bool {
        match self {
            Segment::Any => true,
            Segment::Literal(literal) => literal == candidate,
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Segment::Any)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Any => f.write_str(WILDCARD),
            Segment::Literal(literal) => f.write_str(literal),
        }
    }
}

/// A parsed filter expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterExpression {
    pub schema: Segment,
    pub table: Segment,
    pub column: Segment,
    /// Parsed but not used for matching yet.
    pub value: Segment,
}

impl FilterExpression {
    pub fn parse(expression: &str) -> Result<Self, ExpressionError> {
        if expression.is_empty() {
            return Err(ExpressionError::Empty);
        }

        let parts: Vec<&str> = expression.split('.').collect();
        if parts.len() > MAX_SEGMENTS {
            return Err(ExpressionError::TooManySegments {
                expression: expression.to_string(),
                segments: parts.len(),
            });
        }

        // The schema segment is compared literally even when empty.
        let schema = match parts[0] {
            WILDCARD => Segment::Any,
            literal => Segment::Literal(literal.to_string()),
        };

        Ok(Self {
            schema,
            table: Segment::optional(parts.get(1).copied()),
            column: Segment::optional(parts.get(2).copied()),
            value: Segment::optional(parts.get(3).copied()),
        })
    }

    /// Whether a normalized event passes the schema, table and column filters.
    pub fn matches(&self, event: &NormalizedEvent) -> bool {
        if !self.schema.matches(&event.schema) {
            return false;
        }
        if !self.table.matches(&event.table) {
            return false;
        }
        match &self.column {
            Segment::Any => true,
            Segment::Literal(column) => event.affected_columns.iter().any(|c| c == column),
        }
    }
}

impl FromStr for FilterExpression {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
