//! Subscription keys and the filters they are built from.
//!
//! A [`SubscriptionKey`] is the identity of a logical subscription. Two
//! requests that produce equal keys share one backend channel.

use crate::error::RealtimeError;
use crate::event::ChangeKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which row changes a table subscription listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventFilter {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "*")]
    All,
}

impl EventFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventFilter::Insert => "INSERT",
            EventFilter::Update => "UPDATE",
            EventFilter::Delete => "DELETE",
            EventFilter::All => "*",
        }
    }

    pub fn matches(&self, kind: ChangeKind) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Insert => kind == ChangeKind::Insert,
            EventFilter::Update => kind == ChangeKind::Update,
            EventFilter::Delete => kind == ChangeKind::Delete,
        }
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventFilter {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(EventFilter::Insert),
            "UPDATE" => Ok(EventFilter::Update),
            "DELETE" => Ok(EventFilter::Delete),
            "*" => Ok(EventFilter::All),
            other => Err(RealtimeError::InvalidFilter(format!(
                "unknown event type '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::In => "in",
        }
    }
}

impl FromStr for FilterOp {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "eq" => FilterOp::Eq,
            "neq" => FilterOp::Neq,
            "lt" => FilterOp::Lt,
            "lte" => FilterOp::Lte,
            "gt" => FilterOp::Gt,
            "gte" => FilterOp::Gte,
            "in" => FilterOp::In,
            other => {
                return Err(RealtimeError::InvalidFilter(format!(
                    "unknown operator '{}'",
                    other
                )))
            }
        })
    }
}

/// Server-side row filter, rendered as `column=op.value`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowFilter {
    column: String,
    op: FilterOp,
    value: String,
}

impl RowFilter {
    pub fn new(
        column: impl Into<String>,
        op: FilterOp,
        value: impl Into<String>,
    ) -> Result<Self, RealtimeError> {
        let column = column.into();
        let value = value.into();

        if column.is_empty() || !column.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(RealtimeError::InvalidFilter(format!(
                "invalid column name '{}'",
                column
            )));
        }
        if value.is_empty() {
            return Err(RealtimeError::InvalidFilter(format!(
                "empty value for column '{}'",
                column
            )));
        }
        if op == FilterOp::In && !(value.starts_with('(') && value.ends_with(')')) {
            return Err(RealtimeError::InvalidFilter(format!(
                "'in' filter on '{}' needs a parenthesised list",
                column
            )));
        }

        Ok(Self { column, op, value })
    }

    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Result<Self, RealtimeError> {
        Self::new(column, FilterOp::Eq, value)
    }

    pub fn in_list<I, S>(column: impl Into<String>, values: I) -> Result<Self, RealtimeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = values
            .into_iter()
            .map(|v| v.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(",");
        Self::new(column, FilterOp::In, format!("({})", joined))
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn op(&self) -> FilterOp {
        self.op
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}.{}", self.column, self.op.as_str(), self.value)
    }
}

impl FromStr for RowFilter {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (column, rest) = s
            .split_once('=')
            .ok_or_else(|| RealtimeError::InvalidFilter(format!("missing '=' in '{}'", s)))?;
        let (op, value) = rest
            .split_once('.')
            .ok_or_else(|| RealtimeError::InvalidFilter(format!("missing operator in '{}'", s)))?;

        Self::new(column, op.parse()?, value)
    }
}

/// Identity of a logical subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionKey {
    /// Row changes on a table, narrowed by event type and optional filter.
    Table {
        table: String,
        event: EventFilter,
        filter: Option<RowFilter>,
    },
    /// Status transitions of a single entity row.
    EntityStatus { table: String, entity_id: String },
}

impl SubscriptionKey {
    pub fn table(
        table: impl Into<String>,
        event: EventFilter,
        filter: Option<RowFilter>,
    ) -> Self {
        SubscriptionKey::Table {
            table: table.into(),
            event,
            filter,
        }
    }

    pub fn entity_status(table: impl Into<String>, entity_id: impl Into<String>) -> Self {
        SubscriptionKey::EntityStatus {
            table: table.into(),
            entity_id: entity_id.into(),
        }
    }

    pub fn table_name(&self) -> &str {
        match self {
            SubscriptionKey::Table { table, .. } => table,
            SubscriptionKey::EntityStatus { table, .. } => table,
        }
    }

    pub fn event(&self) -> EventFilter {
        match self {
            SubscriptionKey::Table { event, .. } => *event,
            SubscriptionKey::EntityStatus { .. } => EventFilter::Update,
        }
    }

    pub fn filter(&self) -> Option<RowFilter> {
        match self {
            SubscriptionKey::Table { filter, .. } => filter.clone(),
            SubscriptionKey::EntityStatus { entity_id, .. } => Some(RowFilter {
                column: "id".to_string(),
                op: FilterOp::Eq,
                value: entity_id.clone(),
            }),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SubscriptionKey::Table { .. } => "table",
            SubscriptionKey::EntityStatus { .. } => "entity-status",
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionKey::Table {
                table,
                event,
                filter,
            } => match filter {
                Some(filter) => write!(f, "table:{}:{}:{}", table, event, filter),
                None => write!(f, "table:{}:{}", table, event),
            },
            SubscriptionKey::EntityStatus { table, entity_id } => {
                write!(f, "entity-status:{}:{}", table, entity_id)
            }
        }
    }
}
