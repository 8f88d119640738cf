//! Events delivered to the engine by the storage collaborator or by callers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A row-level change reported by the storage collaborator.
///
/// Fixed shape; exactly one of the three flags is expected to be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableEvent {
    pub table: String,
    pub primary_key: Map<String, Value>,
    pub event_time: DateTime<Utc>,
    pub user_id: Option<String>,
    pub is_insert: bool,
    pub is_update: bool,
    pub is_delete: bool,
}

impl TableEvent {
    fn new(table: impl Into<String>, primary_key: Map<String, Value>, kind: ChangeKind) -> Self {
        Self {
            table: table.into(),
            primary_key,
            event_time: Utc::now(),
            user_id: None,
            is_insert: kind == ChangeKind::Insert,
            is_update: kind == ChangeKind::Update,
            is_delete: kind == ChangeKind::Delete,
        }
    }

    pub fn insert(table: impl Into<String>, primary_key: Map<String, Value>) -> Self {
        Self::new(table, primary_key, ChangeKind::Insert)
    }

    pub fn update(table: impl Into<String>, primary_key: Map<String, Value>) -> Self {
        Self::new(table, primary_key, ChangeKind::Update)
    }

    pub fn delete(table: impl Into<String>, primary_key: Map<String, Value>) -> Self {
        Self::new(table, primary_key, ChangeKind::Delete)
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn kind(&self) -> Option<ChangeKind> {
        match (self.is_insert, self.is_update, self.is_delete) {
            (true, _, _) => Some(ChangeKind::Insert),
            (_, true, _) => Some(ChangeKind::Update),
            (_, _, true) => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

/// A named application-level event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomEvent {
    pub name: String,
    pub payload: Value,
    pub event_time: DateTime<Utc>,
}

impl CustomEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            event_time: Utc::now(),
        }
    }
}

/// Anything that can trigger a subscription pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Trigger {
    Table(TableEvent),
    Custom(CustomEvent),
}

impl Trigger {
    /// Initial payload handed to the subscribed pipeline
    pub fn to_value(&self) -> Value {
        match self {
            Trigger::Table(event) => serde_json::to_value(event).unwrap_or(Value::Null),
            Trigger::Custom(event) => serde_json::json!({
                "name": event.name,
                "payload": event.payload,
                "event_time": event.event_time,
            }),
        }
    }
}

impl From<TableEvent> for Trigger {
    fn from(event: TableEvent) -> Self {
        Self::Table(event)
    }
}

impl From<CustomEvent> for Trigger {
    fn from(event: CustomEvent) -> Self {
        Self::Custom(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A parsed subscription source: `table`, `table:insert|update|delete`
/// or `custom:<name>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionSource {
    Table {
        table: String,
        kind: Option<ChangeKind>,
    },
    Custom {
        name: String,
    },
}

impl SubscriptionSource {
    pub fn matches(&self, trigger: &Trigger) -> bool {
        match (self, trigger) {
            (SubscriptionSource::Table { table, kind }, Trigger::Table(event)) => {
                table == &event.table && kind.map_or(true, |k| event.kind() == Some(k))
            }
            (SubscriptionSource::Custom { name }, Trigger::Custom(event)) => name == &event.name,
            _ => false,
        }
    }
}

impl FromStr for SubscriptionSource {
    type Err = SourceError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        if input.is_empty() {
            return Err(SourceError(input.to_string()));
        }

        match input.split_once(':') {
            None => Ok(Self::Table {
                table: input.to_string(),
                kind: None,
            }),
            Some(("custom", name)) if !name.is_empty() => Ok(Self::Custom {
                name: name.to_string(),
            }),
            Some((table, op)) if !table.is_empty() => {
                let kind = match op.to_lowercase().as_str() {
                    "insert" => ChangeKind::Insert,
                    "update" => ChangeKind::Update,
                    "delete" => ChangeKind::Delete,
                    _ => return Err(SourceError(input.to_string())),
                };
                Ok(Self::Table {
                    table: table.to_string(),
                    kind: Some(kind),
                })
            }
            _ => Err(SourceError(input.to_string())),
        }
    }
}

impl fmt::Display for SubscriptionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Table { table, kind: None } => write!(f, "{}", table),
            Self::Table {
                table,
                kind: Some(kind),
            } => write!(f, "{}:{:?}", table, kind),
            Self::Custom { name } => write!(f, "custom:{}", name),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("Invalid subscription source '{0}'")]
pub struct SourceError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: i64) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("id".to_string(), Value::from(id));
        map
    }

    #[test]
    fn test_source_matching() {
        let any: SubscriptionSource = "message".parse().unwrap();
        let inserts: SubscriptionSource = "message:insert".parse().unwrap();
        let custom: SubscriptionSource = "custom:typing".parse().unwrap();

        let insert = Trigger::from(TableEvent::insert("message", key(1)));
        let delete = Trigger::from(TableEvent::delete("message", key(1)));
        let typing = Trigger::from(CustomEvent::new("typing", Value::Null));

        assert!(any.matches(&insert));
        assert!(any.matches(&delete));
        assert!(inserts.matches(&insert));
        assert!(!inserts.matches(&delete));
        assert!(custom.matches(&typing));
        assert!(!custom.matches(&insert));
    }

    #[test]
    fn test_invalid_sources() {
        assert!("".parse::<SubscriptionSource>().is_err());
        assert!("message:upsert".parse::<SubscriptionSource>().is_err());
        assert!("custom:".parse::<SubscriptionSource>().is_err());
    }

    #[test]
    fn test_event_flags() {
        let event = TableEvent::update("block", key(7)).with_user("u1");
        assert_eq!(event.kind(), Some(ChangeKind::Update));
        assert!(!event.is_insert && event.is_update && !event.is_delete);
        assert_eq!(event.user_id.as_deref(), Some("u1"));
    }
}
