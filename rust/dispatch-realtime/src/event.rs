use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

static FALLBACK_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

/// A single row change delivered by the change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub schema: String,
    pub table: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    #[serde(default)]
    pub commit_timestamp: Option<String>,
    #[serde(default)]
    pub record: Value,
    #[serde(default)]
    pub old_record: Value,
}

impl ChangeEvent {
    pub fn new(table: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            schema: "public".to_string(),
            table: table.into(),
            kind,
            commit_timestamp: None,
            record: Value::Null,
            old_record: Value::Null,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_record(mut self, record: Value) -> Self {
        self.record = record;
        self
    }

    pub fn with_old_record(mut self, old_record: Value) -> Self {
        self.old_record = old_record;
        self
    }

    pub fn with_commit_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.commit_timestamp = Some(timestamp.into());
        self
    }

    /// Primary key of the affected row, from the new record or, for
    /// deletes, the old one.
    pub fn row_id(&self) -> Option<String> {
        [&self.record, &self.old_record]
            .into_iter()
            .filter_map(|row| row.get("id"))
            .find_map(|id| match id {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }

    /// Token under which repeated deliveries of this event are recognised.
    pub fn identity_token(&self) -> String {
        match self.row_id() {
            Some(id) => format!(
                "{}:{}:{}:{}",
                self.kind.as_str(),
                self.table,
                id,
                self.commit_timestamp.as_deref().unwrap_or("-")
            ),
            None => format!("seq:{}", FALLBACK_SEQ.fetch_add(1, Ordering::Relaxed)),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.record.get(name)
    }

    pub fn old_field(&self, name: &str) -> Option<&Value> {
        self.old_record.get(name)
    }

    /// Decode into a typed change. Only `record` must match `T`; an
    /// `old_record` carrying just the key columns decodes to `old: None`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<RowChange<T>, serde_json::Error> {
        let old = decode_partial::<T>(&self.old_record);
        Ok(match self.kind {
            ChangeKind::Insert => RowChange::Inserted(serde_json::from_value(self.record.clone())?),
            ChangeKind::Update => RowChange::Updated {
                new: serde_json::from_value(self.record.clone())?,
                old,
            },
            ChangeKind::Delete => RowChange::Deleted { old },
        })
    }
}

fn decode_partial<T: DeserializeOwned>(value: &Value) -> Option<T> {
    match value {
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        other => serde_json::from_value(other.clone()).ok(),
    }
}

/// A row type bound to the table it is stored in.
pub trait TableRow: DeserializeOwned + Send + 'static {
    const TABLE: &'static str;
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowChange<T> {
    Inserted(T),
    Updated { new: T, old: Option<T> },
    Deleted { old: Option<T> },
}

impl<T> RowChange<T> {
    pub fn current(&self) -> Option<&T> {
        match self {
            RowChange::Inserted(row) => Some(row),
            RowChange::Updated { new, .. } => Some(new),
            RowChange::Deleted { .. } => None,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            RowChange::Inserted(_) => ChangeKind::Insert,
            RowChange::Updated { .. } => ChangeKind::Update,
            RowChange::Deleted { .. } => ChangeKind::Delete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Mission {
        id: String,
        status: String,
    }

    impl TableRow for Mission {
        const TABLE: &'static str = "missions";
    }

    #[test]
    fn test_parse_feed_payload() {
        let event: ChangeEvent = serde_json::from_value(json!({
            "schema": "public",
            "table": "missions",
            "type": "UPDATE",
            "commit_timestamp": "2026-03-01T10:00:00Z",
            "record": {"id": "m1", "status": "assigned"},
            "old_record": {"id": "m1"}
        }))
        .unwrap();

        assert_eq!(event.kind, ChangeKind::Update);
        assert_eq!(event.row_id().as_deref(), Some("m1"));
        assert_eq!(event.field("status"), Some(&json!("assigned")));
    }

    #[test]
    fn test_identity_token_is_stable_for_same_commit() {
        let a = ChangeEvent::new("missions", ChangeKind::Insert)
            .with_record(json!({"id": "m1"}))
            .with_commit_timestamp("t0");
        let b = a.clone();
        let c = a.clone().with_commit_timestamp("t1");

        assert_eq!(a.identity_token(), b.identity_token());
        assert_ne!(a.identity_token(), c.identity_token());
        assert_eq!(a.identity_token(), "INSERT:missions:m1:t0");
    }

    #[test]
    fn test_numeric_ids_and_delete_fallback() {
        let deleted = ChangeEvent::new("reservations", ChangeKind::Delete)
            .with_old_record(json!({"id": 17}));
        assert_eq!(deleted.row_id().as_deref(), Some("17"));
    }

    #[test]
    fn test_rows_without_id_never_collide() {
        let event = ChangeEvent::new("audit", ChangeKind::Insert).with_record(json!({"x": 1}));
        assert_ne!(event.identity_token(), event.identity_token());
    }

    #[test]
    fn test_decode_typed_change() {
        let event = ChangeEvent::new(Mission::TABLE, ChangeKind::Update)
            .with_record(json!({"id": "m1", "status": "done"}))
            .with_old_record(json!({}));

        let change = event.decode::<Mission>().unwrap();
        assert_eq!(change.kind(), ChangeKind::Update);
        assert_eq!(
            change,
            RowChange::Updated {
                new: Mission {
                    id: "m1".into(),
                    status: "done".into()
                },
                old: None
            }
        );

        let delete = ChangeEvent::new(Mission::TABLE, ChangeKind::Delete)
            .with_old_record(json!({"id": "m1", "status": "done"}));
        assert!(delete.decode::<Mission>().unwrap().current().is_none());
    }

    #[test]
    fn test_key_only_old_record_still_decodes() {
        let update = ChangeEvent::new(Mission::TABLE, ChangeKind::Update)
            .with_record(json!({"id": "m1", "status": "assigned"}))
            .with_old_record(json!({"id": "m1"}));
        assert_eq!(
            update.decode::<Mission>().unwrap(),
            RowChange::Updated {
                new: Mission {
                    id: "m1".into(),
                    status: "assigned".into()
                },
                old: None
            }
        );

        let delete = ChangeEvent::new(Mission::TABLE, ChangeKind::Delete)
            .with_old_record(json!({"id": "m1"}));
        assert_eq!(
            delete.decode::<Mission>().unwrap(),
            RowChange::Deleted { old: None }
        );

        let broken = ChangeEvent::new(Mission::TABLE, ChangeKind::Update)
            .with_record(json!({"id": "m1"}))
            .with_old_record(json!({"id": "m1", "status": "open"}));
        assert!(broken.decode::<Mission>().is_err());
    }
}
