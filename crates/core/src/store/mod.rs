//! Contract for the remote task store plus the in-process and SQLite backends.
//!
//! A store holds keyed records under a path. Reads and writes are scoped by a
//! [`StoreScope`]: a path plus equality filters on record fields. Live
//! subscriptions push a full record set for the scope after every committed
//! write, until the returned [`StoreListener`] is released.

mod listener;
mod memory;
mod sqlite;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::StoreError;

pub use listener::StoreListener;
pub(crate) use listener::ListenerRegistry;
pub use memory::MemoryTaskStore;
pub use sqlite::SqliteTaskStore;

pub type FieldMap = serde_json::Map<String, Value>;

const SERVER_VALUE_KEY: &str = ".sv";
const SERVER_VALUE_TIMESTAMP: &str = "timestamp";

/// A record as the store hands it out: its key plus an opaque field map.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub key: String,
    pub fields: FieldMap,
}

impl RawRecord {
    pub fn new(key: impl Into<String>, fields: FieldMap) -> Self {
        Self {
            key: key.into(),
            fields,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreScope {
    pub path: String,
    pub filters: Vec<(String, Value)>,
}

impl StoreScope {
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            filters: Vec::new(),
        }
    }

    pub fn with_filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    pub fn matches(&self, fields: &FieldMap) -> bool {
        self.filters
            .iter()
            .all(|(field, expected)| fields.get(field) == Some(expected))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Snapshot(Vec<RawRecord>),
    Error(StoreError),
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Open a live subscription. The current record set is delivered first.
    async fn subscribe(&self, scope: StoreScope) -> Result<StoreListener, StoreError>;

    /// One-shot read of every record in scope, in arrival order.
    async fn query(&self, scope: &StoreScope) -> Result<Vec<RawRecord>, StoreError>;

    /// Push a new record and return its store-assigned key.
    async fn create_record(&self, scope: &StoreScope, fields: FieldMap)
        -> Result<String, StoreError>;

    /// Merge `fields` into an existing record in one atomic write.
    async fn update_record(
        &self,
        scope: &StoreScope,
        key: &str,
        fields: FieldMap,
    ) -> Result<(), StoreError>;

    async fn delete_record(&self, scope: &StoreScope, key: &str) -> Result<(), StoreError>;

    /// Records outside the scope filters read as absent.
    async fn fetch_record(
        &self,
        scope: &StoreScope,
        key: &str,
    ) -> Result<Option<RawRecord>, StoreError>;

    /// Number of live listeners still registered.
    fn listener_count(&self) -> usize;
}

/// Sentinel the store replaces with its own clock (epoch millis) at commit.
pub fn server_timestamp() -> Value {
    json!({ SERVER_VALUE_KEY: SERVER_VALUE_TIMESTAMP })
}

pub fn is_server_timestamp(value: &Value) -> bool {
    value
        .as_object()
        .and_then(|obj| obj.get(SERVER_VALUE_KEY))
        .and_then(Value::as_str)
        == Some(SERVER_VALUE_TIMESTAMP)
}

pub(crate) fn resolve_server_values(fields: &mut FieldMap, now_millis: i64) {
    for value in fields.values_mut() {
        if is_server_timestamp(value) {
            *value = Value::from(now_millis);
        }
    }
}

/// Apply a partial write on top of an existing field map.
pub(crate) fn merge_fields(target: &mut FieldMap, patch: FieldMap) {
    for (field, value) in patch {
        target.insert(field, value);
    }
}

/// Checks shared by every backend before a write touches an existing record.
pub(crate) fn check_write(
    scope: &StoreScope,
    key: &str,
    existing: Option<&FieldMap>,
) -> Result<(), StoreError> {
    match existing {
        None => Err(StoreError::NotFound {
            key: key.to_string(),
        }),
        Some(fields) if !scope.matches(fields) => Err(StoreError::Forbidden {
            key: key.to_string(),
        }),
        Some(_) => Ok(()),
    }
}
