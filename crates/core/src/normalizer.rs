//! Maps raw backend records onto [`Task`].
//!
//! Two persistence layouts exist and they do not interoperate:
//!
//! * `tree`: records live under `tasks/{uid}`; timestamps are epoch millis.
//! * `collection`: every record lives under `tasks` and carries `userId`;
//!   timestamps arrive as epoch millis, `{seconds, nanoseconds}` objects or
//!   RFC 3339 strings.
//!
//! The layout is chosen by configuration and business logic only ever sees
//! the normalized type.

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, TimeZone, Utc};
use clap::ValueEnum;
use serde::Serialize;
use serde_json::Value;

use crate::error::TaskError;
use crate::model::{Priority, Task};
use crate::store::{FieldMap, RawRecord, StoreScope};

pub const TASKS_PATH: &str = "tasks";
pub const OWNER_FIELD: &str = "userId";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreLayout {
    #[default]
    Tree,
    Collection,
}

impl StoreLayout {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreLayout::Tree => "tree",
            StoreLayout::Collection => "collection",
        }
    }

    /// Scope holding every task of `user_id`, and nothing else.
    pub fn task_scope(&self, user_id: &str) -> StoreScope {
        match self {
            StoreLayout::Tree => StoreScope::path(format!("{TASKS_PATH}/{user_id}")),
            StoreLayout::Collection => {
                StoreScope::path(TASKS_PATH).with_filter(OWNER_FIELD, user_id)
            }
        }
    }

    /// Fields stamped on every new record so it lands inside the owner's scope.
    pub fn owner_fields(&self, user_id: &str) -> FieldMap {
        let mut fields = FieldMap::new();
        if let StoreLayout::Collection = self {
            fields.insert(OWNER_FIELD.into(), Value::from(user_id));
        }
        fields
    }

    pub fn normalizer(&self) -> &'static dyn RecordNormalizer {
        match self {
            StoreLayout::Tree => &TreeNormalizer,
            StoreLayout::Collection => &CollectionNormalizer,
        }
    }
}

impl fmt::Display for StoreLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StoreLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tree" => Ok(StoreLayout::Tree),
            "collection" | "document" => Ok(StoreLayout::Collection),
            other => Err(anyhow!(
                "Unknown store layout '{}': expected tree|collection",
                other
            )),
        }
    }
}

impl ValueEnum for StoreLayout {
    fn value_variants<'a>() -> &'a [Self] {
        const VARIANTS: [StoreLayout; 2] = [StoreLayout::Tree, StoreLayout::Collection];
        &VARIANTS
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(self.as_str()))
    }
}

pub trait RecordNormalizer: Send + Sync {
    /// Fails with [`TaskError::MalformedRecord`] when `title` is missing.
    fn normalize(&self, record: &RawRecord) -> Result<Task, TaskError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TreeNormalizer;

impl RecordNormalizer for TreeNormalizer {
    fn normalize(&self, record: &RawRecord) -> Result<Task, TaskError> {
        build_task(record, read_millis, None)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CollectionNormalizer;

impl RecordNormalizer for CollectionNormalizer {
    fn normalize(&self, record: &RawRecord) -> Result<Task, TaskError> {
        let owner = text(&record.fields, OWNER_FIELD);
        build_task(record, read_document_time, owner)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedBatch {
    pub tasks: Vec<Task>,
    pub skipped: usize,
}

/// Normalize a whole snapshot, skipping records that cannot be mapped.
pub fn normalize_all(normalizer: &dyn RecordNormalizer, records: &[RawRecord]) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    for record in records {
        match normalizer.normalize(record) {
            Ok(task) => batch.tasks.push(task),
            Err(err) => {
                tracing::warn!(key = record.key.as_str(), error = %err, "skipping task record");
                batch.skipped += 1;
            }
        }
    }
    batch
}

type TimeReader = fn(&Value) -> Option<DateTime<Utc>>;

fn build_task(
    record: &RawRecord,
    read_time: TimeReader,
    user_id: Option<String>,
) -> Result<Task, TaskError> {
    let fields = &record.fields;
    let title = match fields.get("title") {
        Some(Value::String(title)) if !title.trim().is_empty() => title.clone(),
        Some(Value::String(_)) => return Err(TaskError::malformed(&record.key, "title is empty")),
        Some(_) => return Err(TaskError::malformed(&record.key, "title is not text")),
        None => return Err(TaskError::malformed(&record.key, "title is missing")),
    };

    let created_at = fields
        .get("createdAt")
        .and_then(read_time)
        .unwrap_or_default();
    let completed = fields
        .get("completed")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let completed_at = if completed {
        Some(
            fields
                .get("completedAt")
                .and_then(read_time)
                .unwrap_or(created_at),
        )
    } else {
        None
    };

    Ok(Task {
        id: record.key.clone(),
        title,
        description: text(fields, "description"),
        points: read_points(fields.get("points")),
        completed,
        completed_at,
        created_at,
        due_date: text(fields, "dueDate"),
        category: text(fields, "category"),
        priority: text(fields, "priority").and_then(|p| p.parse::<Priority>().ok()),
        image_uri: text(fields, "imageUri"),
        user_id,
    })
}

fn text(fields: &FieldMap, name: &str) -> Option<String> {
    fields
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn read_points(value: Option<&Value>) -> u32 {
    let parsed = match value {
        None | Some(Value::Null) => return crate::capture::DEFAULT_POINTS,
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        Some(_) => None,
    };
    parsed
        .map(|p| p.clamp(0, i64::from(u32::MAX)) as u32)
        .unwrap_or(0)
}

fn read_millis(value: &Value) -> Option<DateTime<Utc>> {
    let millis = value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))?;
    Utc.timestamp_millis_opt(millis).single()
}

fn read_document_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(_) => read_millis(value),
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Object(obj) => {
            let seconds = obj
                .get("seconds")
                .or_else(|| obj.get("_seconds"))
                .and_then(Value::as_i64)?;
            let nanos = obj
                .get("nanoseconds")
                .or_else(|| obj.get("_nanoseconds"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            Utc.timestamp_opt(seconds, nanos.min(999_999_999) as u32)
                .single()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record(key: &str, value: Value) -> RawRecord {
        match value {
            Value::Object(fields) => RawRecord::new(key, fields),
            _ => panic!("record fields must be an object"),
        }
    }

    #[test]
    fn tree_record_defaults_optional_fields() {
        let task = TreeNormalizer
            .normalize(&record("k1", json!({ "title": "Buy milk", "createdAt": 1_700_000_000_000_i64 })))
            .unwrap();
        assert_eq!(task.id, "k1");
        assert_eq!(task.points, 100);
        assert!(!task.completed);
        assert_eq!(task.completed_at, None);
        assert_eq!(task.description, None);
        assert_eq!(task.created_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn missing_title_is_malformed() {
        let err = TreeNormalizer
            .normalize(&record("k2", json!({ "description": "no title" })))
            .unwrap_err();
        assert!(matches!(err, TaskError::MalformedRecord { ref key, .. } if key == "k2"));
    }

    #[test]
    fn blank_or_non_text_title_is_malformed() {
        for (key, title) in [("k3", json!("   ")), ("k4", json!(42))] {
            let err = CollectionNormalizer
                .normalize(&record(key, json!({ "title": title, "userId": "u1" })))
                .unwrap_err();
            assert!(matches!(err, TaskError::MalformedRecord { key: ref k, .. } if k == key));
        }
    }

    #[test]
    fn collection_record_reads_document_shapes() {
        let task = CollectionNormalizer
            .normalize(&record(
                "doc1",
                json!({
                    "title": "Report",
                    "userId": "u1",
                    "points": "40",
                    "completed": true,
                    "completedAt": { "seconds": 1_700_000_100, "nanoseconds": 0 },
                    "createdAt": "2023-11-14T22:13:20Z",
                    "dueDate": "2023-12-01",
                    "category": "Work",
                    "priority": "high",
                    "imageUri": "file:///tmp/a.png"
                }),
            ))
            .unwrap();
        assert_eq!(task.user_id.as_deref(), Some("u1"));
        assert_eq!(task.points, 40);
        assert_eq!(task.priority, Some(Priority::High));
        assert_eq!(task.completed_at.map(|t| t.timestamp()), Some(1_700_000_100));
        assert_eq!(task.created_at.timestamp(), 1_700_000_000);
        assert_eq!(task.due_date.as_deref(), Some("2023-12-01"));
        assert!(task.is_consistent());
    }

    #[test]
    fn inconsistent_completion_is_repaired() {
        let done_without_time = TreeNormalizer
            .normalize(&record("a", json!({ "title": "A", "completed": true, "createdAt": 5 })))
            .unwrap();
        assert_eq!(done_without_time.completed_at.map(|t| t.timestamp_millis()), Some(5));

        let open_with_time = TreeNormalizer
            .normalize(&record("b", json!({ "title": "B", "completed": false, "completedAt": 9 })))
            .unwrap();
        assert_eq!(open_with_time.completed_at, None);
    }

    #[test]
    fn negative_or_garbage_points_clamp_to_zero() {
        let negative = TreeNormalizer
            .normalize(&record("a", json!({ "title": "A", "points": -5 })))
            .unwrap();
        assert_eq!(negative.points, 0);
        let garbage = TreeNormalizer
            .normalize(&record("b", json!({ "title": "B", "points": [1] })))
            .unwrap();
        assert_eq!(garbage.points, 0);
    }

    #[test]
    fn batch_skips_malformed_records() {
        let records = vec![
            record("a", json!({ "title": "A" })),
            record("b", json!({ "points": 10 })),
            record("c", json!({ "title": "C" })),
        ];
        let batch = normalize_all(&TreeNormalizer, &records);
        let ids: Vec<&str> = batch.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(batch.skipped, 1);
    }

    #[test]
    fn layouts_scope_by_path_or_owner() {
        assert_eq!(StoreLayout::Tree.task_scope("u1"), StoreScope::path("tasks/u1"));
        assert_eq!(
            StoreLayout::Collection.task_scope("u1"),
            StoreScope::path("tasks").with_filter("userId", "u1")
        );
        assert!(StoreLayout::Tree.owner_fields("u1").is_empty());
        assert_eq!(StoreLayout::Collection.owner_fields("u1")["userId"], json!("u1"));
    }
}
