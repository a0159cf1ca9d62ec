use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{named_params, Connection, OptionalExtension};
use ulid::Ulid;

use super::{
    check_write, merge_fields, resolve_server_values, FieldMap, ListenerRegistry, RawRecord,
    StoreEvent, StoreListener, StoreScope, TaskStore,
};
use crate::config::AppConfig;
use crate::error::StoreError;

/// Persistent store backed by a local SQLite database.
///
/// Each record is a JSON field map stored under `(path, key)`. Writes notify
/// listeners of the same path once the statement has committed.
#[derive(Clone)]
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
    registry: Arc<ListenerRegistry>,
}

impl SqliteTaskStore {
    pub fn initialize(config: &AppConfig) -> Result<Self> {
        Self::open(config.db_path())
    }

    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to configure SQLite WAL mode")?;
        apply_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            registry: ListenerRegistry::new(),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &ListenerRegistry) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let registry = Arc::clone(&self.registry);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&*guard, &*registry)
        })
        .await
        .map_err(|err| StoreError::Unavailable(format!("blocking task failed: {err}")))?
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn subscribe(&self, scope: StoreScope) -> Result<StoreListener, StoreError> {
        let registry = Arc::clone(&self.registry);
        self.with_conn(move |conn, _| {
            let records = records_in(conn, &scope)?;
            Ok(registry.register(scope, StoreEvent::Snapshot(records)))
        })
        .await
    }

    async fn query(&self, scope: &StoreScope) -> Result<Vec<RawRecord>, StoreError> {
        let scope = scope.clone();
        self.with_conn(move |conn, _| records_in(conn, &scope)).await
    }

    async fn create_record(
        &self,
        scope: &StoreScope,
        mut fields: FieldMap,
    ) -> Result<String, StoreError> {
        let scope = scope.clone();
        self.with_conn(move |conn, registry| {
            let now = Utc::now();
            resolve_server_values(&mut fields, now.timestamp_millis());
            let key = Ulid::new().to_string();
            if !scope.matches(&fields) {
                return Err(StoreError::Forbidden { key });
            }
            conn.execute(
                "INSERT INTO records (path, key, fields, created_at, updated_at)
                 VALUES (:path, :key, :fields, :created_at, :updated_at)",
                named_params![
                    ":path": &scope.path,
                    ":key": &key,
                    ":fields": serde_json::to_string(&fields)?,
                    ":created_at": now.to_rfc3339(),
                    ":updated_at": now.to_rfc3339(),
                ],
            )?;
            notify(conn, registry, &scope.path)?;
            Ok(key)
        })
        .await
    }

    async fn update_record(
        &self,
        scope: &StoreScope,
        key: &str,
        mut fields: FieldMap,
    ) -> Result<(), StoreError> {
        let scope = scope.clone();
        let key = key.to_string();
        self.with_conn(move |conn, registry| {
            let existing = load_fields(conn, &scope.path, &key)?;
            check_write(&scope, &key, existing.as_ref())?;
            let Some(mut merged) = existing else {
                return Err(StoreError::NotFound { key });
            };

            let now = Utc::now();
            resolve_server_values(&mut fields, now.timestamp_millis());
            merge_fields(&mut merged, fields);
            if !scope.matches(&merged) {
                return Err(StoreError::Forbidden { key });
            }
            conn.execute(
                "UPDATE records SET fields = :fields, updated_at = :updated_at
                 WHERE path = :path AND key = :key",
                named_params![
                    ":fields": serde_json::to_string(&merged)?,
                    ":updated_at": now.to_rfc3339(),
                    ":path": &scope.path,
                    ":key": &key,
                ],
            )?;
            notify(conn, registry, &scope.path)?;
            Ok(())
        })
        .await
    }

    async fn delete_record(&self, scope: &StoreScope, key: &str) -> Result<(), StoreError> {
        let scope = scope.clone();
        let key = key.to_string();
        self.with_conn(move |conn, registry| {
            let existing = load_fields(conn, &scope.path, &key)?;
            check_write(&scope, &key, existing.as_ref())?;
            conn.execute(
                "DELETE FROM records WHERE path = :path AND key = :key",
                named_params![":path": &scope.path, ":key": &key],
            )?;
            notify(conn, registry, &scope.path)?;
            Ok(())
        })
        .await
    }

    async fn fetch_record(
        &self,
        scope: &StoreScope,
        key: &str,
    ) -> Result<Option<RawRecord>, StoreError> {
        let scope = scope.clone();
        let key = key.to_string();
        self.with_conn(move |conn, _| {
            Ok(load_fields(conn, &scope.path, &key)?
                .filter(|fields| scope.matches(fields))
                .map(|fields| RawRecord::new(key, fields)))
        })
        .await
    }

    fn listener_count(&self) -> usize {
        self.registry.len()
    }
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT);
         CREATE TABLE IF NOT EXISTS records (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            path TEXT NOT NULL,
            key TEXT NOT NULL,
            fields TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (path, key)
         );
         CREATE INDEX IF NOT EXISTS idx_records_path ON records(path);
        ",
    )?;
    Ok(())
}

fn load_fields(conn: &Connection, path: &str, key: &str) -> Result<Option<FieldMap>, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT fields FROM records WHERE path = :path AND key = :key LIMIT 1",
            named_params![":path": path, ":key": key],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|json| serde_json::from_str::<FieldMap>(&json))
        .transpose()
        .map_err(StoreError::from)
}

fn records_in(conn: &Connection, scope: &StoreScope) -> Result<Vec<RawRecord>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT key, fields FROM records WHERE path = ? ORDER BY seq ASC")?;
    let mut rows = stmt.query([&scope.path])?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let key: String = row.get(0)?;
        let fields: FieldMap = serde_json::from_str(&row.get::<_, String>(1)?)?;
        if scope.matches(&fields) {
            records.push(RawRecord::new(key, fields));
        }
    }
    Ok(records)
}

fn notify(conn: &Connection, registry: &ListenerRegistry, path: &str) -> Result<(), StoreError> {
    for (id, scope) in registry.watching(path) {
        registry.send(id, StoreEvent::Snapshot(records_in(conn, &scope)?));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn temp_store() -> (SqliteTaskStore, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let config = AppConfig::from_data_dir(dir.path().to_path_buf()).expect("config");
        let store = SqliteTaskStore::initialize(&config).expect("store");
        (store, dir)
    }

    fn title(value: &str) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("title".into(), json!(value));
        fields
    }

    #[tokio::test]
    async fn records_survive_reopen_in_arrival_order() {
        let dir = TempDir::new().expect("temp dir");
        let config = AppConfig::from_data_dir(dir.path().to_path_buf()).expect("config");
        let scope = StoreScope::path("tasks/u1");
        let (a, b) = {
            let store = SqliteTaskStore::initialize(&config).expect("store");
            let a = store.create_record(&scope, title("first")).await.expect("a");
            let b = store.create_record(&scope, title("second")).await.expect("b");
            (a, b)
        };

        let reopened = SqliteTaskStore::initialize(&config).expect("reopen");
        let keys: Vec<String> = reopened
            .query(&scope)
            .await
            .expect("query")
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(keys, vec![a, b]);
    }

    #[tokio::test]
    async fn update_merges_and_resolves_server_time() {
        let (store, _dir) = temp_store();
        let scope = StoreScope::path("tasks/u1");
        let key = store.create_record(&scope, title("Draft")).await.expect("create");

        let mut patch = FieldMap::new();
        patch.insert("completed".into(), json!(true));
        patch.insert("completedAt".into(), crate::store::server_timestamp());
        store.update_record(&scope, &key, patch).await.expect("update");

        let record = store
            .fetch_record(&scope, &key)
            .await
            .expect("fetch")
            .expect("present");
        assert_eq!(record.fields["title"], json!("Draft"));
        assert_eq!(record.fields["completed"], json!(true));
        assert!(record.fields["completedAt"].is_i64());
    }

    #[tokio::test]
    async fn live_listener_receives_commits() {
        let (store, _dir) = temp_store();
        let scope = StoreScope::path("tasks/u1");
        let mut listener = store.subscribe(scope.clone()).await.expect("subscribe");
        assert_eq!(listener.recv().await, Some(StoreEvent::Snapshot(vec![])));

        let key = store.create_record(&scope, title("Ping")).await.expect("create");
        match listener.recv().await {
            Some(StoreEvent::Snapshot(records)) => assert_eq!(records[0].key, key),
            other => panic!("unexpected event {other:?}"),
        }

        store.delete_record(&scope, &key).await.expect("delete");
        assert_eq!(listener.recv().await, Some(StoreEvent::Snapshot(vec![])));

        drop(listener);
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test]
    async fn foreign_records_are_forbidden() {
        let (store, _dir) = temp_store();
        let owner = StoreScope::path("tasks").with_filter("userId", "owner");
        let other = StoreScope::path("tasks").with_filter("userId", "other");
        let mut fields = title("Private");
        fields.insert("userId".into(), json!("owner"));
        let key = store.create_record(&owner, fields).await.expect("create");

        assert!(store.fetch_record(&other, &key).await.expect("fetch").is_none());
        assert_eq!(
            store.delete_record(&other, &key).await,
            Err(StoreError::Forbidden { key: key.clone() })
        );
        assert_eq!(
            store.delete_record(&other, "missing").await,
            Err(StoreError::NotFound {
                key: "missing".into()
            })
        );
    }
}
