use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use ulid::Ulid;

use super::{
    check_write, merge_fields, resolve_server_values, FieldMap, ListenerRegistry, RawRecord,
    StoreEvent, StoreListener, StoreScope, TaskStore,
};
use crate::error::StoreError;

const OFFLINE_MESSAGE: &str = "network unreachable";

#[derive(Default)]
struct MemoryState {
    paths: HashMap<String, Vec<RawRecord>>,
    offline: bool,
}

impl MemoryState {
    fn records_in(&self, scope: &StoreScope) -> Vec<RawRecord> {
        self.paths
            .get(&scope.path)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| scope.matches(&record.fields))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn position(&self, path: &str, key: &str) -> Option<usize> {
        self.paths
            .get(path)
            .and_then(|records| records.iter().position(|record| record.key == key))
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.offline {
            Err(StoreError::Unavailable(OFFLINE_MESSAGE.into()))
        } else {
            Ok(())
        }
    }
}

/// In-process store with push semantics. Records keep arrival order.
pub struct MemoryTaskStore {
    state: Mutex<MemoryState>,
    registry: Arc<ListenerRegistry>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            registry: ListenerRegistry::new(),
        }
    }

    /// Simulate losing or regaining connectivity. Going offline fails writes
    /// and reports an error to live listeners; coming back pushes fresh
    /// snapshots.
    pub fn set_offline(&self, offline: bool) {
        let state = {
            let mut state = self.state.lock();
            state.offline = offline;
            if offline {
                None
            } else {
                Some(state)
            }
        };
        match state {
            None => self
                .registry
                .broadcast_error(StoreError::Unavailable(OFFLINE_MESSAGE.into())),
            Some(state) => {
                for (id, scope) in self.registry.all() {
                    self.registry
                        .send(id, StoreEvent::Snapshot(state.records_in(&scope)));
                }
            }
        }
    }

    /// Insert a record as-is under `path`, bypassing scope checks. Used to
    /// seed data written by other clients.
    pub fn insert_raw(&self, path: &str, record: RawRecord) {
        let state = {
            let mut state = self.state.lock();
            state.paths.entry(path.to_string()).or_default().push(record);
            state
        };
        self.notify(&state, path);
    }

    fn notify(&self, state: &MemoryState, path: &str) {
        if state.offline {
            return;
        }
        for (id, scope) in self.registry.watching(path) {
            self.registry
                .send(id, StoreEvent::Snapshot(state.records_in(&scope)));
        }
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn subscribe(&self, scope: StoreScope) -> Result<StoreListener, StoreError> {
        let state = self.state.lock();
        let initial = match state.ensure_online() {
            Ok(()) => StoreEvent::Snapshot(state.records_in(&scope)),
            Err(err) => StoreEvent::Error(err),
        };
        Ok(self.registry.register(scope, initial))
    }

    async fn query(&self, scope: &StoreScope) -> Result<Vec<RawRecord>, StoreError> {
        let state = self.state.lock();
        state.ensure_online()?;
        Ok(state.records_in(scope))
    }

    async fn create_record(
        &self,
        scope: &StoreScope,
        mut fields: FieldMap,
    ) -> Result<String, StoreError> {
        let mut state = self.state.lock();
        state.ensure_online()?;
        resolve_server_values(&mut fields, Utc::now().timestamp_millis());
        let key = Ulid::new().to_string();
        if !scope.matches(&fields) {
            return Err(StoreError::Forbidden { key });
        }
        state
            .paths
            .entry(scope.path.clone())
            .or_default()
            .push(RawRecord::new(key.clone(), fields));
        self.notify(&state, &scope.path);
        Ok(key)
    }

    async fn update_record(
        &self,
        scope: &StoreScope,
        key: &str,
        mut fields: FieldMap,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.ensure_online()?;
        let position = state.position(&scope.path, key);
        let existing = position.and_then(|idx| {
            state
                .paths
                .get(&scope.path)
                .map(|records| records[idx].fields.clone())
        });
        check_write(scope, key, existing.as_ref())?;

        let (Some(idx), Some(mut merged)) = (position, existing) else {
            return Err(StoreError::NotFound {
                key: key.to_string(),
            });
        };
        resolve_server_values(&mut fields, Utc::now().timestamp_millis());
        merge_fields(&mut merged, fields);
        if !scope.matches(&merged) {
            return Err(StoreError::Forbidden {
                key: key.to_string(),
            });
        }
        if let Some(records) = state.paths.get_mut(&scope.path) {
            records[idx].fields = merged;
        }
        self.notify(&state, &scope.path);
        Ok(())
    }

    async fn delete_record(&self, scope: &StoreScope, key: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.ensure_online()?;
        let position = state.position(&scope.path, key);
        let existing = position.and_then(|idx| {
            state
                .paths
                .get(&scope.path)
                .map(|records| &records[idx].fields)
        });
        check_write(scope, key, existing)?;

        if let (Some(idx), Some(records)) = (position, state.paths.get_mut(&scope.path)) {
            records.remove(idx);
        }
        self.notify(&state, &scope.path);
        Ok(())
    }

    async fn fetch_record(
        &self,
        scope: &StoreScope,
        key: &str,
    ) -> Result<Option<RawRecord>, StoreError> {
        let state = self.state.lock();
        state.ensure_online()?;
        Ok(state
            .paths
            .get(&scope.path)
            .and_then(|records| records.iter().find(|record| record.key == key))
            .filter(|record| scope.matches(&record.fields))
            .cloned())
    }

    fn listener_count(&self) -> usize {
        self.registry.len()
    }
}
