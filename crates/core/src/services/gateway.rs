use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::auth::AuthProvider;
use crate::capture::{TaskDraft, TaskPatch};
use crate::error::TaskError;
use crate::model::Task;
use crate::normalizer::StoreLayout;
use crate::services::view_model::{OptimisticChange, TaskListViewModel};
use crate::store::{server_timestamp, FieldMap, StoreScope, TaskStore};

/// Every write path from a screen to the task store.
///
/// Each call resolves the signed-in user first and validates input before
/// the store sees anything. Results reach the view-model through its live
/// subscription, not through this type.
#[derive(Clone)]
pub struct MutationGateway {
    store: Arc<dyn TaskStore>,
    auth: Arc<dyn AuthProvider>,
    layout: StoreLayout,
}

impl MutationGateway {
    pub fn new(store: Arc<dyn TaskStore>, auth: Arc<dyn AuthProvider>, layout: StoreLayout) -> Self {
        Self {
            store,
            auth,
            layout,
        }
    }

    pub fn layout(&self) -> StoreLayout {
        self.layout
    }

    fn scope(&self) -> Result<(String, StoreScope), TaskError> {
        let user_id = self
            .auth
            .current_user_id()
            .filter(|id| !id.trim().is_empty())
            .ok_or(TaskError::Unauthenticated)?;
        let scope = self.layout.task_scope(&user_id);
        Ok((user_id, scope))
    }

    async fn load(&self, scope: &StoreScope, id: &str) -> Result<Task, TaskError> {
        let record = self
            .store
            .fetch_record(scope, id)
            .await?
            .ok_or_else(|| TaskError::NotFound { id: id.to_string() })?;
        self.layout.normalizer().normalize(&record)
    }

    pub async fn create(&self, draft: &TaskDraft) -> Result<Task, TaskError> {
        let (user_id, scope) = self.scope()?;
        let valid = draft.validate()?;

        let mut fields = valid.to_fields();
        fields.extend(self.layout.owner_fields(&user_id));
        let id = self.store.create_record(&scope, fields).await?;
        tracing::debug!(task = id.as_str(), "task created");
        self.load(&scope, &id).await
    }

    /// Apply an edit. Ids that do not resolve to one of the caller's records
    /// fail with [`TaskError::NotFound`].
    pub async fn update(&self, id: &str, patch: &TaskPatch) -> Result<(), TaskError> {
        let (_, scope) = self.scope()?;
        let fields = patch.validate()?;

        if self.store.fetch_record(&scope, id).await?.is_none() {
            return Err(TaskError::NotFound { id: id.to_string() });
        }
        if fields.is_empty() {
            return Ok(());
        }
        self.store.update_record(&scope, id, fields).await?;
        tracing::debug!(task = id, "task updated");
        Ok(())
    }

    /// Flip completion. `completed` and `completedAt` go out in a single write.
    pub async fn toggle_complete(&self, id: &str) -> Result<Task, TaskError> {
        let (_, scope) = self.scope()?;
        let current = self.load(&scope, id).await?;
        let completing = !current.completed;

        let mut fields = FieldMap::new();
        fields.insert("completed".into(), Value::Bool(completing));
        fields.insert(
            "completedAt".into(),
            if completing {
                server_timestamp()
            } else {
                Value::Null
            },
        );
        self.store.update_record(&scope, id, fields).await?;
        tracing::debug!(task = id, completed = completing, "task completion toggled");
        self.load(&scope, id).await
    }

    /// Missing ids fail with [`TaskError::NotFound`]; another user's record
    /// fails with [`TaskError::Forbidden`].
    pub async fn delete(&self, id: &str) -> Result<(), TaskError> {
        let (_, scope) = self.scope()?;
        self.store.delete_record(&scope, id).await?;
        tracing::debug!(task = id, "task deleted");
        Ok(())
    }

    pub async fn fetch(&self, id: &str) -> Result<Task, TaskError> {
        let (_, scope) = self.scope()?;
        self.load(&scope, id).await
    }

    /// Toggle with the flip shown on `view_model` immediately and withdrawn
    /// if the store rejects the write.
    pub async fn toggle_complete_optimistic(
        &self,
        view_model: &TaskListViewModel,
        id: &str,
    ) -> Result<Task, TaskError> {
        self.scope()?;
        let change = OptimisticChange::ToggleComplete {
            id: id.to_string(),
            at: Utc::now(),
        };
        view_model.apply_optimistic(change.clone());
        self.toggle_complete(id)
            .await
            .map_err(|err| rolled_back(view_model, &change, err))
    }

    pub async fn delete_optimistic(
        &self,
        view_model: &TaskListViewModel,
        id: &str,
    ) -> Result<(), TaskError> {
        self.scope()?;
        let change = OptimisticChange::Remove(id.to_string());
        view_model.apply_optimistic(change.clone());
        self.delete(id)
            .await
            .map_err(|err| rolled_back(view_model, &change, err))
    }
}

fn rolled_back(
    view_model: &TaskListViewModel,
    change: &OptimisticChange,
    err: TaskError,
) -> TaskError {
    view_model.rollback_change(change);
    tracing::warn!(task = change.id(), error = %err, "optimistic change withdrawn");
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuth;
    use crate::error::ValidationIssue;
    use crate::store::MemoryTaskStore;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    fn gateway(store: &Arc<MemoryTaskStore>, user: Option<&str>, layout: StoreLayout) -> MutationGateway {
        MutationGateway::new(store.clone(), Arc::new(StaticAuth::new(user)), layout)
    }

    #[tokio::test]
    async fn create_returns_store_assigned_fields() {
        let store = Arc::new(MemoryTaskStore::new());
        let gw = gateway(&store, Some("u1"), StoreLayout::Tree);
        let task = gw.create(&TaskDraft::new("Test").points(30_i64)).await.unwrap();

        assert!(!task.id.is_empty());
        assert_eq!(task.title, "Test");
        assert_eq!(task.points, 30);
        assert!(!task.completed);
        assert!(task.created_at.timestamp_millis() > 0);
        assert_eq!(gw.fetch(&task.id).await.unwrap(), task);
    }

    #[tokio::test]
    async fn invalid_drafts_never_reach_the_store() {
        let store = Arc::new(MemoryTaskStore::new());
        let gw = gateway(&store, Some("u1"), StoreLayout::Tree);

        assert_eq!(
            gw.create(&TaskDraft::new("")).await,
            Err(TaskError::Validation(ValidationIssue::EmptyTitle))
        );
        assert_eq!(
            gw.create(&TaskDraft::new("Test").points(-5_i64)).await,
            Err(TaskError::Validation(ValidationIssue::NegativePoints(-5)))
        );
        assert_eq!(
            gw.create(&TaskDraft::new("Far").due_date("+99999999d")).await,
            Err(TaskError::Validation(ValidationIssue::InvalidDueDate(
                "Date '+99999999d' is out of range".into()
            )))
        );
        assert!(store
            .query(&StoreLayout::Tree.task_scope("u1"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn anonymous_callers_are_rejected() {
        let store = Arc::new(MemoryTaskStore::new());
        let gw = gateway(&store, None, StoreLayout::Tree);
        assert_eq!(
            gw.create(&TaskDraft::new("Test")).await,
            Err(TaskError::Unauthenticated)
        );
        assert_eq!(gw.delete("x").await, Err(TaskError::Unauthenticated));
    }

    #[tokio::test]
    async fn toggle_keeps_completion_invariant() {
        let store = Arc::new(MemoryTaskStore::new());
        let gw = gateway(&store, Some("u1"), StoreLayout::Tree);
        let task = gw.create(&TaskDraft::new("Stretch")).await.unwrap();

        let done = gw.toggle_complete(&task.id).await.unwrap();
        assert!(done.completed);
        assert!(done.is_consistent());

        let undone = gw.toggle_complete(&task.id).await.unwrap();
        assert!(!undone.completed);
        assert!(undone.is_consistent());
    }

    #[tokio::test]
    async fn update_applies_patch_and_rejects_unknown_ids() {
        let store = Arc::new(MemoryTaskStore::new());
        let gw = gateway(&store, Some("u1"), StoreLayout::Tree);
        let task = gw.create(&TaskDraft::new("Draft")).await.unwrap();

        let patch = TaskPatch {
            title: Some("Final".into()),
            points: Some("5".into()),
            ..TaskPatch::default()
        };
        gw.update(&task.id, &patch).await.unwrap();
        let updated = gw.fetch(&task.id).await.unwrap();
        assert_eq!(updated.title, "Final");
        assert_eq!(updated.points, 5);
        assert_eq!(updated.created_at, task.created_at);

        assert_eq!(
            gw.update("missing", &patch).await,
            Err(TaskError::NotFound {
                id: "missing".into()
            })
        );
    }

    #[tokio::test]
    async fn collection_layout_isolates_users() {
        let store = Arc::new(MemoryTaskStore::new());
        let alice = gateway(&store, Some("alice"), StoreLayout::Collection);
        let bob = gateway(&store, Some("bob"), StoreLayout::Collection);
        let task = alice.create(&TaskDraft::new("Private")).await.unwrap();
        assert_eq!(task.user_id.as_deref(), Some("alice"));

        assert_eq!(
            bob.delete(&task.id).await,
            Err(TaskError::Forbidden {
                id: task.id.clone()
            })
        );
        assert_eq!(
            bob.toggle_complete(&task.id).await,
            Err(TaskError::NotFound {
                id: task.id.clone()
            })
        );
        assert_eq!(
            bob.update(&task.id, &TaskPatch::default()).await,
            Err(TaskError::NotFound {
                id: task.id.clone()
            })
        );
        assert!(alice.fetch(&task.id).await.is_ok());
    }

    #[tokio::test]
    async fn tree_layout_hides_other_users_records() {
        let store = Arc::new(MemoryTaskStore::new());
        let alice = gateway(&store, Some("alice"), StoreLayout::Tree);
        let bob = gateway(&store, Some("bob"), StoreLayout::Tree);
        let task = alice.create(&TaskDraft::new("Private")).await.unwrap();
        let not_found = TaskError::NotFound {
            id: task.id.clone(),
        };

        assert_eq!(bob.delete(&task.id).await, Err(not_found.clone()));
        assert_eq!(bob.toggle_complete(&task.id).await, Err(not_found.clone()));
        let patch = TaskPatch {
            title: Some("Mine now".into()),
            ..TaskPatch::default()
        };
        assert_eq!(bob.update(&task.id, &patch).await, Err(not_found));

        let kept = alice.fetch(&task.id).await.unwrap();
        assert_eq!(kept, task);
    }

    #[tokio::test]
    async fn delete_of_missing_id_is_not_found() {
        let store = Arc::new(MemoryTaskStore::new());
        let gw = gateway(&store, Some("u1"), StoreLayout::Tree);
        let task = gw.create(&TaskDraft::new("Once")).await.unwrap();
        gw.delete(&task.id).await.unwrap();
        assert_eq!(
            gw.delete(&task.id).await,
            Err(TaskError::NotFound {
                id: task.id.clone()
            })
        );
    }

    #[tokio::test]
    async fn total_points_track_completed_tasks() {
        let store = Arc::new(MemoryTaskStore::new());
        let gw = gateway(&store, Some("u1"), StoreLayout::Tree);
        let vm = TaskListViewModel::new(store.clone(), StoreLayout::Tree);
        let mut sub = vm.subscribe("u1").await.unwrap();
        sub.next().await.unwrap();

        let a = gw.create(&TaskDraft::new("A").points(10_i64)).await.unwrap();
        let b = gw.create(&TaskDraft::new("B").points(25_i64)).await.unwrap();
        gw.toggle_complete(&a.id).await.unwrap();
        gw.toggle_complete(&b.id).await.unwrap();
        gw.delete(&a.id).await.unwrap();

        let mut last = vm.current();
        while let Some(snapshot) = futures::FutureExt::now_or_never(sub.next()).flatten() {
            last = snapshot;
        }
        assert_eq!(last.total_points, 25);
        assert_eq!(last.completed_count, 1);
    }

    #[tokio::test]
    async fn failed_optimistic_toggle_rolls_back() {
        let store = Arc::new(MemoryTaskStore::new());
        let gw = gateway(&store, Some("u1"), StoreLayout::Tree);
        let task = gw.create(&TaskDraft::new("Flaky")).await.unwrap();
        let vm = TaskListViewModel::new(store.clone(), StoreLayout::Tree);
        let mut sub = vm.subscribe("u1").await.unwrap();
        sub.next().await.unwrap();

        store.set_offline(true);
        let result = gw.toggle_complete_optimistic(&vm, &task.id).await;
        assert!(matches!(result, Err(TaskError::Unavailable(_))));

        let snapshot = vm.current();
        assert!(!snapshot.find(&task.id).unwrap().completed);
        assert!(snapshot.unconfirmed.is_empty());
    }

    #[tokio::test]
    async fn failed_optimistic_write_keeps_other_pending_changes() {
        let store = Arc::new(MemoryTaskStore::new());
        let gw = gateway(&store, Some("u1"), StoreLayout::Tree);
        let task = gw.create(&TaskDraft::new("A")).await.unwrap();
        let vm = TaskListViewModel::new(store.clone(), StoreLayout::Tree);
        let mut sub = vm.subscribe("u1").await.unwrap();
        sub.next().await.unwrap();

        vm.apply_optimistic(OptimisticChange::Remove(task.id.clone()));
        let result = gw.toggle_complete_optimistic(&vm, "missing").await;
        assert_eq!(
            result,
            Err(TaskError::NotFound {
                id: "missing".into()
            })
        );

        let snapshot = vm.current();
        assert!(snapshot.find(&task.id).is_none());
        assert_eq!(snapshot.unconfirmed, vec![task.id.clone()]);
    }

    #[tokio::test]
    async fn optimistic_toggle_is_confirmed_by_the_store() {
        let store = Arc::new(MemoryTaskStore::new());
        let gw = gateway(&store, Some("u1"), StoreLayout::Tree);
        let task = gw.create(&TaskDraft::new("Quick").points(7_i64)).await.unwrap();
        let vm = TaskListViewModel::new(store.clone(), StoreLayout::Tree);
        let mut sub = vm.subscribe("u1").await.unwrap();
        sub.next().await.unwrap();

        gw.toggle_complete_optimistic(&vm, &task.id).await.unwrap();
        let confirmed = sub.next().await.unwrap();
        assert!(confirmed.find(&task.id).unwrap().completed);
        assert!(confirmed.unconfirmed.is_empty());
        assert_eq!(confirmed.total_points, 7);
    }
}
