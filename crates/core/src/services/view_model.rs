use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::DEFAULT_MAX_TASKS;
use crate::error::{StoreError, TaskError};
use crate::model::{SyncStatus, Task, TaskFilter, TaskListSnapshot};
use crate::normalizer::{normalize_all, StoreLayout};
use crate::store::{RawRecord, StoreEvent, StoreListener, TaskStore};

/// A local change shown before the store confirms it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimisticChange {
    Upsert(Task),
    ToggleComplete { id: String, at: DateTime<Utc> },
    Remove(String),
}

impl OptimisticChange {
    pub fn id(&self) -> &str {
        match self {
            OptimisticChange::Upsert(task) => &task.id,
            OptimisticChange::ToggleComplete { id, .. } => id,
            OptimisticChange::Remove(id) => id,
        }
    }

    fn apply(&self, tasks: &mut Vec<Task>) {
        match self {
            OptimisticChange::Upsert(task) => {
                match tasks.iter_mut().find(|existing| existing.id == task.id) {
                    Some(existing) => *existing = task.clone(),
                    None => tasks.push(task.clone()),
                }
            }
            OptimisticChange::ToggleComplete { id, at } => {
                if let Some(task) = tasks.iter_mut().find(|task| &task.id == id) {
                    task.completed = !task.completed;
                    task.completed_at = task.completed.then_some(*at);
                }
            }
            OptimisticChange::Remove(id) => tasks.retain(|task| &task.id != id),
        }
    }
}

struct ViewState {
    user_id: Option<String>,
    tasks: Vec<Task>,
    skipped: usize,
    truncated: bool,
    loading: bool,
    status: SyncStatus,
    overlay: Vec<OptimisticChange>,
    filter: TaskFilter,
    search: String,
    active: Option<SubscriptionHandle>,
    refresh: Option<mpsc::UnboundedSender<()>>,
}

impl ViewState {
    fn new() -> Self {
        Self {
            user_id: None,
            tasks: Vec::new(),
            skipped: 0,
            truncated: false,
            loading: false,
            status: SyncStatus::Live,
            overlay: Vec::new(),
            filter: TaskFilter::All,
            search: String::new(),
            active: None,
            refresh: None,
        }
    }

    fn apply_records(&mut self, layout: StoreLayout, max_tasks: usize, records: &[RawRecord]) {
        let mut batch = normalize_all(layout.normalizer(), records);
        self.truncated = batch.tasks.len() > max_tasks;
        if self.truncated {
            tracing::warn!(
                total = batch.tasks.len(),
                max_tasks,
                "task list truncated to configured bound"
            );
            batch.tasks.truncate(max_tasks);
        }
        self.tasks = batch.tasks;
        self.skipped = batch.skipped;
        self.loading = false;
        self.status = SyncStatus::Live;
        self.overlay.clear();
    }

    fn apply_error(&mut self, err: &StoreError) {
        tracing::warn!(error = %err, "task subscription reported an error");
        self.loading = false;
        self.status = SyncStatus::Unavailable(err.to_string());
    }

    fn notify(&self) {
        if let Some(tx) = &self.refresh {
            let _ = tx.send(());
        }
    }

    fn derive(&self) -> TaskListSnapshot {
        let mut tasks = self.tasks.clone();
        for change in &self.overlay {
            change.apply(&mut tasks);
        }

        let completed_count = tasks.iter().filter(|task| task.completed).count();
        let total_points = tasks
            .iter()
            .filter(|task| task.completed)
            .map(|task| u64::from(task.points))
            .sum();
        let pending_count = tasks.len() - completed_count;

        let mut visible: Vec<Task> = tasks
            .into_iter()
            .filter(|task| self.filter.matches(task) && task.matches_search(&self.search))
            .collect();
        visible.sort_by_key(|task| task.completed);

        let mut unconfirmed: Vec<String> = Vec::new();
        for change in &self.overlay {
            if !unconfirmed.iter().any(|id| id == change.id()) {
                unconfirmed.push(change.id().to_string());
            }
        }

        TaskListSnapshot {
            tasks: visible,
            total_points,
            completed_count,
            pending_count,
            loading: self.loading,
            status: self.status.clone(),
            unconfirmed,
            skipped: self.skipped,
            truncated: self.truncated,
        }
    }
}

/// Screen-facing state of one user's task list.
///
/// Cloning yields another handle onto the same state. At most one
/// subscription is active at a time; subscribing again cancels the previous
/// one before the new listener is opened.
#[derive(Clone)]
pub struct TaskListViewModel {
    store: Arc<dyn TaskStore>,
    layout: StoreLayout,
    max_tasks: usize,
    state: Arc<Mutex<ViewState>>,
}

impl TaskListViewModel {
    pub fn new(store: Arc<dyn TaskStore>, layout: StoreLayout) -> Self {
        Self {
            store,
            layout,
            max_tasks: DEFAULT_MAX_TASKS,
            state: Arc::new(Mutex::new(ViewState::new())),
        }
    }

    pub fn with_max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks.max(1);
        self
    }

    pub async fn subscribe(&self, user_id: &str) -> Result<TaskSubscription, TaskError> {
        if user_id.trim().is_empty() {
            return Err(TaskError::Unauthenticated);
        }
        self.unsubscribe();

        let listener = self.store.subscribe(self.layout.task_scope(user_id)).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SubscriptionHandle {
            cancelled: Arc::new(AtomicBool::new(false)),
            listener: Arc::new(Mutex::new(listener)),
            state: Arc::downgrade(&self.state),
        };

        let displaced = {
            let mut state = self.state.lock();
            if state.user_id.as_deref() != Some(user_id) {
                state.tasks.clear();
                state.skipped = 0;
                state.truncated = false;
            }
            state.user_id = Some(user_id.to_string());
            state.loading = true;
            state.status = SyncStatus::Live;
            state.overlay.clear();
            state.refresh = Some(tx);
            state.active.replace(handle.clone())
        };
        // A concurrent subscribe may have slipped in between.
        if let Some(previous) = displaced {
            previous.cancel();
        }
        tracing::debug!(user = user_id, layout = %self.layout, "task list subscribed");

        Ok(TaskSubscription {
            handle,
            state: Arc::clone(&self.state),
            refresh: rx,
            layout: self.layout,
            max_tasks: self.max_tasks,
        })
    }

    /// Cancel the active subscription, if any.
    pub fn unsubscribe(&self) {
        let active = self.state.lock().active.take();
        if let Some(handle) = active {
            handle.cancel();
        }
    }

    pub fn set_filter(&self, filter: TaskFilter) -> TaskListSnapshot {
        let mut state = self.state.lock();
        state.filter = filter;
        state.notify();
        state.derive()
    }

    pub fn set_search(&self, text: &str) -> TaskListSnapshot {
        let mut state = self.state.lock();
        state.search = text.trim().to_lowercase();
        state.notify();
        state.derive()
    }

    pub fn filter(&self) -> TaskFilter {
        self.state.lock().filter
    }

    pub fn current(&self) -> TaskListSnapshot {
        self.state.lock().derive()
    }

    /// Show `change` until the next authoritative snapshot replaces it.
    pub fn apply_optimistic(&self, change: OptimisticChange) -> TaskListSnapshot {
        let mut state = self.state.lock();
        tracing::debug!(task = change.id(), "optimistic change applied");
        state.overlay.push(change);
        state.notify();
        state.derive()
    }

    /// Withdraw one earlier [`apply_optimistic`](Self::apply_optimistic) call.
    /// Other pending changes stay in the overlay.
    pub fn rollback_change(&self, change: &OptimisticChange) -> TaskListSnapshot {
        let mut state = self.state.lock();
        if let Some(pos) = state.overlay.iter().rposition(|pending| pending == change) {
            state.overlay.remove(pos);
            tracing::debug!(task = change.id(), "optimistic change rolled back");
            state.notify();
        }
        state.derive()
    }

    /// Drop every unconfirmed change.
    pub fn rollback(&self) -> TaskListSnapshot {
        let mut state = self.state.lock();
        if !state.overlay.is_empty() {
            tracing::debug!(changes = state.overlay.len(), "optimistic changes rolled back");
            state.overlay.clear();
            state.notify();
        }
        state.derive()
    }
}

/// Cancellation capability for a [`TaskSubscription`].
#[derive(Clone)]
pub struct SubscriptionHandle {
    cancelled: Arc<AtomicBool>,
    listener: Arc<Mutex<StoreListener>>,
    state: Weak<Mutex<ViewState>>,
}

impl SubscriptionHandle {
    /// Idempotent. Once this returns no further snapshot is produced and the
    /// store listener has been released.
    pub fn cancel(&self) {
        let state = self.state.upgrade();
        {
            // Serializes with snapshot derivation in the stream.
            let _guard = state.as_ref().map(|state| state.lock());
            if self.cancelled.swap(true, Ordering::SeqCst) {
                return;
            }
        }
        self.listener.lock().unsubscribe();
        tracing::debug!("task list subscription cancelled");
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Live stream of [`TaskListSnapshot`]s. Dropping it cancels the subscription.
pub struct TaskSubscription {
    handle: SubscriptionHandle,
    state: Arc<Mutex<ViewState>>,
    refresh: mpsc::UnboundedReceiver<()>,
    layout: StoreLayout,
    max_tasks: usize,
}

impl TaskSubscription {
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    fn on_event(&self, event: StoreEvent) -> Option<TaskListSnapshot> {
        let mut state = self.state.lock();
        if self.handle.is_cancelled() {
            return None;
        }
        match event {
            StoreEvent::Snapshot(records) => {
                state.apply_records(self.layout, self.max_tasks, &records)
            }
            StoreEvent::Error(err) => state.apply_error(&err),
        }
        Some(state.derive())
    }

    fn on_refresh(&self) -> Option<TaskListSnapshot> {
        let state = self.state.lock();
        if self.handle.is_cancelled() {
            return None;
        }
        Some(state.derive())
    }
}

impl Stream for TaskSubscription {
    type Item = TaskListSnapshot;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.handle.is_cancelled() {
            return Poll::Ready(None);
        }

        let event = this.handle.listener.lock().poll_recv(cx);
        match event {
            Poll::Ready(Some(event)) => return Poll::Ready(this.on_event(event)),
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => {}
        }

        match this.refresh.poll_recv(cx) {
            Poll::Ready(Some(())) => {
                while this.refresh.try_recv().is_ok() {}
                Poll::Ready(this.on_refresh())
            }
            _ => Poll::Pending,
        }
    }
}

impl Drop for TaskSubscription {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}
