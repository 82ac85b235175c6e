//! In-process task store for offline use and tests.
//!
//! [`MemoryTaskStore`] keeps every document in a single owner-agnostic
//! collection and re-runs each live query after every write that touches its
//! owner, pushing the full result set. It can also hold back `created_at`
//! commits to reproduce the window in which a fresh task has no timestamp,
//! and inject write or subscription failures.

use parking_lot::Mutex;

use tasklist_proto::task::{
    Identity, MonotonicClock, NewTask, Task, TaskId, TaskPatch, sort_newest_first,
};

use super::{SnapshotSender, StoreError, Subscription, TaskStore};

/// A registered live query.
struct Watcher {
    owner: Identity,
    tx: SnapshotSender,
}

#[derive(Default)]
struct Inner {
    /// Documents in insertion order.
    tasks: Vec<Task>,
    watchers: Vec<Watcher>,
    clock: MonotonicClock,
    /// Leave `created_at` unset until [`MemoryTaskStore::commit_timestamps`].
    defer_timestamps: bool,
    /// Error returned by every write while set.
    write_failure: Option<StoreError>,
    /// Error returned by every subscribe while set.
    subscribe_failure: Option<StoreError>,
    /// Number of create/update/delete calls that reached the store.
    write_calls: usize,
}

impl Inner {
    /// Runs the owner query: newest first, later inserts ahead on ties.
    fn query(&self, owner: &Identity) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .rev()
            .filter(|t| t.owner == *owner)
            .cloned()
            .collect();
        sort_newest_first(&mut tasks);
        tasks
    }

    /// Pushes a fresh result set to every live query for `owner`, forgetting
    /// queries whose subscriber has gone away.
    fn notify(&mut self, owner: &Identity) {
        let snapshot = self.query(owner);
        self.watchers.retain(|w| {
            if w.owner != *owner {
                return true;
            }
            w.tx.send(Ok(snapshot.clone())).is_ok()
        });
    }

    fn begin_write(&mut self) -> Result<(), StoreError> {
        self.write_calls += 1;
        self.write_failure.clone().map_or(Ok(()), Err)
    }

    fn position(&self, id: &TaskId) -> Result<usize, StoreError> {
        self.tasks
            .iter()
            .position(|t| t.id == *id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }
}

/// In-memory [`TaskStore`] with live queries.
pub struct MemoryTaskStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTaskStore {
    /// Creates an empty store that commits `created_at` on create.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Creates an empty store that leaves `created_at` pending until
    /// [`commit_timestamps`](Self::commit_timestamps) is called.
    #[must_use]
    pub fn with_deferred_timestamps() -> Self {
        Self {
            inner: Mutex::new(Inner {
                defer_timestamps: true,
                ..Inner::default()
            }),
        }
    }

    /// Assigns a timestamp to every pending task, oldest insert first, and
    /// pushes new snapshots to the affected owners.
    pub fn commit_timestamps(&self) {
        let mut inner = self.inner.lock();
        let mut owners: Vec<Identity> = Vec::new();
        let Inner { tasks, clock, .. } = &mut *inner;
        for task in tasks.iter_mut().filter(|t| t.created_at.is_none()) {
            task.created_at = Some(clock.tick());
            if !owners.contains(&task.owner) {
                owners.push(task.owner.clone());
            }
        }
        for owner in &owners {
            inner.notify(owner);
        }
        tracing::debug!(owners = owners.len(), "committed pending timestamps");
    }

    /// Makes every subsequent write fail with `error` (or succeed again with `None`).
    pub fn set_write_failure(&self, error: Option<StoreError>) {
        self.inner.lock().write_failure = error;
    }

    /// Makes every subsequent subscribe fail with `error` (or succeed again with `None`).
    pub fn set_subscribe_failure(&self, error: Option<StoreError>) {
        self.inner.lock().subscribe_failure = error;
    }

    /// Fails every live query for `owner` with `error` and closes them.
    pub fn break_subscriptions(&self, owner: &Identity, error: &StoreError) {
        let mut inner = self.inner.lock();
        inner.watchers.retain(|w| {
            if w.owner != *owner {
                return true;
            }
            let _ = w.tx.send(Err(error.clone()));
            false
        });
        tracing::debug!(owner = %owner, %error, "live queries broken");
    }

    /// Current result set for `owner`, as a live query would see it.
    #[must_use]
    pub fn tasks_of(&self, owner: &Identity) -> Vec<Task> {
        self.inner.lock().query(owner)
    }

    /// Number of create/update/delete calls that reached the store.
    #[must_use]
    pub fn write_calls(&self) -> usize {
        self.inner.lock().write_calls
    }

    /// Number of live queries whose subscriber is still attached.
    #[must_use]
    pub fn live_queries(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.watchers.retain(|w| !w.tx.is_closed());
        inner.watchers.len()
    }
}

impl TaskStore for MemoryTaskStore {
    async fn subscribe(&self, owner: &Identity) -> Result<Subscription, StoreError> {
        let mut inner = self.inner.lock();
        if let Some(error) = inner.subscribe_failure.clone() {
            return Err(error);
        }
        let (tx, subscription) = Subscription::channel();
        let _ = tx.send(Ok(inner.query(owner)));
        inner.watchers.push(Watcher {
            owner: owner.clone(),
            tx,
        });
        tracing::debug!(owner = %owner, "live query opened");
        Ok(subscription)
    }

    async fn create(&self, task: NewTask) -> Result<TaskId, StoreError> {
        let mut inner = self.inner.lock();
        inner.begin_write()?;
        let created_at = if inner.defer_timestamps {
            None
        } else {
            Some(inner.clock.tick())
        };
        let id = TaskId::new();
        let owner = task.owner.clone();
        inner.tasks.push(Task {
            id: id.clone(),
            text: task.text,
            completed: false,
            owner: task.owner,
            created_at,
        });
        inner.notify(&owner);
        tracing::debug!(task_id = %id, owner = %owner, "task created");
        Ok(id)
    }

    async fn update(&self, id: &TaskId, patch: TaskPatch) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.begin_write()?;
        let index = inner.position(id)?;
        inner.tasks[index].apply(&patch);
        let owner = inner.tasks[index].owner.clone();
        inner.notify(&owner);
        Ok(())
    }

    async fn delete(&self, id: &TaskId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.begin_write()?;
        let index = inner.position(id)?;
        let removed = inner.tasks.remove(index);
        inner.notify(&removed.owner);
        Ok(())
    }
}
