//! The task sync controller.
//!
//! One live query per identity. Every query is tagged with a generation
//! number; tearing a query down bumps the generation, and a snapshot is only
//! applied while its generation is still current. A late push from a
//! previous identity therefore can never reach the projection, whatever the
//! cancellation timing of the listener task.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use tasklist_proto::task::{Identity, NewTask, Task, TaskId, TaskPatch, normalize_text, sort_newest_first};

use super::{Mutation, SyncError, SyncState, SyncView, subscription_banner};
use crate::session::SessionProvider;
use crate::store::{StoreError, TaskStore};

struct Inner {
    /// Bumped on every teardown; snapshots from older generations are dropped.
    generation: u64,
    identity: Option<Identity>,
    listener: Option<JoinHandle<()>>,
}

/// State shared with the listener task.
struct Shared {
    inner: Mutex<Inner>,
    view: watch::Sender<SyncView>,
}

impl Shared {
    /// Replaces the projection with `tasks` if `generation` is still current.
    ///
    /// Returns `false` when the snapshot is stale and the listener should stop.
    fn apply_snapshot(&self, generation: u64, mut tasks: Vec<Task>) -> bool {
        let inner = self.inner.lock();
        if inner.generation != generation {
            tracing::debug!(generation, current = inner.generation, "dropping stale snapshot");
            return false;
        }
        let Some(identity) = inner.identity.clone() else {
            return false;
        };

        let delivered = tasks.len();
        tasks.retain(|t| t.owner == identity);
        if tasks.len() != delivered {
            tracing::warn!(
                identity = %identity,
                dropped = delivered - tasks.len(),
                "snapshot contained tasks owned by another identity"
            );
        }
        sort_newest_first(&mut tasks);

        tracing::debug!(identity = %identity, tasks = tasks.len(), "snapshot applied");
        self.view.send_replace(SyncView {
            state: SyncState::Live,
            identity: Some(identity),
            tasks: tasks.into(),
        });
        true
    }

    /// Moves to [`SyncState::Error`] if `generation` is still current.
    fn fail(&self, generation: u64, err: &StoreError) {
        let inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        tracing::warn!(error = %err, "live query failed");
        self.view
            .send_modify(|view| view.state = SyncState::Error(subscription_banner(err)));
    }
}

/// Keeps an ordered projection of one identity's tasks in step with a
/// [`TaskStore`], and is the only sanctioned way to mutate those tasks.
///
/// Must be used inside a tokio runtime: identity changes spawn the listener
/// task that consumes store snapshots.
pub struct TaskSyncController<S> {
    store: Arc<S>,
    shared: Arc<Shared>,
}

impl<S: TaskStore> TaskSyncController<S> {
    /// Creates an unsubscribed controller over `store`.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        let (view, _) = watch::channel(SyncView::signed_out());
        Self {
            store,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    generation: 0,
                    identity: None,
                    listener: None,
                }),
                view,
            }),
        }
    }

    /// Subscribes to projection changes.
    #[must_use]
    pub fn view(&self) -> watch::Receiver<SyncView> {
        self.shared.view.subscribe()
    }

    /// The current projection.
    #[must_use]
    pub fn snapshot(&self) -> SyncView {
        self.shared.view.borrow().clone()
    }

    /// The identity the controller is subscribed for.
    #[must_use]
    pub fn identity(&self) -> Option<Identity> {
        self.shared.inner.lock().identity.clone()
    }

    /// Applies an identity change.
    ///
    /// The old query is torn down and the projection cleared before a query
    /// for the new identity (if any) is opened. Setting the identity that is
    /// already current does nothing, including in [`SyncState::Error`].
    pub fn set_identity(&self, identity: Option<Identity>) {
        let mut inner = self.shared.inner.lock();
        if inner.identity == identity {
            return;
        }
        self.restart(&mut inner, identity);
    }

    /// Tears the query down and opens a fresh one for the current identity.
    ///
    /// This is the explicit recovery path out of [`SyncState::Error`].
    pub fn remount(&self) {
        let mut inner = self.shared.inner.lock();
        let identity = inner.identity.clone();
        tracing::info!(identity = ?identity, "remounting live query");
        self.restart(&mut inner, identity);
    }

    /// Tears the query down and clears the projection.
    pub fn shutdown(&self) {
        let mut inner = self.shared.inner.lock();
        self.restart(&mut inner, None);
    }

    /// Applies every identity change published by `session`, starting with
    /// its current value.
    ///
    /// The returned task ends when the session provider or the controller is
    /// dropped.
    pub fn follow<P: SessionProvider>(self: &Arc<Self>, session: &P) -> JoinHandle<()> {
        let mut rx = session.watch_identity();
        let initial = rx.borrow_and_update().clone();
        self.set_identity(initial);

        let controller: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let identity = rx.borrow_and_update().clone();
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                controller.set_identity(identity);
            }
        })
    }

    /// Creates a task owned by the current identity.
    ///
    /// The text is trimmed and validated before the store is contacted. The
    /// new task shows up only through the next snapshot.
    ///
    /// # Errors
    ///
    /// [`SyncError::EmptyText`], [`SyncError::TextTooLong`] and
    /// [`SyncError::NotSignedIn`] are raised without touching the store;
    /// [`SyncError::Store`] when the store refuses the write.
    pub async fn add_task(&self, text: &str) -> Result<TaskId, SyncError> {
        let text = normalize_text(text)?;
        let owner = self.identity().ok_or(SyncError::NotSignedIn)?;

        let id = self
            .store
            .create(NewTask::new(text, owner))
            .await
            .map_err(|source| store_failure(Mutation::Add, source))?;
        tracing::debug!(task_id = %id, "create accepted");
        Ok(id)
    }

    /// Flips `completed` on a task in the projection.
    ///
    /// # Errors
    ///
    /// [`SyncError::TaskNotFound`] if `id` is not in the projection;
    /// [`SyncError::Store`] when the store refuses the write (for instance
    /// because another session deleted the task meanwhile).
    pub async fn toggle_task(&self, id: &TaskId) -> Result<(), SyncError> {
        let completed = self.projected(id)?.completed;
        self.store
            .update(id, TaskPatch::completed(!completed))
            .await
            .map_err(|source| store_failure(Mutation::Toggle, source))?;
        tracing::debug!(task_id = %id, completed = !completed, "update accepted");
        Ok(())
    }

    /// Deletes a task in the projection.
    ///
    /// # Errors
    ///
    /// [`SyncError::TaskNotFound`] if `id` is not in the projection;
    /// [`SyncError::Store`] when the store refuses the write.
    pub async fn delete_task(&self, id: &TaskId) -> Result<(), SyncError> {
        self.projected(id)?;
        self.store
            .delete(id)
            .await
            .map_err(|source| store_failure(Mutation::Delete, source))?;
        tracing::debug!(task_id = %id, "delete accepted");
        Ok(())
    }

    /// Copy of the projected task with `id`.
    fn projected(&self, id: &TaskId) -> Result<Task, SyncError> {
        let view = self.shared.view.borrow();
        if view.identity.is_none() {
            return Err(SyncError::NotSignedIn);
        }
        view.task(id)
            .cloned()
            .ok_or_else(|| SyncError::TaskNotFound(id.clone()))
    }

    fn restart(&self, inner: &mut Inner, identity: Option<Identity>) {
        inner.generation += 1;
        if let Some(listener) = inner.listener.take() {
            listener.abort();
        }
        inner.identity.clone_from(&identity);

        let Some(owner) = identity else {
            tracing::info!("live query torn down");
            self.shared.view.send_replace(SyncView::signed_out());
            return;
        };

        tracing::info!(identity = %owner, generation = inner.generation, "subscribing");
        self.shared.view.send_replace(SyncView {
            state: SyncState::Subscribing,
            identity: Some(owner.clone()),
            tasks: Arc::from(Vec::new()),
        });
        inner.listener = Some(tokio::spawn(listen(
            Arc::clone(&self.store),
            Arc::clone(&self.shared),
            owner,
            inner.generation,
        )));
    }
}

impl<S> Drop for TaskSyncController<S> {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        inner.generation += 1;
        if let Some(listener) = inner.listener.take() {
            listener.abort();
        }
    }
}

fn store_failure(op: Mutation, source: StoreError) -> SyncError {
    tracing::warn!(%op, error = %source, "store rejected mutation");
    SyncError::Store { op, source }
}

/// Listener task: opens the query and feeds snapshots to the projection until
/// the query fails or its generation goes stale. Never retries.
async fn listen<S: TaskStore>(store: Arc<S>, shared: Arc<Shared>, owner: Identity, generation: u64) {
    let mut subscription = match store.subscribe(&owner).await {
        Ok(subscription) => subscription,
        Err(err) => {
            shared.fail(generation, &err);
            return;
        }
    };

    while let Some(event) = subscription.next_latest().await {
        match event {
            Ok(tasks) => {
                if !shared.apply_snapshot(generation, tasks) {
                    return;
                }
            }
            Err(err) => {
                shared.fail(generation, &err);
                return;
            }
        }
    }
    shared.fail(generation, &StoreError::Closed);
}
