//! Task store abstraction.
//!
//! Defines the [`TaskStore`] trait the sync controller writes through and
//! subscribes to. Concrete implementations:
//! - [`memory::MemoryTaskStore`]: in-process document collection with live queries
//! - [`crate::remote::RemoteBackend`]: WebSocket client of `tasklist-server`

pub mod memory;

use tokio::sync::mpsc;

use tasklist_proto::task::{Identity, NewTask, Task, TaskId, TaskPatch};
use tasklist_proto::wire::Fault;

/// Errors reported by a task store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store has no signed-in session for this request.
    #[error("not signed in")]
    Unauthenticated,
    /// The caller does not own the target document.
    #[error("permission denied")]
    PermissionDenied,
    /// No document with the given id exists.
    #[error("task not found: {0}")]
    NotFound(TaskId),
    /// The store refused a field value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The store could not be reached or timed out.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The connection to the store closed.
    #[error("connection closed")]
    Closed,
}

impl StoreError {
    /// Maps a server fault, attributing `NotFound` to `id` when known.
    #[must_use]
    pub fn from_fault(fault: Fault, id: Option<&TaskId>) -> Self {
        match fault {
            Fault::Unauthenticated => Self::Unauthenticated,
            Fault::PermissionDenied => Self::PermissionDenied,
            Fault::NotFound => id.map_or_else(
                || Self::Unavailable("not found".to_string()),
                |id| Self::NotFound(id.clone()),
            ),
            Fault::InvalidArgument(reason) => Self::InvalidArgument(reason),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// One delivery of a live query: a complete result set, or the failure that
/// ended the query.
pub type SnapshotEvent = Result<Vec<Task>, StoreError>;

/// Sending half of a live query, held by the store.
pub type SnapshotSender = mpsc::UnboundedSender<SnapshotEvent>;

/// Receiving half of a live query.
///
/// Dropping the subscription cancels it: the store notices the closed
/// channel on its next push and forgets the query.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<SnapshotEvent>,
}

impl Subscription {
    /// Creates a connected sender/subscription pair.
    #[must_use]
    pub fn channel() -> (SnapshotSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Waits for the next delivery. `None` once the store has hung up.
    pub async fn next(&mut self) -> Option<SnapshotEvent> {
        self.rx.recv().await
    }

    /// Waits for a delivery, then skips ahead to the newest one already queued.
    ///
    /// Each snapshot is complete, so older queued snapshots carry nothing the
    /// newest one lacks. An error is terminal and is returned as soon as it is
    /// reached.
    pub async fn next_latest(&mut self) -> Option<SnapshotEvent> {
        let mut latest = self.rx.recv().await?;
        while latest.is_ok() {
            match self.rx.try_recv() {
                Ok(newer) => latest = newer,
                Err(_) => break,
            }
        }
        Some(latest)
    }
}

/// Backing document store for tasks.
///
/// # Invariant
///
/// Every snapshot delivered on a [`Subscription`] opened for `owner` holds
/// exactly the tasks owned by `owner`, newest first, as of some point in the
/// store's history.
pub trait TaskStore: Send + Sync + 'static {
    /// Opens a live query for `owner`'s tasks ordered by `created_at` desc.
    ///
    /// The initial result set is delivered as the first snapshot.
    fn subscribe(
        &self,
        owner: &Identity,
    ) -> impl std::future::Future<Output = Result<Subscription, StoreError>> + Send;

    /// Creates a task and returns its store-assigned id.
    fn create(
        &self,
        task: NewTask,
    ) -> impl std::future::Future<Output = Result<TaskId, StoreError>> + Send;

    /// Merges `patch` into the task with `id`.
    fn update(
        &self,
        id: &TaskId,
        patch: TaskPatch,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Deletes the task with `id`.
    fn delete(&self, id: &TaskId) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}
