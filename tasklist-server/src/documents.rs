//! The task document collection and its live queries.
//!
//! Every task lives in one collection. A live query is registered per
//! (connection, subscription) and receives the owner's complete result set,
//! newest first, after every write that touches that owner. Ownership is
//! enforced here: callers may only read and write their own tasks.

use tokio::sync::{RwLock, mpsc};

use tasklist_proto::task::{
    Identity, MonotonicClock, NewTask, Task, TaskId, TaskPatch, TextError, normalize_text,
    sort_newest_first,
};
use tasklist_proto::wire::{Fault, ServerMessage};

/// Outbound channel of one connection.
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

/// Errors returned by collection operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    /// The caller does not own the target.
    #[error("permission denied")]
    PermissionDenied,
    /// No task with the given id.
    #[error("task {0} not found")]
    NotFound(TaskId),
    /// Task text failed validation.
    #[error("invalid text: {0}")]
    InvalidText(#[from] TextError),
}

impl DocumentError {
    /// Wire fault for this error.
    #[must_use]
    pub fn fault(&self) -> Fault {
        match self {
            Self::PermissionDenied => Fault::PermissionDenied,
            Self::NotFound(_) => Fault::NotFound,
            Self::InvalidText(e) => Fault::InvalidArgument(e.to_string()),
        }
    }
}

struct LiveQuery {
    connection: u64,
    subscription_id: u64,
    owner: Identity,
    tx: Outbound,
}

#[derive(Default)]
struct Documents {
    /// Insertion order.
    tasks: Vec<Task>,
    queries: Vec<LiveQuery>,
    clock: MonotonicClock,
}

impl Documents {
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

    /// Pushes `owner`'s result set to each of their live queries, dropping
    /// queries whose connection is gone.
    fn notify(&mut self, owner: &Identity) {
        let tasks = self.query(owner);
        self.queries.retain(|q| {
            if q.owner != *owner {
                return true;
            }
            q.tx
                .send(ServerMessage::Snapshot {
                    subscription_id: q.subscription_id,
                    tasks: tasks.clone(),
                })
                .is_ok()
        });
    }

    /// Index of `id`, checked against `caller`.
    fn owned(&self, caller: &Identity, id: &TaskId) -> Result<usize, DocumentError> {
        let index = self
            .tasks
            .iter()
            .position(|t| t.id == *id)
            .ok_or_else(|| DocumentError::NotFound(id.clone()))?;
        if self.tasks[index].owner != *caller {
            return Err(DocumentError::PermissionDenied);
        }
        Ok(index)
    }
}

/// Thread-safe task collection with live queries.
pub struct TaskCollection {
    inner: RwLock<Documents>,
}

impl Default for TaskCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskCollection {
    /// Creates an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Documents::default()),
        }
    }

    /// Opens a live query on `owner`'s tasks and pushes the initial result set.
    ///
    /// # Errors
    ///
    /// [`DocumentError::PermissionDenied`] unless `caller` is `owner`.
    pub async fn subscribe(
        &self,
        connection: u64,
        subscription_id: u64,
        caller: &Identity,
        owner: &Identity,
        tx: Outbound,
    ) -> Result<(), DocumentError> {
        if caller != owner {
            tracing::warn!(caller = %caller, owner = %owner, "subscribe to foreign tasks refused");
            return Err(DocumentError::PermissionDenied);
        }
        let mut docs = self.inner.write().await;
        let _ = tx.send(ServerMessage::Snapshot {
            subscription_id,
            tasks: docs.query(owner),
        });
        docs.queries.push(LiveQuery {
            connection,
            subscription_id,
            owner: owner.clone(),
            tx,
        });
        drop(docs);
        tracing::debug!(connection, subscription_id, owner = %owner, "live query opened");
        Ok(())
    }

    /// Closes one live query. Returns whether it existed.
    pub async fn unsubscribe(&self, connection: u64, subscription_id: u64) -> bool {
        let mut docs = self.inner.write().await;
        let before = docs.queries.len();
        docs.queries
            .retain(|q| !(q.connection == connection && q.subscription_id == subscription_id));
        before != docs.queries.len()
    }

    /// Closes every live query of a connection. Returns how many were closed.
    pub async fn drop_connection(&self, connection: u64) -> usize {
        let mut docs = self.inner.write().await;
        let before = docs.queries.len();
        docs.queries.retain(|q| q.connection != connection);
        before - docs.queries.len()
    }

    /// Number of open live queries.
    pub async fn live_queries(&self) -> usize {
        self.inner.read().await.queries.len()
    }

    /// Stores a new task and stamps `created_at`. New tasks always start
    /// open; a `completed` flag sent by the client is ignored.
    ///
    /// # Errors
    ///
    /// [`DocumentError::PermissionDenied`] if `task.owner` is not `caller`;
    /// [`DocumentError::InvalidText`] if the text fails validation.
    pub async fn create(&self, caller: &Identity, task: NewTask) -> Result<TaskId, DocumentError> {
        if task.owner != *caller {
            return Err(DocumentError::PermissionDenied);
        }
        let text = normalize_text(&task.text)?;
        if task.completed {
            tracing::debug!(owner = %caller, "ignoring completed flag on create");
        }

        let mut docs = self.inner.write().await;
        let id = TaskId::new();
        let created_at = docs.clock.tick();
        docs.tasks.push(Task {
            id: id.clone(),
            text,
            completed: false,
            owner: task.owner,
            created_at: Some(created_at),
        });
        docs.notify(caller);
        drop(docs);
        tracing::debug!(task_id = %id, owner = %caller, "task created");
        Ok(id)
    }

    /// Merges `patch` into a task owned by `caller`.
    ///
    /// # Errors
    ///
    /// [`DocumentError::NotFound`] or [`DocumentError::PermissionDenied`].
    pub async fn update(
        &self,
        caller: &Identity,
        id: &TaskId,
        patch: &TaskPatch,
    ) -> Result<(), DocumentError> {
        let mut docs = self.inner.write().await;
        let index = docs.owned(caller, id)?;
        docs.tasks[index].apply(patch);
        docs.notify(caller);
        drop(docs);
        tracing::debug!(task_id = %id, "task updated");
        Ok(())
    }

    /// Deletes a task owned by `caller`.
    ///
    /// # Errors
    ///
    /// [`DocumentError::NotFound`] or [`DocumentError::PermissionDenied`].
    pub async fn delete(&self, caller: &Identity, id: &TaskId) -> Result<(), DocumentError> {
        let mut docs = self.inner.write().await;
        let index = docs.owned(caller, id)?;
        docs.tasks.remove(index);
        docs.notify(caller);
        drop(docs);
        tracing::debug!(task_id = %id, "task deleted");
        Ok(())
    }
}
