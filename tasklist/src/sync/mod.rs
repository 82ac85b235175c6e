//! Task synchronization for the signed-in user.
//!
//! The [`TaskSyncController`] keeps a projection of one identity's tasks,
//! newest first, rebuilt wholesale from each store snapshot. User intents
//! (add, toggle, delete) are written to the store and only become visible
//! when the store pushes the next snapshot.

pub mod controller;

use std::sync::Arc;

pub use controller::TaskSyncController;

use tasklist_proto::task::{Identity, MAX_TASK_TEXT_LENGTH, Task, TaskId, TextError};

use crate::store::StoreError;

/// Lifecycle of the controller's live query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    /// No identity, no query.
    Unsubscribed,
    /// Query requested, first snapshot not yet applied.
    Subscribing,
    /// At least one snapshot applied; the projection mirrors the store.
    Live,
    /// The query failed. Carries the banner text shown above the list.
    Error(String),
}

impl SyncState {
    /// Whether the state is [`SyncState::Error`].
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// What the presentation layer renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncView {
    /// Query lifecycle.
    pub state: SyncState,
    /// Identity the projection belongs to.
    pub identity: Option<Identity>,
    /// The projection, newest first.
    pub tasks: Arc<[Task]>,
}

impl SyncView {
    /// View with no identity and no tasks.
    #[must_use]
    pub fn signed_out() -> Self {
        Self {
            state: SyncState::Unsubscribed,
            identity: None,
            tasks: Arc::from(Vec::new()),
        }
    }

    /// Looks up a task in the projection.
    #[must_use]
    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == *id)
    }
}

/// Which mutation a store failure interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    /// `add_task`.
    Add,
    /// `toggle_task`.
    Toggle,
    /// `delete_task`.
    Delete,
}

impl std::fmt::Display for Mutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Toggle => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Errors returned by controller mutations.
///
/// None of them change the projection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Text empty or whitespace only.
    #[error("task text cannot be empty")]
    EmptyText,
    /// Text longer than the limit.
    #[error("task text too long (max {MAX_TASK_TEXT_LENGTH} characters)")]
    TextTooLong,
    /// No identity is signed in.
    #[error("not signed in")]
    NotSignedIn,
    /// The id is not in the current projection.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    /// The store refused or failed the write.
    #[error("failed to {op} task: {source}")]
    Store {
        /// Interrupted mutation.
        op: Mutation,
        /// Store-reported cause.
        source: StoreError,
    },
}

impl From<TextError> for SyncError {
    fn from(err: TextError) -> Self {
        match err {
            TextError::Empty => Self::EmptyText,
            TextError::TooLong => Self::TextTooLong,
        }
    }
}

impl SyncError {
    /// The transient message shown to the user for this failure.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::EmptyText => "Enter a task first.".to_string(),
            Self::TextTooLong => {
                format!("Tasks are limited to {MAX_TASK_TEXT_LENGTH} characters.")
            }
            Self::NotSignedIn => "Sign in to manage your tasks.".to_string(),
            Self::TaskNotFound(_) => "That task no longer exists.".to_string(),
            Self::Store { op, source } => format!("Failed to {op} task: {source}"),
        }
    }
}

/// Banner text for a failed live query.
#[must_use]
pub fn subscription_banner(err: &StoreError) -> String {
    format!("Failed to load tasks: {err}")
}
