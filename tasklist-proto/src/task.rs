//! Task data model shared by the client and the store server.
//!
//! A [`Task`] belongs to exactly one [`Identity`] for its whole lifetime.
//! Only `completed` changes after creation, and the only way to express a
//! change is a [`TaskPatch`], so `id`, `owner` and `text` stay write-once by
//! construction.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed task text length in characters (after trimming).
pub const MAX_TASK_TEXT_LENGTH: usize = 100;

/// Store-assigned task identifier (UUID v7).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Creates a new time-ordered task identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `TaskId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identity of an authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(String);

impl Identity {
    /// Wraps an identity string issued by a session provider.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Issues a fresh random identity.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().simple().to_string())
    }

    /// Returns the string form of this identity.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-assigned creation time, milliseconds since the UNIX epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Wall clock that never hands out the same timestamp twice.
///
/// Two creations inside the same millisecond still get strictly increasing
/// `created_at` values, so the newest-first order is total for committed tasks.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: u64,
}

impl MonotonicClock {
    /// Creates a clock that has not issued any timestamp yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { last: 0 }
    }

    /// Returns the next timestamp, at least one millisecond after the previous one.
    pub fn tick(&mut self) -> Timestamp {
        let now = Timestamp::now().as_millis();
        self.last = now.max(self.last.saturating_add(1));
        Timestamp(self.last)
    }
}

/// A to-do item as stored and delivered in snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Store-assigned identifier.
    pub id: TaskId,
    /// User-supplied text, already trimmed and length-checked.
    pub text: String,
    /// Whether the task has been marked done.
    pub completed: bool,
    /// Identity that created the task.
    pub owner: Identity,
    /// Commit time; `None` while the server has not committed it yet.
    pub created_at: Option<Timestamp>,
}

impl Task {
    /// Merges a partial update into this task.
    pub fn apply(&mut self, patch: &TaskPatch) {
        if let Some(completed) = patch.completed {
            self.completed = completed;
        }
    }
}

/// Fields supplied by the client when creating a task.
///
/// `id` and `created_at` are never client-supplied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    /// Trimmed task text.
    pub text: String,
    /// Carried on the wire; stores create every task open regardless.
    pub completed: bool,
    /// Creating identity.
    pub owner: Identity,
}

impl NewTask {
    /// Builds an open task for `owner`.
    #[must_use]
    pub const fn new(text: String, owner: Identity) -> Self {
        Self {
            text,
            completed: false,
            owner,
        }
    }
}

/// Partial update of a task. `completed` is the only mutable field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPatch {
    /// New completion flag, if changing.
    pub completed: Option<bool>,
}

impl TaskPatch {
    /// Patch that sets `completed`.
    #[must_use]
    pub const fn completed(completed: bool) -> Self {
        Self {
            completed: Some(completed),
        }
    }
}

/// Reasons task text is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TextError {
    /// Text is empty or whitespace only.
    #[error("task text cannot be empty")]
    Empty,
    /// Text exceeds [`MAX_TASK_TEXT_LENGTH`] characters.
    #[error("task text too long (max {MAX_TASK_TEXT_LENGTH} characters)")]
    TooLong,
}

/// Trims `raw` and checks it against the task text bounds.
///
/// Length is counted in characters, not bytes.
///
/// # Errors
///
/// Returns [`TextError::Empty`] for empty or whitespace-only input and
/// [`TextError::TooLong`] when the trimmed text has more than
/// [`MAX_TASK_TEXT_LENGTH`] characters.
pub fn normalize_text(raw: &str) -> Result<String, TextError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TextError::Empty);
    }
    if trimmed.chars().count() > MAX_TASK_TEXT_LENGTH {
        return Err(TextError::TooLong);
    }
    Ok(trimmed.to_string())
}

/// Newest-first ordering on `created_at`.
///
/// Tasks whose timestamp is still pending are the most recent writes and sort
/// ahead of every committed task.
#[must_use]
pub fn newest_first(a: &Task, b: &Task) -> Ordering {
    match (a.created_at, b.created_at) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => y.cmp(&x),
    }
}

/// Stable-sorts `tasks` newest first.
pub fn sort_newest_first(tasks: &mut [Task]) {
    tasks.sort_by(newest_first);
}
