//! Line commands and list rendering for the CLI.

use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{Local, TimeZone};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tasklist_proto::task::{TaskId, Timestamp};

use crate::store::TaskStore;
use crate::sync::{SyncState, SyncView, TaskSyncController};

/// Shown by `help`.
pub const HELP: &str = "\
Commands:
  signup <email> <password>   create an account and sign in
  signin <email> <password>   sign in with email and password
  google <subject>            sign in with Google
  signout                     sign out
  add <text>                  add a task
  toggle <n>                  mark task n done / not done
  delete <n>                  delete task n
  list                        show your tasks
  retry                       reload tasks after an error
  help                        show this help
  quit                        exit";

/// A parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `signup <email> <password>`
    SignUp {
        /// Account email.
        email: String,
        /// Account password.
        password: String,
    },
    /// `signin <email> <password>`
    SignIn {
        /// Account email.
        email: String,
        /// Account password.
        password: String,
    },
    /// `google <subject>`
    Google {
        /// Subject asserted by the provider.
        subject: String,
    },
    /// `signout`
    SignOut,
    /// `add <text>`; the text is passed on untrimmed.
    Add(String),
    /// `toggle <n>`, 1-based.
    Toggle(usize),
    /// `delete <n>`, 1-based.
    Delete(usize),
    /// `list`
    List,
    /// `retry`
    Retry,
    /// `help`
    Help,
    /// `quit`
    Quit,
}

/// Why an input line is not a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Blank line.
    #[error("empty command")]
    Empty,
    /// First word is not a command.
    #[error("unknown command {0:?}, type `help`")]
    Unknown(String),
    /// Required arguments are missing.
    #[error("usage: {0}")]
    Usage(&'static str),
    /// Position is not a positive integer.
    #[error("{0:?} is not a task number")]
    InvalidIndex(String),
}

impl Command {
    /// Parses one input line.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] when the line is blank, names no known command,
    /// or lacks the command's arguments.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim_start();
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let args: Vec<&str> = rest.split_whitespace().collect();

        match word.to_ascii_lowercase().as_str() {
            "" => Err(ParseError::Empty),
            "signup" => credentials(&args, "signup <email> <password>")
                .map(|(email, password)| Self::SignUp { email, password }),
            "signin" => credentials(&args, "signin <email> <password>")
                .map(|(email, password)| Self::SignIn { email, password }),
            "google" => match args.as_slice() {
                [subject] => Ok(Self::Google {
                    subject: (*subject).to_string(),
                }),
                _ => Err(ParseError::Usage("google <subject>")),
            },
            "signout" => Ok(Self::SignOut),
            "add" => Ok(Self::Add(rest.trim_end_matches(['\r', '\n']).to_string())),
            "toggle" => position(&args, "toggle <n>").map(Self::Toggle),
            "delete" => position(&args, "delete <n>").map(Self::Delete),
            "list" | "ls" => Ok(Self::List),
            "retry" => Ok(Self::Retry),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(ParseError::Unknown(other.to_string())),
        }
    }
}

fn credentials(args: &[&str], usage: &'static str) -> Result<(String, String), ParseError> {
    match args {
        [email, password] => Ok(((*email).to_string(), (*password).to_string())),
        _ => Err(ParseError::Usage(usage)),
    }
}

fn position(args: &[&str], usage: &'static str) -> Result<usize, ParseError> {
    let [raw] = args else {
        return Err(ParseError::Usage(usage));
    };
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ParseError::InvalidIndex((*raw).to_string())),
    }
}

/// A list edit resolved against the view it was typed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    /// Create a task from raw input text.
    Add(String),
    /// Flip `completed` on a task.
    Toggle(TaskId),
    /// Remove a task.
    Delete(TaskId),
}

impl Edit {
    /// Applies the edit through `controller` and returns the message to
    /// show if it failed. Success is silent: the change arrives as a snapshot.
    pub async fn apply<S: TaskStore>(self, controller: &TaskSyncController<S>) -> Option<String> {
        let result = match &self {
            Self::Add(text) => controller.add_task(text).await.map(|_| ()),
            Self::Toggle(id) => controller.toggle_task(id).await,
            Self::Delete(id) => controller.delete_task(id).await,
        };
        result.err().map(|e| {
            tracing::debug!(edit = ?self, err = %e, "edit failed");
            e.user_message()
        })
    }

    /// Runs [`apply`](Self::apply) on its own task, so input keeps flowing
    /// while the store round trip is in flight. A failure message is sent on
    /// `failures`; the task holds a clone of the sender until it finishes.
    pub fn spawn<S: TaskStore>(
        self,
        controller: &Arc<TaskSyncController<S>>,
        failures: &mpsc::UnboundedSender<String>,
    ) -> JoinHandle<()> {
        let controller = Arc::clone(controller);
        let failures = failures.clone();
        tokio::spawn(async move {
            if let Some(message) = self.apply(&controller).await {
                let _ = failures.send(message);
            }
        })
    }
}

/// Id of the task shown at 1-based position `n`.
#[must_use]
pub fn task_at(view: &SyncView, n: usize) -> Option<TaskId> {
    n.checked_sub(1)
        .and_then(|index| view.tasks.get(index))
        .map(|task| task.id.clone())
}

/// Formats a committed timestamp in local time with a chrono format string.
///
/// Falls back to raw milliseconds if the timestamp is out of range or the
/// format string is invalid.
#[must_use]
pub fn format_timestamp(ts: Timestamp, format: &str) -> String {
    let local = i64::try_from(ts.as_millis())
        .ok()
        .and_then(|ms| Local.timestamp_millis_opt(ms).single());
    let Some(local) = local else {
        return ts.to_string();
    };
    let mut out = String::new();
    if write!(out, "{}", local.format(format)).is_err() {
        return ts.to_string();
    }
    out
}

/// Renders the projection as numbered lines.
///
/// The header names `account` when the session provides one, else the raw
/// identity.
#[must_use]
pub fn render(view: &SyncView, account: Option<&str>, timestamp_format: &str) -> String {
    let mut out = String::new();
    let Some(identity) = &view.identity else {
        out.push_str("Not signed in. Use `signup`, `signin` or `google`.");
        return out;
    };

    let status = match &view.state {
        SyncState::Unsubscribed => "offline",
        SyncState::Subscribing => "loading",
        SyncState::Live => "live",
        SyncState::Error(_) => "error",
    };
    let _ = match account {
        Some(account) => writeln!(out, "Tasks for {account} [{status}]"),
        None => writeln!(out, "Tasks for {identity} [{status}]"),
    };
    if let SyncState::Error(banner) = &view.state {
        let _ = writeln!(out, "! {banner} (type `retry` to reload)");
    }

    if view.tasks.is_empty() {
        if view.state == SyncState::Live {
            out.push_str("  (no tasks)");
        }
        return out.trim_end().to_string();
    }

    for (index, task) in view.tasks.iter().enumerate() {
        let mark = if task.completed { 'x' } else { ' ' };
        let created = task.created_at.map_or_else(
            || "pending".to_string(),
            |ts| format_timestamp(ts, timestamp_format),
        );
        let _ = writeln!(out, "{:>3}. [{mark}] {}  ({created})", index + 1, task.text);
    }
    out.trim_end().to_string()
}
