//! WebSocket wire protocol between `tasklist` clients and the store server.
//!
//! Every frame is one postcard-encoded [`ClientMessage`] or [`ServerMessage`]
//! carried in a binary WebSocket message. Requests carry a client-chosen
//! `request_id` that the server echoes in exactly one response. Live query
//! pushes are tagged with the client-chosen `subscription_id` instead.

use serde::{Deserialize, Serialize};

use crate::task::{Identity, NewTask, Task, TaskId, TaskPatch};

/// Error type for wire encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// External identity providers accepted for federated sign-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FederatedProvider {
    /// Google accounts.
    Google,
}

impl FederatedProvider {
    /// Lower-case name used in configuration files.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Google => "google",
        }
    }

    /// Display name of the account `subject` holds at this provider.
    #[must_use]
    pub fn account_label(&self, subject: &str) -> String {
        format!("{self}:{subject}")
    }

    /// Parses a provider from its configuration name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "google" => Some(Self::Google),
            _ => None,
        }
    }
}

impl std::fmt::Display for FederatedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Google => write!(f, "Google"),
        }
    }
}

/// Why the server refused a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fault {
    /// The connection has no signed-in identity.
    Unauthenticated,
    /// The signed-in identity does not own the target.
    PermissionDenied,
    /// No task with the given id exists.
    NotFound,
    /// Unknown email or wrong password.
    InvalidCredentials,
    /// Sign-up with an email that already has an account.
    EmailInUse,
    /// Password shorter than the server minimum.
    WeakPassword,
    /// Federated provider not enabled on this server.
    ProviderDisabled,
    /// A field failed validation.
    InvalidArgument(String),
    /// Anything else.
    Internal(String),
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthenticated => write!(f, "not signed in"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::NotFound => write!(f, "not found"),
            Self::InvalidCredentials => write!(f, "invalid credentials"),
            Self::EmailInUse => write!(f, "email already in use"),
            Self::WeakPassword => write!(f, "password too weak"),
            Self::ProviderDisabled => write!(f, "identity provider disabled"),
            Self::InvalidArgument(reason) => write!(f, "invalid argument: {reason}"),
            Self::Internal(reason) => write!(f, "internal error: {reason}"),
        }
    }
}

/// Messages sent from a client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Create an account and sign in to it.
    SignUp {
        /// Correlates the response.
        request_id: u64,
        /// Account email.
        email: String,
        /// Account password.
        password: String,
    },
    /// Sign in with email and password.
    SignIn {
        /// Correlates the response.
        request_id: u64,
        /// Account email.
        email: String,
        /// Account password.
        password: String,
    },
    /// Sign in with a subject asserted by an external provider.
    SignInFederated {
        /// Correlates the response.
        request_id: u64,
        /// Which provider asserted the subject.
        provider: FederatedProvider,
        /// Provider-scoped user subject.
        subject: String,
    },
    /// End the session on this connection.
    SignOut {
        /// Correlates the response.
        request_id: u64,
    },
    /// Open a live query for `owner`'s tasks, newest first.
    Subscribe {
        /// Correlates the response.
        request_id: u64,
        /// Tags every snapshot pushed for this query.
        subscription_id: u64,
        /// Identity whose tasks are requested.
        owner: Identity,
    },
    /// Close a live query. No response.
    Unsubscribe {
        /// The query to close.
        subscription_id: u64,
    },
    /// Create a task.
    Create {
        /// Correlates the response.
        request_id: u64,
        /// Client-supplied fields.
        task: NewTask,
    },
    /// Merge a partial update into a task.
    Update {
        /// Correlates the response.
        request_id: u64,
        /// Target task.
        id: TaskId,
        /// Fields to change.
        patch: TaskPatch,
    },
    /// Delete a task.
    Delete {
        /// Correlates the response.
        request_id: u64,
        /// Target task.
        id: TaskId,
    },
}

/// Messages sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Sign-up or sign-in succeeded.
    SignedIn {
        /// Echo of the request.
        request_id: u64,
        /// Identity bound to this connection from now on.
        identity: Identity,
        /// Human-readable account name: the email, or `Provider:subject`.
        account: String,
    },
    /// Sign-out succeeded.
    SignedOut {
        /// Echo of the request.
        request_id: u64,
    },
    /// Task created.
    Created {
        /// Echo of the request.
        request_id: u64,
        /// Store-assigned id.
        id: TaskId,
    },
    /// Request accepted with no payload (subscribe, update, delete).
    Ack {
        /// Echo of the request.
        request_id: u64,
    },
    /// Request refused.
    Rejected {
        /// Echo of the request.
        request_id: u64,
        /// Why.
        fault: Fault,
    },
    /// Full result set of a live query.
    Snapshot {
        /// Query this snapshot belongs to.
        subscription_id: u64,
        /// Every matching task, newest first.
        tasks: Vec<Task>,
    },
    /// Frame-level problem not tied to a request (oversized or undecodable frame).
    Error {
        /// Human-readable description.
        reason: String,
    },
}

impl ServerMessage {
    /// The request this message answers, if it is a response.
    #[must_use]
    pub const fn request_id(&self) -> Option<u64> {
        match self {
            Self::SignedIn { request_id, .. }
            | Self::SignedOut { request_id }
            | Self::Created { request_id, .. }
            | Self::Ack { request_id }
            | Self::Rejected { request_id, .. } => Some(*request_id),
            Self::Snapshot { .. } | Self::Error { .. } => None,
        }
    }
}

/// Encodes a [`ClientMessage`] into bytes using postcard.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if serialization fails.
pub fn encode_client(msg: &ClientMessage) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(msg).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a [`ClientMessage`] from bytes using postcard.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the bytes are not a valid message.
pub fn decode_client(bytes: &[u8]) -> Result<ClientMessage, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Encodes a [`ServerMessage`] into bytes using postcard.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if serialization fails.
pub fn encode_server(msg: &ServerMessage) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(msg).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a [`ServerMessage`] from bytes using postcard.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the bytes are not a valid message.
pub fn decode_server(bytes: &[u8]) -> Result<ServerMessage, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Timestamp;

    #[test]
    fn snapshot_preserves_order_and_pending_timestamps() {
        let owner = Identity::new("alice");
        let tasks = vec![
            Task {
                id: TaskId::new(),
                text: "pending".to_string(),
                completed: false,
                owner: owner.clone(),
                created_at: None,
            },
            Task {
                id: TaskId::new(),
                text: "Buy milk".to_string(),
                completed: true,
                owner,
                created_at: Some(Timestamp::from_millis(1_000)),
            },
        ];
        let msg = ServerMessage::Snapshot {
            subscription_id: 7,
            tasks: tasks.clone(),
        };
        let decoded = decode_server(&encode_server(&msg).unwrap()).unwrap();
        let ServerMessage::Snapshot {
            subscription_id,
            tasks: got,
        } = decoded
        else {
            panic!("expected Snapshot");
        };
        assert_eq!(subscription_id, 7);
        assert_eq!(got, tasks);
    }

    #[test]
    fn create_request_carries_owner() {
        let msg = ClientMessage::Create {
            request_id: 3,
            task: NewTask::new("Walk dog".to_string(), Identity::new("bob")),
        };
        let decoded = decode_client(&encode_client(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn rejected_fault_with_reason_survives() {
        let msg = ServerMessage::Rejected {
            request_id: 11,
            fault: Fault::InvalidArgument("task text cannot be empty".to_string()),
        };
        assert_eq!(decode_server(&encode_server(&msg).unwrap()).unwrap(), msg);
    }

    #[test]
    fn federated_account_label_names_provider() {
        assert_eq!(
            FederatedProvider::Google.account_label("sub-42"),
            "Google:sub-42"
        );
    }

    #[test]
    fn request_id_only_on_responses() {
        assert_eq!(ServerMessage::Ack { request_id: 4 }.request_id(), Some(4));
        assert_eq!(
            ServerMessage::Snapshot {
                subscription_id: 4,
                tasks: vec![],
            }
            .request_id(),
            None
        );
        assert_eq!(
            ServerMessage::Error {
                reason: "x".to_string()
            }
            .request_id(),
            None
        );
    }

    #[test]
    fn decode_corrupted_bytes_fails() {
        assert!(decode_server(&[0xFF, 0xFE, 0xFD, 0xFC]).is_err());
        assert!(decode_client(&[0xFF, 0xFE, 0xFD, 0xFC]).is_err());
    }

    #[test]
    fn decode_empty_bytes_fails() {
        assert!(decode_server(&[]).is_err());
        assert!(decode_client(&[]).is_err());
    }

    #[test]
    fn provider_names_parse() {
        assert_eq!(
            FederatedProvider::from_name(" Google "),
            Some(FederatedProvider::Google)
        );
        assert_eq!(FederatedProvider::from_name("github"), None);
        assert_eq!(FederatedProvider::Google.as_str(), "google");
    }
}
