//! Session provider abstraction.
//!
//! A [`SessionProvider`] authenticates users and publishes the current
//! [`Identity`] on a `watch` channel. Concrete implementations:
//! - [`memory::MemorySessionProvider`]: in-process accounts for offline use and tests
//! - [`crate::remote::RemoteBackend`]: accounts held by `tasklist-server`

pub mod memory;

use tokio::sync::watch;

use tasklist_proto::task::Identity;
use tasklist_proto::wire::{FederatedProvider, Fault};

/// User-facing message for any failed email/password flow.
pub const PASSWORD_AUTH_FAILED: &str = "Authentication failed. Check your credentials.";

/// User-facing message for any failed federated sign-in.
pub const FEDERATED_AUTH_FAILED: &str = "Could not sign in with Google.";

/// Errors reported by a session provider.
///
/// The variants exist for logging; users only ever see
/// [`user_message`](Self::user_message).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Unknown email or wrong password.
    #[error("invalid credentials")]
    InvalidCredentials,
    /// Sign-up with an email that already has an account.
    #[error("email already in use")]
    EmailInUse,
    /// Password rejected by the provider's policy.
    #[error("password too weak")]
    WeakPassword,
    /// Federated sign-in failed.
    #[error("{provider} sign-in failed: {reason}")]
    Federated {
        /// Provider that was asked.
        provider: FederatedProvider,
        /// Provider-internal detail.
        reason: String,
    },
    /// The provider could not be reached or answered unexpectedly.
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

impl AuthError {
    /// The fixed message shown to the user for this failure.
    #[must_use]
    pub const fn user_message(&self) -> &'static str {
        match self {
            Self::Federated { .. } => FEDERATED_AUTH_FAILED,
            _ => PASSWORD_AUTH_FAILED,
        }
    }

    /// Maps a server fault from an email/password request.
    #[must_use]
    pub fn from_fault(fault: Fault) -> Self {
        match fault {
            Fault::InvalidCredentials => Self::InvalidCredentials,
            Fault::EmailInUse => Self::EmailInUse,
            Fault::WeakPassword => Self::WeakPassword,
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// Identity provider consumed by the client.
pub trait SessionProvider: Send + Sync + 'static {
    /// The identity currently signed in, if any.
    fn current_identity(&self) -> Option<Identity>;

    /// Display name of the signed-in account: the normalized email, or
    /// `Provider:subject` for federated accounts.
    fn current_account(&self) -> Option<String>;

    /// Subscribes to identity changes. The receiver starts at the current value.
    fn watch_identity(&self) -> watch::Receiver<Option<Identity>>;

    /// Signs in an existing account.
    fn sign_in_password(
        &self,
        email: &str,
        password: &str,
    ) -> impl std::future::Future<Output = Result<Identity, AuthError>> + Send;

    /// Creates an account and signs in to it.
    fn sign_up_password(
        &self,
        email: &str,
        password: &str,
    ) -> impl std::future::Future<Output = Result<Identity, AuthError>> + Send;

    /// Signs in with a subject asserted by an external provider.
    fn sign_in_federated(
        &self,
        provider: FederatedProvider,
        subject: &str,
    ) -> impl std::future::Future<Output = Result<Identity, AuthError>> + Send;

    /// Ends the current session.
    fn sign_out(&self) -> impl std::future::Future<Output = Result<(), AuthError>> + Send;
}
