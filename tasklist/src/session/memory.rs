//! In-process session provider for offline use and tests.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::watch;

use tasklist_proto::task::Identity;
use tasklist_proto::wire::FederatedProvider;

use super::{AuthError, SessionProvider};

/// Minimum password length accepted at sign-up.
const MIN_PASSWORD_LENGTH: usize = 6;

struct Account {
    password: String,
    identity: Identity,
}

#[derive(Default)]
struct Accounts {
    by_email: HashMap<String, Account>,
    federated: HashMap<(FederatedProvider, String), Identity>,
}

/// [`SessionProvider`] holding accounts in memory.
///
/// Passwords are kept in the clear; this provider never leaves the process.
pub struct MemorySessionProvider {
    accounts: Mutex<Accounts>,
    account: Mutex<Option<String>>,
    identity: watch::Sender<Option<Identity>>,
}

impl Default for MemorySessionProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySessionProvider {
    /// Creates a provider with no accounts and nobody signed in.
    #[must_use]
    pub fn new() -> Self {
        let (identity, _) = watch::channel(None);
        Self {
            accounts: Mutex::new(Accounts::default()),
            account: Mutex::new(None),
            identity,
        }
    }

    /// Records the account label before publishing, so watchers see both.
    fn publish(&self, identity: &Identity, account: String) {
        tracing::info!(identity = %identity, "signed in");
        *self.account.lock() = Some(account);
        self.identity.send_replace(Some(identity.clone()));
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

impl SessionProvider for MemorySessionProvider {
    fn current_identity(&self) -> Option<Identity> {
        self.identity.borrow().clone()
    }

    fn current_account(&self) -> Option<String> {
        self.account.lock().clone()
    }

    fn watch_identity(&self) -> watch::Receiver<Option<Identity>> {
        self.identity.subscribe()
    }

    async fn sign_in_password(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        let email = normalize_email(email);
        let identity = {
            let accounts = self.accounts.lock();
            let account = accounts
                .by_email
                .get(&email)
                .ok_or(AuthError::InvalidCredentials)?;
            if account.password != password {
                return Err(AuthError::InvalidCredentials);
            }
            account.identity.clone()
        };
        self.publish(&identity, email);
        Ok(identity)
    }

    async fn sign_up_password(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(AuthError::InvalidCredentials);
        }
        if password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(AuthError::WeakPassword);
        }
        let identity = {
            let mut accounts = self.accounts.lock();
            if accounts.by_email.contains_key(&email) {
                return Err(AuthError::EmailInUse);
            }
            let identity = Identity::generate();
            accounts.by_email.insert(
                email.clone(),
                Account {
                    password: password.to_string(),
                    identity: identity.clone(),
                },
            );
            identity
        };
        self.publish(&identity, email);
        Ok(identity)
    }

    async fn sign_in_federated(
        &self,
        provider: FederatedProvider,
        subject: &str,
    ) -> Result<Identity, AuthError> {
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(AuthError::Federated {
                provider,
                reason: "empty subject".to_string(),
            });
        }
        let identity = self
            .accounts
            .lock()
            .federated
            .entry((provider, subject.to_string()))
            .or_insert_with(Identity::generate)
            .clone();
        self.publish(&identity, provider.account_label(subject));
        Ok(identity)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        *self.account.lock() = None;
        if let Some(previous) = self.identity.send_replace(None) {
            tracing::info!(identity = %previous, "signed out");
        }
        Ok(())
    }
}
