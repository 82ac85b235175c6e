//! Account registry: email/password accounts and federated subjects.
//!
//! Passwords are stored as argon2id PHC strings. Federated sign-in trusts
//! the subject asserted for any provider enabled in the server config; the
//! first sign-in for a (provider, subject) pair provisions an identity.

use std::collections::HashMap;

use argon2::Argon2;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use tokio::sync::RwLock;

use tasklist_proto::task::Identity;
use tasklist_proto::wire::{FederatedProvider, Fault};

/// Errors returned by the account registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccountError {
    /// Unknown email or wrong password.
    #[error("invalid credentials")]
    InvalidCredentials,
    /// Email already registered.
    #[error("email already in use")]
    EmailInUse,
    /// Password shorter than the configured minimum.
    #[error("password shorter than {0} characters")]
    WeakPassword(usize),
    /// Provider not enabled on this server.
    #[error("provider {0} is not enabled")]
    ProviderDisabled(FederatedProvider),
    /// Empty email or subject.
    #[error("{0} must not be empty")]
    Missing(&'static str),
    /// The password could not be hashed.
    #[error("password hashing failed: {0}")]
    Hashing(String),
}

impl AccountError {
    /// Wire fault for this error.
    #[must_use]
    pub fn fault(&self) -> Fault {
        match self {
            Self::InvalidCredentials => Fault::InvalidCredentials,
            Self::EmailInUse => Fault::EmailInUse,
            Self::WeakPassword(_) => Fault::WeakPassword,
            Self::ProviderDisabled(_) => Fault::ProviderDisabled,
            Self::Missing(field) => Fault::InvalidArgument(format!("{field} must not be empty")),
            Self::Hashing(_) => Fault::Internal("account error".to_string()),
        }
    }
}

/// A signed-in account: the identity plus the name shown to its user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Opaque identity that owns tasks.
    pub identity: Identity,
    /// Normalized email, or `Provider:subject` for federated accounts.
    pub label: String,
}

struct Credential {
    /// argon2id PHC string.
    phc: String,
    identity: Identity,
}

#[derive(Default)]
struct Accounts {
    by_email: HashMap<String, Credential>,
    federated: HashMap<(FederatedProvider, String), Identity>,
}

/// Thread-safe account store.
pub struct AccountRegistry {
    accounts: RwLock<Accounts>,
    min_password_length: usize,
    federated_providers: Vec<FederatedProvider>,
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn hash_password(password: &str) -> Result<String, AccountError> {
    let salt = SaltString::encode_b64(&rand::random::<[u8; 16]>())
        .map_err(|e| AccountError::Hashing(e.to_string()))?;
    let phc = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AccountError::Hashing(e.to_string()))?;
    Ok(phc.to_string())
}

fn verify_password(phc: &str, password: &str) -> bool {
    PasswordHash::new(phc).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
}

impl AccountRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(min_password_length: usize, federated_providers: Vec<FederatedProvider>) -> Self {
        Self {
            accounts: RwLock::new(Accounts::default()),
            min_password_length,
            federated_providers,
        }
    }

    /// Registers an email/password account and returns it.
    ///
    /// # Errors
    ///
    /// [`AccountError::EmailInUse`], [`AccountError::WeakPassword`],
    /// [`AccountError::Missing`] for a blank email, or
    /// [`AccountError::Hashing`].
    pub async fn sign_up(&self, email: &str, password: &str) -> Result<Account, AccountError> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(AccountError::Missing("email"));
        }
        if password.chars().count() < self.min_password_length {
            return Err(AccountError::WeakPassword(self.min_password_length));
        }

        if self.accounts.read().await.by_email.contains_key(&email) {
            return Err(AccountError::EmailInUse);
        }
        // Hash outside the lock; the write below re-checks the email.
        let phc = hash_password(password)?;

        let mut accounts = self.accounts.write().await;
        if accounts.by_email.contains_key(&email) {
            return Err(AccountError::EmailInUse);
        }
        let identity = Identity::generate();
        accounts.by_email.insert(
            email.clone(),
            Credential {
                phc,
                identity: identity.clone(),
            },
        );
        drop(accounts);
        tracing::info!(identity = %identity, "account created");
        Ok(Account {
            identity,
            label: email,
        })
    }

    /// Verifies an email/password pair.
    ///
    /// # Errors
    ///
    /// [`AccountError::InvalidCredentials`] for an unknown email or a wrong
    /// password; the two are indistinguishable to the caller.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Account, AccountError> {
        let email = normalize_email(email);
        let (phc, identity) = {
            let accounts = self.accounts.read().await;
            let credential = accounts
                .by_email
                .get(&email)
                .ok_or(AccountError::InvalidCredentials)?;
            (credential.phc.clone(), credential.identity.clone())
        };
        if !verify_password(&phc, password) {
            return Err(AccountError::InvalidCredentials);
        }
        Ok(Account {
            identity,
            label: email,
        })
    }

    /// Resolves (or provisions) the identity for a federated subject.
    ///
    /// # Errors
    ///
    /// [`AccountError::ProviderDisabled`] if `provider` is not enabled;
    /// [`AccountError::Missing`] for a blank subject.
    pub async fn sign_in_federated(
        &self,
        provider: FederatedProvider,
        subject: &str,
    ) -> Result<Account, AccountError> {
        if !self.federated_providers.contains(&provider) {
            return Err(AccountError::ProviderDisabled(provider));
        }
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(AccountError::Missing("subject"));
        }

        let mut accounts = self.accounts.write().await;
        let identity = accounts
            .federated
            .entry((provider, subject.to_string()))
            .or_insert_with(|| {
                tracing::info!(%provider, "provisioning federated identity");
                Identity::generate()
            })
            .clone();
        drop(accounts);
        Ok(Account {
            identity,
            label: provider.account_label(subject),
        })
    }
}
