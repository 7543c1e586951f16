use std::path::PathBuf;

use firechat_storage::{BoxFuture, StorageError, UserId, UserRecord};
use snafu::Snafu;
use tokio::sync::watch;

/// Authenticated account as seen by the application.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct User {
    pub uid: UserId,
    pub email: String,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
}

impl User {
    /// Name shown in headers and peer lists.
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.email)
    }

    /// Single character used for avatar fallbacks.
    pub fn initial(&self) -> char {
        self.email
            .chars()
            .next()
            .map(|character| character.to_ascii_uppercase())
            .unwrap_or('?')
    }
}

impl From<UserRecord> for User {
    fn from(record: UserRecord) -> Self {
        Self {
            uid: record.id,
            email: record.email,
            display_name: record.display_name,
            photo_url: record.photo_url,
        }
    }
}

/// Session state published by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionStatus {
    /// The provider has not finished its first session check.
    #[default]
    Unknown,
    SignedOut,
    SignedIn(User),
}

impl SessionStatus {
    pub fn user(&self) -> Option<&User> {
        match self {
            Self::SignedIn(user) => Some(user),
            Self::Unknown | Self::SignedOut => None,
        }
    }
}

pub type SessionWatch = watch::Receiver<SessionStatus>;

/// Coarse classification of an [`AuthError`] for callers that branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthErrorReason {
    InvalidCredentials,
    EmailInUse,
    WeakPassword,
    InvalidEmail,
    Network,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AuthError {
    #[snafu(display("invalid email or password"))]
    InvalidCredentials { stage: &'static str },
    #[snafu(display("email '{email}' is already in use"))]
    EmailInUse { stage: &'static str, email: String },
    #[snafu(display("password should be at least {min_length} characters"))]
    WeakPassword {
        stage: &'static str,
        min_length: usize,
    },
    #[snafu(display("'{email}' is not a valid email address"))]
    InvalidEmail { stage: &'static str, email: String },
    #[snafu(display("identity backend failed on `{stage}`: {source}"))]
    Backend {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to access session file at {path:?} on `{stage}`: {source}"))]
    SessionFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to encode session file on `{stage}`: {source}"))]
    SessionEncoding {
        stage: &'static str,
        source: serde_json::Error,
    },
}

impl AuthError {
    pub fn reason(&self) -> AuthErrorReason {
        match self {
            Self::InvalidCredentials { .. } => AuthErrorReason::InvalidCredentials,
            Self::EmailInUse { .. } => AuthErrorReason::EmailInUse,
            Self::WeakPassword { .. } => AuthErrorReason::WeakPassword,
            Self::InvalidEmail { .. } => AuthErrorReason::InvalidEmail,
            Self::Backend { .. } | Self::SessionFile { .. } | Self::SessionEncoding { .. } => {
                AuthErrorReason::Network
            }
        }
    }
}

pub type AuthResult<T> = Result<T, AuthError>;

pub trait IdentityProvider: Send + Sync {
    fn sign_in<'a>(&'a self, email: &'a str, password: &'a str) -> BoxFuture<'a, AuthResult<User>>;
    fn sign_up<'a>(&'a self, email: &'a str, password: &'a str) -> BoxFuture<'a, AuthResult<User>>;
    fn sign_out(&self) -> BoxFuture<'_, AuthResult<()>>;
    /// Live session state, starting at [`SessionStatus::Unknown`] until the first check resolves.
    fn observe_session(&self) -> SessionWatch;
    /// Profile of a known account, used to label conversation counterparts.
    fn get_user(&self, uid: UserId) -> BoxFuture<'_, AuthResult<Option<User>>>;
    /// Exact, case-insensitive email lookup used to add a peer.
    fn lookup_user<'a>(&'a self, email: &'a str) -> BoxFuture<'a, AuthResult<Option<User>>>;
    fn search_users<'a>(
        &'a self,
        fragment: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, AuthResult<Vec<User>>>;
}
