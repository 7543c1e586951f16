use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use firechat_storage::{
    BoxFuture, NewUser, SessionTokenId, SessionTokenStore, StorageError, UserId, UserStore,
};
use snafu::ResultExt;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use super::password::{generate_salt, hash_password, normalize_email, verify_password};
use super::provider::{
    AuthError, AuthResult, BackendSnafu, IdentityProvider, InvalidCredentialsSnafu,
    InvalidEmailSnafu, SessionStatus, SessionWatch, User, WeakPasswordSnafu,
};
use super::session_file::SessionFile;

/// Firebase-compatible minimum password length.
pub const DEFAULT_MIN_PASSWORD_LENGTH: usize = 6;

/// Storage surface the local provider needs.
pub trait IdentityBackend: UserStore + SessionTokenStore {}

impl<T> IdentityBackend for T where T: UserStore + SessionTokenStore {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityConfig {
    pub min_password_length: usize,
    /// Where the session token survives restarts. `None` keeps sessions in memory only.
    pub session_file: Option<PathBuf>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            min_password_length: DEFAULT_MIN_PASSWORD_LENGTH,
            session_file: None,
        }
    }
}

impl IdentityConfig {
    pub fn with_session_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.session_file = Some(path.into());
        self
    }

    pub fn with_min_password_length(mut self, min_password_length: usize) -> Self {
        self.min_password_length = min_password_length;
        self
    }
}

/// Identity provider backed by the local user and session-token tables.
pub struct LocalIdentityProvider {
    store: Arc<dyn IdentityBackend>,
    config: IdentityConfig,
    session_file: Option<SessionFile>,
    status_tx: watch::Sender<SessionStatus>,
    current_token: Mutex<Option<SessionTokenId>>,
}

impl LocalIdentityProvider {
    pub fn new(store: Arc<dyn IdentityBackend>, config: IdentityConfig) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::Unknown);
        let session_file = config.session_file.clone().map(SessionFile::new);
        Self {
            store,
            config,
            session_file,
            status_tx,
            current_token: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }

    pub fn status(&self) -> SessionStatus {
        self.status_tx.borrow().clone()
    }

    /// First session check: resumes the persisted token if it is still valid.
    ///
    /// Always resolves the published status away from `Unknown`, even on failure.
    pub async fn restore_session(&self) -> AuthResult<Option<User>> {
        let restored = self.try_restore_session().await;
        match &restored {
            Ok(Some(user)) => {
                tracing::info!(uid = %user.uid, "restored persisted session");
                self.publish(SessionStatus::SignedIn(user.clone()));
            }
            Ok(None) => self.publish(SessionStatus::SignedOut),
            Err(error) => {
                tracing::warn!(error = %error, "session restore failed; starting signed out");
                self.publish(SessionStatus::SignedOut);
            }
        }
        restored
    }

    async fn try_restore_session(&self) -> AuthResult<Option<User>> {
        let Some(session_file) = &self.session_file else {
            return Ok(None);
        };
        let Some(token) = session_file.load()? else {
            return Ok(None);
        };

        let resolved = self
            .store
            .resolve_session_token(token)
            .await
            .context(BackendSnafu {
                stage: "restore-resolve-token",
            })?;

        match resolved {
            Some(record) => {
                *self.current_token.lock().await = Some(token);
                Ok(Some(User::from(record)))
            }
            None => {
                session_file.clear()?;
                Ok(None)
            }
        }
    }

    /// Re-validates the active token and signs out locally when it was revoked elsewhere.
    pub async fn check_session(&self) -> AuthResult<()> {
        let Some(token) = *self.current_token.lock().await else {
            return Ok(());
        };

        let resolved = self
            .store
            .resolve_session_token(token)
            .await
            .context(BackendSnafu {
                stage: "check-resolve-token",
            })?;

        if resolved.is_none() {
            tracing::info!(token = %token, "session token invalidated");
            self.clear_local_session(token).await?;
        }

        Ok(())
    }

    /// Invalidates every session of `uid`, including ones held by other application instances.
    pub async fn revoke_all_sessions(&self, uid: UserId) -> AuthResult<u64> {
        self.store
            .revoke_user_sessions(uid)
            .await
            .context(BackendSnafu {
                stage: "revoke-all-sessions",
            })
    }

    /// Starts a background task calling [`Self::check_session`] every `interval`.
    pub fn spawn_session_monitor(self: &Arc<Self>, interval: Duration) -> SessionMonitor {
        let provider = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(error) = provider.check_session().await {
                    tracing::warn!(error = %error, "session check failed");
                }
            }
        });
        SessionMonitor { task }
    }

    async fn start_session(&self, user: User) -> AuthResult<User> {
        let issued = self
            .store
            .issue_session_token(user.uid)
            .await
            .context(BackendSnafu {
                stage: "issue-session-token",
            })?;

        let previous = self.current_token.lock().await.replace(issued.id);
        if let Some(previous) = previous
            && let Err(error) = self.store.revoke_session_token(previous).await
        {
            tracing::warn!(error = %error, "failed to revoke replaced session token");
        }

        if let Some(session_file) = &self.session_file {
            session_file.store(issued.id)?;
        }

        tracing::info!(uid = %user.uid, "session started");
        self.publish(SessionStatus::SignedIn(user.clone()));
        Ok(user)
    }

    async fn clear_local_session(&self, expected: SessionTokenId) -> AuthResult<()> {
        {
            let mut current = self.current_token.lock().await;
            if *current != Some(expected) {
                return Ok(());
            }
            *current = None;
        }

        // The in-memory session is gone at this point, whatever happens to the file.
        self.publish(SessionStatus::SignedOut);
        if let Some(session_file) = &self.session_file {
            session_file.clear()?;
        }
        Ok(())
    }

    fn publish(&self, status: SessionStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn normalized_email(raw: &str, stage: &'static str) -> AuthResult<String> {
        normalize_email(raw).ok_or_else(|| {
            InvalidEmailSnafu {
                stage,
                email: raw.trim().to_string(),
            }
            .build()
        })
    }
}

impl IdentityProvider for LocalIdentityProvider {
    fn sign_in<'a>(&'a self, email: &'a str, password: &'a str) -> BoxFuture<'a, AuthResult<User>> {
        Box::pin(async move {
            let email = Self::normalized_email(email, "sign-in-email")?;
            let credentials = self
                .store
                .find_credentials_by_email(&email)
                .await
                .context(BackendSnafu {
                    stage: "sign-in-load-credentials",
                })?;

            let Some(credentials) = credentials else {
                return InvalidCredentialsSnafu {
                    stage: "sign-in-unknown-email",
                }
                .fail();
            };

            if !verify_password(
                password,
                &credentials.password_salt,
                &credentials.password_hash,
            ) {
                return InvalidCredentialsSnafu {
                    stage: "sign-in-password-mismatch",
                }
                .fail();
            }

            self.start_session(User::from(credentials.user)).await
        })
    }

    fn sign_up<'a>(&'a self, email: &'a str, password: &'a str) -> BoxFuture<'a, AuthResult<User>> {
        Box::pin(async move {
            let email = Self::normalized_email(email, "sign-up-email")?;
            if password.chars().count() < self.config.min_password_length {
                return WeakPasswordSnafu {
                    stage: "sign-up-password-length",
                    min_length: self.config.min_password_length,
                }
                .fail();
            }

            let password_salt = generate_salt();
            let created = self
                .store
                .create_user(NewUser {
                    email: email.clone(),
                    display_name: None,
                    password_hash: hash_password(password, &password_salt),
                    password_salt,
                })
                .await;

            let record = match created {
                Ok(record) => record,
                Err(StorageError::Conflict { .. }) => {
                    return Err(AuthError::EmailInUse {
                        stage: "sign-up-create-user",
                        email,
                    });
                }
                Err(source) => {
                    return Err(AuthError::Backend {
                        stage: "sign-up-create-user",
                        source,
                    });
                }
            };

            self.start_session(User::from(record)).await
        })
    }

    fn sign_out(&self) -> BoxFuture<'_, AuthResult<()>> {
        Box::pin(async move {
            let Some(token) = *self.current_token.lock().await else {
                self.publish(SessionStatus::SignedOut);
                return Ok(());
            };

            match self.store.revoke_session_token(token).await {
                Ok(()) | Err(StorageError::NotFound { .. }) => {}
                Err(source) => {
                    return Err(AuthError::Backend {
                        stage: "sign-out-revoke-token",
                        source,
                    });
                }
            }

            self.clear_local_session(token).await?;
            tracing::info!("signed out");
            Ok(())
        })
    }

    fn observe_session(&self) -> SessionWatch {
        self.status_tx.subscribe()
    }

    fn get_user(&self, uid: UserId) -> BoxFuture<'_, AuthResult<Option<User>>> {
        Box::pin(async move {
            let record = self.store.get_user(uid).await.context(BackendSnafu {
                stage: "get-user-query",
            })?;
            Ok(record.map(User::from))
        })
    }

    fn lookup_user<'a>(&'a self, email: &'a str) -> BoxFuture<'a, AuthResult<Option<User>>> {
        Box::pin(async move {
            let email = Self::normalized_email(email, "lookup-user-email")?;
            let record = self
                .store
                .find_user_by_email(&email)
                .await
                .context(BackendSnafu {
                    stage: "lookup-user-query",
                })?;
            Ok(record.map(User::from))
        })
    }

    fn search_users<'a>(
        &'a self,
        fragment: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, AuthResult<Vec<User>>> {
        Box::pin(async move {
            let fragment = fragment.trim().to_lowercase();
            if fragment.is_empty() {
                return Ok(Vec::new());
            }

            let records = self
                .store
                .search_users(&fragment, limit)
                .await
                .context(BackendSnafu {
                    stage: "search-users-query",
                })?;
            Ok(records.into_iter().map(User::from).collect())
        })
    }
}

/// Handle of the background session check; stops the task when dropped.
pub struct SessionMonitor {
    task: JoinHandle<()>,
}

impl SessionMonitor {
    /// Aborts the check task and waits until it has finished.
    pub async fn stop(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

impl Drop for SessionMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
