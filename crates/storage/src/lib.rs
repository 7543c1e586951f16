pub mod error;
pub mod ids;
pub mod live;
pub mod sqlite;
pub mod types;

use std::future::Future;
use std::pin::Pin;

use tokio::sync::broadcast;

pub use error::{StorageError, StorageResult};
pub use ids::{MessageId, SessionTokenId, UserId};
pub use live::{
    MessageSubscription, ReconnectPolicy, SubscriptionError, SubscriptionEvent,
    SubscriptionHandle, SubscriptionWorker, subscribe_messages,
};
pub use sqlite::SqliteStorage;
pub use types::{
    ChangeNotice, CredentialRecord, DEFAULT_MESSAGE_WINDOW, MessageQuery, MessageRecord,
    MessageSet, NewMessage, NewUser, Participants, SessionTokenRecord, UserRecord,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait UserStore: Send + Sync {
    fn create_user(&self, input: NewUser) -> BoxFuture<'_, StorageResult<UserRecord>>;
    fn get_user(&self, user_id: UserId) -> BoxFuture<'_, StorageResult<Option<UserRecord>>>;
    fn find_user_by_email<'a>(
        &'a self,
        email: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<UserRecord>>>;
    fn find_credentials_by_email<'a>(
        &'a self,
        email: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<CredentialRecord>>>;
    fn search_users<'a>(
        &'a self,
        fragment: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, StorageResult<Vec<UserRecord>>>;
}

pub trait SessionTokenStore: Send + Sync {
    fn issue_session_token(
        &self,
        user_id: UserId,
    ) -> BoxFuture<'_, StorageResult<SessionTokenRecord>>;
    /// Resolves a token to its user when the token exists and is not revoked.
    fn resolve_session_token(
        &self,
        token: SessionTokenId,
    ) -> BoxFuture<'_, StorageResult<Option<UserRecord>>>;
    fn revoke_session_token(&self, token: SessionTokenId) -> BoxFuture<'_, StorageResult<()>>;
    /// Revokes every live token of `user_id` and returns how many were revoked.
    fn revoke_user_sessions(&self, user_id: UserId) -> BoxFuture<'_, StorageResult<u64>>;
}

pub trait MessageStore: Send + Sync {
    fn append_message(&self, input: NewMessage) -> BoxFuture<'_, StorageResult<MessageRecord>>;
    fn query_messages(&self, query: MessageQuery) -> BoxFuture<'_, StorageResult<MessageSet>>;
    fn get_message(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<Option<MessageRecord>>>;
    /// Change feed carrying one notice per committed append.
    fn watch_changes(&self) -> broadcast::Receiver<ChangeNotice>;
}

pub trait Storage: UserStore + SessionTokenStore + MessageStore {}

impl<T> Storage for T where T: UserStore + SessionTokenStore + MessageStore {}
