use super::error::{InvalidParticipantsSnafu, StorageResult};
use super::ids::{MessageId, SessionTokenId, UserId};

/// Number of most recent messages a live subscription keeps in its window.
pub const DEFAULT_MESSAGE_WINDOW: usize = 50;

/// Unordered pair of distinct users taking part in one direct message.
///
/// The pair is stored in canonical order so `{a, b}` and `{b, a}` compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Participants {
    low: UserId,
    high: UserId,
}

impl Participants {
    pub fn new(first: UserId, second: UserId) -> StorageResult<Self> {
        if first == second {
            return InvalidParticipantsSnafu {
                stage: "participants-new",
                first: first.to_string(),
            }
            .fail();
        }

        let (low, high) = if first < second {
            (first, second)
        } else {
            (second, first)
        };
        Ok(Self { low, high })
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.low == user_id || self.high == user_id
    }

    /// Returns the counterpart of `user_id`, or `None` when `user_id` is not a participant.
    pub fn other(&self, user_id: UserId) -> Option<UserId> {
        if self.low == user_id {
            Some(self.high)
        } else if self.high == user_id {
            Some(self.low)
        } else {
            None
        }
    }

    pub fn low(&self) -> UserId {
        self.low
    }

    pub fn high(&self) -> UserId {
        self.high
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    pub email: String,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
    pub created_at_unix_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub email: String,
    pub display_name: Option<String>,
    pub password_hash: String,
    pub password_salt: String,
}

/// User row together with its stored password digest. Never leaves the identity layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub user: UserRecord,
    pub password_hash: String,
    pub password_salt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTokenRecord {
    pub id: SessionTokenId,
    pub user_id: UserId,
    pub created_at_unix_millis: u64,
    pub revoked_at_unix_millis: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    /// Store-wide write order, used to break ties between equal timestamps.
    pub seq: u64,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub participants: Participants,
    pub text: String,
    pub created_at_unix_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub text: String,
}

impl NewMessage {
    pub fn new(sender_id: UserId, recipient_id: UserId, text: impl Into<String>) -> Self {
        Self {
            sender_id,
            recipient_id,
            text: text.into(),
        }
    }

    pub fn participants(&self) -> StorageResult<Participants> {
        Participants::new(self.sender_id, self.recipient_id)
    }
}

/// Window over every message involving `participant`, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageQuery {
    pub participant: UserId,
    pub limit: usize,
    pub offset: usize,
}

impl MessageQuery {
    pub fn recent(participant: UserId) -> Self {
        Self {
            participant,
            limit: DEFAULT_MESSAGE_WINDOW,
            offset: 0,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// Point-in-time result of a message query.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageSet {
    /// Valid messages ordered by `created_at` descending.
    pub messages: Vec<MessageRecord>,
    /// Rows that failed validation and were left out.
    pub quarantined: usize,
}

impl MessageSet {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Published after every committed append so live queries can refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeNotice {
    pub message_id: MessageId,
    pub participants: Participants,
}
