use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotificationId(pub u64);

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: NotificationId,
    pub kind: NotificationKind,
    pub message: String,
    pub expires_at: Instant,
}

/// Transient toasts, oldest first.
#[derive(Debug)]
pub struct NotificationList {
    items: VecDeque<Notification>,
    ttl: Duration,
    next_id: u64,
}

impl NotificationList {
    pub fn new(ttl: Duration) -> Self {
        Self {
            items: VecDeque::new(),
            ttl,
            next_id: 1,
        }
    }

    pub fn push(&mut self, kind: NotificationKind, message: impl Into<String>) -> NotificationId {
        self.push_at(kind, message, Instant::now())
    }

    pub fn push_at(
        &mut self,
        kind: NotificationKind,
        message: impl Into<String>,
        now: Instant,
    ) -> NotificationId {
        let id = NotificationId(self.next_id);
        self.next_id += 1;
        self.items.push_back(Notification {
            id,
            kind,
            message: message.into(),
            expires_at: now + self.ttl,
        });
        id
    }

    pub fn info(&mut self, message: impl Into<String>) -> NotificationId {
        self.push(NotificationKind::Info, message)
    }

    pub fn success(&mut self, message: impl Into<String>) -> NotificationId {
        self.push(NotificationKind::Success, message)
    }

    pub fn error(&mut self, message: impl Into<String>) -> NotificationId {
        self.push(NotificationKind::Error, message)
    }

    /// Returns false when `id` was already gone.
    pub fn dismiss(&mut self, id: NotificationId) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.id != id);
        self.items.len() != before
    }

    /// Drops every notification whose deadline is at or before `now`, returning how many expired.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.items.len();
        self.items.retain(|item| item.expires_at > now);
        before - self.items.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.items.iter().map(|item| item.expires_at).min()
    }

    pub fn items(&self) -> impl Iterator<Item = &Notification> {
        self.items.iter()
    }

    pub fn latest(&self) -> Option<&Notification> {
        self.items.back()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
