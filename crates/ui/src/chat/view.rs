use std::sync::Arc;
use std::time::Duration;

use firechat_identity::User;
use firechat_storage::{
    MessageId, MessageRecord, MessageSet, MessageStore, MessageSubscription, ReconnectPolicy,
    SubscriptionEvent, UserId, subscribe_messages,
};

use crate::chat::message::filter_conversation;
use crate::chat::message_input::MessageInput;
use crate::chat::send::{SendError, send_message};
use crate::chat::sidebar::PeerSidebar;
use crate::notification::NotificationList;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the first snapshot.
    Connecting,
    Online,
    Offline { retry_in: Duration },
    /// The subscription ended and will not deliver again.
    Closed,
}

/// Chat screen of the signed-in user.
///
/// Owns the live subscription; dropping the view releases it.
pub struct ConversationView {
    user: User,
    store: Arc<dyn MessageStore>,
    subscription: Option<MessageSubscription>,
    snapshot: MessageSet,
    visible: Vec<MessageRecord>,
    sidebar: PeerSidebar,
    input: MessageInput,
    connection: ConnectionState,
}

impl ConversationView {
    /// Opens the live query for `user` on the current tokio runtime.
    pub fn mount(
        user: User,
        store: Arc<dyn MessageStore>,
        window: usize,
        policy: ReconnectPolicy,
    ) -> Self {
        let subscription = subscribe_messages(Arc::clone(&store), user.uid, window, policy).spawn();
        tracing::info!(uid = %user.uid, window, "conversation view mounted");

        Self {
            sidebar: PeerSidebar::new(user.uid),
            user,
            store,
            subscription: Some(subscription),
            snapshot: MessageSet::default(),
            visible: Vec::new(),
            input: MessageInput::new(),
            connection: ConnectionState::Connecting,
        }
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn sidebar(&self) -> &PeerSidebar {
        &self.sidebar
    }

    pub fn sidebar_mut(&mut self) -> &mut PeerSidebar {
        &mut self.sidebar
    }

    pub fn input(&self) -> &MessageInput {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut MessageInput {
        &mut self.input
    }

    pub fn snapshot(&self) -> &MessageSet {
        &self.snapshot
    }

    /// Conversation with the selected peer, oldest first.
    pub fn visible_messages(&self) -> &[MessageRecord] {
        &self.visible
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription
            .as_ref()
            .is_some_and(|subscription| !subscription.is_cancelled())
    }

    /// Next subscription event. Never resolves once the subscription is gone.
    pub async fn next_event(&mut self) -> Option<SubscriptionEvent> {
        match self.subscription.as_mut() {
            Some(subscription) => subscription.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Applies one event and returns counterparts whose profiles still need resolving.
    pub fn apply_event(
        &mut self,
        event: SubscriptionEvent,
        notifications: &mut NotificationList,
    ) -> Vec<UserId> {
        match event {
            SubscriptionEvent::Snapshot(set) => {
                if set.quarantined > 0 {
                    tracing::warn!(
                        uid = %self.user.uid,
                        quarantined = set.quarantined,
                        "snapshot skipped malformed messages"
                    );
                }
                self.connection = ConnectionState::Online;
                self.snapshot = set;
                self.refresh_visible();
                self.sidebar.sync_snapshot(&self.snapshot)
            }
            SubscriptionEvent::Offline { error, retry_in } => {
                if !matches!(self.connection, ConnectionState::Offline { .. }) {
                    notifications.error(format!("Connection lost: {error}"));
                }
                self.connection = ConnectionState::Offline { retry_in };
                Vec::new()
            }
            SubscriptionEvent::Online => {
                self.connection = ConnectionState::Online;
                notifications.info("Connection restored");
                Vec::new()
            }
        }
    }

    /// Marks the subscription as ended after its worker stopped.
    pub fn subscription_closed(&mut self, notifications: &mut NotificationList) {
        if self.subscription.take().is_some() {
            tracing::warn!(uid = %self.user.uid, "message subscription ended");
            notifications.error("Live updates stopped");
        }
        self.connection = ConnectionState::Closed;
    }

    pub fn select_peer(&mut self, uid: UserId) -> bool {
        if !self.sidebar.select(uid) {
            return false;
        }
        self.refresh_visible();
        true
    }

    pub fn add_peer(&mut self, user: User) -> bool {
        let uid = user.uid;
        if !self.sidebar.add_peer(user) {
            return false;
        }
        self.select_peer(uid)
    }

    pub fn remember_profile(&mut self, user: User) {
        self.sidebar.remember(user);
    }

    /// Sends the draft to the selected peer.
    ///
    /// Returns `None` without touching the store when no peer is selected. The draft is
    /// cleared only after a successful write.
    pub async fn submit(&mut self) -> Option<Result<MessageId, SendError>> {
        let peer = self.sidebar.selected()?;
        let result = send_message(
            self.store.as_ref(),
            self.user.uid,
            peer,
            self.input.prepared(),
        )
        .await;
        if result.is_ok() {
            self.input.clear();
        }
        Some(result)
    }

    /// Stops the live subscription ahead of dropping the view.
    pub fn release(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.cancel();
            tracing::info!(uid = %self.user.uid, "conversation view released");
        }
    }

    fn refresh_visible(&mut self) {
        self.visible = match self.sidebar.selected() {
            Some(peer) => filter_conversation(&self.snapshot, self.user.uid, peer),
            None => Vec::new(),
        };
    }
}

impl Drop for ConversationView {
    fn drop(&mut self) {
        self.release();
    }
}
