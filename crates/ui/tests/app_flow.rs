use std::sync::Arc;
use std::time::Duration;

use firechat_identity::{IdentityConfig, IdentityProvider, LocalIdentityProvider, User};
use firechat_storage::{
    BoxFuture, ChangeNotice, MessageId, MessageQuery, MessageRecord, MessageSet, MessageStore,
    NewMessage, Participants, SqliteStorage, StorageError, StorageResult,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use ui::app::{ChatApp, GateState};
use ui::chat::{Command, filter_conversation};
use ui::notification::NotificationKind;
use ui::settings::ChatSettings;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    store: Arc<SqliteStorage>,
    provider: Arc<LocalIdentityProvider>,
    app: ChatApp,
    commands_tx: mpsc::Sender<Command>,
    commands: mpsc::Receiver<Command>,
    _dir: tempfile::TempDir,
}

/// Message store whose appends always fail; reads go to the real store.
struct ReadOnlyStore {
    inner: Arc<SqliteStorage>,
}

impl MessageStore for ReadOnlyStore {
    fn append_message(&self, _input: NewMessage) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async {
            Err(StorageError::InvariantViolation {
                stage: "read-only-store-append",
                details: "store is read only".to_string(),
            })
        })
    }

    fn query_messages(&self, query: MessageQuery) -> BoxFuture<'_, StorageResult<MessageSet>> {
        self.inner.query_messages(query)
    }

    fn get_message(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<Option<MessageRecord>>> {
        self.inner.get_message(message_id)
    }

    fn watch_changes(&self) -> broadcast::Receiver<ChangeNotice> {
        self.inner.watch_changes()
    }
}

impl Harness {
    async fn new() -> Self {
        Self::with_message_store(|store| store as Arc<dyn MessageStore>).await
    }

    /// Builds the app on `messages(store)` while identity keeps using the sqlite store.
    async fn with_message_store(
        messages: impl FnOnce(Arc<SqliteStorage>) -> Arc<dyn MessageStore>,
    ) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.db");
        let store = Arc::new(
            SqliteStorage::open(&path.display().to_string())
                .await
                .expect("open sqlite storage"),
        );
        let provider = Arc::new(LocalIdentityProvider::new(
            store.clone(),
            IdentityConfig::default(),
        ));
        let app = ChatApp::new(
            provider.clone(),
            messages(store.clone()),
            Arc::new(ChatSettings::default()),
        );
        let (commands_tx, commands) = mpsc::channel(16);

        Self {
            store,
            provider,
            app,
            commands_tx,
            commands,
            _dir: dir,
        }
    }

    /// A second account on the same store, signed in through its own provider.
    async fn register_peer(&self, email: &str) -> User {
        LocalIdentityProvider::new(self.store.clone(), IdentityConfig::default())
            .sign_up(email, "123456")
            .await
            .expect("register peer")
    }

    async fn send(&mut self, command: Command) {
        self.commands_tx.send(command).await.expect("send command");
    }

    async fn step_until(&mut self, mut done: impl FnMut(&ChatApp) -> bool) {
        let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
        while !done(&self.app) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            timeout(remaining, self.app.step(&mut self.commands))
                .await
                .expect("condition reached before timeout")
                .expect("step");
        }
    }

    /// Steps for `window`, tolerating idleness.
    async fn drain_for(&mut self, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return;
            }
            if timeout(remaining, self.app.step(&mut self.commands))
                .await
                .is_err()
            {
                return;
            }
        }
    }

    async fn sign_up(&mut self, email: &str) -> User {
        self.provider
            .restore_session()
            .await
            .expect("restore session");
        self.step_until(|app| *app.gate() == GateState::Unauthenticated)
            .await;

        self.send(Command::SignUp {
            email: email.to_string(),
            password: "123456".to_string(),
        })
        .await;
        self.step_until(|app| matches!(app.gate(), GateState::Authenticated(_)))
            .await;
        match self.app.gate() {
            GateState::Authenticated(user) => user.clone(),
            other => panic!("expected authenticated gate, got {other:?}"),
        }
    }

    async fn open_conversation_with(&mut self, email: &str) {
        self.send(Command::AddPeer {
            email: email.to_string(),
        })
        .await;
        self.step_until(|app| {
            app.conversation()
                .is_some_and(|view| view.sidebar().selected().is_some())
        })
        .await;
    }
}

fn visible_texts(app: &ChatApp) -> Vec<String> {
    app.conversation()
        .map(|view| {
            view.visible_messages()
                .iter()
                .map(|message| message.text.clone())
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn gate_starts_loading_then_mounts_auth_then_chat() {
    let mut harness = Harness::new().await;
    assert_eq!(*harness.app.gate(), GateState::Loading);
    assert!(harness.app.conversation().is_none());

    let user = harness.sign_up("alice@x.com").await;
    assert_eq!(user.email, "alice@x.com");
    assert!(harness.app.conversation().is_some());

    harness
        .step_until(|app| {
            app.notifications()
                .items()
                .any(|item| item.kind == NotificationKind::Success)
        })
        .await;
    assert!(!harness.app.auth().is_busy());
}

#[tokio::test]
async fn sent_message_appears_in_both_conversations() {
    let mut harness = Harness::new().await;
    let bob = harness.register_peer("bob@x.com").await;
    let alice = harness.sign_up("alice@x.com").await;
    harness.open_conversation_with("bob@x.com").await;

    harness
        .send(Command::Send {
            text: "hi".to_string(),
        })
        .await;
    harness
        .step_until(|app| visible_texts(app) == vec!["hi".to_string()])
        .await;

    let bob_view = harness
        .store
        .query_messages(MessageQuery::recent(bob.uid))
        .await
        .expect("query bob");
    let bob_conversation = filter_conversation(&bob_view, bob.uid, alice.uid);
    assert_eq!(bob_conversation.len(), 1);
    let message = &bob_conversation[0];
    assert_eq!(message.sender_id, alice.uid);
    assert_eq!(message.recipient_id, bob.uid);
    assert_eq!(
        message.participants,
        Participants::new(alice.uid, bob.uid).expect("pair")
    );
    assert_eq!(message.text, "hi");
}

#[tokio::test]
async fn incoming_messages_render_in_order_and_label_the_sender() {
    let mut harness = Harness::new().await;
    let bob = harness.register_peer("bob@x.com").await;
    let alice = harness.sign_up("alice@x.com").await;

    for text in ["one", "two", "three"] {
        harness
            .store
            .append_message(NewMessage::new(bob.uid, alice.uid, text))
            .await
            .expect("append");
    }

    harness
        .step_until(|app| {
            app.conversation().is_some_and(|view| {
                view.snapshot().len() == 3
                    && view
                        .sidebar()
                        .peers()
                        .iter()
                        .any(|entry| entry.user.is_some())
            })
        })
        .await;

    harness
        .send(Command::SelectPeer {
            email: "BOB@x.com".to_string(),
        })
        .await;
    harness
        .step_until(|app| visible_texts(app).len() == 3)
        .await;
    assert_eq!(visible_texts(&harness.app), vec!["one", "two", "three"]);
}

#[tokio::test]
async fn blank_or_unaddressed_sends_never_write() {
    let mut harness = Harness::new().await;
    let bob = harness.register_peer("bob@x.com").await;
    harness.sign_up("alice@x.com").await;

    harness
        .send(Command::Send {
            text: "nobody selected".to_string(),
        })
        .await;
    harness.drain_for(Duration::from_millis(100)).await;

    harness.open_conversation_with("bob@x.com").await;
    harness
        .send(Command::Send {
            text: "   \t ".to_string(),
        })
        .await;
    harness.drain_for(Duration::from_millis(100)).await;

    let stored = harness
        .store
        .query_messages(MessageQuery::recent(bob.uid))
        .await
        .expect("query");
    assert!(stored.is_empty());
    assert!(
        harness
            .app
            .notifications()
            .items()
            .all(|item| item.kind != NotificationKind::Error)
    );
}

#[tokio::test]
async fn wrong_password_keeps_gate_unauthenticated() {
    let mut harness = Harness::new().await;
    harness.register_peer("alice@x.com").await;
    harness
        .provider
        .restore_session()
        .await
        .expect("restore session");
    harness
        .step_until(|app| *app.gate() == GateState::Unauthenticated)
        .await;

    harness
        .send(Command::Login {
            email: "alice@x.com".to_string(),
            password: "not-it".to_string(),
        })
        .await;
    harness
        .step_until(|app| {
            !app.auth().is_busy()
                && app
                    .notifications()
                    .items()
                    .any(|item| item.kind == NotificationKind::Error)
        })
        .await;

    assert_eq!(*harness.app.gate(), GateState::Unauthenticated);
    assert!(harness.app.conversation().is_none());
}

#[tokio::test]
async fn sign_out_unmounts_the_conversation() {
    let mut harness = Harness::new().await;
    let bob = harness.register_peer("bob@x.com").await;
    let alice = harness.sign_up("alice@x.com").await;
    harness
        .step_until(|app| app.conversation().is_some_and(|view| view.is_subscribed()))
        .await;

    harness.send(Command::SignOut).await;
    harness
        .step_until(|app| *app.gate() == GateState::Unauthenticated)
        .await;
    assert!(harness.app.conversation().is_none());

    harness
        .store
        .append_message(NewMessage::new(bob.uid, alice.uid, "after sign out"))
        .await
        .expect("append");
    harness.drain_for(Duration::from_millis(200)).await;

    assert_eq!(*harness.app.gate(), GateState::Unauthenticated);
    assert!(harness.app.conversation().is_none());
}

#[tokio::test]
async fn adding_unknown_or_own_email_is_reported() {
    let mut harness = Harness::new().await;
    harness.sign_up("alice@x.com").await;

    for email in ["ghost@x.com", "alice@x.com"] {
        let errors_before = harness
            .app
            .notifications()
            .items()
            .filter(|item| item.kind == NotificationKind::Error)
            .count();
        harness
            .send(Command::AddPeer {
                email: email.to_string(),
            })
            .await;
        harness
            .step_until(|app| {
                app.notifications()
                    .items()
                    .filter(|item| item.kind == NotificationKind::Error)
                    .count()
                    > errors_before
            })
            .await;
    }

    let view = harness.app.conversation().expect("conversation mounted");
    assert!(view.sidebar().peers().is_empty());
    assert_eq!(view.sidebar().selected(), None);
}

#[tokio::test]
async fn repeated_sends_are_stored_as_separate_messages() {
    let mut harness = Harness::new().await;
    let bob = harness.register_peer("bob@x.com").await;
    let alice = harness.sign_up("alice@x.com").await;
    harness.open_conversation_with("bob@x.com").await;

    for _ in 0..2 {
        harness
            .send(Command::Send {
                text: "same".to_string(),
            })
            .await;
    }
    harness
        .step_until(|app| visible_texts(app) == vec!["same".to_string(), "same".to_string()])
        .await;

    let stored = harness
        .store
        .query_messages(MessageQuery::recent(bob.uid))
        .await
        .expect("query");
    let conversation = filter_conversation(&stored, bob.uid, alice.uid);
    assert_eq!(conversation.len(), 2);
    assert_ne!(conversation[0].id, conversation[1].id);
}

#[tokio::test]
async fn failed_write_keeps_the_draft_and_reports_an_error() {
    let mut harness =
        Harness::with_message_store(|store| Arc::new(ReadOnlyStore { inner: store })).await;
    harness.register_peer("bob@x.com").await;
    harness.sign_up("alice@x.com").await;
    harness.open_conversation_with("bob@x.com").await;

    harness
        .send(Command::Send {
            text: "lost?".to_string(),
        })
        .await;
    harness
        .step_until(|app| {
            app.notifications()
                .items()
                .any(|item| item.kind == NotificationKind::Error)
        })
        .await;

    let view = harness.app.conversation().expect("conversation mounted");
    assert_eq!(view.input().draft(), "lost?");
    assert!(view.visible_messages().is_empty());
}

#[tokio::test]
async fn login_while_checking_session_asks_to_wait() {
    let mut harness = Harness::new().await;
    assert_eq!(*harness.app.gate(), GateState::Loading);

    harness
        .send(Command::Login {
            email: "alice@x.com".to_string(),
            password: "123456".to_string(),
        })
        .await;
    harness
        .step_until(|app| {
            app.notifications()
                .items()
                .any(|item| item.message.starts_with("Checking session"))
        })
        .await;

    assert_eq!(*harness.app.gate(), GateState::Loading);
    assert!(!harness.app.auth().is_busy());
}
