use std::sync::Arc;
use std::time::Instant;

use firechat_identity::{AuthResult, IdentityProvider, SessionStatus, SessionWatch, User};
use firechat_storage::{MessageStore, StorageError, SubscriptionEvent};
use snafu::{ResultExt, Snafu};
use tokio::sync::{mpsc, watch};

use crate::auth::{AuthAction, AuthPanel};
use crate::chat::{Command, ConversationView, SendError};
use crate::notification::NotificationList;
use crate::settings::ChatSettings;

/// Maximum number of users returned by a peer search.
pub const PEER_SEARCH_LIMIT: usize = 20;

/// Top-level screen selection driven by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GateState {
    /// The provider has not finished its first session check.
    #[default]
    Loading,
    Unauthenticated,
    Authenticated(User),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateEffect {
    MountAuth,
    MountConversation(User),
}

#[derive(Debug, Default)]
pub struct SessionGate {
    state: GateState,
}

impl SessionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &GateState {
        &self.state
    }

    /// Applies one observed session status and returns the screen to mount, if any.
    pub fn apply(&mut self, change: &SessionStatus) -> Option<GateEffect> {
        match change {
            SessionStatus::Unknown => None,
            SessionStatus::SignedOut => {
                if self.state == GateState::Unauthenticated {
                    return None;
                }
                self.state = GateState::Unauthenticated;
                Some(GateEffect::MountAuth)
            }
            SessionStatus::SignedIn(user) => {
                if let GateState::Authenticated(current) = &mut self.state
                    && current.uid == user.uid
                {
                    // Profile refresh of the same account keeps the mounted view.
                    *current = user.clone();
                    return None;
                }
                self.state = GateState::Authenticated(user.clone());
                Some(GateEffect::MountConversation(user.clone()))
            }
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AppError {
    #[snafu(display("failed to open message store on `{stage}`: {source}"))]
    OpenStore {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("identity provider dropped its session feed on `{stage}`: {source}"))]
    SessionFeedClosed {
        stage: &'static str,
        source: watch::error::RecvError,
    },
    #[snafu(display("terminal i/o failed on `{stage}`: {source}"))]
    Terminal {
        stage: &'static str,
        source: std::io::Error,
    },
}

/// Receives a fresh view of the application after every handled event.
pub trait Frontend {
    fn render(&mut self, app: &ChatApp);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Quit,
}

struct AuthOutcome {
    action: AuthAction,
    result: AuthResult<User>,
}

/// Application state plus the event loop that mutates it.
pub struct ChatApp {
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn MessageStore>,
    settings: Arc<ChatSettings>,
    session: SessionWatch,
    gate: SessionGate,
    auth: AuthPanel,
    conversation: Option<ConversationView>,
    notifications: NotificationList,
    auth_results_tx: mpsc::UnboundedSender<AuthOutcome>,
    auth_results: mpsc::UnboundedReceiver<AuthOutcome>,
}

impl ChatApp {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn MessageStore>,
        settings: Arc<ChatSettings>,
    ) -> Self {
        let session = provider.observe_session();
        let (auth_results_tx, auth_results) = mpsc::unbounded_channel();
        let mut app = Self {
            provider,
            store,
            notifications: NotificationList::new(settings.notification_ttl()),
            settings,
            session,
            gate: SessionGate::new(),
            auth: AuthPanel::new(),
            conversation: None,
            auth_results_tx,
            auth_results,
        };
        app.sync_session();
        app
    }

    pub fn gate(&self) -> &GateState {
        self.gate.state()
    }

    pub fn auth(&self) -> &AuthPanel {
        &self.auth
    }

    pub fn conversation(&self) -> Option<&ConversationView> {
        self.conversation.as_ref()
    }

    pub fn notifications(&self) -> &NotificationList {
        &self.notifications
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    /// Runs until `Quit` or until the command channel closes.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        frontend: &mut dyn Frontend,
    ) -> Result<(), AppError> {
        frontend.render(&self);
        loop {
            match self.step(&mut commands).await? {
                Step::Continue => frontend.render(&self),
                Step::Quit => break,
            }
        }

        if let Some(mut view) = self.conversation.take() {
            view.release();
        }
        tracing::info!("application loop finished");
        Ok(())
    }

    /// Waits for and handles exactly one event.
    pub async fn step(
        &mut self,
        commands: &mut mpsc::Receiver<Command>,
    ) -> Result<Step, AppError> {
        let deadline = self.notifications.next_deadline();

        tokio::select! {
            changed = self.session.changed() => {
                changed.context(SessionFeedClosedSnafu {
                    stage: "session-watch-changed",
                })?;
                self.sync_session();
            }
            event = next_view_event(&mut self.conversation) => {
                self.handle_subscription_event(event).await;
            }
            Some(outcome) = self.auth_results.recv() => {
                self.auth.finish(outcome.action, &outcome.result, &mut self.notifications);
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    tracing::info!("command channel closed");
                    return Ok(Step::Quit);
                };
                return Ok(self.handle_command(command).await);
            }
            _ = sleep_until(deadline) => {
                self.notifications.expire(Instant::now());
            }
        }

        Ok(Step::Continue)
    }

    fn sync_session(&mut self) {
        let status = self.session.borrow_and_update().clone();
        if let Some(effect) = self.gate.apply(&status) {
            self.mount(effect);
        }
    }

    fn mount(&mut self, effect: GateEffect) {
        if let Some(mut view) = self.conversation.take() {
            view.release();
        }

        match effect {
            GateEffect::MountAuth => {
                self.auth.reset();
                tracing::info!("auth screen mounted");
            }
            GateEffect::MountConversation(user) => {
                self.conversation = Some(ConversationView::mount(
                    user,
                    Arc::clone(&self.store),
                    self.settings.message_window,
                    self.settings.reconnect_policy(),
                ));
            }
        }
    }

    async fn handle_subscription_event(&mut self, event: Option<SubscriptionEvent>) {
        let Some(view) = self.conversation.as_mut() else {
            return;
        };

        let Some(event) = event else {
            view.subscription_closed(&mut self.notifications);
            return;
        };

        let unresolved = view.apply_event(event, &mut self.notifications);
        for uid in unresolved {
            match self.provider.get_user(uid).await {
                Ok(Some(user)) => view.remember_profile(user),
                Ok(None) => tracing::debug!(uid = %uid, "counterpart has no profile"),
                Err(error) => {
                    tracing::warn!(uid = %uid, error = %error, "failed to resolve counterpart")
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> Step {
        tracing::debug!(?command, "handling command");
        match command {
            Command::Login { email, password } => {
                self.submit_auth(AuthAction::Login, &email, &password)
            }
            Command::SignUp { email, password } => {
                self.submit_auth(AuthAction::SignUp, &email, &password)
            }
            Command::SwitchTab(tab) => self.auth.set_tab(tab),
            Command::TogglePasswordVisibility => {
                self.auth.toggle_password_visibility();
            }
            Command::SignOut => self.sign_out().await,
            Command::AddPeer { email } => self.add_peer(&email).await,
            Command::SearchUsers { fragment } => self.search_users(&fragment).await,
            Command::SelectPeer { email } => self.select_peer(&email),
            Command::Send { text } => self.send(text).await,
            Command::Dismiss(id) => {
                self.notifications.dismiss(id);
            }
            Command::Quit => return Step::Quit,
        }
        Step::Continue
    }

    fn submit_auth(&mut self, action: AuthAction, email: &str, password: &str) {
        match self.gate.state() {
            GateState::Unauthenticated => {}
            GateState::Loading => {
                self.notifications.info("Checking session, try again in a moment");
                return;
            }
            GateState::Authenticated(_) => {
                self.notifications.info("Already signed in");
                return;
            }
        }

        let request = match action {
            AuthAction::Login => self.auth.login(email, password),
            AuthAction::SignUp => self.auth.signup(email, password),
        };
        let Some(request) = request else {
            return;
        };

        let provider = Arc::clone(&self.provider);
        let results = self.auth_results_tx.clone();
        tokio::spawn(async move {
            let result = request.execute(provider.as_ref()).await;
            let _ = results.send(AuthOutcome {
                action: request.action,
                result,
            });
        });
    }

    async fn sign_out(&mut self) {
        if self.conversation.is_none() {
            return;
        }

        match self.provider.sign_out().await {
            Ok(()) => {
                self.sync_session();
                self.notifications.info("Signed out");
            }
            Err(error) => {
                self.notifications.error(error.to_string());
            }
        }
    }

    async fn add_peer(&mut self, email: &str) {
        let Some(view) = self.conversation.as_mut() else {
            self.notifications.error("Sign in to add peers");
            return;
        };

        match self.provider.lookup_user(email).await {
            Ok(Some(user)) => {
                let label = user.label().to_string();
                if view.add_peer(user) {
                    self.notifications.success(format!("Chatting with {label}"));
                } else {
                    self.notifications.error("You cannot start a conversation with yourself");
                }
            }
            Ok(None) => {
                self.notifications
                    .error(format!("No user registered with {}", email.trim()));
            }
            Err(error) => {
                self.notifications.error(error.to_string());
            }
        }
    }

    async fn search_users(&mut self, fragment: &str) {
        let Some(view) = self.conversation.as_mut() else {
            self.notifications.error("Sign in to search users");
            return;
        };

        match self.provider.search_users(fragment, PEER_SEARCH_LIMIT).await {
            Ok(users) => {
                if users.is_empty() {
                    self.notifications
                        .info(format!("No users match '{}'", fragment.trim()));
                }
                view.sidebar_mut().set_search_results(users);
            }
            Err(error) => {
                self.notifications.error(error.to_string());
            }
        }
    }

    fn select_peer(&mut self, email: &str) {
        let Some(view) = self.conversation.as_mut() else {
            self.notifications.error("Sign in to select a peer");
            return;
        };

        if let Some(uid) = view.sidebar().find_by_email(email) {
            view.select_peer(uid);
            return;
        }

        let from_search = view
            .sidebar()
            .search_results()
            .iter()
            .find(|user| user.email.eq_ignore_ascii_case(email.trim()))
            .cloned();
        match from_search {
            Some(user) => {
                view.add_peer(user);
            }
            None => {
                self.notifications
                    .error(format!("'{}' is not in your peer list", email.trim()));
            }
        }
    }

    async fn send(&mut self, text: String) {
        let Some(view) = self.conversation.as_mut() else {
            return;
        };

        view.input_mut().set_draft(text);
        match view.submit().await {
            None => tracing::debug!("send ignored without a selected peer"),
            Some(Ok(_)) => {}
            Some(Err(SendError::EmptyText { .. })) => {}
            Some(Err(error)) => {
                self.notifications.error(error.to_string());
            }
        }
    }
}

async fn next_view_event(view: &mut Option<ConversationView>) -> Option<SubscriptionEvent> {
    match view {
        Some(view) => view.next_event().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use firechat_storage::UserId;

    use super::*;

    fn user(email: &str) -> User {
        User {
            uid: UserId::new_v7(),
            email: email.to_string(),
            display_name: None,
            photo_url: None,
        }
    }

    #[test]
    fn loading_waits_for_the_first_check() {
        let mut gate = SessionGate::new();
        assert_eq!(gate.apply(&SessionStatus::Unknown), None);
        assert_eq!(gate.state(), &GateState::Loading);

        assert_eq!(
            gate.apply(&SessionStatus::SignedOut),
            Some(GateEffect::MountAuth)
        );
        assert_eq!(gate.state(), &GateState::Unauthenticated);
    }

    #[test]
    fn loading_can_resolve_straight_to_authenticated() {
        let alice = user("alice@x.com");
        let mut gate = SessionGate::new();
        assert_eq!(
            gate.apply(&SessionStatus::SignedIn(alice.clone())),
            Some(GateEffect::MountConversation(alice.clone()))
        );
        assert_eq!(gate.state(), &GateState::Authenticated(alice));
    }

    #[test]
    fn repeated_observations_are_no_ops() {
        let alice = user("alice@x.com");
        let mut gate = SessionGate::new();
        gate.apply(&SessionStatus::SignedOut);
        assert_eq!(gate.apply(&SessionStatus::SignedOut), None);

        gate.apply(&SessionStatus::SignedIn(alice.clone()));
        let renamed = User {
            display_name: Some("Alice".to_string()),
            ..alice.clone()
        };
        assert_eq!(gate.apply(&SessionStatus::SignedIn(renamed.clone())), None);
        assert_eq!(gate.state(), &GateState::Authenticated(renamed));
    }

    #[test]
    fn switching_accounts_remounts_and_sign_out_returns_to_auth() {
        let (alice, bob) = (user("alice@x.com"), user("bob@x.com"));
        let mut gate = SessionGate::new();
        gate.apply(&SessionStatus::SignedIn(alice));

        assert_eq!(
            gate.apply(&SessionStatus::SignedIn(bob.clone())),
            Some(GateEffect::MountConversation(bob))
        );
        assert_eq!(
            gate.apply(&SessionStatus::SignedOut),
            Some(GateEffect::MountAuth)
        );
        assert_eq!(gate.state(), &GateState::Unauthenticated);
    }
}
