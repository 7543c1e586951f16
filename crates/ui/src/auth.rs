use firechat_identity::{AuthResult, IdentityProvider, User};

use crate::notification::NotificationList;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AuthTab {
    #[default]
    Login,
    SignUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthAction {
    Login,
    SignUp,
}

impl AuthAction {
    fn tab(self) -> AuthTab {
        match self {
            Self::Login => AuthTab::Login,
            Self::SignUp => AuthTab::SignUp,
        }
    }
}

/// One credential submission, detached from the panel so it can run off the event loop.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub action: AuthAction,
    pub email: String,
    password: String,
}

impl std::fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRequest")
            .field("action", &self.action)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

impl AuthRequest {
    pub async fn execute(&self, provider: &dyn IdentityProvider) -> AuthResult<User> {
        match self.action {
            AuthAction::Login => provider.sign_in(&self.email, &self.password).await,
            AuthAction::SignUp => provider.sign_up(&self.email, &self.password).await,
        }
    }
}

/// Form state of the login/signup screen.
///
/// Success is not applied here: the session gate observes it through the provider.
#[derive(Debug, Default)]
pub struct AuthPanel {
    tab: AuthTab,
    email: String,
    busy: bool,
    show_password: bool,
}

impl AuthPanel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tab(&self) -> AuthTab {
        self.tab
    }

    pub fn set_tab(&mut self, tab: AuthTab) {
        self.tab = tab;
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn show_password(&self) -> bool {
        self.show_password
    }

    pub fn toggle_password_visibility(&mut self) -> bool {
        self.show_password = !self.show_password;
        self.show_password
    }

    pub fn login(&mut self, email: &str, password: &str) -> Option<AuthRequest> {
        self.begin(AuthAction::Login, email, password)
    }

    pub fn signup(&mut self, email: &str, password: &str) -> Option<AuthRequest> {
        self.begin(AuthAction::SignUp, email, password)
    }

    /// Returns `None` while a previous submission is still in flight.
    fn begin(&mut self, action: AuthAction, email: &str, password: &str) -> Option<AuthRequest> {
        if self.busy {
            tracing::debug!(?action, "ignoring auth submit while busy");
            return None;
        }

        self.busy = true;
        self.tab = action.tab();
        self.email = email.trim().to_string();
        Some(AuthRequest {
            action,
            email: self.email.clone(),
            password: password.to_string(),
        })
    }

    pub fn finish(
        &mut self,
        action: AuthAction,
        result: &AuthResult<User>,
        notifications: &mut NotificationList,
    ) {
        self.busy = false;
        match result {
            Ok(user) => {
                let verb = match action {
                    AuthAction::Login => "Signed in",
                    AuthAction::SignUp => "Account created",
                };
                notifications.success(format!("{verb} as {}", user.email));
            }
            Err(error) => {
                tracing::info!(?action, reason = ?error.reason(), "auth attempt rejected");
                notifications.error(error.to_string());
            }
        }
    }

    /// Forgets the form, as when the panel is unmounted.
    pub fn reset(&mut self) {
        *self = Self {
            tab: self.tab,
            ..Self::default()
        };
    }
}
