use crate::auth::AuthTab;
use crate::notification::NotificationId;

/// User intent forwarded from the front end to the application loop.
#[derive(Clone, PartialEq, Eq)]
pub enum Command {
    Login { email: String, password: String },
    SignUp { email: String, password: String },
    SwitchTab(AuthTab),
    TogglePasswordVisibility,
    SignOut,
    /// Adds a peer by exact email and selects it.
    AddPeer { email: String },
    SearchUsers { fragment: String },
    /// Selects a listed peer by email.
    SelectPeer { email: String },
    /// Replaces the draft and sends it to the selected peer.
    Send { text: String },
    Dismiss(NotificationId),
    Quit,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Login { email, .. } => f
                .debug_struct("Login")
                .field("email", email)
                .finish_non_exhaustive(),
            Self::SignUp { email, .. } => f
                .debug_struct("SignUp")
                .field("email", email)
                .finish_non_exhaustive(),
            Self::SwitchTab(tab) => f.debug_tuple("SwitchTab").field(tab).finish(),
            Self::TogglePasswordVisibility => f.write_str("TogglePasswordVisibility"),
            Self::SignOut => f.write_str("SignOut"),
            Self::AddPeer { email } => f.debug_struct("AddPeer").field("email", email).finish(),
            Self::SearchUsers { fragment } => {
                f.debug_struct("SearchUsers").field("fragment", fragment).finish()
            }
            Self::SelectPeer { email } => {
                f.debug_struct("SelectPeer").field("email", email).finish()
            }
            Self::Send { text } => f.debug_struct("Send").field("len", &text.len()).finish(),
            Self::Dismiss(id) => f.debug_tuple("Dismiss").field(id).finish(),
            Self::Quit => f.write_str("Quit"),
        }
    }
}
