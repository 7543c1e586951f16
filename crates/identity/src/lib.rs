mod local;
mod password;
pub mod provider;
pub mod session_file;

pub use local::{
    DEFAULT_MIN_PASSWORD_LENGTH, IdentityBackend, IdentityConfig, LocalIdentityProvider,
    SessionMonitor,
};
pub use provider::{
    AuthError, AuthErrorReason, AuthResult, IdentityProvider, SessionStatus, SessionWatch, User,
};
pub use session_file::SessionFile;
