/// Commands the front end sends into the application loop.
pub mod events;
/// Pure conversation filtering over snapshots.
pub mod message;
pub mod message_input;
pub mod send;
pub mod sidebar;
pub mod view;

pub use events::Command;
pub use message::{Direction, counterparts, direction, filter_conversation};
pub use message_input::MessageInput;
pub use send::{SendError, send_message};
pub use sidebar::{PeerEntry, PeerSidebar};
pub use view::{ConnectionState, ConversationView};
