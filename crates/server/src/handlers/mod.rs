//! HTTP and WebSocket handlers
//!
//! Both transports feed the same delivery router.

pub mod auth;
pub mod messages;
pub mod socket;

pub use crate::config::AppState;

pub use auth::{mw_require_auth, Ctx};

pub use messages::{
    get_conversation, get_unread, list_conversations, mark_read, send_group_message,
    send_message,
};

pub use socket::{ws_handler, SocketSession};
