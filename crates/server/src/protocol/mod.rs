//! Real-time wire protocol
//!
//! Socket frames are JSON text of the form `{ "event": <name>, "data": <payload> }`.

use serde::{Deserialize, Serialize};

use crate::error::MessagingError;
use crate::models::{Message, SendMessageInput};

/// Frames sent by the client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    UserConnected(IdentifyPayload),
    SendMessage(SendMessageInput),
    MarkRead(MarkReadPayload),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyPayload {
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadPayload {
    pub message_id: String,
}

/// Frames pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    ConnectionConfirmed {
        user_id: String,
        connection_id: String,
    },
    NewMessage(Message),
    #[serde(rename_all = "camelCase")]
    MessageSent {
        message_id: String,
        delivered_to: Vec<String>,
        unreachable: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    RecipientUnreachable {
        message_id: String,
        recipient_ids: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    MessageRead {
        message_id: String,
        user_id: String,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerEvent {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<&MessagingError> for ServerEvent {
    fn from(err: &MessagingError) -> Self {
        let message = match err {
            MessagingError::Storage(_) => "message could not be stored".to_string(),
            other => other.to_string(),
        };
        ServerEvent::error(err.code(), message)
    }
}
