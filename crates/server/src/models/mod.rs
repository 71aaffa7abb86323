use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MessagingError, Result};

/// A stored message, one-to-one or group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender: String,
    /// Ordered, non-empty, never contains `sender`.
    pub recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Media>,
    pub is_group_message: bool,
    pub created_at: DateTime<Utc>,
    /// Append-only, unique by user. The sender is added at creation.
    pub read_by: Vec<ReadReceipt>,
}

impl Message {
    pub fn has_recipient(&self, user_id: &str) -> bool {
        self.recipients.iter().any(|r| r == user_id)
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.sender == user_id || self.has_recipient(user_id)
    }

    /// True when one of `a`/`b` sent the message and the other received it.
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.sender == a && self.has_recipient(b)) || (self.sender == b && self.has_recipient(a))
    }

    pub fn is_read_by(&self, user_id: &str) -> bool {
        self.read_by.iter().any(|r| r.user_id == user_id)
    }

    /// Records a read receipt. Returns `false` if the user had already read it.
    pub fn mark_read(&mut self, user_id: &str, at: DateTime<Utc>) -> bool {
        if self.is_read_by(user_id) {
            return false;
        }
        self.read_by.push(ReadReceipt {
            user_id: user_id.to_string(),
            read_at: at,
        });
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub user_id: String,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    pub url: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

/// Input to `MessageStore::create`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender: String,
    pub recipients: Vec<String>,
    pub content: Option<String>,
    pub media: Option<Media>,
    pub is_group: bool,
}

/// Display fields resolved through the user directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Per-peer summary derived from the message history. Never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub peer_id: String,
    pub participant: Option<UserProfile>,
    pub last_message: LastMessage,
    pub unread_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub message_id: String,
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sender_id: String,
}

impl From<&Message> for LastMessage {
    fn from(message: &Message) -> Self {
        Self {
            message_id: message.id.clone(),
            content: message.content.clone(),
            created_at: message.created_at,
            sender_id: message.sender.clone(),
        }
    }
}

/// Who a send is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    Direct(String),
    Group(Vec<String>),
}

impl Recipients {
    pub fn is_group(&self) -> bool {
        matches!(self, Recipients::Group(_))
    }

    pub fn into_vec(self) -> Vec<String> {
        match self {
            Recipients::Direct(id) => vec![id],
            Recipients::Group(ids) => ids,
        }
    }
}

/// A validated send, shared by the REST and socket adapters.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub recipients: Recipients,
    pub content: Option<String>,
    pub media: Option<Media>,
}

/// Send payload as it arrives over HTTP or the socket.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageInput {
    pub recipient_id: Option<String>,
    pub recipient_ids: Option<Vec<String>>,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub media_type: Option<MediaKind>,
}

impl SendMessageInput {
    /// Picks direct or group addressing from whichever field is present.
    pub fn into_request(self) -> Result<SendRequest> {
        if self.recipient_id.is_some() {
            self.into_direct()
        } else if self.recipient_ids.is_some() {
            self.into_group()
        } else {
            Err(MessagingError::validation("recipientId is required"))
        }
    }

    pub fn into_direct(self) -> Result<SendRequest> {
        let media = self.media()?;
        let recipient = self
            .recipient_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| MessagingError::validation("recipientId is required"))?;
        Ok(SendRequest {
            recipients: Recipients::Direct(recipient),
            content: self.content,
            media,
        })
    }

    pub fn into_group(self) -> Result<SendRequest> {
        let media = self.media()?;
        let recipients = self
            .recipient_ids
            .ok_or_else(|| MessagingError::validation("recipientIds is required"))?;
        Ok(SendRequest {
            recipients: Recipients::Group(recipients),
            content: self.content,
            media,
        })
    }

    fn media(&self) -> Result<Option<Media>> {
        match (&self.media_url, self.media_type) {
            (None, None) => Ok(None),
            (Some(url), Some(kind)) if !url.trim().is_empty() => Ok(Some(Media {
                url: url.clone(),
                kind,
            })),
            _ => Err(MessagingError::validation(
                "mediaUrl and mediaType must be given together",
            )),
        }
    }
}
