//! Conversation list
//!
//! Folds a user's newest-first message feed into one summary per peer.

use std::collections::HashSet;
use tracing::debug;

use crate::error::Result;
use crate::models::{Conversation, LastMessage, Message};
use crate::store::MessageStore;

/// Builds the conversation list for `viewer` from the store.
pub async fn conversations_for(store: &dyn MessageStore, viewer: &str) -> Result<Vec<Conversation>> {
    let feed = store.find_all_involving(viewer).await?;
    let conversations = aggregate(viewer, &feed);
    debug!(
        "{} messages folded into {} conversations for {}",
        feed.len(),
        conversations.len(),
        viewer
    );
    Ok(conversations)
}

/// `feed` must be newest-first. The first message seen for a peer is its most
/// recent one, so each entry is created once and never revisited. Group
/// messages have no single peer and are left out.
///
/// `unread_count` looks only at that latest message: 0 if the viewer has read
/// it, 1 otherwise.
pub fn aggregate(viewer: &str, feed: &[Message]) -> Vec<Conversation> {
    let mut conversations: Vec<Conversation> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for message in feed {
        if message.is_group_message {
            continue;
        }
        let Some(peer) = peer_of(viewer, message) else {
            continue;
        };
        if !seen.insert(peer) {
            continue;
        }

        conversations.push(Conversation {
            peer_id: peer.to_string(),
            participant: None,
            last_message: LastMessage::from(message),
            unread_count: if message.is_read_by(viewer) { 0 } else { 1 },
        });
    }

    conversations
}

fn peer_of<'a>(viewer: &str, message: &'a Message) -> Option<&'a str> {
    if message.sender == viewer {
        message.recipients.first().map(String::as_str)
    } else {
        Some(message.sender.as_str())
    }
}
