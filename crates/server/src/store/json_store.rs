//! JSON-based message storage
//!
//! One document per message, written atomically (temp file + rename) and
//! indexed in memory on start-up. Each message sits behind its own lock so
//! receipts on one message never wait on writes to another.

use crate::config::MessagingConfig;
use crate::error::{MessagingError, Result};
use crate::models::{Message, NewMessage, ReadReceipt};
use crate::store::{MessageStore, ReadOutcome};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

type MessageKey = (DateTime<Utc>, String);
type MessageCell = Arc<RwLock<Message>>;

/// JSON file message store
pub struct JsonMessageStore {
    dir: PathBuf,
    index: RwLock<MessageIndex>,
}

#[derive(Default)]
struct MessageIndex {
    /// Oldest first; queries walk it in reverse.
    ordered: BTreeMap<MessageKey, MessageCell>,
    by_id: HashMap<String, MessageCell>,
    last_created_at: Option<DateTime<Utc>>,
}

impl MessageIndex {
    fn insert(&mut self, message: Message) {
        let key = (message.created_at, message.id.clone());
        let id = message.id.clone();
        if self
            .last_created_at
            .map_or(true, |last| message.created_at > last)
        {
            self.last_created_at = Some(message.created_at);
        }
        let cell = Arc::new(RwLock::new(message));
        self.ordered.insert(key, cell.clone());
        self.by_id.insert(id, cell);
    }

    /// Next creation timestamp; strictly after every timestamp handed out so far.
    fn next_timestamp(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ts = match self.last_created_at {
            Some(last) if now <= last => last + Duration::nanoseconds(1),
            _ => now,
        };
        self.last_created_at = Some(ts);
        ts
    }
}

impl JsonMessageStore {
    /// Open the store under `config.messages_dir()`, loading what is on disk.
    pub async fn new(config: &MessagingConfig) -> anyhow::Result<Self> {
        Self::open(config.messages_dir()).await
    }

    pub async fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create message dir {:?}", dir))?;

        let store = Self {
            dir,
            index: RwLock::new(MessageIndex::default()),
        };
        let count = store.load_existing_messages().await?;
        info!("JSON MessageStore opened at {:?} with {} messages", store.dir, count);

        Ok(store)
    }

    fn message_path(&self, message_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", message_id))
    }

    async fn load_existing_messages(&self) -> anyhow::Result<usize> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut index = self.index.write().await;
        let mut count = 0;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match load_message_from_disk(&path).await {
                Ok(message) => {
                    index.insert(message);
                    count += 1;
                }
                Err(e) => {
                    warn!("Skipping unreadable message file {:?}: {:#}", path, e);
                }
            }
        }

        Ok(count)
    }

    /// Atomic write: temp file then rename.
    async fn save_message_to_disk(&self, message: &Message) -> Result<()> {
        let path = self.message_path(&message.id);
        let temp_path = path.with_extension("tmp");

        let json = serde_json::to_string_pretty(message)?;
        fs::write(&temp_path, json).await?;
        fs::rename(&temp_path, &path).await?;

        Ok(())
    }

    async fn cell(&self, message_id: &str) -> Result<MessageCell> {
        self.index
            .read()
            .await
            .by_id
            .get(message_id)
            .cloned()
            .ok_or_else(|| MessagingError::NotFound(format!("message {}", message_id)))
    }

    /// Newest-first scan with a filter.
    async fn collect<F>(&self, mut keep: F) -> Vec<Message>
    where
        F: FnMut(&Message) -> bool,
    {
        let index = self.index.read().await;
        let mut out = Vec::new();
        for cell in index.ordered.values().rev() {
            let message = cell.read().await;
            if keep(&*message) {
                out.push(message.clone());
            }
        }
        out
    }
}

async fn load_message_from_disk(path: &Path) -> anyhow::Result<Message> {
    let content = fs::read_to_string(path).await?;
    let message: Message = serde_json::from_str(&content)
        .with_context(|| format!("parse message JSON {:?}", path))?;
    Ok(message)
}

/// Drops duplicates and the sender, keeping first-seen order.
fn normalize_recipients(sender: &str, recipients: Vec<String>) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let recipients: Vec<String> = recipients
        .into_iter()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty() && r != sender)
        .filter(|r| seen.insert(r.clone()))
        .collect();

    if recipients.is_empty() {
        return Err(MessagingError::validation(
            "a message needs at least one recipient other than the sender",
        ));
    }
    Ok(recipients)
}

#[async_trait]
impl MessageStore for JsonMessageStore {
    async fn create(&self, new: NewMessage) -> Result<Message> {
        if new.sender.trim().is_empty() {
            return Err(MessagingError::validation("sender is required"));
        }
        let recipients = normalize_recipients(&new.sender, new.recipients)?;
        let content = new.content.filter(|c| !c.trim().is_empty());
        if content.is_none() && new.media.is_none() {
            return Err(MessagingError::validation(
                "a message needs content or media",
            ));
        }

        let created_at = self.index.write().await.next_timestamp(Utc::now());
        let message = Message {
            id: Uuid::new_v4().to_string(),
            sender: new.sender.clone(),
            recipients,
            content,
            media: new.media,
            is_group_message: new.is_group,
            created_at,
            read_by: vec![ReadReceipt {
                user_id: new.sender,
                read_at: created_at,
            }],
        };

        // Nothing is indexed unless the file landed.
        self.save_message_to_disk(&message).await?;
        self.index.write().await.insert(message.clone());

        debug!(
            "Stored message {} from {} to {:?}",
            message.id, message.sender, message.recipients
        );
        Ok(message)
    }

    async fn get(&self, message_id: &str) -> Result<Message> {
        let cell = self.cell(message_id).await?;
        let message = cell.read().await;
        Ok(message.clone())
    }

    async fn mark_read(&self, message_id: &str, user_id: &str) -> Result<ReadOutcome> {
        let cell = self.cell(message_id).await?;
        let mut message = cell.write().await;

        if message.is_read_by(user_id) {
            return Ok(ReadOutcome {
                message: message.clone(),
                newly_read: false,
            });
        }

        let mut updated = message.clone();
        updated.mark_read(user_id, Utc::now());
        self.save_message_to_disk(&updated).await?;
        *message = updated;

        debug!("Message {} read by {}", message_id, user_id);
        Ok(ReadOutcome {
            message: message.clone(),
            newly_read: true,
        })
    }

    async fn find_conversation_between(&self, user_a: &str, user_b: &str) -> Result<Vec<Message>> {
        Ok(self.collect(|m| m.is_between(user_a, user_b)).await)
    }

    async fn find_unread_for(&self, user_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .collect(|m| m.has_recipient(user_id) && !m.is_read_by(user_id))
            .await)
    }

    async fn find_all_involving(&self, user_id: &str) -> Result<Vec<Message>> {
        Ok(self.collect(|m| m.involves(user_id)).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Media, MediaKind};
    use tempfile::TempDir;

    fn direct(sender: &str, recipient: &str, content: &str) -> NewMessage {
        NewMessage {
            sender: sender.into(),
            recipients: vec![recipient.into()],
            content: Some(content.into()),
            media: None,
            is_group: false,
        }
    }

    async fn store() -> (TempDir, JsonMessageStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonMessageStore::open(temp_dir.path().join("messages"))
            .await
            .unwrap();
        (temp_dir, store)
    }

    #[tokio::test]
    async fn test_create_adds_sender_receipt() {
        let (_dir, store) = store().await;
        let msg = store.create(direct("u1", "u2", "hello")).await.unwrap();

        assert_eq!(msg.recipients, vec!["u2"]);
        assert!(!msg.has_recipient("u1"));
        assert!(msg.is_read_by("u1"));
        assert!(!msg.is_read_by("u2"));
        assert!(!msg.is_group_message);
    }

    #[tokio::test]
    async fn test_create_rejects_empty_recipients() {
        let (_dir, store) = store().await;
        let mut new = direct("u1", "u2", "hello");
        new.recipients.clear();
        let err = store.create(new).await.unwrap_err();
        assert!(matches!(err, MessagingError::Validation(_)));

        // only the sender left after normalization
        let err = store.create(direct("u1", "u1", "me")).await.unwrap_err();
        assert!(matches!(err, MessagingError::Validation(_)));

        assert!(store.find_all_involving("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_requires_content_or_media() {
        let (_dir, store) = store().await;
        let mut new = direct("u1", "u2", "   ");
        assert!(store.create(new.clone()).await.is_err());

        new.media = Some(Media {
            url: "https://cdn/a.mp4".into(),
            kind: MediaKind::Video,
        });
        let msg = store.create(new).await.unwrap();
        assert_eq!(msg.content, None);
    }

    #[tokio::test]
    async fn test_group_recipients_are_deduplicated() {
        let (_dir, store) = store().await;
        let msg = store
            .create(NewMessage {
                sender: "u1".into(),
                recipients: vec!["u2".into(), "u1".into(), "u3".into(), "u2".into()],
                content: Some("hey all".into()),
                media: None,
                is_group: true,
            })
            .await
            .unwrap();
        assert_eq!(msg.recipients, vec!["u2", "u3"]);
        assert!(msg.is_group_message);
    }

    #[tokio::test]
    async fn test_created_at_strictly_increases() {
        let (_dir, store) = store().await;
        let mut last = None;
        for i in 0..20 {
            let msg = store
                .create(direct("u1", "u2", &format!("m{}", i)))
                .await
                .unwrap();
            if let Some(prev) = last {
                assert!(msg.created_at > prev);
            }
            last = Some(msg.created_at);
        }
        let all = store.find_all_involving("u1").await.unwrap();
        assert_eq!(all[0].content.as_deref(), Some("m19"));
        assert_eq!(all[19].content.as_deref(), Some("m0"));
    }

    #[tokio::test]
    async fn test_mark_read_is_idempotent() {
        let (_dir, store) = store().await;
        let msg = store.create(direct("u1", "u2", "hello")).await.unwrap();

        let once = store.mark_read(&msg.id, "u2").await.unwrap();
        let twice = store.mark_read(&msg.id, "u2").await.unwrap();
        assert!(once.newly_read);
        assert!(!twice.newly_read);
        assert_eq!(once.message.read_by, twice.message.read_by);
        assert_eq!(twice.message.read_by.len(), 2);

        let err = store.mark_read("missing", "u2").await.unwrap_err();
        assert!(matches!(err, MessagingError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_conversation_is_symmetric() {
        let (_dir, store) = store().await;
        store.create(direct("a", "b", "1")).await.unwrap();
        store.create(direct("b", "a", "2")).await.unwrap();
        store.create(direct("a", "c", "3")).await.unwrap();

        let ab = store.find_conversation_between("a", "b").await.unwrap();
        let ba = store.find_conversation_between("b", "a").await.unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.len(), 2);
        assert_eq!(ab[0].content.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_unread_excludes_read_and_sent() {
        let (_dir, store) = store().await;
        let first = store.create(direct("a", "b", "1")).await.unwrap();
        store.create(direct("a", "b", "2")).await.unwrap();
        store.create(direct("b", "a", "3")).await.unwrap();

        store.mark_read(&first.id, "b").await.unwrap();
        let unread = store.find_unread_for("b").await.unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].content.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_reload_keeps_messages_and_receipts() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("messages");
        let id = {
            let store = JsonMessageStore::open(&dir).await.unwrap();
            let msg = store.create(direct("u1", "u2", "persist me")).await.unwrap();
            store.mark_read(&msg.id, "u2").await.unwrap();
            msg.id
        };

        std::fs::write(dir.join("garbage.json"), "{ not json").unwrap();

        let store = JsonMessageStore::open(&dir).await.unwrap();
        let msg = store.get(&id).await.unwrap();
        assert_eq!(msg.content.as_deref(), Some("persist me"));
        assert!(msg.is_read_by("u2"));

        // new messages still sort after the reloaded one
        let next = store.create(direct("u2", "u1", "reply")).await.unwrap();
        assert!(next.created_at > msg.created_at);
    }
}
