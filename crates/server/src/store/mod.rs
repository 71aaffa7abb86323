//! Message storage module
//!
//! Durable, query-able log of messages. Every query returns messages
//! newest-first by `(created_at, id)`.

pub mod json_store;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Message, NewMessage};

pub use json_store::JsonMessageStore;

/// Result of `mark_read`: the message after the call, and whether this call added the receipt.
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    pub message: Message,
    pub newly_read: bool,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Validates and persists a new message. The sender is recorded in `read_by`.
    async fn create(&self, new: NewMessage) -> Result<Message>;

    async fn get(&self, message_id: &str) -> Result<Message>;

    /// Idempotent: a user already in `read_by` is left untouched.
    async fn mark_read(&self, message_id: &str, user_id: &str) -> Result<ReadOutcome>;

    async fn find_conversation_between(&self, user_a: &str, user_b: &str) -> Result<Vec<Message>>;

    async fn find_unread_for(&self, user_id: &str) -> Result<Vec<Message>>;

    async fn find_all_involving(&self, user_id: &str) -> Result<Vec<Message>>;
}
