//! Delivery router
//!
//! Persist first, then best-effort push to whoever is online. A push that
//! fails never rolls back the stored message; offline recipients catch up
//! by pulling unread messages later.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::error::{MessagingError, Result};
use crate::models::{Message, NewMessage, SendMessageInput, SendRequest};
use crate::presence::{ConnectionHandle, PresenceRegistry};
use crate::protocol::ServerEvent;
use crate::store::{MessageStore, ReadOutcome};

/// What happened to one send, from the sender's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Stored and pushed to at least one recipient.
    Delivered,
    /// Stored; no recipient was reachable.
    RecipientOffline,
}

#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub message: Message,
    pub delivered: Vec<String>,
    pub unreachable: Vec<String>,
}

impl DeliveryReport {
    pub fn outcome(&self) -> DeliveryOutcome {
        if self.delivered.is_empty() {
            DeliveryOutcome::RecipientOffline
        } else {
            DeliveryOutcome::Delivered
        }
    }

    /// Notice sent back to the sender's own connection.
    pub fn notice(&self) -> ServerEvent {
        match self.outcome() {
            DeliveryOutcome::Delivered => ServerEvent::MessageSent {
                message_id: self.message.id.clone(),
                delivered_to: self.delivered.clone(),
                unreachable: self.unreachable.clone(),
            },
            DeliveryOutcome::RecipientOffline => ServerEvent::RecipientUnreachable {
                message_id: self.message.id.clone(),
                recipient_ids: self.unreachable.clone(),
            },
        }
    }
}

pub struct DeliveryRouter {
    store: Arc<dyn MessageStore>,
    presence: Arc<PresenceRegistry>,
    push_timeout: Duration,
    store_timeout: Duration,
}

impl DeliveryRouter {
    pub fn new(
        store: Arc<dyn MessageStore>,
        presence: Arc<PresenceRegistry>,
        push_timeout: Duration,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            presence,
            push_timeout,
            store_timeout,
        }
    }

    /// Direct or group, whichever the payload names. Used by the socket adapter.
    pub async fn send(
        &self,
        sender: &str,
        input: SendMessageInput,
        notify: Option<&ConnectionHandle>,
    ) -> Result<DeliveryReport> {
        self.dispatch(sender, input.into_request(), notify).await
    }

    pub async fn send_direct(
        &self,
        sender: &str,
        input: SendMessageInput,
        notify: Option<&ConnectionHandle>,
    ) -> Result<DeliveryReport> {
        self.dispatch(sender, input.into_direct(), notify).await
    }

    pub async fn send_group(
        &self,
        sender: &str,
        input: SendMessageInput,
        notify: Option<&ConnectionHandle>,
    ) -> Result<DeliveryReport> {
        self.dispatch(sender, input.into_group(), notify).await
    }

    /// `notify`, when given, always hears back: a delivery notice or the error.
    async fn dispatch(
        &self,
        sender: &str,
        request: Result<SendRequest>,
        notify: Option<&ConnectionHandle>,
    ) -> Result<DeliveryReport> {
        let result = match request {
            Ok(request) => self.deliver(sender, request).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            match e {
                MessagingError::Storage(_) => error!("Send from {} failed: {}", sender, e),
                _ => info!("Send from {} rejected: {}", sender, e),
            }
        }

        if let Some(conn) = notify {
            let event = match &result {
                Ok(report) => report.notice(),
                Err(e) => ServerEvent::from(e),
            };
            self.push(conn, event).await;
        }

        result
    }

    async fn deliver(&self, sender: &str, request: SendRequest) -> Result<DeliveryReport> {
        let new = NewMessage {
            sender: sender.to_string(),
            is_group: request.recipients.is_group(),
            recipients: request.recipients.into_vec(),
            content: request.content,
            media: request.media,
        };
        let message = timeout(self.store_timeout, self.store.create(new)).await??;

        let pushes = message.recipients.iter().map(|recipient| {
            let event = ServerEvent::NewMessage(message.clone());
            async move {
                let pushed = match self.presence.lookup(recipient) {
                    Some(conn) => self.push(&conn, event).await,
                    None => false,
                };
                (recipient.clone(), pushed)
            }
        });

        let mut delivered = Vec::new();
        let mut unreachable = Vec::new();
        for (recipient, pushed) in join_all(pushes).await {
            if pushed {
                delivered.push(recipient);
            } else {
                unreachable.push(recipient);
            }
        }

        info!(
            "Message {} from {}: delivered to {:?}, stored for {:?}",
            message.id, sender, delivered, unreachable
        );

        Ok(DeliveryReport {
            message,
            delivered,
            unreachable,
        })
    }

    /// Records a read receipt and tells the original sender, if online, the first time.
    pub async fn mark_read(&self, user_id: &str, message_id: &str) -> Result<ReadOutcome> {
        let outcome = timeout(self.store_timeout, self.store.mark_read(message_id, user_id)).await??;

        if outcome.newly_read && outcome.message.sender != user_id {
            if let Some(conn) = self.presence.lookup(&outcome.message.sender) {
                let event = ServerEvent::MessageRead {
                    message_id: outcome.message.id.clone(),
                    user_id: user_id.to_string(),
                };
                self.push(&conn, event).await;
            }
        }

        Ok(outcome)
    }

    /// Bounded push. `false` when the connection is gone or too slow.
    pub async fn push(&self, conn: &ConnectionHandle, event: ServerEvent) -> bool {
        match conn.sender().send_timeout(event, self.push_timeout).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Push to connection {} dropped: {}", conn.id(), e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonMessageStore;
    use tempfile::TempDir;
    use tokio::sync::mpsc::Receiver;

    struct Fixture {
        _dir: TempDir,
        store: Arc<JsonMessageStore>,
        presence: Arc<PresenceRegistry>,
        router: DeliveryRouter,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JsonMessageStore::open(dir.path()).await.unwrap());
        let presence = Arc::new(PresenceRegistry::new());
        let router = DeliveryRouter::new(
            store.clone(),
            presence.clone(),
            Duration::from_millis(100),
            Duration::from_secs(5),
        );
        Fixture {
            _dir: dir,
            store,
            presence,
            router,
        }
    }

    fn online(presence: &PresenceRegistry, user: &str) -> (ConnectionHandle, Receiver<ServerEvent>) {
        let (handle, rx) = ConnectionHandle::channel(8);
        presence.register(user, handle.clone());
        (handle, rx)
    }

    fn direct(to: &str, content: &str) -> SendMessageInput {
        SendMessageInput {
            recipient_id: Some(to.into()),
            content: Some(content.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_push_to_online_recipient() {
        let f = fixture().await;
        let (h1, mut rx1) = online(&f.presence, "u1");
        let (_h2, mut rx2) = online(&f.presence, "u2");

        let report = f
            .router
            .send_direct("u1", direct("u2", "hello"), Some(&h1))
            .await
            .unwrap();
        assert_eq!(report.outcome(), DeliveryOutcome::Delivered);
        assert_eq!(report.message.recipients, vec!["u2"]);

        match rx2.recv().await.unwrap() {
            ServerEvent::NewMessage(m) => assert_eq!(m.id, report.message.id),
            other => panic!("unexpected {:?}", other),
        }
        match rx1.recv().await.unwrap() {
            ServerEvent::MessageSent { message_id, .. } => assert_eq!(message_id, report.message.id),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_offline_recipient_gets_stored_copy() {
        let f = fixture().await;
        let (h1, mut rx1) = online(&f.presence, "u1");

        let report = f
            .router
            .send_direct("u1", direct("u2", "hello"), Some(&h1))
            .await
            .unwrap();
        assert_eq!(report.outcome(), DeliveryOutcome::RecipientOffline);
        assert!(matches!(
            rx1.recv().await.unwrap(),
            ServerEvent::RecipientUnreachable { .. }
        ));

        let unread = f.store.find_unread_for("u2").await.unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].id, report.message.id);
    }

    #[tokio::test]
    async fn test_invalid_payload_notifies_sender() {
        let f = fixture().await;
        let (h1, mut rx1) = online(&f.presence, "u1");

        let input = SendMessageInput {
            content: Some("nobody".into()),
            ..Default::default()
        };
        let err = f.router.send("u1", input, Some(&h1)).await.unwrap_err();
        assert!(matches!(err, MessagingError::Validation(_)));

        match rx1.recv().await.unwrap() {
            ServerEvent::Error { code, .. } => assert_eq!(code, "invalid_payload"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(f.store.find_all_involving("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_group_fan_out_skips_offline() {
        let f = fixture().await;
        let (_h2, mut rx2) = online(&f.presence, "u2");

        let input = SendMessageInput {
            recipient_ids: Some(vec!["u2".into(), "u3".into()]),
            content: Some("team".into()),
            ..Default::default()
        };
        let report = f.router.send_group("u1", input, None).await.unwrap();
        assert!(report.message.is_group_message);
        assert_eq!(report.delivered, vec!["u2"]);
        assert_eq!(report.unreachable, vec!["u3"]);
        assert!(matches!(rx2.recv().await.unwrap(), ServerEvent::NewMessage(_)));
    }

    #[tokio::test]
    async fn test_dead_connection_does_not_undo_persistence() {
        let f = fixture().await;
        let (_h2, rx2) = online(&f.presence, "u2");
        drop(rx2);

        let report = f
            .router
            .send_direct("u1", direct("u2", "lost push"), None)
            .await
            .unwrap();
        assert_eq!(report.outcome(), DeliveryOutcome::RecipientOffline);
        assert!(f.store.get(&report.message.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_mark_read_notifies_sender_once() {
        let f = fixture().await;
        let (_h1, mut rx1) = online(&f.presence, "u1");
        let report = f
            .router
            .send_direct("u1", direct("u2", "read me"), None)
            .await
            .unwrap();

        f.router.mark_read("u2", &report.message.id).await.unwrap();
        f.router.mark_read("u2", &report.message.id).await.unwrap();

        assert!(matches!(
            rx1.recv().await.unwrap(),
            ServerEvent::MessageRead { .. }
        ));
        assert!(rx1.try_recv().is_err());
    }
}
