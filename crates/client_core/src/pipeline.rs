use std::sync::Arc;

use shared::{
    domain::{CorrelationToken, MessageKind, UserId},
    protocol::{MessageRecord, SendMessageRequest},
};
use tracing::{debug, info, warn};

use crate::{
    auth::AuthSource,
    cache::keys,
    conversation::{ConversationStore, Delivery, Message, Reconciled},
    error::{SyncError, SyncResult},
    rest::RestApi,
    screens::ScreenLoader,
};

#[derive(Debug, Clone)]
pub struct PendingSend {
    pub message: Message,
    token: CorrelationToken,
    viewer: UserId,
}

impl PendingSend {
    pub fn token(&self) -> &CorrelationToken {
        &self.token
    }
}

/// What applying a pushed message did to the local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Incoming {
    /// Our own message came back; the pending entry at `index` is confirmed.
    Echo { index: usize },
    Appended { index: usize, acknowledged: bool },
    Duplicate,
    /// No window is open for the conversation.
    Unopened,
}

pub struct SendPipeline {
    auth: Arc<dyn AuthSource>,
    rest: Arc<dyn RestApi>,
    store: Arc<ConversationStore>,
    screens: Arc<ScreenLoader>,
}

impl SendPipeline {
    pub fn new(
        auth: Arc<dyn AuthSource>,
        rest: Arc<dyn RestApi>,
        store: Arc<ConversationStore>,
        screens: Arc<ScreenLoader>,
    ) -> Self {
        Self {
            auth,
            rest,
            store,
            screens,
        }
    }

    fn viewer(&self) -> SyncResult<UserId> {
        self.auth
            .current()
            .map(|session| session.user_id)
            .ok_or(SyncError::NotLoggedIn)
    }

    /// Sends `body` to `peer_id`, showing it as pending until the server
    /// answers.
    pub async fn send(
        &self,
        peer_id: UserId,
        kind: MessageKind,
        body: impl Into<String>,
    ) -> SyncResult<Message> {
        let pending = self.begin(peer_id, kind, body).await?;
        self.complete(pending).await
    }

    pub async fn begin(
        &self,
        peer_id: UserId,
        kind: MessageKind,
        body: impl Into<String>,
    ) -> SyncResult<PendingSend> {
        let viewer = self.viewer()?;
        let token = CorrelationToken::generate();
        let message = Message::pending(viewer, peer_id, kind, body, token.clone());
        let shown = self
            .store
            .with_window(peer_id, |window| window.insert_pending(message.clone()))
            .await;
        debug!(
            peer_id = peer_id.0,
            token = token.as_str(),
            index = ?shown,
            "send: pending message queued"
        );
        Ok(PendingSend {
            message,
            token,
            viewer,
        })
    }

    pub async fn complete(&self, pending: PendingSend) -> SyncResult<Message> {
        let PendingSend {
            message,
            token,
            viewer,
        } = pending;
        let peer_id = message.peer_id;
        let request = SendMessageRequest {
            receiver_id: peer_id,
            kind: message.kind,
            body: message.body.clone(),
            client_token: token.clone(),
        };

        match self.rest.send_message(request).await {
            Ok(record) => {
                let mut confirmed = Message::from_record(record, viewer);
                if confirmed.correlation.is_none() {
                    confirmed.correlation = Some(token.clone());
                }
                let outcome = self
                    .store
                    .with_window(peer_id, |window| window.reconcile(confirmed.clone()))
                    .await;
                // The conversation list shows the latest message per peer.
                self.screens.invalidate(keys::CONVERSATIONS).await;
                info!(
                    peer_id = peer_id.0,
                    message_id = ?confirmed.server_id(),
                    outcome = ?outcome,
                    "send: message confirmed"
                );
                Ok(confirmed)
            }
            Err(err) => {
                let reason = err.to_string();
                self.store
                    .with_window(peer_id, |window| window.remove_pending(&token))
                    .await;
                warn!(
                    peer_id = peer_id.0,
                    token = token.as_str(),
                    "send: message failed: {reason}"
                );
                let content = message.body.clone();
                Err(SyncError::SendFailed {
                    content,
                    failed: Box::new(message.into_failed(reason.clone())),
                    reason,
                })
            }
        }
    }

    /// Re-sends the content of a failed message under a new token.
    pub async fn retry(&self, failed: Message) -> SyncResult<Message> {
        if !matches!(failed.delivery, Delivery::Failed(_)) {
            return Err(SyncError::Request(
                "only failed messages can be retried".to_string(),
            ));
        }
        debug!(peer_id = failed.peer_id.0, "send: retrying failed message");
        self.send(failed.peer_id, failed.kind, failed.body).await
    }

    pub async fn apply_incoming(&self, record: MessageRecord) -> SyncResult<Incoming> {
        let viewer = self.viewer()?;
        let message = Message::from_record(record, viewer);
        let peer_id = message.peer_id;
        let from_peer = message.sender_id != viewer;
        let server_id = message.server_id();

        let outcome = self
            .store
            .with_window(peer_id, |window| window.reconcile(message))
            .await;

        let incoming = match outcome {
            None => Incoming::Unopened,
            Some(Reconciled::Duplicate) => {
                debug!(peer_id = peer_id.0, message_id = ?server_id, "send: redelivery ignored");
                return Ok(Incoming::Duplicate);
            }
            Some(Reconciled::Replaced(index)) => Incoming::Echo { index },
            Some(Reconciled::Appended(index)) => {
                let acknowledged = from_peer && self.store.active().await == Some(peer_id);
                if let (true, Some(id)) = (acknowledged, server_id) {
                    if let Err(err) = self.rest.mark_delivered(peer_id, vec![id]).await {
                        warn!(peer_id = peer_id.0, "send: delivery acknowledgement failed: {err}");
                    }
                }
                Incoming::Appended {
                    index,
                    acknowledged,
                }
            }
        };

        // The conversation list shows the latest message per peer.
        self.screens.invalidate(keys::CONVERSATIONS).await;
        Ok(incoming)
    }
}

#[cfg(test)]
#[path = "tests/pipeline_tests.rs"]
mod tests;
