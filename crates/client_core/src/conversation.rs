use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use shared::{
    domain::{CorrelationToken, MessageId, MessageKind, UserId},
    protocol::MessageRecord,
};
use tokio::sync::{watch, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Shown locally, write request not answered yet.
    Pending,
    Confirmed(MessageId),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub correlation: Option<CorrelationToken>,
    pub peer_id: UserId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub delivery: Delivery,
}

impl Message {
    pub fn pending(
        sender_id: UserId,
        peer_id: UserId,
        kind: MessageKind,
        body: impl Into<String>,
        correlation: CorrelationToken,
    ) -> Self {
        Self {
            correlation: Some(correlation),
            peer_id,
            sender_id,
            kind,
            body: body.into(),
            created_at: Utc::now(),
            delivery: Delivery::Pending,
        }
    }

    pub fn from_record(record: MessageRecord, viewer: UserId) -> Self {
        Self {
            peer_id: record.peer_of(viewer),
            correlation: record.client_token,
            sender_id: record.sender_id,
            kind: record.kind,
            body: record.body,
            created_at: record.created_at,
            delivery: Delivery::Confirmed(record.message_id),
        }
    }

    pub fn server_id(&self) -> Option<MessageId> {
        match self.delivery {
            Delivery::Confirmed(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.delivery == Delivery::Pending
    }

    pub fn into_failed(mut self, reason: impl Into<String>) -> Self {
        self.delivery = Delivery::Failed(reason.into());
        self
    }

    fn matches_token(&self, token: &CorrelationToken) -> bool {
        self.correlation.as_ref() == Some(token)
    }
}

/// Result of reconciling a confirmed record with the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Replaced(usize),
    Appended(usize),
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowInfo {
    pub len: usize,
    pub has_more_older: bool,
    pub is_fetching_older: bool,
}

pub struct ConversationWindow {
    peer_id: UserId,
    // The signed-in user the window was loaded for.
    owner: UserId,
    epoch: u64,
    messages: Vec<Message>,
    pub has_more_older: bool,
    pub is_fetching_older: bool,
    // Dropping the window drops the sender, which cancels in-flight fetches
    // waiting on a receiver.
    closed: watch::Sender<()>,
}

impl ConversationWindow {
    fn new(peer_id: UserId, owner: UserId, epoch: u64) -> Self {
        let (closed, _) = watch::channel(());
        Self {
            peer_id,
            owner,
            epoch,
            messages: Vec::new(),
            has_more_older: true,
            is_fetching_older: false,
            closed,
        }
    }

    pub fn peer_id(&self) -> UserId {
        self.peer_id
    }

    pub fn owner(&self) -> UserId {
        self.owner
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn info(&self) -> WindowInfo {
        WindowInfo {
            len: self.messages.len(),
            has_more_older: self.has_more_older,
            is_fetching_older: self.is_fetching_older,
        }
    }

    pub fn closed_signal(&self) -> watch::Receiver<()> {
        self.closed.subscribe()
    }

    /// Messages the server already knows about; used as the paging offset.
    pub fn confirmed_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|message| message.server_id().is_some())
            .count()
    }

    pub fn contains_server_id(&self, id: MessageId) -> bool {
        self.messages
            .iter()
            .any(|message| message.server_id() == Some(id))
    }

    pub fn insert_pending(&mut self, message: Message) -> usize {
        self.messages.push(message);
        self.messages.len() - 1
    }

    pub fn remove_pending(&mut self, token: &CorrelationToken) -> Option<Message> {
        let index = self
            .messages
            .iter()
            .position(|message| message.is_pending() && message.matches_token(token))?;
        Some(self.messages.remove(index))
    }

    /// Puts a confirmed record into the window: substitutes a pending entry
    /// carrying the same correlation token in place, otherwise appends at the
    /// tail unless the server id is already present.
    pub fn reconcile(&mut self, confirmed: Message) -> Reconciled {
        let Some(server_id) = confirmed.server_id() else {
            return Reconciled::Duplicate;
        };
        if self.contains_server_id(server_id) {
            if let Some(token) = confirmed.correlation.as_ref() {
                // A stale pending twin may still be around if both the
                // response and the echo were applied.
                self.remove_pending(token);
            }
            return Reconciled::Duplicate;
        }
        if let Some(token) = confirmed.correlation.as_ref() {
            if let Some(index) = self
                .messages
                .iter()
                .position(|message| message.is_pending() && message.matches_token(token))
            {
                self.messages[index] = confirmed;
                return Reconciled::Replaced(index);
            }
        }
        self.messages.push(confirmed);
        Reconciled::Appended(self.messages.len() - 1)
    }

    /// Prepends an older page. Entries already held (by server id) and
    /// repeats within the page are dropped; the rest go to the head in
    /// chronological order. Returns how many entries were inserted.
    pub fn prepend_page(&mut self, page: Vec<Message>) -> usize {
        let mut known: HashSet<MessageId> = self
            .messages
            .iter()
            .filter_map(Message::server_id)
            .collect();
        let mut older: Vec<Message> = page
            .into_iter()
            .filter(|message| match message.server_id() {
                Some(id) => known.insert(id),
                None => false,
            })
            .collect();
        older.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.server_id().cmp(&b.server_id()))
        });
        let count = older.len();
        self.messages.splice(0..0, older);
        count
    }
}

struct StoreState {
    next_epoch: u64,
    active: Option<UserId>,
    windows: HashMap<UserId, ConversationWindow>,
}

pub struct ConversationStore {
    inner: Mutex<StoreState>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self {
            inner: Mutex::new(StoreState {
                next_epoch: 1,
                active: None,
                windows: HashMap::new(),
            }),
        }
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens an empty window for `peer_id` unless `owner` already has one.
    /// A window left over from another user is replaced. Returns the window
    /// epoch.
    pub async fn open(&self, peer_id: UserId, owner: UserId) -> u64 {
        let mut guard = self.inner.lock().await;
        if let Some(window) = guard.windows.get(&peer_id) {
            if window.owner() == owner {
                return window.epoch();
            }
        }
        let epoch = guard.next_epoch;
        guard.next_epoch += 1;
        guard
            .windows
            .insert(peer_id, ConversationWindow::new(peer_id, owner, epoch));
        epoch
    }

    pub async fn close(&self, peer_id: UserId) -> bool {
        let mut guard = self.inner.lock().await;
        if guard.active == Some(peer_id) {
            guard.active = None;
        }
        guard.windows.remove(&peer_id).is_some()
    }

    pub async fn close_all(&self) {
        let mut guard = self.inner.lock().await;
        guard.active = None;
        guard.windows.clear();
    }

    /// Closes every window loaded for someone other than `owner`. Returns how
    /// many were closed.
    pub async fn close_not_owned_by(&self, owner: UserId) -> usize {
        let mut guard = self.inner.lock().await;
        let before = guard.windows.len();
        guard.windows.retain(|_, window| window.owner() == owner);
        let active_gone = guard
            .active
            .is_some_and(|peer_id| !guard.windows.contains_key(&peer_id));
        if active_gone {
            guard.active = None;
        }
        before - guard.windows.len()
    }

    pub async fn set_active(&self, peer_id: Option<UserId>) {
        self.inner.lock().await.active = peer_id;
    }

    pub async fn active(&self) -> Option<UserId> {
        self.inner.lock().await.active
    }

    pub async fn is_open(&self, peer_id: UserId) -> bool {
        self.inner.lock().await.windows.contains_key(&peer_id)
    }

    pub async fn with_window<R>(
        &self,
        peer_id: UserId,
        f: impl FnOnce(&mut ConversationWindow) -> R,
    ) -> Option<R> {
        let mut guard = self.inner.lock().await;
        guard.windows.get_mut(&peer_id).map(f)
    }

    /// Like [`with_window`](Self::with_window), but only when the window is
    /// still the one identified by `epoch`.
    pub async fn with_window_epoch<R>(
        &self,
        peer_id: UserId,
        epoch: u64,
        f: impl FnOnce(&mut ConversationWindow) -> R,
    ) -> Option<R> {
        let mut guard = self.inner.lock().await;
        guard
            .windows
            .get_mut(&peer_id)
            .filter(|window| window.epoch() == epoch)
            .map(f)
    }

    pub async fn messages(&self, peer_id: UserId) -> Option<Vec<Message>> {
        self.with_window(peer_id, |window| window.messages().to_vec())
            .await
    }

    pub async fn info(&self, peer_id: UserId) -> Option<WindowInfo> {
        self.with_window(peer_id, |window| window.info()).await
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
