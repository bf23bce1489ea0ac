use std::sync::Arc;

use shared::{domain::UserId, protocol::MessageRecord};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    auth::AuthSource,
    conversation::{ConversationStore, Message},
    error::{SyncError, SyncResult},
    rest::RestApi,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOlder {
    /// `count` older messages went to the head of the window; the view keeps
    /// its scroll anchor by that many rows.
    Prepended { count: usize },
    /// A fetch was already running or the beginning of history is reached.
    Skipped,
}

pub struct HistoryMerger {
    auth: Arc<dyn AuthSource>,
    rest: Arc<dyn RestApi>,
    store: Arc<ConversationStore>,
    page_size: usize,
}

impl HistoryMerger {
    pub fn new(
        auth: Arc<dyn AuthSource>,
        rest: Arc<dyn RestApi>,
        store: Arc<ConversationStore>,
        page_size: usize,
    ) -> Self {
        Self {
            auth,
            rest,
            store,
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Opens the window for `peer_id` with the newest page. A window that
    /// already holds messages is kept as is.
    pub async fn load_initial(&self, peer_id: UserId) -> SyncResult<usize> {
        let viewer = self.viewer()?;
        let epoch = self.store.open(peer_id, viewer).await;
        let closed = self
            .store
            .with_window_epoch(peer_id, epoch, |window| {
                if window.is_fetching_older || !window.messages().is_empty() {
                    return None;
                }
                window.is_fetching_older = true;
                Some(window.closed_signal())
            })
            .await
            .flatten();
        let Some(closed) = closed else {
            let len = self
                .store
                .info(peer_id)
                .await
                .map(|info| info.len)
                .unwrap_or(0);
            debug!(peer_id = peer_id.0, len, "history: window already loaded");
            return Ok(len);
        };

        let records = self.fetch_page(peer_id, epoch, closed, 0).await?;
        let fetched = records.len();
        let count = self
            .merge(peer_id, epoch, viewer, records)
            .await
            .ok_or(SyncError::FetchCancelled)?;
        info!(peer_id = peer_id.0, fetched, count, "history: initial page loaded");
        Ok(count)
    }

    pub async fn load_older(&self, peer_id: UserId) -> SyncResult<LoadOlder> {
        let viewer = self.viewer()?;
        let started = self
            .store
            .with_window(peer_id, |window| {
                if window.is_fetching_older || !window.has_more_older {
                    return None;
                }
                window.is_fetching_older = true;
                Some((window.epoch(), window.closed_signal(), window.confirmed_count()))
            })
            .await
            .ok_or(SyncError::NoConversation(peer_id.0))?;
        let Some((epoch, closed, offset)) = started else {
            debug!(peer_id = peer_id.0, "history: load older skipped");
            return Ok(LoadOlder::Skipped);
        };

        let records = self.fetch_page(peer_id, epoch, closed, offset).await?;
        let count = self
            .merge(peer_id, epoch, viewer, records)
            .await
            .ok_or(SyncError::FetchCancelled)?;
        debug!(peer_id = peer_id.0, offset, count, "history: older page prepended");
        Ok(LoadOlder::Prepended { count })
    }

    fn viewer(&self) -> SyncResult<UserId> {
        self.auth
            .current()
            .map(|session| session.user_id)
            .ok_or(SyncError::NotLoggedIn)
    }

    /// Runs the page request unless the window closes first. On failure the
    /// fetching flag is cleared so the caller may retry.
    async fn fetch_page(
        &self,
        peer_id: UserId,
        epoch: u64,
        mut closed: watch::Receiver<()>,
        offset: usize,
    ) -> SyncResult<Vec<MessageRecord>> {
        let result = tokio::select! {
            result = self.rest.fetch_conversation_page(peer_id, offset, self.page_size) => result,
            _ = closed.changed() => {
                debug!(peer_id = peer_id.0, offset, "history: fetch cancelled by window close");
                return Err(SyncError::FetchCancelled);
            }
        };
        match result {
            Ok(records) => Ok(records),
            Err(err) => {
                warn!(peer_id = peer_id.0, offset, "history: page fetch failed: {err}");
                self.store
                    .with_window_epoch(peer_id, epoch, |window| {
                        window.is_fetching_older = false;
                    })
                    .await;
                Err(SyncError::request(err))
            }
        }
    }

    async fn merge(
        &self,
        peer_id: UserId,
        epoch: u64,
        viewer: UserId,
        records: Vec<MessageRecord>,
    ) -> Option<usize> {
        let full_page = records.len() >= self.page_size;
        let page: Vec<Message> = records
            .into_iter()
            .map(|record| Message::from_record(record, viewer))
            .filter(|message| message.peer_id == peer_id)
            .collect();
        self.store
            .with_window_epoch(peer_id, epoch, |window| {
                let count = window.prepend_page(page);
                window.has_more_older = full_page;
                window.is_fetching_older = false;
                count
            })
            .await
    }
}

#[cfg(test)]
#[path = "tests/history_tests.rs"]
mod tests;
