use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use shared::{domain::NotificationCategory, protocol::CounterSnapshot};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::{
    error::{SyncError, SyncResult},
    rest::RestApi,
};

/// Unread badges. Published as one value so both counts change together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotificationCounters {
    pub unread_messages: u32,
    pub unread_likes: u32,
}

impl NotificationCounters {
    pub fn get(&self, category: NotificationCategory) -> u32 {
        match category {
            NotificationCategory::Messages => self.unread_messages,
            NotificationCategory::Likes => self.unread_likes,
        }
    }

    fn slot(&mut self, category: NotificationCategory) -> &mut u32 {
        match category {
            NotificationCategory::Messages => &mut self.unread_messages,
            NotificationCategory::Likes => &mut self.unread_likes,
        }
    }

    fn from_snapshot(snapshot: &CounterSnapshot) -> Self {
        Self {
            unread_messages: clamp(snapshot.unread_messages),
            unread_likes: clamp(snapshot.unread_likes),
        }
    }
}

// Upper bound on remembered event times between two snapshots.
const MAX_COUNTED: usize = 1024;

fn clamp(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

struct MarkInFlight {
    previous: u32,
    increments: u32,
    cleared: Vec<DateTime<Utc>>,
}

struct AggregatorState {
    snapshot_at: Option<DateTime<Utc>>,
    /// Bumped by `reset`; requests started under an older session are
    /// dropped when they return.
    session_epoch: u64,
    marks: HashMap<NotificationCategory, MarkInFlight>,
    /// Events counted since the last snapshot, replayed on top of a snapshot
    /// taken before they happened.
    counted: Vec<(NotificationCategory, DateTime<Utc>)>,
}

impl AggregatorState {
    fn take_counted(&mut self, category: NotificationCategory) -> Vec<DateTime<Utc>> {
        let mut taken = Vec::new();
        self.counted.retain(|(counted, occurred_at)| {
            if *counted == category {
                taken.push(*occurred_at);
                false
            } else {
                true
            }
        });
        taken
    }
}

pub struct NotificationAggregator {
    rest: Arc<dyn RestApi>,
    inner: Mutex<AggregatorState>,
    counters: watch::Sender<NotificationCounters>,
}

impl NotificationAggregator {
    pub fn new(rest: Arc<dyn RestApi>) -> Self {
        let (counters, _) = watch::channel(NotificationCounters::default());
        Self {
            rest,
            inner: Mutex::new(AggregatorState {
                snapshot_at: None,
                session_epoch: 0,
                marks: HashMap::new(),
                counted: Vec::new(),
            }),
            counters,
        }
    }

    pub fn current(&self) -> NotificationCounters {
        *self.counters.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<NotificationCounters> {
        self.counters.subscribe()
    }

    /// Replaces both counters with the snapshot. Events dated at or before
    /// `taken_at` are already counted in it; later ones are added back.
    pub async fn init_from(&self, snapshot: &CounterSnapshot) {
        let mut state = self.inner.lock().await;
        self.apply_snapshot(&mut state, snapshot);
    }

    fn apply_snapshot(&self, state: &mut AggregatorState, snapshot: &CounterSnapshot) {
        let mut counters = NotificationCounters::from_snapshot(snapshot);
        state
            .counted
            .retain(|(_, occurred_at)| *occurred_at > snapshot.taken_at);
        for (category, _) in &state.counted {
            let slot = counters.slot(*category);
            *slot = slot.saturating_add(1);
        }
        state.snapshot_at = Some(snapshot.taken_at);
        self.counters.send_replace(counters);
        debug!(
            unread_messages = counters.unread_messages,
            unread_likes = counters.unread_likes,
            replayed = state.counted.len(),
            "counters: snapshot applied"
        );
    }

    /// Counts one distinct event. Returns false when the snapshot already
    /// covers it.
    pub async fn on_event(
        &self,
        category: NotificationCategory,
        occurred_at: DateTime<Utc>,
    ) -> bool {
        let mut state = self.inner.lock().await;
        if state.snapshot_at.is_some_and(|taken_at| occurred_at <= taken_at) {
            debug!(%category, %occurred_at, "counters: event predates snapshot");
            return false;
        }
        if let Some(mark) = state.marks.get_mut(&category) {
            mark.increments = mark.increments.saturating_add(1);
        }
        if state.counted.len() == MAX_COUNTED {
            state.counted.remove(0);
        }
        state.counted.push((category, occurred_at));
        self.counters.send_modify(|counters| {
            let slot = counters.slot(category);
            *slot = slot.saturating_add(1);
        });
        true
    }

    /// Clears `category` locally right away, then settles on the server's
    /// count. Returns the settled value.
    pub async fn mark_read(&self, category: NotificationCategory) -> SyncResult<u32> {
        let epoch = {
            let mut state = self.inner.lock().await;
            let previous = self.current().get(category);
            let cleared = state.take_counted(category);
            state.marks.insert(
                category,
                MarkInFlight {
                    previous,
                    increments: 0,
                    cleared,
                },
            );
            self.counters.send_modify(|counters| *counters.slot(category) = 0);
            state.session_epoch
        };

        let result = self.rest.mark_read(category).await;

        let mut state = self.inner.lock().await;
        if state.session_epoch != epoch {
            return Err(SyncError::FetchCancelled);
        }
        let mark = state.marks.remove(&category);
        match result {
            Ok(response) => {
                state.take_counted(category);
                let server = clamp(response.unread);
                let local = self.current().get(category);
                if local != server {
                    let mismatch = SyncError::CounterReconciliationMismatch {
                        category,
                        local,
                        server,
                    };
                    warn!("counters: {mismatch}; keeping server value");
                }
                self.counters
                    .send_modify(|counters| *counters.slot(category) = server);
                info!(%category, unread = server, "counters: marked read");
                Ok(server)
            }
            Err(err) => {
                let restored = match mark {
                    Some(mark) => {
                        state
                            .counted
                            .extend(mark.cleared.into_iter().map(|at| (category, at)));
                        mark.previous.saturating_add(mark.increments)
                    }
                    None => self.current().get(category),
                };
                self.counters
                    .send_modify(|counters| *counters.slot(category) = restored);
                warn!(%category, restored, "counters: mark read failed: {err}");
                Err(SyncError::request(err))
            }
        }
    }

    pub async fn refresh(&self) -> SyncResult<NotificationCounters> {
        let epoch = self.inner.lock().await.session_epoch;
        let snapshot = match self.rest.fetch_counters().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("counters: refresh failed: {err}");
                return Err(SyncError::request(err));
            }
        };

        let mut state = self.inner.lock().await;
        if state.session_epoch != epoch {
            debug!("counters: refresh from a previous session dropped");
            return Err(SyncError::FetchCancelled);
        }
        self.apply_snapshot(&mut state, &snapshot);
        Ok(self.current())
    }

    pub async fn reset(&self) {
        let mut state = self.inner.lock().await;
        state.session_epoch += 1;
        state.snapshot_at = None;
        state.marks.clear();
        state.counted.clear();
        self.counters.send_replace(NotificationCounters::default());
    }
}

#[cfg(test)]
#[path = "tests/counters_tests.rs"]
mod tests;
