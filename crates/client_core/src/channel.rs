use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    sync::Arc,
    time::Duration,
};

use serde_json::Value;
use shared::protocol::RealtimeFrame;
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    auth::Session,
    error::{SyncError, SyncResult},
    transport::{RealtimeTransport, TransportControl, TransportError},
};

/// Event names after normalisation. The push server emits the same event as
/// `.like.received`, `like.received`, `LikeReceived` or
/// `App\Events\LikeReceived`; consumers only ever see one spelling.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CanonicalEvent {
    MessageNew,
    MessageRead,
    LikeReceived,
    MatchCreated,
    NotificationCreated,
    Other(String),
}

impl CanonicalEvent {
    pub fn normalize(raw: &str) -> Self {
        let name = raw.trim();
        let name = name.rsplit('\\').next().unwrap_or(name);
        let name = name.trim_start_matches('.');

        let mut dotted = String::with_capacity(name.len() + 4);
        let mut previous_lower = false;
        for ch in name.chars() {
            if ch.is_ascii_uppercase() {
                if previous_lower {
                    dotted.push('.');
                }
                dotted.push(ch.to_ascii_lowercase());
                previous_lower = false;
            } else if matches!(ch, '_' | '-' | ':' | '/' | ' ') {
                dotted.push('.');
                previous_lower = false;
            } else {
                dotted.push(ch);
                previous_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
            }
        }

        match dotted.as_str() {
            "message.new" | "new.message" | "message.sent" | "message.created" => Self::MessageNew,
            "message.read" | "messages.read" => Self::MessageRead,
            "like.received" | "like.created" | "new.like" => Self::LikeReceived,
            "match.created" | "match.found" | "new.match" => Self::MatchCreated,
            "notification.created" | "notification" | "new.notification" => {
                Self::NotificationCreated
            }
            _ => Self::Other(dotted),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::MessageNew => "message.new",
            Self::MessageRead => "message.read",
            Self::LikeReceived => "like.received",
            Self::MatchCreated => "match.created",
            Self::NotificationCreated => "notification.created",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for CanonicalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub topic: String,
    pub event: CanonicalEvent,
    pub payload: Value,
}

impl ChannelEvent {
    /// Identity used to collapse redeliveries of the same server event.
    fn dedup_key(&self) -> String {
        let id = ["/event_id", "/id", "/message_id", "/message/message_id"]
            .iter()
            .find_map(|pointer| self.payload.pointer(pointer))
            .map(|value| match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| self.payload.to_string());
        format!("{}:{id}", self.event)
    }
}

pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &ChannelEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&ChannelEvent) + Send + Sync,
{
    fn handle(&self, event: &ChannelEvent) {
        self(event)
    }
}

fn same_handler(a: &Arc<dyn EventHandler>, b: &Arc<dyn EventHandler>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    topic: String,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Connecting,
    Subscribed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Rejected,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

struct RecentEvents {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl RecentEvents {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    fn first_sighting(&mut self, key: String) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }

    fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}

struct TopicEntry {
    ref_count: usize,
    state: SubscriptionState,
    listeners: HashMap<CanonicalEvent, Vec<Arc<dyn EventHandler>>>,
}

struct ChannelState {
    session: Option<Session>,
    control: Option<Arc<dyn TransportControl>>,
    generation: u64,
    pump: Option<JoinHandle<()>>,
    topics: HashMap<String, TopicEntry>,
    recent: RecentEvents,
}

pub struct ChannelManager {
    transport: Arc<dyn RealtimeTransport>,
    policy: ReconnectPolicy,
    inner: Mutex<ChannelState>,
    status: watch::Sender<ConnectionStatus>,
}

impl ChannelManager {
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        policy: ReconnectPolicy,
        dedup_window: usize,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Arc::new(Self {
            transport,
            policy,
            inner: Mutex::new(ChannelState {
                session: None,
                control: None,
                generation: 0,
                pump: None,
                topics: HashMap::new(),
                recent: RecentEvents::new(dedup_window),
            }),
            status,
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Opens the transport for `session`. Topics subscribed before the
    /// connection existed are joined once it is up. Connecting again with the
    /// same session is a no-op; a different session tears everything down
    /// first.
    pub async fn connect(self: &Arc<Self>, session: Session) -> SyncResult<()> {
        let previous = { self.inner.lock().await.session.clone() };
        match previous {
            Some(current) if current == session && self.status() == ConnectionStatus::Connected => {
                return Ok(());
            }
            Some(_) => self.disconnect().await,
            None => {}
        }

        self.status.send_replace(ConnectionStatus::Connecting);
        let link = match self.transport.connect(&session).await {
            Ok(link) => link,
            Err(err) => {
                let status = match err {
                    TransportError::AuthRejected(_) => ConnectionStatus::Rejected,
                    TransportError::Unavailable(_) => ConnectionStatus::Disconnected,
                };
                self.status.send_replace(status);
                warn!(user_id = session.user_id.0, "channel: connect failed: {err}");
                return Err(err.into());
            }
        };

        let (generation, topics) = {
            let mut guard = self.inner.lock().await;
            guard.generation += 1;
            guard.session = Some(session.clone());
            guard.control = Some(Arc::clone(&link.control));
            (guard.generation, guard.topics.keys().cloned().collect::<Vec<_>>())
        };

        self.join_topics(generation, &link.control, topics).await;

        {
            let mut guard = self.inner.lock().await;
            if guard.generation != generation {
                drop(guard);
                link.control.close().await;
                debug!(generation, "channel: connect superseded while joining");
                return Err(SyncError::TransportUnavailable(
                    "connection superseded".to_string(),
                ));
            }
            // Connected goes out before the pump can report a dropped link.
            self.status.send_replace(ConnectionStatus::Connected);
            let manager = Arc::clone(self);
            let pump = tokio::spawn(manager.pump(generation, link.frames));
            if let Some(stale) = guard.pump.replace(pump) {
                stale.abort();
            }
        }

        info!(
            user_id = session.user_id.0,
            generation, "channel: transport connected"
        );
        Ok(())
    }

    pub async fn subscribe(&self, topic: &str) -> SyncResult<SubscriptionHandle> {
        let join_with = {
            let mut guard = self.inner.lock().await;
            let control = guard.control.clone();
            let generation = guard.generation;
            let entry = guard
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| TopicEntry {
                    ref_count: 0,
                    state: SubscriptionState::Connecting,
                    listeners: HashMap::new(),
                });
            entry.ref_count += 1;
            debug!(topic, ref_count = entry.ref_count, "channel: subscribe");
            if entry.ref_count == 1 {
                control.map(|control| (generation, control))
            } else {
                None
            }
        };

        if let Some((generation, control)) = join_with {
            self.join_topics(generation, &control, vec![topic.to_string()])
                .await;
        }

        Ok(SubscriptionHandle {
            topic: topic.to_string(),
        })
    }

    /// False when `handler` is already registered for the event or the
    /// subscription is gone.
    pub async fn on(
        &self,
        handle: &SubscriptionHandle,
        event_name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> bool {
        let event = CanonicalEvent::normalize(event_name);
        let mut guard = self.inner.lock().await;
        let Some(entry) = guard.topics.get_mut(&handle.topic) else {
            warn!(
                topic = handle.topic.as_str(),
                event = event.as_str(),
                "channel: listener registered on a closed subscription"
            );
            return false;
        };
        let listeners = entry.listeners.entry(event.clone()).or_default();
        if listeners.iter().any(|existing| same_handler(existing, &handler)) {
            debug!(
                topic = handle.topic.as_str(),
                event = event.as_str(),
                "channel: duplicate listener collapsed"
            );
            return false;
        }
        listeners.push(handler);
        true
    }

    pub async fn off(
        &self,
        handle: &SubscriptionHandle,
        event_name: &str,
        handler: &Arc<dyn EventHandler>,
    ) -> bool {
        let event = CanonicalEvent::normalize(event_name);
        let mut guard = self.inner.lock().await;
        let Some(listeners) = guard
            .topics
            .get_mut(&handle.topic)
            .and_then(|entry| entry.listeners.get_mut(&event))
        else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|existing| !same_handler(existing, handler));
        before != listeners.len()
    }

    pub async fn unsubscribe(&self, topic: &str) {
        let leave_with = {
            let mut guard = self.inner.lock().await;
            let Some(entry) = guard.topics.get_mut(topic) else {
                return;
            };
            entry.ref_count = entry.ref_count.saturating_sub(1);
            debug!(topic, ref_count = entry.ref_count, "channel: unsubscribe");
            if entry.ref_count > 0 {
                return;
            }
            guard.topics.remove(topic);
            guard.control.clone()
        };

        if let Some(control) = leave_with {
            if let Err(err) = control.leave(topic).await {
                warn!(topic, "channel: leave failed: {err}");
            }
        }
    }

    pub async fn disconnect(&self) {
        let (control, pump, dropped) = {
            let mut guard = self.inner.lock().await;
            guard.generation += 1;
            guard.session = None;
            guard.recent.clear();
            let dropped = guard.topics.len();
            guard.topics.clear();
            (guard.control.take(), guard.pump.take(), dropped)
        };

        if let Some(pump) = pump {
            pump.abort();
        }
        if let Some(control) = control {
            control.close().await;
            info!(topics = dropped, "channel: transport disconnected");
        }
        self.status.send_replace(ConnectionStatus::Disconnected);
    }

    pub async fn subscription_state(&self, topic: &str) -> SubscriptionState {
        self.inner
            .lock()
            .await
            .topics
            .get(topic)
            .map(|entry| entry.state)
            .unwrap_or(SubscriptionState::Closed)
    }

    pub async fn held_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.inner.lock().await.topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub async fn listener_count(&self, topic: &str, event_name: &str) -> usize {
        let event = CanonicalEvent::normalize(event_name);
        self.inner
            .lock()
            .await
            .topics
            .get(topic)
            .and_then(|entry| entry.listeners.get(&event))
            .map(Vec::len)
            .unwrap_or(0)
    }

    async fn join_topics(
        &self,
        generation: u64,
        control: &Arc<dyn TransportControl>,
        topics: Vec<String>,
    ) {
        for topic in topics {
            match control.join(&topic).await {
                Ok(()) => {
                    let mut guard = self.inner.lock().await;
                    if guard.generation != generation {
                        return;
                    }
                    if let Some(entry) = guard.topics.get_mut(&topic) {
                        entry.state = SubscriptionState::Subscribed;
                    }
                }
                // The reader notices the broken link and the reconnect pass
                // joins the topic again.
                Err(err) => warn!(topic = topic.as_str(), "channel: join failed: {err}"),
            }
        }
    }

    async fn pump(self: Arc<Self>, generation: u64, frames: mpsc::Receiver<RealtimeFrame>) {
        let mut generation = generation;
        let mut frames = frames;
        loop {
            while let Some(frame) = frames.recv().await {
                self.dispatch(frame).await;
            }
            match self.reconnect(generation).await {
                Some((next_generation, next_frames)) => {
                    generation = next_generation;
                    frames = next_frames;
                }
                None => return,
            }
        }
    }

    async fn dispatch(&self, frame: RealtimeFrame) {
        let event = ChannelEvent {
            topic: frame.topic,
            event: CanonicalEvent::normalize(&frame.event),
            payload: frame.payload,
        };

        let listeners = {
            let mut guard = self.inner.lock().await;
            let listeners = guard
                .topics
                .get(&event.topic)
                .and_then(|entry| entry.listeners.get(&event.event))
                .cloned()
                .unwrap_or_default();
            if listeners.is_empty() {
                debug!(
                    topic = event.topic.as_str(),
                    event = event.event.as_str(),
                    "channel: no listener for event"
                );
                return;
            }
            if !guard.recent.first_sighting(event.dedup_key()) {
                debug!(
                    topic = event.topic.as_str(),
                    event = event.event.as_str(),
                    "channel: duplicate delivery dropped"
                );
                return;
            }
            listeners
        };

        for listener in listeners {
            listener.handle(&event);
        }
    }

    /// Re-establishes a dropped link and rejoins every held topic. Returns
    /// `None` when the connection was torn down or superseded meanwhile, or
    /// when the credential is rejected.
    async fn reconnect(
        &self,
        dropped_generation: u64,
    ) -> Option<(u64, mpsc::Receiver<RealtimeFrame>)> {
        let session = {
            let mut guard = self.inner.lock().await;
            if guard.generation != dropped_generation {
                return None;
            }
            guard.control = None;
            for entry in guard.topics.values_mut() {
                entry.state = SubscriptionState::Connecting;
            }
            guard.session.clone()?
        };
        warn!(
            user_id = session.user_id.0,
            "channel: transport lost; reconnecting"
        );
        self.status.send_replace(ConnectionStatus::Connecting);

        let mut delay = self.policy.initial_delay;
        loop {
            tokio::time::sleep(delay).await;
            if self.inner.lock().await.generation != dropped_generation {
                return None;
            }

            match self.transport.connect(&session).await {
                Ok(link) => {
                    let (generation, topics) = {
                        let mut guard = self.inner.lock().await;
                        if guard.generation != dropped_generation {
                            drop(guard);
                            link.control.close().await;
                            return None;
                        }
                        guard.generation += 1;
                        guard.control = Some(Arc::clone(&link.control));
                        (guard.generation, guard.topics.keys().cloned().collect::<Vec<_>>())
                    };
                    let rejoined = topics.len();
                    self.join_topics(generation, &link.control, topics).await;
                    {
                        let guard = self.inner.lock().await;
                        if guard.generation != generation {
                            drop(guard);
                            link.control.close().await;
                            return None;
                        }
                        self.status.send_replace(ConnectionStatus::Connected);
                    }
                    info!(
                        user_id = session.user_id.0,
                        topics = rejoined,
                        "channel: transport restored"
                    );
                    return Some((generation, link.frames));
                }
                Err(TransportError::AuthRejected(reason)) => {
                    warn!(
                        user_id = session.user_id.0,
                        "channel: credential rejected on reconnect: {reason}"
                    );
                    self.status.send_replace(ConnectionStatus::Rejected);
                    return None;
                }
                Err(TransportError::Unavailable(reason)) => {
                    debug!(
                        delay_ms = delay.as_millis() as u64,
                        "channel: reconnect attempt failed: {reason}"
                    );
                    delay = (delay * 2).min(self.policy.max_delay);
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
