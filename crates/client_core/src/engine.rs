use std::sync::Arc;

use anyhow::Context;
use serde::de::DeserializeOwned;
use shared::{
    domain::{MessageId, MessageKind, NotificationCategory, UserId},
    protocol::{
        ConversationSummary, LikePushed, MatchPushed, MessagePushed, MessageRecord,
        MessagesReadPushed, NotificationSummary, ProfileSummary, ProfileUpdate,
    },
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    auth::{AuthSource, Session},
    cache::keys,
    channel::{CanonicalEvent, ChannelEvent, ChannelManager, ConnectionStatus, EventHandler},
    config::SyncSettings,
    conversation::{ConversationStore, Message, WindowInfo},
    counters::{NotificationAggregator, NotificationCounters},
    error::{SyncError, SyncResult},
    history::{HistoryMerger, LoadOlder},
    pipeline::{Incoming, SendPipeline},
    rest::{HttpRestApi, RestApi},
    screens::{ScreenCache, ScreenLoader},
    transport::{websocket_url_from, RealtimeTransport, WebSocketTransport},
};

const USER_EVENTS: [&str; 4] = [
    "like.received",
    "match.created",
    "notification.created",
    "message.new",
];
const CHAT_EVENTS: [&str; 2] = ["message.new", "message.read"];

pub fn user_topic(user_id: UserId) -> String {
    format!("user.{}", user_id.0)
}

pub fn chat_topic(user_id: UserId) -> String {
    format!("chat.{}", user_id.0)
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionChanged(ConnectionStatus),
    ConversationUpdated {
        peer_id: UserId,
    },
    OlderMessagesPrepended {
        peer_id: UserId,
        count: usize,
    },
    SendFailed {
        peer_id: UserId,
        failed: Message,
    },
    CountersChanged(NotificationCounters),
    MatchCreated {
        peer_id: UserId,
    },
    PeerRead {
        peer_id: UserId,
        up_to: MessageId,
    },
    Error(String),
}

pub struct SyncEngine {
    settings: SyncSettings,
    auth: Arc<dyn AuthSource>,
    channel: Arc<ChannelManager>,
    store: Arc<ConversationStore>,
    screens: Arc<ScreenLoader>,
    pipeline: SendPipeline,
    history: HistoryMerger,
    counters: Arc<NotificationAggregator>,
    events: broadcast::Sender<ClientEvent>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    forwarder: Arc<dyn EventHandler>,
    established: Mutex<Option<Session>>,
    // User whose counters, screens and windows are currently held.
    state_owner: Mutex<Option<UserId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(
        settings: SyncSettings,
        auth: Arc<dyn AuthSource>,
        transport: Arc<dyn RealtimeTransport>,
        rest: Arc<dyn RestApi>,
    ) -> Arc<Self> {
        let channel = ChannelManager::new(
            transport,
            settings.reconnect_policy(),
            settings.dedup_window,
        );
        let store = Arc::new(ConversationStore::new());
        let screens = Arc::new(ScreenLoader::new(
            Arc::new(ScreenCache::new()),
            Arc::clone(&rest),
            settings.cache_ttl(),
            settings.profile_cache_ttl(),
        ));
        let pipeline = SendPipeline::new(
            Arc::clone(&auth),
            Arc::clone(&rest),
            Arc::clone(&store),
            Arc::clone(&screens),
        );
        let history = HistoryMerger::new(
            Arc::clone(&auth),
            Arc::clone(&rest),
            Arc::clone(&store),
            settings.page_size,
        );
        let counters = Arc::new(NotificationAggregator::new(rest));
        let (events, _) = broadcast::channel(1024);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let forwarder: Arc<dyn EventHandler> = Arc::new(move |event: &ChannelEvent| {
            let _ = inbound_tx.send(event.clone());
        });

        Arc::new(Self {
            settings,
            auth,
            channel,
            store,
            screens,
            pipeline,
            history,
            counters,
            events,
            inbound: Mutex::new(Some(inbound_rx)),
            forwarder,
            established: Mutex::new(None),
            state_owner: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn with_network(
        settings: SyncSettings,
        auth: Arc<dyn AuthSource>,
    ) -> anyhow::Result<Arc<Self>> {
        let rest = HttpRestApi::new(
            settings.api_url.clone(),
            Arc::clone(&auth),
            settings.request_timeout(),
        )?;
        let realtime_url = match settings.realtime_url.as_deref() {
            Some(raw) => url::Url::parse(raw)
                .with_context(|| format!("invalid realtime_url: {raw}"))?,
            None => websocket_url_from(&settings.api_url)?,
        };
        let transport = WebSocketTransport::new(realtime_url);
        Ok(Self::new(settings, auth, Arc::new(transport), Arc::new(rest)))
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.channel.status()
    }

    /// Spawns the background tasks. An engine is started once; later calls
    /// are ignored.
    pub async fn start(self: &Arc<Self>) {
        let Some(inbound) = self.inbound.lock().await.take() else {
            debug!("engine: already started");
            return;
        };

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(Arc::clone(self).run_dispatcher(inbound)));

        let events = self.events.clone();
        let mut status = self.channel.watch_status();
        tasks.push(tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let current = *status.borrow_and_update();
                let _ = events.send(ClientEvent::ConnectionChanged(current));
            }
        }));

        let events = self.events.clone();
        let mut counters = self.counters.watch();
        tasks.push(tokio::spawn(async move {
            while counters.changed().await.is_ok() {
                let current = *counters.borrow_and_update();
                let _ = events.send(ClientEvent::CountersChanged(current));
            }
        }));

        let sessions = self.auth.watch();
        tasks.push(tokio::spawn(Arc::clone(self).run_auth_loop(sessions)));
        info!("engine: started");
    }

    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            task.abort();
        }
        self.teardown().await;
        info!("engine: stopped");
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn run_auth_loop(self: Arc<Self>, mut sessions: watch::Receiver<Option<Session>>) {
        loop {
            let session = sessions.borrow_and_update().clone();
            match session {
                Some(session) => {
                    tokio::select! {
                        _ = self.establish(session) => {}
                        changed = sessions.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            continue;
                        }
                    }
                }
                None => self.teardown().await,
            }
            if sessions.changed().await.is_err() {
                return;
            }
        }
    }

    async fn establish(&self, session: Session) {
        let previous = self.established.lock().await.clone();
        if previous.as_ref() == Some(&session)
            && self.channel.status() == ConnectionStatus::Connected
        {
            return;
        }
        self.channel.disconnect().await;
        let switched_from = self.state_owner.lock().await.replace(session.user_id);
        if let Some(previous_user) = switched_from.filter(|user| *user != session.user_id) {
            info!(
                from = previous_user.0,
                to = session.user_id.0,
                "engine: user switched"
            );
            self.counters.reset().await;
            self.screens.clear().await;
            self.store.close_not_owned_by(session.user_id).await;
        }

        let policy = self.settings.reconnect_policy();
        let mut delay = policy.initial_delay;
        loop {
            match self.channel.connect(session.clone()).await {
                Ok(()) => break,
                Err(SyncError::AuthRejected(reason)) => {
                    self.emit(ClientEvent::Error(format!(
                        "realtime credential rejected: {reason}"
                    )));
                    return;
                }
                Err(err) => {
                    debug!(delay_ms = delay.as_millis() as u64, "engine: connect retry: {err}");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(policy.max_delay);
                }
            }
        }

        for (topic, names) in [
            (user_topic(session.user_id), &USER_EVENTS[..]),
            (chat_topic(session.user_id), &CHAT_EVENTS[..]),
        ] {
            let handle = match self.channel.subscribe(&topic).await {
                Ok(handle) => handle,
                Err(err) => {
                    self.emit(ClientEvent::Error(err.to_string()));
                    return;
                }
            };
            for name in names {
                self.channel
                    .on(&handle, name, Arc::clone(&self.forwarder))
                    .await;
            }
        }
        *self.established.lock().await = Some(session.clone());
        info!(user_id = session.user_id.0, "engine: session bound");

        if let Err(err) = self.counters.refresh().await {
            if !err.is_benign() {
                self.emit(ClientEvent::Error(err.to_string()));
            }
        }
    }

    async fn teardown(&self) {
        self.channel.disconnect().await;
        self.counters.reset().await;
        self.screens.clear().await;
        self.store.close_all().await;
        self.state_owner.lock().await.take();
        if self.established.lock().await.take().is_some() {
            info!("engine: session unbound");
        }
    }

    async fn run_dispatcher(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<ChannelEvent>) {
        while let Some(event) = inbound.recv().await {
            if let Err(err) = self.apply_event(event).await {
                if !err.is_benign() {
                    self.emit(ClientEvent::Error(err.to_string()));
                }
            }
        }
    }

    async fn apply_event(&self, event: ChannelEvent) -> SyncResult<()> {
        debug!(
            topic = event.topic.as_str(),
            event = event.event.as_str(),
            "engine: applying event"
        );
        match &event.event {
            CanonicalEvent::MessageNew => {
                if let Some(record) = message_record(&event) {
                    self.on_message(record).await?;
                }
            }
            CanonicalEvent::MessageRead => {
                if let Some(read) = decode::<MessagesReadPushed>(&event) {
                    self.emit(ClientEvent::PeerRead {
                        peer_id: read.reader_id,
                        up_to: read.up_to,
                    });
                }
            }
            CanonicalEvent::LikeReceived => {
                if let Some(like) = decode::<LikePushed>(&event) {
                    self.counters
                        .on_event(NotificationCategory::Likes, like.occurred_at)
                        .await;
                    self.screens.invalidate(keys::NOTIFICATIONS).await;
                }
            }
            CanonicalEvent::MatchCreated => {
                if let Some(matched) = decode::<MatchPushed>(&event) {
                    self.screens.invalidate(keys::NOTIFICATIONS).await;
                    self.screens.invalidate(keys::CONVERSATIONS).await;
                    self.emit(ClientEvent::MatchCreated {
                        peer_id: matched.peer_id,
                    });
                }
            }
            CanonicalEvent::NotificationCreated => {
                self.screens.invalidate(keys::NOTIFICATIONS).await;
            }
            CanonicalEvent::Other(name) => {
                debug!(event = name.as_str(), "engine: event ignored");
            }
        }
        Ok(())
    }

    async fn on_message(&self, record: MessageRecord) -> SyncResult<()> {
        let viewer = self
            .auth
            .current()
            .map(|session| session.user_id)
            .ok_or(SyncError::NotLoggedIn)?;
        let peer_id = record.peer_of(viewer);
        let from_peer = record.sender_id != viewer;
        let occurred_at = record.created_at;

        let incoming = self.pipeline.apply_incoming(record).await?;
        if incoming == Incoming::Duplicate {
            return Ok(());
        }
        if incoming != Incoming::Unopened {
            self.emit(ClientEvent::ConversationUpdated { peer_id });
        }
        if from_peer && self.store.active().await != Some(peer_id) {
            self.counters
                .on_event(NotificationCategory::Messages, occurred_at)
                .await;
        }
        Ok(())
    }

    /// Makes `peer_id` the active conversation and loads its newest page.
    /// Fails with `FetchCancelled` when the window is closed meanwhile.
    pub async fn open_conversation(&self, peer_id: UserId) -> SyncResult<usize> {
        self.store.set_active(Some(peer_id)).await;
        let count = self.history.load_initial(peer_id).await?;
        self.emit(ClientEvent::ConversationUpdated { peer_id });
        Ok(count)
    }

    pub async fn close_conversation(&self, peer_id: UserId) -> bool {
        self.store.close(peer_id).await
    }

    pub async fn messages(&self, peer_id: UserId) -> Option<Vec<Message>> {
        self.store.messages(peer_id).await
    }

    pub async fn window_info(&self, peer_id: UserId) -> Option<WindowInfo> {
        self.store.info(peer_id).await
    }

    pub async fn load_older(&self, peer_id: UserId) -> SyncResult<LoadOlder> {
        match self.history.load_older(peer_id).await {
            Ok(LoadOlder::Prepended { count }) => {
                self.emit(ClientEvent::OlderMessagesPrepended { peer_id, count });
                Ok(LoadOlder::Prepended { count })
            }
            Ok(LoadOlder::Skipped) | Err(SyncError::FetchCancelled) => Ok(LoadOlder::Skipped),
            Err(err) => Err(err),
        }
    }

    pub async fn send_message(
        &self,
        peer_id: UserId,
        kind: MessageKind,
        body: impl Into<String>,
    ) -> SyncResult<Message> {
        let pending = self.pipeline.begin(peer_id, kind, body).await?;
        self.emit(ClientEvent::ConversationUpdated { peer_id });
        let result = self.pipeline.complete(pending).await;
        self.settle_send(peer_id, result)
    }

    pub async fn retry_send(&self, failed: Message) -> SyncResult<Message> {
        let peer_id = failed.peer_id;
        let result = self.pipeline.retry(failed).await;
        self.settle_send(peer_id, result)
    }

    fn settle_send(&self, peer_id: UserId, result: SyncResult<Message>) -> SyncResult<Message> {
        if let Err(SyncError::SendFailed { failed, .. }) = &result {
            self.emit(ClientEvent::SendFailed {
                peer_id,
                failed: (**failed).clone(),
            });
        }
        self.emit(ClientEvent::ConversationUpdated { peer_id });
        result
    }

    /// Clears the badge for `category` without waiting for the server.
    pub fn mark_read(&self, category: NotificationCategory) -> JoinHandle<()> {
        let counters = Arc::clone(&self.counters);
        let screens = Arc::clone(&self.screens);
        let events = self.events.clone();
        tokio::spawn(async move {
            match counters.mark_read(category).await {
                Ok(_) => screens.invalidate(keys::NOTIFICATIONS).await,
                Err(err) if err.is_benign() => {}
                Err(err) => {
                    warn!(%category, "engine: mark read failed: {err}");
                    let _ = events.send(ClientEvent::Error(err.to_string()));
                }
            }
        })
    }

    pub async fn refresh_counters(&self) -> SyncResult<NotificationCounters> {
        self.counters.refresh().await
    }

    pub fn counters(&self) -> NotificationCounters {
        self.counters.current()
    }

    pub fn watch_counters(&self) -> watch::Receiver<NotificationCounters> {
        self.counters.watch()
    }

    pub async fn conversations(&self) -> SyncResult<Vec<ConversationSummary>> {
        self.screens.conversations().await
    }

    pub async fn notifications(&self) -> SyncResult<Vec<NotificationSummary>> {
        self.screens.notifications().await
    }

    pub async fn profile_summary(&self) -> SyncResult<ProfileSummary> {
        self.screens.profile_summary().await
    }

    pub async fn profile_edit_form(&self) -> SyncResult<ProfileSummary> {
        self.screens.profile_edit_form().await
    }

    pub async fn save_profile(&self, update: ProfileUpdate) -> SyncResult<ProfileSummary> {
        self.screens.save_profile(update).await
    }
}

fn decode<T: DeserializeOwned>(event: &ChannelEvent) -> Option<T> {
    match serde_json::from_value(event.payload.clone()) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(
                topic = event.topic.as_str(),
                event = event.event.as_str(),
                "engine: malformed payload: {err}"
            );
            None
        }
    }
}

/// Message events carry the record either wrapped as `{"message": ..}` or
/// bare.
fn message_record(event: &ChannelEvent) -> Option<MessageRecord> {
    if let Ok(pushed) = serde_json::from_value::<MessagePushed>(event.payload.clone()) {
        return Some(pushed.message);
    }
    decode::<MessageRecord>(event)
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
