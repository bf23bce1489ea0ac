use std::{
    collections::VecDeque,
    sync::{Arc, Mutex as StdMutex},
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use shared::{
    domain::{MessageId, MessageKind, NotificationCategory, NotificationId, UserId},
    protocol::{
        ConversationSummary, CounterSnapshot, MarkReadResponse, MessageRecord,
        NotificationKind, NotificationSummary, ProfileSummary, ProfileUpdate, RealtimeFrame,
        SendMessageRequest,
    },
};
use tokio::sync::{mpsc, Semaphore};

use crate::{
    auth::Session,
    rest::RestApi,
    transport::{RealtimeTransport, TransportControl, TransportError, TransportLink},
};

pub const ME: UserId = UserId(1);
pub const PEER: UserId = UserId(2);

pub fn session() -> Session {
    Session::new(ME, "token-1")
}

pub fn at(offset_seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .expect("base timestamp")
        + ChronoDuration::seconds(offset_seconds)
}

pub fn record(id: i64, sender: UserId, receiver: UserId) -> MessageRecord {
    MessageRecord {
        message_id: MessageId(id),
        sender_id: sender,
        receiver_id: receiver,
        kind: MessageKind::Text,
        body: format!("message {id}"),
        created_at: at(id),
        client_token: None,
    }
}

// ---------------------------------------------------------------------------
// transport

#[derive(Default)]
struct TransportState {
    connects: u32,
    reject: bool,
    unavailable_attempts: u32,
    joins: Vec<String>,
    leaves: Vec<String>,
    closes: u32,
    frames: Option<mpsc::Sender<RealtimeFrame>>,
    join_gate: Option<Arc<Semaphore>>,
}

#[derive(Default)]
pub struct FakeTransport {
    state: Arc<StdMutex<TransportState>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reject_credentials(&self) {
        self.state.lock().expect("state").reject = true;
    }

    pub fn fail_next_connects(&self, attempts: u32) {
        self.state.lock().expect("state").unavailable_attempts = attempts;
    }

    pub fn connects(&self) -> u32 {
        self.state.lock().expect("state").connects
    }

    pub fn joins(&self) -> Vec<String> {
        self.state.lock().expect("state").joins.clone()
    }

    pub fn leaves(&self) -> Vec<String> {
        self.state.lock().expect("state").leaves.clone()
    }

    pub fn closes(&self) -> u32 {
        self.state.lock().expect("state").closes
    }

    /// Topic joins block until `release_joins` is called.
    pub fn hold_joins(&self) {
        self.state.lock().expect("state").join_gate = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_joins(&self, count: usize) {
        if let Some(gate) = self.state.lock().expect("state").join_gate.as_ref() {
            gate.add_permits(count);
        }
    }

    /// Simulates a network drop: the frame stream ends.
    pub fn drop_link(&self) {
        self.state.lock().expect("state").frames = None;
    }

    pub async fn push(&self, topic: &str, event: &str, payload: serde_json::Value) {
        let sender = self
            .state
            .lock()
            .expect("state")
            .frames
            .clone()
            .expect("transport connected");
        sender
            .send(RealtimeFrame {
                topic: topic.to_string(),
                event: event.to_string(),
                payload,
            })
            .await
            .expect("push frame");
    }
}

struct FakeControl {
    state: Arc<StdMutex<TransportState>>,
}

#[async_trait]
impl TransportControl for FakeControl {
    async fn join(&self, topic: &str) -> Result<(), TransportError> {
        let gate = self.state.lock().expect("state").join_gate.clone();
        pass(gate).await;
        self.state
            .lock()
            .expect("state")
            .joins
            .push(topic.to_string());
        Ok(())
    }

    async fn leave(&self, topic: &str) -> Result<(), TransportError> {
        self.state
            .lock()
            .expect("state")
            .leaves
            .push(topic.to_string());
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock().expect("state");
        state.closes += 1;
        state.frames = None;
    }
}

#[async_trait]
impl RealtimeTransport for FakeTransport {
    async fn connect(&self, _session: &Session) -> Result<TransportLink, TransportError> {
        let mut state = self.state.lock().expect("state");
        state.connects += 1;
        if state.reject {
            return Err(TransportError::AuthRejected("token revoked".to_string()));
        }
        if state.unavailable_attempts > 0 {
            state.unavailable_attempts -= 1;
            return Err(TransportError::Unavailable("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::channel(64);
        state.frames = Some(tx);
        Ok(TransportLink {
            control: Arc::new(FakeControl {
                state: Arc::clone(&self.state),
            }),
            frames: rx,
        })
    }
}

// ---------------------------------------------------------------------------
// rest

struct RestState {
    /// Server-side history with the peer, oldest first.
    history: Vec<MessageRecord>,
    page_requests: Vec<(UserId, usize, usize)>,
    fail_pages: bool,
    send_results: VecDeque<Result<i64, String>>,
    sent: Vec<SendMessageRequest>,
    delivered: Vec<(UserId, Vec<MessageId>)>,
    counters: Result<CounterSnapshot, String>,
    counter_fetches: u32,
    mark_read_result: Result<i64, String>,
    mark_read_calls: Vec<NotificationCategory>,
    notification_fetches: u32,
    conversation_fetches: u32,
    profile_fetches: u32,
    profile: ProfileSummary,
}

pub struct FakeRest {
    state: StdMutex<RestState>,
    page_gate: StdMutex<Option<Arc<Semaphore>>>,
    send_gate: StdMutex<Option<Arc<Semaphore>>>,
    mark_read_gate: StdMutex<Option<Arc<Semaphore>>>,
}

impl Default for FakeRest {
    fn default() -> Self {
        Self {
            state: StdMutex::new(RestState {
                history: Vec::new(),
                page_requests: Vec::new(),
                fail_pages: false,
                send_results: VecDeque::new(),
                sent: Vec::new(),
                delivered: Vec::new(),
                counters: Ok(CounterSnapshot {
                    unread_messages: 0,
                    unread_likes: 0,
                    taken_at: at(0),
                }),
                counter_fetches: 0,
                mark_read_result: Ok(0),
                mark_read_calls: Vec::new(),
                notification_fetches: 0,
                conversation_fetches: 0,
                profile_fetches: 0,
                profile: ProfileSummary {
                    user_id: ME,
                    display_name: "Me".to_string(),
                    bio: String::new(),
                    photo_urls: Vec::new(),
                },
            }),
            page_gate: StdMutex::new(None),
            send_gate: StdMutex::new(None),
            mark_read_gate: StdMutex::new(None),
        }
    }
}

impl FakeRest {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seeds `count` messages with ids `1..=count`, alternating senders.
    pub fn with_history(self: Arc<Self>, count: i64) -> Arc<Self> {
        {
            let mut state = self.state.lock().expect("state");
            state.history = (1..=count)
                .map(|id| {
                    if id % 2 == 0 {
                        record(id, ME, PEER)
                    } else {
                        record(id, PEER, ME)
                    }
                })
                .collect();
        }
        self
    }

    pub fn push_history(&self, message: MessageRecord) {
        self.state.lock().expect("state").history.push(message);
    }

    pub fn fail_pages(&self, fail: bool) {
        self.state.lock().expect("state").fail_pages = fail;
    }

    /// Page fetches block until `release_pages` is called.
    pub fn hold_pages(&self) {
        *self.page_gate.lock().expect("gate") = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_pages(&self, count: usize) {
        if let Some(gate) = self.page_gate.lock().expect("gate").as_ref() {
            gate.add_permits(count);
        }
    }

    pub fn hold_sends(&self) {
        *self.send_gate.lock().expect("gate") = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_sends(&self, count: usize) {
        if let Some(gate) = self.send_gate.lock().expect("gate").as_ref() {
            gate.add_permits(count);
        }
    }

    pub fn hold_mark_read(&self) {
        *self.mark_read_gate.lock().expect("gate") = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_mark_read(&self, count: usize) {
        if let Some(gate) = self.mark_read_gate.lock().expect("gate").as_ref() {
            gate.add_permits(count);
        }
    }

    pub fn queue_send_result(&self, result: Result<i64, String>) {
        self.state
            .lock()
            .expect("state")
            .send_results
            .push_back(result);
    }

    pub fn set_counters(&self, counters: Result<CounterSnapshot, String>) {
        self.state.lock().expect("state").counters = counters;
    }

    pub fn set_mark_read_result(&self, result: Result<i64, String>) {
        self.state.lock().expect("state").mark_read_result = result;
    }

    pub fn page_requests(&self) -> Vec<(UserId, usize, usize)> {
        self.state.lock().expect("state").page_requests.clone()
    }

    pub fn sent(&self) -> Vec<SendMessageRequest> {
        self.state.lock().expect("state").sent.clone()
    }

    pub fn delivered(&self) -> Vec<(UserId, Vec<MessageId>)> {
        self.state.lock().expect("state").delivered.clone()
    }

    pub fn counter_fetches(&self) -> u32 {
        self.state.lock().expect("state").counter_fetches
    }

    pub fn mark_read_calls(&self) -> Vec<NotificationCategory> {
        self.state.lock().expect("state").mark_read_calls.clone()
    }

    pub fn notification_fetches(&self) -> u32 {
        self.state.lock().expect("state").notification_fetches
    }

    pub fn conversation_fetches(&self) -> u32 {
        self.state.lock().expect("state").conversation_fetches
    }

    pub fn profile_fetches(&self) -> u32 {
        self.state.lock().expect("state").profile_fetches
    }

    fn gate(slot: &StdMutex<Option<Arc<Semaphore>>>) -> Option<Arc<Semaphore>> {
        slot.lock().expect("gate").clone()
    }
}

async fn pass(gate: Option<Arc<Semaphore>>) {
    if let Some(gate) = gate {
        gate.acquire().await.expect("gate open").forget();
    }
}

#[async_trait]
impl RestApi for FakeRest {
    async fn fetch_conversation_page(
        &self,
        peer_id: UserId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        {
            self.state
                .lock()
                .expect("state")
                .page_requests
                .push((peer_id, offset, limit));
        }
        pass(Self::gate(&self.page_gate)).await;
        let state = self.state.lock().expect("state");
        if state.fail_pages {
            return Err(anyhow!("history unavailable"));
        }
        // Newest first, like the server.
        Ok(state
            .history
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn send_message(&self, request: SendMessageRequest) -> Result<MessageRecord> {
        {
            self.state.lock().expect("state").sent.push(request.clone());
        }
        pass(Self::gate(&self.send_gate)).await;
        let mut state = self.state.lock().expect("state");
        let next = state.send_results.pop_front().unwrap_or(Ok(1000));
        match next {
            Ok(id) => {
                let created = MessageRecord {
                    message_id: MessageId(id),
                    sender_id: ME,
                    receiver_id: request.receiver_id,
                    kind: request.kind,
                    body: request.body,
                    created_at: Utc::now(),
                    client_token: Some(request.client_token),
                };
                state.history.push(created.clone());
                Ok(created)
            }
            Err(reason) => Err(anyhow!(reason)),
        }
    }

    async fn mark_delivered(&self, peer_id: UserId, message_ids: Vec<MessageId>) -> Result<()> {
        self.state
            .lock()
            .expect("state")
            .delivered
            .push((peer_id, message_ids));
        Ok(())
    }

    async fn mark_read(&self, category: NotificationCategory) -> Result<MarkReadResponse> {
        {
            self.state
                .lock()
                .expect("state")
                .mark_read_calls
                .push(category);
        }
        pass(Self::gate(&self.mark_read_gate)).await;
        let state = self.state.lock().expect("state");
        match &state.mark_read_result {
            Ok(unread) => Ok(MarkReadResponse {
                category,
                unread: *unread,
            }),
            Err(reason) => Err(anyhow!(reason.clone())),
        }
    }

    async fn fetch_counters(&self) -> Result<CounterSnapshot> {
        let mut state = self.state.lock().expect("state");
        state.counter_fetches += 1;
        state.counters.clone().map_err(|reason| anyhow!(reason))
    }

    async fn fetch_notifications(&self) -> Result<Vec<NotificationSummary>> {
        let mut state = self.state.lock().expect("state");
        state.notification_fetches += 1;
        Ok(vec![NotificationSummary {
            notification_id: NotificationId(state.notification_fetches as i64),
            kind: NotificationKind::Like,
            actor_id: PEER,
            actor_name: Some("Peer".to_string()),
            created_at: at(0),
            read: false,
        }])
    }

    async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let mut state = self.state.lock().expect("state");
        state.conversation_fetches += 1;
        let last = state.history.last().cloned();
        Ok(vec![ConversationSummary {
            peer_id: PEER,
            peer_name: "Peer".to_string(),
            last_message: last.as_ref().map(|message| message.body.clone()),
            last_message_at: last.map(|message| message.created_at),
            unread: 0,
        }])
    }

    async fn fetch_profile(&self) -> Result<ProfileSummary> {
        let mut state = self.state.lock().expect("state");
        state.profile_fetches += 1;
        Ok(state.profile.clone())
    }

    async fn update_profile(&self, update: ProfileUpdate) -> Result<ProfileSummary> {
        let mut state = self.state.lock().expect("state");
        if let Some(name) = update.display_name {
            state.profile.display_name = name;
        }
        if let Some(bio) = update.bio {
            state.profile.bio = bio;
        }
        Ok(state.profile.clone())
    }
}
