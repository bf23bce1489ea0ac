use super::*;
use crate::{
    auth::SessionStore,
    screens::ScreenCache,
    test_support::{record, session, FakeRest, ME, PEER},
};
use shared::domain::MessageId;
use std::time::Duration;

struct Harness {
    auth: Arc<SessionStore>,
    rest: Arc<FakeRest>,
    store: Arc<ConversationStore>,
    screens: Arc<ScreenLoader>,
    pipeline: SendPipeline,
}

async fn harness() -> Harness {
    let auth = Arc::new(SessionStore::new());
    auth.login(session());
    let rest = FakeRest::new();
    let store = Arc::new(ConversationStore::new());
    let screens = Arc::new(ScreenLoader::new(
        Arc::new(ScreenCache::new()),
        rest.clone(),
        Duration::from_secs(60),
        Duration::from_secs(300),
    ));
    let pipeline = SendPipeline::new(auth.clone(), rest.clone(), store.clone(), screens.clone());
    store.open(PEER, ME).await;
    Harness {
        auth,
        rest,
        store,
        screens,
        pipeline,
    }
}

async fn ids(store: &ConversationStore) -> Vec<Option<i64>> {
    store
        .messages(PEER)
        .await
        .expect("window")
        .iter()
        .map(|message| message.server_id().map(|id| id.0))
        .collect()
}

#[tokio::test]
async fn confirmation_lands_at_the_pending_position() {
    let h = harness().await;
    h.pipeline
        .apply_incoming(record(1, PEER, ME))
        .await
        .expect("first");
    h.rest.queue_send_result(Ok(7));

    let pending = h
        .pipeline
        .begin(PEER, MessageKind::Text, "hello")
        .await
        .expect("begin");
    assert_eq!(ids(&h.store).await, vec![Some(1), None]);

    // A peer message arrives while the write is in flight.
    h.pipeline
        .apply_incoming(record(5, PEER, ME))
        .await
        .expect("live");
    assert_eq!(ids(&h.store).await, vec![Some(1), None, Some(5)]);

    let confirmed = h.pipeline.complete(pending).await.expect("confirmed");
    assert_eq!(confirmed.server_id(), Some(MessageId(7)));
    assert_eq!(ids(&h.store).await, vec![Some(1), Some(7), Some(5)]);
    let messages = h.store.messages(PEER).await.expect("window");
    assert_eq!(messages[1].body, "hello");
    assert!(messages.iter().all(|message| !message.is_pending()));
}

#[tokio::test]
async fn echo_before_response_confirms_once() {
    let h = harness().await;
    h.rest.queue_send_result(Ok(50));

    let pending = h
        .pipeline
        .begin(PEER, MessageKind::Text, "hey")
        .await
        .expect("begin");
    let mut echo = record(50, ME, PEER);
    echo.client_token = Some(pending.token().clone());

    assert_eq!(
        h.pipeline.apply_incoming(echo).await.expect("echo"),
        Incoming::Echo { index: 0 }
    );
    h.pipeline.complete(pending).await.expect("confirmed");

    assert_eq!(ids(&h.store).await, vec![Some(50)]);
}

#[tokio::test]
async fn failed_send_removes_pending_and_keeps_content() {
    let h = harness().await;
    h.rest.queue_send_result(Err("gateway timeout".to_string()));

    let err = h
        .pipeline
        .send(PEER, MessageKind::Text, "are you there?")
        .await
        .expect_err("must fail");

    let (content, failed, reason) = match err {
        SyncError::SendFailed {
            content,
            failed,
            reason,
        } => (content, failed, reason),
        other => panic!("unexpected error: {other:?}"),
    };
    assert_eq!(content, "are you there?");
    assert!(reason.contains("gateway timeout"));
    assert_eq!(failed.delivery, Delivery::Failed(reason.clone()));
    assert!(ids(&h.store).await.is_empty());

    h.rest.queue_send_result(Ok(8));
    let resent = h.pipeline.retry(*failed).await.expect("retry");
    assert_eq!(resent.body, "are you there?");
    assert_eq!(ids(&h.store).await, vec![Some(8)]);

    let sent = h.rest.sent();
    assert_eq!(sent.len(), 2);
    assert_ne!(sent[0].client_token, sent[1].client_token);
}

#[tokio::test]
async fn retry_rejects_messages_that_did_not_fail() {
    let h = harness().await;
    let confirmed = h
        .pipeline
        .send(PEER, MessageKind::Text, "ok")
        .await
        .expect("send");

    assert!(matches!(
        h.pipeline.retry(confirmed).await,
        Err(SyncError::Request(_))
    ));
}

#[tokio::test]
async fn peer_message_is_acknowledged_only_in_the_active_conversation() {
    let h = harness().await;

    assert_eq!(
        h.pipeline
            .apply_incoming(record(3, PEER, ME))
            .await
            .expect("background"),
        Incoming::Appended {
            index: 0,
            acknowledged: false
        }
    );
    assert!(h.rest.delivered().is_empty());

    h.store.set_active(Some(PEER)).await;
    assert_eq!(
        h.pipeline
            .apply_incoming(record(5, PEER, ME))
            .await
            .expect("active"),
        Incoming::Appended {
            index: 1,
            acknowledged: true
        }
    );
    assert_eq!(h.rest.delivered(), vec![(PEER, vec![MessageId(5)])]);
}

#[tokio::test]
async fn redelivered_message_is_ignored() {
    let h = harness().await;
    h.store.set_active(Some(PEER)).await;

    h.pipeline
        .apply_incoming(record(3, PEER, ME))
        .await
        .expect("first");
    assert_eq!(
        h.pipeline
            .apply_incoming(record(3, PEER, ME))
            .await
            .expect("again"),
        Incoming::Duplicate
    );

    assert_eq!(ids(&h.store).await, vec![Some(3)]);
    assert_eq!(h.rest.delivered().len(), 1);
}

#[tokio::test]
async fn message_for_unopened_conversation_touches_no_window() {
    let h = harness().await;
    let other = UserId(9);

    assert_eq!(
        h.pipeline
            .apply_incoming(record(4, other, ME))
            .await
            .expect("apply"),
        Incoming::Unopened
    );
    assert!(!h.store.is_open(other).await);
}

#[tokio::test]
async fn sends_invalidate_the_conversation_list() {
    let h = harness().await;
    h.screens.conversations().await.expect("list");

    h.pipeline
        .send(PEER, MessageKind::Text, "new")
        .await
        .expect("send");
    let list = h.screens.conversations().await.expect("list");

    assert_eq!(h.rest.conversation_fetches(), 2);
    assert_eq!(list[0].last_message.as_deref(), Some("new"));
}

#[tokio::test]
async fn sending_requires_a_session() {
    let h = harness().await;
    h.auth.logout();

    assert!(matches!(
        h.pipeline.send(PEER, MessageKind::Text, "x").await,
        Err(SyncError::NotLoggedIn)
    ));
}

#[tokio::test]
async fn peer_message_during_a_held_send_stays_after_it() {
    let h = harness().await;
    h.rest.hold_sends();

    let (sent, _) = tokio::join!(h.pipeline.send(PEER, MessageKind::Text, "first"), async {
        tokio::task::yield_now().await;
        assert_eq!(ids(&h.store).await, vec![None]);
        h.pipeline
            .apply_incoming(record(5, PEER, ME))
            .await
            .expect("live");
        h.rest.release_sends(1);
    });

    assert_eq!(sent.expect("sent").server_id(), Some(MessageId(1000)));
    assert_eq!(ids(&h.store).await, vec![Some(1000), Some(5)]);
}
