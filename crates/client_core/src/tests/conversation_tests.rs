use super::*;
use chrono::TimeZone;

const ME: UserId = UserId(1);
const PEER: UserId = UserId(2);

fn at(second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, second)
        .single()
        .expect("timestamp")
}

fn confirmed(id: i64, second: u32) -> Message {
    Message::from_record(
        MessageRecord {
            message_id: MessageId(id),
            sender_id: PEER,
            receiver_id: ME,
            kind: MessageKind::Text,
            body: format!("m{id}"),
            created_at: at(second),
            client_token: None,
        },
        ME,
    )
}

fn window_with(ids: &[i64]) -> ConversationWindow {
    let mut window = ConversationWindow::new(PEER, ME, 1);
    for id in ids {
        window.reconcile(confirmed(*id, *id as u32));
    }
    window
}

fn server_ids(window: &ConversationWindow) -> Vec<Option<i64>> {
    window
        .messages()
        .iter()
        .map(|message| message.server_id().map(|id| id.0))
        .collect()
}

#[test]
fn record_peer_is_resolved_from_viewer() {
    let incoming = confirmed(5, 5);
    assert_eq!(incoming.peer_id, PEER);
    assert_eq!(incoming.sender_id, PEER);
    assert_eq!(incoming.server_id(), Some(MessageId(5)));
}

#[test]
fn confirmation_replaces_pending_in_place() {
    let mut window = window_with(&[1, 2]);
    let token = CorrelationToken::generate();
    let index = window.insert_pending(Message::pending(
        ME,
        PEER,
        MessageKind::Text,
        "hello",
        token.clone(),
    ));
    window.reconcile(confirmed(3, 3));

    let mut echo = confirmed(10, 4);
    echo.sender_id = ME;
    echo.correlation = Some(token);
    assert_eq!(window.reconcile(echo), Reconciled::Replaced(index));

    assert_eq!(server_ids(&window), vec![Some(1), Some(2), Some(10), Some(3)]);
    assert!(window.messages().iter().all(|m| !m.is_pending()));
}

#[test]
fn repeated_confirmation_is_a_duplicate() {
    let mut window = window_with(&[1]);
    assert_eq!(window.reconcile(confirmed(1, 1)), Reconciled::Duplicate);
    assert_eq!(window.messages().len(), 1);
}

#[test]
fn remove_pending_only_touches_pending_entries() {
    let mut window = window_with(&[1]);
    let token = CorrelationToken::generate();
    window.insert_pending(Message::pending(ME, PEER, MessageKind::Text, "x", token.clone()));

    let removed = window.remove_pending(&token).expect("pending entry");
    assert_eq!(removed.body, "x");
    assert!(window.remove_pending(&token).is_none());
    assert_eq!(server_ids(&window), vec![Some(1)]);
}

#[test]
fn prepend_sorts_and_skips_known_ids() {
    let mut window = window_with(&[20, 21]);
    let page = vec![confirmed(19, 19), confirmed(21, 21), confirmed(17, 17), confirmed(18, 18), confirmed(18, 18)];

    assert_eq!(window.prepend_page(page), 3);
    assert_eq!(
        server_ids(&window),
        vec![Some(17), Some(18), Some(19), Some(20), Some(21)]
    );
}

#[test]
fn confirmed_count_ignores_pending() {
    let mut window = window_with(&[1, 2, 3]);
    window.insert_pending(Message::pending(
        ME,
        PEER,
        MessageKind::Text,
        "x",
        CorrelationToken::generate(),
    ));
    assert_eq!(window.confirmed_count(), 3);
    assert_eq!(window.info().len, 4);
}

#[tokio::test]
async fn closing_window_signals_cancellation_and_changes_epoch() {
    let store = ConversationStore::new();
    let first = store.open(PEER, ME).await;
    assert_eq!(store.open(PEER, ME).await, first);

    let mut closed = store
        .with_window(PEER, |window| window.closed_signal())
        .await
        .expect("window");
    store.set_active(Some(PEER)).await;
    assert!(store.close(PEER).await);
    assert!(closed.changed().await.is_err());
    assert_eq!(store.active().await, None);

    let second = store.open(PEER, ME).await;
    assert_ne!(first, second);
    assert!(store
        .with_window_epoch(PEER, first, |_| ())
        .await
        .is_none());
    assert!(store
        .with_window_epoch(PEER, second, |_| ())
        .await
        .is_some());
}

#[tokio::test]
async fn window_of_another_user_is_replaced_and_closed_on_switch() {
    const OTHER: UserId = UserId(3);
    const THIRD: UserId = UserId(4);
    let store = ConversationStore::new();
    let mine = store.open(PEER, ME).await;
    store
        .with_window(PEER, |window| window.reconcile(confirmed(1, 1)))
        .await;

    let theirs = store.open(PEER, OTHER).await;
    assert_ne!(mine, theirs);
    assert_eq!(store.messages(PEER).await, Some(Vec::new()));

    store.open(THIRD, ME).await;
    store.set_active(Some(THIRD)).await;
    assert_eq!(store.close_not_owned_by(OTHER).await, 1);
    assert!(store.is_open(PEER).await);
    assert!(!store.is_open(THIRD).await);
    assert_eq!(store.active().await, None);
}
