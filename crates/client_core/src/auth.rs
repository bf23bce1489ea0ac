use shared::domain::UserId;
use tokio::sync::watch;
use tracing::info;

#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub token: String,
}

impl Session {
    pub fn new(user_id: UserId, token: impl Into<String>) -> Self {
        Self {
            user_id,
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Source of the current credential and of login/logout notifications.
pub trait AuthSource: Send + Sync {
    fn current(&self) -> Option<Session>;
    fn watch(&self) -> watch::Receiver<Option<Session>>;
}

/// In-process session holder fed by the login flow.
pub struct SessionStore {
    tx: watch::Sender<Option<Session>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn login(&self, session: Session) {
        info!(user_id = session.user_id.0, "auth: session established");
        self.tx.send_replace(Some(session));
    }

    pub fn logout(&self) {
        if self.tx.send_replace(None).is_some() {
            info!("auth: session cleared");
        }
    }
}

impl AuthSource for SessionStore {
    fn current(&self) -> Option<Session> {
        self.tx.borrow().clone()
    }

    fn watch(&self) -> watch::Receiver<Option<Session>> {
        self.tx.subscribe()
    }
}
