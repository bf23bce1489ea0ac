use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::{ControlFrame, RealtimeFrame};
use thiserror::Error;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue, StatusCode},
        Error as WsError, Message,
    },
};
use tracing::{debug, warn};
use url::Url;

use crate::auth::Session;

const FRAME_BUFFER: usize = 256;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("credential rejected: {0}")]
    AuthRejected(String),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait TransportControl: Send + Sync {
    async fn join(&self, topic: &str) -> Result<(), TransportError>;
    async fn leave(&self, topic: &str) -> Result<(), TransportError>;
    async fn close(&self);
}

/// A live connection. `frames` yields inbound events and ends when the
/// connection drops.
pub struct TransportLink {
    pub control: Arc<dyn TransportControl>,
    pub frames: mpsc::Receiver<RealtimeFrame>,
}

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(&self, session: &Session) -> Result<TransportLink, TransportError>;
}

/// Derives the websocket endpoint from the REST base url.
pub fn websocket_url_from(api_url: &str) -> anyhow::Result<Url> {
    let ws_url = if api_url.starts_with("https://") {
        api_url.replacen("https://", "wss://", 1)
    } else if api_url.starts_with("http://") {
        api_url.replacen("http://", "ws://", 1)
    } else {
        return Err(anyhow::anyhow!(
            "api_url must start with http:// or https://"
        ));
    };
    Ok(Url::parse(&format!("{}/realtime", ws_url.trim_end_matches('/')))?)
}

pub struct WebSocketTransport {
    url: Url,
}

impl WebSocketTransport {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

struct WebSocketControl {
    outbound: mpsc::Sender<Message>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketControl {
    async fn send_control(&self, frame: ControlFrame) -> Result<(), TransportError> {
        let text = serde_json::to_string(&frame)
            .map_err(|err| TransportError::Unavailable(err.to_string()))?;
        self.outbound
            .send(Message::Text(text))
            .await
            .map_err(|_| TransportError::Unavailable("websocket writer closed".to_string()))
    }
}

#[async_trait]
impl TransportControl for WebSocketControl {
    async fn join(&self, topic: &str) -> Result<(), TransportError> {
        self.send_control(ControlFrame::Join {
            topic: topic.to_string(),
        })
        .await
    }

    async fn leave(&self, topic: &str) -> Result<(), TransportError> {
        self.send_control(ControlFrame::Leave {
            topic: topic.to_string(),
        })
        .await
    }

    async fn close(&self) {
        let _ = self.outbound.send(Message::Close(None)).await;
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
    }
}

fn map_connect_error(err: WsError) -> TransportError {
    match err {
        WsError::Http(response)
            if response.status() == StatusCode::UNAUTHORIZED
                || response.status() == StatusCode::FORBIDDEN =>
        {
            TransportError::AuthRejected(format!("server answered {}", response.status()))
        }
        other => TransportError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl RealtimeTransport for WebSocketTransport {
    async fn connect(&self, session: &Session) -> Result<TransportLink, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::Unavailable(err.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", session.token))
            .map_err(|_| TransportError::AuthRejected("token is not a valid header".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, _) = connect_async(request).await.map_err(map_connect_error)?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(64);
        let (frames_tx, frames) = mpsc::channel(FRAME_BUFFER);

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = ws_writer.send(message).await {
                    warn!("channel: websocket send failed: {err}");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<RealtimeFrame>(&text) {
                        Ok(frame) => {
                            if frames_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!("channel: invalid realtime frame: {err}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("channel: websocket receive failed: {err}");
                        break;
                    }
                }
            }
            debug!("channel: websocket reader finished");
        });

        Ok(TransportLink {
            control: Arc::new(WebSocketControl {
                outbound,
                reader: Mutex::new(Some(reader)),
            }),
            frames,
        })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
