use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{MessageId, NotificationCategory, UserId},
    error::ApiError,
    protocol::{
        ConversationPageQuery, ConversationSummary, CounterSnapshot, MarkDeliveredRequest,
        MarkReadRequest, MarkReadResponse, MessageRecord, NotificationSummary, ProfileSummary,
        ProfileUpdate, SendMessageRequest,
    },
};

use crate::auth::AuthSource;

#[async_trait]
pub trait RestApi: Send + Sync {
    /// Page of history ending `offset` messages before the newest one.
    async fn fetch_conversation_page(
        &self,
        peer_id: UserId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MessageRecord>>;
    async fn send_message(&self, request: SendMessageRequest) -> Result<MessageRecord>;
    async fn mark_delivered(&self, peer_id: UserId, message_ids: Vec<MessageId>) -> Result<()>;
    async fn mark_read(&self, category: NotificationCategory) -> Result<MarkReadResponse>;
    async fn fetch_counters(&self) -> Result<CounterSnapshot>;
    async fn fetch_notifications(&self) -> Result<Vec<NotificationSummary>>;
    async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>>;
    async fn fetch_profile(&self) -> Result<ProfileSummary>;
    async fn update_profile(&self, update: ProfileUpdate) -> Result<ProfileSummary>;
}

pub struct HttpRestApi {
    http: Client,
    base_url: String,
    auth: Arc<dyn AuthSource>,
}

impl HttpRestApi {
    pub fn new(
        base_url: impl Into<String>,
        auth: Arc<dyn AuthSource>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let session = self
            .auth
            .current()
            .ok_or_else(|| anyhow!("not logged in: missing session"))?;
        Ok(request.bearer_auth(session.token))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let request = self.authorized(self.http.get(format!("{}{path}", self.base_url)))?;
        decode(request.send().await?).await
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => Err(anyhow!(
            "server answered {status} ({:?}): {}",
            api_error.code,
            api_error.message
        )),
        Err(_) => Err(anyhow!("server answered {status}")),
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let response = check_status(response).await?;
    response
        .json()
        .await
        .context("failed to decode response body")
}

#[async_trait]
impl RestApi for HttpRestApi {
    async fn fetch_conversation_page(
        &self,
        peer_id: UserId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        let request = self.authorized(
            self.http
                .get(format!("{}/conversations/{}/messages", self.base_url, peer_id.0))
                .query(&ConversationPageQuery { offset, limit }),
        )?;
        decode(request.send().await?).await
    }

    async fn send_message(&self, request: SendMessageRequest) -> Result<MessageRecord> {
        let builder = self.authorized(
            self.http
                .post(format!(
                    "{}/conversations/{}/messages",
                    self.base_url, request.receiver_id.0
                ))
                .json(&request),
        )?;
        decode(builder.send().await?).await
    }

    async fn mark_delivered(&self, peer_id: UserId, message_ids: Vec<MessageId>) -> Result<()> {
        let request = self.authorized(
            self.http
                .post(format!(
                    "{}/conversations/{}/delivered",
                    self.base_url, peer_id.0
                ))
                .json(&MarkDeliveredRequest {
                    peer_id,
                    message_ids,
                }),
        )?;
        check_status(request.send().await?).await?;
        Ok(())
    }

    async fn mark_read(&self, category: NotificationCategory) -> Result<MarkReadResponse> {
        let request = self.authorized(
            self.http
                .post(format!("{}/notifications/read", self.base_url))
                .json(&MarkReadRequest { category }),
        )?;
        decode(request.send().await?).await
    }

    async fn fetch_counters(&self) -> Result<CounterSnapshot> {
        self.get_json("/notifications/counters").await
    }

    async fn fetch_notifications(&self) -> Result<Vec<NotificationSummary>> {
        self.get_json("/notifications").await
    }

    async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>> {
        self.get_json("/conversations").await
    }

    async fn fetch_profile(&self) -> Result<ProfileSummary> {
        self.get_json("/profile").await
    }

    async fn update_profile(&self, update: ProfileUpdate) -> Result<ProfileSummary> {
        let request = self.authorized(
            self.http
                .put(format!("{}/profile", self.base_url))
                .json(&update),
        )?;
        decode(request.send().await?).await
    }
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
