use std::{sync::Arc, time::Duration};

use shared::protocol::{ConversationSummary, NotificationSummary, ProfileSummary, ProfileUpdate};
use tracing::{debug, info};

use crate::{
    cache::{keys, ExpiringCache},
    error::{SyncError, SyncResult},
    rest::RestApi,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ScreenData {
    Conversations(Vec<ConversationSummary>),
    Notifications(Vec<NotificationSummary>),
    Profile(ProfileSummary),
}

pub type ScreenCache = ExpiringCache<ScreenData>;

pub struct ScreenLoader {
    cache: Arc<ScreenCache>,
    rest: Arc<dyn RestApi>,
    ttl: Duration,
    profile_ttl: Duration,
}

impl ScreenLoader {
    pub fn new(
        cache: Arc<ScreenCache>,
        rest: Arc<dyn RestApi>,
        ttl: Duration,
        profile_ttl: Duration,
    ) -> Self {
        Self {
            cache,
            rest,
            ttl,
            profile_ttl,
        }
    }

    pub async fn conversations(&self) -> SyncResult<Vec<ConversationSummary>> {
        let rest = Arc::clone(&self.rest);
        let data = self
            .load(keys::CONVERSATIONS, self.ttl, || async move {
                rest.fetch_conversations()
                    .await
                    .map(ScreenData::Conversations)
            })
            .await?;
        match data {
            ScreenData::Conversations(list) => Ok(list),
            other => Err(self.unexpected(keys::CONVERSATIONS, &other).await),
        }
    }

    pub async fn notifications(&self) -> SyncResult<Vec<NotificationSummary>> {
        let rest = Arc::clone(&self.rest);
        let data = self
            .load(keys::NOTIFICATIONS, self.ttl, || async move {
                rest.fetch_notifications()
                    .await
                    .map(ScreenData::Notifications)
            })
            .await?;
        match data {
            ScreenData::Notifications(list) => Ok(list),
            other => Err(self.unexpected(keys::NOTIFICATIONS, &other).await),
        }
    }

    pub async fn profile_summary(&self) -> SyncResult<ProfileSummary> {
        self.profile(keys::PROFILE_SUMMARY).await
    }

    pub async fn profile_edit_form(&self) -> SyncResult<ProfileSummary> {
        self.profile(keys::PROFILE_EDIT_FORM).await
    }

    /// Saves the edit and drops both profile screens so the next read sees
    /// the new values.
    pub async fn save_profile(&self, update: ProfileUpdate) -> SyncResult<ProfileSummary> {
        let saved = self
            .rest
            .update_profile(update)
            .await
            .map_err(SyncError::request)?;
        self.cache
            .invalidate(Some(&keys::PROFILE_SUMMARY.to_string()))
            .await;
        self.cache
            .invalidate(Some(&keys::PROFILE_EDIT_FORM.to_string()))
            .await;
        info!(user_id = saved.user_id.0, "cache: profile saved; profile screens invalidated");
        Ok(saved)
    }

    pub async fn invalidate(&self, key: &str) {
        self.cache.invalidate(Some(&key.to_string())).await;
    }

    pub async fn clear(&self) {
        self.cache.invalidate(None).await;
    }

    async fn profile(&self, key: &'static str) -> SyncResult<ProfileSummary> {
        let rest = Arc::clone(&self.rest);
        let data = self
            .load(key, self.profile_ttl, || async move {
                rest.fetch_profile().await.map(ScreenData::Profile)
            })
            .await?;
        match data {
            ScreenData::Profile(profile) => Ok(profile),
            other => Err(self.unexpected(key, &other).await),
        }
    }

    async fn load<F, Fut>(&self, key: &str, ttl: Duration, fetch: F) -> SyncResult<ScreenData>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<ScreenData>>,
    {
        self.cache
            .get_or_fetch(key.to_string(), ttl, fetch)
            .await
            .map_err(SyncError::request)
    }

    async fn unexpected(&self, key: &str, found: &ScreenData) -> SyncError {
        debug!(key, ?found, "cache: entry of the wrong shape dropped");
        self.invalidate(key).await;
        SyncError::Request(format!("cache entry {key} held unexpected data"))
    }
}

#[cfg(test)]
#[path = "tests/screens_tests.rs"]
mod tests;
