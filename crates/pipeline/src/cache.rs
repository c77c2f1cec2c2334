//! Cache-aside layer for per-user notification settings.
//!
//! Two independently expiring shapes:
//! 1. Preferences — one JSON value per user, multi-day TTL.
//! 2. Push tokens — one JSON value per (user, device) pair, each with its own
//!    TTL, plus a set of device ids per user for enumeration. Redis has no
//!    field-level hash expiry, so the per-device keys emulate it.
//!
//! Cache entries are always disposable: Postgres is the source of truth and
//! every write path invalidates before returning. Token cache population is
//! owned exclusively by the write path — a read miss goes to the store but
//! never caches, so a stale "empty" result can't be pinned during migration.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{NotificationPreferences, PushToken, TenantContext};

use crate::store::NotificationStore;

/// Preferences TTL: 7 days.
const PREFS_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Per-device token TTL: 30 days.
const TOKEN_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Read/evict surface the delivery layer depends on.
#[async_trait]
pub trait UserSettingsSource: Send + Sync {
    async fn get_preferences(
        &self,
        ctx: &TenantContext,
        user_id: Uuid,
    ) -> Result<NotificationPreferences, AppError>;

    async fn get_active_tokens(
        &self,
        ctx: &TenantContext,
        user_id: Uuid,
    ) -> Result<Vec<PushToken>, AppError>;

    /// Drop exactly one device's cached token entry.
    async fn remove_push_token(&self, user_id: Uuid, device_id: &str) -> Result<(), AppError>;
}

/// Redis cache-aside service over the notification store.
pub struct UserCacheService {
    redis: ConnectionManager,
    store: Arc<dyn NotificationStore>,
}

impl UserCacheService {
    pub fn new(redis: ConnectionManager, store: Arc<dyn NotificationStore>) -> Self {
        Self { redis, store }
    }

    fn prefs_key(user_id: Uuid) -> String {
        format!("herald:prefs:{}", user_id)
    }

    fn token_key(user_id: Uuid, device_id: &str) -> String {
        format!("herald:token:{}:{}", user_id, device_id)
    }

    fn token_index_key(user_id: Uuid) -> String {
        format!("herald:token-index:{}", user_id)
    }

    fn legacy_tokens_key(user_id: Uuid) -> String {
        format!("herald:tokens:{}", user_id)
    }

    /// Cache a single device's token with its own expiry.
    ///
    /// Other devices' entries are untouched.
    pub async fn save_push_token(&self, token: &PushToken) -> Result<(), AppError> {
        let payload = serde_json::to_string(token)?;
        let mut conn = self.redis.clone();

        conn.set_ex::<_, _, ()>(
            Self::token_key(token.user_id, &token.device_id),
            payload,
            TOKEN_TTL_SECS,
        )
        .await?;
        conn.sadd::<_, _, ()>(Self::token_index_key(token.user_id), &token.device_id)
            .await?;

        Ok(())
    }

    /// Delete both cache shapes for a user entirely.
    ///
    /// Called by every write path to the source of truth, so the next read
    /// is guaranteed fresh.
    pub async fn invalidate_user_cache(&self, user_id: Uuid) -> Result<(), AppError> {
        let mut conn = self.redis.clone();

        let device_ids: Vec<String> = conn
            .smembers(Self::token_index_key(user_id))
            .await
            .unwrap_or_default();
        for device_id in &device_ids {
            conn.del::<_, ()>(Self::token_key(user_id, device_id))
                .await?;
        }

        conn.del::<_, ()>(Self::token_index_key(user_id)).await?;
        conn.del::<_, ()>(Self::legacy_tokens_key(user_id)).await?;
        conn.del::<_, ()>(Self::prefs_key(user_id)).await?;

        tracing::debug!(user_id = %user_id, "User cache invalidated");
        Ok(())
    }

    /// Eagerly pre-populate a user's cache (e.g. on login). Idempotent.
    pub async fn warmup_user_cache(
        &self,
        ctx: &TenantContext,
        user_id: Uuid,
    ) -> Result<(), AppError> {
        self.get_preferences(ctx, user_id).await?;
        self.get_active_tokens(ctx, user_id).await?;
        Ok(())
    }

    /// Tokens from the per-device representation, pruning expired entries
    /// from the index, then from the legacy whole-value key.
    async fn read_cached_tokens(&self, user_id: Uuid) -> Result<Vec<PushToken>, AppError> {
        let mut conn = self.redis.clone();

        let device_ids: Vec<String> = conn.smembers(Self::token_index_key(user_id)).await?;
        let mut tokens = Vec::with_capacity(device_ids.len());

        for device_id in device_ids {
            let key = Self::token_key(user_id, &device_id);
            match conn.get::<_, Option<String>>(&key).await? {
                Some(raw) => match serde_json::from_str::<PushToken>(&raw) {
                    Ok(token) => tokens.push(token),
                    Err(e) => {
                        tracing::warn!(
                            user_id = %user_id,
                            device_id = %device_id,
                            error = %e,
                            "Evicting corrupt token cache entry"
                        );
                        conn.del::<_, ()>(&key).await?;
                        conn.srem::<_, _, ()>(Self::token_index_key(user_id), &device_id)
                            .await?;
                    }
                },
                // entry expired on its own; drop the index reference
                None => {
                    conn.srem::<_, _, ()>(Self::token_index_key(user_id), &device_id)
                        .await?;
                }
            }
        }

        if !tokens.is_empty() {
            return Ok(tokens);
        }

        // Legacy whole-value representation, kept for migration compatibility
        let legacy_key = Self::legacy_tokens_key(user_id);
        if let Some(raw) = conn.get::<_, Option<String>>(&legacy_key).await? {
            match serde_json::from_str::<Vec<PushToken>>(&raw) {
                Ok(tokens) => return Ok(tokens),
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "Evicting corrupt legacy token cache");
                    conn.del::<_, ()>(&legacy_key).await?;
                }
            }
        }

        Ok(Vec::new())
    }
}

#[async_trait]
impl UserSettingsSource for UserCacheService {
    async fn get_preferences(
        &self,
        ctx: &TenantContext,
        user_id: Uuid,
    ) -> Result<NotificationPreferences, AppError> {
        let key = Self::prefs_key(user_id);
        let mut conn = self.redis.clone();

        match conn.get::<_, Option<String>>(&key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(prefs) => return Ok(prefs),
                Err(e) => {
                    // corrupt entry counts as a miss
                    tracing::warn!(user_id = %user_id, error = %e, "Evicting corrupt preferences cache entry");
                    if let Err(e) = conn.del::<_, ()>(&key).await {
                        tracing::warn!(error = %e, "Failed to evict corrupt cache entry");
                    }
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Preferences cache read failed, falling back to store");
            }
        }

        let prefs = self.store.fetch_or_create_preferences(ctx, user_id).await?;

        match serde_json::to_string(&prefs) {
            Ok(payload) => {
                if let Err(e) = conn
                    .set_ex::<_, _, ()>(&key, payload, PREFS_TTL_SECS)
                    .await
                {
                    tracing::warn!(user_id = %user_id, error = %e, "Failed to populate preferences cache");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize preferences for cache");
            }
        }

        Ok(prefs)
    }

    async fn get_active_tokens(
        &self,
        ctx: &TenantContext,
        user_id: Uuid,
    ) -> Result<Vec<PushToken>, AppError> {
        match self.read_cached_tokens(user_id).await {
            Ok(tokens) if !tokens.is_empty() => return Ok(tokens),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Token cache read failed, falling back to store");
            }
        }

        // Miss: read the store directly. The cache is NOT populated here —
        // only the token write path does that.
        self.store.fetch_active_tokens(ctx, user_id).await
    }

    async fn remove_push_token(&self, user_id: Uuid, device_id: &str) -> Result<(), AppError> {
        let mut conn = self.redis.clone();

        conn.del::<_, ()>(Self::token_key(user_id, device_id))
            .await?;
        conn.srem::<_, _, ()>(Self::token_index_key(user_id), device_id)
            .await?;

        tracing::debug!(user_id = %user_id, device_id = %device_id, "Removed cached push token");
        Ok(())
    }
}
