//! Persistence interface consumed by the pipeline.
//!
//! Every operation is tenant-scoped through an explicit [`TenantContext`];
//! nothing about the tenant is ambient. The Postgres implementation mirrors
//! the schema in `migrations/`.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{
    NotificationPreferences, NotificationRecord, PushStatus, PushToken, TenantContext,
};

/// Persistence operations the pipeline depends on.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Insert a freshly created notification record. Inserting the same id
    /// twice is a no-op.
    async fn insert_record(
        &self,
        ctx: &TenantContext,
        record: &NotificationRecord,
    ) -> Result<(), AppError>;

    /// Update push delivery status in place. Idempotent: re-applying the same
    /// status for the same notification id is a no-op change.
    async fn update_push_status(
        &self,
        ctx: &TenantContext,
        notification_id: Uuid,
        status: PushStatus,
        error_message: Option<&str>,
    ) -> Result<(), AppError>;

    /// Mark a single device token inactive.
    async fn deactivate_token(&self, ctx: &TenantContext, token: &str) -> Result<(), AppError>;

    /// All active push tokens for a user.
    async fn fetch_active_tokens(
        &self,
        ctx: &TenantContext,
        user_id: Uuid,
    ) -> Result<Vec<PushToken>, AppError>;

    /// Load a user's preferences, creating a default-enabled row on first read.
    async fn fetch_or_create_preferences(
        &self,
        ctx: &TenantContext,
        user_id: Uuid,
    ) -> Result<NotificationPreferences, AppError>;
}

/// PostgreSQL-backed store.
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn insert_record(
        &self,
        ctx: &TenantContext,
        record: &NotificationRecord,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO notifications
                (id, org_id, user_id, notification_type, title, body,
                 is_read, push_sent, push_status, error_message, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(ctx.org_id)
        .bind(record.user_id)
        .bind(record.notification_type.to_string())
        .bind(&record.title)
        .bind(&record.body)
        .bind(record.is_read)
        .bind(record.push_sent)
        .bind(record.push_status.to_string())
        .bind(&record.error_message)
        .bind(&record.metadata)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_push_status(
        &self,
        ctx: &TenantContext,
        notification_id: Uuid,
        status: PushStatus,
        error_message: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE notifications
            SET push_status = $3, push_sent = $4, error_message = $5
            WHERE id = $2 AND org_id = $1
            "#,
        )
        .bind(ctx.org_id)
        .bind(notification_id)
        .bind(status.to_string())
        .bind(status == PushStatus::Ok)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn deactivate_token(&self, ctx: &TenantContext, token: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE push_tokens SET is_active = false WHERE org_id = $1 AND token = $2")
            .bind(ctx.org_id)
            .bind(token)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn fetch_active_tokens(
        &self,
        ctx: &TenantContext,
        user_id: Uuid,
    ) -> Result<Vec<PushToken>, AppError> {
        let tokens: Vec<PushToken> = sqlx::query_as(
            r#"
            SELECT user_id, device_id, token, device_type, is_active, last_used_at
            FROM push_tokens
            WHERE org_id = $1 AND user_id = $2 AND is_active = true
            ORDER BY device_id
            "#,
        )
        .bind(ctx.org_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(tokens)
    }

    async fn fetch_or_create_preferences(
        &self,
        ctx: &TenantContext,
        user_id: Uuid,
    ) -> Result<NotificationPreferences, AppError> {
        // Read path deliberately creates the default row so defaults are
        // computed once, not on every read.
        sqlx::query(
            r#"
            INSERT INTO notification_preferences (org_id, user_id, enable_push, preferences)
            VALUES ($1, $2, true, '{}'::jsonb)
            ON CONFLICT (org_id, user_id) DO NOTHING
            "#,
        )
        .bind(ctx.org_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        let (enable_push, preferences): (bool, serde_json::Value) = sqlx::query_as(
            r#"
            SELECT enable_push, preferences
            FROM notification_preferences
            WHERE org_id = $1 AND user_id = $2
            "#,
        )
        .bind(ctx.org_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(NotificationPreferences {
            user_id,
            enable_push,
            types: serde_json::from_value(preferences).unwrap_or_default(),
        })
    }
}

/// In-memory store that records every call, for tests.
#[derive(Default)]
pub struct MockNotificationStore {
    records: tokio::sync::Mutex<Vec<NotificationRecord>>,
    status_updates: tokio::sync::Mutex<Vec<(Uuid, PushStatus, Option<String>)>>,
    deactivated: tokio::sync::Mutex<Vec<String>>,
    tokens: tokio::sync::Mutex<Vec<PushToken>>,
    preferences: tokio::sync::Mutex<Vec<NotificationPreferences>>,
    fetch_token_calls: std::sync::atomic::AtomicUsize,
    fetch_prefs_calls: std::sync::atomic::AtomicUsize,
}

impl MockNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an active token the store will return for its user.
    pub async fn add_token(&self, token: PushToken) {
        self.tokens.lock().await.push(token);
    }

    /// Seed preferences for a user (otherwise defaults are created on read).
    pub async fn set_preferences(&self, prefs: NotificationPreferences) {
        let mut all = self.preferences.lock().await;
        all.retain(|p| p.user_id != prefs.user_id);
        all.push(prefs);
    }

    pub async fn records(&self) -> Vec<NotificationRecord> {
        self.records.lock().await.clone()
    }

    pub async fn status_updates(&self) -> Vec<(Uuid, PushStatus, Option<String>)> {
        self.status_updates.lock().await.clone()
    }

    pub async fn deactivated_tokens(&self) -> Vec<String> {
        self.deactivated.lock().await.clone()
    }

    pub fn fetch_token_calls(&self) -> usize {
        self.fetch_token_calls
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn fetch_prefs_calls(&self) -> usize {
        self.fetch_prefs_calls
            .load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationStore for MockNotificationStore {
    async fn insert_record(
        &self,
        _ctx: &TenantContext,
        record: &NotificationRecord,
    ) -> Result<(), AppError> {
        let mut records = self.records.lock().await;
        if !records.iter().any(|r| r.id == record.id) {
            records.push(record.clone());
        }
        Ok(())
    }

    async fn update_push_status(
        &self,
        _ctx: &TenantContext,
        notification_id: Uuid,
        status: PushStatus,
        error_message: Option<&str>,
    ) -> Result<(), AppError> {
        self.status_updates.lock().await.push((
            notification_id,
            status,
            error_message.map(String::from),
        ));
        let mut records = self.records.lock().await;
        if let Some(record) = records.iter_mut().find(|r| r.id == notification_id) {
            record.push_status = status;
            record.push_sent = status == PushStatus::Ok;
            record.error_message = error_message.map(String::from);
        }
        Ok(())
    }

    async fn deactivate_token(&self, _ctx: &TenantContext, token: &str) -> Result<(), AppError> {
        self.deactivated.lock().await.push(token.to_string());
        let mut tokens = self.tokens.lock().await;
        if let Some(entry) = tokens.iter_mut().find(|t| t.token == token) {
            entry.is_active = false;
        }
        Ok(())
    }

    async fn fetch_active_tokens(
        &self,
        _ctx: &TenantContext,
        user_id: Uuid,
    ) -> Result<Vec<PushToken>, AppError> {
        self.fetch_token_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(self
            .tokens
            .lock()
            .await
            .iter()
            .filter(|t| t.user_id == user_id && t.is_active)
            .cloned()
            .collect())
    }

    async fn fetch_or_create_preferences(
        &self,
        _ctx: &TenantContext,
        user_id: Uuid,
    ) -> Result<NotificationPreferences, AppError> {
        self.fetch_prefs_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut all = self.preferences.lock().await;
        if let Some(prefs) = all.iter().find(|p| p.user_id == user_id) {
            return Ok(prefs.clone());
        }
        let prefs = NotificationPreferences::default_enabled(user_id);
        all.push(prefs.clone());
        Ok(prefs)
    }
}
