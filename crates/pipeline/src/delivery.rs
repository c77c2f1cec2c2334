//! Push delivery orchestration.
//!
//! For each notification: check the user's preferences, collect active device
//! tokens, send one batched gateway request with retry and capped exponential
//! backoff, then apply the per-token tickets — persisting delivery status and
//! deactivating permanently invalid tokens one device at a time.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use herald_common::types::{NotificationEvent, PushStatus, PushToken, TenantContext};

use crate::cache::UserSettingsSource;
use crate::gateway::{
    DEVICE_NOT_REGISTERED, DeliveryError, PushGateway, PushMessage, PushTicket, mask_token,
};
use crate::store::NotificationStore;

/// Total gateway attempts, including the first.
const MAX_ATTEMPTS: u32 = 3;

/// First backoff delay; doubles per attempt.
const BASE_BACKOFF_MS: u64 = 1_000;

/// Ceiling for the delay between attempts.
const MAX_BACKOFF_MS: u64 = 5_000;

/// Sends push notifications through the gateway and records the outcome.
pub struct DeliveryService {
    settings: Arc<dyn UserSettingsSource>,
    store: Arc<dyn NotificationStore>,
    gateway: Arc<dyn PushGateway>,
}

impl DeliveryService {
    pub fn new(
        settings: Arc<dyn UserSettingsSource>,
        store: Arc<dyn NotificationStore>,
        gateway: Arc<dyn PushGateway>,
    ) -> Self {
        Self {
            settings,
            store,
            gateway,
        }
    }

    /// Deliver one event to all of the user's active devices.
    ///
    /// Preference-disabled types and token-less users are silent no-ops.
    /// Terminal gateway failures are recorded on the notification record, not
    /// returned as errors; only store/cache failures propagate.
    pub async fn send(
        &self,
        ctx: &TenantContext,
        event: &NotificationEvent,
        notification_id: Uuid,
    ) -> anyhow::Result<()> {
        let prefs = self.settings.get_preferences(ctx, event.user_id).await?;
        if !prefs.allows(event.notification_type) {
            tracing::debug!(
                user_id = %event.user_id,
                notification_type = %event.notification_type,
                "Push disabled by preferences, skipping"
            );
            return Ok(());
        }

        let tokens = self.settings.get_active_tokens(ctx, event.user_id).await?;
        if tokens.is_empty() {
            tracing::debug!(user_id = %event.user_id, "No active push tokens, skipping");
            return Ok(());
        }

        let message = Self::build_message(event, &tokens);

        match self.send_with_retry(&message).await {
            Ok(tickets) => {
                self.apply_tickets(ctx, notification_id, &tokens, &tickets)
                    .await?;
            }
            Err(e) => {
                tracing::warn!(
                    notification_id = %notification_id,
                    user_id = %event.user_id,
                    error = %e,
                    "Push delivery failed"
                );
                self.store
                    .update_push_status(ctx, notification_id, PushStatus::Error, Some(&e.to_string()))
                    .await?;
            }
        }

        Ok(())
    }

    /// One batched request carrying every active token for the user.
    fn build_message(event: &NotificationEvent, tokens: &[PushToken]) -> PushMessage {
        let mut data = serde_json::Map::new();
        for (key, value) in &event.data {
            data.insert(key.clone(), serde_json::Value::String(value.clone()));
        }
        data.insert(
            "type".to_string(),
            serde_json::Value::String(event.notification_type.to_string()),
        );
        if let Some(entity_type) = &event.related_entity_type {
            data.insert(
                "related_entity_type".to_string(),
                serde_json::Value::String(entity_type.clone()),
            );
        }
        if let Some(entity_id) = event.related_entity_id {
            data.insert(
                "related_entity_id".to_string(),
                serde_json::Value::String(entity_id.to_string()),
            );
        }

        PushMessage {
            to: tokens.iter().map(|t| t.token.clone()).collect(),
            title: event.title.clone(),
            body: event.body.clone(),
            data: serde_json::Value::Object(data),
            priority: "high".to_string(),
            sound: "default".to_string(),
        }
    }

    /// Up to [`MAX_ATTEMPTS`] gateway calls; only transient failures retry.
    async fn send_with_retry(&self, message: &PushMessage) -> Result<Vec<PushTicket>, DeliveryError> {
        let mut attempt = 1;
        loop {
            match self.gateway.send(message).await {
                Ok(tickets) => return Ok(tickets),
                Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                    let delay = Self::backoff_delay(attempt);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient push failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Exponential backoff after the given attempt number, capped.
    fn backoff_delay(attempt: u32) -> Duration {
        let ms = BASE_BACKOFF_MS * 2u64.saturating_pow(attempt - 1);
        Duration::from_millis(ms.min(MAX_BACKOFF_MS))
    }

    /// Apply per-token tickets in positional order.
    ///
    /// A `DeviceNotRegistered` ticket deactivates exactly that device's token;
    /// the user's other tokens stay active. Status updates are idempotent.
    async fn apply_tickets(
        &self,
        ctx: &TenantContext,
        notification_id: Uuid,
        tokens: &[PushToken],
        tickets: &[PushTicket],
    ) -> anyhow::Result<()> {
        if tickets.len() != tokens.len() {
            tracing::warn!(
                notification_id = %notification_id,
                tokens = tokens.len(),
                tickets = tickets.len(),
                "Gateway ticket count does not match token count"
            );
        }

        for (token, ticket) in tokens.iter().zip(tickets.iter()) {
            if ticket.is_ok() {
                self.store
                    .update_push_status(ctx, notification_id, PushStatus::Ok, None)
                    .await?;
                tracing::info!(
                    notification_id = %notification_id,
                    token = %mask_token(&token.token),
                    "Push delivered"
                );
                continue;
            }

            let reason = ticket.error_reason().unwrap_or("unknown gateway error");
            if reason == DEVICE_NOT_REGISTERED {
                self.store.deactivate_token(ctx, &token.token).await?;
                if let Err(e) = self
                    .settings
                    .remove_push_token(token.user_id, &token.device_id)
                    .await
                {
                    tracing::warn!(
                        device_id = %token.device_id,
                        error = %e,
                        "Failed to evict deactivated token from cache"
                    );
                }
                tracing::info!(
                    user_id = %token.user_id,
                    device_id = %token.device_id,
                    token = %mask_token(&token.token),
                    "Deactivated unregistered push token"
                );
            }

            self.store
                .update_push_status(ctx, notification_id, PushStatus::Error, Some(reason))
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use herald_common::error::AppError;
    use herald_common::types::{DeviceType, NotificationPreferences, NotificationType};

    use crate::gateway::MockPushGateway;
    use crate::store::MockNotificationStore;

    /// Settings stub that serves fixed preferences/tokens and records evictions.
    struct StubSettings {
        prefs: NotificationPreferences,
        tokens: Vec<PushToken>,
        removed: tokio::sync::Mutex<Vec<(Uuid, String)>>,
    }

    impl StubSettings {
        fn new(prefs: NotificationPreferences, tokens: Vec<PushToken>) -> Self {
            Self {
                prefs,
                tokens,
                removed: tokio::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl UserSettingsSource for StubSettings {
        async fn get_preferences(
            &self,
            _ctx: &TenantContext,
            _user_id: Uuid,
        ) -> Result<NotificationPreferences, AppError> {
            Ok(self.prefs.clone())
        }

        async fn get_active_tokens(
            &self,
            _ctx: &TenantContext,
            _user_id: Uuid,
        ) -> Result<Vec<PushToken>, AppError> {
            Ok(self.tokens.clone())
        }

        async fn remove_push_token(
            &self,
            user_id: Uuid,
            device_id: &str,
        ) -> Result<(), AppError> {
            self.removed
                .lock()
                .await
                .push((user_id, device_id.to_string()));
            Ok(())
        }
    }

    fn make_token(user_id: Uuid, device_id: &str, token: &str) -> PushToken {
        PushToken {
            user_id,
            device_id: device_id.to_string(),
            token: token.to_string(),
            device_type: DeviceType::Ios,
            is_active: true,
            last_used_at: None,
        }
    }

    fn make_event(user_id: Uuid) -> NotificationEvent {
        NotificationEvent::new(
            Uuid::new_v4(),
            user_id,
            NotificationType::PostComment,
            "New comment",
            "Someone commented on your post",
        )
    }

    struct Fixture {
        delivery: DeliveryService,
        store: Arc<MockNotificationStore>,
        gateway: Arc<MockPushGateway>,
        settings: Arc<StubSettings>,
    }

    fn fixture(prefs: NotificationPreferences, tokens: Vec<PushToken>) -> Fixture {
        let store = Arc::new(MockNotificationStore::new());
        let gateway = Arc::new(MockPushGateway::new());
        let settings = Arc::new(StubSettings::new(prefs, tokens));
        let delivery = DeliveryService::new(settings.clone(), store.clone(), gateway.clone());
        Fixture {
            delivery,
            store,
            gateway,
            settings,
        }
    }

    #[tokio::test]
    async fn test_disabled_preference_skips_gateway() {
        let user_id = Uuid::new_v4();
        let mut prefs = NotificationPreferences::default_enabled(user_id);
        prefs.types.insert("post_comment".to_string(), false);
        let f = fixture(prefs, vec![make_token(user_id, "phone", "tok-1")]);

        let event = make_event(user_id);
        let ctx = TenantContext::new(event.org_id);
        f.delivery.send(&ctx, &event, Uuid::new_v4()).await.unwrap();

        assert_eq!(f.gateway.call_count().await, 0);
        assert!(f.store.status_updates().await.is_empty());
    }

    #[tokio::test]
    async fn test_no_tokens_skips_gateway() {
        let user_id = Uuid::new_v4();
        let f = fixture(NotificationPreferences::default_enabled(user_id), vec![]);

        let event = make_event(user_id);
        let ctx = TenantContext::new(event.org_id);
        f.delivery.send(&ctx, &event, Uuid::new_v4()).await.unwrap();

        assert_eq!(f.gateway.call_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retry_then_succeed() {
        let user_id = Uuid::new_v4();
        let f = fixture(
            NotificationPreferences::default_enabled(user_id),
            vec![make_token(user_id, "phone", "tok-1")],
        );
        f.gateway
            .push_outcome(Err(DeliveryError::Transient("503".to_string())))
            .await;
        f.gateway
            .push_outcome(Err(DeliveryError::Transient("503".to_string())))
            .await;
        f.gateway.push_outcome(Ok(vec![PushTicket::ok()])).await;

        let event = make_event(user_id);
        let ctx = TenantContext::new(event.org_id);
        let notification_id = Uuid::new_v4();
        f.delivery.send(&ctx, &event, notification_id).await.unwrap();

        assert_eq!(f.gateway.call_count().await, 3);
        let updates = f.store.status_updates().await;
        assert_eq!(updates, vec![(notification_id, PushStatus::Ok, None)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_exhaust_attempts() {
        let user_id = Uuid::new_v4();
        let f = fixture(
            NotificationPreferences::default_enabled(user_id),
            vec![make_token(user_id, "phone", "tok-1")],
        );
        for _ in 0..3 {
            f.gateway
                .push_outcome(Err(DeliveryError::Transient("timeout".to_string())))
                .await;
        }

        let event = make_event(user_id);
        let ctx = TenantContext::new(event.org_id);
        let notification_id = Uuid::new_v4();
        f.delivery.send(&ctx, &event, notification_id).await.unwrap();

        assert_eq!(f.gateway.call_count().await, 3);
        let updates = f.store.status_updates().await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1, PushStatus::Error);
    }

    #[tokio::test]
    async fn test_permanent_failure_does_not_retry() {
        let user_id = Uuid::new_v4();
        let f = fixture(
            NotificationPreferences::default_enabled(user_id),
            vec![make_token(user_id, "phone", "tok-1")],
        );
        f.gateway
            .push_outcome(Err(DeliveryError::Permanent(
                "gateway returned 400 Bad Request".to_string(),
            )))
            .await;

        let event = make_event(user_id);
        let ctx = TenantContext::new(event.org_id);
        let notification_id = Uuid::new_v4();
        f.delivery.send(&ctx, &event, notification_id).await.unwrap();

        assert_eq!(f.gateway.call_count().await, 1);
        let updates = f.store.status_updates().await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1, PushStatus::Error);
        assert!(updates[0].2.as_deref().unwrap().contains("400"));
    }

    #[tokio::test]
    async fn test_unregistered_device_deactivates_only_that_token() {
        let user_id = Uuid::new_v4();
        let f = fixture(
            NotificationPreferences::default_enabled(user_id),
            vec![
                make_token(user_id, "old-phone", "tok-dead"),
                make_token(user_id, "new-phone", "tok-live"),
            ],
        );
        f.gateway
            .push_outcome(Ok(vec![
                PushTicket::error(DEVICE_NOT_REGISTERED),
                PushTicket::ok(),
            ]))
            .await;

        let event = make_event(user_id);
        let ctx = TenantContext::new(event.org_id);
        f.delivery.send(&ctx, &event, Uuid::new_v4()).await.unwrap();

        assert_eq!(
            f.store.deactivated_tokens().await,
            vec!["tok-dead".to_string()]
        );
        assert_eq!(
            f.settings.removed.lock().await.clone(),
            vec![(user_id, "old-phone".to_string())]
        );
    }

    #[tokio::test]
    async fn test_other_ticket_error_keeps_token_active() {
        let user_id = Uuid::new_v4();
        let f = fixture(
            NotificationPreferences::default_enabled(user_id),
            vec![make_token(user_id, "phone", "tok-1")],
        );
        f.gateway
            .push_outcome(Ok(vec![PushTicket::error("MessageRateExceeded")]))
            .await;

        let event = make_event(user_id);
        let ctx = TenantContext::new(event.org_id);
        let notification_id = Uuid::new_v4();
        f.delivery.send(&ctx, &event, notification_id).await.unwrap();

        assert!(f.store.deactivated_tokens().await.is_empty());
        let updates = f.store.status_updates().await;
        assert_eq!(
            updates,
            vec![(
                notification_id,
                PushStatus::Error,
                Some("MessageRateExceeded".to_string())
            )]
        );
    }

    #[tokio::test]
    async fn test_batched_message_carries_all_tokens() {
        let user_id = Uuid::new_v4();
        let f = fixture(
            NotificationPreferences::default_enabled(user_id),
            vec![
                make_token(user_id, "phone", "tok-1"),
                make_token(user_id, "tablet", "tok-2"),
            ],
        );

        let event = make_event(user_id).with_data("post_slug", "hello");
        let ctx = TenantContext::new(event.org_id);
        f.delivery.send(&ctx, &event, Uuid::new_v4()).await.unwrap();

        let sent = f.gateway.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["tok-1", "tok-2"]);
        assert_eq!(sent[0].data["type"], "post_comment");
        assert_eq!(sent[0].data["post_slug"], "hello");
    }

    #[test]
    fn test_backoff_schedule_doubles_and_caps() {
        assert_eq!(DeliveryService::backoff_delay(1), Duration::from_secs(1));
        assert_eq!(DeliveryService::backoff_delay(2), Duration::from_secs(2));
        assert_eq!(DeliveryService::backoff_delay(3), Duration::from_secs(4));
        assert_eq!(DeliveryService::backoff_delay(4), Duration::from_secs(5));
        assert_eq!(DeliveryService::backoff_delay(10), Duration::from_secs(5));
    }
}
