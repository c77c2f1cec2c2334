use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Business event types that can produce a push notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    MembershipApproved,
    MembershipRejected,
    PostComment,
    PostLike,
    EventReminder,
    Announcement,
}

impl NotificationType {
    /// Key under which this type is toggled in a user's preferences.
    pub fn preference_key(&self) -> &'static str {
        match self {
            NotificationType::MembershipApproved => "membership_approved",
            NotificationType::MembershipRejected => "membership_rejected",
            NotificationType::PostComment => "post_comment",
            NotificationType::PostLike => "post_like",
            NotificationType::EventReminder => "event_reminder",
            NotificationType::Announcement => "announcement",
        }
    }
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.preference_key())
    }
}

/// Push delivery status of a persisted notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PushStatus {
    Pending,
    Ok,
    Error,
}

impl std::fmt::Display for PushStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushStatus::Pending => write!(f, "pending"),
            PushStatus::Ok => write!(f, "ok"),
            PushStatus::Error => write!(f, "error"),
        }
    }
}

/// Device platform a push token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Ios,
    Android,
    Web,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Ios => write!(f, "ios"),
            DeviceType::Android => write!(f, "android"),
            DeviceType::Web => write!(f, "web"),
        }
    }
}

/// Tenant scope for a unit of processing.
///
/// Built from the event inside each per-message task and passed explicitly to
/// every persistence call, so tenant state never outlives the task that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    pub org_id: Uuid,
}

impl TenantContext {
    pub fn new(org_id: Uuid) -> Self {
        Self { org_id }
    }
}

/// A notification event as enqueued by a business-logic producer.
///
/// Immutable once created; this is the queue payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub org_id: Uuid,
    pub user_id: Uuid,
    pub notification_type: NotificationType,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub related_entity_type: Option<String>,
    #[serde(default)]
    pub related_entity_id: Option<Uuid>,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

impl NotificationEvent {
    pub fn new(
        org_id: Uuid,
        user_id: Uuid,
        notification_type: NotificationType,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            org_id,
            user_id,
            notification_type,
            title: title.into(),
            body: body.into(),
            related_entity_type: None,
            related_entity_id: None,
            data: HashMap::new(),
        }
    }

    /// Attach the entity this notification is about (e.g. a post id).
    pub fn with_related(mut self, entity_type: impl Into<String>, entity_id: Uuid) -> Self {
        self.related_entity_type = Some(entity_type.into());
        self.related_entity_id = Some(entity_id);
        self
    }

    /// Attach an extra data entry carried through to the device.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// A persisted notification, created exactly once per processed event.
///
/// `push_status` and `push_sent` are mutated in place by the delivery layer.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub notification_type: NotificationType,
    pub title: String,
    pub body: String,
    pub is_read: bool,
    pub push_sent: bool,
    pub push_status: PushStatus,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl NotificationRecord {
    /// Build a pending record from an event, folding the event's data map and
    /// related-entity reference into the metadata column.
    pub fn from_event(event: &NotificationEvent) -> Self {
        let mut metadata = serde_json::Map::new();
        for (key, value) in &event.data {
            metadata.insert(key.clone(), serde_json::Value::String(value.clone()));
        }
        if let Some(entity_type) = &event.related_entity_type {
            metadata.insert(
                "related_entity_type".to_string(),
                serde_json::Value::String(entity_type.clone()),
            );
        }
        if let Some(entity_id) = event.related_entity_id {
            metadata.insert(
                "related_entity_id".to_string(),
                serde_json::Value::String(entity_id.to_string()),
            );
        }

        Self {
            id: Uuid::new_v4(),
            user_id: event.user_id,
            notification_type: event.notification_type,
            title: event.title.clone(),
            body: event.body.clone(),
            is_read: false,
            push_sent: false,
            push_status: PushStatus::Pending,
            error_message: None,
            metadata: serde_json::Value::Object(metadata),
            created_at: Utc::now(),
        }
    }
}

/// An active device push token.
///
/// Device-scoped: cache entries for two devices of the same user expire
/// independently, and removing one never touches the other.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PushToken {
    pub user_id: Uuid,
    pub device_id: String,
    pub token: String,
    pub device_type: DeviceType,
    pub is_active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Per-user notification preferences.
///
/// Unknown type keys default to enabled; only an explicit `false` (or the
/// global push switch) suppresses delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPreferences {
    pub user_id: Uuid,
    pub enable_push: bool,
    #[serde(default)]
    pub types: HashMap<String, bool>,
}

impl NotificationPreferences {
    /// Default-enabled preferences, persisted on first read of a new user.
    pub fn default_enabled(user_id: Uuid) -> Self {
        Self {
            user_id,
            enable_push: true,
            types: HashMap::new(),
        }
    }

    /// Whether a notification of this type may be pushed to the user.
    pub fn allows(&self, notification_type: NotificationType) -> bool {
        self.enable_push
            && *self
                .types
                .get(notification_type.preference_key())
                .unwrap_or(&true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferences_default_to_enabled() {
        let prefs = NotificationPreferences::default_enabled(Uuid::new_v4());
        assert!(prefs.allows(NotificationType::PostComment));
        assert!(prefs.allows(NotificationType::Announcement));
    }

    #[test]
    fn test_preferences_explicit_disable() {
        let mut prefs = NotificationPreferences::default_enabled(Uuid::new_v4());
        prefs.types.insert("post_comment".to_string(), false);
        assert!(!prefs.allows(NotificationType::PostComment));
        assert!(prefs.allows(NotificationType::PostLike));
    }

    #[test]
    fn test_preferences_global_switch_wins() {
        let mut prefs = NotificationPreferences::default_enabled(Uuid::new_v4());
        prefs.enable_push = false;
        prefs.types.insert("post_comment".to_string(), true);
        assert!(!prefs.allows(NotificationType::PostComment));
    }

    #[test]
    fn test_record_from_event_starts_pending() {
        let event = NotificationEvent::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            NotificationType::PostComment,
            "New comment",
            "Someone commented on your post",
        )
        .with_related("post", Uuid::new_v4())
        .with_data("post_slug", "hello-world");

        let record = NotificationRecord::from_event(&event);
        assert_eq!(record.push_status, PushStatus::Pending);
        assert!(!record.push_sent);
        assert!(!record.is_read);
        assert_eq!(record.user_id, event.user_id);
        assert_eq!(record.metadata["post_slug"], "hello-world");
        assert_eq!(record.metadata["related_entity_type"], "post");
    }

    #[test]
    fn test_event_serde_wire_shape() {
        let event = NotificationEvent::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            NotificationType::MembershipApproved,
            "Welcome",
            "Your membership was approved",
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["notification_type"], "membership_approved");
        let parsed: NotificationEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.title, "Welcome");
    }
}
