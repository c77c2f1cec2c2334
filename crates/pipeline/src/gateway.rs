//! Push gateway client.
//!
//! The gateway accepts one batched request per user (`to` holds every active
//! device token) and answers with a ticket per token, positionally aligned
//! with the request. Errors are classified at this edge: connect/timeout
//! failures, HTTP 5xx and HTTP 429 are transient and retryable; any other
//! non-success status is permanent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Gateway error reason that permanently invalidates a device token.
pub const DEVICE_NOT_REGISTERED: &str = "DeviceNotRegistered";

/// Delivery failure classification driving the retry policy.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    #[error("transient push gateway failure: {0}")]
    Transient(String),

    #[error("permanent push gateway failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }
}

/// One batched push request for all of a user's devices.
#[derive(Debug, Clone, Serialize)]
pub struct PushMessage {
    pub to: Vec<String>,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
    pub priority: String,
    pub sound: String,
}

/// Per-token delivery ticket, positionally aligned with `PushMessage::to`.
#[derive(Debug, Clone, Deserialize)]
pub struct PushTicket {
    pub status: String,
    #[serde(default)]
    pub details: Option<PushTicketDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushTicketDetails {
    #[serde(default)]
    pub error: Option<String>,
}

impl PushTicket {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    pub fn error_reason(&self) -> Option<&str> {
        self.details.as_ref().and_then(|d| d.error.as_deref())
    }

    /// An "ok" ticket, for tests.
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            details: None,
        }
    }

    /// An "error" ticket with a reason, for tests.
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            details: Some(PushTicketDetails {
                error: Some(reason.into()),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    data: Vec<PushTicket>,
}

/// Outbound push gateway.
#[async_trait]
pub trait PushGateway: Send + Sync {
    /// Send one batched message, returning a ticket per token.
    async fn send(&self, message: &PushMessage) -> Result<Vec<PushTicket>, DeliveryError>;

    /// Probe gateway reachability.
    async fn health_check(&self) -> Result<(), DeliveryError>;

    fn name(&self) -> &'static str;
}

/// HTTP JSON gateway client.
pub struct HttpPushGateway {
    client: reqwest::Client,
    url: String,
    auth_token: Option<String>,
}

impl HttpPushGateway {
    pub fn new(url: impl Into<String>, auth_token: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
            auth_token,
        })
    }
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    async fn send(&self, message: &PushMessage) -> Result<Vec<PushTicket>, DeliveryError> {
        let mut request = self.client.post(&self.url).json(message);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(DeliveryError::Transient(format!("gateway returned {status}")));
        }
        if !status.is_success() {
            return Err(DeliveryError::Permanent(format!("gateway returned {status}")));
        }

        let body: PushResponse = response
            .json()
            .await
            .map_err(|e| DeliveryError::Transient(format!("unreadable gateway response: {e}")))?;

        Ok(body.data)
    }

    async fn health_check(&self) -> Result<(), DeliveryError> {
        // Any HTTP answer proves reachability; only transport failures count.
        self.client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("gateway unreachable: {e}")))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Mask a token for logging, keeping a short prefix and suffix.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 12 {
        return "***".to_string();
    }
    let prefix: String = chars[..8].iter().collect();
    let suffix: String = chars[chars.len() - 4..].iter().collect();
    format!("{prefix}…{suffix}")
}

/// Mock gateway that records requests and replays scripted outcomes, for tests.
///
/// With no scripted outcomes, every call succeeds with an "ok" ticket per token.
#[derive(Default)]
pub struct MockPushGateway {
    outcomes: tokio::sync::Mutex<std::collections::VecDeque<ScriptedOutcome>>,
    requests: tokio::sync::Mutex<Vec<PushMessage>>,
}

struct ScriptedOutcome {
    result: Result<Vec<PushTicket>, DeliveryError>,
    delay: Option<std::time::Duration>,
}

impl MockPushGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next call's outcome.
    pub async fn push_outcome(&self, result: Result<Vec<PushTicket>, DeliveryError>) {
        self.outcomes
            .lock()
            .await
            .push_back(ScriptedOutcome {
                result,
                delay: None,
            });
    }

    /// Script the next call's outcome, delivered after a delay.
    pub async fn push_delayed_outcome(
        &self,
        result: Result<Vec<PushTicket>, DeliveryError>,
        delay: std::time::Duration,
    ) {
        self.outcomes.lock().await.push_back(ScriptedOutcome {
            result,
            delay: Some(delay),
        });
    }

    pub async fn sent(&self) -> Vec<PushMessage> {
        self.requests.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

#[async_trait]
impl PushGateway for MockPushGateway {
    async fn send(&self, message: &PushMessage) -> Result<Vec<PushTicket>, DeliveryError> {
        self.requests.lock().await.push(message.clone());

        let outcome = self.outcomes.lock().await.pop_front();
        match outcome {
            Some(scripted) => {
                if let Some(delay) = scripted.delay {
                    tokio::time::sleep(delay).await;
                }
                scripted.result
            }
            None => Ok(message.to.iter().map(|_| PushTicket::ok()).collect()),
        }
    }

    async fn health_check(&self) -> Result<(), DeliveryError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_token_keeps_prefix_and_suffix() {
        let masked = mask_token("ExponentPushToken[abcdefghijklmnop]");
        assert_eq!(masked, "Exponent…nop]");
        assert!(!masked.contains("abcdefghijkl"));
    }

    #[test]
    fn test_mask_token_short_values_fully_hidden() {
        assert_eq!(mask_token("short"), "***");
        assert_eq!(mask_token(""), "***");
    }

    #[test]
    fn test_push_message_wire_shape() {
        let message = PushMessage {
            to: vec!["tok-1".to_string(), "tok-2".to_string()],
            title: "New comment".to_string(),
            body: "Someone replied".to_string(),
            data: serde_json::json!({"type": "post_comment"}),
            priority: "high".to_string(),
            sound: "default".to_string(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["to"].as_array().unwrap().len(), 2);
        assert_eq!(json["priority"], "high");
        assert_eq!(json["sound"], "default");
    }

    #[test]
    fn test_ticket_response_parsing() {
        let raw = r#"{"data":[{"status":"ok"},{"status":"error","details":{"error":"DeviceNotRegistered"}}]}"#;
        let response: PushResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.data.len(), 2);
        assert!(response.data[0].is_ok());
        assert_eq!(
            response.data[1].error_reason(),
            Some(DEVICE_NOT_REGISTERED)
        );
    }

    #[tokio::test]
    async fn test_mock_gateway_defaults_to_ok_per_token() {
        let gateway = MockPushGateway::new();
        let message = PushMessage {
            to: vec!["a".to_string(), "b".to_string()],
            title: String::new(),
            body: String::new(),
            data: serde_json::Value::Null,
            priority: "high".to_string(),
            sound: "default".to_string(),
        };
        let tickets = gateway.send(&message).await.unwrap();
        assert_eq!(tickets.len(), 2);
        assert!(tickets.iter().all(|t| t.is_ok()));
        assert_eq!(gateway.call_count().await, 1);
    }
}
