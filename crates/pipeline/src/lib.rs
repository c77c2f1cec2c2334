//! Asynchronous push-notification delivery pipeline.
//!
//! Business events are enqueued onto a Redis-backed FIFO queue and drained by
//! a small fixed set of listener loops, each fanning out one short-lived tokio
//! task per message. A task persists the notification, consults the per-user
//! settings cache, and hands the batched device tokens to the push gateway
//! client, which retries transient failures and interprets per-token results.
//!
//! Components:
//! - [`queue::NotificationQueue`] — FIFO transport (enqueue surfaces errors,
//!   dequeue degrades silently)
//! - [`cache::UserCacheService`] — cache-aside preferences + per-device tokens
//! - [`delivery::DeliveryService`] — gateway calls, retry/backoff, per-token
//!   failure handling
//! - [`supervisor::WorkerSupervisor`] — listener loops and per-message fan-out

pub mod cache;
pub mod delivery;
pub mod gateway;
pub mod metrics;
pub mod queue;
pub mod store;
pub mod supervisor;

pub use cache::{UserCacheService, UserSettingsSource};
pub use delivery::DeliveryService;
pub use gateway::{HttpPushGateway, PushGateway, PushMessage, PushTicket};
pub use queue::NotificationQueue;
pub use store::{NotificationStore, PgNotificationStore};
pub use supervisor::{SupervisorState, WorkerSupervisor};
