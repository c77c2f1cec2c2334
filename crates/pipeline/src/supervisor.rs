//! Worker supervisor: bounded listener loops, unbounded per-message fan-out.
//!
//! A small fixed number of listener loops own the blocking "is there work"
//! decision; every dequeued message is handed to a fresh short-lived tokio
//! task, so one slow delivery never stalls queue draining. Shutdown is
//! cooperative: listeners are signalled and joined within a bounded window,
//! in-flight per-message tasks drain best-effort and are never cancelled —
//! an accepted incomplete-drain trade-off, not a bug.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use herald_common::types::{NotificationEvent, NotificationRecord, TenantContext};

use crate::delivery::DeliveryService;
use crate::metrics;
use crate::queue::NotificationQueue;
use crate::store::NotificationStore;

/// Lifecycle of the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SupervisorState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl SupervisorState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SupervisorState::Starting,
            2 => SupervisorState::Running,
            3 => SupervisorState::Stopping,
            _ => SupervisorState::Stopped,
        }
    }
}

/// Drives the listener loops and fans out per-message tasks.
pub struct WorkerSupervisor {
    queue: Arc<NotificationQueue>,
    store: Arc<dyn NotificationStore>,
    delivery: Arc<DeliveryService>,
    listener_count: usize,
    state: AtomicU8,
    active_workers: Arc<AtomicUsize>,
    shutdown: watch::Sender<bool>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerSupervisor {
    pub fn new(
        queue: NotificationQueue,
        store: Arc<dyn NotificationStore>,
        delivery: Arc<DeliveryService>,
        listener_count: usize,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            queue: Arc::new(queue),
            store,
            delivery,
            listener_count,
            state: AtomicU8::new(SupervisorState::Stopped as u8),
            active_workers: Arc::new(AtomicUsize::new(0)),
            shutdown,
            handles: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> SupervisorState {
        SupervisorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Number of per-message tasks currently in flight.
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Spawn the listener loops. No-op unless currently stopped.
    pub async fn start(&self) {
        if self
            .state
            .compare_exchange(
                SupervisorState::Stopped as u8,
                SupervisorState::Starting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            tracing::warn!(state = ?self.state(), "Supervisor already started, ignoring");
            return;
        }

        let _ = self.shutdown.send(false);

        let mut handles = self.handles.lock().await;
        for listener_id in 0..self.listener_count {
            let queue = self.queue.clone();
            let store = self.store.clone();
            let delivery = self.delivery.clone();
            let active = self.active_workers.clone();
            let shutdown_rx = self.shutdown.subscribe();

            handles.push(tokio::spawn(Self::listener_loop(
                listener_id,
                queue,
                store,
                delivery,
                active,
                shutdown_rx,
            )));
        }

        self.state
            .store(SupervisorState::Running as u8, Ordering::SeqCst);
        tracing::info!(listeners = self.listener_count, "Worker supervisor started");
    }

    /// Signal the listeners and join them within a bounded window.
    ///
    /// The window is the dequeue timeout plus a small grace period, so a
    /// listener blocked in `BLPOP` always gets one chance to observe the
    /// signal. In-flight per-message tasks keep running to completion.
    pub async fn stop(&self) {
        if self
            .state
            .compare_exchange(
                SupervisorState::Running as u8,
                SupervisorState::Stopping as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            tracing::warn!(state = ?self.state(), "Supervisor not running, ignoring stop");
            return;
        }

        let _ = self.shutdown.send(true);

        let join_timeout = self.queue.pop_timeout() + Duration::from_secs(1);
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if tokio::time::timeout(join_timeout, handle).await.is_err() {
                tracing::warn!("Listener did not stop within timeout, abandoning join");
            }
        }

        self.state
            .store(SupervisorState::Stopped as u8, Ordering::SeqCst);
        tracing::info!(
            in_flight = self.active_workers(),
            "Worker supervisor stopped"
        );
    }

    async fn listener_loop(
        listener_id: usize,
        queue: Arc<NotificationQueue>,
        store: Arc<dyn NotificationStore>,
        delivery: Arc<DeliveryService>,
        active: Arc<AtomicUsize>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        tracing::info!(listener = listener_id, "Notification listener started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            metrics::queue_depth(queue.len().await);

            let event = tokio::select! {
                _ = shutdown_rx.changed() => break,
                event = queue.dequeue() => event,
            };

            let Some(event) = event else {
                continue;
            };

            let guard = WorkerGuard::new(active.clone());
            let store = store.clone();
            let delivery = delivery.clone();
            tokio::spawn(async move {
                let _guard = guard;
                Self::process_event(store, delivery, event).await;
            });
        }

        tracing::info!(listener = listener_id, "Notification listener stopped");
    }

    /// Process one dequeued event. Never returns an error: a failing message
    /// is logged and counted, and must not affect the listener or its peers.
    async fn process_event(
        store: Arc<dyn NotificationStore>,
        delivery: Arc<DeliveryService>,
        event: NotificationEvent,
    ) {
        let started = Instant::now();
        let notification_type = event.notification_type;

        // Tenant scope lives and dies with this task
        let ctx = TenantContext::new(event.org_id);
        let record = NotificationRecord::from_event(&event);
        let notification_id = record.id;

        let result: anyhow::Result<()> = async {
            store.insert_record(&ctx, &record).await?;
            delivery.send(&ctx, &event, notification_id).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                metrics::processed(notification_type, "ok");
            }
            Err(e) => {
                tracing::error!(
                    notification_id = %notification_id,
                    user_id = %event.user_id,
                    notification_type = %notification_type,
                    error = %e,
                    "Failed to process notification event"
                );
                metrics::processed(notification_type, "error");
            }
        }

        metrics::processing_duration(notification_type, started.elapsed());
    }
}

/// Counts a per-message task as active for exactly its lifetime.
///
/// Decrements on drop, so the gauge stays accurate on every exit path,
/// including panics inside the task.
struct WorkerGuard {
    active: Arc<AtomicUsize>,
}

impl WorkerGuard {
    fn new(active: Arc<AtomicUsize>) -> Self {
        let count = active.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::active_workers(count);
        Self { active }
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let count = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::active_workers(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            SupervisorState::Stopped,
            SupervisorState::Starting,
            SupervisorState::Running,
            SupervisorState::Stopping,
        ] {
            assert_eq!(SupervisorState::from_u8(state as u8), state);
        }
    }

    #[tokio::test]
    async fn test_worker_guard_decrements_on_drop() {
        let active = Arc::new(AtomicUsize::new(0));
        {
            let _guard = WorkerGuard::new(active.clone());
            assert_eq!(active.load(Ordering::SeqCst), 1);
        }
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_worker_guard_decrements_on_panic() {
        let active = Arc::new(AtomicUsize::new(0));
        let guard = WorkerGuard::new(active.clone());

        let handle = tokio::spawn(async move {
            let _guard = guard;
            panic!("worker blew up");
        });
        assert!(handle.await.is_err());

        assert_eq!(active.load(Ordering::SeqCst), 0);
    }
}
