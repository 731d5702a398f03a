//! Event broadcast
//!
//! In-process pub/sub per tenant over broadcast channels, mirrored onto the
//! coordination store channel `events:{tenant}` for cross-node observers.
//! Delivery is best-effort and at-least-once; per-session FIFO order holds
//! because every event for a session is published from inside that
//! session's execution lock. Nothing here persists events: replay after a
//! disconnect goes through the session checkpoint log instead.

use crate::coordination::CoordinationStore;
use crate::models::OrchestratorEvent;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct EventBroadcaster {
    coordination: Arc<dyn CoordinationStore>,
    channels: Arc<RwLock<HashMap<Uuid, broadcast::Sender<OrchestratorEvent>>>>,
}

impl EventBroadcaster {
    pub fn new(coordination: Arc<dyn CoordinationStore>) -> Self {
        Self {
            coordination,
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn sender(&self, tenant_id: Uuid) -> broadcast::Sender<OrchestratorEvent> {
        let mut channels = self.channels.write().await;
        channels
            .entry(tenant_id)
            .or_insert_with(|| broadcast::channel(crate::constants::EVENT_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Publish to in-process subscribers and fan out cross-node.
    /// Best-effort on both paths: a full channel or an unreachable
    /// coordination store drops the event, it never fails the operation.
    pub async fn publish(&self, event: OrchestratorEvent) {
        let tenant_id = event.tenant_id();

        let sender = self.sender(tenant_id).await;
        let receivers = sender.send(event.clone()).unwrap_or(0);
        debug!(
            "published {} for tenant {tenant_id} to {receivers} local subscribers",
            event.event_type()
        );

        match serde_json::to_string(&event) {
            Ok(payload) => {
                if let Err(error) = self
                    .coordination
                    .publish(&format!("events:{tenant_id}"), &payload)
                    .await
                {
                    warn!("cross-node fan-out failed for tenant {tenant_id}: {error}");
                }
            }
            Err(error) => warn!("event serialization failed: {error}"),
        }
    }

    /// Subscribe to every event of one tenant.
    pub async fn subscribe(&self, tenant_id: Uuid) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender(tenant_id).await.subscribe()
    }

    /// Subscribe to a single session's events, in FIFO order.
    pub async fn subscribe_session(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
    ) -> mpsc::Receiver<OrchestratorEvent> {
        let mut source = self.subscribe(tenant_id).await;
        let (tx, rx) = mpsc::channel(crate::constants::EVENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(event) => {
                        if event.session_id() == Some(session_id)
                            && tx.send(event).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("session subscriber lagged, dropped {missed} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }

    /// Raw cross-node stream for one tenant, as JSON payloads from the
    /// coordination channel.
    pub async fn subscribe_cross_node(
        &self,
        tenant_id: Uuid,
    ) -> crate::Result<mpsc::Receiver<String>> {
        self.coordination
            .subscribe(&format!("events:{tenant_id}"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinationStore;
    use chrono::Utc;

    fn broadcaster() -> EventBroadcaster {
        EventBroadcaster::new(Arc::new(MemoryCoordinationStore::new()))
    }

    fn created(tenant_id: Uuid, session_id: Uuid) -> OrchestratorEvent {
        OrchestratorEvent::SessionCreated {
            tenant_id,
            session_id,
            title: "Implement fan-out".into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_local_subscribers_receive_events() {
        let broadcaster = broadcaster();
        let tenant_id = Uuid::new_v4();
        let mut rx = broadcaster.subscribe(tenant_id).await;

        broadcaster.publish(created(tenant_id, Uuid::new_v4())).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "session_created");
    }

    #[tokio::test]
    async fn test_tenant_channels_are_isolated() {
        let broadcaster = broadcaster();
        let tenant_a = Uuid::new_v4();
        let tenant_b = Uuid::new_v4();
        let mut rx_b = broadcaster.subscribe(tenant_b).await;

        broadcaster.publish(created(tenant_a, Uuid::new_v4())).await;
        broadcaster.publish(created(tenant_b, Uuid::new_v4())).await;

        let event = rx_b.recv().await.unwrap();
        assert_eq!(event.tenant_id(), tenant_b);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_session_filter_keeps_fifo_order() {
        let broadcaster = broadcaster();
        let tenant_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let other_session = Uuid::new_v4();
        let mut rx = broadcaster.subscribe_session(tenant_id, session_id).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        broadcaster.publish(created(tenant_id, session_id)).await;
        broadcaster.publish(created(tenant_id, other_session)).await;
        broadcaster
            .publish(OrchestratorEvent::SessionCompleted {
                tenant_id,
                session_id,
                success_rate: 1.0,
                timestamp: Utc::now(),
            })
            .await;

        assert_eq!(rx.recv().await.unwrap().event_type(), "session_created");
        assert_eq!(rx.recv().await.unwrap().event_type(), "session_completed");
    }

    #[tokio::test]
    async fn test_cross_node_fanout_carries_json() {
        let broadcaster = broadcaster();
        let tenant_id = Uuid::new_v4();
        let mut rx = broadcaster.subscribe_cross_node(tenant_id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        broadcaster.publish(created(tenant_id, Uuid::new_v4())).await;
        let payload = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["event_type"], "session_created");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let broadcaster = broadcaster();
        broadcaster
            .publish(created(Uuid::new_v4(), Uuid::new_v4()))
            .await;
    }
}
