// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Domain Events
//
// Provides in-memory event streaming using tokio broadcast channels.
// Feeds the audit log subscriber in the daemon and test observers.
// Events are not persisted; the LeaseStore is the only durable state.

use crate::domain::agent::AgentId;
use crate::domain::events::{HandoffEvent, RegistryEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Unified domain event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    Registry(RegistryEvent),
    Handoff(HandoffEvent),
}

/// Event bus for publishing and subscribing to domain events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    /// Capacity determines how many events can be buffered before dropping old ones
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_registry_event(&self, event: RegistryEvent) {
        self.publish(DomainEvent::Registry(event));
    }

    pub fn publish_handoff_event(&self, event: HandoffEvent) {
        self.publish(DomainEvent::Handoff(event));
    }

    fn publish(&self, event: DomainEvent) {
        debug!("Publishing event: {:?}", event);

        // send() only fails when nobody is subscribed
        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all domain events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to registry events concerning a single agent
    pub fn subscribe_agent(&self, agent_id: AgentId) -> AgentEventReceiver {
        AgentEventReceiver {
            receiver: self.sender.subscribe(),
            agent_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Receiver for all domain events
pub struct EventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver for one agent's registry events (filtered)
pub struct AgentEventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
    agent_id: AgentId,
}

impl AgentEventReceiver {
    pub async fn recv(&mut self) -> Result<RegistryEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if let DomainEvent::Registry(registry_event) = event {
                if event_agent(&registry_event) == Some(&self.agent_id) {
                    return Ok(registry_event);
                }
            }
        }
    }
}

fn event_agent(event: &RegistryEvent) -> Option<&AgentId> {
    match event {
        RegistryEvent::AgentPublished { agent_id, .. }
        | RegistryEvent::AgentRenewed { agent_id, .. }
        | RegistryEvent::AgentUnpublished { agent_id, .. }
        | RegistryEvent::AgentExpired { agent_id, .. } => Some(agent_id),
        RegistryEvent::IndexDegraded { .. } | RegistryEvent::IndexResynced { .. } => None,
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lease::Revision;
    use chrono::Utc;

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        event_bus.publish_registry_event(RegistryEvent::AgentUnpublished {
            agent_id: AgentId::new("a1"),
            unpublished_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            DomainEvent::Registry(RegistryEvent::AgentUnpublished { agent_id, .. }) => {
                assert_eq!(agent_id, AgentId::new("a1"));
            }
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_agent_event_filtering() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe_agent(AgentId::new("a2"));

        event_bus.publish_registry_event(RegistryEvent::AgentExpired {
            agent_id: AgentId::new("a1"),
            revision: Revision(4),
            expired_at: Utc::now(),
        });
        event_bus.publish_registry_event(RegistryEvent::IndexDegraded {
            reason: "watch closed".to_string(),
            degraded_at: Utc::now(),
        });
        event_bus.publish_registry_event(RegistryEvent::AgentExpired {
            agent_id: AgentId::new("a2"),
            revision: Revision(5),
            expired_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            RegistryEvent::AgentExpired { agent_id, revision, .. } => {
                assert_eq!(agent_id, AgentId::new("a2"));
                assert_eq!(revision, Revision(5));
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_try_recv_empty() {
        let event_bus = EventBus::default();
        let mut receiver = event_bus.subscribe();
        assert!(matches!(receiver.try_recv(), Err(EventBusError::Empty)));
        assert_eq!(event_bus.subscriber_count(), 1);
    }
}
