//! Message Bus for orchestrator events
//!
//! The MessageBus is the in-process pub/sub channel the orchestrator uses to
//! announce task lifecycle changes, delegation progress and mirrored audit
//! entries. Subscribers get bounded channels; a subscriber that falls behind
//! loses events instead of stalling the publisher.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Channel buffer size for bounded channels
const CHANNEL_BUFFER_SIZE: usize = 100;

/// Event types that can be published on the message bus
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EventType {
    /// Task accepted by `receive_task`
    TaskReceived,
    /// Task execution started
    TaskStarted,
    /// Task finished successfully
    TaskCompleted,
    /// Task finished without success
    TaskFailed,
    /// A delegation record changed status
    DelegationUpdated,
    /// A plan execution group finished
    PlanProgress,
    /// An audit entry was recorded
    AuditRecorded,
    /// Orchestrator reached IDLE after start
    OrchestratorStarted,
    /// Orchestrator stopped
    OrchestratorStopped,
    /// Subscribe to all event types
    All,
}

/// Events that can be published on the message bus
#[derive(Debug, Clone)]
pub enum Event {
    TaskReceived {
        task_id: String,
        orchestrator_id: String,
    },
    TaskStarted {
        task_id: String,
        prompt: String,
    },
    TaskCompleted {
        task_id: String,
        result: serde_json::Value,
    },
    TaskFailed {
        task_id: String,
        error: String,
    },
    DelegationUpdated {
        delegation_id: String,
        task_id: String,
        specialist_id: String,
        status: String,
    },
    PlanProgress {
        task_id: String,
        plan_id: String,
        progress: f64,
    },
    AuditRecorded {
        action: String,
        actor: String,
        target: String,
        severity: String,
    },
    OrchestratorStarted {
        orchestrator_id: String,
    },
    OrchestratorStopped {
        orchestrator_id: String,
    },
}

impl Event {
    /// Get the event type for this event
    pub fn event_type(&self) -> EventType {
        match self {
            Event::TaskReceived { .. } => EventType::TaskReceived,
            Event::TaskStarted { .. } => EventType::TaskStarted,
            Event::TaskCompleted { .. } => EventType::TaskCompleted,
            Event::TaskFailed { .. } => EventType::TaskFailed,
            Event::DelegationUpdated { .. } => EventType::DelegationUpdated,
            Event::PlanProgress { .. } => EventType::PlanProgress,
            Event::AuditRecorded { .. } => EventType::AuditRecorded,
            Event::OrchestratorStarted { .. } => EventType::OrchestratorStarted,
            Event::OrchestratorStopped { .. } => EventType::OrchestratorStopped,
        }
    }
}

/// Message bus for pub/sub communication between orchestrator components
pub struct MessageBus {
    channels: Arc<Mutex<HashMap<EventType, Vec<mpsc::Sender<Event>>>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe to a specific event type, or `EventType::All`
    pub async fn subscribe(&self, event_type: EventType) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let mut channels = self.channels.lock().await;
        channels.entry(event_type).or_default().push(tx);
        rx
    }

    /// Publish an event to the subscribers of its type and to `All` subscribers
    ///
    /// Never waits on a slow subscriber: a full channel drops the event for
    /// that subscriber, a closed channel is pruned.
    pub async fn publish(&self, event: Event) {
        let mut channels = self.channels.lock().await;
        let event_type = event.event_type();

        for key in [event_type, EventType::All] {
            if let Some(subscribers) = channels.get_mut(&key) {
                subscribers.retain(|tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        debug!("Subscriber for {:?} is full, dropping event", key);
                        true
                    }
                    Err(TrySendError::Closed(_)) => false,
                });
            }
        }
    }

    /// Number of live subscribers for an event type
    pub async fn subscriber_count(&self, event_type: EventType) -> usize {
        let channels = self.channels.lock().await;
        channels
            .get(&event_type)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_and_publish() {
        let bus = MessageBus::new();
        let mut rx = bus.subscribe(EventType::TaskStarted).await;

        bus.publish(Event::TaskStarted {
            task_id: "task-1".to_string(),
            prompt: "summarize this".to_string(),
        })
        .await;

        match rx.recv().await.unwrap() {
            Event::TaskStarted { task_id, prompt } => {
                assert_eq!(task_id, "task-1");
                assert_eq!(prompt, "summarize this");
            }
            _ => panic!("Wrong event type received"),
        }
    }

    #[tokio::test]
    async fn test_all_event_type() {
        let bus = MessageBus::new();
        let mut rx_all = bus.subscribe(EventType::All).await;
        let mut rx_specific = bus.subscribe(EventType::PlanProgress).await;

        bus.publish(Event::PlanProgress {
            task_id: "task-3".to_string(),
            plan_id: "plan_abc".to_string(),
            progress: 0.5,
        })
        .await;

        assert!(matches!(
            rx_all.recv().await.unwrap(),
            Event::PlanProgress { .. }
        ));
        assert!(matches!(
            rx_specific.recv().await.unwrap(),
            Event::PlanProgress { .. }
        ));
    }

    #[tokio::test]
    async fn test_different_event_types() {
        let bus = MessageBus::new();
        let mut rx_received = bus.subscribe(EventType::TaskReceived).await;
        let mut rx_failed = bus.subscribe(EventType::TaskFailed).await;

        bus.publish(Event::TaskReceived {
            task_id: "task-4".to_string(),
            orchestrator_id: "kommandant_1".to_string(),
        })
        .await;
        bus.publish(Event::TaskFailed {
            task_id: "task-5".to_string(),
            error: "boom".to_string(),
        })
        .await;

        match rx_received.recv().await.unwrap() {
            Event::TaskReceived { task_id, .. } => assert_eq!(task_id, "task-4"),
            _ => panic!("Wrong event type"),
        }
        match rx_failed.recv().await.unwrap() {
            Event::TaskFailed { task_id, .. } => assert_eq!(task_id, "task-5"),
            _ => panic!("Wrong event type"),
        }

        assert!(rx_received.try_recv().is_err());
        assert!(rx_failed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_subscriber_does_not_block_publisher() {
        let bus = MessageBus::new();
        let mut rx = bus.subscribe(EventType::OrchestratorStarted).await;

        for _ in 0..CHANNEL_BUFFER_SIZE + 10 {
            bus.publish(Event::OrchestratorStarted {
                orchestrator_id: "kommandant_1".to_string(),
            })
            .await;
        }

        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, CHANNEL_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_closed_subscribers_are_pruned() {
        let bus = MessageBus::new();
        let rx = bus.subscribe(EventType::TaskCompleted).await;
        assert_eq!(bus.subscriber_count(EventType::TaskCompleted).await, 1);

        drop(rx);
        bus.publish(Event::TaskCompleted {
            task_id: "t".to_string(),
            result: serde_json::json!({}),
        })
        .await;

        assert_eq!(bus.subscriber_count(EventType::TaskCompleted).await, 0);
    }
}
