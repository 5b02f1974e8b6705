use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Domain events emitted after the owning transaction commits. Consumers
/// are observational; nothing in the intake or provisioning paths depends
/// on a listener being present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Intake events
    OrderIngested {
        order_id: Uuid,
        payment_id: String,
        subscriptions_created: usize,
    },
    DuplicatePaymentIgnored {
        order_id: Uuid,
        payment_id: String,
    },
    CustomerCreated(Uuid),
    SubscriptionCreated(Uuid),

    // Provisioning events
    TaskEnqueued(Uuid),
    TaskDispatched(Uuid),
    TaskSucceeded {
        task_id: Uuid,
        subscription_id: Uuid,
    },
    TaskFailed {
        task_id: Uuid,
        subscription_id: Uuid,
        error: String,
    },
    TaskRetried(Uuid),
}

/// Drains the event channel, logging each event. Runs for the lifetime of
/// the process; exits when all senders are dropped.
pub async fn process_events(mut receiver: mpsc::Receiver<Event>) {
    info!("Event processor started");
    while let Some(event) = receiver.recv().await {
        match &event {
            Event::OrderIngested {
                order_id,
                payment_id,
                subscriptions_created,
            } => {
                info!(
                    order_id = %order_id,
                    payment_id = %payment_id,
                    subscriptions_created = subscriptions_created,
                    "order ingested"
                );
            }
            Event::DuplicatePaymentIgnored {
                order_id,
                payment_id,
            } => {
                info!(order_id = %order_id, payment_id = %payment_id, "duplicate payment delivery ignored");
            }
            Event::TaskFailed {
                task_id,
                subscription_id,
                error,
            } => {
                warn!(
                    task_id = %task_id,
                    subscription_id = %subscription_id,
                    error = %error,
                    "provisioning task failed"
                );
            }
            other => {
                info!(event = ?other, "domain event");
            }
        }
    }
    info!("Event processor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_delivers_event_to_receiver() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);

        let task_id = Uuid::new_v4();
        sender
            .send(Event::TaskEnqueued(task_id))
            .await
            .expect("send failed");

        match rx.recv().await {
            Some(Event::TaskEnqueued(id)) => assert_eq!(id, task_id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_fails_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);

        let result = sender.send(Event::TaskRetried(Uuid::new_v4())).await;
        assert!(result.is_err());
    }
}
