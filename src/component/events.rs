use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Host-side events components can subscribe to.
///
/// The transport collaborator feeds connection lifecycle and inbound messages
/// onto the bus; components bound to an entity pick up whatever they care
/// about. `source` is the client id the message arrived from.
#[derive(Debug, Clone)]
pub enum HostEvent {
    ClientConnected {
        client: String,
    },
    ClientMessage {
        msg_type: String,
        data: Value,
        source: String,
    },
    ClientDisconnected {
        client: String,
    },
}

/// Broadcast event bus connecting the transport layer to components.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HostEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Delivers an event to all current subscribers; returns how many
    /// received it. An event with no subscribers is simply dropped.
    pub fn publish(&self, event: HostEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Subscribes with a callback driven by a background task. The returned
    /// handle owns the task: dropping it unsubscribes and stops the callback,
    /// so a component that releases its handles on `unbind_events` leaves no
    /// dangling subscriber behind.
    pub fn subscribe_with<F>(&self, mut callback: F) -> SubscriptionHandle
    where
        F: FnMut(HostEvent) + Send + 'static,
    {
        let mut subscription = self.subscribe();
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                callback(event);
            }
        });
        SubscriptionHandle { task }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

/// A live subscription to the event bus. Dropping it unsubscribes.
pub struct Subscription {
    rx: broadcast::Receiver<HostEvent>,
}

impl Subscription {
    /// Receives the next event, skipping over any the subscriber was too
    /// slow to keep. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<HostEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Owner handle for a callback subscription; aborts the driving task on drop.
pub struct SubscriptionHandle {
    task: JoinHandle<()>,
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
