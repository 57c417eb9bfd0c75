use tokio::sync::mpsc;

/// External events that make the notifier act.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// A push notification arrived; `id` identifies it to the backend when known.
    Push { id: Option<i64> },
    /// Periodic liveness poll.
    Poll,
    /// The user, or the indicator's dismiss byte, acknowledged the active message.
    Ack,
    /// The push substrate issued a new device token.
    DeviceToken(String),
    Shutdown,
}

/// Cloneable sender side of the notifier's trigger queue.
#[derive(Clone, Debug)]
pub struct TriggerHandle {
    tx: mpsc::UnboundedSender<Trigger>,
}

impl TriggerHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Trigger>) -> Self {
        Self { tx }
    }

    /// Queue a trigger. Returns `false` once the notifier loop has stopped.
    pub fn send(&self, trigger: Trigger) -> bool {
        self.tx.send(trigger).is_ok()
    }

    pub fn push(&self, id: Option<i64>) -> bool {
        self.send(Trigger::Push { id })
    }

    pub fn poll(&self) -> bool {
        self.send(Trigger::Poll)
    }

    pub fn ack(&self) -> bool {
        self.send(Trigger::Ack)
    }

    pub fn device_token(&self, token: impl Into<String>) -> bool {
        self.send(Trigger::DeviceToken(token.into()))
    }

    pub fn shutdown(&self) -> bool {
        self.send(Trigger::Shutdown)
    }
}
