use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

/// Cached views a client should refetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Invalidation {
    ProjectImages { user_id: Uuid, project_id: Uuid },
    CreditBalance { user_id: Uuid },
    UserStats { user_id: Uuid },
}

impl Invalidation {
    pub fn user_id(&self) -> Uuid {
        match self {
            Invalidation::ProjectImages { user_id, .. }
            | Invalidation::CreditBalance { user_id }
            | Invalidation::UserStats { user_id } => *user_id,
        }
    }
}

#[derive(Clone)]
pub struct InvalidationBus {
    sender: broadcast::Sender<Invalidation>,
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InvalidationBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Fire and forget; having no subscribers is not an error.
    pub fn publish(&self, signal: Invalidation) {
        debug!(?signal, "cache invalidation");
        let _ = self.sender.send(signal);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Invalidation> {
        self.sender.subscribe()
    }
}
