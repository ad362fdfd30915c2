use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use super::kv::SessionGroup;
use crate::model::UserState;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Pushes updated state documents to whoever is listening for a session group.
///
/// Publishing is fire-and-forget: it is never awaited and a failed or
/// unobserved publish does not affect the operation that produced the state.
pub trait NotificationChannel: Send + Sync {
    fn publish(&self, group: &SessionGroup, state: &UserState);
}

#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub group: SessionGroup,
    pub state: Arc<UserState>,
}

/// In-process channel backed by `tokio::sync::broadcast`.
///
/// Slow receivers lag and lose the oldest updates; each update carries the
/// full document so only the latest one matters.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<StateUpdate>,
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateUpdate> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl NotificationChannel for BroadcastNotifier {
    fn publish(&self, group: &SessionGroup, state: &UserState) {
        let update = StateUpdate {
            group: group.clone(),
            state: Arc::new(state.clone()),
        };
        if self.sender.send(update).is_err() {
            debug!(group = %group, "no subscribers for state update");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Identity;

    #[tokio::test]
    async fn subscribers_receive_published_state() {
        let notifier = BroadcastNotifier::default();
        let mut rx = notifier.subscribe();
        let group = SessionGroup::for_identity(&Identity::new("bob", "t", "app"));

        let mut state = UserState::new();
        state.error = Some("visible".into());
        notifier.publish(&group, &state);

        let update = rx.recv().await.unwrap();
        assert_eq!(update.group, group);
        assert_eq!(update.state.error.as_deref(), Some("visible"));
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let notifier = BroadcastNotifier::new(0);
        let group = SessionGroup::for_identity(&Identity::new("bob", "t", "app"));
        notifier.publish(&group, &UserState::new());
        assert_eq!(notifier.receiver_count(), 0);
    }
}
