//! Online/offline state
//!
//! Published on a watch channel so the sync loop can react to the
//! offline → online transition without polling.

use tokio::sync::watch;

pub struct Connectivity {
    tx: watch::Sender<bool>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    /// Returns `true` when the state actually changed
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            if online {
                tracing::info!("Connection restored");
            } else {
                tracing::warn!("Connection lost, cart changes will be queued");
            }
        }
        changed
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transitions_are_published_once() {
        let connectivity = Connectivity::default();
        let mut rx = connectivity.subscribe();

        assert!(!connectivity.set_online(true));
        assert!(!rx.has_changed().unwrap());

        assert!(connectivity.set_online(false));
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
        assert!(!connectivity.is_online());
    }
}
