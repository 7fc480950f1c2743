//! Connectivity signal.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

/// Broadcasts connectivity changes to the command queue.
///
/// The platform layer calls [`set`](Reachability::set) whenever the network
/// comes or goes.
///
/// Clones share one signal.
#[derive(Debug, Clone)]
pub struct Reachability {
    tx: Arc<watch::Sender<Connectivity>>,
}

impl Default for Reachability {
    fn default() -> Self {
        Self::new(Connectivity::Online)
    }
}

impl Reachability {
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Connectivity {
        *self.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current() == Connectivity::Online
    }

    /// Report the current connectivity. Subscribers are only woken by actual
    /// changes.
    pub fn set(&self, connectivity: Connectivity) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == connectivity {
                false
            } else {
                *current = connectivity;
                true
            }
        });
        if changed {
            tracing::info!(?connectivity, "Connectivity changed");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_changes_only() {
        let reachability = Reachability::default();
        let mut rx = reachability.subscribe();

        reachability.set(Connectivity::Online);
        assert!(!rx.has_changed().unwrap());

        reachability.set(Connectivity::Offline);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Connectivity::Offline);
        assert!(!reachability.is_online());
    }

    #[tokio::test]
    async fn clones_share_one_signal() {
        let reachability = Reachability::new(Connectivity::Offline);
        let platform = reachability.clone();
        let mut rx = reachability.subscribe();

        platform.set(Connectivity::Online);
        rx.changed().await.unwrap();
        assert!(reachability.is_online());
    }
}
