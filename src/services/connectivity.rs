use tokio::sync::watch;

/// Fan-out point for connectivity transitions pushed by the host platform.
/// Subscribers are only woken when the reachability value actually changes.
pub struct ConnectivityMonitor {
    tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(initially_connected: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_connected);
        Self { tx }
    }

    /// Record the latest reachability. Returns true when this was a transition.
    pub fn report(&self, is_connected: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == is_connected {
                false
            } else {
                *current = is_connected;
                true
            }
        });
        if changed {
            tracing::info!(is_connected, "Connectivity changed");
        }
        changed
    }

    pub fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
