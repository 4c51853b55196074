//! Change notifications for the serving layer.
//!
//! Every store mutation that should reach a browser sends the affected name
//! on a broadcast channel. Any number of subscribers (one per connected
//! reload socket, typically) can listen.

use tokio::sync::broadcast;

/// Broadcasts names of store entries that just changed.
#[derive(Debug, Clone)]
pub struct StoreUpdates {
    sender: broadcast::Sender<String>,
}

impl StoreUpdates {
    /// Create a broadcaster with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Announce that `name` changed.
    pub fn send(&self, name: &str) {
        match self.sender.send(name.to_string()) {
            Ok(count) => {
                crate::debug_event!("store", "notified", "{name} to {count} subscribers");
            }
            Err(_) => {
                // Nobody listening yet
                crate::debug_event!("store", "dropped", "no subscribers for {name}");
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }
}

impl Default for StoreUpdates {
    fn default() -> Self {
        Self::new(256)
    }
}
