//! Broadcast channel for settlement events.
//!
//! Coordinators publish what they observe and do; API handlers and tests
//! subscribe to follow a session without polling it themselves.

use splitpay_types::SettlementEvent;
use tokio::sync::broadcast;

/// Event bus shared by the coordinators of one process.
#[derive(Clone)]
pub struct EventBus {
	sender: broadcast::Sender<SettlementEvent>,
}

impl EventBus {
	/// Creates a bus buffering up to `capacity` events per slow subscriber.
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender }
	}

	/// Subscribes to events published from now on.
	pub fn subscribe(&self) -> broadcast::Receiver<SettlementEvent> {
		self.sender.subscribe()
	}

	/// Publishes an event. Having no subscribers is not an error.
	pub fn publish(&self, event: SettlementEvent) {
		let _ = self.sender.send(event);
	}
}
