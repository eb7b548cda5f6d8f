//! Pull-surface request pacing.
//!
//! A single slot refills every `1000 / rps` milliseconds; callers block until their slot
//! comes up, which serializes the pull surface at the configured request rate however many
//! workers share the client.

use std::time::Duration;

use tokio::{sync::Mutex, time::Instant};

pub struct RateLimiter {
	slot_interval: Duration,
	next_slot: Mutex<Instant>,
}

impl RateLimiter {
	pub fn new(requests_per_second: u32) -> Self {
		let requests_per_second = requests_per_second.max(1);
		RateLimiter {
			slot_interval: Duration::from_millis((1000 / requests_per_second).max(1) as u64),
			next_slot: Mutex::new(Instant::now()),
		}
	}

	/// Waits for the next free slot. Slots are handed out in lock-acquisition order.
	pub async fn acquire(&self) {
		let slot = {
			let mut next_slot = self.next_slot.lock().await;
			let slot = (*next_slot).max(Instant::now());
			*next_slot = slot + self.slot_interval;
			slot
		};
		tokio::time::sleep_until(slot).await;
	}
}
