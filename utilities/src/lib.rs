pub mod redact_endpoint_secret;
pub mod task_scope;

pub use redact_endpoint_secret::SecretUrl;

use core::time::Duration;

/// Makes a tick that outputs every `interval` and then every `interval` after that. If the
/// operation between ticks takes longer than `interval` it will tick at the next opportunity,
/// and then continue on the `interval` cadence from there, rather than firing a burst of
/// missed ticks.
pub fn make_periodic_tick(interval: Duration, yield_immediately: bool) -> tokio::time::Interval {
	let mut interval = tokio::time::interval_at(
		tokio::time::Instant::now() + if yield_immediately { Duration::ZERO } else { interval },
		interval,
	);
	interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	interval
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn periodic_tick_yields_immediately_when_asked() {
		tokio::time::pause();
		let mut tick = make_periodic_tick(Duration::from_secs(5), true);
		// First tick is available without advancing time.
		tick.tick().await;
	}

	#[tokio::test]
	async fn periodic_tick_waits_a_full_period_otherwise() {
		tokio::time::pause();
		let mut tick = make_periodic_tick(Duration::from_secs(5), false);
		tokio::time::advance(Duration::from_secs(4)).await;
		assert!(futures::poll!(std::pin::pin!(tick.tick())).is_pending());
		tokio::time::advance(Duration::from_secs(2)).await;
		tick.tick().await;
	}
}
