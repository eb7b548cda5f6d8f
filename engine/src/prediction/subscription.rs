//! Push surface: the live event subscription.
//!
//! A spawned task owns the websocket connection and feeds decoded [ChainEvent]s into a
//! channel the real-time pipeline consumes. On socket loss it emits
//! `ConnectionStatus { connected: false }`, re-dials with doubling delay up to a cap, and
//! keeps retrying at the cap indefinitely; bets missed during an outage are recovered by
//! the historical pipeline once their epoch closes.

use ethers::{
	providers::{Middleware, Provider, Ws},
	types::{Address, Filter},
};
use futures::StreamExt;
use tokio::sync::mpsc;
use utilities::{task_scope::Scope, SecretUrl};

use super::contract::{decode_chain_event, ChainEvent};
use crate::constants::{
	SUBSCRIPTION_FAST_RECONNECT_ATTEMPTS, SUBSCRIPTION_RECONNECT_BASE_DELAY,
	SUBSCRIPTION_RECONNECT_MAX_DELAY,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Spawns the subscription task into `scope` and returns the event stream. The task ends
/// when the receiver is dropped.
pub fn spawn_subscription(
	scope: &Scope,
	ws_endpoint: SecretUrl,
	contract_address: Address,
) -> mpsc::Receiver<ChainEvent> {
	let (sender, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
	scope.spawn(async move {
		run_subscription(ws_endpoint, contract_address, sender).await;
		Ok(())
	});
	receiver
}

async fn run_subscription(
	ws_endpoint: SecretUrl,
	contract_address: Address,
	sender: mpsc::Sender<ChainEvent>,
) {
	let mut consecutive_failures: u32 = 0;

	loop {
		match subscribe_once(&ws_endpoint, contract_address, &sender).await {
			SubscriptionEnd::ReceiverDropped => return,
			SubscriptionEnd::ConnectionLost => {
				consecutive_failures += 1;
			},
		}

		if sender.send(ChainEvent::ConnectionStatus { connected: false }).await.is_err() {
			return;
		}

		let delay = reconnect_delay(consecutive_failures);
		if consecutive_failures == SUBSCRIPTION_FAST_RECONNECT_ATTEMPTS {
			tracing::error!(
				"live subscription to {ws_endpoint} lost {consecutive_failures} times, \
				 retrying every {delay:?} from now on",
			);
		} else {
			tracing::warn!("live subscription lost, reconnecting to {ws_endpoint} in {delay:?}");
		}
		tokio::time::sleep(delay).await;
	}
}

enum SubscriptionEnd {
	ReceiverDropped,
	ConnectionLost,
}

async fn subscribe_once(
	ws_endpoint: &SecretUrl,
	contract_address: Address,
	sender: &mpsc::Sender<ChainEvent>,
) -> SubscriptionEnd {
	let provider = match Provider::<Ws>::connect(ws_endpoint.as_ref()).await {
		Ok(provider) => provider,
		Err(error) => {
			tracing::warn!("cannot open websocket to {ws_endpoint}: {error}");
			return SubscriptionEnd::ConnectionLost;
		},
	};

	let filter = Filter::new().address(contract_address);
	let mut stream = match provider.subscribe_logs(&filter).await {
		Ok(stream) => stream,
		Err(error) => {
			tracing::warn!("subscribe_logs on {ws_endpoint} failed: {error}");
			return SubscriptionEnd::ConnectionLost;
		},
	};

	tracing::info!("live subscription to {ws_endpoint} established");
	if sender.send(ChainEvent::ConnectionStatus { connected: true }).await.is_err() {
		return SubscriptionEnd::ReceiverDropped;
	}

	while let Some(log) = stream.next().await {
		match decode_chain_event(log) {
			Ok(Some(event)) => {
				if sender.send(event).await.is_err() {
					return SubscriptionEnd::ReceiverDropped;
				}
			},
			// Contract events outside the push surface.
			Ok(None) => {},
			Err(error) => {
				tracing::warn!("undecodable log from subscription: {error:#}");
			},
		}
	}

	// The stream only ends when the socket closed underneath us.
	SubscriptionEnd::ConnectionLost
}

fn reconnect_delay(consecutive_failures: u32) -> std::time::Duration {
	let doublings = consecutive_failures
		.saturating_sub(1)
		.min(SUBSCRIPTION_FAST_RECONNECT_ATTEMPTS);
	SUBSCRIPTION_RECONNECT_BASE_DELAY
		.saturating_mul(1 << doublings)
		.min(SUBSCRIPTION_RECONNECT_MAX_DELAY)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[test]
	fn reconnect_delay_doubles_to_the_cap() {
		assert_eq!(reconnect_delay(1), Duration::from_secs(10));
		assert_eq!(reconnect_delay(2), Duration::from_secs(20));
		assert_eq!(reconnect_delay(3), Duration::from_secs(40));
		assert_eq!(reconnect_delay(4), Duration::from_secs(60));
		assert_eq!(reconnect_delay(5), Duration::from_secs(60));
		// Beyond the fast attempts it stays at the cap forever.
		assert_eq!(reconnect_delay(100), Duration::from_secs(60));
	}
}
