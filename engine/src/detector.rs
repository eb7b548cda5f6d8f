//! Suspicious-wallet detection.
//!
//! Two modes share nothing but the store. The online detector sits in the live pipeline's
//! hot path and keeps bounded in-memory counters per wallet; its state is deliberately not
//! persisted, a restart starts counting fresh. The offline detector runs after each epoch
//! commit and works purely from the epoch's claim rows.

use std::{
	collections::{HashMap, VecDeque},
	sync::Arc,
	time::Duration,
};

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::time::Instant;

use crate::{
	constants::{
		DETECTOR_FREQUENCY_THRESHOLD, DETECTOR_FREQUENCY_WINDOW, DETECTOR_HIGH_TOTAL_BETS,
		DETECTOR_IDLE_RETENTION, DETECTOR_WINDOW_CAPACITY,
	},
	records::MultiClaimFinding,
	store::Store,
	taipei_time,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspicionFlag {
	LargeAmount,
	HighTotal,
	HighFrequency,
	RepeatInRound,
}

impl SuspicionFlag {
	pub fn as_str(&self) -> &'static str {
		match self {
			SuspicionFlag::LargeAmount => "large_amount",
			SuspicionFlag::HighTotal => "high_total",
			SuspicionFlag::HighFrequency => "high_frequency",
			SuspicionFlag::RepeatInRound => "repeat_in_round",
		}
	}
}

impl std::fmt::Display for SuspicionFlag {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone)]
pub struct OnlineDetectorConfig {
	/// A single bet above this (asset units) is flagged.
	pub large_amount: Decimal,
	pub high_total_bets: u64,
	pub frequency_window: Duration,
	pub frequency_threshold: usize,
}

impl Default for OnlineDetectorConfig {
	fn default() -> Self {
		OnlineDetectorConfig {
			large_amount: Decimal::from(10),
			high_total_bets: DETECTOR_HIGH_TOTAL_BETS,
			frequency_window: DETECTOR_FREQUENCY_WINDOW,
			frequency_threshold: DETECTOR_FREQUENCY_THRESHOLD,
		}
	}
}

struct WalletActivity {
	total_bets: u64,
	total_amount: Decimal,
	/// Recent bet instants, newest at the back. Fixed capacity ring.
	recent: VecDeque<Instant>,
	bets_per_epoch: HashMap<i64, u32>,
	last_seen: Instant,
}

impl WalletActivity {
	fn new(now: Instant) -> Self {
		WalletActivity {
			total_bets: 0,
			total_amount: Decimal::ZERO,
			recent: VecDeque::with_capacity(DETECTOR_WINDOW_CAPACITY),
			bets_per_epoch: HashMap::new(),
			last_seen: now,
		}
	}

	fn prune_window(&mut self, now: Instant, window: Duration) {
		while let Some(oldest) = self.recent.front() {
			if now.duration_since(*oldest) > window {
				self.recent.pop_front();
			} else {
				break;
			}
		}
	}
}

/// Per-live-bet detector. Owned by the real-time pipeline; not shared, not persisted.
pub struct OnlineDetector {
	config: OnlineDetectorConfig,
	wallets: HashMap<String, WalletActivity>,
}

/// What [OnlineDetector::observe] reports back for fan-out annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
	pub flags: Vec<SuspicionFlag>,
	pub total_bets: u64,
	pub total_amount: Decimal,
}

impl Observation {
	pub fn is_suspicious(&self) -> bool {
		!self.flags.is_empty()
	}

	pub fn flag_strings(&self) -> Vec<String> {
		self.flags.iter().map(|flag| flag.to_string()).collect()
	}
}

impl OnlineDetector {
	pub fn new(config: OnlineDetectorConfig) -> Self {
		OnlineDetector { config, wallets: HashMap::new() }
	}

	/// Records one live bet and evaluates every flag independently.
	pub fn observe(
		&mut self,
		wallet: &str,
		epoch: i64,
		amount: Decimal,
		now: Instant,
	) -> Observation {
		let activity =
			self.wallets.entry(wallet.to_string()).or_insert_with(|| WalletActivity::new(now));

		activity.total_bets += 1;
		activity.total_amount += amount;
		activity.last_seen = now;

		activity.prune_window(now, self.config.frequency_window);
		if activity.recent.len() == DETECTOR_WINDOW_CAPACITY {
			activity.recent.pop_front();
		}
		activity.recent.push_back(now);

		let in_round = activity.bets_per_epoch.entry(epoch).or_insert(0);
		*in_round += 1;

		let mut flags = Vec::new();
		if amount > self.config.large_amount {
			flags.push(SuspicionFlag::LargeAmount);
		}
		if activity.total_bets > self.config.high_total_bets {
			flags.push(SuspicionFlag::HighTotal);
		}
		if activity.recent.len() > self.config.frequency_threshold {
			flags.push(SuspicionFlag::HighFrequency);
		}
		if *in_round >= 2 {
			flags.push(SuspicionFlag::RepeatInRound);
		}

		Observation { flags, total_bets: activity.total_bets, total_amount: activity.total_amount }
	}

	/// Hourly housekeeping: expired window entries go, per-epoch counters for long-closed
	/// rounds go, wallets idle past the retention horizon go wholesale. Keeps the state
	/// bounded however long the process runs.
	pub fn sweep(&mut self, current_epoch: i64, now: Instant) {
		let window = self.config.frequency_window;
		self.wallets.retain(|_, activity| {
			activity.prune_window(now, window);
			activity.bets_per_epoch.retain(|epoch, _| *epoch >= current_epoch - 2);
			now.duration_since(activity.last_seen) < DETECTOR_IDLE_RETENTION
		});
	}

	/// Human-readable auto-note for a freshly flagged wallet.
	pub fn auto_note(wallet: &str, observation: &Observation) -> String {
		format!(
			"auto: {} flagged [{}] after {} bets totalling {}",
			wallet,
			observation.flag_strings().join(", "),
			observation.total_bets,
			observation.total_amount,
		)
	}

	#[cfg(test)]
	fn tracked_wallets(&self) -> usize {
		self.wallets.len()
	}
}

/// Which claim aggregation the offline pass uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimGrouping {
	/// Raw claim rows per wallet: how often the wallet claimed this epoch.
	Rows,
	/// Distinct `bet_epoch`s per wallet: how many different prior rounds the wallet
	/// harvested in one window. Used by the graceful-restart validation.
	DistinctBetEpochs,
}

/// Offline pass over one processing epoch's claims. Wallets above the threshold are
/// upserted into `multi_claims` and returned.
pub async fn detect_multi_claims(
	store: &Arc<dyn Store>,
	epoch: i64,
	threshold: i64,
	grouping: ClaimGrouping,
) -> anyhow::Result<Vec<MultiClaimFinding>> {
	let groups = match grouping {
		ClaimGrouping::Rows => store.claim_rows_per_wallet(epoch).await?,
		ClaimGrouping::DistinctBetEpochs => store.distinct_bet_epochs_per_wallet(epoch).await?,
	};

	let created_at = taipei_time::canonical_now();
	let mut findings = Vec::new();
	for group in groups {
		if group.claim_count > threshold {
			let finding = MultiClaimFinding {
				epoch,
				wallet_address: group.wallet_address,
				claim_count: group.claim_count,
				total_amount: group.total_amount,
				created_at: created_at.clone(),
			};
			store.upsert_multi_claim(&finding).await?;
			tracing::info!(
				"multi-claim: wallet {} claimed {}x in epoch {epoch} (total {})",
				finding.wallet_address,
				finding.claim_count,
				finding.total_amount,
			);
			findings.push(finding);
		}
	}
	Ok(findings)
}
