//! Real-time pipeline.
//!
//! Consumes the push surface, de-duplicates per `(epoch, wallet)`, runs online detection,
//! and fans out. Broadcast comes before persistence on purpose: clients get the bet at
//! chain latency and a hot-table write failure only costs a log line, never the
//! broadcast. The hot table is therefore best-effort until the epoch's historical commit
//! replaces it.

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use tokio::{sync::mpsc, time::Instant};
use utilities::make_periodic_tick;

use crate::{
	constants::{CLOSED_EPOCH_LAG, DEDUP_ENTRY_TTL, DEDUP_SWEEP_INTERVAL, DEDUP_WARM_RESTORE_ROWS},
	detector::{OnlineDetector, OnlineDetectorConfig},
	errors::EngineError,
	fanout::{FanoutHandle, OutboundMessage},
	prediction::{ChainEvent, LiveBet, PredictionRpcApi, RoundView},
	records::RealBet,
	store::Store,
	taipei_time,
};

pub struct RealtimePipeline {
	rpc: Arc<dyn PredictionRpcApi>,
	store: Arc<dyn Store>,
	fanout: FanoutHandle,
	detector: OnlineDetector,
	/// `(epoch, wallet)` of bets already seen, purged at lock time.
	dedup: HashMap<(i64, String), Instant>,
	latest_epoch: i64,
}

impl RealtimePipeline {
	pub fn new(
		rpc: Arc<dyn PredictionRpcApi>,
		store: Arc<dyn Store>,
		fanout: FanoutHandle,
	) -> Self {
		RealtimePipeline {
			rpc,
			store,
			fanout,
			detector: OnlineDetector::new(OnlineDetectorConfig::default()),
			dedup: HashMap::new(),
			latest_epoch: 0,
		}
	}

	pub async fn run(mut self, mut events: mpsc::Receiver<ChainEvent>) -> Result<()> {
		let current = self.rpc.current_epoch().await?;
		self.latest_epoch = current;
		self.broadcast_round_update(current).await;
		self.warm_restore_dedup().await;

		let mut sweep_tick = make_periodic_tick(DEDUP_SWEEP_INTERVAL, false);
		loop {
			tokio::select! {
				maybe_event = events.recv() => match maybe_event {
					Some(event) => self.handle_event(event).await,
					None => {
						tracing::error!("live event stream ended");
						return Err(EngineError::SubscriptionLost.into());
					},
				},
				_ = sweep_tick.tick() => self.sweep(),
			}
		}
	}

	/// Re-seeds the dedup set from the hot table so a pipeline restart does not re-emit
	/// bets that already went out.
	async fn warm_restore_dedup(&mut self) {
		match self.store.recent_real_bets(DEDUP_WARM_RESTORE_ROWS).await {
			Ok(rows) => {
				let now = Instant::now();
				let restored = rows.len();
				for bet in rows {
					self.dedup.insert((bet.epoch, bet.wallet_address), now);
				}
				tracing::info!("dedup set warm-restored from {restored} hot rows");
			},
			Err(error) => {
				tracing::warn!("could not warm-restore dedup set: {error}");
			},
		}
	}

	async fn handle_event(&mut self, event: ChainEvent) {
		match event {
			ChainEvent::Bet(bet) => self.handle_bet(bet).await,
			ChainEvent::StartRound { epoch } => {
				tracing::info!("round {epoch} started");
				self.latest_epoch = epoch;
				self.broadcast_round_update(epoch).await;
				if let Err(error) =
					self.store.sweep_real_bets_below(epoch - CLOSED_EPOCH_LAG).await
				{
					tracing::error!("hot table sweep failed: {error}");
				}
			},
			ChainEvent::LockRound { epoch } => {
				tracing::info!("round {epoch} locked");
				self.fanout.broadcast(&OutboundMessage::RoundLock {
					epoch,
					timestamp: taipei_time::canonical_now(),
				});
				// The locked round takes no further bets; its dedup entries are done.
				self.dedup.retain(|(entry_epoch, _), _| *entry_epoch != epoch);
				// New bets now target the next round.
				self.broadcast_round_update(epoch + 1).await;
			},
			ChainEvent::ConnectionStatus { connected } => {
				self.fanout.broadcast(&OutboundMessage::ConnectionStatus {
					connected,
					timestamp: taipei_time::canonical_now(),
				});
			},
		}
	}

	async fn handle_bet(&mut self, bet: LiveBet) {
		let wallet = bet.wallet.to_lowercase();
		let key = (bet.epoch, wallet.clone());
		if self.dedup.contains_key(&key) {
			tracing::trace!("duplicate live bet dropped: epoch {} wallet {wallet}", bet.epoch);
			return;
		}
		let now = Instant::now();
		self.dedup.insert(key, now);
		self.latest_epoch = self.latest_epoch.max(bet.epoch);

		let bet_ts = taipei_time::canonical_now();
		let record = RealBet {
			epoch: bet.epoch,
			bet_ts: bet_ts.clone(),
			wallet_address: wallet.clone(),
			bet_direction: bet.direction,
			amount: bet.amount,
		};

		let observation = self.detector.observe(&wallet, bet.epoch, bet.amount, now);
		if observation.is_suspicious() {
			tracing::warn!(
				"suspicious bet: wallet {wallet} epoch {} flags {:?}",
				bet.epoch,
				observation.flag_strings()
			);
			self.note_suspicious_wallet(&wallet, &observation).await;
			self.fanout.broadcast(&OutboundMessage::SuspiciousActivity {
				wallet: wallet.clone(),
				epoch: bet.epoch,
				direction: bet.direction,
				amount: bet.amount,
				flags: observation.flag_strings(),
				total_bets: observation.total_bets,
				total_amount: observation.total_amount,
				timestamp: bet_ts.clone(),
			});
		}

		// Broadcast first, persist second: fan-out latency never waits on Postgres, and a
		// write failure is logged rather than propagated.
		self.fanout.broadcast(&OutboundMessage::NewBet {
			wallet,
			epoch: bet.epoch,
			direction: bet.direction,
			amount: bet.amount,
			timestamp: bet_ts,
			suspicious: observation.is_suspicious(),
			flags: observation.is_suspicious().then(|| observation.flag_strings()),
		});

		if let Err(error) = self.store.insert_real_bet(&record).await {
			tracing::error!(
				"hot table insert failed for epoch {} wallet {}: {error}",
				record.epoch,
				record.wallet_address
			);
		}
	}

	/// First flag on a wallet leaves a persistent auto-note; existing notes are kept.
	async fn note_suspicious_wallet(
		&self,
		wallet: &str,
		observation: &crate::detector::Observation,
	) {
		let exists = match self.store.wallet_note_exists(wallet).await {
			Ok(exists) => exists,
			Err(error) => {
				tracing::error!("wallet note lookup failed: {error}");
				return;
			},
		};
		if exists {
			return;
		}
		let note = OnlineDetector::auto_note(wallet, observation);
		if let Err(error) = self
			.store
			.upsert_wallet_note(wallet, &note, &taipei_time::canonical_now())
			.await
		{
			tracing::error!("wallet note upsert failed: {error}");
		}
	}

	async fn broadcast_round_update(&self, epoch: i64) {
		match self.rpc.round(epoch).await {
			Ok(view) => {
				self.fanout.broadcast(&round_update_message(&view));
			},
			Err(error) => {
				tracing::error!("cannot read round {epoch} for round_update: {error:#}");
			},
		}
	}

	/// Hourly fallback; lock-time purges normally keep the set small already.
	fn sweep(&mut self) {
		let now = Instant::now();
		let before = self.dedup.len();
		self.dedup.retain(|_, inserted| now.duration_since(*inserted) < DEDUP_ENTRY_TTL);
		if before != self.dedup.len() {
			tracing::debug!("dedup sweep dropped {} stale entries", before - self.dedup.len());
		}
		self.detector.sweep(self.latest_epoch, now);
	}
}

fn round_update_message(view: &RoundView) -> OutboundMessage {
	OutboundMessage::RoundUpdate {
		epoch: view.epoch,
		status: view.status().as_str(),
		start_timestamp: view.start_timestamp,
		lock_timestamp: view.lock_timestamp,
		close_timestamp: view.close_timestamp,
		lock_price: view.lock_price,
		close_price: view.close_price,
		total_amount: view.total_amount,
		bull_amount: view.bull_amount,
		bear_amount: view.bear_amount,
		timestamp: taipei_time::canonical_now(),
	}
}
