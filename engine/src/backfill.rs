//! Historical pipeline.
//!
//! Per-epoch processing walks a fixed sequence: quarantine/skip checks, block-range
//! resolution over the canonical ingestion window (start of E to start of E+1), parallel
//! event fetch, assembly, integrity check, one atomic commit, hot-table cleanup, offline
//! detection. Two workers drive it: the main worker backtracks from `currentEpoch - 2`
//! toward epoch 1, and the side worker re-checks the recent window every few minutes.
//! Commits are idempotent on natural keys, so the workers may interleave freely.

use std::{
	collections::{BTreeSet, HashMap},
	sync::Arc,
	time::Duration,
};

use anyhow::{anyhow, Context, Result};
use tokio::sync::watch;
use utilities::make_periodic_tick;

use crate::{
	constants::{
		BACKFILL_EPOCH_PACING, CLOSED_EPOCH_LAG, EPOCH_FAILURE_QUARANTINE_THRESHOLD,
		GRACEFUL_RESTART_DRAIN_TIMEOUT, GRACEFUL_RESTART_RESUME_DELAY,
		GRACEFUL_RESTART_SETTLE_DELAY, RECENT_SCAN_INTERVAL, RECENT_WINDOW_START_LAG,
	},
	detector::{detect_multi_claims, ClaimGrouping},
	errors::EngineError,
	prediction::{
		block_search::block_by_timestamp,
		contract::{BlockInfo, EpochEvents},
		PredictionRpcApi, RoundView,
	},
	records::{compute_payouts, BetResult, Claim, Direction, HisBet, Round},
	store::Store,
	taipei_time,
};

/// Everything per-epoch processing needs; cheap to clone into workers.
#[derive(Clone)]
pub struct BackfillContext {
	pub rpc: Arc<dyn PredictionRpcApi>,
	pub store: Arc<dyn Store>,
	pub multi_claim_threshold: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
	AlreadyStored,
	Quarantined,
	RoundNotClosed,
	NextRoundNotStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochOutcome {
	Committed { bets: usize, claims: usize },
	Skipped(SkipReason),
	/// Integrity check failed; `failures` is the updated strike count.
	Failed { failures: i32 },
}

impl BackfillContext {
	pub fn new(
		rpc: Arc<dyn PredictionRpcApi>,
		store: Arc<dyn Store>,
		multi_claim_threshold: i64,
	) -> Self {
		BackfillContext { rpc, store, multi_claim_threshold }
	}

	/// One epoch, start to finish. Skips are normal; a `Failed` outcome has already been
	/// recorded against the epoch's quarantine counter.
	pub async fn process_epoch(&self, epoch: i64) -> Result<EpochOutcome> {
		if let Some(failed) = self.store.failed_epoch(epoch).await? {
			if failed.failure_count >= EPOCH_FAILURE_QUARANTINE_THRESHOLD {
				return Ok(EpochOutcome::Skipped(SkipReason::Quarantined));
			}
		}
		if self.store.round_exists(epoch).await? {
			return Ok(EpochOutcome::Skipped(SkipReason::AlreadyStored));
		}

		let view = self.rpc.round(epoch).await?;
		if !view.is_closed() {
			return Ok(EpochOutcome::Skipped(SkipReason::RoundNotClosed));
		}

		// The ingestion window runs from the start of this round to the start of the
		// next, so late bets and payouts land in exactly one epoch. Without the next
		// round's start the range cannot be bounded yet.
		let next = self.rpc.round(epoch + 1).await?;
		if next.start_timestamp == 0 {
			return Ok(EpochOutcome::Skipped(SkipReason::NextRoundNotStarted));
		}

		let from_block = block_by_timestamp(self.rpc.as_ref(), view.start_timestamp).await?;
		let to_block = block_by_timestamp(self.rpc.as_ref(), next.start_timestamp).await?;

		let events = self.rpc.epoch_events(from_block.number, to_block.number).await?;
		let block_times = self.fetch_block_times(&events, [from_block, to_block]).await?;
		let (round, bets, claims) = assemble_epoch(epoch, &view, events, &block_times)?;

		if let Err(error) = check_integrity(epoch, &bets) {
			tracing::warn!("epoch {epoch}: {error}");
			self.store.delete_epoch_rows(epoch).await?;
			let failures = self
				.store
				.record_epoch_failure(epoch, &error.to_string(), &taipei_time::canonical_now())
				.await?;
			if failures >= EPOCH_FAILURE_QUARANTINE_THRESHOLD {
				tracing::error!("epoch {epoch} quarantined after {failures} integrity failures");
			}
			return Ok(EpochOutcome::Failed { failures });
		}

		self.store.commit_epoch(&round, &bets, &claims).await?;

		self.store.delete_real_bets_for_epoch(epoch).await?;
		let current = self.rpc.current_epoch().await?;
		self.store.sweep_real_bets_below(current - CLOSED_EPOCH_LAG).await?;

		detect_multi_claims(&self.store, epoch, self.multi_claim_threshold, ClaimGrouping::Rows)
			.await?;

		Ok(EpochOutcome::Committed { bets: bets.len(), claims: claims.len() })
	}

	/// Canonical timestamps for every block that carries an event, one rate-limited
	/// header fetch per distinct block.
	async fn fetch_block_times(
		&self,
		events: &EpochEvents,
		already_known: [BlockInfo; 2],
	) -> Result<HashMap<u64, String>> {
		let mut block_times = HashMap::new();
		for block in already_known {
			block_times.insert(block.number, canonical_block_time(block.timestamp)?);
		}

		let wanted: BTreeSet<u64> = events
			.bull
			.iter()
			.chain(events.bear.iter())
			.map(|event| event.block_number)
			.chain(events.claims.iter().map(|event| event.block_number))
			.collect();

		for number in wanted {
			if block_times.contains_key(&number) {
				continue;
			}
			let block = self.rpc.block(number).await?;
			block_times.insert(number, canonical_block_time(block.timestamp)?);
		}
		Ok(block_times)
	}
}

fn canonical_block_time(timestamp: u64) -> Result<String> {
	Ok(taipei_time::canonical_from_unix(timestamp as i64)?)
}

/// Builds the row set for one closed epoch. Pure; all chain access has already happened.
fn assemble_epoch(
	epoch: i64,
	view: &RoundView,
	events: EpochEvents,
	block_times: &HashMap<u64, String>,
) -> Result<(Round, Vec<HisBet>, Vec<Claim>)> {
	let result = view.result();
	let (up_payout, down_payout) =
		compute_payouts(view.total_amount, view.bull_amount, view.bear_amount);

	let round = Round {
		epoch,
		start_ts: canonical_block_time(view.start_timestamp)?,
		lock_ts: canonical_block_time(view.lock_timestamp)?,
		close_ts: canonical_block_time(view.close_timestamp)?,
		lock_price: view.lock_price,
		close_price: view.close_price,
		result,
		total_amount: view.total_amount,
		up_amount: view.bull_amount,
		down_amount: view.bear_amount,
		up_payout,
		down_payout,
	};

	let event_time = |block_number: u64| {
		block_times
			.get(&block_number)
			.cloned()
			.ok_or_else(|| anyhow!("no timestamp fetched for block {block_number}"))
	};

	let mut bets = Vec::with_capacity(events.bull.len() + events.bear.len());
	for (direction, stream) in
		[(Direction::Up, events.bull), (Direction::Down, events.bear)]
	{
		for event in stream {
			bets.push(HisBet {
				epoch,
				bet_ts: event_time(event.block_number)?,
				wallet_address: event.wallet,
				bet_direction: direction,
				amount: event.amount,
				result: result.map(|winning| {
					if winning == direction {
						BetResult::Win
					} else {
						BetResult::Loss
					}
				}),
				tx_hash: event.tx_hash,
			});
		}
	}

	let claims = events
		.claims
		.into_iter()
		.map(|event| {
			Ok(Claim {
				// Processing epoch: the window this payout transaction landed in.
				epoch,
				claim_ts: event_time(event.block_number)?,
				wallet_address: event.wallet,
				claim_amount: event.amount,
				// Provenance: the round the reward is for.
				bet_epoch: event.bet_epoch,
				tx_hash: event.tx_hash,
			})
		})
		.collect::<Result<Vec<_>>>()?;

	Ok((round, bets, claims))
}

/// A closed round with betting on only one side never happens in normal operation; it
/// points at a broken block range or an event-fetch hole. Claims can legitimately be
/// empty.
fn check_integrity(epoch: i64, bets: &[HisBet]) -> Result<(), EngineError> {
	let has_up = bets.iter().any(|bet| bet.bet_direction == Direction::Up);
	let has_down = bets.iter().any(|bet| bet.bet_direction == Direction::Down);
	match (has_up, has_down) {
		(true, true) => Ok(()),
		(up, _) => Err(EngineError::IntegrityCheckFailed {
			epoch,
			reason: format!("no {} bets in range", if up { "DOWN" } else { "UP" }),
		}),
	}
}

fn log_outcome(epoch: i64, outcome: &EpochOutcome) {
	match outcome {
		EpochOutcome::Committed { bets, claims } => {
			tracing::info!("epoch {epoch}: committed {bets} bets, {claims} claims");
		},
		EpochOutcome::Skipped(SkipReason::AlreadyStored) => {
			tracing::trace!("epoch {epoch}: already stored");
		},
		EpochOutcome::Skipped(reason) => {
			tracing::debug!("epoch {epoch}: skipped ({reason:?})");
		},
		EpochOutcome::Failed { failures } => {
			tracing::warn!("epoch {epoch}: integrity failure {failures}");
		},
	}
}

/// Main worker: backtracks from `currentEpoch - 2` down to epoch 1. Checks the stop
/// signal between epochs; an in-flight epoch always runs to completion or rollback.
pub async fn run_main_worker(
	context: BackfillContext,
	mut stop_signal: watch::Receiver<bool>,
) -> Result<()> {
	let mut epoch = context.rpc.current_epoch().await? - CLOSED_EPOCH_LAG;
	tracing::info!("main backfill worker starting at epoch {epoch}");

	while epoch > 0 {
		if *stop_signal.borrow() {
			tracing::info!("main backfill worker stopping at epoch {epoch}");
			return Ok(());
		}

		match context.process_epoch(epoch).await {
			Ok(outcome) => log_outcome(epoch, &outcome),
			// A single epoch must never take the daemon down.
			Err(error) => tracing::error!("epoch {epoch}: processing error: {error:#}"),
		}
		epoch -= 1;

		tokio::select! {
			_ = tokio::time::sleep(BACKFILL_EPOCH_PACING) => {},
			_ = stop_signal.changed() => {},
		}
	}
	tracing::info!("main backfill worker reached epoch 1, backfill complete");
	Ok(())
}

/// Side worker: every few minutes re-processes the recent closed window
/// `[currentEpoch - 6, currentEpoch - 2]`, catching epochs the main worker passed before
/// they closed. Already-stored rounds skip immediately.
pub async fn run_side_worker(context: BackfillContext) -> Result<()> {
	let mut tick = make_periodic_tick(RECENT_SCAN_INTERVAL, true);
	loop {
		tick.tick().await;
		if let Err(error) = scan_recent_window(&context).await {
			tracing::error!("recent-window scan failed: {error:#}");
		}
	}
}

async fn scan_recent_window(context: &BackfillContext) -> Result<()> {
	let current = context.rpc.current_epoch().await?;
	let from = (current - RECENT_WINDOW_START_LAG).max(1);
	let to = current - CLOSED_EPOCH_LAG;
	for epoch in from..=to {
		match context.process_epoch(epoch).await {
			Ok(outcome) => log_outcome(epoch, &outcome),
			Err(error) => tracing::error!("epoch {epoch}: recent-scan error: {error:#}"),
		}
	}
	Ok(())
}

struct RunningWorker {
	stop_sender: watch::Sender<bool>,
	handle: tokio::task::JoinHandle<Result<()>>,
}

/// Owns the main worker so the supervisor can restart it gracefully and stop it on
/// shutdown. The side worker runs independently and needs neither.
pub struct BackfillService {
	context: BackfillContext,
	worker: tokio::sync::Mutex<Option<RunningWorker>>,
}

impl BackfillService {
	pub fn start(context: BackfillContext) -> Self {
		let worker = Self::spawn_worker(context.clone());
		BackfillService { context, worker: tokio::sync::Mutex::new(Some(worker)) }
	}

	fn spawn_worker(context: BackfillContext) -> RunningWorker {
		let (stop_sender, stop_receiver) = watch::channel(false);
		let handle = tokio::spawn(run_main_worker(context, stop_receiver));
		RunningWorker { stop_sender, handle }
	}

	async fn stop_worker(worker: RunningWorker, drain: Duration) {
		let RunningWorker { stop_sender, mut handle } = worker;
		let _ = stop_sender.send(true);
		match tokio::time::timeout(drain, &mut handle).await {
			Ok(Ok(Ok(()))) => tracing::info!("main worker drained cleanly"),
			Ok(Ok(Err(error))) => tracing::warn!("main worker exited with error: {error:#}"),
			Ok(Err(join_error)) => tracing::warn!("main worker task failed: {join_error}"),
			Err(_) => {
				tracing::warn!("main worker did not drain within {drain:?}, hard-cutting");
				handle.abort();
			},
		}
	}

	/// The periodic restart sequence: stop, drain, settle, validate, pause, restart.
	/// Validation failures are surfaced but never prevent the restart.
	pub async fn graceful_restart(&self) {
		tracing::info!("graceful restart: stopping main worker");
		let mut guard = self.worker.lock().await;
		if let Some(worker) = guard.take() {
			Self::stop_worker(worker, GRACEFUL_RESTART_DRAIN_TIMEOUT).await;
		}

		tracing::info!(
			"graceful restart: letting in-flight writes settle for {GRACEFUL_RESTART_SETTLE_DELAY:?}"
		);
		tokio::time::sleep(GRACEFUL_RESTART_SETTLE_DELAY).await;

		if let Err(error) = self.validate_recent_window().await {
			tracing::warn!("graceful restart: validation surfaced: {error:#}");
		}

		tokio::time::sleep(GRACEFUL_RESTART_RESUME_DELAY).await;
		*guard = Some(Self::spawn_worker(self.context.clone()));
		tracing::info!("graceful restart: main worker restarted");
	}

	async fn validate_recent_window(&self) -> Result<()> {
		let context = &self.context;
		let current = context.rpc.current_epoch().await?;
		let from = (current - RECENT_WINDOW_START_LAG).max(1);
		let to = current - CLOSED_EPOCH_LAG;

		let rounds = context.store.rounds_present_in(from, to).await?;
		let expected = to - from + 1;
		if rounds < expected {
			tracing::warn!(
				"graceful restart: only {rounds}/{expected} rounds stored in [{from}, {to}]"
			);
		} else {
			tracing::info!("graceful restart: recent window [{from}, {to}] fully stored");
		}

		let stale: Vec<i64> = context
			.store
			.real_bet_epochs()
			.await?
			.into_iter()
			.filter(|epoch| *epoch < current - CLOSED_EPOCH_LAG)
			.collect();
		if stale.is_empty() {
			tracing::info!("graceful restart: hot table swept for processed epochs");
		} else {
			tracing::warn!("graceful restart: hot table still holds epochs {stale:?}");
		}

		// The restart check uses the distinct-bet-epoch grouping: a wallet harvesting
		// many prior rounds in one claim window is the signal of interest here.
		for epoch in from..=to {
			detect_multi_claims(
				&context.store,
				epoch,
				context.multi_claim_threshold,
				ClaimGrouping::DistinctBetEpochs,
			)
			.await
			.with_context(|| format!("offline detection for epoch {epoch}"))?;
		}
		let findings = context.store.multi_claims_in(from, to).await?;
		tracing::info!("graceful restart: {findings} multi-claim findings in [{from}, {to}]");
		Ok(())
	}

	/// Shutdown path: same stop-and-drain as the restart, without respawning.
	pub async fn shutdown(&self) {
		let mut guard = self.worker.lock().await;
		if let Some(worker) = guard.take() {
			Self::stop_worker(worker, GRACEFUL_RESTART_DRAIN_TIMEOUT).await;
		}
	}
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RangeReport {
	pub committed: usize,
	pub skipped: usize,
	pub failed: usize,
	pub bets: usize,
	pub claims: usize,
}

/// On-demand backfill over a closed interval, used by the `range` CLI mode.
pub async fn process_range(context: &BackfillContext, from: i64, to: i64) -> Result<RangeReport> {
	anyhow::ensure!(from > 0 && from <= to, "invalid epoch range [{from}, {to}]");
	let mut report = RangeReport::default();
	for epoch in from..=to {
		let outcome = context.process_epoch(epoch).await?;
		log_outcome(epoch, &outcome);
		match outcome {
			EpochOutcome::Committed { bets, claims } => {
				report.committed += 1;
				report.bets += bets;
				report.claims += claims;
			},
			EpochOutcome::Skipped(_) => report.skipped += 1,
			EpochOutcome::Failed { .. } => report.failed += 1,
		}
	}
	Ok(report)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		prediction::contract::{BetEvent, ClaimEvent},
		prediction::rpc::mocks::MockPredictionRpc,
		records::FailedEpoch,
		store::{mocks::MockStore, WalletClaimGroup},
	};
	use rust_decimal::Decimal;

	const EPOCH: i64 = 100;

	fn closed_view() -> RoundView {
		RoundView {
			epoch: EPOCH,
			start_timestamp: 1000,
			lock_timestamp: 1300,
			close_timestamp: 1600,
			lock_price: Decimal::new(300_0000_0000, 8),
			close_price: Decimal::new(301_5000_0000, 8),
			total_amount: Decimal::from(10),
			bull_amount: Decimal::from(6),
			bear_amount: Decimal::from(4),
			oracle_called: true,
		}
	}

	fn next_view(start_timestamp: u64) -> RoundView {
		RoundView {
			epoch: EPOCH + 1,
			start_timestamp,
			lock_timestamp: 0,
			close_timestamp: 0,
			lock_price: Decimal::ZERO,
			close_price: Decimal::ZERO,
			total_amount: Decimal::ZERO,
			bull_amount: Decimal::ZERO,
			bear_amount: Decimal::ZERO,
			oracle_called: false,
		}
	}

	fn scenario_events() -> EpochEvents {
		EpochEvents {
			bull: vec![BetEvent {
				epoch: EPOCH,
				wallet: "0xaaa".to_string(),
				amount: Decimal::from(6),
				tx_hash: "0x01".to_string(),
				block_number: 1100,
			}],
			bear: vec![BetEvent {
				epoch: EPOCH,
				wallet: "0xbbb".to_string(),
				amount: Decimal::from(4),
				tx_hash: "0x02".to_string(),
				block_number: 1200,
			}],
			claims: vec![ClaimEvent {
				bet_epoch: EPOCH,
				wallet: "0xaaa".to_string(),
				amount: Decimal::new(582, 2),
				tx_hash: "0x03".to_string(),
				block_number: 1500,
			}],
		}
	}

	fn block_times_for(numbers: &[u64]) -> HashMap<u64, String> {
		numbers
			.iter()
			.map(|number| {
				(*number, taipei_time::canonical_from_unix(*number as i64).unwrap())
			})
			.collect()
	}

	/// Fake chain for full-pipeline tests: block `n` has timestamp `n`, so the bisection
	/// resolves a round's start timestamp directly to its block number.
	fn rpc_with_linear_chain() -> MockPredictionRpc {
		let mut rpc = MockPredictionRpc::new();
		rpc.expect_block_number().returning(|| Ok(5000));
		rpc.expect_block()
			.returning(|number| Ok(BlockInfo { number, timestamp: number }));
		rpc
	}

	#[test]
	fn assembles_the_normal_closed_epoch() {
		let (round, bets, claims) = assemble_epoch(
			EPOCH,
			&closed_view(),
			scenario_events(),
			&block_times_for(&[1000, 1100, 1200, 1500, 1600]),
		)
		.unwrap();

		assert_eq!(round.result, Some(Direction::Up));
		assert_eq!(round.up_payout.to_string(), "1.6167");
		assert_eq!(round.down_payout.to_string(), "2.4250");
		assert_eq!(round.total_amount, Decimal::from(10));

		assert_eq!(bets.len(), 2);
		let up_bet = bets.iter().find(|bet| bet.wallet_address == "0xaaa").unwrap();
		assert_eq!(up_bet.bet_direction, Direction::Up);
		assert_eq!(up_bet.result, Some(BetResult::Win));
		let down_bet = bets.iter().find(|bet| bet.wallet_address == "0xbbb").unwrap();
		assert_eq!(down_bet.result, Some(BetResult::Loss));

		assert_eq!(claims.len(), 1);
		assert_eq!(claims[0].epoch, EPOCH);
		assert_eq!(claims[0].bet_epoch, EPOCH);
		assert_eq!(claims[0].claim_amount.to_string(), "5.82");
	}

	#[test]
	fn draw_epochs_have_no_results() {
		let mut view = closed_view();
		view.close_price = view.lock_price;
		let (round, bets, _) = assemble_epoch(
			EPOCH,
			&view,
			scenario_events(),
			&block_times_for(&[1000, 1100, 1200, 1500, 1600]),
		)
		.unwrap();

		assert_eq!(round.result, None);
		assert!(bets.iter().all(|bet| bet.result.is_none()));
	}

	#[test]
	fn assembled_timestamps_are_canonical() {
		let (round, bets, claims) = assemble_epoch(
			EPOCH,
			&closed_view(),
			scenario_events(),
			&block_times_for(&[1000, 1100, 1200, 1500, 1600]),
		)
		.unwrap();
		for timestamp in [
			&round.start_ts,
			&round.lock_ts,
			&round.close_ts,
			&bets[0].bet_ts,
			&claims[0].claim_ts,
		] {
			assert!(taipei_time::is_canonical(timestamp), "{timestamp:?} is not canonical");
		}
	}

	#[test]
	fn one_sided_rounds_fail_integrity() {
		let up_only = vec![HisBet {
			epoch: EPOCH,
			bet_ts: "2024-01-01 00:00:00".to_string(),
			wallet_address: "0xaaa".to_string(),
			bet_direction: Direction::Up,
			amount: Decimal::ONE,
			result: None,
			tx_hash: "0x01".to_string(),
		}];
		assert!(matches!(
			check_integrity(EPOCH, &up_only),
			Err(EngineError::IntegrityCheckFailed { epoch: EPOCH, .. })
		));
		assert!(check_integrity(EPOCH, &[]).is_err());
	}

	#[tokio::test]
	async fn quarantined_epochs_are_skipped() {
		let rpc = MockPredictionRpc::new();
		let mut store = MockStore::new();
		store.expect_failed_epoch().returning(|epoch| {
			Ok(Some(FailedEpoch {
				epoch,
				error_message: "no DOWN bets in range".to_string(),
				last_attempt_ts: "2024-01-01 00:00:00".to_string(),
				failure_count: 3,
			}))
		});

		let context = BackfillContext::new(Arc::new(rpc), Arc::new(store), 3);
		assert_eq!(
			context.process_epoch(EPOCH).await.unwrap(),
			EpochOutcome::Skipped(SkipReason::Quarantined)
		);
	}

	#[tokio::test]
	async fn stored_epochs_are_skipped_without_chain_traffic() {
		let rpc = MockPredictionRpc::new();
		let mut store = MockStore::new();
		store.expect_failed_epoch().returning(|_| Ok(None));
		store.expect_round_exists().returning(|_| Ok(true));

		let context = BackfillContext::new(Arc::new(rpc), Arc::new(store), 3);
		assert_eq!(
			context.process_epoch(EPOCH).await.unwrap(),
			EpochOutcome::Skipped(SkipReason::AlreadyStored)
		);
	}

	#[tokio::test]
	async fn unclosed_rounds_are_skipped_silently() {
		let mut rpc = MockPredictionRpc::new();
		rpc.expect_round().returning(|_| {
			let mut view = closed_view();
			view.close_timestamp = 0;
			Ok(view)
		});
		let mut store = MockStore::new();
		store.expect_failed_epoch().returning(|_| Ok(None));
		store.expect_round_exists().returning(|_| Ok(false));

		let context = BackfillContext::new(Arc::new(rpc), Arc::new(store), 3);
		assert_eq!(
			context.process_epoch(EPOCH).await.unwrap(),
			EpochOutcome::Skipped(SkipReason::RoundNotClosed)
		);
	}

	#[tokio::test]
	async fn unbounded_ranges_are_skipped_until_the_next_round_starts() {
		let mut rpc = MockPredictionRpc::new();
		rpc.expect_round().returning(|epoch| {
			if epoch == EPOCH {
				Ok(closed_view())
			} else {
				Ok(next_view(0))
			}
		});
		let mut store = MockStore::new();
		store.expect_failed_epoch().returning(|_| Ok(None));
		store.expect_round_exists().returning(|_| Ok(false));

		let context = BackfillContext::new(Arc::new(rpc), Arc::new(store), 3);
		assert_eq!(
			context.process_epoch(EPOCH).await.unwrap(),
			EpochOutcome::Skipped(SkipReason::NextRoundNotStarted)
		);
	}

	#[tokio::test]
	async fn committed_epoch_runs_cleanup_and_offline_detection() {
		let mut rpc = rpc_with_linear_chain();
		rpc.expect_round().returning(|epoch| {
			if epoch == EPOCH {
				Ok(closed_view())
			} else {
				Ok(next_view(1600))
			}
		});
		rpc.expect_epoch_events()
			.withf(|from, to| (*from, *to) == (1000, 1600))
			.times(1)
			.returning(|_, _| Ok(scenario_events()));
		rpc.expect_current_epoch().returning(|| Ok(EPOCH + 2));

		let mut store = MockStore::new();
		store.expect_failed_epoch().returning(|_| Ok(None));
		store.expect_round_exists().returning(|_| Ok(false));
		store
			.expect_commit_epoch()
			.times(1)
			.withf(|round, bets, claims| {
				round.epoch == EPOCH &&
					round.result == Some(Direction::Up) &&
					round.up_payout.to_string() == "1.6167" &&
					bets.len() == 2 && claims.len() == 1 &&
					claims[0].epoch == EPOCH && claims[0].bet_epoch == EPOCH
			})
			.returning(|_, _, _| Ok(()));
		store
			.expect_delete_real_bets_for_epoch()
			.withf(|epoch| *epoch == EPOCH)
			.times(1)
			.returning(|_| Ok(4));
		store
			.expect_sweep_real_bets_below()
			.withf(|cutoff| *cutoff == EPOCH)
			.times(1)
			.returning(|_| Ok(0));
		store.expect_claim_rows_per_wallet().times(1).returning(|_| {
			Ok(vec![WalletClaimGroup {
				wallet_address: "0xaaa".to_string(),
				claim_count: 1,
				total_amount: Decimal::new(582, 2),
			}])
		});

		let context = BackfillContext::new(Arc::new(rpc), Arc::new(store), 3);
		assert_eq!(
			context.process_epoch(EPOCH).await.unwrap(),
			EpochOutcome::Committed { bets: 2, claims: 1 }
		);
	}

	#[tokio::test]
	async fn integrity_failure_deletes_partial_rows_and_counts_strikes() {
		let mut rpc = rpc_with_linear_chain();
		rpc.expect_round().returning(|epoch| {
			if epoch == EPOCH {
				Ok(closed_view())
			} else {
				Ok(next_view(1600))
			}
		});
		rpc.expect_epoch_events().returning(|_, _| {
			let mut events = scenario_events();
			events.bear.clear();
			Ok(events)
		});

		let mut store = MockStore::new();
		store.expect_failed_epoch().returning(|_| Ok(None));
		store.expect_round_exists().returning(|_| Ok(false));
		store.expect_delete_epoch_rows().times(1).returning(|_| Ok(()));
		store
			.expect_record_epoch_failure()
			.times(1)
			.withf(|epoch, message, _| *epoch == EPOCH && message.contains("DOWN"))
			.returning(|_, _, _| Ok(1));
		// No commit, no cleanup, no detection.
		store.expect_commit_epoch().never();

		let context = BackfillContext::new(Arc::new(rpc), Arc::new(store), 3);
		assert_eq!(
			context.process_epoch(EPOCH).await.unwrap(),
			EpochOutcome::Failed { failures: 1 }
		);
	}

	#[tokio::test]
	async fn third_strike_reports_quarantine() {
		let mut rpc = rpc_with_linear_chain();
		rpc.expect_round().returning(|epoch| {
			if epoch == EPOCH {
				Ok(closed_view())
			} else {
				Ok(next_view(1600))
			}
		});
		rpc.expect_epoch_events().returning(|_, _| {
			let mut events = scenario_events();
			events.bull.clear();
			Ok(events)
		});

		let mut store = MockStore::new();
		store.expect_failed_epoch().returning(|epoch| {
			Ok(Some(FailedEpoch {
				epoch,
				error_message: "no UP bets in range".to_string(),
				last_attempt_ts: "2024-01-01 00:00:00".to_string(),
				failure_count: 2,
			}))
		});
		store.expect_round_exists().returning(|_| Ok(false));
		store.expect_delete_epoch_rows().returning(|_| Ok(()));
		store.expect_record_epoch_failure().returning(|_, _, _| Ok(3));

		let context = BackfillContext::new(Arc::new(rpc), Arc::new(store), 3);
		assert_eq!(
			context.process_epoch(EPOCH).await.unwrap(),
			EpochOutcome::Failed { failures: 3 }
		);
	}

	#[tokio::test]
	async fn range_mode_reports_per_epoch_outcomes() {
		let mut rpc = MockPredictionRpc::new();
		rpc.expect_round().returning(|_| {
			let mut view = closed_view();
			view.close_timestamp = 0;
			Ok(view)
		});
		let mut store = MockStore::new();
		store.expect_failed_epoch().returning(|_| Ok(None));
		store.expect_round_exists().returning(|epoch| Ok(epoch == 11));

		let context = BackfillContext::new(Arc::new(rpc), Arc::new(store), 3);
		let report = process_range(&context, 10, 12).await.unwrap();
		// Epoch 11 is stored, 10 and 12 skip as not-closed; nothing commits.
		assert_eq!(report, RangeReport { committed: 0, skipped: 3, failed: 0, bets: 0, claims: 0 });

		assert!(process_range(&context, 0, 5).await.is_err());
		assert!(process_range(&context, 9, 3).await.is_err());
	}

	#[tokio::test]
	async fn main_worker_stops_between_epochs_when_signalled() {
		let mut rpc = MockPredictionRpc::new();
		rpc.expect_current_epoch().returning(|| Ok(10));
		rpc.expect_round().returning(|_| {
			let mut view = closed_view();
			view.close_timestamp = 0;
			Ok(view)
		});
		let mut store = MockStore::new();
		store.expect_failed_epoch().returning(|_| Ok(None));
		store.expect_round_exists().returning(|_| Ok(false));

		let context = BackfillContext::new(Arc::new(rpc), Arc::new(store), 3);
		let (stop_sender, stop_receiver) = watch::channel(false);
		let worker = tokio::spawn(run_main_worker(context, stop_receiver));

		// Let it take a few epochs, then stop; the worker must exit promptly.
		tokio::time::sleep(Duration::from_millis(50)).await;
		stop_sender.send(true).unwrap();
		tokio::time::timeout(Duration::from_secs(5), worker).await.unwrap().unwrap().unwrap();
	}
}
