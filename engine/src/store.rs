//! Transactional Postgres access.
//!
//! The store is the only shared mutable resource in the process: both pipelines write
//! through it and nothing else touches the tables. Writes are idempotent on natural keys
//! (`round` by epoch, `hisbet`/`claim` by tx hash) so the two pipelines can interleave
//! without read-modify-write races, and the per-epoch commit is a single transaction.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{
	postgres::{PgPool, PgPoolOptions},
	Row,
};
use tokio::sync::RwLock;

use crate::{
	constants::{PG_ACQUIRE_TIMEOUT, PG_MAX_CONNECTIONS},
	errors::EngineError,
	records::{Claim, FailedEpoch, HisBet, MultiClaimFinding, RealBet, Round},
};

type StoreResult<T> = Result<T, EngineError>;

/// Per-wallet claim aggregate for one processing epoch. `claim_count` is either raw rows
/// or distinct `bet_epoch`s depending on which grouping produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletClaimGroup {
	pub wallet_address: String,
	pub claim_count: i64,
	pub total_amount: Decimal,
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
	/// Atomic per-epoch commit: the round row, all its bets and all its claims become
	/// visible together or not at all.
	async fn commit_epoch(
		&self,
		round: &Round,
		bets: &[HisBet],
		claims: &[Claim],
	) -> StoreResult<()>;

	async fn round_exists(&self, epoch: i64) -> StoreResult<bool>;

	async fn rounds_present_in(&self, from_epoch: i64, to_epoch: i64) -> StoreResult<i64>;

	async fn failed_epoch(&self, epoch: i64) -> StoreResult<Option<FailedEpoch>>;

	/// Upserts the quarantine row, incrementing its strike counter. Returns the new count.
	async fn record_epoch_failure(
		&self,
		epoch: i64,
		error_message: &str,
		attempt_ts: &str,
	) -> StoreResult<i32>;

	/// Removes any partial row set for the epoch (bets, claims, round).
	async fn delete_epoch_rows(&self, epoch: i64) -> StoreResult<()>;

	async fn insert_real_bet(&self, bet: &RealBet) -> StoreResult<()>;

	async fn delete_real_bets_for_epoch(&self, epoch: i64) -> StoreResult<u64>;

	/// `DELETE FROM realbet WHERE epoch < cutoff`.
	async fn sweep_real_bets_below(&self, cutoff_epoch: i64) -> StoreResult<u64>;

	async fn recent_real_bets(&self, limit: i64) -> StoreResult<Vec<RealBet>>;

	async fn real_bet_epochs(&self) -> StoreResult<Vec<i64>>;

	/// Claims of one processing epoch grouped by wallet, counting raw rows.
	async fn claim_rows_per_wallet(&self, epoch: i64) -> StoreResult<Vec<WalletClaimGroup>>;

	/// Claims of one processing epoch grouped by wallet, counting distinct `bet_epoch`s —
	/// a wallet harvesting many prior rounds in one window.
	async fn distinct_bet_epochs_per_wallet(
		&self,
		epoch: i64,
	) -> StoreResult<Vec<WalletClaimGroup>>;

	async fn upsert_multi_claim(&self, finding: &MultiClaimFinding) -> StoreResult<()>;

	async fn multi_claims_in(&self, from_epoch: i64, to_epoch: i64) -> StoreResult<i64>;

	async fn wallet_note_exists(&self, wallet_address: &str) -> StoreResult<bool>;

	async fn upsert_wallet_note(
		&self,
		wallet_address: &str,
		note: &str,
		created_at: &str,
	) -> StoreResult<()>;
}

pub struct PostgresStore {
	database_url: String,
	pool: RwLock<PgPool>,
	unhealthy: std::sync::atomic::AtomicBool,
}

impl PostgresStore {
	pub async fn connect(database_url: &str) -> StoreResult<Self> {
		let pool = Self::new_pool(database_url).await?;
		Ok(PostgresStore {
			database_url: database_url.to_string(),
			pool: RwLock::new(pool),
			unhealthy: std::sync::atomic::AtomicBool::new(false),
		})
	}

	async fn new_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
		PgPoolOptions::new()
			.max_connections(PG_MAX_CONNECTIONS)
			.acquire_timeout(PG_ACQUIRE_TIMEOUT)
			.connect(database_url)
			.await
	}

	/// Hands out the pool, re-establishing it first if a previous operation marked it
	/// unhealthy.
	async fn healthy_pool(&self) -> StoreResult<PgPool> {
		use std::sync::atomic::Ordering;
		if self.unhealthy.load(Ordering::Acquire) {
			let mut pool = self.pool.write().await;
			// Double-checked: another caller may have already reconnected.
			if self.unhealthy.load(Ordering::Acquire) {
				tracing::warn!("database pool marked unhealthy, reconnecting");
				let fresh = Self::new_pool(&self.database_url).await?;
				pool.close().await;
				*pool = fresh;
				self.unhealthy.store(false, Ordering::Release);
			}
			return Ok(pool.clone());
		}
		Ok(self.pool.read().await.clone())
	}

	/// Flags connection-shaped failures so the next operation reconnects.
	fn observe<T>(&self, result: Result<T, sqlx::Error>) -> StoreResult<T> {
		result.map_err(|error| {
			if matches!(
				error,
				sqlx::Error::Io(_) |
					sqlx::Error::PoolTimedOut |
					sqlx::Error::PoolClosed |
					sqlx::Error::Protocol(_) |
					sqlx::Error::Tls(_)
			) {
				self.unhealthy.store(true, std::sync::atomic::Ordering::Release);
			}
			EngineError::DatabaseUnavailable(error)
		})
	}

	/// Liveness probe. A failed probe reconnects immediately rather than waiting for the
	/// next operation.
	pub async fn probe(&self) -> StoreResult<()> {
		let pool = self.healthy_pool().await?;
		let result = sqlx::query("SELECT 1").execute(&pool).await.map(|_| ());
		match self.observe(result) {
			Ok(()) => Ok(()),
			Err(error) => {
				tracing::warn!("database probe failed: {error}");
				let pool = self.healthy_pool().await?;
				self.observe(sqlx::query("SELECT 1").execute(&pool).await.map(|_| ()))
			},
		}
	}

	/// Closes the pool; used on shutdown so in-flight writes drain.
	pub async fn close(&self) {
		self.pool.read().await.close().await;
	}
}

#[async_trait]
impl Store for PostgresStore {
	async fn commit_epoch(
		&self,
		round: &Round,
		bets: &[HisBet],
		claims: &[Claim],
	) -> StoreResult<()> {
		let pool = self.healthy_pool().await?;
		let mut tx = self.observe(pool.begin().await)?;

		let round_insert = sqlx::query(
			"INSERT INTO round \
				(epoch, start_ts, lock_ts, close_ts, lock_price, close_price, result, \
				 total_amount, up_amount, down_amount, up_payout, down_payout) \
			 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
			 ON CONFLICT (epoch) DO NOTHING",
		)
		.bind(round.epoch)
		.bind(&round.start_ts)
		.bind(&round.lock_ts)
		.bind(&round.close_ts)
		.bind(round.lock_price)
		.bind(round.close_price)
		.bind(round.result.map(|direction| direction.as_str()))
		.bind(round.total_amount)
		.bind(round.up_amount)
		.bind(round.down_amount)
		.bind(round.up_payout)
		.bind(round.down_payout)
		.execute(&mut *tx)
		.await;
		self.observe(round_insert)?;

		for bet in bets {
			let bet_insert = sqlx::query(
				"INSERT INTO hisbet \
					(epoch, bet_ts, wallet_address, bet_direction, amount, result, tx_hash) \
				 VALUES ($1, $2, $3, $4, $5, $6, $7) \
				 ON CONFLICT (tx_hash) DO NOTHING",
			)
			.bind(bet.epoch)
			.bind(&bet.bet_ts)
			.bind(&bet.wallet_address)
			.bind(bet.bet_direction.as_str())
			.bind(bet.amount)
			.bind(bet.result.map(|result| result.as_str()))
			.bind(&bet.tx_hash)
			.execute(&mut *tx)
			.await;
			self.observe(bet_insert)?;
		}

		for claim in claims {
			let claim_insert = sqlx::query(
				"INSERT INTO claim \
					(epoch, claim_ts, wallet_address, claim_amount, bet_epoch, tx_hash) \
				 VALUES ($1, $2, $3, $4, $5, $6) \
				 ON CONFLICT (tx_hash) DO NOTHING",
			)
			.bind(claim.epoch)
			.bind(&claim.claim_ts)
			.bind(&claim.wallet_address)
			.bind(claim.claim_amount)
			.bind(claim.bet_epoch)
			.bind(&claim.tx_hash)
			.execute(&mut *tx)
			.await;
			self.observe(claim_insert)?;
		}

		self.observe(tx.commit().await)
	}

	async fn round_exists(&self, epoch: i64) -> StoreResult<bool> {
		let pool = self.healthy_pool().await?;
		let row = self.observe(
			sqlx::query("SELECT EXISTS (SELECT 1 FROM round WHERE epoch = $1) AS present")
				.bind(epoch)
				.fetch_one(&pool)
				.await,
		)?;
		Ok(row.try_get("present")?)
	}

	async fn rounds_present_in(&self, from_epoch: i64, to_epoch: i64) -> StoreResult<i64> {
		let pool = self.healthy_pool().await?;
		let row = self.observe(
			sqlx::query("SELECT COUNT(*)::bigint AS rounds FROM round WHERE epoch BETWEEN $1 AND $2")
				.bind(from_epoch)
				.bind(to_epoch)
				.fetch_one(&pool)
				.await,
		)?;
		Ok(row.try_get("rounds")?)
	}

	async fn failed_epoch(&self, epoch: i64) -> StoreResult<Option<FailedEpoch>> {
		let pool = self.healthy_pool().await?;
		let row = self.observe(
			sqlx::query(
				"SELECT epoch, error_message, last_attempt_ts, failure_count \
				 FROM failed_epoch WHERE epoch = $1",
			)
			.bind(epoch)
			.fetch_optional(&pool)
			.await,
		)?;
		row.map(|row| {
			Ok(FailedEpoch {
				epoch: row.try_get("epoch")?,
				error_message: row.try_get("error_message")?,
				last_attempt_ts: row.try_get("last_attempt_ts")?,
				failure_count: row.try_get("failure_count")?,
			})
		})
		.transpose()
	}

	async fn record_epoch_failure(
		&self,
		epoch: i64,
		error_message: &str,
		attempt_ts: &str,
	) -> StoreResult<i32> {
		let pool = self.healthy_pool().await?;
		let row = self.observe(
			sqlx::query(
				"INSERT INTO failed_epoch (epoch, error_message, last_attempt_ts, failure_count) \
				 VALUES ($1, $2, $3, 1) \
				 ON CONFLICT (epoch) DO UPDATE SET \
					error_message = EXCLUDED.error_message, \
					last_attempt_ts = EXCLUDED.last_attempt_ts, \
					failure_count = failed_epoch.failure_count + 1 \
				 RETURNING failure_count",
			)
			.bind(epoch)
			.bind(error_message)
			.bind(attempt_ts)
			.fetch_one(&pool)
			.await,
		)?;
		Ok(row.try_get("failure_count")?)
	}

	async fn delete_epoch_rows(&self, epoch: i64) -> StoreResult<()> {
		let pool = self.healthy_pool().await?;
		let mut tx = self.observe(pool.begin().await)?;
		for statement in [
			"DELETE FROM hisbet WHERE epoch = $1",
			"DELETE FROM claim WHERE epoch = $1",
			"DELETE FROM round WHERE epoch = $1",
		] {
			let result = sqlx::query(statement).bind(epoch).execute(&mut *tx).await;
			self.observe(result)?;
		}
		self.observe(tx.commit().await)
	}

	async fn insert_real_bet(&self, bet: &RealBet) -> StoreResult<()> {
		let pool = self.healthy_pool().await?;
		self.observe(
			sqlx::query(
				"INSERT INTO realbet (epoch, bet_ts, wallet_address, bet_direction, amount) \
				 VALUES ($1, $2, $3, $4, $5)",
			)
			.bind(bet.epoch)
			.bind(&bet.bet_ts)
			.bind(&bet.wallet_address)
			.bind(bet.bet_direction.as_str())
			.bind(bet.amount)
			.execute(&pool)
			.await,
		)?;
		Ok(())
	}

	async fn delete_real_bets_for_epoch(&self, epoch: i64) -> StoreResult<u64> {
		let pool = self.healthy_pool().await?;
		let result = self.observe(
			sqlx::query("DELETE FROM realbet WHERE epoch = $1").bind(epoch).execute(&pool).await,
		)?;
		Ok(result.rows_affected())
	}

	async fn sweep_real_bets_below(&self, cutoff_epoch: i64) -> StoreResult<u64> {
		let pool = self.healthy_pool().await?;
		let result = self.observe(
			sqlx::query("DELETE FROM realbet WHERE epoch < $1")
				.bind(cutoff_epoch)
				.execute(&pool)
				.await,
		)?;
		Ok(result.rows_affected())
	}

	async fn recent_real_bets(&self, limit: i64) -> StoreResult<Vec<RealBet>> {
		let pool = self.healthy_pool().await?;
		let rows = self.observe(
			sqlx::query(
				"SELECT epoch, bet_ts, wallet_address, bet_direction, amount \
				 FROM realbet ORDER BY bet_ts DESC LIMIT $1",
			)
			.bind(limit)
			.fetch_all(&pool)
			.await,
		)?;
		rows.into_iter()
			.map(|row| {
				Ok(RealBet {
					epoch: row.try_get("epoch")?,
					bet_ts: row.try_get("bet_ts")?,
					wallet_address: row.try_get("wallet_address")?,
					bet_direction: row.try_get::<String, _>("bet_direction")?.parse()?,
					amount: row.try_get("amount")?,
				})
			})
			.collect()
	}

	async fn real_bet_epochs(&self) -> StoreResult<Vec<i64>> {
		let pool = self.healthy_pool().await?;
		let rows = self.observe(
			sqlx::query("SELECT DISTINCT epoch FROM realbet ORDER BY epoch")
				.fetch_all(&pool)
				.await,
		)?;
		rows.into_iter().map(|row| Ok(row.try_get("epoch")?)).collect()
	}

	async fn claim_rows_per_wallet(&self, epoch: i64) -> StoreResult<Vec<WalletClaimGroup>> {
		let pool = self.healthy_pool().await?;
		let rows = self.observe(
			sqlx::query(
				"SELECT wallet_address, COUNT(*)::bigint AS claim_count, \
					SUM(claim_amount) AS total_amount \
				 FROM claim WHERE epoch = $1 GROUP BY wallet_address",
			)
			.bind(epoch)
			.fetch_all(&pool)
			.await,
		)?;
		rows.into_iter().map(wallet_claim_group).collect()
	}

	async fn distinct_bet_epochs_per_wallet(
		&self,
		epoch: i64,
	) -> StoreResult<Vec<WalletClaimGroup>> {
		let pool = self.healthy_pool().await?;
		let rows = self.observe(
			sqlx::query(
				"SELECT wallet_address, COUNT(DISTINCT bet_epoch)::bigint AS claim_count, \
					SUM(claim_amount) AS total_amount \
				 FROM claim WHERE epoch = $1 GROUP BY wallet_address",
			)
			.bind(epoch)
			.fetch_all(&pool)
			.await,
		)?;
		rows.into_iter().map(wallet_claim_group).collect()
	}

	async fn upsert_multi_claim(&self, finding: &MultiClaimFinding) -> StoreResult<()> {
		let pool = self.healthy_pool().await?;
		self.observe(
			sqlx::query(
				"INSERT INTO multi_claims \
					(epoch, wallet_address, claim_count, total_amount, created_at) \
				 VALUES ($1, $2, $3, $4, $5) \
				 ON CONFLICT (epoch, wallet_address) DO UPDATE SET \
					claim_count = EXCLUDED.claim_count, \
					total_amount = EXCLUDED.total_amount",
			)
			.bind(finding.epoch)
			.bind(&finding.wallet_address)
			.bind(finding.claim_count)
			.bind(finding.total_amount)
			.bind(&finding.created_at)
			.execute(&pool)
			.await,
		)?;
		Ok(())
	}

	async fn multi_claims_in(&self, from_epoch: i64, to_epoch: i64) -> StoreResult<i64> {
		let pool = self.healthy_pool().await?;
		let row = self.observe(
			sqlx::query(
				"SELECT COUNT(*)::bigint AS findings FROM multi_claims \
				 WHERE epoch BETWEEN $1 AND $2",
			)
			.bind(from_epoch)
			.bind(to_epoch)
			.fetch_one(&pool)
			.await,
		)?;
		Ok(row.try_get("findings")?)
	}

	async fn wallet_note_exists(&self, wallet_address: &str) -> StoreResult<bool> {
		let pool = self.healthy_pool().await?;
		let row = self.observe(
			sqlx::query(
				"SELECT EXISTS (SELECT 1 FROM wallet_note WHERE wallet_address = $1) AS present",
			)
			.bind(wallet_address)
			.fetch_one(&pool)
			.await,
		)?;
		Ok(row.try_get("present")?)
	}

	async fn upsert_wallet_note(
		&self,
		wallet_address: &str,
		note: &str,
		created_at: &str,
	) -> StoreResult<()> {
		let pool = self.healthy_pool().await?;
		self.observe(
			sqlx::query(
				"INSERT INTO wallet_note (wallet_address, note, created_at) \
				 VALUES ($1, $2, $3) \
				 ON CONFLICT (wallet_address) DO UPDATE SET note = EXCLUDED.note",
			)
			.bind(wallet_address)
			.bind(note)
			.bind(created_at)
			.execute(&pool)
			.await,
		)?;
		Ok(())
	}
}

fn wallet_claim_group(row: sqlx::postgres::PgRow) -> StoreResult<WalletClaimGroup> {
	Ok(WalletClaimGroup {
		wallet_address: row.try_get("wallet_address")?,
		claim_count: row.try_get("claim_count")?,
		total_amount: row.try_get("total_amount")?,
	})
}
