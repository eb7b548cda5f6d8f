//! Rate-limited, retrying pull surface over the prediction contract.
//!
//! Every request takes a slot from the shared [RateLimiter] and runs under the
//! [RetryPolicy]; callers see either a value or `ChainRequestFailed` once the attempts are
//! exhausted. The [PredictionRpcApi] trait is the seam the pipelines consume, so tests
//! substitute fakes.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use ethers::{
	prelude::*,
	providers::{Http, Provider},
};
use utilities::SecretUrl;

use super::{
	contract::{
		tx_hash_string, u256_to_amount, u256_to_epoch, wallet_string, BetBearFilter, BetBullFilter,
		BetEvent, BlockInfo, ClaimEvent, ClaimFilter, EpochEvents, PredictionMarket, RoundView,
	},
	rate_limiter::RateLimiter,
	retry::RetryPolicy,
};
use crate::constants::{RPC_RETRY_ATTEMPTS, RPC_RETRY_BASE_DELAY};

#[async_trait]
pub trait PredictionRpcApi: Send + Sync {
	async fn current_epoch(&self) -> Result<i64>;

	async fn round(&self, epoch: i64) -> Result<RoundView>;

	async fn block_number(&self) -> Result<u64>;

	async fn block(&self, number: u64) -> Result<BlockInfo>;

	/// The three event streams of `[from_block, to_block]`, fetched concurrently.
	async fn epoch_events(&self, from_block: u64, to_block: u64) -> Result<EpochEvents>;
}

pub struct PredictionRpcClient {
	provider: Arc<Provider<Http>>,
	contract: PredictionMarket<Provider<Http>>,
	rate_limiter: RateLimiter,
	retry: RetryPolicy,
}

impl PredictionRpcClient {
	/// Builds the client and proves the endpoint/contract combination works with a single
	/// `currentEpoch()` round trip, so a misconfiguration fails at startup rather than
	/// deep inside a pipeline.
	pub async fn connect(
		http_endpoint: SecretUrl,
		contract_address: &str,
		requests_per_second: u32,
	) -> Result<Self> {
		let provider = Arc::new(
			Provider::<Http>::try_from(http_endpoint.as_ref())
				.with_context(|| format!("invalid RPC endpoint {http_endpoint}"))?,
		);
		let address: Address = contract_address
			.parse()
			.with_context(|| format!("invalid contract address {contract_address:?}"))?;

		let client = PredictionRpcClient {
			contract: PredictionMarket::new(address, provider.clone()),
			provider,
			rate_limiter: RateLimiter::new(requests_per_second),
			retry: RetryPolicy::linear(RPC_RETRY_ATTEMPTS, RPC_RETRY_BASE_DELAY),
		};

		let epoch = client.current_epoch().await.with_context(|| {
			format!("cannot reach the prediction contract at {address:#x} via {http_endpoint}")
		})?;
		if epoch == 0 {
			bail!("prediction contract at {address:#x} reports epoch 0; wrong address?");
		}
		tracing::info!("connected to prediction contract {address:#x}, current epoch {epoch}");
		Ok(client)
	}
}

#[async_trait]
impl PredictionRpcApi for PredictionRpcClient {
	async fn current_epoch(&self) -> Result<i64> {
		let epoch = self
			.retry
			.run("currentEpoch", || async move {
				self.rate_limiter.acquire().await;
				Ok(self.contract.current_epoch().call().await?)
			})
			.await?;
		u256_to_epoch(epoch)
	}

	async fn round(&self, epoch: i64) -> Result<RoundView> {
		let raw = self
			.retry
			.run("rounds", || async move {
				self.rate_limiter.acquire().await;
				Ok(self.contract.rounds(U256::from(epoch.max(0) as u64)).call().await?)
			})
			.await?;
		let mut view = RoundView::from_rounds_return(raw)?;
		// The contract returns a zeroed struct for rounds that never existed; carry the
		// requested epoch so callers can log it.
		if view.epoch == 0 {
			view.epoch = epoch;
		}
		Ok(view)
	}

	async fn block_number(&self) -> Result<u64> {
		let number = self
			.retry
			.run("blockNumber", || async move {
				self.rate_limiter.acquire().await;
				Ok(self.provider.get_block_number().await?)
			})
			.await?;
		Ok(number.as_u64())
	}

	async fn block(&self, number: u64) -> Result<BlockInfo> {
		let block = self
			.retry
			.run("getBlock", || async move {
				self.rate_limiter.acquire().await;
				self.provider
					.get_block(number)
					.await?
					.ok_or_else(|| anyhow!("block {number} returned None"))
			})
			.await?;
		Ok(BlockInfo {
			number: block.number.map(|value| value.as_u64()).unwrap_or(number),
			timestamp: block.timestamp.as_u64(),
		})
	}

	async fn epoch_events(&self, from_block: u64, to_block: u64) -> Result<EpochEvents> {
		let bulls = self.retry.run("getLogs(BetBull)", || async move {
			self.rate_limiter.acquire().await;
			Ok(self
				.contract
				.event::<BetBullFilter>()
				.from_block(from_block)
				.to_block(to_block)
				.query_with_meta()
				.await?)
		});
		let bears = self.retry.run("getLogs(BetBear)", || async move {
			self.rate_limiter.acquire().await;
			Ok(self
				.contract
				.event::<BetBearFilter>()
				.from_block(from_block)
				.to_block(to_block)
				.query_with_meta()
				.await?)
		});
		let claims = self.retry.run("getLogs(Claim)", || async move {
			self.rate_limiter.acquire().await;
			Ok(self
				.contract
				.event::<ClaimFilter>()
				.from_block(from_block)
				.to_block(to_block)
				.query_with_meta()
				.await?)
		});
		let (bulls, bears, claims) = tokio::try_join!(bulls, bears, claims)?;

		Ok(EpochEvents {
			bull: bulls
				.into_iter()
				.map(|(event, meta)| bet_event(event.sender, event.epoch, event.amount, &meta))
				.collect::<Result<_>>()?,
			bear: bears
				.into_iter()
				.map(|(event, meta)| bet_event(event.sender, event.epoch, event.amount, &meta))
				.collect::<Result<_>>()?,
			claims: claims
				.into_iter()
				.map(|(event, meta)| {
					Ok(ClaimEvent {
						bet_epoch: u256_to_epoch(event.epoch)?,
						wallet: wallet_string(event.sender),
						amount: u256_to_amount(event.amount)?,
						tx_hash: tx_hash_string(meta.transaction_hash),
						block_number: meta.block_number.as_u64(),
					})
				})
				.collect::<Result<_>>()?,
		})
	}
}

fn bet_event(sender: Address, epoch: U256, amount: U256, meta: &LogMeta) -> Result<BetEvent> {
	Ok(BetEvent {
		epoch: u256_to_epoch(epoch)?,
		wallet: wallet_string(sender),
		amount: u256_to_amount(amount)?,
		tx_hash: tx_hash_string(meta.transaction_hash),
		block_number: meta.block_number.as_u64(),
	})
}

#[cfg(test)]
pub mod mocks {
	use super::*;

	mockall::mock! {
		pub PredictionRpc {}

		#[async_trait]
		impl PredictionRpcApi for PredictionRpc {
			async fn current_epoch(&self) -> Result<i64>;
			async fn round(&self, epoch: i64) -> Result<RoundView>;
			async fn block_number(&self) -> Result<u64>;
			async fn block(&self, number: u64) -> Result<BlockInfo>;
			async fn epoch_events(&self, from_block: u64, to_block: u64) -> Result<EpochEvents>;
		}
	}
}
