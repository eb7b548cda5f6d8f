//! Contract surface of the prediction market.
//!
//! Bindings are generated from the human-readable ABI below; everything the rest of the
//! engine touches is converted here into domain types (fixed-precision decimals, i64
//! epochs, lowercased hex strings), so raw `U256`/`I256` values never leak past this
//! module.

use anyhow::{anyhow, bail, Result};
use ethers::{
	abi::RawLog,
	contract::{abigen, EthLogDecode},
	types::{Address, Log, H256, I256, U256},
};
use rust_decimal::Decimal;

use crate::records::Direction;

abigen!(
	PredictionMarket,
	r#"[
		function currentEpoch() external view returns (uint256)
		function rounds(uint256) external view returns (uint256, uint256, uint256, uint256, int256, int256, uint256, uint256, uint256, uint256, uint256, uint256, uint256, bool)
		event BetBull(address indexed sender, uint256 indexed epoch, uint256 amount)
		event BetBear(address indexed sender, uint256 indexed epoch, uint256 amount)
		event Claim(address indexed sender, uint256 indexed epoch, uint256 amount)
		event StartRound(uint256 indexed epoch)
		event LockRound(uint256 indexed epoch, uint256 indexed roundId, int256 price)
	]"#
);

/// Stake amounts and payouts carry 18 fractional digits on chain.
pub const AMOUNT_SCALE: u32 = 18;

/// Oracle prices carry 8 fractional digits.
pub const PRICE_SCALE: u32 = 8;

/// The `rounds(epoch)` view as the engine consumes it.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundView {
	pub epoch: i64,
	pub start_timestamp: u64,
	pub lock_timestamp: u64,
	pub close_timestamp: u64,
	pub lock_price: Decimal,
	pub close_price: Decimal,
	pub total_amount: Decimal,
	pub bull_amount: Decimal,
	pub bear_amount: Decimal,
	pub oracle_called: bool,
}

/// Lifecycle phase, reported to fan-out clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStatus {
	Pending,
	Betting,
	Locked,
	Ended,
}

impl RoundStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			RoundStatus::Pending => "pending",
			RoundStatus::Betting => "betting",
			RoundStatus::Locked => "locked",
			RoundStatus::Ended => "ended",
		}
	}
}

type RoundsReturn =
	(U256, U256, U256, U256, I256, I256, U256, U256, U256, U256, U256, U256, U256, bool);

impl RoundView {
	pub fn from_rounds_return(raw: RoundsReturn) -> Result<Self> {
		let (
			epoch,
			start_timestamp,
			lock_timestamp,
			close_timestamp,
			lock_price,
			close_price,
			_lock_oracle_id,
			_close_oracle_id,
			total_amount,
			bull_amount,
			bear_amount,
			_reward_base_cal_amount,
			_reward_amount,
			oracle_called,
		) = raw;
		Ok(RoundView {
			epoch: u256_to_epoch(epoch)?,
			start_timestamp: u256_to_u64(start_timestamp, "startTimestamp")?,
			lock_timestamp: u256_to_u64(lock_timestamp, "lockTimestamp")?,
			close_timestamp: u256_to_u64(close_timestamp, "closeTimestamp")?,
			lock_price: i256_to_price(lock_price)?,
			close_price: i256_to_price(close_price)?,
			total_amount: u256_to_amount(total_amount)?,
			bull_amount: u256_to_amount(bull_amount)?,
			bear_amount: u256_to_amount(bear_amount)?,
			oracle_called,
		})
	}

	pub fn is_closed(&self) -> bool {
		self.close_timestamp != 0
	}

	/// `None` is a draw (prices equal), only meaningful once the round has closed.
	pub fn result(&self) -> Option<Direction> {
		match self.close_price.cmp(&self.lock_price) {
			std::cmp::Ordering::Greater => Some(Direction::Up),
			std::cmp::Ordering::Less => Some(Direction::Down),
			std::cmp::Ordering::Equal => None,
		}
	}

	/// Phase derivation. A scheduled round carries all three timestamps from the start,
	/// so the zero-until-set price fields mark the lock and close transitions.
	pub fn status(&self) -> RoundStatus {
		if self.start_timestamp == 0 {
			RoundStatus::Pending
		} else if self.oracle_called || !self.close_price.is_zero() {
			RoundStatus::Ended
		} else if !self.lock_price.is_zero() {
			RoundStatus::Locked
		} else {
			RoundStatus::Betting
		}
	}
}

/// Block header fields the engine needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
	pub number: u64,
	pub timestamp: u64,
}

/// A bet event from the pull surface. Direction is carried by which stream it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct BetEvent {
	pub epoch: i64,
	pub wallet: String,
	pub amount: Decimal,
	pub tx_hash: String,
	pub block_number: u64,
}

/// A claim event from the pull surface. The on-chain `epoch` argument names the round the
/// reward is for, which is why it lands here as `bet_epoch`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimEvent {
	pub bet_epoch: i64,
	pub wallet: String,
	pub amount: Decimal,
	pub tx_hash: String,
	pub block_number: u64,
}

/// The three event streams of one block range, fetched in parallel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpochEvents {
	pub bull: Vec<BetEvent>,
	pub bear: Vec<BetEvent>,
	pub claims: Vec<ClaimEvent>,
}

/// A live bet from the push surface.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveBet {
	pub epoch: i64,
	pub wallet: String,
	pub direction: Direction,
	pub amount: Decimal,
	pub tx_hash: String,
}

/// Typed events on the push surface.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainEvent {
	Bet(LiveBet),
	StartRound { epoch: i64 },
	LockRound { epoch: i64 },
	ConnectionStatus { connected: bool },
}

/// Decodes a raw subscription log into a push-surface event. Events outside the push
/// surface (claims, unknown topics) decode to `None`.
pub fn decode_chain_event(log: Log) -> Result<Option<ChainEvent>> {
	let tx_hash = log
		.transaction_hash
		.ok_or_else(|| anyhow!("log without transaction hash"))?;
	let raw = RawLog { topics: log.topics, data: log.data.to_vec() };
	let event = match PredictionMarketEvents::decode_log(&raw) {
		Ok(event) => event,
		// Not one of ours; the contract emits more event types than we subscribe to.
		Err(_) => return Ok(None),
	};
	Ok(match event {
		PredictionMarketEvents::BetBullFilter(bet) => Some(ChainEvent::Bet(LiveBet {
			epoch: u256_to_epoch(bet.epoch)?,
			wallet: wallet_string(bet.sender),
			direction: Direction::Up,
			amount: u256_to_amount(bet.amount)?,
			tx_hash: tx_hash_string(tx_hash),
		})),
		PredictionMarketEvents::BetBearFilter(bet) => Some(ChainEvent::Bet(LiveBet {
			epoch: u256_to_epoch(bet.epoch)?,
			wallet: wallet_string(bet.sender),
			direction: Direction::Down,
			amount: u256_to_amount(bet.amount)?,
			tx_hash: tx_hash_string(tx_hash),
		})),
		PredictionMarketEvents::StartRoundFilter(start) =>
			Some(ChainEvent::StartRound { epoch: u256_to_epoch(start.epoch)? }),
		PredictionMarketEvents::LockRoundFilter(lock) =>
			Some(ChainEvent::LockRound { epoch: u256_to_epoch(lock.epoch)? }),
		PredictionMarketEvents::ClaimFilter(_) => None,
	})
}

/// Lowercased full-width hex, `0x`-prefixed.
pub fn wallet_string(address: Address) -> String {
	format!("{address:#x}")
}

pub fn tx_hash_string(tx_hash: H256) -> String {
	format!("{tx_hash:#x}")
}

pub fn u256_to_epoch(value: U256) -> Result<i64> {
	if value.bits() > 62 {
		bail!("epoch {value} out of range");
	}
	Ok(value.as_u64() as i64)
}

fn u256_to_u64(value: U256, field: &str) -> Result<u64> {
	if value.bits() > 64 {
		bail!("{field} {value} out of range");
	}
	Ok(value.as_u64())
}

/// Wei-scale stake amount to an 18-digit decimal. Fails on values outside the decimal
/// mantissa rather than truncating.
pub fn u256_to_amount(value: U256) -> Result<Decimal> {
	if value.bits() > 96 {
		bail!("amount {value} does not fit a fixed-precision decimal");
	}
	Decimal::try_from_i128_with_scale(value.as_u128() as i128, AMOUNT_SCALE)
		.map_err(|error| anyhow!("amount {value}: {error}"))
}

/// Oracle price to an 8-digit decimal.
pub fn i256_to_price(value: I256) -> Result<Decimal> {
	let raw = i128::try_from(value).map_err(|_| anyhow!("price {value} out of range"))?;
	Decimal::try_from_i128_with_scale(raw, PRICE_SCALE)
		.map_err(|error| anyhow!("price {value}: {error}"))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn view_with(lock_price: i64, close_price: i64) -> RoundView {
		RoundView {
			epoch: 100,
			start_timestamp: 1_700_000_000,
			lock_timestamp: 1_700_000_300,
			close_timestamp: 1_700_000_600,
			lock_price: Decimal::new(lock_price, PRICE_SCALE),
			close_price: Decimal::new(close_price, PRICE_SCALE),
			total_amount: Decimal::from(10),
			bull_amount: Decimal::from(6),
			bear_amount: Decimal::from(4),
			oracle_called: true,
		}
	}

	#[test]
	fn amount_conversion_keeps_wei_precision() {
		let one_and_a_half = U256::from(1_500_000_000_000_000_000u128);
		assert_eq!(u256_to_amount(one_and_a_half).unwrap().to_string(), "1.500000000000000000");
	}

	#[test]
	fn amount_conversion_rejects_mantissa_overflow() {
		assert!(u256_to_amount(U256::MAX).is_err());
	}

	#[test]
	fn price_conversion_handles_negative_values() {
		assert_eq!(i256_to_price(I256::from(-12_345_678_900i64)).unwrap().to_string(), "-123.45678900");
	}

	#[test]
	fn round_result_follows_price_movement() {
		assert_eq!(view_with(30_000_000_000, 30_150_000_000).result(), Some(Direction::Up));
		assert_eq!(view_with(30_000_000_000, 29_000_000_000).result(), Some(Direction::Down));
		assert_eq!(view_with(30_000_000_000, 30_000_000_000).result(), None);
	}

	#[test]
	fn status_progression() {
		let mut view = view_with(0, 0);
		view.oracle_called = false;
		assert_eq!(view.status(), RoundStatus::Betting);
		view.lock_price = Decimal::new(30_000_000_000, PRICE_SCALE);
		assert_eq!(view.status(), RoundStatus::Locked);
		view.close_price = Decimal::new(30_100_000_000, PRICE_SCALE);
		assert_eq!(view.status(), RoundStatus::Ended);
		view.start_timestamp = 0;
		assert_eq!(view.status(), RoundStatus::Pending);
	}

	#[test]
	fn wallet_strings_are_lowercased_hex() {
		let address: Address = "0x541f563237A309B3A61E33BDf07a8930Bdba8D99".parse().unwrap();
		assert_eq!(wallet_string(address), "0x541f563237a309b3a61e33bdf07a8930bdba8d99");
	}

	#[test]
	fn epoch_conversion_guards_range() {
		assert_eq!(u256_to_epoch(U256::from(12_345u64)).unwrap(), 12_345);
		assert!(u256_to_epoch(U256::MAX).is_err());
	}
}
