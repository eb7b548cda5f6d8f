//! Persisted entities.
//!
//! Monetary values are fixed-precision decimals end to end; timestamps are canonical
//! Taipei strings (see `taipei_time`). Directions and results are closed sets enforced at
//! the type level, so a stray string can only be rejected at the parse boundary.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Which side of the round a bet is on. `bull`/`bear` in the on-chain ABI map 1:1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
	Up,
	Down,
}

impl Direction {
	pub fn as_str(&self) -> &'static str {
		match self {
			Direction::Up => "UP",
			Direction::Down => "DOWN",
		}
	}

	pub fn opposite(&self) -> Direction {
		match self {
			Direction::Up => Direction::Down,
			Direction::Down => Direction::Up,
		}
	}
}

impl std::str::FromStr for Direction {
	type Err = EngineError;

	fn from_str(value: &str) -> Result<Self, Self::Err> {
		match value {
			"UP" => Ok(Direction::Up),
			"DOWN" => Ok(Direction::Down),
			other => Err(EngineError::UnknownBetDirection(other.to_string())),
		}
	}
}

impl std::fmt::Display for Direction {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Outcome of a historical bet. Absent when the round drew.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BetResult {
	Win,
	Loss,
}

impl BetResult {
	pub fn as_str(&self) -> &'static str {
		match self {
			BetResult::Win => "WIN",
			BetResult::Loss => "LOSS",
		}
	}
}

/// One closed epoch's aggregated state.
#[derive(Debug, Clone, PartialEq)]
pub struct Round {
	pub epoch: i64,
	pub start_ts: String,
	pub lock_ts: String,
	pub close_ts: String,
	/// Oracle price at lock, 8 fractional digits.
	pub lock_price: Decimal,
	pub close_price: Decimal,
	/// `None` represents a draw.
	pub result: Option<Direction>,
	/// Pool sizes, 18 fractional digits.
	pub total_amount: Decimal,
	pub up_amount: Decimal,
	pub down_amount: Decimal,
	/// Multipliers net of the treasury fee, 4 fractional digits.
	pub up_payout: Decimal,
	pub down_payout: Decimal,
}

/// One on-chain bet event inside a closed epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct HisBet {
	pub epoch: i64,
	pub bet_ts: String,
	/// Lowercased hex.
	pub wallet_address: String,
	pub bet_direction: Direction,
	pub amount: Decimal,
	/// Absent when the round drew.
	pub result: Option<BetResult>,
	/// Globally unique.
	pub tx_hash: String,
}

/// One payout event. `epoch` is the crawler's processing epoch (when the payout
/// transaction landed); `bet_epoch` is the epoch the reward is *for*. They often differ
/// and both are preserved deliberately.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
	pub epoch: i64,
	pub claim_ts: String,
	pub wallet_address: String,
	pub claim_amount: Decimal,
	pub bet_epoch: i64,
	pub tx_hash: String,
}

/// Short-lived live-bet buffer row. No tx hash, no result; the historical pipeline
/// deletes these once the epoch is committed.
#[derive(Debug, Clone, PartialEq)]
pub struct RealBet {
	pub epoch: i64,
	pub bet_ts: String,
	pub wallet_address: String,
	pub bet_direction: Direction,
	pub amount: Decimal,
}

/// Offline abuse signal: a wallet claimed more than the threshold inside one epoch's
/// claim window.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiClaimFinding {
	pub epoch: i64,
	pub wallet_address: String,
	pub claim_count: i64,
	pub total_amount: Decimal,
	pub created_at: String,
}

/// Quarantine row for epochs that repeatedly failed integrity checks.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedEpoch {
	pub epoch: i64,
	pub error_message: String,
	pub last_attempt_ts: String,
	pub failure_count: i32,
}

/// Treasury keeps 3% of the pool; winners split the rest.
pub const TREASURY_FEE_FACTOR: Decimal = Decimal::from_parts(97, 0, 0, false, 2);

const PAYOUT_SCALE: u32 = 4;

/// Payout multipliers for the two sides: `round4(total * 0.97 / side)` when the side has
/// stake, otherwise zero.
pub fn compute_payouts(
	total_amount: Decimal,
	up_amount: Decimal,
	down_amount: Decimal,
) -> (Decimal, Decimal) {
	let total_after_fee = total_amount * TREASURY_FEE_FACTOR;
	let payout = |side: Decimal| {
		if side > Decimal::ZERO {
			let mut multiplier = (total_after_fee / side).round_dp(PAYOUT_SCALE);
			// Fixed four-digit representation, zero-padded.
			multiplier.rescale(PAYOUT_SCALE);
			multiplier
		} else {
			Decimal::ZERO
		}
	};
	(payout(up_amount), payout(down_amount))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn treasury_fee_factor_is_97_percent() {
		assert_eq!(TREASURY_FEE_FACTOR.to_string(), "0.97");
	}

	#[test]
	fn payouts_round_to_four_digits() {
		let (up, down) = compute_payouts(
			Decimal::from(10),
			Decimal::from(6),
			Decimal::from(4),
		);
		assert_eq!(up.to_string(), "1.6167");
		assert_eq!(down.to_string(), "2.4250");
	}

	#[test]
	fn one_sided_pool_pays_zero_on_the_empty_side() {
		let (up, down) = compute_payouts(Decimal::from(10), Decimal::from(10), Decimal::ZERO);
		assert_eq!(up.to_string(), "0.9700");
		assert_eq!(down, Decimal::ZERO);
	}

	#[test]
	fn direction_round_trips_through_strings() {
		assert_eq!("UP".parse::<Direction>().unwrap(), Direction::Up);
		assert_eq!("DOWN".parse::<Direction>().unwrap(), Direction::Down);
		assert_eq!(Direction::Up.as_str(), "UP");
	}

	#[test]
	fn direction_rejects_anything_else() {
		for bad in ["up", "BULL", "SIDEWAYS", ""] {
			assert!(bad.parse::<Direction>().is_err(), "{bad:?} should be rejected");
		}
	}

	#[test]
	fn direction_serializes_uppercase() {
		assert_eq!(serde_json::to_string(&Direction::Up).unwrap(), "\"UP\"");
	}
}
