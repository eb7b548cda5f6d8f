//! Block-by-timestamp bisection.
//!
//! Finds the block whose timestamp is closest to a target over `[1, currentBlock]` in
//! O(log N) rate-limited probes. Exact hits return immediately; otherwise every probe
//! updates the running closest candidate. Equal distances resolve to the earlier block so
//! repeated searches are deterministic.

use crate::errors::EngineError;

use super::{contract::BlockInfo, rpc::PredictionRpcApi};

pub async fn block_by_timestamp(
	rpc: &dyn PredictionRpcApi,
	target_ts: u64,
) -> anyhow::Result<BlockInfo> {
	let head = rpc.block_number().await?;

	let mut low = 1u64;
	let mut high = head;
	let mut closest: Option<BlockInfo> = None;

	while low <= high {
		let mid = low + (high - low) / 2;
		let block = rpc.block(mid).await?;

		let distance = block.timestamp.abs_diff(target_ts);
		let improves = match closest {
			None => true,
			Some(best) => {
				let best_distance = best.timestamp.abs_diff(target_ts);
				distance < best_distance ||
					(distance == best_distance && block.number < best.number)
			},
		};
		if improves {
			closest = Some(block);
		}

		if block.timestamp == target_ts {
			return Ok(block);
		} else if block.timestamp < target_ts {
			low = mid + 1;
		} else {
			if mid == 1 {
				break;
			}
			high = mid - 1;
		}
	}

	closest.ok_or_else(|| EngineError::ChainRangeOutOfBounds { target_ts }.into())
}
