use thiserror::Error;

/// The error kinds the engine distinguishes. Anything transport- or task-shaped is wrapped
/// in `anyhow::Error` at the edges; these are the conditions the pipelines branch on.
/// Conditions that are normal rather than exceptional are not errors at all: unclosed or
/// unbounded rounds surface as `backfill::SkipReason`, duplicate live bets are dropped in
/// the dedup set, and partial fan-out delivery is a `fanout::BroadcastReport`.
#[derive(Debug, Error)]
pub enum EngineError {
	#[error("invalid time input: {0}")]
	InvalidTimeInput(String),

	#[error("chain request {request} failed after {attempts} attempts: {source}")]
	ChainRequestFailed {
		request: &'static str,
		attempts: u32,
		#[source]
		source: anyhow::Error,
	},

	#[error("no block found for timestamp {target_ts}")]
	ChainRangeOutOfBounds { target_ts: u64 },

	#[error("integrity check failed for epoch {epoch}: {reason}")]
	IntegrityCheckFailed { epoch: i64, reason: String },

	#[error("database unavailable: {0}")]
	DatabaseUnavailable(#[from] sqlx::Error),

	#[error("unknown bet direction {0:?}")]
	UnknownBetDirection(String),

	#[error("live event subscription lost")]
	SubscriptionLost,
}
