use std::time::Duration;

// ======= Chain facade =======

/// Pull-surface requests per second when no override is configured.
pub const DEFAULT_RATE_LIMIT_RPS: u32 = 100;

/// Transient chain failures are retried this many times before surfacing.
pub const RPC_RETRY_ATTEMPTS: u32 = 3;

/// Linear backoff base: attempt `n` waits `n * RPC_RETRY_BASE_DELAY`.
pub const RPC_RETRY_BASE_DELAY: Duration = Duration::from_secs(2);

/// First reconnect delay after the live subscription drops.
pub const SUBSCRIPTION_RECONNECT_BASE_DELAY: Duration = Duration::from_secs(10);

/// Reconnect delays double up to this cap.
pub const SUBSCRIPTION_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);

/// After this many consecutive failures the subscription reports `connection_lost`
/// and keeps retrying at the cap interval.
pub const SUBSCRIPTION_FAST_RECONNECT_ATTEMPTS: u32 = 5;

// ======= Historical pipeline =======

/// Pause between epochs in the main backfill worker.
pub const BACKFILL_EPOCH_PACING: Duration = Duration::from_secs(2);

/// The side worker re-checks the recent window on this cadence.
pub const RECENT_SCAN_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Epochs strictly newer than `currentEpoch - CLOSED_EPOCH_LAG` cannot have closed yet.
pub const CLOSED_EPOCH_LAG: i64 = 2;

/// The recent window re-checked by the side worker is
/// `[currentEpoch - RECENT_WINDOW_START_LAG, currentEpoch - CLOSED_EPOCH_LAG]`.
pub const RECENT_WINDOW_START_LAG: i64 = 6;

/// Integrity failures per epoch before it is quarantined.
pub const EPOCH_FAILURE_QUARANTINE_THRESHOLD: i32 = 3;

/// Supervisor triggers a graceful backfill restart on this cadence.
pub const GRACEFUL_RESTART_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// How long the restart waits for the main worker to finish its current epoch.
pub const GRACEFUL_RESTART_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Wait for in-flight DB writes to settle before validating.
pub const GRACEFUL_RESTART_SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Pause between validation and restarting the main worker.
pub const GRACEFUL_RESTART_RESUME_DELAY: Duration = Duration::from_secs(5);

// ======= Real-time pipeline =======

/// Rows read back from the hot table to warm the dedup set on startup.
pub const DEDUP_WARM_RESTORE_ROWS: i64 = 1000;

/// Fallback sweep cadence for the dedup set; lock-time purges normally cover it.
pub const DEDUP_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Dedup entries older than this are dropped by the fallback sweep.
pub const DEDUP_ENTRY_TTL: Duration = Duration::from_secs(60 * 60);

// ======= Suspicious-wallet detector =======

/// Cumulative bet count above which a wallet is flagged.
pub const DETECTOR_HIGH_TOTAL_BETS: u64 = 100;

/// Sliding window over recent bet timestamps.
pub const DETECTOR_FREQUENCY_WINDOW: Duration = Duration::from_secs(60);

/// More than this many bets inside the window flags the wallet.
pub const DETECTOR_FREQUENCY_THRESHOLD: usize = 10;

/// Fixed capacity of the per-wallet recent-bet ring.
pub const DETECTOR_WINDOW_CAPACITY: usize = 64;

/// Online detector state sweep cadence.
pub const DETECTOR_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Wallets idle for longer than this are dropped wholesale by the sweep.
pub const DETECTOR_IDLE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Offline multi-claim threshold when no override is configured.
pub const DEFAULT_MULTI_CLAIM_THRESHOLD: i64 = 3;

// ======= Store =======

pub const PG_MAX_CONNECTIONS: u32 = 10;

pub const PG_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

// ======= Fan-out =======

pub const DEFAULT_FANOUT_PORT: u16 = 3010;
