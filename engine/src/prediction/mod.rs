//! Chain facade for the prediction market contract.
//!
//! Two surfaces over the same contract: a rate-limited, retrying pull surface (`rpc`,
//! `block_search`) the historical pipeline drives, and a push surface (`subscription`)
//! that feeds the real-time pipeline.

pub mod block_search;
pub mod contract;
pub mod rate_limiter;
pub mod retry;
pub mod rpc;
pub mod subscription;

pub use contract::{BlockInfo, ChainEvent, EpochEvents, LiveBet, RoundStatus, RoundView};
pub use rpc::{PredictionRpcApi, PredictionRpcClient};
