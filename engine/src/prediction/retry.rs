//! Retry policy for pull-surface requests.
//!
//! Transient provider faults get a bounded number of attempts with linear backoff. The
//! policy is a value so tests (or a future operator knob) can substitute a different
//! shape without touching call sites.

use std::{future::Future, time::Duration};

use crate::errors::EngineError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
	attempts: u32,
	base_delay: Duration,
}

impl RetryPolicy {
	/// Linear backoff: attempt `n` (1-based) sleeps `n * base_delay` before the next try.
	pub fn linear(attempts: u32, base_delay: Duration) -> Self {
		RetryPolicy { attempts: attempts.max(1), base_delay }
	}

	#[cfg(test)]
	pub fn immediate(attempts: u32) -> Self {
		Self::linear(attempts, Duration::ZERO)
	}

	pub async fn run<T, F, Fut>(
		&self,
		request: &'static str,
		mut attempt_fn: F,
	) -> Result<T, EngineError>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = anyhow::Result<T>>,
	{
		let mut last_error = None;
		for attempt in 1..=self.attempts {
			match attempt_fn().await {
				Ok(value) => return Ok(value),
				Err(error) => {
					tracing::warn!("{request} attempt {attempt}/{} failed: {error:#}", self.attempts);
					last_error = Some(error);
					if attempt < self.attempts {
						tokio::time::sleep(self.base_delay * attempt).await;
					}
				},
			}
		}
		Err(EngineError::ChainRequestFailed {
			request,
			attempts: self.attempts,
			source: last_error.unwrap_or_else(|| anyhow::anyhow!("no attempts were made")),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	#[tokio::test]
	async fn returns_first_success() {
		let calls = AtomicU32::new(0);
		let value = RetryPolicy::immediate(3)
			.run("test", || {
				let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
				async move {
					if attempt < 2 {
						anyhow::bail!("transient")
					}
					Ok(attempt)
				}
			})
			.await
			.unwrap();
		assert_eq!(value, 2);
		assert_eq!(calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn gives_up_after_the_configured_attempts() {
		let calls = AtomicU32::new(0);
		let result: Result<(), _> = RetryPolicy::immediate(3)
			.run("test", || {
				calls.fetch_add(1, Ordering::SeqCst);
				async { anyhow::bail!("still broken") }
			})
			.await;
		assert_eq!(calls.load(Ordering::SeqCst), 3);
		assert!(matches!(
			result.unwrap_err(),
			EngineError::ChainRequestFailed { attempts: 3, .. }
		));
	}

	#[tokio::test(start_paused = true)]
	async fn backoff_grows_linearly() {
		let started = tokio::time::Instant::now();
		let _: Result<(), _> = RetryPolicy::linear(3, Duration::from_secs(2))
			.run("test", || async { anyhow::bail!("down") })
			.await;
		// 2s after the first failure, 4s after the second, nothing after the last.
		assert_eq!(started.elapsed(), Duration::from_secs(6));
	}
}
