//! Token bucket backing the session rate limits.

use tokio::time::Instant;

use crate::wire::Limit;

/// Refill-on-demand token bucket.
pub(crate) struct Bucket {
	limit: Limit,
	tokens: f64,
	refilled: Instant,
}

impl Bucket {
	pub fn new(limit: Limit) -> Self {
		Self {
			limit,
			tokens: f64::from(limit.burst),
			refilled: Instant::now(),
		}
	}

	/// Take one token; false when the bucket is dry.
	pub fn allow(&mut self) -> bool {
		let now = Instant::now();
		let elapsed = now.duration_since(self.refilled).as_secs_f64();
		self.tokens = (self.tokens + self.limit.rate * elapsed).min(f64::from(self.limit.burst));
		self.refilled = now;
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn burst_bounds_initial_tokens() {
		let mut bucket = Bucket::new(Limit {
			rate: 0.0,
			burst: 2,
		});
		assert!(bucket.allow());
		assert!(bucket.allow());
		assert!(!bucket.allow(), "burst of two admits exactly two");
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn tokens_refill_at_the_configured_rate() {
		let mut bucket = Bucket::new(Limit {
			rate: 2.0,
			burst: 2,
		});
		assert!(bucket.allow());
		assert!(bucket.allow());
		assert!(!bucket.allow());
		tokio::time::advance(Duration::from_millis(500)).await;
		assert!(bucket.allow(), "half a second at rate 2 buys one token");
		assert!(!bucket.allow());
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn refill_never_exceeds_burst() {
		let mut bucket = Bucket::new(Limit {
			rate: 100.0,
			burst: 1,
		});
		assert!(bucket.allow());
		tokio::time::advance(Duration::from_secs(60)).await;
		assert!(bucket.allow());
		assert!(!bucket.allow());
	}
}
