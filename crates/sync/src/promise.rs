//! Single-assignment result cell.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::ctx::{Cause, Ctx};

/// One-shot result shared between a producer and any number of waiters.
///
/// Resolution is write-once: only the first [`Promise::resolve`] sticks.
pub struct Promise<T> {
	inner: Arc<Inner<T>>,
}

struct Inner<T> {
	cell: OnceLock<Result<T, Cause>>,
	done: CancellationToken,
}

impl<T> Clone for Promise<T> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T> Default for Promise<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> Promise<T> {
	#[must_use]
	pub fn new() -> Self {
		Self {
			inner: Arc::new(Inner {
				cell: OnceLock::new(),
				done: CancellationToken::new(),
			}),
		}
	}

	/// Resolve with `result`; true iff this was the first resolution.
	pub fn resolve(&self, result: Result<T, Cause>) -> bool {
		let first = self.inner.cell.set(result).is_ok();
		if first {
			self.inner.done.cancel();
		}
		first
	}

	#[must_use]
	pub fn is_resolved(&self) -> bool {
		self.inner.cell.get().is_some()
	}
}

impl<T: Clone> Promise<T> {
	/// Non-blocking peek at the resolution.
	#[must_use]
	pub fn sync(&self) -> Option<Result<T, Cause>> {
		self.inner.cell.get().cloned()
	}

	/// Wait for resolution or cancellation of `ctx`, whichever is first.
	///
	/// A ctx already cancelled on entry returns its cause without
	/// waiting; ctx also wins a tie with a concurrent resolution.
	pub async fn wait(&self, ctx: &Ctx) -> Result<T, Cause> {
		if ctx.is_cancelled() {
			return Err(ctx.cause_or_cancelled());
		}
		tokio::select! {
			biased;
			() = ctx.cancelled() => Err(ctx.cause_or_cancelled()),
			() = self.inner.done.cancelled() => {
				self.inner.cell.get().cloned().expect("resolved promise has a value")
			}
		}
	}
}
