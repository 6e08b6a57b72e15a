//! Cancellation context with an interrogable cause.

use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

/// Cause attached to a cancelled [`Ctx`].
pub type Cause = Arc<dyn StdError + Send + Sync + 'static>;

/// Handle that cancels a [`Ctx`] with an optional cause.
pub type CancelFn = Arc<dyn Fn(Option<Cause>) + Send + Sync>;

/// Baseline cancellation causes shared across the workspace.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	/// Normal cancellation with no richer cause attached.
	#[error("cancelled")]
	Cancelled,
	/// The owning component is shutting down.
	#[error("shutdown")]
	Shutdown,
}

/// Wraps any error into a [`Cause`].
pub fn cause(err: impl StdError + Send + Sync + 'static) -> Cause {
	Arc::new(err)
}

/// Cancellation token carrying an optional cause, derived in a tree.
///
/// Cancelling a context cancels every child derived from it.
/// [`Ctx::cause`] reports the nearest cause up the chain, so a child
/// cancelled through its parent observes the parent's cause.
#[derive(Clone)]
pub struct Ctx {
	inner: Arc<Inner>,
}

struct Inner {
	token: CancellationToken,
	cause: OnceLock<Cause>,
	parent: Option<Arc<Inner>>,
}

impl Ctx {
	/// Fresh root context; cancelled only through [`Ctx::cancel`].
	#[must_use]
	pub fn new() -> Self {
		Self {
			inner: Arc::new(Inner {
				token: CancellationToken::new(),
				cause: OnceLock::new(),
				parent: None,
			}),
		}
	}

	/// Derive a child cancelled together with `self`.
	#[must_use]
	pub fn child(&self) -> Self {
		Self {
			inner: Arc::new(Inner {
				token: self.inner.token.child_token(),
				cause: OnceLock::new(),
				parent: Some(Arc::clone(&self.inner)),
			}),
		}
	}

	/// Cancel without a cause (normal cancellation).
	pub fn cancel(&self) {
		self.inner.token.cancel();
	}

	/// Cancel with `cause`. The first cancellation's cause sticks.
	pub fn cancel_with(&self, cause: Cause) {
		let _ = self.inner.cause.set(cause);
		self.inner.token.cancel();
	}

	/// A cloneable closure cancelling this context.
	#[must_use]
	pub fn canceller(&self) -> CancelFn {
		let ctx = self.clone();
		Arc::new(move |cause| match cause {
			Some(cause) => ctx.cancel_with(cause),
			None => ctx.cancel(),
		})
	}

	#[must_use]
	pub fn is_cancelled(&self) -> bool {
		self.inner.token.is_cancelled()
	}

	/// Resolves once the context is cancelled.
	pub async fn cancelled(&self) {
		self.inner.token.cancelled().await;
	}

	/// The nearest cause up the chain, if one was attached.
	///
	/// Only meaningful once the context is cancelled; an uncancelled
	/// context has no cause.
	#[must_use]
	pub fn cause(&self) -> Option<Cause> {
		if !self.is_cancelled() {
			return None;
		}
		let mut cur = Some(&self.inner);
		while let Some(inner) = cur {
			if let Some(cause) = inner.cause.get() {
				return Some(Arc::clone(cause));
			}
			cur = inner.parent.as_ref();
		}
		None
	}

	/// The cause, defaulting to [`Error::Cancelled`] when none was set.
	#[must_use]
	pub fn cause_or_cancelled(&self) -> Cause {
		self.cause().unwrap_or_else(|| Arc::new(Error::Cancelled))
	}
}

impl Default for Ctx {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Debug for Ctx {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Ctx")
			.field("cancelled", &self.is_cancelled())
			.field("cause", &self.cause().map(|c| c.to_string()))
			.finish()
	}
}
