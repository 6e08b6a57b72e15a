//! Per-call surface: io handle, readiness latch, handler trait.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use tether_sync::{Cause, Ctx, Listener, Promise, Queue};

use crate::RemoteCancelled;

/// Outbound queue items consumed by the session writer.
#[derive(Clone)]
pub(crate) enum Outbound {
	Data { call: u32, frame: String },
	Control { call: u32, stop: Option<String> },
}

/// Session-side record of a live call.
pub(crate) struct ActiveCall {
	pub ctx: Ctx,
	pub queue: Queue<Value>,
}

/// Call registry shared between the session loop and call-completion
/// tasks.
pub(crate) type CallMap = std::sync::Arc<std::sync::Mutex<std::collections::HashMap<u32, ActiveCall>>>;

/// One-shot latch a handler signals once its setup is ordered on the
/// transport; the session accepts the next new call only after this.
#[derive(Clone)]
pub struct Ready {
	promise: Promise<()>,
}

impl Ready {
	pub(crate) fn new() -> Self {
		Self {
			promise: Promise::new(),
		}
	}

	/// Allow the session to accept the next new call.
	pub fn signal(&self) {
		self.promise.resolve(Ok(()));
	}

	pub(crate) async fn wait(&self, ctx: &Ctx) {
		let _ = self.promise.wait(ctx).await;
	}
}

/// A call's bidirectional message handle.
///
/// Reads pull from the call's inbound queue; writes enqueue onto the
/// session's shared writer, which re-addresses the wire sticky id as
/// needed.
pub struct CallIo {
	pub(crate) id: u32,
	pub(crate) ctx: Ctx,
	pub(crate) inbound: Listener<Value>,
	pub(crate) out: Queue<Outbound>,
	/// Whether a local stop must be announced to the peer (calling
	/// role); the serving role announces via the handler's return.
	pub(crate) announce_stop: bool,
}

impl CallIo {
	/// Wire id of this call.
	#[must_use]
	pub fn id(&self) -> u32 {
		self.id
	}

	/// Cancellation context of this call; interrogate for the cause.
	#[must_use]
	pub fn ctx(&self) -> &Ctx {
		&self.ctx
	}

	/// Next inbound message, in per-call FIFO order.
	pub async fn read(&mut self) -> Result<Value, Cause> {
		match self.inbound.next().await {
			Some(value) => Ok(value),
			None => Err(self.ctx.cause_or_cancelled()),
		}
	}

	/// Enqueue an outbound message; false once the call is cancelled.
	pub fn write(&self, value: &Value) -> bool {
		if self.ctx.is_cancelled() {
			return false;
		}
		self.out.push(Outbound::Data {
			call: self.id,
			frame: value.to_string(),
		})
	}

	/// Cancel the call locally; the calling role also announces a stop
	/// frame with `reason` to the peer.
	pub fn stop(&self, reason: &str) {
		if self.ctx.is_cancelled() {
			return;
		}
		if self.announce_stop {
			self.out.push(Outbound::Control {
				call: self.id,
				stop: Some(reason.to_string()),
			});
		}
		if reason.is_empty() {
			self.ctx.cancel();
		} else {
			self.ctx
				.cancel_with(std::sync::Arc::new(RemoteCancelled(reason.to_string())));
		}
	}
}

type BoxFut<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Serving-role callback spawned for every newly introduced call.
///
/// `init` is the session's configured init value; `ready` must be
/// signalled before the session accepts another new call. Returning an
/// error propagates its message in the close frame's stop reason.
pub trait CallHandler: Send + Sync + 'static {
	fn call(&self, io: CallIo, init: Value, ready: Ready) -> BoxFut<Result<(), Cause>>;
}

impl<F, Fut> CallHandler for F
where
	F: Fn(CallIo, Value, Ready) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<(), Cause>> + Send + 'static,
{
	fn call(&self, io: CallIo, init: Value, ready: Ready) -> BoxFut<Result<(), Cause>> {
		Box::pin(self(io, init, ready))
	}
}
