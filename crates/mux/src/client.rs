//! Calling-role session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use tether_sync::{Ctx, Queue};

use crate::call::{ActiveCall, CallIo, CallMap, Outbound};
use crate::server::write_loop;
use crate::transport::{FrameRx, FrameTx};
use crate::wire::{self, Frame, Hello, HelloAck, Limit};
use crate::{MuxConfig, PROTOCOL_VERSION, SessionError};

/// Cause attached on the calling side when the serving side closes a
/// call with an error reason.
#[derive(Debug, Clone, thiserror::Error)]
#[error("stopped: {0}")]
pub struct CallStopped(pub String);

/// Handle on an established calling-role session.
///
/// Calls are opened with strictly increasing positive 31-bit ids, per
/// the session monotonicity rule; ids are never reused.
pub struct Client {
	ctx: Ctx,
	out: Queue<Outbound>,
	calls: CallMap,
	next_id: AtomicU32,
	init: Value,
	call_limit: Option<Limit>,
	packet_limit: Option<Limit>,
}

/// Perform the client hello over a framed transport and start the
/// session tasks. `cfg.init` and the limits are ignored on this side;
/// the server's advertisement is surfaced on the returned [`Client`].
pub async fn connect<R, W>(
	mut rx: R,
	mut tx: W,
	cfg: MuxConfig,
	ctx: &Ctx,
) -> Result<Client, SessionError>
where
	R: FrameRx + 'static,
	W: FrameTx + 'static,
{
	let hello = Hello {
		p: PROTOCOL_VERSION.to_string(),
	};
	tx.send(serde_json::to_string(&hello).expect("hello serializes"))
		.await?;
	let ack = tokio::select! {
		() = ctx.cancelled() => return Err(SessionError::Closed),
		res = tokio::time::timeout(cfg.hello_timeout, rx.recv()) => res,
	};
	let ack = match ack {
		Err(_) => return Err(SessionError::HelloTimeout),
		Ok(res) => res?,
	};
	let Some(raw) = ack else {
		return Err(SessionError::Closed);
	};
	let ack: HelloAck =
		serde_json::from_str(&raw).map_err(|e| SessionError::BadFrame(e.to_string()))?;
	if !ack.ok {
		return Err(SessionError::UnknownProtocol);
	}
	tracing::debug!("client session established");

	let session_ctx = ctx.child();
	let out: Queue<Outbound> = Queue::new();
	let writer_listener = out.join(&session_ctx);
	tokio::spawn(async move {
		write_loop(tx, writer_listener, cfg.noop_timeout).await;
	});
	let calls: CallMap = Arc::new(Mutex::new(HashMap::new()));
	tokio::spawn(read_loop(rx, Arc::clone(&calls), session_ctx.clone()));

	Ok(Client {
		ctx: session_ctx,
		out,
		calls,
		next_id: AtomicU32::new(1),
		init: ack.i,
		call_limit: ack.l.c,
		packet_limit: ack.l.p,
	})
}

impl Client {
	/// Init value from the hello ack.
	#[must_use]
	pub fn init(&self) -> &Value {
		&self.init
	}

	/// Call limit the server advertised, for self-pacing.
	#[must_use]
	pub fn call_limit(&self) -> Option<Limit> {
		self.call_limit
	}

	/// Packet limit the server advertised, for self-pacing.
	#[must_use]
	pub fn packet_limit(&self) -> Option<Limit> {
		self.packet_limit
	}

	/// Session context; cancelled when the connection dies.
	#[must_use]
	pub fn ctx(&self) -> &Ctx {
		&self.ctx
	}

	/// Open a new call, introducing its id on the wire.
	pub fn open(&self) -> Result<CallIo, SessionError> {
		if self.ctx.is_cancelled() {
			return Err(SessionError::Closed);
		}
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		if id >= 0x8000_0000 {
			return Err(SessionError::BadCallId(i64::from(id)));
		}
		let call_ctx = self.ctx.child();
		let queue: Queue<Value> = Queue::new();
		let inbound = queue.join(&call_ctx);
		self.calls.lock().unwrap().insert(
			id,
			ActiveCall {
				ctx: call_ctx.clone(),
				queue,
			},
		);
		self.out.push(Outbound::Control {
			call: id,
			stop: None,
		});
		tracing::debug!(call = id, "call opened");
		Ok(CallIo {
			id,
			ctx: call_ctx,
			inbound,
			out: self.out.clone(),
			announce_stop: true,
		})
	}

	/// Tear the session down, cancelling every open call.
	pub fn close(&self) {
		self.ctx.cancel();
		for (_, call) in self.calls.lock().unwrap().drain() {
			call.ctx.cancel();
		}
	}
}

async fn read_loop<R: FrameRx>(mut rx: R, calls: CallMap, ctx: Ctx) {
	let mut sticky = 0u32;
	loop {
		let frame = tokio::select! {
			() = ctx.cancelled() => break,
			res = rx.recv() => res,
		};
		let raw = match frame {
			Ok(Some(raw)) => raw,
			Ok(None) => break,
			Err(err) => {
				tracing::debug!(%err, "client transport failed");
				break;
			}
		};
		match wire::decode(&raw) {
			Ok(Frame::Control(ctrl)) => {
				if ctrl.c == 0 {
					continue;
				}
				if !(1..0x8000_0000).contains(&ctrl.c) {
					tracing::debug!(c = ctrl.c, "reserved call id from peer");
					continue;
				}
				let id = ctrl.c as u32;
				match ctrl.stop {
					Some(reason) => {
						let existing = calls.lock().unwrap().remove(&id);
						if let Some(call) = existing {
							if reason.is_empty() {
								call.ctx.cancel();
							} else {
								call.ctx.cancel_with(Arc::new(CallStopped(reason)));
							}
						}
						if sticky == id {
							sticky = 0;
						}
					}
					None => {
						if calls.lock().unwrap().contains_key(&id) {
							sticky = id;
						} else {
							// A dead call keeps the line addressed at
							// nothing; its data is dropped below.
							sticky = 0;
							tracing::debug!(call = id, "sticky switch to unknown call");
						}
					}
				}
			}
			Ok(Frame::Data(value)) => {
				let mut routed = false;
				if sticky != 0 {
					let guard = calls.lock().unwrap();
					if let Some(call) = guard.get(&sticky) {
						call.queue.push(value);
						routed = true;
					}
				}
				if !routed {
					tracing::debug!(call = sticky, "dropped data frame for dead call");
				}
			}
			Err(err) => {
				tracing::debug!(%err, "bad frame from server");
				break;
			}
		}
	}
	ctx.cancel();
	for (_, call) in calls.lock().unwrap().drain() {
		call.ctx.cancel();
	}
}
