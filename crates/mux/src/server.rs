//! Serving-role session loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use tether_sync::{Cause, Ctx, Listener, Queue};

use crate::call::{ActiveCall, CallHandler, CallIo, CallMap, Outbound, Ready};
use crate::limit::Bucket;
use crate::transport::{CloseCode, FrameRx, FrameTx};
use crate::wire::{self, Frame, Hello, HelloAck, Limits};
use crate::{MuxConfig, PROTOCOL_VERSION, RemoteCancelled, SessionError};

/// Run a serving session over a framed transport.
///
/// Performs the hello handshake, then routes frames until the peer
/// disconnects, `ctx` cancels, or a protocol violation closes the
/// session with its code. The error, if any, describes why.
pub async fn serve<R, W, H>(
	mut rx: R,
	mut tx: W,
	cfg: MuxConfig,
	handler: H,
	ctx: &Ctx,
) -> Result<(), SessionError>
where
	R: FrameRx,
	W: FrameTx + 'static,
	H: CallHandler,
{
	let hello = tokio::select! {
		() = ctx.cancelled() => return Err(SessionError::Closed),
		res = tokio::time::timeout(cfg.hello_timeout, rx.recv()) => res,
	};
	let hello = match hello {
		Err(_) => {
			let _ = tx.close(CloseCode::UnknownProtocol, "hello timeout").await;
			return Err(SessionError::HelloTimeout);
		}
		Ok(res) => res?,
	};
	let good = hello
		.as_deref()
		.and_then(|raw| serde_json::from_str::<Hello>(raw).ok())
		.is_some_and(|h| h.p == PROTOCOL_VERSION);
	if !good {
		let _ = tx.close(CloseCode::UnknownProtocol, "bad hello").await;
		return Err(SessionError::UnknownProtocol);
	}
	let ack = HelloAck {
		ok: true,
		i: cfg.init.clone(),
		l: Limits {
			c: cfg.call_limit,
			p: cfg.packet_limit,
		},
	};
	tx.send(serde_json::to_string(&ack).expect("ack serializes"))
		.await?;
	tracing::debug!("session established");

	// The writer owns the tx half and hands it back for the close frame.
	let out: Queue<Outbound> = Queue::new();
	let writer_ctx = ctx.child();
	let writer_listener = out.join(&writer_ctx);
	let writer = tokio::spawn(write_loop(tx, writer_listener, cfg.noop_timeout));

	let calls: CallMap = Arc::new(Mutex::new(HashMap::new()));
	let handler: Arc<dyn CallHandler> = Arc::new(handler);
	let result = read_loop(&mut rx, &cfg, &out, &calls, handler, ctx).await;

	for (_, call) in calls.lock().unwrap().drain() {
		call.ctx.cancel();
	}
	writer_ctx.cancel();
	let mut tx = match writer.await {
		Ok(tx) => tx,
		Err(join) if join.is_panic() => std::panic::resume_unwind(join.into_panic()),
		Err(_) => return result,
	};
	match &result {
		Ok(()) => {
			let _ = tx.close(CloseCode::Normal, "").await;
		}
		Err(err) => {
			tracing::warn!(%err, "session failed");
			let _ = tx.close(err.close_code(), &err.to_string()).await;
		}
	}
	result
}

/// Writer: drains the outbound queue, re-addressing the wire sticky id
/// only when the call changes, and keeps the line warm with `:{}`.
pub(crate) async fn write_loop<W: FrameTx>(
	mut tx: W,
	mut listener: Listener<Outbound>,
	noop: Duration,
) -> W {
	let mut last_call = 0u32;
	loop {
		let item = tokio::select! {
			item = listener.next() => item,
			() = tokio::time::sleep(noop) => {
				if tx.send(wire::NOOP.to_string()).await.is_err() {
					return tx;
				}
				continue;
			}
		};
		let Some(item) = item else { return tx };
		let sent = match item {
			Outbound::Data { call, frame } => {
				if call != last_call {
					last_call = call;
					if tx.send(wire::encode_control(call, None)).await.is_err() {
						return tx;
					}
				}
				tx.send(frame).await
			}
			Outbound::Control { call, stop } => {
				match &stop {
					None => last_call = call,
					Some(_) if call == last_call => last_call = 0,
					Some(_) => {}
				}
				tx.send(wire::encode_control(call, stop.as_deref())).await
			}
		};
		if sent.is_err() {
			return tx;
		}
	}
}

async fn read_loop<R: FrameRx>(
	rx: &mut R,
	cfg: &MuxConfig,
	out: &Queue<Outbound>,
	calls: &CallMap,
	handler: Arc<dyn CallHandler>,
	ctx: &Ctx,
) -> Result<(), SessionError> {
	let mut sticky = 0u32;
	let mut last_new = 0u32;
	let mut pending_ready: Option<Ready> = None;
	let mut packet_bucket = cfg.packet_limit.map(Bucket::new);
	let mut call_bucket = cfg.call_limit.map(Bucket::new);

	loop {
		let frame = tokio::select! {
			() = ctx.cancelled() => return Ok(()),
			res = rx.recv() => res?,
		};
		let Some(raw) = frame else { return Ok(()) };
		if let Some(bucket) = packet_bucket.as_mut()
			&& !bucket.allow()
		{
			return Err(SessionError::ExcessTraffic);
		}
		match wire::decode(&raw)? {
			Frame::Control(ctrl) => {
				if ctrl.c == 0 {
					continue;
				}
				if !(1..0x8000_0000).contains(&ctrl.c) {
					return Err(SessionError::BadCallId(ctrl.c));
				}
				let id = ctrl.c as u32;
				if let Some(reason) = ctrl.stop {
					let existing = calls.lock().unwrap().remove(&id);
					if let Some(call) = existing {
						let cause: Cause = if reason.is_empty() {
							Arc::new(tether_sync::Error::Cancelled)
						} else {
							Arc::new(RemoteCancelled(reason))
						};
						tracing::debug!(call = id, "peer stopped call");
						call.ctx.cancel_with(cause);
						if sticky == id {
							sticky = 0;
						}
					}
				} else if calls.lock().unwrap().contains_key(&id) {
					sticky = id;
				} else if id > last_new {
					if let Some(bucket) = call_bucket.as_mut()
						&& !bucket.allow()
					{
						return Err(SessionError::ExcessTraffic);
					}
					// Strict setup ordering: the previous call must
					// signal readiness (or finish) first.
					if let Some(ready) = pending_ready.take() {
						ready.wait(ctx).await;
					}
					last_new = id;
					sticky = id;
					let ready = Ready::new();
					pending_ready = Some(ready.clone());
					spawn_call(id, cfg.init.clone(), out, calls, Arc::clone(&handler), ready, ctx);
				} else {
					return Err(SessionError::BadCallId(i64::from(id)));
				}
			}
			Frame::Data(value) => {
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
		}
	}
}

fn spawn_call(
	id: u32,
	init: Value,
	out: &Queue<Outbound>,
	calls: &CallMap,
	handler: Arc<dyn CallHandler>,
	ready: Ready,
	ctx: &Ctx,
) {
	let call_ctx = ctx.child();
	let queue: Queue<Value> = Queue::new();
	let inbound = queue.join(&call_ctx);
	calls.lock().unwrap().insert(
		id,
		ActiveCall {
			ctx: call_ctx.clone(),
			queue,
		},
	);
	let io = CallIo {
		id,
		ctx: call_ctx.clone(),
		inbound,
		out: out.clone(),
		announce_stop: false,
	};
	tracing::debug!(call = id, "call opened");
	let fut = handler.call(io, init, ready.clone());
	let out = out.clone();
	let calls = Arc::clone(calls);
	tokio::spawn(async move {
		let result = fut.await;
		// A handler that never signalled readiness unblocks the
		// session by finishing.
		ready.signal();
		let removed = calls.lock().unwrap().remove(&id).is_some();
		if removed {
			let stop = match &result {
				Ok(()) => String::new(),
				Err(cause) => cause.to_string(),
			};
			tracing::debug!(call = id, stop = %stop, "call finished");
			out.push(Outbound::Control {
				call: id,
				stop: Some(stop),
			});
		}
		call_ctx.cancel();
	});
}
