//! Per-call lifecycle: stops, handler completion, ready gating.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use serde_json::Value;

use super::{cfg, handshake, recv_frame, send, settle, spawn_server};
use crate::transport::CloseCode;
use crate::transport::memory::Event;
use crate::{CallIo, Ready};

#[tokio::test(flavor = "current_thread")]
async fn handler_return_closes_the_call() {
	// Read one message, then finish successfully.
	let handler = |mut io: CallIo, _init: Value, ready: Ready| async move {
		ready.signal();
		let _ = io.read().await;
		Ok(())
	};
	let (mut conn, _ctx, _handle) = spawn_server(cfg(), handler);
	handshake(&mut conn).await;
	send(&mut conn, ":{\"c\":1}").await;
	send(&mut conn, "\"bye\"").await;
	assert_eq!(recv_frame(&mut conn).await, ":{\"c\":1,\"stop\":\"\"}");
}

#[tokio::test(flavor = "current_thread")]
async fn handler_error_reason_reaches_the_peer() {
	let handler = |_io: CallIo, _init: Value, ready: Ready| async move {
		ready.signal();
		Err(tether_sync::cause(std::io::Error::other("boom")))
	};
	let (mut conn, _ctx, _handle) = spawn_server(cfg(), handler);
	handshake(&mut conn).await;
	send(&mut conn, ":{\"c\":1}").await;
	assert_eq!(recv_frame(&mut conn).await, ":{\"c\":1,\"stop\":\"boom\"}");
}

#[tokio::test(flavor = "current_thread")]
async fn peer_stop_cancels_the_call_with_its_reason() {
	let seen: Arc<Mutex<Option<String>>> = Arc::default();
	let handler = {
		let seen = Arc::clone(&seen);
		move |io: CallIo, _init: Value, ready: Ready| {
			let seen = Arc::clone(&seen);
			async move {
				ready.signal();
				let ctx = io.ctx().clone();
				ctx.cancelled().await;
				*seen.lock().unwrap() = ctx.cause().map(|c| c.to_string());
				Ok(())
			}
		}
	};
	let (mut conn, _ctx, handle) = spawn_server(cfg(), handler);
	handshake(&mut conn).await;
	send(&mut conn, ":{\"c\":1}").await;
	send(&mut conn, ":{\"c\":1,\"stop\":\"going away\"}").await;
	settle().await;
	assert_eq!(seen.lock().unwrap().as_deref(), Some("client: going away"));

	// The peer already removed the call: no stop echo, just a normal
	// close when the stream ends.
	drop(conn.tx);
	loop {
		match conn.rx.recv_event().await.expect("close pending") {
			Event::Close(code, _) => {
				assert_eq!(code, CloseCode::Normal);
				break;
			}
			Event::Frame(frame) => panic!("unexpected frame {frame}"),
		}
	}
	assert!(handle.await.unwrap().is_ok());
}

#[tokio::test(flavor = "current_thread")]
async fn empty_stop_reason_is_normal_cancellation() {
	let seen: Arc<Mutex<Option<String>>> = Arc::default();
	let handler = {
		let seen = Arc::clone(&seen);
		move |io: CallIo, _init: Value, ready: Ready| {
			let seen = Arc::clone(&seen);
			async move {
				ready.signal();
				let ctx = io.ctx().clone();
				ctx.cancelled().await;
				*seen.lock().unwrap() = ctx.cause().map(|c| c.to_string());
				Ok(())
			}
		}
	};
	let (mut conn, _ctx, _handle) = spawn_server(cfg(), handler);
	handshake(&mut conn).await;
	send(&mut conn, ":{\"c\":1}").await;
	send(&mut conn, ":{\"c\":1,\"stop\":\"\"}").await;
	settle().await;
	assert_eq!(seen.lock().unwrap().as_deref(), Some("cancelled"));
}

#[tokio::test(flavor = "current_thread")]
async fn ready_gates_the_next_new_call() {
	let spawned = Arc::new(AtomicUsize::new(0));
	let readies: Arc<Mutex<Vec<Ready>>> = Arc::default();
	let handler = {
		let spawned = Arc::clone(&spawned);
		let readies = Arc::clone(&readies);
		move |io: CallIo, _init: Value, ready: Ready| {
			let spawned = Arc::clone(&spawned);
			let readies = Arc::clone(&readies);
			async move {
				spawned.fetch_add(1, Ordering::SeqCst);
				readies.lock().unwrap().push(ready);
				let ctx = io.ctx().clone();
				ctx.cancelled().await;
				Ok(())
			}
		}
	};
	let (mut conn, _ctx, _handle) = spawn_server(cfg(), handler);
	handshake(&mut conn).await;
	send(&mut conn, ":{\"c\":1}").await;
	send(&mut conn, ":{\"c\":2}").await;
	settle().await;
	assert_eq!(spawned.load(Ordering::SeqCst), 1, "call 2 waits for ready");

	readies.lock().unwrap()[0].signal();
	settle().await;
	assert_eq!(spawned.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "current_thread")]
async fn handler_finishing_without_ready_unblocks_the_session() {
	let spawned = Arc::new(AtomicUsize::new(0));
	let handler = {
		let spawned = Arc::clone(&spawned);
		// Never calls ready.signal(); finishing must stand in for it.
		move |_io: CallIo, _init: Value, _ready: Ready| {
			let spawned = Arc::clone(&spawned);
			async move {
				spawned.fetch_add(1, Ordering::SeqCst);
				Ok(())
			}
		}
	};
	let (mut conn, _ctx, _handle) = spawn_server(cfg(), handler);
	handshake(&mut conn).await;
	send(&mut conn, ":{\"c\":1}").await;
	send(&mut conn, ":{\"c\":2}").await;
	settle().await;
	assert_eq!(spawned.load(Ordering::SeqCst), 2);
}
