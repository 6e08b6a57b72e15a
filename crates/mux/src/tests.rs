//! Unit tests for the call multiplexer.

mod calls;
mod framing;
mod handshake;

use serde_json::{Value, json};
use tokio::task::JoinHandle;

use tether_sync::Ctx;

use crate::transport::memory::{self, Conn, Event};
use crate::transport::{CloseCode, FrameTx};
use crate::{CallHandler, CallIo, MuxConfig, Ready, SessionError, serve};

/// Config with a distinctive init value and a noop timeout far away
/// from test timescales.
pub fn cfg() -> MuxConfig {
	MuxConfig {
		init: json!(42),
		noop_timeout: std::time::Duration::from_secs(600),
		..MuxConfig::default()
	}
}

/// Handler that readies immediately and echoes every message.
pub fn echo() -> impl CallHandler {
	|mut io: CallIo, _init: Value, ready: Ready| async move {
		ready.signal();
		while let Ok(value) = io.read().await {
			io.write(&json!({ "echo": value }));
		}
		Ok(())
	}
}

/// Spawn a serving session; returns the peer conn, the session ctx and
/// the join handle with the session result.
pub fn spawn_server(
	cfg: MuxConfig,
	handler: impl CallHandler,
) -> (Conn, Ctx, JoinHandle<Result<(), SessionError>>) {
	let (server_side, client_side) = memory::pair();
	let ctx = Ctx::new();
	let handle = tokio::spawn({
		let ctx = ctx.clone();
		async move {
			let (rx, tx) = server_side.split();
			serve(rx, tx, cfg, handler, &ctx).await
		}
	});
	(client_side, ctx, handle)
}

pub async fn send(conn: &mut Conn, frame: &str) {
	conn.tx
		.send(frame.to_string())
		.await
		.expect("server side alive");
}

pub async fn recv_event(conn: &mut Conn) -> Event {
	conn.rx.recv_event().await.expect("stream open")
}

pub async fn recv_frame(conn: &mut Conn) -> String {
	match recv_event(conn).await {
		Event::Frame(frame) => frame,
		Event::Close(code, reason) => panic!("unexpected close {code:?}: {reason}"),
	}
}

pub async fn expect_close(conn: &mut Conn, code: CloseCode) {
	loop {
		match recv_event(conn).await {
			Event::Close(got, _) => {
				assert_eq!(got, code);
				return;
			}
			Event::Frame(_) => {}
		}
	}
}

/// Drive the hello exchange from the raw peer side.
pub async fn handshake(conn: &mut Conn) -> Value {
	send(conn, "{\"p\":\"1\"}").await;
	let ack = recv_frame(conn).await;
	serde_json::from_str(&ack).expect("ack is json")
}

pub async fn settle() {
	for _ in 0..16 {
		tokio::task::yield_now().await;
	}
}
