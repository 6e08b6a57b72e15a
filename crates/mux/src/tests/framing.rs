//! Sticky-id framing: routing, re-addressing, keep-alive, monotonicity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use super::{cfg, echo, expect_close, handshake, recv_frame, send, settle, spawn_server};
use crate::transport::CloseCode;
use crate::{CallIo, MuxConfig, Ready, SessionError};

type Recorded = Arc<Mutex<HashMap<u32, Vec<Value>>>>;

/// Handler recording every inbound message per call id.
fn recorder(log: Recorded) -> impl crate::CallHandler {
	move |mut io: CallIo, _init: Value, ready: Ready| {
		let log = Arc::clone(&log);
		async move {
			ready.signal();
			while let Ok(value) = io.read().await {
				log.lock().unwrap().entry(io.id()).or_default().push(value);
			}
			Ok(())
		}
	}
}

#[tokio::test(flavor = "current_thread")]
async fn data_frames_follow_the_sticky_id() {
	let log: Recorded = Arc::default();
	let (mut conn, _ctx, _handle) = spawn_server(cfg(), recorder(Arc::clone(&log)));
	handshake(&mut conn).await;

	send(&mut conn, ":{\"c\":1}").await;
	send(&mut conn, "\"a\"").await;
	send(&mut conn, "\"b\"").await;
	send(&mut conn, ":{\"c\":2}").await;
	send(&mut conn, "\"c\"").await;
	// Switching back to an existing call is an ordinary re-address.
	send(&mut conn, ":{\"c\":1}").await;
	send(&mut conn, "\"d\"").await;
	settle().await;

	let log = log.lock().unwrap();
	assert_eq!(log[&1], vec![json!("a"), json!("b"), json!("d")]);
	assert_eq!(log[&2], vec![json!("c")]);
}

#[tokio::test(flavor = "current_thread")]
async fn outbound_readdresses_only_on_call_change() {
	let (mut conn, _ctx, _handle) = spawn_server(cfg(), echo());
	handshake(&mut conn).await;
	send(&mut conn, ":{\"c\":1}").await;
	send(&mut conn, "\"x\"").await;
	send(&mut conn, "\"y\"").await;

	assert_eq!(recv_frame(&mut conn).await, ":{\"c\":1}");
	assert_eq!(recv_frame(&mut conn).await, "{\"echo\":\"x\"}");
	// Same call again: no redundant control frame in between.
	assert_eq!(recv_frame(&mut conn).await, "{\"echo\":\"y\"}");
}

#[tokio::test(flavor = "current_thread")]
async fn data_with_no_addressed_call_is_dropped() {
	let log: Recorded = Arc::default();
	let (mut conn, _ctx, _handle) = spawn_server(cfg(), recorder(Arc::clone(&log)));
	handshake(&mut conn).await;
	send(&mut conn, "\"orphan\"").await;
	send(&mut conn, ":{\"c\":1}").await;
	send(&mut conn, "\"kept\"").await;
	settle().await;
	assert_eq!(log.lock().unwrap()[&1], vec![json!("kept")]);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn idle_line_receives_keep_alive() {
	let config = MuxConfig {
		noop_timeout: Duration::from_millis(250),
		..cfg()
	};
	let (mut conn, _ctx, _handle) = spawn_server(config, echo());
	handshake(&mut conn).await;
	// Nothing scheduled outbound: the writer keeps the line warm.
	assert_eq!(recv_frame(&mut conn).await, ":{}");
	assert_eq!(recv_frame(&mut conn).await, ":{}");
}

#[tokio::test(flavor = "current_thread")]
async fn empty_control_is_keep_alive_inbound() {
	let log: Recorded = Arc::default();
	let (mut conn, _ctx, _handle) = spawn_server(cfg(), recorder(Arc::clone(&log)));
	handshake(&mut conn).await;
	send(&mut conn, ":{}").await;
	send(&mut conn, ":{\"c\":1}").await;
	send(&mut conn, "\"v\"").await;
	settle().await;
	assert_eq!(log.lock().unwrap()[&1], vec![json!("v")]);
}

#[tokio::test(flavor = "current_thread")]
async fn stale_new_call_id_is_fatal() {
	let (mut conn, _ctx, handle) = spawn_server(cfg(), echo());
	handshake(&mut conn).await;
	send(&mut conn, ":{\"c\":5}").await;
	// 3 was never introduced and does not exceed 5.
	send(&mut conn, ":{\"c\":3}").await;
	expect_close(&mut conn, CloseCode::BadCallId).await;
	assert!(matches!(handle.await.unwrap(), Err(SessionError::BadCallId(3))));
}

#[tokio::test(flavor = "current_thread")]
async fn reserved_ids_are_fatal() {
	let (mut conn, _ctx, handle) = spawn_server(cfg(), echo());
	handshake(&mut conn).await;
	// Top bit set.
	send(&mut conn, ":{\"c\":2147483648}").await;
	expect_close(&mut conn, CloseCode::BadCallId).await;
	assert!(matches!(handle.await.unwrap(), Err(SessionError::BadCallId(_))));
}

#[tokio::test(flavor = "current_thread")]
async fn malformed_json_is_fatal() {
	let (mut conn, _ctx, handle) = spawn_server(cfg(), echo());
	handshake(&mut conn).await;
	send(&mut conn, "{not json").await;
	expect_close(&mut conn, CloseCode::Internal).await;
	assert!(matches!(handle.await.unwrap(), Err(SessionError::BadFrame(_))));
}
