//! Hello exchange behavior.

use pretty_assertions::assert_eq;
use serde_json::json;

use super::{cfg, echo, expect_close, handshake, send, spawn_server};
use crate::transport::CloseCode;
use crate::wire::Limit;
use crate::{MuxConfig, SessionError};

#[tokio::test(flavor = "current_thread")]
async fn ack_advertises_init_and_limits() {
	let config = MuxConfig {
		call_limit: Some(Limit {
			rate: 0.5,
			burst: 2,
		}),
		..cfg()
	};
	let (mut conn, _ctx, _handle) = spawn_server(config, echo());
	let ack = handshake(&mut conn).await;
	assert_eq!(ack["ok"], json!(true));
	assert_eq!(ack["i"], json!(42));
	assert_eq!(ack["l"]["c"], json!({ "r": 0.5, "b": 2 }));
	assert!(ack["l"].get("p").is_none(), "unset limits are omitted");
}

#[tokio::test(flavor = "current_thread")]
async fn version_mismatch_closes_unknown_protocol() {
	let (mut conn, _ctx, handle) = spawn_server(cfg(), echo());
	send(&mut conn, "{\"p\":\"2\"}").await;
	expect_close(&mut conn, CloseCode::UnknownProtocol).await;
	assert!(matches!(
		handle.await.unwrap(),
		Err(SessionError::UnknownProtocol)
	));
}

#[tokio::test(flavor = "current_thread")]
async fn non_hello_first_frame_closes_unknown_protocol() {
	let (mut conn, _ctx, handle) = spawn_server(cfg(), echo());
	send(&mut conn, "\"howdy\"").await;
	expect_close(&mut conn, CloseCode::UnknownProtocol).await;
	assert!(matches!(
		handle.await.unwrap(),
		Err(SessionError::UnknownProtocol)
	));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn silent_client_times_out() {
	let (mut conn, _ctx, handle) = spawn_server(cfg(), echo());
	// Auto-advancing paused time carries us past the 10 s window.
	expect_close(&mut conn, CloseCode::UnknownProtocol).await;
	assert!(matches!(
		handle.await.unwrap(),
		Err(SessionError::HelloTimeout)
	));
}
