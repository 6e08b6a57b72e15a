//! Multiplexed bidirectional calls over one ordered message transport.
//!
//! # Purpose
//!
//! - Define the session protocol that carries many logically-independent
//!   "calls" over a single ordered stream of JSON text frames.
//! - Specify the sticky-id framing, the hello handshake, per-session
//!   rate limits, keep-alive, and the per-call lifecycle shared by the
//!   serving and calling roles.
//!
//! # Mental model
//!
//! - A frame starting with `:` is a control frame `{"c": n, "stop"?: s}`;
//!   anything else is data for the currently addressed call. The
//!   addressed id is decoder state, not a wire field on data frames.
//! - New call ids are introduced only by the calling side and must be
//!   strictly increasing positive 31-bit integers; an id is never reused
//!   within a session. The serving side closes `BadCallId` (3002) on a
//!   violation.
//! - Two token buckets guard a session: every inbound frame charges the
//!   packet bucket, every new call charges the call bucket; exhaustion
//!   closes `ExcessTraffic` (3001).
//! - A new call spawns the session handler with a [`Ready`] latch; the
//!   next new call is accepted only once the latch is signalled (or the
//!   handler finished), giving strict setup ordering without gating
//!   in-call traffic.
//! - The writer emits `:{}` after [`MuxConfig::noop_timeout`] without
//!   outbound traffic to keep the line warm.
//!
//! # Key types
//!
//! | Type | Meaning | Constraints | Constructed / mutated in |
//! |---|---|---|---|
//! | [`MuxConfig`] | Session parameters | Limits advertised in the ack MUST match the enforced buckets | caller |
//! | [`CallIo`] | Per-call message handle | Reads MUST come only from the call's own inbound queue | `serve`'s call spawn, `Client::open` |
//! | [`Ready`] | New-call acceptance latch | MUST be resolved by signal or handler return | handler / completion task |
//! | [`Client`] | Calling-role session | Ids MUST be strictly increasing 31-bit and never reused | `connect`, `Client::open` |
//! | [`SessionError`] | Session-fatal outcome | MUST map to exactly one close code | the session loops |
//!
//! # Invariants
//!
//! 1. Per-call frame order is preserved in each direction; cross-call
//!    ordering is unspecified beyond the monotonicity of new-call ids.
//!    - Enforced in: single reader/writer task per session, FIFO
//!      queues per call
//!    - Tested by: `tests::framing::data_frames_follow_the_sticky_id`
//!    - Failure symptom: interleaved replies land on the wrong call.
//! 2. A new inbound id MUST strictly exceed every previously
//!    introduced id; anything else that is not an active call is
//!    session-fatal BadCallId.
//!    - Enforced in: the control branch of the serving read loop
//!    - Tested by: `tests::framing::stale_new_call_id_is_fatal`
//!    - Failure symptom: a replayed or reused id resurrects a dead
//!      call and receives another call's traffic.
//! 3. A handler return produces exactly one `{"c": id, "stop"}` close
//!    frame, unless the peer already stopped the call.
//!    - Enforced in: removal from the call map decides who announces
//!    - Tested by: `tests::calls::handler_return_closes_the_call`,
//!      `tests::calls::peer_stop_cancels_the_call_with_its_reason`
//!    - Failure symptom: duplicate stop frames re-close a fresh call id
//!      on the peer.
//! 4. Rate exhaustion MUST close the session with ExcessTraffic, not
//!    stall it.
//!    - Enforced in: bucket checks before any routing work
//!    - Tested by: `tests::limits::third_call_with_burst_two_closes_excess_traffic`
//!    - Failure symptom: a flooding peer holds buffers while the
//!      session silently lags.

mod call;
mod client;
mod limit;
mod server;
mod transport;
mod wire;

pub use call::{CallHandler, CallIo, Ready};
pub use client::{CallStopped, Client, connect};
pub use server::serve;
pub use transport::{CloseCode, FrameRx, FrameTx, memory};
pub use wire::Limit;

use std::io;
use std::time::Duration;

use serde_json::Value;

/// Protocol version expected in the client hello.
pub const PROTOCOL_VERSION: &str = "1";

/// Session configuration shared by both roles.
pub struct MuxConfig {
	/// Window for the client hello (serving role).
	pub hello_timeout: Duration,
	/// Idle window before a keep-alive control frame is emitted.
	pub noop_timeout: Duration,
	/// Token bucket charged per newly introduced call.
	pub call_limit: Option<Limit>,
	/// Token bucket charged per inbound frame.
	pub packet_limit: Option<Limit>,
	/// Value handed to call handlers and advertised in the hello ack.
	pub init: Value,
}

impl Default for MuxConfig {
	fn default() -> Self {
		Self {
			hello_timeout: Duration::from_secs(10),
			noop_timeout: Duration::from_secs(6),
			call_limit: None,
			packet_limit: None,
			init: Value::Null,
		}
	}
}

/// Session-fatal errors, each mapped to a close code.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
	#[error("unknown protocol")]
	UnknownProtocol,
	#[error("hello timeout")]
	HelloTimeout,
	#[error("excess traffic")]
	ExcessTraffic,
	#[error("bad call id {0}")]
	BadCallId(i64),
	#[error("bad frame: {0}")]
	BadFrame(String),
	#[error("transport: {0}")]
	Transport(#[from] io::Error),
	#[error("connection closed")]
	Closed,
}

impl SessionError {
	/// Close code sent to the peer when the session dies of this error.
	#[must_use]
	pub fn close_code(&self) -> CloseCode {
		match self {
			Self::UnknownProtocol | Self::HelloTimeout => CloseCode::UnknownProtocol,
			Self::ExcessTraffic => CloseCode::ExcessTraffic,
			Self::BadCallId(_) => CloseCode::BadCallId,
			Self::BadFrame(_) => CloseCode::Internal,
			Self::Transport(_) | Self::Closed => CloseCode::Normal,
		}
	}
}

/// Cause attached to a call cancelled by a peer stop frame.
#[derive(Debug, Clone, thiserror::Error)]
#[error("client: {0}")]
pub struct RemoteCancelled(pub String);

#[cfg(test)]
mod tests;
