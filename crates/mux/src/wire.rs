//! Frame grammar: control prefix, hello exchange, limit advertisement.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::SessionError;

/// Keep-alive frame: an empty control message.
pub(crate) const NOOP: &str = ":{}";

/// Advertised token-bucket parameters, `{"r": rate, "b": burst}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limit {
	#[serde(rename = "r")]
	pub rate: f64,
	#[serde(rename = "b")]
	pub burst: u32,
}

/// Client hello: `{"p":"1"}`.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Hello {
	pub p: String,
}

/// Limits block of the hello ack.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Limits {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub c: Option<Limit>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub p: Option<Limit>,
}

/// Hello ack: `{"ok":true,"i":<init>,"l":{..}}`.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct HelloAck {
	pub ok: bool,
	#[serde(default)]
	pub i: Value,
	#[serde(default)]
	pub l: Limits,
}

/// Control frame body (the bytes after the `:` prefix).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Control {
	#[serde(default)]
	pub c: i64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stop: Option<String>,
}

pub(crate) enum Frame {
	Control(Control),
	Data(Value),
}

/// Split a raw frame into control and data per the `:` prefix rule.
pub(crate) fn decode(raw: &str) -> Result<Frame, SessionError> {
	if let Some(body) = raw.strip_prefix(':') {
		let ctrl: Control =
			serde_json::from_str(body).map_err(|e| SessionError::BadFrame(e.to_string()))?;
		Ok(Frame::Control(ctrl))
	} else {
		let value: Value =
			serde_json::from_str(raw).map_err(|e| SessionError::BadFrame(e.to_string()))?;
		Ok(Frame::Data(value))
	}
}

pub(crate) fn encode_control(call: u32, stop: Option<&str>) -> String {
	let ctrl = Control {
		c: i64::from(call),
		stop: stop.map(str::to_string),
	};
	format!(":{}", serde_json::to_string(&ctrl).expect("control frames serialize"))
}
