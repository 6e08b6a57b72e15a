//! Message-transport seam.
//!
//! The session logic is written against frame-level read/write traits,
//! keeping the WebSocket/HTTP glue outside this crate. [`memory`]
//! provides an in-process duplex pair used throughout the tests.

use std::io;

use async_trait::async_trait;

/// Close codes in the WebSocket numbering, 3000-range for protocol
/// violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
	Normal,
	UnknownProtocol,
	ExcessTraffic,
	BadCallId,
	Internal,
}

impl CloseCode {
	#[must_use]
	pub fn code(self) -> u16 {
		match self {
			Self::Normal => 1000,
			Self::UnknownProtocol => 3000,
			Self::ExcessTraffic => 3001,
			Self::BadCallId => 3002,
			Self::Internal => 1011,
		}
	}
}

/// Receiving half of an ordered text-frame transport.
#[async_trait]
pub trait FrameRx: Send {
	/// Next frame; None once the peer closed the stream.
	async fn recv(&mut self) -> io::Result<Option<String>>;
}

/// Sending half of an ordered text-frame transport.
#[async_trait]
pub trait FrameTx: Send {
	async fn send(&mut self, frame: String) -> io::Result<()>;
	/// Close the stream with a status visible to the peer.
	async fn close(&mut self, code: CloseCode, reason: &str) -> io::Result<()>;
}

/// In-process duplex transport.
pub mod memory {
	use std::io;

	use async_trait::async_trait;
	use tokio::sync::mpsc;

	use super::{CloseCode, FrameRx, FrameTx};

	/// One observable transport event, for test assertions.
	#[derive(Debug, Clone, PartialEq, Eq)]
	pub enum Event {
		Frame(String),
		Close(CloseCode, String),
	}

	/// One endpoint of the duplex pair.
	pub struct Conn {
		pub rx: Rx,
		pub tx: Tx,
	}

	impl Conn {
		pub fn split(self) -> (Rx, Tx) {
			(self.rx, self.tx)
		}
	}

	/// Connected endpoints: frames sent on one arrive on the other.
	#[must_use]
	pub fn pair() -> (Conn, Conn) {
		let (a_tx, b_rx) = mpsc::unbounded_channel();
		let (b_tx, a_rx) = mpsc::unbounded_channel();
		(
			Conn {
				rx: Rx { rx: a_rx },
				tx: Tx { tx: a_tx },
			},
			Conn {
				rx: Rx { rx: b_rx },
				tx: Tx { tx: b_tx },
			},
		)
	}

	pub struct Rx {
		rx: mpsc::UnboundedReceiver<Event>,
	}

	impl Rx {
		/// Raw event stream, exposing close codes to tests.
		pub async fn recv_event(&mut self) -> Option<Event> {
			self.rx.recv().await
		}
	}

	#[async_trait]
	impl FrameRx for Rx {
		async fn recv(&mut self) -> io::Result<Option<String>> {
			match self.rx.recv().await {
				Some(Event::Frame(frame)) => Ok(Some(frame)),
				Some(Event::Close(..)) | None => Ok(None),
			}
		}
	}

	pub struct Tx {
		tx: mpsc::UnboundedSender<Event>,
	}

	impl Tx {
		fn push(&self, event: Event) -> io::Result<()> {
			self.tx
				.send(event)
				.map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
		}
	}

	#[async_trait]
	impl FrameTx for Tx {
		async fn send(&mut self, frame: String) -> io::Result<()> {
			self.push(Event::Frame(frame))
		}

		async fn close(&mut self, code: CloseCode, reason: &str) -> io::Result<()> {
			self.push(Event::Close(code, reason.to_string()))
		}
	}
}
