//! Query and serialization surface of the engine.

use serde::Serialize;

use crate::Engine;

/// Serialization of the visible sequence.
///
/// `seq` is a flat array of `(length, id_delta)` pairs, one per visible
/// run, with `id_delta` relative to the previous run's id (starting at
/// 0); `meta` carries one entry per run, so `seq.len() == 2 * meta.len()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot<M> {
	pub data: Vec<u8>,
	pub seq: Vec<i64>,
	pub meta: Vec<M>,
}

/// One tombstoned run from [`Engine::read_del`].
///
/// `after` is the id immediately preceding the run, deleted or not
/// (0 for the front of the rope).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletedRun<M> {
	pub data: Vec<u8>,
	pub meta: M,
	pub id: u64,
	pub after: u64,
}

impl<M: Copy + Eq> Engine<M> {
	/// Visible position of an element id (0 for the root).
	///
	/// A tombstoned id reports the position of the visible content just
	/// before it, which is what [`Engine::reconcile_seq`] builds on.
	#[must_use]
	pub fn position_for(&self, id: u64) -> Option<u64> {
		if id == 0 {
			return Some(0);
		}
		let (nid, off) = self.lookup_node(id)?;
		let end = self.rope.find(nid)?;
		if self.chunk(nid).del {
			Some(end)
		} else {
			Some(end - off)
		}
	}

	/// Element id at a 1-based visible position, biasing to the earlier
	/// node on a boundary. Position 0 is the root.
	#[must_use]
	pub fn find_at(&self, position: u64) -> Option<u64> {
		let (nid, off) = self.rope.by_position(position, false)?;
		Some(nid - off)
	}

	/// Nearest live id: the id itself when visible, otherwise the last
	/// visible id at its position. Useful when a client-held id was
	/// deleted underneath it.
	#[must_use]
	pub fn reconcile_seq(&self, id: u64) -> Option<u64> {
		let position = self.position_for(id)?;
		if position == 0 {
			return Some(0);
		}
		self.find_at(position)
	}

	/// Serialize the visible sequence; see [`Snapshot`].
	#[must_use]
	pub fn read_all(&self) -> Snapshot<M> {
		let mut data = Vec::new();
		let mut seq = Vec::new();
		let mut meta = Vec::new();
		let mut prev = 0u64;
		for (id, _, chunk) in self.rope.iter() {
			if chunk.del {
				continue;
			}
			data.extend_from_slice(&chunk.data);
			seq.push(chunk.data.len() as i64);
			seq.push(id as i64 - prev as i64);
			meta.push(chunk.meta);
			prev = id;
		}
		Snapshot { data, seq, meta }
	}

	/// Serialize the tombstoned runs whose meta passes `filter`.
	#[must_use]
	pub fn read_del(&self, filter: impl Fn(&M) -> bool) -> Vec<DeletedRun<M>> {
		let mut runs = Vec::new();
		let mut prev = 0u64;
		for (id, _, chunk) in self.rope.iter() {
			if chunk.del && filter(&chunk.meta) {
				runs.push(DeletedRun {
					data: chunk.data.clone(),
					meta: chunk.meta,
					id,
					after: prev,
				});
			}
			prev = id;
		}
		runs
	}

	/// Dense byte reconstruction of the id range `(id−len, id]`,
	/// reading tombstoned and visible nodes alike.
	///
	/// None when any part of the range is unknown.
	#[must_use]
	pub fn read_source(&self, id: u64, len: u64) -> Option<Vec<u8>> {
		if len == 0 {
			return Some(Vec::new());
		}
		if id < len {
			return None;
		}
		let mut out = Vec::with_capacity(len as usize);
		let mut cur = id - len + 1;
		while cur <= id {
			let &nid = self.ids.equal_after(&cur)?;
			let chunk = self.chunk(nid);
			let node_low = nid - chunk.data.len() as u64;
			if node_low >= cur {
				return None;
			}
			let from = (cur - node_low - 1) as usize;
			let to = (nid.min(id) - node_low) as usize;
			out.extend_from_slice(&chunk.data[from..to]);
			cur = nid.min(id) + 1;
		}
		Some(out)
	}
}
