//! Identifier-addressed collaborative sequence.
//!
//! # Mental model
//!
//! - An [`Engine`] is a rope of byte chunks over a shared integer id
//!   space. A node's id is the id of its LAST element, so a node of
//!   length L covers the element ids `(id−L, id]`.
//! - Deletion is a tombstone: the node keeps its bytes and id range but
//!   re-registers with rope length 0, dropping out of every positional
//!   query. Restore flips it back.
//! - Adjacent nodes with identical `(meta, del)` and contiguous ids are
//!   eagerly merged, always keeping the RIGHT node's id; element ids
//!   survive merges and splits unchanged.
//! - Visible positions are 1-based: position p addresses the p-th
//!   visible byte; position 0 is the root.
//! - The engine is not internally thread-safe. All mutation goes
//!   through `&mut self` (single-writer discipline).
//!
//! # Key invariants
//!
//! - `len()` equals the byte length of [`Engine::read_all`]'s data.
//! - Every non-root node has at least one element; id uniqueness is
//!   global to the instance.
//! - A freshly appended node inherits the tombstone flag of its direct
//!   predecessor, so inserting inside a deleted run stays deleted.

mod read;

pub use read::{DeletedRun, Snapshot};

use std::cmp::Ordering;

use tether_ordmap::OrdMap;
use tether_rope::Rope;

/// Byte chunk stored per rope node.
#[derive(Clone)]
struct Chunk<M> {
	data: Vec<u8>,
	meta: M,
	del: bool,
}

/// Collaborative sequence engine; see the module docs.
pub struct Engine<M> {
	rope: Rope<Chunk<M>>,
	/// All node ids, for nearest-id lookup of arbitrary element ids.
	ids: OrdMap<u64>,
}

impl<M: Copy + Eq> Default for Engine<M> {
	fn default() -> Self {
		Self::new()
	}
}

impl<M: Copy + Eq> Engine<M> {
	#[must_use]
	pub fn new() -> Self {
		Self {
			rope: Rope::new(),
			ids: OrdMap::new(),
		}
	}

	/// Visible length (tombstoned nodes contribute nothing).
	#[must_use]
	pub fn len(&self) -> u64 {
		self.rope.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.rope.len() == 0
	}

	/// Id at the rope tail, tombstoned or not (0 when empty).
	#[must_use]
	pub fn end_seq(&self) -> u64 {
		self.rope.tail_id()
	}

	/// Insert `data` ending at `id` immediately after element `after`.
	///
	/// Returns `(hidden, ok)`: `ok` reports success and `hidden` whether
	/// the resulting run is tombstoned. A duplicate of an existing
	/// extent with identical bytes is idempotent and reports
	/// `(true, true)`; any partial overlap with existing ids fails.
	pub fn append(&mut self, after: u64, id: u64, data: &[u8], meta: M) -> (bool, bool) {
		let l = data.len() as u64;
		if l == 0 || id < l {
			return (false, false);
		}
		if let Some(existing) = self.read_source(id, l) {
			return (existing == data, existing == data);
		}
		if let Some(&nid) = self.ids.equal_after(&(id - l + 1)) {
			let node_low = nid - self.chunk(nid).data.len() as u64;
			if node_low < id {
				return (false, false);
			}
		}
		if !self.ensure_edge(after) {
			return (false, false);
		}
		let del = after != 0 && self.chunk(after).del;
		let inserted = self.rope.insert_after(
			after,
			id,
			if del { 0 } else { l },
			Chunk {
				data: data.to_vec(),
				meta,
				del,
			},
		);
		debug_assert!(inserted, "validated insert must not fail");
		self.ids.insert(id);
		// Extend the prior node in place when contiguous with equal
		// meta, then try to merge with the follower.
		self.maybe_consume_by_after(after);
		self.maybe_consume_by_after(id);
		(del, true)
	}

	/// Tombstone every element between `a` and `b` (inclusive, either
	/// order).
	///
	/// Returns the first and last newly deleted element ids in rope
	/// order, `(0, 0)` if everything was already deleted, or None for
	/// an unknown/empty range.
	pub fn delete(&mut self, a: u64, b: u64) -> Option<(u64, u64)> {
		let (low, _, high) = self.boundary_for(a, b)?;
		if !self.ensure_edge(low) || !self.ensure_edge(high) {
			return None;
		}
		let mut first = 0u64;
		let mut last = 0u64;
		let mut cur = low;
		loop {
			let next = self.rope.next_id(cur)?;
			cur = next;
			let (len, was_del) = {
				let chunk = self.chunk(cur);
				(chunk.data.len() as u64, chunk.del)
			};
			if !was_del {
				let chunk = self.rope.data_mut(cur).expect("live node");
				chunk.del = true;
				self.rope.set_len(cur, 0);
				if first == 0 {
					first = cur - len + 1;
				}
				last = cur;
			}
			if cur == high {
				break;
			}
		}
		self.merge_run(low, high);
		Some((first, last))
	}

	/// Restore every tombstoned element between `a` and `b`, the
	/// symmetric inverse of [`Engine::delete`].
	pub fn restore(&mut self, a: u64, b: u64) -> Option<(u64, u64)> {
		let (low, _, high) = self.boundary_for(a, b)?;
		if !self.ensure_edge(low) || !self.ensure_edge(high) {
			return None;
		}
		let mut first = 0u64;
		let mut last = 0u64;
		let mut cur = low;
		loop {
			let next = self.rope.next_id(cur)?;
			cur = next;
			let (len, was_del) = {
				let chunk = self.chunk(cur);
				(chunk.data.len() as u64, chunk.del)
			};
			if was_del {
				let chunk = self.rope.data_mut(cur).expect("live node");
				chunk.del = false;
				self.rope.set_len(cur, len);
				if first == 0 {
					first = cur - len + 1;
				}
				last = cur;
			}
			if cur == high {
				break;
			}
		}
		self.merge_run(low, high);
		Some((first, last))
	}

	/// Relocate the elements between `a` and `b` to immediately after
	/// element `after`.
	///
	/// A target inside the moved range is a positional no-op but is
	/// still processed for its edge and merge effects. Moved content
	/// keeps its tombstone flags. Returns the normalized element range
	/// and `effective_after`, the last non-deleted id at the target's
	/// position, so callers can re-point at visible content.
	pub fn move_range(&mut self, a: u64, b: u64, after: u64) -> Option<(u64, u64, u64)> {
		let (low, min, high) = self.boundary_for(a, b)?;
		if after != 0 && self.lookup_node(after).is_none() {
			return None;
		}
		let inside = after != 0
			&& self.compare(low, after)? > 0
			&& self.compare(after, high)? >= 0;
		if !self.ensure_edge(after) || !self.ensure_edge(low) || !self.ensure_edge(high) {
			return None;
		}
		if !inside && after != low {
			let mut moved = Vec::new();
			let mut cur = low;
			loop {
				cur = self.rope.next_id(cur)?;
				moved.push(cur);
				if cur == high {
					break;
				}
			}
			let mut target = after;
			for id in moved {
				let chunk = self.rope.remove(id).expect("range node");
				let rope_len = if chunk.del { 0 } else { chunk.data.len() as u64 };
				let ok = self.rope.insert_after(target, id, rope_len, chunk);
				debug_assert!(ok, "relink of an unlinked node must succeed");
				target = id;
			}
		}
		let effective_after = if after == 0 {
			0
		} else {
			self.reconcile_seq(after).unwrap_or(0)
		};
		self.merge_run_single(low);
		self.merge_run_single(after);
		self.merge_run_single(high);
		Some((min, high, effective_after))
	}

	/// Snapshot undo: make the visible sequence equal the source bytes
	/// of the id range `(id−len, id]`.
	///
	/// Deletes all currently visible content, then walks the source
	/// range in id order, moving each node-contiguous segment to the
	/// rope tail and restoring it. Returns whether anything changed, or
	/// None when part of the range is unknown.
	pub fn restore_to(&mut self, id: u64, len: u64) -> Option<bool> {
		self.read_source(id, len)?;
		if len == 0 {
			return Some(false);
		}
		let mut changed = false;
		if self.len() > 0 {
			let first = self.find_at(1)?;
			let last = self.find_at(self.len())?;
			self.delete(first, last)?;
			changed = true;
		}
		let mut cur = id - len + 1;
		while cur <= id {
			let (nid, _) = self.lookup_node(cur)?;
			let node_low = nid - self.chunk(nid).data.len() as u64;
			let seg_first = cur.max(node_low + 1);
			let seg_last = nid.min(id);
			let tail = self.rope.tail_id();
			self.move_range(seg_first, seg_last, tail)?;
			self.restore(seg_first, seg_last)?;
			changed = true;
			cur = seg_last + 1;
		}
		Some(changed)
	}

	/// Signed ordering along the rope: positive when `b` is after `a`.
	///
	/// Exact element distance within a single node; across nodes only
	/// the sign is meaningful. Accepts 0 as the root.
	#[must_use]
	pub fn compare(&self, a: u64, b: u64) -> Option<i64> {
		let (na, oa) = self.lookup_node(a)?;
		let (nb, ob) = self.lookup_node(b)?;
		if na == nb {
			return Some(oa as i64 - ob as i64);
		}
		match self.rope.compare(na, nb)? {
			Ordering::Less => Some(1),
			Ordering::Greater => Some(-1),
			Ordering::Equal => Some(0),
		}
	}

	/// Node covering an element id: `(node_id, offset_from_node_end)`.
	///
	/// The root is returned for id 0. None when no node covers the id.
	fn lookup_node(&self, id: u64) -> Option<(u64, u64)> {
		if id == 0 {
			return Some((0, 0));
		}
		let &nid = self.ids.equal_after(&id)?;
		let off = nid - id;
		if off < self.chunk(nid).data.len() as u64 {
			Some((nid, off))
		} else {
			None
		}
	}

	/// Guarantee a node boundary directly after element `id`, splitting
	/// the covering node when the id lies strictly inside it.
	///
	/// Both halves keep the original meta and tombstone flag. False
	/// when the id is unknown.
	fn ensure_edge(&mut self, id: u64) -> bool {
		if id == 0 {
			return true;
		}
		let Some((nid, off)) = self.lookup_node(id) else {
			return false;
		};
		if off == 0 {
			return true;
		}
		let prev = self.rope.prev_id(nid).expect("non-root node");
		let (left_data, right_data, meta, del) = {
			let chunk = self.chunk(nid);
			let split = chunk.data.len() - off as usize;
			(
				chunk.data[..split].to_vec(),
				chunk.data[split..].to_vec(),
				chunk.meta,
				chunk.del,
			)
		};
		let left_len = if del { 0 } else { left_data.len() as u64 };
		let right_len = if del { 0 } else { right_data.len() as u64 };
		let ok = self.rope.insert_after(
			prev,
			id,
			left_len,
			Chunk {
				data: left_data,
				meta,
				del,
			},
		);
		debug_assert!(ok, "split insert must not collide");
		self.rope.set_len(nid, right_len);
		self.rope.data_mut(nid).expect("live node").data = right_data;
		self.ids.insert(id);
		true
	}

	/// Merge the node ending at `id` into its right neighbor when they
	/// are contiguous with identical `(meta, del)`, keeping the right
	/// node's id. Reports whether a merge happened.
	fn maybe_consume_by_after(&mut self, id: u64) -> bool {
		if id == 0 || !self.rope.contains(id) {
			return false;
		}
		let Some(next) = self.rope.next_id(id) else {
			return false;
		};
		let (meta, del) = {
			let chunk = self.chunk(id);
			(chunk.meta, chunk.del)
		};
		{
			let right = self.chunk(next);
			let right_low = next - right.data.len() as u64;
			if right_low != id || right.meta != meta || right.del != del {
				return false;
			}
		}
		let left = self.rope.remove(id).expect("live node");
		self.ids.remove(&id);
		let merged_len = {
			let chunk = self.rope.data_mut(next).expect("live node");
			let mut data = left.data;
			data.extend_from_slice(&chunk.data);
			chunk.data = data;
			chunk.data.len() as u64
		};
		if !del {
			self.rope.set_len(next, merged_len);
		}
		true
	}

	/// Normalized operation range for an element pair (either order):
	/// `(low, min, high)` where `low` is the id immediately preceding
	/// the earlier element along the rope (possibly 0).
	fn boundary_for(&self, a: u64, b: u64) -> Option<(u64, u64, u64)> {
		if a == 0 || b == 0 {
			return None;
		}
		let ord = self.compare(a, b)?;
		let (min, max) = if ord >= 0 { (a, b) } else { (b, a) };
		let (nid, _) = self.lookup_node(min)?;
		let node_low = nid - self.chunk(nid).data.len() as u64;
		let low = if min == node_low + 1 {
			self.rope.prev_id(nid).unwrap_or(0)
		} else {
			min - 1
		};
		Some((low, min, max))
	}

	/// Re-establish the eager-merge invariant across `(low, high]` and
	/// its outer boundaries after a range mutation.
	fn merge_run(&mut self, low: u64, high: u64) {
		let mut cur = low;
		loop {
			let stop = cur == high;
			let next = self.rope.next_id(cur);
			self.maybe_consume_by_after(cur);
			if stop {
				break;
			}
			match next {
				Some(next) => cur = next,
				None => break,
			}
		}
	}

	/// Merge attempt at one boundary, tolerating ids consumed by an
	/// earlier merge.
	fn merge_run_single(&mut self, id: u64) {
		if id != 0 {
			self.maybe_consume_by_after(id);
		}
	}

	fn chunk(&self, id: u64) -> &Chunk<M> {
		self.rope.data(id).expect("indexed node")
	}
}

#[cfg(test)]
mod tests;
