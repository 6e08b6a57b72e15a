//! Skip-list rope with stable identifiers.
//!
//! A [`Rope`] is an ordered list of nodes `(id, length, payload)` behind
//! a fixed zero-id root of length zero. A skip list with per-level
//! widths gives O(log n) positional queries; a hash index gives O(1)
//! lookup by id. Positions are cumulative lengths: [`Rope::find`]
//! reports the position of the END of a node, so the root sits at 0.
//!
//! Iteration is cursor-based and robust to structural mutation: deleting
//! the node a cursor currently rests on rewinds its anchor to the
//! predecessor, so the next step lands on the surviving successor.

use std::cmp::Ordering;
use std::collections::HashMap;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;

/// Maximum skip-list height; levels are chosen geometrically (base ½).
const MAX_LEVEL: usize = 32;

/// Identifier of the fixed root node.
pub const ROOT_ID: u64 = 0;

const ROOT_SLOT: usize = 0;

type Slot = usize;

#[derive(Clone, Copy)]
struct Link {
	next: Option<Slot>,
	prev: Option<Slot>,
	/// Distance from the end of `prev` at this level to the end of the
	/// owning node.
	width: u64,
}

struct Node<P> {
	id: u64,
	len: u64,
	data: Option<P>,
	levels: Vec<Link>,
}

/// Neighborhood of a node, from [`Rope::info`].
pub struct Info<'a, P> {
	pub prev: Option<u64>,
	pub next: Option<u64>,
	pub len: u64,
	pub data: Option<&'a P>,
}

/// Cursor handle registered with the rope; see [`Rope::cursor`].
pub struct Cursor {
	key: u64,
}

/// Skip-list rope; see the module docs.
pub struct Rope<P> {
	nodes: Vec<Option<Node<P>>>,
	free: Vec<Slot>,
	index: FxHashMap<u64, Slot>,
	total: u64,
	count: usize,
	rng: SmallRng,
	cursors: HashMap<u64, Slot>,
	next_cursor: u64,
}

impl<P> Default for Rope<P> {
	fn default() -> Self {
		Self::new()
	}
}

impl<P> Rope<P> {
	#[must_use]
	pub fn new() -> Self {
		Self::with_rng(SmallRng::from_entropy())
	}

	/// Deterministic level selection, for reproducible layouts in tests.
	#[must_use]
	pub fn with_seed(seed: u64) -> Self {
		Self::with_rng(SmallRng::seed_from_u64(seed))
	}

	fn with_rng(rng: SmallRng) -> Self {
		let root = Node {
			id: ROOT_ID,
			len: 0,
			data: None,
			levels: vec![
				Link {
					next: None,
					prev: None,
					width: 0,
				};
				MAX_LEVEL
			],
		};
		let mut index = FxHashMap::default();
		index.insert(ROOT_ID, ROOT_SLOT);
		Self {
			nodes: vec![Some(root)],
			free: Vec::new(),
			index,
			total: 0,
			count: 0,
			rng,
			cursors: HashMap::new(),
			next_cursor: 0,
		}
	}

	/// Sum of all node lengths.
	#[must_use]
	pub fn len(&self) -> u64 {
		self.total
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.count == 0
	}

	/// Number of nodes, excluding the root.
	#[must_use]
	pub fn count(&self) -> usize {
		self.count
	}

	#[must_use]
	pub fn contains(&self, id: u64) -> bool {
		self.index.contains_key(&id)
	}

	/// Position of the END of the node: the cumulative length of all
	/// nodes up to and including it. The root's position is 0.
	#[must_use]
	pub fn find(&self, id: u64) -> Option<u64> {
		let &slot = self.index.get(&id)?;
		Some(self.end_pos(slot))
	}

	/// O(1) neighborhood lookup.
	#[must_use]
	pub fn info(&self, id: u64) -> Option<Info<'_, P>> {
		let &slot = self.index.get(&id)?;
		let node = self.node(slot);
		Some(Info {
			prev: node.levels[0].prev.map(|s| self.node(s).id),
			next: node.levels[0].next.map(|s| self.node(s).id),
			len: node.len,
			data: node.data.as_ref(),
		})
	}

	#[must_use]
	pub fn data(&self, id: u64) -> Option<&P> {
		let &slot = self.index.get(&id)?;
		self.node(slot).data.as_ref()
	}

	/// Mutable payload access. Payload changes never affect positions;
	/// use [`Rope::set_len`] for length changes.
	#[must_use]
	pub fn data_mut(&mut self, id: u64) -> Option<&mut P> {
		let &slot = self.index.get(&id)?;
		self.nodes[slot].as_mut().expect("live slot").data.as_mut()
	}

	#[must_use]
	pub fn next_id(&self, id: u64) -> Option<u64> {
		let &slot = self.index.get(&id)?;
		self.node(slot).levels[0].next.map(|s| self.node(s).id)
	}

	#[must_use]
	pub fn prev_id(&self, id: u64) -> Option<u64> {
		let &slot = self.index.get(&id)?;
		self.node(slot).levels[0].prev.map(|s| self.node(s).id)
	}

	/// Id of the last node ([`ROOT_ID`] when empty).
	#[must_use]
	pub fn tail_id(&self) -> u64 {
		let mut slot = ROOT_SLOT;
		for l in (0..MAX_LEVEL).rev() {
			while let Some(next) = self.level_of(slot, l).and_then(|lk| lk.next) {
				slot = next;
			}
		}
		self.node(slot).id
	}

	/// Node covering position `p`, with the offset from the node's end.
	///
	/// With `bias_after` false the node whose extent `(start, end]`
	/// covers `p` is selected, preferring the earlier node on a
	/// boundary (`p = 0` selects the root). With `bias_after` true the
	/// selection moves across zero-length nodes to the furthest node
	/// starting at or before `p`.
	#[must_use]
	pub fn by_position(&self, p: u64, bias_after: bool) -> Option<(u64, u64)> {
		if p > self.total {
			return None;
		}
		if bias_after {
			let (slot, end) = self.descend(p, true);
			match self.node(slot).levels[0].next {
				Some(next) => {
					let nend = end + self.node(next).len;
					Some((self.node(next).id, nend - p))
				}
				None => Some((self.node(slot).id, end - p)),
			}
		} else {
			if p == 0 {
				return Some((ROOT_ID, 0));
			}
			let (slot, end) = self.descend(p, false);
			let next = self.node(slot).levels[0].next?;
			let nend = end + self.node(next).len;
			Some((self.node(next).id, nend - p))
		}
	}

	/// Insert a node immediately after `prev`.
	///
	/// Fails if `prev` is unknown or `id` already exists (or is the
	/// reserved root id).
	pub fn insert_after(&mut self, prev: u64, id: u64, len: u64, data: P) -> bool {
		if id == ROOT_ID || self.index.contains_key(&id) {
			return false;
		}
		let Some(&prev_slot) = self.index.get(&prev) else {
			return false;
		};
		let height = self.random_height();

		// Per-level predecessors of the insertion point, with the
		// distance from each one's end to prev's end.
		let mut updates = [(ROOT_SLOT, 0u64); MAX_LEVEL];
		let mut cur = prev_slot;
		let mut dist = 0u64;
		for (l, update) in updates.iter_mut().enumerate() {
			while self.node(cur).levels.len() < l + 1 {
				let top = self.node(cur).levels.len() - 1;
				let link = self.node(cur).levels[top];
				dist += link.width;
				cur = link.prev.expect("climb terminates at the root");
			}
			*update = (cur, dist);
		}

		let slot = self.alloc(Node {
			id,
			len,
			data: Some(data),
			levels: Vec::with_capacity(height),
		});
		for (l, &(u, d)) in updates.iter().enumerate().take(height) {
			let next = self.node(u).levels[l].next;
			self.node_mut(slot).levels.push(Link {
				next,
				prev: Some(u),
				width: d + len,
			});
			self.node_mut(u).levels[l].next = Some(slot);
			if let Some(v) = next {
				let link = &mut self.node_mut(v).levels[l];
				link.prev = Some(slot);
				link.width -= d;
			}
		}
		for (l, &(u, _)) in updates.iter().enumerate().skip(height) {
			if let Some(v) = self.node(u).levels[l].next {
				self.node_mut(v).levels[l].width += len;
			}
		}

		self.index.insert(id, slot);
		self.total += len;
		self.count += 1;
		true
	}

	/// Unlink a node, returning its payload.
	///
	/// Cursors resting on the node are rewound to its predecessor.
	pub fn remove(&mut self, id: u64) -> Option<P> {
		if id == ROOT_ID {
			return None;
		}
		let slot = *self.index.get(&id)?;
		let height = self.node(slot).levels.len();
		let len = self.node(slot).len;
		let pred = self.node(slot).levels[0].prev.expect("non-root node");

		for anchor in self.cursors.values_mut() {
			if *anchor == slot {
				*anchor = pred;
			}
		}

		self.adjust_above(slot, height, -(len as i64));
		for l in 0..height {
			let link = self.node(slot).levels[l];
			let u = link.prev.expect("non-root node");
			self.node_mut(u).levels[l].next = link.next;
			if let Some(v) = link.next {
				let vlink = &mut self.node_mut(v).levels[l];
				vlink.prev = Some(u);
				vlink.width = vlink.width + link.width - len;
			}
		}

		self.index.remove(&id);
		self.total -= len;
		self.count -= 1;
		let node = self.nodes[slot].take().expect("live slot");
		self.free.push(slot);
		node.data
	}

	/// Delete every node strictly after `after` up to and including
	/// `until`; returns the number removed.
	///
	/// Zero when either id is unknown or the range is empty or
	/// inverted. An iterator resting on a deleted node is rewound so
	/// iteration continues from the surviving successor.
	pub fn delete_to(&mut self, after: u64, until: u64) -> usize {
		if after == until || self.compare(after, until) != Some(Ordering::Less) {
			return 0;
		}
		let after_slot = *self.index.get(&after).expect("compared id exists");
		let mut n = 0;
		loop {
			let Some(next) = self.node(after_slot).levels[0].next else {
				break;
			};
			let id = self.node(next).id;
			self.remove(id);
			n += 1;
			if id == until {
				break;
			}
		}
		n
	}

	/// Re-register a node's length in place (O(log n) width fix-up).
	pub fn set_len(&mut self, id: u64, len: u64) -> bool {
		if id == ROOT_ID {
			return false;
		}
		let Some(&slot) = self.index.get(&id) else {
			return false;
		};
		let old = self.node(slot).len;
		if old == len {
			return true;
		}
		let delta = len as i64 - old as i64;
		let height = self.node(slot).levels.len();
		for l in 0..height {
			let link = &mut self.node_mut(slot).levels[l];
			link.width = link
				.width
				.checked_add_signed(delta)
				.expect("level width underflow");
		}
		self.adjust_above(slot, height, delta);
		self.node_mut(slot).len = len;
		self.total = self
			.total
			.checked_add_signed(delta)
			.expect("total length underflow");
		true
	}

	/// Signed distance `find(b) − find(a)`.
	#[must_use]
	pub fn between(&self, a: u64, b: u64) -> Option<i64> {
		let pa = self.find(a)?;
		let pb = self.find(b)?;
		Some(pb as i64 - pa as i64)
	}

	/// Relative order of two nodes along the rope.
	///
	/// Cheaper than [`Rope::between`]: climbs the prev-at-level chains
	/// of both nodes and decides at the first shared ancestor, without
	/// computing absolute positions. Equal-position ties (zero-length
	/// runs) are resolved by a walk across the run.
	#[must_use]
	pub fn compare(&self, a: u64, b: u64) -> Option<Ordering> {
		let &sa = self.index.get(&a)?;
		let &sb = self.index.get(&b)?;
		if sa == sb {
			return Some(Ordering::Equal);
		}
		let mut seen: FxHashMap<Slot, u64> = FxHashMap::default();
		let mut slot = sa;
		let mut acc = 0u64;
		loop {
			seen.insert(slot, acc);
			if slot == ROOT_SLOT {
				break;
			}
			let node = self.node(slot);
			let top = node.levels.len() - 1;
			acc += node.levels[top].width;
			slot = node.levels[top].prev.expect("climb terminates at the root");
		}
		let mut slot = sb;
		let mut acc = 0u64;
		let (da, db) = loop {
			if let Some(&da) = seen.get(&slot) {
				break (da, acc);
			}
			let node = self.node(slot);
			let top = node.levels.len() - 1;
			acc += node.levels[top].width;
			slot = node.levels[top].prev.expect("climb terminates at the root");
		};
		// da/db are the distances from the shared ancestor's end to the
		// ends of a and b respectively.
		match da.cmp(&db) {
			Ordering::Less => Some(Ordering::Less),
			Ordering::Greater => Some(Ordering::Greater),
			Ordering::Equal => Some(self.tie_break(sa, sb)),
		}
	}

	/// Open a cursor resting on `after`; stepping yields its successor.
	pub fn cursor(&mut self, after: u64) -> Option<Cursor> {
		let &slot = self.index.get(&after)?;
		let key = self.next_cursor;
		self.next_cursor += 1;
		self.cursors.insert(key, slot);
		Some(Cursor { key })
	}

	/// Advance the cursor one node, returning the id it now rests on.
	pub fn cursor_next(&mut self, cursor: &Cursor) -> Option<u64> {
		let slot = *self.cursors.get(&cursor.key)?;
		let next = self.node(slot).levels[0].next?;
		self.cursors.insert(cursor.key, next);
		Some(self.node(next).id)
	}

	/// Release a cursor registration.
	pub fn cursor_free(&mut self, cursor: Cursor) {
		self.cursors.remove(&cursor.key);
	}

	/// Read-only walk over `(id, len, payload)` in list order.
	pub fn iter(&self) -> impl Iterator<Item = (u64, u64, &P)> + '_ {
		let mut slot = self.node(ROOT_SLOT).levels[0].next;
		std::iter::from_fn(move || {
			let s = slot?;
			let node = self.node(s);
			slot = node.levels[0].next;
			Some((node.id, node.len, node.data.as_ref().expect("non-root payload")))
		})
	}

	fn node(&self, slot: Slot) -> &Node<P> {
		self.nodes[slot].as_ref().expect("live slot")
	}

	fn node_mut(&mut self, slot: Slot) -> &mut Node<P> {
		self.nodes[slot].as_mut().expect("live slot")
	}

	fn level_of(&self, slot: Slot, level: usize) -> Option<Link> {
		self.node(slot).levels.get(level).copied()
	}

	fn alloc(&mut self, node: Node<P>) -> Slot {
		match self.free.pop() {
			Some(slot) => {
				self.nodes[slot] = Some(node);
				slot
			}
			None => {
				self.nodes.push(Some(node));
				self.nodes.len() - 1
			}
		}
	}

	fn random_height(&mut self) -> usize {
		let mut h = 1;
		while h < MAX_LEVEL && self.rng.gen_bool(0.5) {
			h += 1;
		}
		h
	}

	/// End position of a node: climb prev-at-top links, summing widths.
	fn end_pos(&self, mut slot: Slot) -> u64 {
		let mut pos = 0;
		while slot != ROOT_SLOT {
			let node = self.node(slot);
			let top = node.levels.len() - 1;
			pos += node.levels[top].width;
			slot = node.levels[top].prev.expect("climb terminates at the root");
		}
		pos
	}

	/// Last node whose end is `< p` (or `<= p` when `inclusive`), with
	/// its end position.
	fn descend(&self, p: u64, inclusive: bool) -> (Slot, u64) {
		let mut slot = ROOT_SLOT;
		let mut end = 0u64;
		for l in (0..MAX_LEVEL).rev() {
			while let Some(next) = self.level_of(slot, l).and_then(|lk| lk.next) {
				let nend = end + self.node(next).levels[l].width;
				let advance = if inclusive { nend <= p } else { nend < p };
				if !advance {
					break;
				}
				slot = next;
				end = nend;
			}
		}
		(slot, end)
	}

	/// Adjust the widths of links crossing over `slot` at levels at or
	/// above its height.
	fn adjust_above(&mut self, slot: Slot, height: usize, delta: i64) {
		if height >= MAX_LEVEL {
			return;
		}
		let mut cur = self.node(slot).levels[height - 1]
			.prev
			.expect("non-root node");
		for l in height..MAX_LEVEL {
			while self.node(cur).levels.len() < l + 1 {
				let top = self.node(cur).levels.len() - 1;
				cur = self.node(cur).levels[top].prev.expect("climb terminates at the root");
			}
			if let Some(v) = self.node(cur).levels[l].next {
				let link = &mut self.node_mut(v).levels[l];
				link.width = link
					.width
					.checked_add_signed(delta)
					.expect("crossing width underflow");
			}
		}
	}

	/// Order two distinct nodes whose end positions are equal: every
	/// node between them has length zero, so a short forward walk from
	/// `a` either meets `b` or leaves the zero-length run.
	fn tie_break(&self, sa: Slot, sb: Slot) -> Ordering {
		let mut cur = self.node(sa).levels[0].next;
		while let Some(slot) = cur {
			if slot == sb {
				return Ordering::Less;
			}
			if self.node(slot).len > 0 {
				break;
			}
			cur = self.node(slot).levels[0].next;
		}
		Ordering::Greater
	}
}
