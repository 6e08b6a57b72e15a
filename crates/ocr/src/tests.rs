//! Unit tests for the collaborative sequence engine.

mod ranges;

use crate::Engine;

/// Engine holding "hello there" as two runs of meta 1 (the ids used
/// across the suite: node 123 = "hello ", node 10 = "there").
fn hello_there() -> Engine<i32> {
	let mut e = Engine::new();
	assert_eq!(e.append(0, 123, b"hello ", 1), (false, true));
	assert_eq!(e.append(123, 10, b"there", 1), (false, true));
	e
}

fn text<M: Copy + Eq>(e: &Engine<M>) -> String {
	String::from_utf8(e.read_all().data).unwrap()
}

/// Asserts the eager-merge invariant and minimum node length: no two
/// adjacent nodes share `(meta, del)` while being id-contiguous, and
/// every node carries at least one element.
fn assert_maximal<M: Copy + Eq + std::fmt::Debug>(e: &Engine<M>) {
	let mut prev: Option<(u64, M, bool)> = None;
	for (id, _, chunk) in e.rope.iter() {
		assert!(!chunk.data.is_empty(), "empty node {id}");
		let low = id - chunk.data.len() as u64;
		if let Some((pid, pmeta, pdel)) = prev {
			assert!(
				!(low == pid && pmeta == chunk.meta && pdel == chunk.del),
				"unmerged adjacent runs at {pid}/{id}"
			);
		}
		prev = Some((id, chunk.meta, chunk.del));
	}
}
