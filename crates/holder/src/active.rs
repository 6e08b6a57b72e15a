//! Active-set change stream.

use std::collections::HashSet;
use std::hash::Hash;

use tether_sync::{Ctx, Listener};

use crate::Holder;

/// Pull-based stream of active-set changes for a [`Holder`].
///
/// The first emission is the current loaded key set (possibly empty);
/// every later emission is a batch of `(key, loaded)` deltas. Emissions
/// are duplicate-suppressed per stream, so a key is only reported
/// loaded when the stream did not already consider it loaded.
pub struct ActiveStream<K> {
	listener: Listener<Vec<(K, bool)>>,
	filter: Box<dyn Fn(&K) -> bool + Send>,
	known: HashSet<K>,
	first: Option<Vec<K>>,
}

impl<K> ActiveStream<K>
where
	K: Clone + Eq + Hash + Send + Sync + 'static,
{
	/// Next batch of changes; None once the stream's ctx is cancelled.
	pub async fn next(&mut self) -> Option<Vec<(K, bool)>> {
		if let Some(first) = self.first.take() {
			return Some(first.into_iter().map(|k| (k, true)).collect());
		}
		loop {
			let changes = self.listener.next().await?;
			let mut out = Vec::new();
			for (key, loaded) in changes {
				if !(self.filter)(&key) {
					continue;
				}
				let changed = if loaded {
					self.known.insert(key.clone())
				} else {
					self.known.remove(&key)
				};
				if changed {
					out.push((key, loaded));
				}
			}
			if !out.is_empty() {
				return Some(out);
			}
		}
	}
}

impl<K, T> Holder<K, T>
where
	K: Clone + Eq + Hash + std::fmt::Debug + Send + Sync + 'static,
	T: Send + Sync + 'static,
{
	/// Stream the active key set and its changes while `ctx` lives.
	///
	/// Keys failing `filter` are invisible to this stream.
	pub fn active<F>(&self, ctx: &Ctx, filter: F) -> ActiveStream<K>
	where
		F: Fn(&K) -> bool + Send + 'static,
	{
		// Snapshot and subscription under one lock acquisition, so no
		// change can fall between the two.
		let st = self.shared.state.lock().unwrap();
		let listener = self.shared.events.join(ctx);
		let known: HashSet<K> = st.loaded.iter().filter(|k| filter(k)).cloned().collect();
		drop(st);
		let first: Vec<K> = known.iter().cloned().collect();
		ActiveStream {
			listener,
			filter: Box::new(filter),
			known,
			first: Some(first),
		}
	}
}
