//! Multi-listener broadcast FIFO.
//!
//! Every [`Listener`] observes, exactly once and in push order, each
//! item pushed after it joined. Buffer entries are released once every
//! listener's cursor has passed them; with no listeners, pushed items
//! are dropped outright.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::ctx::Ctx;

/// Broadcast FIFO handle; cheap to clone.
pub struct Queue<T> {
	shared: Arc<Shared<T>>,
}

impl<T> Clone for Queue<T> {
	fn clone(&self) -> Self {
		Self {
			shared: Arc::clone(&self.shared),
		}
	}
}

struct Shared<T> {
	state: Mutex<State<T>>,
	wake: Notify,
}

struct State<T> {
	buf: VecDeque<T>,
	/// Wire position of `buf[0]`.
	base: u64,
	/// Next wire position to be assigned.
	head: u64,
	listeners: HashMap<u64, Entry>,
	next_key: u64,
}

struct Entry {
	at: u64,
	ctx: Ctx,
}

impl<T> State<T> {
	/// Release buffer entries every live listener has passed.
	fn trim(&mut self) {
		match self.listeners.values().map(|e| e.at).min() {
			None => {
				self.buf.clear();
				self.base = self.head;
			}
			Some(min) => {
				while self.base < min {
					self.buf.pop_front();
					self.base += 1;
				}
			}
		}
	}
}

impl<T> Default for Queue<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> Queue<T> {
	#[must_use]
	pub fn new() -> Self {
		Self {
			shared: Arc::new(Shared {
				state: Mutex::new(State {
					buf: VecDeque::new(),
					base: 0,
					head: 0,
					listeners: HashMap::new(),
					next_key: 0,
				}),
				wake: Notify::new(),
			}),
		}
	}

	/// Append one item; see [`Queue::push_all`].
	pub fn push(&self, item: T) -> bool {
		self.push_all(std::iter::once(item))
	}

	/// Append items atomically and wake every waiting listener.
	///
	/// Returns true iff at least one live listener will observe the
	/// items; with no listeners they are dropped.
	pub fn push_all(&self, items: impl IntoIterator<Item = T>) -> bool {
		let pushed = {
			let mut state = self.shared.state.lock().unwrap();
			state.listeners.retain(|_, e| !e.ctx.is_cancelled());
			let live = !state.listeners.is_empty();
			let mut n = 0u64;
			for item in items {
				if live {
					state.buf.push_back(item);
				}
				n += 1;
			}
			state.head += n;
			if !live {
				state.base = state.head;
			}
			state.trim();
			live && n > 0
		};
		if pushed {
			self.shared.wake.notify_waiters();
		}
		pushed
	}

	/// Register a listener whose cursor starts at the current head.
	///
	/// The listener is removed when `ctx` cancels (or on drop).
	pub fn join(&self, ctx: &Ctx) -> Listener<T>
	where
		T: Send + 'static,
	{
		let key = {
			let mut state = self.shared.state.lock().unwrap();
			let key = state.next_key;
			state.next_key += 1;
			let at = state.head;
			state.listeners.insert(key, Entry { at, ctx: ctx.clone() });
			key
		};
		let shared = Arc::clone(&self.shared);
		let watch = ctx.clone();
		tokio::spawn(async move {
			watch.cancelled().await;
			let mut state = shared.state.lock().unwrap();
			if state.listeners.remove(&key).is_some() {
				state.trim();
			}
		});
		Listener {
			shared: Arc::clone(&self.shared),
			key,
			ctx: ctx.clone(),
		}
	}
}

/// A single subscriber's view of the queue.
pub struct Listener<T> {
	shared: Arc<Shared<T>>,
	key: u64,
	ctx: Ctx,
}

impl<T: Clone> Listener<T> {
	/// Non-blocking look at the next unconsumed item.
	#[must_use]
	pub fn peek(&self) -> Option<T> {
		let state = self.shared.state.lock().unwrap();
		let entry = state.listeners.get(&self.key)?;
		if entry.at < state.head {
			let idx = (entry.at - state.base) as usize;
			Some(state.buf[idx].clone())
		} else {
			None
		}
	}

	/// Consume one item, waiting if none is pending.
	///
	/// Returns None once the listener's ctx is cancelled.
	pub async fn next(&mut self) -> Option<T> {
		loop {
			let notified = self.shared.wake.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();
			{
				let mut state = self.shared.state.lock().unwrap();
				if self.ctx.is_cancelled() {
					if state.listeners.remove(&self.key).is_some() {
						state.trim();
					}
					return None;
				}
				let head = state.head;
				let base = state.base;
				let entry = state.listeners.get_mut(&self.key)?;
				if entry.at < head {
					let idx = (entry.at - base) as usize;
					entry.at += 1;
					let item = state.buf[idx].clone();
					state.trim();
					return Some(item);
				}
			}
			tokio::select! {
				() = self.ctx.cancelled() => {}
				() = &mut notified => {}
			}
		}
	}

	/// Consume and return everything currently pending, waiting for at
	/// least one item.
	pub async fn batch(&mut self) -> Option<Vec<T>> {
		loop {
			let notified = self.shared.wake.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();
			{
				let mut state = self.shared.state.lock().unwrap();
				if self.ctx.is_cancelled() {
					if state.listeners.remove(&self.key).is_some() {
						state.trim();
					}
					return None;
				}
				let head = state.head;
				let base = state.base;
				let entry = state.listeners.get_mut(&self.key)?;
				if entry.at < head {
					let from = (entry.at - base) as usize;
					let to = (head - base) as usize;
					entry.at = head;
					let items = state.buf.range(from..to).cloned().collect();
					state.trim();
					return Some(items);
				}
			}
			tokio::select! {
				() = self.ctx.cancelled() => {}
				() = &mut notified => {}
			}
		}
	}

	/// Lazy item-at-a-time sequence over [`Listener::next`].
	pub fn iter(&mut self) -> Iter<'_, T> {
		Iter { listener: self }
	}

	/// Lazy batch-at-a-time sequence over [`Listener::batch`].
	pub fn batch_iter(&mut self) -> BatchIter<'_, T> {
		BatchIter { listener: self }
	}
}

/// Pull-based sequence of single items.
pub struct Iter<'a, T> {
	listener: &'a mut Listener<T>,
}

impl<T: Clone> Iter<'_, T> {
	pub async fn next(&mut self) -> Option<T> {
		self.listener.next().await
	}
}

/// Pull-based sequence of pending batches.
pub struct BatchIter<'a, T> {
	listener: &'a mut Listener<T>,
}

impl<T: Clone> BatchIter<'_, T> {
	pub async fn next(&mut self) -> Option<Vec<T>> {
		self.listener.batch().await
	}
}

impl<T> Drop for Listener<T> {
	fn drop(&mut self) {
		let mut state = self.shared.state.lock().unwrap();
		if state.listeners.remove(&self.key).is_some() {
			state.trim();
		}
	}
}
