//! Keyed shared-instance lifecycle manager.
//!
//! # Purpose
//!
//! - Define the [`Holder`]: a cache of lazily built instances keyed by
//!   `K`, shared by every concurrent caller of [`Holder::acquire`] and
//!   torn down a configurable delay after the last caller leaves.
//! - Describe the resurrection and serialization rules that make the
//!   build/destroy pair safe under concurrency.
//!
//! # Mental model
//!
//! - The first `acquire` for a key installs an activedoc and starts the
//!   build; later callers join its context group and share the result.
//! - When the last caller's ctx cancels, the group's halt function
//!   races `shutdown_delay` against the group's resume signal. A caller
//!   arriving inside that window resurrects the instance; otherwise the
//!   destroy callback runs and the activedoc latches halting → halted.
//! - A new `acquire` during teardown blocks on the halted latch before
//!   installing a fresh activedoc, so at most one build ∪ destroy is in
//!   flight per key.
//! - Build failures are surfaced once to every waiting caller and feed
//!   an exponential backoff (`failures² × 1 ms`) charged to the next
//!   build of that key; a successful build resets the counter.
//!
//! # Key types
//!
//! | Type | Meaning | Constraints | Constructed / mutated in |
//! |---|---|---|---|
//! | [`Holder`] | Keyed instance cache | MUST be the only owner of the key map | `Holder::acquire`, `Holder::shutdown` |
//! | `ActiveDoc` | One key's live registration | MUST latch halting before destroy, halted after | `Holder::install`, the group halt function |
//! | [`Options`] | Build/destroy pair and grace window | build and destroy MUST be safe to re-run per key | `Options::new` |
//! | [`Doc`] | A caller's handle | `done` MUST outlive the instance and carry the stop cause | `Holder::acquire` |
//! | [`ActiveStream`] | Active-set change feed | First emission MUST be the snapshot taken under the map lock | `Holder::active` |
//!
//! # Invariants
//!
//! 1. At most one activedoc per key; a halted one MUST be removed
//!    before a fresh one is installed.
//!    - Enforced in: `Holder::acquire` (step 1), `Holder::install`
//!    - Tested by: `tests::lifecycle::slow_destroy_serializes_rebuild`
//!    - Failure symptom: two builds race for one key and the loser's
//!      instance leaks without a destroy.
//! 2. The destroy callback MUST run at most once per successful build.
//!    - Enforced in: the `destroyed` claim flag, checked by both the
//!      halt function and `Holder::shutdown`
//!    - Tested by: `tests::lifecycle::destroy_fires_exactly_once_then_recreates`
//!    - Failure symptom: double-free-style teardown of external
//!      resources held by the instance.
//! 3. A caller arriving inside the grace window MUST resurrect the
//!    instance and abort the pending destroy.
//!    - Enforced in: the resume race in the group halt function,
//!      ordered against joins by the map lock
//!    - Tested by: `tests::resurrection::rejoin_within_window_reuses_instance`
//!    - Failure symptom: a caller holds an instance whose destroy is
//!      concurrently running.
//! 4. Cancelling one caller MUST NOT cancel the shared instance.
//!    - Enforced in: membership is a context-group add, nothing more
//!    - Tested by: `tests::lifecycle::instance_survives_while_any_caller_remains`
//!    - Failure symptom: one departing client tears the document away
//!      from every other client.

mod active;

pub use active::ActiveStream;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tether_sync::{CGroup, CancelFn, Cause, Ctx, Promise, Queue};

type BoxFut<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Builds an instance for a key. The supplied [`CancelFn`] cancels the
/// instance's derived context with a cause, delivered to every holder.
pub type BuildFn<K, T> = Arc<dyn Fn(Ctx, CancelFn, K) -> BoxFut<Result<T, Cause>> + Send + Sync>;

/// Tears an instance down after the grace window expires.
pub type DestroyFn<K, T> = Arc<dyn Fn(Ctx, K, Arc<T>) -> BoxFut<Result<(), Cause>> + Send + Sync>;

/// Holder-level error causes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	#[error("build failed: {cause}")]
	BuildFailed { cause: Cause },
	#[error("holder is shut down")]
	Shutdown,
}

/// Holder configuration: the build/destroy pair and the grace window.
pub struct Options<K, T> {
	pub build: BuildFn<K, T>,
	pub destroy: DestroyFn<K, T>,
	pub shutdown_delay: Duration,
}

impl<K, T> Options<K, T> {
	/// Options with a 5 second shutdown delay.
	pub fn new<B, BFut, D, DFut>(build: B, destroy: D) -> Self
	where
		B: Fn(Ctx, CancelFn, K) -> BFut + Send + Sync + 'static,
		BFut: Future<Output = Result<T, Cause>> + Send + 'static,
		D: Fn(Ctx, K, Arc<T>) -> DFut + Send + Sync + 'static,
		DFut: Future<Output = Result<(), Cause>> + Send + 'static,
	{
		Self {
			build: Arc::new(move |ctx, cancel, key| Box::pin(build(ctx, cancel, key))),
			destroy: Arc::new(move |ctx, key, instance| Box::pin(destroy(ctx, key, instance))),
			shutdown_delay: Duration::from_secs(5),
		}
	}

	#[must_use]
	pub fn shutdown_delay(mut self, delay: Duration) -> Self {
		self.shutdown_delay = delay;
		self
	}
}

/// A caller's handle on a shared instance.
#[derive(Debug)]
pub struct Doc<T> {
	instance: Arc<T>,
	done: Ctx,
}

impl<T> Doc<T> {
	/// The shared instance.
	#[must_use]
	pub fn instance(&self) -> &Arc<T> {
		&self.instance
	}

	/// Context cancelled when the instance stops, carrying the cause.
	#[must_use]
	pub fn done(&self) -> &Ctx {
		&self.done
	}
}

struct ActiveDoc<T> {
	epoch: u64,
	group: CGroup,
	derived: Ctx,
	ready: Promise<Arc<T>>,
	halting: CancellationToken,
	halted: CancellationToken,
	destroyed: AtomicBool,
}

struct State<K, T> {
	docs: HashMap<K, Arc<ActiveDoc<T>>>,
	failures: HashMap<K, u32>,
	loaded: HashSet<K>,
	shutdown: bool,
}

struct Shared<K, T> {
	state: Mutex<State<K, T>>,
	events: Queue<Vec<(K, bool)>>,
	opts: Options<K, T>,
	next_epoch: AtomicU64,
}

/// Keyed instance cache; see the module docs. Cheap to clone.
pub struct Holder<K, T> {
	shared: Arc<Shared<K, T>>,
}

impl<K, T> Clone for Holder<K, T> {
	fn clone(&self) -> Self {
		Self {
			shared: Arc::clone(&self.shared),
		}
	}
}

enum Step<T> {
	Wait(CancellationToken),
	Ready(Arc<ActiveDoc<T>>),
}

impl<K, T> Holder<K, T>
where
	K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
	T: Send + Sync + 'static,
{
	#[must_use]
	pub fn new(opts: Options<K, T>) -> Self {
		Self {
			shared: Arc::new(Shared {
				state: Mutex::new(State {
					docs: HashMap::new(),
					failures: HashMap::new(),
					loaded: HashSet::new(),
					shutdown: false,
				}),
				events: Queue::new(),
				opts,
				next_epoch: AtomicU64::new(1),
			}),
		}
	}

	/// Join or create the shared instance for `key`.
	///
	/// The caller's `ctx` is its membership: cancelling it releases this
	/// caller's reference without touching the instance. The returned
	/// [`Doc::done`] context delivers the cause when the instance stops.
	pub async fn acquire(&self, ctx: &Ctx, key: K) -> Result<Doc<T>, Cause> {
		loop {
			let step = {
				let mut st = self.shared.state.lock().unwrap();
				if st.shutdown {
					return Err(Arc::new(Error::Shutdown));
				}
				match st.docs.get(&key).cloned() {
					Some(doc) if doc.halted.is_cancelled() => {
						// Stale registration; replace it.
						st.docs.remove(&key);
						Step::Ready(self.install(&mut st, ctx, key.clone())?)
					}
					Some(doc) if doc.halting.is_cancelled() => {
						// Serialize against the in-flight teardown.
						Step::Wait(doc.halted.clone())
					}
					Some(doc) => {
						if doc.group.add(ctx) {
							Step::Ready(doc)
						} else if ctx.is_cancelled() {
							return Err(ctx.cause_or_cancelled());
						} else {
							// The group already finished; serialize on
							// the halted latch and retry.
							Step::Wait(doc.halted.clone())
						}
					}
					None => Step::Ready(self.install(&mut st, ctx, key.clone())?),
				}
			};
			match step {
				Step::Wait(halted) => halted.cancelled().await,
				Step::Ready(doc) => {
					let instance = doc.ready.wait(ctx).await?;
					return Ok(Doc {
						instance,
						done: doc.derived.clone(),
					});
				}
			}
		}
	}

	/// Tear down every instance with a Shutdown cause and wait for the
	/// destroys to finish. Subsequent [`Holder::acquire`] calls fail.
	pub async fn shutdown(&self) {
		let docs: Vec<(K, Arc<ActiveDoc<T>>)> = {
			let mut st = self.shared.state.lock().unwrap();
			st.shutdown = true;
			st.docs.drain().collect()
		};
		for (key, doc) in docs {
			doc.halting.cancel();
			doc.derived
				.cancel_with(Arc::new(tether_sync::Error::Shutdown));
			if let Some(Ok(instance)) = doc.ready.sync()
				&& !doc.destroyed.swap(true, Ordering::SeqCst)
			{
				if let Err(cause) =
					(self.shared.opts.destroy)(doc.derived.clone(), key.clone(), instance).await
				{
					tracing::warn!(?key, %cause, "destroy failed during shutdown");
				}
			}
			{
				let mut st = self.shared.state.lock().unwrap();
				if st.loaded.remove(&key) {
					self.shared.events.push(vec![(key.clone(), false)]);
				}
			}
			doc.halted.cancel();
		}
		tracing::info!("holder shut down");
	}

	/// Install a fresh activedoc for `key` under the map lock, joining
	/// the calling ctx, and spawn its build task.
	fn install(
		&self,
		st: &mut State<K, T>,
		ctx: &Ctx,
		key: K,
	) -> Result<Arc<ActiveDoc<T>>, Cause> {
		let failures = st.failures.get(&key).copied().unwrap_or(0);
		let epoch = self.shared.next_epoch.fetch_add(1, Ordering::Relaxed);
		let group = CGroup::new();
		if !group.add(ctx) {
			return Err(ctx.cause_or_cancelled());
		}
		let derived = group.start();
		let doc = Arc::new(ActiveDoc {
			epoch,
			group: group.clone(),
			derived: derived.clone(),
			ready: Promise::new(),
			halting: CancellationToken::new(),
			halted: CancellationToken::new(),
			destroyed: AtomicBool::new(false),
		});
		st.docs.insert(key.clone(), Arc::clone(&doc));
		tracing::debug!(?key, failures, "installed activedoc");

		// Delayed teardown with resurrection; the closure must not hold
		// the activedoc or the holder strongly (reference cycles).
		{
			let weak = Arc::downgrade(&self.shared);
			let key = key.clone();
			let ready = doc.ready.clone();
			let halting = doc.halting.clone();
			let halted = doc.halted.clone();
			let delay = self.shared.opts.shutdown_delay;
			group.halt(move |dctx, resume| {
				let weak = weak.clone();
				let key = key.clone();
				let ready = ready.clone();
				let halting = halting.clone();
				let halted = halted.clone();
				async move {
					tokio::select! {
						() = resume.fired() => return Ok(()),
						() = tokio::time::sleep(delay) => {}
					}
					let Some(shared) = weak.upgrade() else {
						halting.cancel();
						halted.cancel();
						return Ok(());
					};
					{
						// Ordered against join attempts via the map lock.
						let _st = shared.state.lock().unwrap();
						if resume.is_fired() || halted.is_cancelled() {
							return Ok(());
						}
						halting.cancel();
					}
					let result = match ready.sync() {
						Some(Ok(instance)) => {
							let claim = shared
								.state
								.lock()
								.unwrap()
								.docs
								.get(&key)
								.filter(|d| d.epoch == epoch)
								.map(|d| !d.destroyed.swap(true, Ordering::SeqCst))
								.unwrap_or(false);
							if claim {
								tracing::info!(?key, "destroying idle instance");
								(shared.opts.destroy)(dctx.clone(), key.clone(), instance).await
							} else {
								Ok(())
							}
						}
						_ => Ok(()),
					};
					{
						let mut st = shared.state.lock().unwrap();
						if st.loaded.remove(&key) {
							shared.events.push(vec![(key.clone(), false)]);
						}
						if st.docs.get(&key).is_some_and(|d| d.epoch == epoch) {
							st.docs.remove(&key);
						}
					}
					halted.cancel();
					if let Err(cause) = &result {
						tracing::warn!(?key, %cause, "destroy failed");
					}
					result
				}
			});
		}

		// Build task: backoff, then build under the derived ctx.
		{
			let weak = Arc::downgrade(&self.shared);
			let doc = Arc::clone(&doc);
			let key = key.clone();
			tokio::spawn(async move {
				let backoff = Duration::from_millis(u64::from(failures).pow(2));
				if !backoff.is_zero() {
					tokio::select! {
						() = tokio::time::sleep(backoff) => {}
						() = doc.derived.cancelled() => {}
					}
				}
				let Some(shared) = weak.upgrade() else {
					doc.ready.resolve(Err(Arc::new(Error::Shutdown)));
					doc.halting.cancel();
					doc.halted.cancel();
					return;
				};
				if doc.derived.is_cancelled() {
					Self::fail_build(&shared, &doc, &key, doc.derived.cause_or_cancelled(), false);
					return;
				}
				let cancel = doc.derived.canceller();
				let result = tokio::select! {
					biased;
					res = (shared.opts.build)(doc.derived.clone(), cancel, key.clone()) => res,
					() = doc.derived.cancelled() => Err(doc.derived.cause_or_cancelled()),
				};
				match result {
					Ok(instance) => {
						let instance = Arc::new(instance);
						let shut = {
							let mut st = shared.state.lock().unwrap();
							if st.shutdown {
								true
							} else {
								st.failures.remove(&key);
								st.loaded.insert(key.clone());
								shared.events.push(vec![(key.clone(), true)]);
								false
							}
						};
						if shut {
							// Raced a holder shutdown: tear down now.
							if !doc.destroyed.swap(true, Ordering::SeqCst) {
								let _ = (shared.opts.destroy)(
									doc.derived.clone(),
									key.clone(),
									Arc::clone(&instance),
								)
								.await;
							}
							Self::fail_build(&shared, &doc, &key, Arc::new(Error::Shutdown), false);
							return;
						}
						doc.ready.resolve(Ok(instance));
						tracing::info!(?key, "instance ready");
					}
					Err(cause) => {
						tracing::warn!(?key, %cause, "build failed");
						Self::fail_build(&shared, &doc, &key, cause, true);
					}
				}
			});
		}
		Ok(doc)
	}

	/// Resolve a failed build: surface the cause to waiting callers,
	/// bump the failure counter, and latch the activedoc out of the map.
	fn fail_build(
		shared: &Arc<Shared<K, T>>,
		doc: &Arc<ActiveDoc<T>>,
		key: &K,
		cause: Cause,
		count_failure: bool,
	) {
		{
			let mut st = shared.state.lock().unwrap();
			if count_failure {
				*st.failures.entry(key.clone()).or_insert(0) += 1;
			}
			if st.docs.get(key).is_some_and(|d| d.epoch == doc.epoch) {
				st.docs.remove(key);
			}
		}
		let cause: Cause = Arc::new(Error::BuildFailed { cause });
		doc.ready.resolve(Err(Arc::clone(&cause)));
		doc.derived.cancel_with(cause);
		doc.halting.cancel();
		doc.halted.cancel();
	}
}
