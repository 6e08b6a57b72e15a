//! Joined-lifetime group with a halt/resume teardown protocol.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::ctx::{Cause, Ctx};

type BoxFut = Pin<Box<dyn Future<Output = Result<(), Cause>> + Send>>;
type HaltFn = Arc<dyn Fn(Ctx, Resume) -> BoxFut + Send + Sync>;

/// Signal observed by halt functions when the group is revived.
///
/// Fired when a new parent joins while the group is halting; the round's
/// halt functions should abandon teardown and return.
#[derive(Clone)]
pub struct Resume {
	token: CancellationToken,
}

impl Resume {
	/// Resolves if the group is revived during this halt round.
	pub async fn fired(&self) {
		self.token.cancelled().await;
	}

	#[must_use]
	pub fn is_fired(&self) -> bool {
		self.token.is_cancelled()
	}
}

/// Joins N parent lifetimes into one derived lifetime.
///
/// The derived [`Ctx`] lives while at least one added parent does. When
/// the active count drops to zero (after [`CGroup::start`]), every
/// registered halt function runs with a shared [`Resume`] signal; a
/// parent added before they all return revives the group, otherwise the
/// derived ctx is cancelled with the configured cause. Halt functions
/// may therefore run multiple times across the group's lifetime.
#[derive(Clone)]
pub struct CGroup {
	shared: Arc<Shared>,
}

struct Shared {
	state: Mutex<State>,
	cause: Option<Cause>,
}

struct State {
	active: usize,
	started: bool,
	done: bool,
	halting: bool,
	derived: Option<Ctx>,
	pending: Vec<BoxFut>,
	halts: Vec<HaltFn>,
	/// Resume signal of the in-flight halt round.
	resume: Option<CancellationToken>,
	round: u64,
}

impl Default for CGroup {
	fn default() -> Self {
		Self::new()
	}
}

impl CGroup {
	/// Group whose final cancellation carries no cause.
	#[must_use]
	pub fn new() -> Self {
		Self::with_cause(None)
	}

	/// Group whose final cancellation carries `cause`.
	#[must_use]
	pub fn with_cause(cause: Option<Cause>) -> Self {
		Self {
			shared: Arc::new(Shared {
				state: Mutex::new(State {
					active: 0,
					started: false,
					done: false,
					halting: false,
					derived: None,
					pending: Vec::new(),
					halts: Vec::new(),
					resume: None,
					round: 0,
				}),
				cause,
			}),
		}
	}

	/// Join a live parent lifetime; false if the group is already done
	/// or the parent is already cancelled.
	///
	/// Joining during a halt round fires its resume signal and returns
	/// the group to the running state.
	pub fn add(&self, parent: &Ctx) -> bool {
		{
			let mut st = self.shared.state.lock().unwrap();
			if st.done || parent.is_cancelled() {
				return false;
			}
			st.active += 1;
			if st.halting {
				st.halting = false;
				if let Some(resume) = st.resume.take() {
					resume.cancel();
				}
				tracing::debug!(round = st.round, "context group resumed");
			}
		}
		let shared = Arc::clone(&self.shared);
		let parent = parent.clone();
		tokio::spawn(async move {
			parent.cancelled().await;
			Shared::parent_done(&shared);
		});
		true
	}

	/// Create the derived context (first call) and run buffered tasks.
	pub fn start(&self) -> Ctx {
		let (derived, pending) = {
			let mut st = self.shared.state.lock().unwrap();
			let derived = st.derived.get_or_insert_with(Ctx::new).clone();
			let first = !st.started;
			st.started = true;
			let pending = std::mem::take(&mut st.pending);
			if first && st.active == 0 && !st.done && !st.halting {
				Shared::begin_halt(&self.shared, &mut st);
			}
			(derived, pending)
		};
		for fut in pending {
			self.spawn_task(fut);
		}
		derived
	}

	/// Run `task` under the group: buffered before [`CGroup::start`],
	/// spawned immediately after, ignored once the group is done.
	///
	/// A task error cancels the derived context with that cause.
	pub fn go<F>(&self, task: F)
	where
		F: Future<Output = Result<(), Cause>> + Send + 'static,
	{
		{
			let mut st = self.shared.state.lock().unwrap();
			if st.done {
				return;
			}
			if !st.started {
				st.pending.push(Box::pin(task));
				return;
			}
		}
		self.spawn_task(Box::pin(task));
	}

	/// Register a halt function invoked on every zero-active round.
	pub fn halt<F, Fut>(&self, f: F)
	where
		F: Fn(Ctx, Resume) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<(), Cause>> + Send + 'static,
	{
		let f: HaltFn = Arc::new(move |ctx, resume| Box::pin(f(ctx, resume)));
		self.shared.state.lock().unwrap().halts.push(f);
	}

	/// Final cause once the group halts (None for normal cancellation).
	///
	/// Must not be called before [`CGroup::start`].
	pub async fn wait(&self) -> Option<Cause> {
		let derived = {
			let st = self.shared.state.lock().unwrap();
			st.derived.clone().expect("wait on unstarted context group")
		};
		derived.cancelled().await;
		derived.cause()
	}

	fn spawn_task(&self, fut: BoxFut) {
		let shared = Arc::clone(&self.shared);
		tokio::spawn(async move {
			if let Err(cause) = fut.await {
				Shared::fail(&shared, cause);
			}
		});
	}
}

impl Shared {
	fn parent_done(shared: &Arc<Self>) {
		let mut st = shared.state.lock().unwrap();
		assert!(st.active > 0, "context group active count underflow");
		st.active -= 1;
		if st.active == 0 && st.started && !st.done && !st.halting {
			Self::begin_halt(shared, &mut st);
		}
	}

	/// Starts a halt round. Caller holds the state lock.
	fn begin_halt(shared: &Arc<Self>, st: &mut State) {
		st.halting = true;
		st.round += 1;
		let round = st.round;
		let resume = CancellationToken::new();
		st.resume = Some(resume.clone());
		let halts = st.halts.clone();
		let derived = st.derived.clone().expect("halting unstarted group");
		let shared = Arc::clone(shared);
		tokio::spawn(async move {
			tracing::debug!(round, halts = halts.len(), "halt round started");
			let mut tasks = Vec::with_capacity(halts.len());
			for f in &halts {
				let fut = f(
					derived.clone(),
					Resume {
						token: resume.clone(),
					},
				);
				tasks.push(tokio::spawn(fut));
			}
			let mut first_err = None;
			for task in tasks {
				match task.await {
					Ok(Ok(())) => {}
					Ok(Err(cause)) => {
						let _ = first_err.get_or_insert(cause);
					}
					Err(join) if join.is_panic() => {
						std::panic::resume_unwind(join.into_panic())
					}
					Err(_) => {}
				}
			}
			Self::finish_halt(&shared, round, &resume, first_err);
		});
	}

	fn finish_halt(
		shared: &Arc<Self>,
		round: u64,
		resume: &CancellationToken,
		first_err: Option<Cause>,
	) {
		if let Some(cause) = first_err {
			// A failing halt function is fatal even when resumed.
			Self::fail(shared, cause);
			return;
		}
		let derived = {
			let mut st = shared.state.lock().unwrap();
			if resume.is_cancelled() || st.round != round || st.active > 0 || st.done {
				return;
			}
			st.done = true;
			st.halting = false;
			st.derived.clone()
		};
		tracing::debug!(round, "context group halted");
		if let Some(derived) = derived {
			match shared.cause.clone() {
				Some(cause) => derived.cancel_with(cause),
				None => derived.cancel(),
			}
		}
	}

	fn fail(shared: &Arc<Self>, cause: Cause) {
		let derived = {
			let mut st = shared.state.lock().unwrap();
			st.done = true;
			st.halting = false;
			st.derived.clone()
		};
		tracing::warn!(%cause, "context group failed");
		if let Some(derived) = derived {
			derived.cancel_with(cause);
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	use super::*;
	use crate::ctx::{Error, cause};

	async fn settle() {
		// Let watcher and halt tasks run on the current-thread runtime.
		for _ in 0..8 {
			tokio::task::yield_now().await;
		}
	}

	#[tokio::test(flavor = "current_thread")]
	async fn derived_lives_while_a_parent_does() {
		let group = CGroup::new();
		let a = Ctx::new();
		let b = Ctx::new();
		assert!(group.add(&a));
		assert!(group.add(&b));
		let derived = group.start();
		a.cancel();
		settle().await;
		assert!(!derived.is_cancelled());
		b.cancel();
		settle().await;
		assert!(derived.is_cancelled());
		assert!(derived.cause().is_none());
	}

	#[tokio::test(flavor = "current_thread")]
	async fn add_during_halt_round_resumes() {
		let group = CGroup::new();
		let rounds = Arc::new(AtomicUsize::new(0));
		{
			let rounds = Arc::clone(&rounds);
			group.halt(move |_ctx, resume| {
				let rounds = Arc::clone(&rounds);
				async move {
					rounds.fetch_add(1, Ordering::SeqCst);
					// Block teardown until resumed or a long sleep.
					tokio::select! {
						() = resume.fired() => {}
						() = tokio::time::sleep(Duration::from_secs(60)) => {}
					}
					Ok(())
				}
			});
		}
		let a = Ctx::new();
		group.add(&a);
		let derived = group.start();
		a.cancel();
		settle().await;
		assert_eq!(rounds.load(Ordering::SeqCst), 1);

		// New parent arrives while the halt round is blocked.
		let b = Ctx::new();
		assert!(group.add(&b));
		settle().await;
		assert!(!derived.is_cancelled(), "resume must revive the group");

		// Dropping the new parent triggers a second round.
		b.cancel();
		settle().await;
		assert_eq!(rounds.load(Ordering::SeqCst), 2);
	}

	#[tokio::test(flavor = "current_thread")]
	async fn halt_error_becomes_final_cause() {
		let group = CGroup::new();
		group.halt(|_ctx, _resume| async { Err(cause(Error::Shutdown)) });
		let a = Ctx::new();
		group.add(&a);
		group.start();
		a.cancel();
		settle().await;
		let final_cause = group.wait().await;
		assert_eq!(final_cause.unwrap().to_string(), "shutdown");
	}

	#[tokio::test(flavor = "current_thread")]
	async fn task_error_cancels_derived() {
		let group = CGroup::new();
		let a = Ctx::new();
		group.add(&a);
		group.go(async { Err(cause(Error::Shutdown)) });
		let derived = group.start();
		settle().await;
		assert!(derived.is_cancelled());
		assert_eq!(derived.cause().unwrap().to_string(), "shutdown");
	}

	#[tokio::test(flavor = "current_thread")]
	async fn buffered_tasks_run_on_start() {
		let group = CGroup::new();
		let ran = Arc::new(AtomicUsize::new(0));
		{
			let ran = Arc::clone(&ran);
			group.go(async move {
				ran.fetch_add(1, Ordering::SeqCst);
				Ok(())
			});
		}
		assert_eq!(ran.load(Ordering::SeqCst), 0);
		let a = Ctx::new();
		group.add(&a);
		group.start();
		settle().await;
		assert_eq!(ran.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(flavor = "current_thread")]
	async fn add_after_done_is_rejected() {
		let group = CGroup::new();
		let a = Ctx::new();
		group.add(&a);
		group.start();
		a.cancel();
		settle().await;
		let b = Ctx::new();
		assert!(!group.add(&b));
	}

	#[tokio::test(flavor = "current_thread")]
	async fn configured_cause_is_delivered() {
		let group = CGroup::with_cause(Some(cause(Error::Shutdown)));
		let a = Ctx::new();
		group.add(&a);
		group.start();
		a.cancel();
		settle().await;
		assert_eq!(group.wait().await.unwrap().to_string(), "shutdown");
	}
}
