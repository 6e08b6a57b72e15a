//! Concurrency primitives shared across the tether crates.
//!
//! - [`Ctx`]: a cancellation token that can be interrogated for its
//!   cause, derived in a parent/child tree.
//! - [`Promise`]: a single-assignment result cell with cancellable wait.
//! - [`Queue`]/[`Listener`]: a multi-listener broadcast FIFO.
//! - [`CGroup`]: joins N parent lifetimes into one derived lifetime with
//!   a halt/resume teardown protocol.

mod ctx;
mod group;
mod promise;
mod queue;

pub use ctx::{CancelFn, Cause, Ctx, Error, cause};
pub use group::{CGroup, Resume};
pub use promise::Promise;
pub use queue::{BatchIter, Iter, Listener, Queue};
