//! Resurrection inside the shutdown-delay window.

use std::time::Duration;

use super::{Harness, ctx, settle};

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn rejoin_within_window_reuses_instance() {
	let h = Harness::new(Duration::from_millis(50), Duration::ZERO);
	let c1 = ctx();
	let first = h.holder.acquire(&c1, "bar".to_string()).await.unwrap();
	let serial = first.instance().serial;

	c1.cancel();
	settle().await;
	tokio::time::advance(Duration::from_millis(10)).await;
	settle().await;
	assert_eq!(h.destroyed(), 0);

	// Rejoining inside the grace window aborts the pending destroy.
	let c2 = ctx();
	let second = h.holder.acquire(&c2, "bar".to_string()).await.unwrap();
	assert_eq!(second.instance().serial, serial);
	assert_eq!(h.built(), 1);

	// Even long after the original deadline, nothing is destroyed.
	tokio::time::advance(Duration::from_millis(200)).await;
	settle().await;
	assert_eq!(h.destroyed(), 0);

	// A full window after the last cancel tears the instance down once.
	c2.cancel();
	settle().await;
	tokio::time::advance(Duration::from_millis(50)).await;
	settle().await;
	assert_eq!(h.destroyed(), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn halt_rounds_repeat_across_resurrections() {
	let h = Harness::new(Duration::from_millis(50), Duration::ZERO);
	for round in 0..3 {
		let c = ctx();
		let doc = h.holder.acquire(&c, "bar".to_string()).await.unwrap();
		assert_eq!(doc.instance().serial, 0, "round {round} reuses the build");
		c.cancel();
		settle().await;
		tokio::time::advance(Duration::from_millis(10)).await;
		settle().await;
		// Resurrect before the window expires.
		assert_eq!(h.destroyed(), 0);
	}
	assert_eq!(h.built(), 1);

	// Let the final window lapse.
	tokio::time::advance(Duration::from_millis(60)).await;
	settle().await;
	assert_eq!(h.destroyed(), 1);
}
