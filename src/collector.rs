//! The background tick loop shared by both epoch managers.

use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::debug;

/// What the collector thread needs from a manager.
pub(crate) trait Collect: Send + Sync + 'static {
    /// One collection period, in whatever order the manager requires.
    fn tick(&self);
    /// Whether `signal_exit` has been observed.
    fn has_exited(&self) -> bool;
    /// Sleep duration between ticks.
    fn collect_interval(&self) -> Duration;
}

/// Spawns the tick loop for `em`.
///
/// The thread holds only a `Weak` reference and upgrades it once per
/// iteration, so it can never keep a dropped manager alive; the manager's
/// destructor joins the handle after signalling exit. The `Arc` is released
/// before sleeping, which keeps the destructor from waiting out a full
/// interval while the upgrade is live.
pub(crate) fn spawn<C: Collect>(em: Weak<C>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("lowtide-collector".into())
        .spawn(move || {
            loop {
                let interval = match em.upgrade() {
                    None => break,
                    Some(em) => {
                        if em.has_exited() {
                            break;
                        }
                        em.tick();
                        em.collect_interval()
                    }
                };
                thread::sleep(interval);
            }
            debug!("collector thread exited");
        })
        .expect("failed to spawn collector thread")
}
