//! Local-write epoch manager: announce/collect interplay, the min-epoch
//! bound, head retention, lifecycle, and the background collector.

use lowtide::{AtomicStack, Error, LocalWriteEm, Node, Reclaim};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Payload that counts its own destruction.
struct Tally(Arc<AtomicUsize>);

impl Drop for Tally {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }
}

unsafe impl Reclaim for Tally {}

#[test]
fn fresh_manager_starts_at_epoch_zero() {
    let em = LocalWriteEm::<Tally>::new(4);
    assert_eq!(em.core_num(), 4);
    assert_eq!(em.current_epoch(), 0);
    assert_eq!(em.safe_epoch(), 0);
    em.signal_exit();
}

#[test]
fn collect_waits_for_reannouncement() {
    let em = LocalWriteEm::<Tally>::new(1);
    let drops = Arc::new(AtomicUsize::new(0));

    em.announce(0);
    for _ in 0..10 {
        let payload = Box::into_raw(Box::new(Tally(drops.clone())));
        unsafe { em.retire(payload).unwrap() };
    }

    // The worker is still announced at epoch 0, so nothing may be freed
    // no matter how often the collector runs.
    for _ in 0..3 {
        em.tick();
    }
    assert_eq!(drops.load(Ordering::Acquire), 0);

    // Re-announcing moves the slot past the retirement epoch. The list head
    // is only reclaimed by the drain, so one entry survives the sweep.
    em.announce(0);
    em.tick();
    assert_eq!(drops.load(Ordering::Acquire), 9);
    assert_eq!(em.nodes_freed(), 9);

    drop(em);
    assert_eq!(drops.load(Ordering::Acquire), 10);
}

#[test]
fn single_core_reduces_to_single_epoch() {
    // core_num == 1: the one slot is the whole min computation.
    let em = LocalWriteEm::<Tally>::new(1);
    let drops = Arc::new(AtomicUsize::new(0));

    em.announce(0);
    let payload = Box::into_raw(Box::new(Tally(drops.clone())));
    unsafe { em.retire(payload).unwrap() };

    em.tick();
    em.announce(0);
    em.tick();

    // Sole entry is also the head; only the drain may free it.
    assert_eq!(drops.load(Ordering::Acquire), 0);
    drop(em);
    assert_eq!(drops.load(Ordering::Acquire), 1);
}

#[test]
fn stalled_announcer_pins_garbage() {
    const RETIRED: usize = 1_000;

    let em = LocalWriteEm::<Tally>::new(2);
    let drops = Arc::new(AtomicUsize::new(0));

    // Both workers announce at epoch 0, then the epoch moves on.
    em.announce(0);
    em.announce(1);
    em.tick();

    // Worker 1 keeps operating and retiring; worker 0 stalls at epoch 0.
    for _ in 0..RETIRED {
        em.announce(1);
        let payload = Box::into_raw(Box::new(Tally(drops.clone())));
        unsafe { em.retire(payload).unwrap() };
    }

    for _ in 0..10 {
        em.tick();
    }
    assert_eq!(
        drops.load(Ordering::Acquire),
        0,
        "stalled slot 0 must pin every retirement"
    );

    // The stalled worker wakes up; two ticks suffice to release everything
    // except the irreducible list head.
    em.announce(0);
    em.announce(1);
    em.tick();
    em.tick();
    assert_eq!(drops.load(Ordering::Acquire), RETIRED - 1);
    assert_eq!(em.nodes_freed(), (RETIRED - 1) as u64);

    drop(em);
    assert_eq!(drops.load(Ordering::Acquire), RETIRED);
}

#[test]
fn signal_exit_is_idempotent_and_rejects_retire() {
    let em = LocalWriteEm::<Tally>::new(1);
    assert!(!em.has_exited());

    em.signal_exit();
    em.signal_exit();
    assert!(em.has_exited());

    assert_eq!(unsafe { em.retire(std::ptr::null_mut()) }, Err(Error::Exited));
}

#[test]
fn collector_thread_frees_in_background() {
    let em = Arc::new(LocalWriteEm::<Tally>::new(1));
    em.set_collect_interval(Duration::from_millis(1));
    em.clone().start_collector().unwrap();
    assert_eq!(em.clone().start_collector(), Err(Error::CollectorRunning));

    let drops = Arc::new(AtomicUsize::new(0));
    em.announce(0);
    for _ in 0..20 {
        let payload = Box::into_raw(Box::new(Tally(drops.clone())));
        unsafe { em.retire(payload).unwrap() };
    }

    // Keep announcing so the slot follows the advancing epoch; all but the
    // list head must drain in the background.
    let deadline = Instant::now() + Duration::from_secs(5);
    while drops.load(Ordering::Acquire) < 19 {
        assert!(Instant::now() < deadline, "collector never caught up");
        em.announce(0);
        thread::sleep(Duration::from_millis(2));
    }

    drop(em);
    assert_eq!(drops.load(Ordering::Acquire), 20);
}

#[test]
fn stack_under_local_em_frees_every_pop() {
    const THREADS: usize = 8;
    const OPS: usize = 2_000;

    let em = Arc::new(LocalWriteEm::<Node<Tally>>::new(THREADS));
    em.set_collect_interval(Duration::from_millis(1));
    em.clone().start_collector().unwrap();

    let stack = Arc::new(AtomicStack::new());
    let drops = Arc::new(AtomicUsize::new(0));
    let pushes = Arc::new(AtomicUsize::new(0));
    let pops = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for tid in 0..THREADS {
        let em = em.clone();
        let stack = stack.clone();
        let drops = drops.clone();
        let pushes = pushes.clone();
        let pops = pops.clone();
        handles.push(thread::spawn(move || {
            for i in 0..OPS {
                em.announce(tid);
                if (tid + i) % 2 == 0 {
                    stack.push(Tally(drops.clone()));
                    pushes.fetch_add(1, Ordering::AcqRel);
                } else if let Some(node) = stack.pop() {
                    unsafe { em.retire(node.as_ptr()).unwrap() };
                    pops.fetch_add(1, Ordering::AcqRel);
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // Drain the survivors from the main thread through slot 0.
    loop {
        em.announce(0);
        match stack.pop() {
            Some(node) => {
                unsafe { em.retire(node.as_ptr()).unwrap() };
                pops.fetch_add(1, Ordering::AcqRel);
            }
            None => break,
        }
    }

    assert_eq!(pops.load(Ordering::Acquire), pushes.load(Ordering::Acquire));

    drop(stack);
    drop(em);
    assert_eq!(
        drops.load(Ordering::Acquire),
        pushes.load(Ordering::Acquire),
        "free count must equal the pop count"
    );
}
