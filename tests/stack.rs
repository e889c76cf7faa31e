//! Stack behavior: LIFO ordering, empty pops, and a producer/consumer mix
//! running under the local-write epoch manager.

use lowtide::{AtomicStack, LocalWriteEm, Node, Reclaim};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

#[test]
fn lifo_single_thread() {
    let stack = AtomicStack::new();

    stack.push(1u64);
    stack.push(2);
    stack.push(3);

    for expected in [3u64, 2, 1] {
        let node = stack.pop().expect("stack should not be empty");
        assert_eq!(*unsafe { node.as_ref() }.value(), expected);
        // Single-threaded: no concurrent popper can hold the node, so it is
        // safe to destroy it directly instead of retiring it.
        unsafe { Reclaim::reclaim(node.as_ptr()) };
    }

    assert!(stack.pop().is_none());
    assert!(stack.is_empty());
}

#[test]
fn pop_on_empty_returns_none() {
    let stack: AtomicStack<u64> = AtomicStack::new();
    assert!(stack.pop().is_none());
    assert!(stack.pop().is_none());
}

#[test]
fn hundred_pushes_pop_in_reverse() {
    let stack = AtomicStack::new();
    for i in 0..100u64 {
        stack.push(i);
    }
    for expected in (0..100u64).rev() {
        let node = stack.pop().expect("100 nodes were pushed");
        assert_eq!(*unsafe { node.as_ref() }.value(), expected);
        unsafe { Reclaim::reclaim(node.as_ptr()) };
    }
    assert!(stack.pop().is_none());
}

#[test]
fn drop_drains_linked_nodes() {
    let stack = AtomicStack::new();
    for i in 0..50u64 {
        stack.push(i);
    }
    // Nodes still linked are owned and freed by the stack itself.
    drop(stack);
}

#[test]
fn random_mix_under_local_em() {
    use rand::Rng;

    const THREADS: usize = 8;
    const OPS: usize = 5_000;

    let em: Arc<LocalWriteEm<Node<u64>>> = Arc::new(LocalWriteEm::new(THREADS));
    em.set_collect_interval(std::time::Duration::from_millis(1));
    em.clone().start_collector().unwrap();

    let stack = Arc::new(AtomicStack::new());
    let pushes = Arc::new(AtomicU64::new(0));
    let pops = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::new();
    for tid in 0..THREADS {
        let em = em.clone();
        let stack = stack.clone();
        let pushes = pushes.clone();
        let pops = pops.clone();
        handles.push(thread::spawn(move || {
            let mut rng = rand::rng();
            for i in 0..OPS {
                em.announce(tid);
                if rng.random_range(0..10) < 6 {
                    stack.push((tid * OPS + i) as u64);
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
    assert!(stack.is_empty());
}

#[test]
fn producer_consumer_bag_sum() {
    const PRODUCERS: usize = 16;
    const CONSUMERS: usize = 16;
    const PER_PRODUCER: u64 = 12_500;
    const TOTAL: u64 = PRODUCERS as u64 * PER_PRODUCER;

    let em: Arc<LocalWriteEm<Node<u64>>> =
        Arc::new(LocalWriteEm::new(PRODUCERS + CONSUMERS));
    em.set_collect_interval(std::time::Duration::from_millis(1));
    em.clone().start_collector().unwrap();

    let stack = Arc::new(AtomicStack::new());
    let consumed = Arc::new(AtomicU64::new(0));
    let sum = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::new();

    for tid in 0..PRODUCERS {
        let em = em.clone();
        let stack = stack.clone();
        handles.push(thread::spawn(move || {
            let base = tid as u64 * PER_PRODUCER;
            for value in base..base + PER_PRODUCER {
                em.announce(tid);
                stack.push(value);
            }
        }));
    }

    for cid in 0..CONSUMERS {
        let em = em.clone();
        let stack = stack.clone();
        let consumed = consumed.clone();
        let sum = sum.clone();
        let core = PRODUCERS + cid;
        handles.push(thread::spawn(move || {
            let mut local_sum = 0u64;
            loop {
                if consumed.load(Ordering::Acquire) >= TOTAL {
                    break;
                }
                em.announce(core);
                match stack.pop() {
                    Some(node) => {
                        local_sum += *unsafe { node.as_ref() }.value();
                        unsafe { em.retire(node.as_ptr()).unwrap() };
                        consumed.fetch_add(1, Ordering::AcqRel);
                    }
                    None => thread::yield_now(),
                }
            }
            sum.fetch_add(local_sum, Ordering::AcqRel);
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(consumed.load(Ordering::Acquire), TOTAL);
    assert_eq!(sum.load(Ordering::Acquire), TOTAL * (TOTAL - 1) / 2);
    assert!(stack.is_empty());

    let retired = em.nodes_retired();
    assert_eq!(retired, TOTAL);
    drop(stack);
    drop(em);
}
