//! Black-box coverage of `dispatch::QueueDispatcher`'s public API: the
//! instantaneous counters a congestion policy is built on, and the FIFO
//! ordering a single worker thread guarantees.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use h2flow::{QueueDispatcher, StreamIf};

fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Logs the `(busy, size)` snapshot it's called with, then blocks until its
/// gate channel receives a signal — letting the test fully control when
/// each item finishes relative to when the next ones are enqueued.
struct GatedItem {
    log: Arc<Mutex<Vec<(usize, usize)>>>,
    gate: mpsc::Receiver<()>,
}

impl StreamIf for GatedItem {
    fn process(self: Box<Self>, busy: usize, size: usize) {
        self.log.lock().unwrap().push((busy, size));
        let _ = self.gate.recv();
    }
}

/// With a single fixed worker thread and `queue_max_size = 0` semantics
/// layered on top by a congestion policy, the `(busy, size)` snapshot a
/// middle-of-backlog item observes is the one that would be flagged
/// congested; the first and last items in a drained burst are not, because
/// `size` reflects the backlog *remaining after* this item was popped.
#[test]
fn congestion_signal_reflects_post_pop_backlog() {
    let dispatcher = QueueDispatcher::new("congestion-signal", 1, 0);
    let log = Arc::new(Mutex::new(Vec::new()));
    let (tx1, rx1) = mpsc::channel();
    let (tx2, rx2) = mpsc::channel();
    let (tx3, rx3) = mpsc::channel();

    dispatcher.dispatch(Box::new(GatedItem { log: log.clone(), gate: rx1 }));
    assert!(wait_until(|| log.lock().unwrap().len() == 1, Duration::from_secs(1)));

    dispatcher.dispatch(Box::new(GatedItem { log: log.clone(), gate: rx2 }));
    dispatcher.dispatch(Box::new(GatedItem { log: log.clone(), gate: rx3 }));
    assert!(wait_until(|| dispatcher.size() == 2, Duration::from_secs(1)));

    tx1.send(()).unwrap();
    assert!(wait_until(|| log.lock().unwrap().len() == 2, Duration::from_secs(1)));

    tx2.send(()).unwrap();
    assert!(wait_until(|| log.lock().unwrap().len() == 3, Duration::from_secs(1)));

    tx3.send(()).unwrap();

    let snapshots = log.lock().unwrap().clone();
    assert_eq!(snapshots, vec![(1, 0), (1, 1), (1, 0)]);
    // busy == threads() == 1 throughout; only the middle item saw a
    // nonzero backlog, which is exactly the one a `queue_max_size = 0`
    // congestion policy would refuse.
    assert_eq!(dispatcher.threads(), 1);
}

struct OrderItem {
    id: usize,
    order: Arc<Mutex<Vec<usize>>>,
}

impl StreamIf for OrderItem {
    fn process(self: Box<Self>, _busy: usize, _size: usize) {
        self.order.lock().unwrap().push(self.id);
    }
}

/// Property 7: with a single worker thread, items complete in the order
/// they were dispatched (absent any delay).
#[test]
fn single_worker_processes_in_fifo_order() {
    let dispatcher = QueueDispatcher::new("fifo", 1, 0);
    let order = Arc::new(Mutex::new(Vec::new()));
    for id in 0..20 {
        dispatcher.dispatch(Box::new(OrderItem { id, order: order.clone() }));
    }
    assert!(wait_until(|| order.lock().unwrap().len() == 20, Duration::from_secs(1)));
    assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
}

struct SleepItem {
    delay: Duration,
    counter: Arc<std::sync::atomic::AtomicUsize>,
}

impl StreamIf for SleepItem {
    fn process(self: Box<Self>, _busy: usize, _size: usize) {
        thread::sleep(self.delay);
        self.counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

/// A pool with `max_threads == base_threads` never grows beyond its fixed
/// size, even when every dispatched item would otherwise saturate it.
#[test]
fn fixed_size_pool_does_not_grow() {
    let dispatcher = QueueDispatcher::new("fixed", 2, 0);
    let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    for _ in 0..6 {
        dispatcher.dispatch(Box::new(SleepItem {
            delay: Duration::from_millis(30),
            counter: counter.clone(),
        }));
    }
    thread::sleep(Duration::from_millis(20));
    assert_eq!(dispatcher.threads(), 2);
    assert!(wait_until(
        || counter.load(std::sync::atomic::Ordering::SeqCst) == 6,
        Duration::from_secs(1)
    ));
}

/// A pool with `max_threads > base_threads` grows up to (but never past)
/// the ceiling as dispatched work saturates the currently running threads.
#[test]
fn elastic_pool_grows_up_to_but_not_past_ceiling() {
    let dispatcher = QueueDispatcher::new("elastic", 1, 3);
    assert_eq!(dispatcher.threads(), 1);

    let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    for _ in 0..10 {
        dispatcher.dispatch(Box::new(SleepItem {
            delay: Duration::from_millis(40),
            counter: counter.clone(),
        }));
    }

    assert!(wait_until(|| dispatcher.threads() == 3, Duration::from_secs(1)));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(dispatcher.threads(), 3, "pool must not grow past max_threads");

    assert!(wait_until(
        || counter.load(std::sync::atomic::Ordering::SeqCst) == 10,
        Duration::from_secs(2)
    ));
}
