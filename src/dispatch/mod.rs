//! A bounded-elasticity worker pool with a FIFO of dispatched work items.
//!
//! This is the one piece of the framework that is deliberately *not*
//! `tokio`-shaped: a classic condvar-guarded thread pool where
//! `receive`/`receive_error` user code is free to block, while the protocol
//! I/O threads must never be blocked on it. A fixed or growable count of OS
//! threads, not async tasks, is what gives user code that freedom.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// The contract a dispatched work item must satisfy. A [`crate::server::stream::Stream`]
/// is the only production implementor, but keeping the trait abstract lets
/// the dispatcher be exercised without spinning up a real HTTP/2 connection.
pub trait StreamIf: Send + 'static {
    /// Run the item's work. Called with the `(busy, size)` snapshot observed
    /// by the worker just before it released the dispatcher's lock, so the
    /// item can shape its own congestion response (see congestion
    /// policy).
    fn process(self: Box<Self>, busy_consumers: usize, queue_size: usize);
}

struct Shared {
    queue: VecDeque<Box<dyn StreamIf>>,
    quit: bool,
    busy: usize,
    threads: usize,
}

/// A named, bounded-elasticity worker pool.
///
/// `threads()` starts fixed at the base count; `dispatch` grows it up to
/// `max_threads` (inclusive) on demand, one thread at a time, whenever every
/// existing thread is busy. A `max_threads` equal to the base count pins the
/// pool at a fixed size.
pub struct QueueDispatcher {
    name: String,
    state: Arc<Mutex<Shared>>,
    cv: Arc<Condvar>,
    max_threads: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueDispatcher {
    /// Create a pool named `name` with `base_threads` worker threads started
    /// eagerly. `max_threads = 0` is shorthand for "fixed at `base_threads`".
    pub fn new(name: impl Into<String>, base_threads: usize, max_threads: usize) -> Self {
        let name = name.into();
        let max_threads = if max_threads == 0 {
            base_threads
        } else {
            max_threads.max(base_threads)
        };

        let state = Arc::new(Mutex::new(Shared {
            queue: VecDeque::new(),
            quit: false,
            busy: 0,
            threads: 0,
        }));
        let cv = Arc::new(Condvar::new());

        tracing::info!(
            name = %name,
            base_threads,
            max_threads,
            "creating dispatch queue"
        );

        let dispatcher = QueueDispatcher {
            name,
            state,
            cv,
            max_threads,
            handles: Mutex::new(Vec::new()),
        };

        for _ in 0..base_threads {
            dispatcher.spawn_worker();
        }

        dispatcher
    }

    fn spawn_worker(&self) {
        let state = self.state.clone();
        let cv = self.cv.clone();
        let name = self.name.clone();

        {
            let mut s = state.lock().unwrap();
            s.threads += 1;
        }

        let handle = std::thread::Builder::new()
            .name(format!("{name}-worker"))
            .spawn(move || worker_loop(state, cv))
            .expect("failed to spawn dispatcher worker thread");

        self.handles.lock().unwrap().push(handle);
    }

    /// Enqueue an item. Wakes one waiting worker; if every thread started so
    /// far is busy and the pool hasn't reached `max_threads`, spawns one
    /// more thread first.
    pub fn dispatch(&self, item: Box<dyn StreamIf>) {
        let should_grow = {
            let s = self.state.lock().unwrap();
            s.busy == s.threads && s.threads < self.max_threads
        };
        if should_grow {
            self.spawn_worker();
        }

        let mut s = self.state.lock().unwrap();
        s.queue.push_back(item);
        drop(s);
        self.cv.notify_one();
    }

    /// Number of workers currently inside `process()`.
    pub fn busy_threads(&self) -> usize {
        self.state.lock().unwrap().busy
    }

    /// Number of worker threads started so far (`base_threads..=max_threads`).
    pub fn threads(&self) -> usize {
        self.state.lock().unwrap().threads
    }

    /// Number of items waiting in the queue (not counting the one, if any,
    /// currently being processed).
    pub fn size(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for QueueDispatcher {
    fn drop(&mut self) {
        {
            let mut s = self.state.lock().unwrap();
            s.quit = true;
        }
        self.cv.notify_all();

        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(state: Arc<Mutex<Shared>>, cv: Arc<Condvar>) {
    loop {
        let mut guard = state.lock().unwrap();
        guard = cv
            .wait_while(guard, |s| s.queue.is_empty() && !s.quit)
            .unwrap();

        if guard.quit && guard.queue.is_empty() {
            return;
        }

        let item = match guard.queue.pop_front() {
            Some(item) => item,
            None => continue,
        };
        guard.busy += 1;
        let (busy, size) = (guard.busy, guard.queue.len());
        drop(guard);

        item.process(busy, size);

        let mut guard = state.lock().unwrap();
        guard.busy -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingItem {
        counter: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl StreamIf for CountingItem {
        fn process(self: Box<Self>, _busy: usize, _size: usize) {
            std::thread::sleep(self.delay);
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn fixed_pool_runs_all_items() {
        let dispatcher = QueueDispatcher::new("test", 2, 0);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            dispatcher.dispatch(Box::new(CountingItem {
                counter: counter.clone(),
                delay: Duration::from_millis(1),
            }));
        }
        // give workers a chance to drain
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn grows_up_to_max_when_saturated() {
        let dispatcher = QueueDispatcher::new("grow", 1, 4);
        assert_eq!(dispatcher.threads(), 1);

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            dispatcher.dispatch(Box::new(CountingItem {
                counter: counter.clone(),
                delay: Duration::from_millis(50),
            }));
        }
        std::thread::sleep(Duration::from_millis(20));
        assert!(dispatcher.threads() > 1);
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn fixed_pool_never_exceeds_base_threads() {
        let dispatcher = QueueDispatcher::new("fixed", 1, 0);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            dispatcher.dispatch(Box::new(CountingItem {
                counter: counter.clone(),
                delay: Duration::from_millis(20),
            }));
        }
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(dispatcher.threads(), 1);
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
