//! # Blocking Queue - Dual-Limit Thread-Safe FIFO
//!
//! The one channel every pipeline stage talks through:
//! - Packet pipe between the demux loop and each decode loop
//! - Result channel between a worker thread and whoever owns its handle
//!
//! Two independent thresholds control blocking:
//!
//! ```text
//!            producer limit                  consumer limit
//!   enqueue ──► blocks while len >= P ──► ... ──► dequeue blocks while len < C
//!               (P == 0: never blocks)            (C == 0: never blocks)
//! ```
//!
//! Forcing the consumer limit to zero releases every waiter, which is how
//! stages are shut down.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

// ============================================================================
// Queue State
// ============================================================================

struct QueueState<T> {
    items: VecDeque<T>,
    /// Enqueue blocks while `items.len() >= producer_limit` (0 = unlimited)
    producer_limit: usize,
    /// Dequeue blocks while `items.len() < consumer_limit`
    consumer_limit: usize,
}

impl<T> QueueState<T> {
    fn has_room(&self) -> bool {
        self.producer_limit == 0 || self.items.len() < self.producer_limit
    }

    fn is_ready(&self) -> bool {
        self.items.len() >= self.consumer_limit
    }
}

// ============================================================================
// Blocking Queue
// ============================================================================

/// Thread-safe FIFO with a producer-side and a consumer-side blocking limit
pub struct BlockingQueue<T> {
    state: Mutex<QueueState<T>>,

    /// Signalled when room frees up or the queue drains
    space_cond: Condvar,

    /// Signalled when items arrive
    ready_cond: Condvar,
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockingQueue<T> {
    /// Unlimited producer side, consumers wait for one item
    pub fn new() -> Self {
        Self::with_limits(0, 1)
    }

    pub fn with_limits(producer_limit: usize, consumer_limit: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                producer_limit,
                consumer_limit,
            }),
            space_cond: Condvar::new(),
            ready_cond: Condvar::new(),
        }
    }

    // ========================================================================
    // Producer API
    // ========================================================================

    /// Append a value, blocking while the producer limit is reached
    pub fn enqueue(&self, value: T) {
        let mut state = self.state.lock();
        while !state.has_room() {
            self.space_cond.wait(&mut state);
        }
        state.items.push_back(value);
        drop(state);
        self.ready_cond.notify_one();
    }

    // ========================================================================
    // Consumer API
    // ========================================================================

    /// Remove the head once the consumer limit is satisfied.
    ///
    /// Returns `None` only when woken by a forced consumer limit of zero
    /// while the queue is empty.
    pub fn dequeue_blocking(&self) -> Option<T> {
        let mut state = self.state.lock();
        while !state.is_ready() {
            self.ready_cond.wait(&mut state);
        }
        let value = state.items.pop_front();
        drop(state);
        if value.is_some() {
            self.space_cond.notify_all();
        }
        value
    }

    /// Clone the head once the consumer limit is satisfied, leaving it queued
    pub fn head_blocking(&self) -> Option<T>
    where
        T: Clone,
    {
        let mut state = self.state.lock();
        while !state.is_ready() {
            self.ready_cond.wait(&mut state);
        }
        state.items.front().cloned()
    }

    /// Remove the head without waiting
    pub fn pop_front(&self) -> Option<T> {
        let value = self.state.lock().items.pop_front();
        if value.is_some() {
            self.space_cond.notify_all();
        }
        value
    }

    /// Non-blocking dequeue, ignores the consumer limit
    pub fn try_dequeue(&self) -> Option<T> {
        self.pop_front()
    }

    /// Take everything currently queued
    pub fn drain(&self) -> Vec<T> {
        let items: Vec<T> = self.state.lock().items.drain(..).collect();
        if !items.is_empty() {
            self.space_cond.notify_all();
        }
        items
    }

    /// Drop everything currently queued and wake blocked producers
    pub fn clear(&self) {
        self.state.lock().items.clear();
        self.space_cond.notify_all();
    }

    /// Block until the queue is empty or the consumer limit is forced to zero
    pub fn wait_for_empty(&self) {
        let mut state = self.state.lock();
        while !state.items.is_empty() && state.consumer_limit != 0 {
            self.space_cond.wait(&mut state);
        }
    }

    // ========================================================================
    // Limits
    // ========================================================================

    pub fn producer_limit(&self) -> usize {
        self.state.lock().producer_limit
    }

    pub fn consumer_limit(&self) -> usize {
        self.state.lock().consumer_limit
    }

    /// Change the producer limit and re-evaluate every waiter
    pub fn set_producer_limit(&self, limit: usize) {
        self.state.lock().producer_limit = limit;
        self.wake_all();
    }

    /// Change the consumer limit and re-evaluate every waiter.
    ///
    /// Zero releases all blocked consumers and `wait_for_empty` callers.
    pub fn set_consumer_limit(&self, limit: usize) {
        self.state.lock().consumer_limit = limit;
        self.wake_all();
    }

    fn wake_all(&self) {
        self.space_cond.notify_all();
        self.ready_cond.notify_all();
    }

    // ========================================================================
    // Inspection (advisory)
    // ========================================================================

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_queue_ordering() {
        let queue = BlockingQueue::new();
        for i in 0..5 {
            queue.enqueue(i);
        }

        let drained: Vec<i32> = (0..5).filter_map(|_| queue.dequeue_blocking()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_ordering_across_threads() {
        let queue = Arc::new(BlockingQueue::with_limits(4, 1));
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..100u32 {
                    queue.enqueue(i);
                }
            })
        };

        let mut received = Vec::new();
        while received.len() < 100 {
            if let Some(v) = queue.dequeue_blocking() {
                received.push(v);
            }
        }
        producer.join().unwrap();
        assert_eq!(received, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_producer_limit_backpressure() {
        let queue = Arc::new(BlockingQueue::with_limits(2, 1));
        queue.enqueue(1);
        queue.enqueue(2);

        let done = Arc::new(AtomicBool::new(false));
        let producer = {
            let queue = queue.clone();
            let done = done.clone();
            thread::spawn(move || {
                queue.enqueue(3);
                done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst), "third enqueue must block");

        assert_eq!(queue.dequeue_blocking(), Some(1));
        producer.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_forced_wake_returns_none() {
        let queue: Arc<BlockingQueue<u32>> = Arc::new(BlockingQueue::new());
        let (tx, rx) = mpsc::channel();
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || {
                let _ = tx.send(queue.dequeue_blocking());
            })
        };

        thread::sleep(Duration::from_millis(20));
        let forced_at = Instant::now();
        queue.set_consumer_limit(0);

        let got = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert!(forced_at.elapsed() < Duration::from_millis(100));
        assert_eq!(got, None);
        consumer.join().unwrap();
    }

    #[test]
    fn test_consumer_limit_batches() {
        let queue = Arc::new(BlockingQueue::with_limits(0, 3));
        let (tx, rx) = mpsc::channel();
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || {
                let _ = tx.send(queue.dequeue_blocking());
            })
        };

        queue.enqueue('a');
        queue.enqueue('b');
        assert!(rx.recv_timeout(Duration::from_millis(30)).is_err());

        queue.enqueue('c');
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Some('a'));
        consumer.join().unwrap();
    }

    #[test]
    fn test_head_then_pop() {
        let queue = BlockingQueue::new();
        queue.enqueue("first".to_string());
        queue.enqueue("second".to_string());

        assert_eq!(queue.head_blocking().as_deref(), Some("first"));
        assert_eq!(queue.head_blocking().as_deref(), Some("first"));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop_front().as_deref(), Some("first"));
        assert_eq!(queue.head_blocking().as_deref(), Some("second"));
    }

    #[test]
    fn test_wait_for_empty() {
        let queue = Arc::new(BlockingQueue::new());
        queue.enqueue(1);
        queue.enqueue(2);

        let drainer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                while queue.pop_front().is_some() {}
            })
        };

        queue.wait_for_empty();
        assert!(queue.is_empty());
        drainer.join().unwrap();
    }

    #[test]
    fn test_wait_for_empty_released_by_close() {
        let queue = Arc::new(BlockingQueue::new());
        queue.enqueue(1);

        let closer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.set_consumer_limit(0);
            })
        };

        queue.wait_for_empty();
        assert_eq!(queue.len(), 1);
        closer.join().unwrap();
    }

    #[test]
    fn test_clear_releases_producer() {
        let queue = Arc::new(BlockingQueue::with_limits(1, 1));
        queue.enqueue(0);

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.enqueue(1))
        };

        thread::sleep(Duration::from_millis(20));
        queue.clear();
        producer.join().unwrap();
        assert_eq!(queue.drain(), vec![1]);
    }
}
