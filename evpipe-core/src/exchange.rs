//! Bounded handoff of sealed containers from the acquisition thread to the
//! consumer.
//!
//! The queue has a fixed capacity chosen at acquisition start. Blocking
//! operations sleep on a condition variable and are woken by the opposite
//! operation, instead of polling. A blocking push gives up once the supplied
//! running flag is cleared, and a blocking pop gives up once the queue has
//! been closed and emptied, so neither side can deadlock at shutdown.

use crate::container::EventContainer;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How long a blocked producer sleeps before re-checking its running flag.
const PUSH_RECHECK_INTERVAL: Duration = Duration::from_millis(1);

/// Notification callback, invoked without any queue lock held.
pub type Notify = Arc<dyn Fn() + Send + Sync>;

/// Occupancy-change notifications.
#[derive(Clone, Default)]
pub struct QueueNotify {
    /// Fired after every successful push.
    pub on_increase: Option<Notify>,
    /// Fired after every successful pop.
    pub on_decrease: Option<Notify>,
}

impl std::fmt::Debug for QueueNotify {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueNotify")
            .field("on_increase", &self.on_increase.is_some())
            .field("on_decrease", &self.on_decrease.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct QueueState {
    items: VecDeque<EventContainer>,
    closed: bool,
}

/// Fixed-capacity FIFO of event containers.
#[derive(Debug)]
pub struct ExchangeQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    notify: QueueNotify,
}

impl ExchangeQueue {
    /// Creates a queue holding at most `capacity` containers.
    pub fn new(capacity: usize, notify: QueueNotify) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            notify,
        }
    }

    /// Pushes without waiting. Hands the container back if the queue is full.
    pub fn try_push(&self, container: EventContainer) -> Result<(), EventContainer> {
        {
            let mut state = self.state.lock();
            if state.items.len() >= self.capacity {
                return Err(container);
            }
            state.items.push_back(container);
        }

        self.not_empty.notify_one();
        self.fire(&self.notify.on_increase);
        Ok(())
    }

    /// Pushes, waiting for space as long as `running` stays set.
    ///
    /// Hands the container back if `running` is cleared before space frees up.
    pub fn blocking_push(
        &self,
        container: EventContainer,
        running: &AtomicBool,
    ) -> Result<(), EventContainer> {
        {
            let mut state = self.state.lock();
            while state.items.len() >= self.capacity {
                if !running.load(Ordering::Acquire) {
                    return Err(container);
                }
                // The running flag is not tied to this condvar, so wake up
                // periodically to observe it.
                self.not_full
                    .wait_for(&mut state, PUSH_RECHECK_INTERVAL);
            }
            state.items.push_back(container);
        }

        self.not_empty.notify_one();
        self.fire(&self.notify.on_increase);
        Ok(())
    }

    /// Pops the oldest container.
    ///
    /// In blocking mode waits until a container arrives or the queue is closed.
    pub fn pop(&self, blocking: bool) -> Option<EventContainer> {
        let container = {
            let mut state = self.state.lock();
            loop {
                if let Some(container) = state.items.pop_front() {
                    break container;
                }
                if !blocking || state.closed {
                    return None;
                }
                self.not_empty.wait(&mut state);
            }
        };

        self.not_full.notify_one();
        self.fire(&self.notify.on_decrease);
        Some(container)
    }

    /// Marks the queue closed and wakes blocked consumers. Containers already
    /// queued can still be popped.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
    }

    /// Removes every queued container, firing the decrease notification once
    /// per container. Returns how many were dropped.
    pub fn drain(&self) -> usize {
        let drained: Vec<EventContainer> = self.state.lock().items.drain(..).collect();
        self.not_full.notify_all();

        for _ in &drained {
            self.fire(&self.notify.on_decrease);
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn fire(&self, notify: &Option<Notify>) {
        if let Some(callback) = notify {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::tests::polarity_container;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_fifo_order_and_capacity() {
        let queue = ExchangeQueue::new(2, QueueNotify::default());
        queue.try_push(polarity_container(1)).unwrap();
        queue.try_push(polarity_container(2)).unwrap();

        let rejected = queue.try_push(polarity_container(3)).unwrap_err();
        assert_eq!(rejected.event_count(), 3);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop(false).unwrap().event_count(), 1);
        assert_eq!(queue.pop(false).unwrap().event_count(), 2);
        assert!(queue.pop(false).is_none());
    }

    #[test]
    fn test_notifications_fire_on_success_only() {
        let increases = Arc::new(AtomicUsize::new(0));
        let decreases = Arc::new(AtomicUsize::new(0));
        let notify = QueueNotify {
            on_increase: Some({
                let increases = increases.clone();
                Arc::new(move || {
                    increases.fetch_add(1, Ordering::SeqCst);
                })
            }),
            on_decrease: Some({
                let decreases = decreases.clone();
                Arc::new(move || {
                    decreases.fetch_add(1, Ordering::SeqCst);
                })
            }),
        };

        let queue = ExchangeQueue::new(1, notify);
        queue.try_push(polarity_container(1)).unwrap();
        assert!(queue.try_push(polarity_container(1)).is_err());
        queue.pop(false).unwrap();
        assert!(queue.pop(false).is_none());

        assert_eq!(increases.load(Ordering::SeqCst), 1);
        assert_eq!(decreases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_blocking_push_waits_for_consumer() {
        let queue = Arc::new(ExchangeQueue::new(1, QueueNotify::default()));
        let running = Arc::new(AtomicBool::new(true));
        queue.try_push(polarity_container(1)).unwrap();

        let producer = {
            let queue = queue.clone();
            let running = running.clone();
            thread::spawn(move || queue.blocking_push(polarity_container(2), &running).is_ok())
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.pop(false).unwrap().event_count(), 1);

        assert!(producer.join().unwrap());
        assert_eq!(queue.pop(false).unwrap().event_count(), 2);
    }

    #[test]
    fn test_blocking_push_escapes_on_shutdown() {
        let queue = Arc::new(ExchangeQueue::new(1, QueueNotify::default()));
        let running = Arc::new(AtomicBool::new(true));
        queue.try_push(polarity_container(1)).unwrap();

        let producer = {
            let queue = queue.clone();
            let running = running.clone();
            thread::spawn(move || queue.blocking_push(polarity_container(2), &running))
        };

        thread::sleep(Duration::from_millis(10));
        running.store(false, Ordering::Release);

        let returned = producer.join().unwrap().unwrap_err();
        assert_eq!(returned.event_count(), 2);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_blocking_pop_wakes_on_push_and_close() {
        let queue = Arc::new(ExchangeQueue::new(4, QueueNotify::default()));

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || {
                let first = queue.pop(true).map(|c| c.event_count());
                let second = queue.pop(true).map(|c| c.event_count());
                (first, second)
            })
        };

        thread::sleep(Duration::from_millis(10));
        queue.try_push(polarity_container(5)).unwrap();
        thread::sleep(Duration::from_millis(10));
        queue.close();

        assert_eq!(consumer.join().unwrap(), (Some(5), None));
    }

    #[test]
    fn test_drain_notifies_per_container() {
        let decreases = Arc::new(AtomicUsize::new(0));
        let notify = QueueNotify {
            on_increase: None,
            on_decrease: Some({
                let decreases = decreases.clone();
                Arc::new(move || {
                    decreases.fetch_add(1, Ordering::SeqCst);
                })
            }),
        };

        let queue = ExchangeQueue::new(4, notify);
        for i in 1..=3 {
            queue.try_push(polarity_container(i)).unwrap();
        }

        assert_eq!(queue.drain(), 3);
        assert!(queue.is_empty());
        assert_eq!(decreases.load(Ordering::SeqCst), 3);
    }
}
