use std::collections::VecDeque;
use std::fmt::{Debug, Display, Formatter};
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

/// Returned when a queue operation's deadline passes. A timed out push hands its item back.
pub struct QueueTimeout<T = ()>(pub T);

impl <T> Debug for QueueTimeout<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "QueueTimeout")
    }
}
impl <T> Display for QueueTimeout<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "timed out waiting on the queue")
    }
}
impl <T> std::error::Error for QueueTimeout<T> {}

struct QueueState<T> {
    items: VecDeque<T>,
    capacity: usize,
}

/// A bounded FIFO shared between tasks. `push` waits while the queue is full and `pop` waits
///  while it is empty, each with an optional timeout.
///
/// The lock is never held across an await point.
pub struct EventQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Notify,
    not_full: Notify,
}

impl <T> EventQueue<T> {
    pub fn new(capacity: NonZeroUsize) -> EventQueue<T> {
        EventQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                capacity: capacity.get(),
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Growing the queue wakes up one waiting pusher per added slot. Shrinking it does not drop
    ///  anything, the queue drains below the new capacity before accepting further items.
    pub fn set_capacity(&self, capacity: NonZeroUsize) {
        let added = {
            let mut state = self.lock();
            let added = capacity.get().saturating_sub(state.capacity);
            state.capacity = capacity.get();
            added
        };
        for _ in 0..added {
            self.not_full.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn clear(&self) {
        let removed = {
            let mut state = self.lock();
            let removed = state.items.len();
            state.items.clear();
            removed
        };
        for _ in 0..removed {
            self.not_full.notify_one();
        }
    }

    /// Blocks indefinitely if `timeout` is `None`
    pub async fn push(&self, item: T, timeout: Option<Duration>) -> Result<(), QueueTimeout<T>> {
        self.push_until(item, timeout.map(|t| Instant::now() + t)).await
    }

    pub async fn push_until(&self, item: T, deadline: Option<Instant>) -> Result<(), QueueTimeout<T>> {
        loop {
            // registered before checking so that a wakeup between check and wait is not lost
            let notified = self.not_full.notified();
            {
                let mut state = self.lock();
                if state.items.len() < state.capacity {
                    state.items.push_back(item);
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }
            if !wait(notified, deadline).await {
                return Err(QueueTimeout(item));
            }
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let item = self.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Blocks indefinitely if `timeout` is `None`
    pub async fn pop(&self, timeout: Option<Duration>) -> Result<T, QueueTimeout> {
        self.pop_until(timeout.map(|t| Instant::now() + t)).await
    }

    pub async fn pop_until(&self, deadline: Option<Instant>) -> Result<T, QueueTimeout> {
        loop {
            let notified = self.not_empty.notified();
            if let Some(item) = self.try_pop() {
                return Ok(item);
            }
            if !wait(notified, deadline).await {
                return Err(QueueTimeout(()));
            }
        }
    }
}

/// returns `false` if the deadline passed before a notification arrived
async fn wait(notified: Notified<'_>, deadline: Option<Instant>) -> bool {
    match deadline {
        None => {
            notified.await;
            true
        }
        Some(deadline) => timeout_at(deadline, notified).await.is_ok(),
    }
}
