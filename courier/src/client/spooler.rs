use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::select;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use courier_protocol::event::Event;
use courier_protocol::event_queue::EventQueue;
use crate::client::io_session::IoAction;

/// Set by the session when it can accept another payload, consumed by the spooler
#[derive(Default)]
pub(crate) struct SendReadiness {
    ready: Mutex<bool>,
    notify: Notify,
}

impl SendReadiness {
    pub fn new() -> SendReadiness {
        SendReadiness::default()
    }

    pub fn signal(&self) {
        *self.ready.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.notify.notify_one();
    }

    pub fn clear(&self) {
        *self.ready.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    /// Waits until readiness is signalled and resets it
    pub async fn take(&self) {
        loop {
            let notified = self.notify.notified();
            {
                let mut ready = self.ready.lock().unwrap_or_else(PoisonError::into_inner);
                if *ready {
                    *ready = false;
                    return;
                }
            }
            notified.await;
        }
    }
}

/// Collects published events into spools of at most `spool_size` events. A spool is flushed
///  when it is full, when `idle_timeout` elapsed since the previous flush, or on shutdown, and
///  only ever handed to the session after it signalled readiness. Incoming events do not
///  postpone the idle flush.
///
/// `None` on the input queue is the shutdown marker: the spooler flushes what it has and stops.
pub(crate) struct Spooler {
    input: Arc<EventQueue<Option<Event>>>,
    control: Arc<EventQueue<IoAction>>,
    readiness: Arc<SendReadiness>,
    spool_size: usize,
    idle_timeout: Duration,
    cancel: CancellationToken,
}

impl Spooler {
    pub fn new(
        input: Arc<EventQueue<Option<Event>>>,
        control: Arc<EventQueue<IoAction>>,
        readiness: Arc<SendReadiness>,
        spool_size: usize,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> Spooler {
        Spooler {
            input,
            control,
            readiness,
            spool_size,
            idle_timeout,
            cancel,
        }
    }

    pub async fn run(self) {
        select! {
            _ = self.cancel.cancelled() => debug!("spooler cancelled"),
            _ = self.spool_loop() => debug!("spooler finished"),
        }
    }

    async fn spool_loop(&self) {
        let mut spool = Vec::with_capacity(self.spool_size);
        let mut deadline = Instant::now() + self.idle_timeout;

        loop {
            match self.input.pop_until(Some(deadline)).await {
                Ok(Some(event)) => {
                    spool.push(event);
                    if spool.len() >= self.spool_size {
                        trace!(events = spool.len(), "spool full, flushing");
                        self.flush(&mut spool).await;
                        deadline = Instant::now() + self.idle_timeout;
                    }
                }
                Ok(None) => {
                    debug!(events = spool.len(), "shutdown requested, flushing remaining events");
                    self.flush(&mut spool).await;
                    return;
                }
                Err(_) => {
                    if !spool.is_empty() {
                        trace!(events = spool.len(), "idle timeout, flushing partial spool");
                        self.flush(&mut spool).await;
                    }
                    deadline = Instant::now() + self.idle_timeout;
                }
            }
        }
    }

    async fn flush(&self, spool: &mut Vec<Event>) {
        if spool.is_empty() {
            return;
        }
        self.readiness.take().await;

        let events = std::mem::replace(spool, Vec::with_capacity(self.spool_size));
        // without a timeout this can not fail, it waits for room in the session's queue
        let _ = self.control.push(IoAction::Events(events), None).await;
    }
}
