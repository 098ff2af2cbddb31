//! Bounded event queue between producers and the dispatcher thread.
//!
//! Any number of producers submit events without blocking; exactly one
//! consumer drains them in FIFO order. A full queue drops the newest event.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::event::Event;

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 200;

/// Slots held back for shutdown events, so `on_shutdown` still runs when the
/// queue is full.
pub const SHUTDOWN_RESERVE: usize = 4;

/// Queue lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Accepting every event.
    Running,
    /// Accepting only shutdown events.
    Draining,
    /// The consumer has exited.
    Stopped,
}

struct QueueInner {
    tx: Option<mpsc::Sender<Event>>,
    state: QueueState,
}

/// Producer side of the event queue.
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
}

/// Consumer side of the event queue. Owned by the dispatcher thread.
pub struct EventReceiver {
    rx: mpsc::Receiver<Event>,
    queue: Arc<EventQueue>,
}

impl EventQueue {
    /// Create a queue holding at most `capacity` pending events, plus
    /// [`SHUTDOWN_RESERVE`] slots only shutdown events may use.
    pub fn new(capacity: usize) -> (Arc<Self>, EventReceiver) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity + SHUTDOWN_RESERVE);
        let queue = Arc::new(Self {
            inner: Mutex::new(QueueInner {
                tx: Some(tx),
                state: QueueState::Running,
            }),
            capacity,
        });
        let receiver = EventReceiver {
            rx,
            queue: Arc::clone(&queue),
        };
        (queue, receiver)
    }

    /// Submit an event without blocking.
    ///
    /// Returns whether the event was accepted. Rejections are logged with
    /// `source` and the event kind; they are never reported as errors.
    pub fn submit(&self, event: Event, source: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        match inner.state {
            QueueState::Stopped => {
                warn!(
                    "Event queue stopped, dropping {} event from {}",
                    event.kind(),
                    source
                );
                return false;
            }
            QueueState::Draining if !event.is_shutdown() => {
                debug!(
                    "Event queue draining, rejecting {} event from {}",
                    event.kind(),
                    source
                );
                return false;
            }
            _ => {}
        }

        let Some(tx) = inner.tx.as_ref() else {
            warn!(
                "Event queue closed, dropping {} event from {}",
                event.kind(),
                source
            );
            return false;
        };

        let pending = tx.max_capacity() - tx.capacity();
        if pending >= self.capacity && !event.is_shutdown() {
            warn!(
                "Event queue full ({}), dropping {} event from {}",
                self.capacity,
                event.kind(),
                source
            );
            return false;
        }

        match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(
                    "Event queue full ({}), dropping {} event from {}",
                    self.capacity,
                    event.kind(),
                    source
                );
                false
            }
            Err(TrySendError::Closed(event)) => {
                warn!(
                    "Event consumer gone, dropping {} event from {}",
                    event.kind(),
                    source
                );
                false
            }
        }
    }

    /// Enter the draining state. Returns true only for the first caller.
    pub fn begin_draining(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.state == QueueState::Running {
            inner.state = QueueState::Draining;
            true
        } else {
            false
        }
    }

    /// Drop the sender. The consumer drains what is buffered, then exits.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.tx.take().is_some() {
            debug!("Event queue closed");
        }
    }

    pub fn state(&self) -> QueueState {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tx
            .is_none()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of events currently buffered. Zero once closed.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .tx
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mark_stopped(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.state = QueueState::Stopped;
        inner.tx = None;
    }
}

impl EventReceiver {
    /// Block until the next event arrives.
    ///
    /// Returns `None` once the queue is closed and fully drained, marking the
    /// queue stopped. Must not be called from inside an async context.
    pub fn blocking_recv(&mut self) -> Option<Event> {
        let event = self.rx.blocking_recv();
        if event.is_none() {
            self.queue.mark_stopped();
        }
        event
    }

    /// Async variant of [`EventReceiver::blocking_recv`].
    pub async fn recv(&mut self) -> Option<Event> {
        let event = self.rx.recv().await;
        if event.is_none() {
            self.queue.mark_stopped();
        }
        event
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        self.queue.mark_stopped();
    }
}
