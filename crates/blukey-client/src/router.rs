//! Inbound frame demultiplexing.
//!
//! Notification chunks arrive on the intake task while at most one
//! command awaits a reply. Frames that nobody is waiting for are
//! backlogged and drained oldest-first by the next waiter, so a late
//! reply to a timed-out command cannot be matched to the wrong one.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use blukey_proto::{Frame, Framer};

type Predicate = Box<dyn Fn(&Frame) -> bool + Send>;

struct Waiter {
    predicate: Predicate,
    tx: oneshot::Sender<Frame>,
}

struct RouterInner {
    framer: Framer,
    backlog: VecDeque<Frame>,
    waiter: Option<Waiter>,
}

/// Shared between the intake task (feeding chunks) and the command
/// runner (awaiting replies). One waiter slot; a second concurrent
/// wait is a sequencing bug and fails closed.
pub struct RxRouter {
    inner: Mutex<RouterInner>,
}

impl RxRouter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RouterInner {
                framer: Framer::new(),
                backlog: VecDeque::new(),
                waiter: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RouterInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Feed a raw notification chunk. Completed frames go to the
    /// current waiter if its predicate accepts them, otherwise to the
    /// backlog.
    pub fn ingest(&self, chunk: &[u8]) {
        let mut inner = self.lock();
        for frame in inner.framer.push(chunk) {
            if let Some(waiter) = inner.waiter.take() {
                if (waiter.predicate)(&frame) {
                    if let Err(frame) = waiter.tx.send(frame) {
                        // Receiver already dropped (timeout raced the
                        // reply); keep the frame for the next waiter.
                        inner.backlog.push_back(frame);
                    }
                    continue;
                }
                inner.waiter = Some(waiter);
            }
            debug!(op = frame.op, "backlogged frame");
            inner.backlog.push_back(frame);
        }
    }

    /// Await the next frame matching `predicate`, draining the backlog
    /// first. Returns `None` on timeout, or immediately if another
    /// wait is already in flight.
    pub async fn await_frame<F>(&self, budget: Duration, predicate: F) -> Option<Frame>
    where
        F: Fn(&Frame) -> bool + Send + 'static,
    {
        let rx = {
            let mut inner = self.lock();
            if let Some(pos) = inner.backlog.iter().position(|f| predicate(f)) {
                return inner.backlog.remove(pos);
            }
            if inner.waiter.is_some() {
                warn!("overlapping receive wait; failing closed");
                return None;
            }
            let (tx, rx) = oneshot::channel();
            inner.waiter = Some(Waiter {
                predicate: Box::new(predicate),
                tx,
            });
            rx
        };

        match tokio::time::timeout(budget, rx).await {
            Ok(Ok(frame)) => Some(frame),
            // Waiter dropped during a reset.
            Ok(Err(_)) => None,
            Err(_) => {
                self.lock().waiter = None;
                None
            }
        }
    }

    /// Discard all buffered state. Any in-flight waiter observes its
    /// channel closing and resolves empty.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.framer.reset();
        inner.backlog.clear();
        inner.waiter = None;
    }
}

impl Default for RxRouter {
    fn default() -> Self {
        Self::new()
    }
}
