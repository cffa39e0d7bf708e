//! Fan-out of a run's progress events to live observers.
//!
//! Every subscriber gets its own bounded channel. Publishing uses `try_send`,
//! so it never waits: a subscriber whose buffer is full is disconnected
//! instead of slowing the pipeline or the other subscribers. A new subscriber
//! is registered and handed the current snapshot in one critical section, so
//! it sees every later event exactly once.

use chrono::Utc;
use common::jobs::{ProgressEvent, ProgressSnapshot, StreamMessage};
use log::{debug, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use uuid::Uuid;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<StreamMessage>,
}

struct Inner {
    subscribers: Vec<Subscriber>,
    next_id: u64,
    latest: ProgressSnapshot,
    closed: bool,
}

#[derive(Clone)]
pub struct ProgressBroadcaster {
    session_id: Uuid,
    buffer: usize,
    inner: Arc<Mutex<Inner>>,
}

/// Receiving end of one subscription. Ends after a `Closed` message, or early
/// if the subscriber fell behind.
pub struct Subscription {
    rx: mpsc::Receiver<StreamMessage>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<StreamMessage> {
        self.rx.recv().await
    }
}

impl ProgressBroadcaster {
    pub fn new(initial: ProgressSnapshot, buffer: usize) -> Self {
        Self {
            session_id: initial.session_id,
            buffer: buffer.max(1),
            inner: Arc::new(Mutex::new(Inner {
                subscribers: Vec::new(),
                next_id: 0,
                latest: initial,
                closed: false,
            })),
        }
    }

    /// A broadcaster that is already closed: subscribers get the snapshot and
    /// the terminal marker straight away.
    pub fn finished(snapshot: ProgressSnapshot, buffer: usize) -> Self {
        let broadcaster = Self::new(snapshot.clone(), buffer);
        broadcaster.close(snapshot);
        broadcaster
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> Subscription {
        let mut inner = self.lock();
        let snapshot = StreamMessage::Snapshot {
            progress: inner.latest.clone(),
        };

        if inner.closed {
            let (tx, rx) = mpsc::channel(2);
            let _ = tx.try_send(snapshot);
            let _ = tx.try_send(StreamMessage::Closed {
                progress: inner.latest.clone(),
            });
            return Subscription { rx };
        }

        // One extra slot so the snapshot never counts against the buffer.
        let (tx, rx) = mpsc::channel(self.buffer + 1);
        let _ = tx.try_send(snapshot);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(Subscriber { id, tx });
        debug!(
            "Session {}: subscriber {} joined ({} live)",
            self.session_id,
            id,
            inner.subscribers.len()
        );
        Subscription { rx }
    }

    pub fn publish(&self, event: ProgressEvent, progress: ProgressSnapshot) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.latest = progress.clone();
        let message = StreamMessage::Event { event, progress };
        let session_id = self.session_id;
        inner.subscribers.retain(|sub| match sub.tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Session {}: subscriber {} fell behind and was disconnected",
                    session_id, sub.id
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Sends the terminal marker and disconnects everyone. Later calls to
    /// `publish` are ignored.
    pub fn close(&self, progress: ProgressSnapshot) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.latest = progress.clone();
        for sub in inner.subscribers.drain(..) {
            let _ = sub.tx.try_send(StreamMessage::Closed {
                progress: progress.clone(),
            });
        }
        debug!("Session {}: progress stream closed", self.session_id);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

/// Heartbeat message for idle streams.
pub fn heartbeat() -> StreamMessage {
    StreamMessage::Heartbeat { at: Utc::now() }
}
