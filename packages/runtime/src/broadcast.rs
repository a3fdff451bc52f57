// ABOUTME: Per-run log fan-out with full history replay for late subscribers
// ABOUTME: One producer, any number of subscribers, each with its own bounded live queue

use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Line delivered in place of the remaining output when a viewer's backlog overflows.
pub const LAGGED_LINE: &str = "[SYSTEM] Stream closed: viewer fell too far behind.";

/// What a viewer receives: log lines, then exactly one completion marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Line(String),
    Complete,
}

pub type EventStream = BoxStream<'static, StreamEvent>;

#[derive(Default)]
struct BroadcastState {
    history: Vec<String>,
    subscribers: HashMap<u64, mpsc::Sender<String>>,
    /// Subscribers cut off for overflowing their queue
    lagged: HashSet<u64>,
    next_id: u64,
    closed: bool,
}

struct Shared {
    state: Mutex<BroadcastState>,
    capacity: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BroadcastState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Log broadcast mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn unsubscribe(&self, id: u64) -> bool {
        let mut state = self.lock();
        state.subscribers.remove(&id);
        state.lagged.remove(&id)
    }
}

/// Fan-out channel for one run.
///
/// History and the subscriber set live under a single lock, so a subscriber's
/// replay snapshot and its registration happen atomically. Every line published
/// afterwards goes to its queue, nothing before it does.
#[derive(Clone)]
pub struct LogBroadcast {
    shared: Arc<Shared>,
}

impl LogBroadcast {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BroadcastState::default()),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Append a line to the history and offer it to every live subscriber.
    pub fn publish(&self, line: impl Into<String>) {
        let line = line.into();
        let mut state = self.shared.lock();
        if state.closed {
            debug!("Dropping line published after close");
            return;
        }

        let mut overflowed = Vec::new();
        state.subscribers.retain(|id, tx| match tx.try_send(line.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                overflowed.push(*id);
                false
            }
            // Receiver already gone; its Drop will clean up
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        for id in overflowed {
            warn!(subscriber = id, "Log subscriber fell behind, disconnecting");
            state.lagged.insert(id);
        }

        state.history.push(line);
    }

    /// End the stream. Subscribers drain what is queued, then complete.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    pub fn subscribe(&self) -> LogSubscription {
        let mut state = self.shared.lock();
        let id = state.next_id;
        state.next_id += 1;

        let replay: VecDeque<String> = state.history.iter().cloned().collect();
        let live = if state.closed {
            None
        } else {
            let (tx, rx) = mpsc::channel(self.shared.capacity);
            state.subscribers.insert(id, tx);
            Some(rx)
        };

        LogSubscription {
            id,
            replay,
            live,
            finished: false,
            shared: self.shared.clone(),
        }
    }

    pub fn history(&self) -> Vec<String> {
        self.shared.lock().history.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().subscribers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

/// A viewer's position in a run's output. Unregisters itself on drop.
pub struct LogSubscription {
    id: u64,
    replay: VecDeque<String>,
    live: Option<mpsc::Receiver<String>>,
    finished: bool,
    shared: Arc<Shared>,
}

impl LogSubscription {
    /// Next event; `None` once the completion marker has been returned.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }

        if let Some(line) = self.replay.pop_front() {
            return Some(StreamEvent::Line(line));
        }

        if let Some(rx) = self.live.as_mut() {
            if let Some(line) = rx.recv().await {
                return Some(StreamEvent::Line(line));
            }
            self.live = None;
            if self.shared.unsubscribe(self.id) {
                return Some(StreamEvent::Line(LAGGED_LINE.to_string()));
            }
        }

        self.finished = true;
        Some(StreamEvent::Complete)
    }

    pub fn into_stream(self) -> EventStream {
        stream::unfold(self, |mut subscription| async move {
            subscription
                .next()
                .await
                .map(|event| (event, subscription))
        })
        .boxed()
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.shared.unsubscribe(self.id);
    }
}
