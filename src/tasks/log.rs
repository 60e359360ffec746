//! Per-task event log: a bounded replay buffer plus a broadcast channel for
//! live fan-out.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::model::{EventData, TaskEvent, TaskId};
use super::store::TaskEntry;

/// Maximum number of events retained per task. Oldest entries are evicted first.
pub const EVENT_LOG_CAPACITY: usize = 1000;

/// Ordered, capacity-bounded event history for one task.
///
/// Not synchronized on its own: the owning [`TaskEntry`] guards it together
/// with the task record, which is what makes `subscribe` atomic with respect
/// to `publish`.
#[derive(Debug)]
pub struct EventLog {
    events: VecDeque<TaskEvent>,
    next_seq: u64,
    closed: bool,
    tx: broadcast::Sender<TaskEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_LOG_CAPACITY);
        Self {
            events: VecDeque::with_capacity(64),
            next_seq: 0,
            closed: false,
            tx,
        }
    }

    /// Append an event and push it to live subscribers.
    ///
    /// Returns `None` once the `end` event has been published; nothing can
    /// follow it.
    pub fn publish(&mut self, data: EventData) -> Option<TaskEvent> {
        if self.closed {
            return None;
        }

        let event = TaskEvent {
            seq: self.next_seq,
            at: Utc::now(),
            data,
        };
        self.next_seq += 1;
        self.closed = event.is_end();

        if self.events.len() >= EVENT_LOG_CAPACITY {
            self.events.pop_front();
        }
        self.events.push_back(event.clone());

        // Ok if nobody is listening
        let _ = self.tx.send(event.clone());

        Some(event)
    }

    /// Retained events with `seq >= from_seq`, plus a live receiver unless the
    /// log is already closed.
    pub fn subscribe_from(
        &self,
        from_seq: u64,
    ) -> (VecDeque<TaskEvent>, Option<broadcast::Receiver<TaskEvent>>) {
        let replay = self
            .events
            .iter()
            .filter(|e| e.seq >= from_seq)
            .cloned()
            .collect();
        let live = (!self.closed).then(|| self.tx.subscribe());
        (replay, live)
    }

    pub fn events(&self) -> impl Iterator<Item = &TaskEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber's view of one task: replay first, then live events, ending
/// after `end`. Dropping it detaches the live receiver.
pub struct Subscription {
    entry: Arc<TaskEntry>,
    replay: VecDeque<TaskEvent>,
    live: Option<broadcast::Receiver<TaskEvent>>,
    next_seq: u64,
    finished: bool,
}

impl Subscription {
    pub(crate) fn new(
        entry: Arc<TaskEntry>,
        replay: VecDeque<TaskEvent>,
        live: Option<broadcast::Receiver<TaskEvent>>,
    ) -> Self {
        Self {
            entry,
            replay,
            live,
            next_seq: 0,
            finished: false,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.entry.id()
    }

    /// Whether a live receiver is registered. False when the task was already
    /// terminal at subscribe time, or once `end` has been delivered.
    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    /// Next event in order, or `None` after `end`.
    pub async fn next(&mut self) -> Option<TaskEvent> {
        loop {
            if self.finished {
                return None;
            }

            if let Some(event) = self.replay.pop_front() {
                return Some(self.deliver(event));
            }

            let rx = self.live.as_mut()?;
            match rx.recv().await {
                Ok(event) => {
                    if event.seq < self.next_seq {
                        continue;
                    }
                    return Some(self.deliver(event));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        task_id = %self.entry.id(),
                        missed = n,
                        "Subscriber lagged behind broadcast, re-syncing from log"
                    );
                    let (replay, live) = self.entry.subscribe_from(self.next_seq);
                    self.replay = replay;
                    self.live = live;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(task_id = %self.entry.id(), "Task broadcast channel closed");
                    self.live = None;
                    return None;
                }
            }
        }
    }

    fn deliver(&mut self, event: TaskEvent) -> TaskEvent {
        self.next_seq = event.seq + 1;
        if event.is_end() {
            self.finished = true;
            self.live = None;
        }
        event
    }
}
