//! Deferred removal of finished tasks from the store.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::model::TaskId;
use super::store::TaskStore;

/// Default grace period between finalize and deletion.
pub const DEFAULT_RECLAIM_GRACE: Duration = Duration::from_secs(300);

/// Handle for scheduling task deletions.
///
/// A single background loop per store processes the queue. It only holds a
/// weak reference to the store and stops once the store is dropped, or once
/// every handle is dropped and the queue has drained.
#[derive(Clone)]
pub struct Reclaimer {
    tx: mpsc::UnboundedSender<(TaskId, Instant)>,
    grace: Duration,
}

impl Reclaimer {
    pub fn spawn(store: &Arc<TaskStore>, grace: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(reclaim_loop(Arc::downgrade(store), rx));
        Self { tx, grace }
    }

    /// Delete `id` from the store once the grace period elapses.
    pub fn schedule(&self, id: TaskId) {
        let deadline = Instant::now() + self.grace;
        if self.tx.send((id, deadline)).is_err() {
            warn!(task_id = %id, "Reclaim loop is gone, task will not be reclaimed");
        } else {
            debug!(task_id = %id, grace_secs = self.grace.as_secs(), "Task reclamation scheduled");
        }
    }
}

async fn reclaim_loop(
    store: Weak<TaskStore>,
    mut rx: mpsc::UnboundedReceiver<(TaskId, Instant)>,
) {
    // Grace is constant per reclaimer, so deadlines arrive in order.
    let mut pending: VecDeque<(TaskId, Instant)> = VecDeque::new();
    let mut open = true;

    loop {
        if !open && pending.is_empty() {
            break;
        }

        let next_deadline = pending.front().map(|(_, deadline)| *deadline);

        tokio::select! {
            msg = rx.recv(), if open => match msg {
                Some(item) => pending.push_back(item),
                None => open = false,
            },
            _ = sleep_until(next_deadline) => {
                let Some(store) = store.upgrade() else {
                    break;
                };
                let now = Instant::now();
                while let Some((id, deadline)) = pending.front().copied() {
                    if deadline > now {
                        break;
                    }
                    pending.pop_front();
                    if store.delete(&id) {
                        info!(task_id = %id, "Reclaimed finished task");
                    }
                }
            }
        }
    }

    debug!("Reclaim loop stopped");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
