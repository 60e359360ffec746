//! Live event stream for a task at `/tasks/{task_id}/stream`.
//!
//! A subscriber first receives the task's retained history, then every new
//! event as it is published. The response ends right after the `end` event.
//! Disconnecting only drops the subscription; the task keeps running.

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::stream;
use tracing::{debug, info};

use super::{AppState, authenticate};
use crate::auth::{Principal, authorize_view};
use crate::error::TaskError;
use crate::tasks::{Subscription, TaskEvent, TaskId, TaskStore};

/// Look up a task and open a subscription for `principal`.
///
/// Fails with `NotFound` for unknown or reclaimed ids and `AccessDenied`
/// when the principal may not see the task's scope.
pub fn attach(
    store: &TaskStore,
    task_id: &TaskId,
    principal: &Principal,
) -> Result<Subscription, TaskError> {
    let entry = store.get(task_id).ok_or(TaskError::NotFound(*task_id))?;
    authorize_view(principal, &entry.scope())?;
    Ok(entry.subscribe())
}

pub(super) async fn stream_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, TaskError> {
    let task_id: TaskId = task_id.parse()?;
    let principal = authenticate(&state, &headers).await?;
    let subscription = attach(&state.store, &task_id, &principal)?;

    info!(
        task_id = %task_id,
        principal = %principal.id,
        live = subscription.is_live(),
        "Task stream client connected"
    );

    Ok(sse_response(subscription))
}

/// Logs when the client goes away, whether or not the task has ended.
struct StreamGuard {
    task_id: TaskId,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        debug!(task_id = %self.task_id, "Task stream closed");
    }
}

fn sse_response(subscription: Subscription) -> Response {
    let guard = StreamGuard {
        task_id: subscription.task_id(),
    };

    let events = stream::unfold((subscription, guard), |(mut sub, guard)| async move {
        let event = sub.next().await?;
        Some((Ok::<_, Infallible>(to_sse(&event)), (sub, guard)))
    });

    (
        [(header::CONNECTION, HeaderValue::from_static("keep-alive"))],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

fn to_sse(event: &TaskEvent) -> Event {
    Event::default()
        .event(event.kind())
        .data(event.payload().to_string())
}
