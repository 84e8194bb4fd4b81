//! Tool dispatcher: runs tool calls concurrently and tracks the outstanding
//! batch.
//!
//! Per call: `Dispatched → AwaitingHandler → Responding → (removed)`. The
//! session is busy while any call is outstanding; [`ToolDispatcher::complete`]
//! reports when the last call of a batch has been answered so the held-back
//! input can be released. Completion is counted, never timed.

use crate::error::{LiveError, LiveResult, ToolError};
use crate::tools::{ToolCallRequest, ToolCallResponse, ToolRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

/// Where a single outstanding call is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Dispatched,
    AwaitingHandler,
    Responding,
}

/// Snapshot of one outstanding call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallStatus {
    pub id: String,
    pub name: String,
    pub phase: CallPhase,
    pub elapsed: Duration,
}

#[derive(Debug)]
struct Outstanding {
    name: String,
    phase: CallPhase,
    started: Instant,
}

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    outstanding: HashMap<String, Outstanding>,
    /// Live handler tasks and the call each one answers. A cancelled call's
    /// task is dropped from here, so its result is recognised even if the
    /// agent reuses the id.
    tasks: HashMap<tokio::task::Id, (String, String)>,
    in_flight: JoinSet<ToolCallResponse>,
    batches_completed: u64,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            outstanding: HashMap::new(),
            tasks: HashMap::new(),
            in_flight: JoinSet::new(),
            batches_completed: 0,
        }
    }

    /// Start a call. Unknown names settle immediately with an error response
    /// and no handler runs. Must be called from within a tokio runtime.
    pub fn dispatch(&mut self, request: ToolCallRequest) -> LiveResult<()> {
        if self.outstanding.contains_key(&request.id) {
            return Err(LiveError::Protocol(format!(
                "duplicate tool call id {}",
                request.id
            )));
        }
        if self.outstanding.is_empty() {
            debug!("tool batch started");
        }

        let ToolCallRequest {
            id,
            name,
            arguments,
        } = request;
        self.outstanding.insert(
            id.clone(),
            Outstanding {
                name: name.clone(),
                phase: CallPhase::Dispatched,
                started: Instant::now(),
            },
        );

        let handle = match self.registry.get(&name) {
            Some(handler) => {
                info!(tool = %name, call_id = %id, "🔧 Invoking tool");
                let (id, name) = (id.clone(), name.clone());
                self.in_flight.spawn(async move {
                    let outcome = handler.call(arguments).await;
                    ToolCallResponse { id, name, outcome }
                })
            }
            None => {
                warn!(tool = %name, call_id = %id, "unknown tool requested");
                let response =
                    ToolCallResponse::error(id.clone(), name.clone(), ToolError::UnknownTool(name.clone()));
                self.in_flight.spawn(std::future::ready(response))
            }
        };
        self.tasks.insert(handle.id(), (id.clone(), name));
        if let Some(call) = self.outstanding.get_mut(&id) {
            call.phase = CallPhase::AwaitingHandler;
        }
        Ok(())
    }

    /// Wait for the next handler to settle. Results of cancelled calls are
    /// discarded here. A panicking handler yields an error response.
    /// Cancel-safe.
    pub async fn next_settled(&mut self) -> Option<ToolCallResponse> {
        loop {
            let joined = self.in_flight.join_next_with_id().await?;
            let response = match joined {
                Ok((task_id, response)) => {
                    if self.tasks.remove(&task_id).is_none() {
                        debug!(call_id = %response.id, "discarding result of cancelled tool call");
                        continue;
                    }
                    response
                }
                Err(err) => match self.response_for_failed_task(err) {
                    Some(response) => response,
                    None => continue,
                },
            };

            match self.outstanding.get_mut(&response.id) {
                Some(call) => {
                    call.phase = CallPhase::Responding;
                    debug!(
                        tool = %response.name,
                        call_id = %response.id,
                        ok = response.is_ok(),
                        elapsed_ms = call.started.elapsed().as_millis() as u64,
                        "tool settled"
                    );
                    return Some(response);
                }
                None => {
                    debug!(call_id = %response.id, "discarding result of cancelled tool call");
                }
            }
        }
    }

    fn response_for_failed_task(&mut self, err: JoinError) -> Option<ToolCallResponse> {
        let (id, name) = self.tasks.remove(&err.id())?;
        warn!(tool = %name, call_id = %id, "tool handler failed: {}", err);
        Some(ToolCallResponse::error(
            id,
            name,
            ToolError::Failed(format!("handler aborted: {}", err)),
        ))
    }

    /// The response for `id` was sent. Returns true when that was the last
    /// outstanding call of the batch.
    pub fn complete(&mut self, id: &str) -> bool {
        if self.outstanding.remove(id).is_none() {
            return false;
        }
        self.finish_batch_if_idle()
    }

    /// The agent withdrew these calls. Their handlers keep running but their
    /// results will be discarded. Returns true when this ended the batch.
    pub fn cancel(&mut self, ids: &[String]) -> bool {
        let mut removed = 0;
        for id in ids {
            if let Some(call) = self.outstanding.remove(id) {
                info!(tool = %call.name, call_id = %id, "tool call cancelled by agent");
                removed += 1;
            }
        }
        self.tasks.retain(|_, (call_id, _)| !ids.contains(call_id));
        removed > 0 && self.finish_batch_if_idle()
    }

    fn finish_batch_if_idle(&mut self) -> bool {
        if self.outstanding.is_empty() {
            self.batches_completed += 1;
            debug!(batches = self.batches_completed, "tool batch complete");
            true
        } else {
            false
        }
    }

    /// Stop tracking everything (session closed). Handlers run to completion
    /// detached; their results go nowhere. Returns how many calls were
    /// outstanding.
    pub fn abandon(&mut self) -> usize {
        let n = self.outstanding.len();
        self.outstanding.clear();
        self.tasks.clear();
        self.in_flight.detach_all();
        n
    }

    pub fn is_busy(&self) -> bool {
        !self.outstanding.is_empty()
    }

    /// Calls awaiting a response.
    pub fn pending(&self) -> usize {
        self.outstanding.len()
    }

    /// Handler tasks still running (including cancelled ones).
    pub fn has_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Outstanding calls, oldest first.
    pub fn calls(&self) -> Vec<ToolCallStatus> {
        let mut calls: Vec<(&Instant, ToolCallStatus)> = self
            .outstanding
            .iter()
            .map(|(id, call)| {
                (
                    &call.started,
                    ToolCallStatus {
                        id: id.clone(),
                        name: call.name.clone(),
                        phase: call.phase,
                        elapsed: call.started.elapsed(),
                    },
                )
            })
            .collect();
        calls.sort_by(|a, b| a.0.cmp(b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        calls.into_iter().map(|(_, status)| status).collect()
    }

    pub fn batches_completed(&self) -> u64 {
        self.batches_completed
    }
}
