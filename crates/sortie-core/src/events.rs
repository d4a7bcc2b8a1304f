//! Observer stream
//!
//! Append-only stream of orchestration events for reporting sinks. Built on a
//! tokio broadcast channel: emitting never blocks, and a subscriber that falls
//! behind sees `RecvError::Lagged` instead of stalling the core.

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::action::{ActionRequest, ActionResult};
use crate::types::{now, RequestId, Timestamp, WorkflowRunId};
use crate::workflow::RunState;

/// Default number of buffered events per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Event emitted by the orchestration core
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// A request reached a terminal result (emitted after the store commit)
    ActionCompleted {
        request: Arc<ActionRequest>,
        result: Arc<ActionResult>,
        at: Timestamp,
    },

    /// Advisory progress forwarded from a running module
    Progress {
        request_id: RequestId,
        fraction: Option<f32>,
        message: String,
        at: Timestamp,
    },

    /// Workflow run state change
    WorkflowTransition {
        run_id: WorkflowRunId,
        from: RunState,
        to: RunState,
        at: Timestamp,
    },
}

impl OrchestratorEvent {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            OrchestratorEvent::ActionCompleted { at, .. }
            | OrchestratorEvent::Progress { at, .. }
            | OrchestratorEvent::WorkflowTransition { at, .. } => *at,
        }
    }
}

/// Broadcast sink shared by every component of a session
#[derive(Debug, Clone)]
pub struct EventStream {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl EventStream {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn emit(&self, event: OrchestratorEvent) {
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    pub fn action_completed(&self, request: Arc<ActionRequest>, result: Arc<ActionResult>) {
        self.emit(OrchestratorEvent::ActionCompleted {
            request,
            result,
            at: now(),
        });
    }

    pub fn progress(&self, request_id: RequestId, fraction: Option<f32>, message: impl Into<String>) {
        self.emit(OrchestratorEvent::Progress {
            request_id,
            fraction,
            message: message.into(),
            at: now(),
        });
    }

    pub fn workflow_transition(&self, run_id: WorkflowRunId, from: RunState, to: RunState) {
        self.emit(OrchestratorEvent::WorkflowTransition {
            run_id,
            from,
            to,
            at: now(),
        });
    }
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
