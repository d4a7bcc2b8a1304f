//! Workflow engine
//!
//! Each run is driven by its own task. A step is dispatched as one batch:
//! every template is expanded and re-resolved against a fresh snapshot, scope
//! checked, then submitted; the engine waits for every result before the
//! advance policy picks the next step. Because the scheduler commits a result
//! before handing it back, step N's findings are in the knowledge store
//! before step N+1 is resolved.

pub mod definition;
pub mod state;

pub use definition::{ActionTemplate, AdvancePolicy, Branch, StepSpec, WorkflowDefinition};
pub use state::{RunReport, RunState, StepAction, StepOutcome};

use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::action::{ActionRequest, StepRef};
use crate::config::WorkflowSettings;
use crate::dispatch::Dispatcher;
use crate::error::{OrchestratorError, Result};
use crate::events::EventStream;
use crate::intent::IntentResolver;
use crate::types::{now, RequestId, WorkflowRunId};

/// Control messages for a paused run
#[derive(Debug)]
enum Control {
    Resume(Option<StepSpec>),
}

struct RunShared {
    id: WorkflowRunId,
    state: watch::Sender<RunState>,
    report: Mutex<RunReport>,
    pause_requested: AtomicBool,
    abort: CancellationToken,
    control: mpsc::UnboundedSender<Control>,
    events: EventStream,
}

impl RunShared {
    fn state(&self) -> RunState {
        *self.state.borrow()
    }

    fn transition(&self, to: RunState, reason: Option<String>) -> bool {
        let mut from = None;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(to) {
                from = Some(*current);
                *current = to;
                true
            } else {
                false
            }
        });
        let Some(from) = from else {
            debug!(run_id = %self.id, to = %to, "ignored run transition");
            return false;
        };

        {
            let mut report = self.report.lock();
            report.state = to;
            report.updated_at = now();
            if reason.is_some() {
                report.reason = reason;
            }
        }
        info!(run_id = %self.id, from = %from, to = %to, "workflow transition");
        self.events.workflow_transition(self.id, from, to);
        true
    }

    /// A paused run has nothing in flight and aborts on the spot; a
    /// running one is finished by its driver
    fn abort_now(&self) {
        if self.state() == RunState::Paused {
            self.transition(RunState::Aborted, Some("aborted while paused".into()));
        }
        self.abort.cancel();
    }

    fn snapshot(&self) -> RunReport {
        self.report.lock().clone()
    }
}

struct EngineInner {
    dispatcher: Dispatcher,
    intents: Arc<IntentResolver>,
    settings: WorkflowSettings,
    runs: DashMap<WorkflowRunId, Arc<RunShared>>,
}

/// Starts and controls workflow runs
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("runs", &self.inner.runs.len())
            .field("settings", &self.inner.settings)
            .finish()
    }
}

impl WorkflowEngine {
    pub fn new(dispatcher: Dispatcher, intents: Arc<IntentResolver>, settings: WorkflowSettings) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                dispatcher,
                intents,
                settings,
                runs: DashMap::new(),
            }),
        }
    }

    /// Validate a definition and start driving it in the background
    pub fn start(&self, definition: WorkflowDefinition) -> Result<WorkflowRunId> {
        definition.validate()?;
        if self.inner.dispatcher.scheduler().is_shut_down() {
            return Err(OrchestratorError::SessionClosed(
                self.inner.dispatcher.scheduler().store().session_id(),
            ));
        }

        let id = WorkflowRunId::new();
        let (state, _) = watch::channel(RunState::Created);
        let (control, control_rx) = mpsc::unbounded_channel();
        let started = now();
        let shared = Arc::new(RunShared {
            id,
            state,
            report: Mutex::new(RunReport {
                run_id: id,
                workflow: definition.name.clone(),
                policy: definition.policy,
                state: RunState::Created,
                cursor: 0,
                steps: Vec::new(),
                reason: None,
                started_at: started,
                updated_at: started,
            }),
            pause_requested: AtomicBool::new(false),
            abort: CancellationToken::new(),
            control,
            events: self.inner.dispatcher.scheduler().events().clone(),
        });
        self.inner.runs.insert(id, shared.clone());

        info!(run_id = %id, workflow = %definition.name, policy = ?definition.policy, steps = definition.steps.len(), "workflow started");
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.drive(shared, definition, control_rx).await });
        Ok(id)
    }

    /// Ask a running run to pause at the next step boundary
    pub fn pause(&self, run_id: WorkflowRunId) -> Result<()> {
        let run = self.run(run_id)?;
        let state = run.state();
        if !matches!(state, RunState::Created | RunState::Running) {
            return Err(invalid(state, RunState::Paused));
        }
        run.pause_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Resume a paused run, optionally inserting a user-directed step
    pub fn resume(&self, run_id: WorkflowRunId, direction: Option<StepSpec>) -> Result<()> {
        let run = self.run(run_id)?;
        let state = run.state();
        if state != RunState::Paused {
            return Err(invalid(state, RunState::Running));
        }
        if let Some(step) = &direction {
            if step.actions.is_empty() {
                return Err(OrchestratorError::Validation(format!("step '{}' has no actions", step.name)));
            }
        }
        // Running before the driver wakes, so a following wait() blocks
        if !run.transition(RunState::Running, None) {
            return Err(invalid(run.state(), RunState::Running));
        }
        run.control
            .send(Control::Resume(direction))
            .map_err(|_| invalid(state, RunState::Running))
    }

    /// Abort a run, cancelling whatever its current step still has in flight
    pub fn abort(&self, run_id: WorkflowRunId) -> Result<()> {
        let run = self.run(run_id)?;
        let state = run.state();
        if state.is_terminal() {
            return Err(invalid(state, RunState::Aborted));
        }
        info!(run_id = %run_id, "abort requested");
        run.abort_now();
        Ok(())
    }

    pub fn status(&self, run_id: WorkflowRunId) -> Result<RunReport> {
        Ok(self.run(run_id)?.snapshot())
    }

    /// Wait until the run is paused or terminal
    pub async fn wait(&self, run_id: WorkflowRunId) -> Result<RunReport> {
        let run = self.run(run_id)?;
        let mut rx = run.state.subscribe();
        // The sender lives in `run`, so the channel cannot close here
        let _ = rx
            .wait_for(|s| s.is_terminal() || *s == RunState::Paused)
            .await;
        Ok(run.snapshot())
    }

    pub fn runs(&self) -> Vec<WorkflowRunId> {
        self.inner.runs.iter().map(|r| *r.key()).collect()
    }

    /// Forget completed, failed and aborted runs. Returns how many were
    /// dropped; their reports are no longer available through `status`.
    pub fn clear_finished(&self) -> usize {
        let before = self.inner.runs.len();
        self.inner.runs.retain(|_, run| !run.state().is_terminal());
        let cleared = before.saturating_sub(self.inner.runs.len());
        debug!(cleared, "cleared finished runs");
        cleared
    }

    /// Abort every run that is not finished yet
    pub fn abort_all(&self) {
        for run in self.inner.runs.iter() {
            if !run.state().is_terminal() {
                run.abort_now();
            }
        }
    }

    fn run(&self, run_id: WorkflowRunId) -> Result<Arc<RunShared>> {
        self.inner
            .runs
            .get(&run_id)
            .map(|r| r.clone())
            .ok_or_else(|| OrchestratorError::WorkflowNotFound(run_id.to_string()))
    }
}

fn invalid(from: RunState, to: RunState) -> OrchestratorError {
    OrchestratorError::InvalidTransition {
        from: from.to_string(),
        to: to.to_string(),
    }
}

/// How a paused run came back
enum Wake {
    Resumed(Option<StepSpec>),
    Aborted,
}

impl EngineInner {
    async fn drive(
        self: Arc<Self>,
        run: Arc<RunShared>,
        definition: WorkflowDefinition,
        mut control: mpsc::UnboundedReceiver<Control>,
    ) {
        if run.abort.is_cancelled() {
            run.transition(RunState::Aborted, Some("aborted before start".into()));
            return;
        }
        run.transition(RunState::Running, None);

        let mut steps = definition.steps.clone();
        let mut cursor = 0usize;
        let mut suggested = 0usize;

        loop {
            run.report.lock().cursor = cursor;

            if run.abort.is_cancelled() {
                run.transition(RunState::Aborted, Some("aborted by caller".into()));
                return;
            }

            if run.pause_requested.swap(false, Ordering::SeqCst) {
                match self.park(&run, &mut control, "paused by caller").await {
                    Wake::Resumed(direction) => {
                        if let Some(step) = direction {
                            steps.insert(cursor, step);
                        }
                        continue;
                    }
                    Wake::Aborted => return,
                }
            }

            if cursor >= steps.len() {
                if definition.policy != AdvancePolicy::Adaptive {
                    run.transition(RunState::Completed, None);
                    return;
                }
                if suggested >= self.settings.max_adaptive_steps {
                    info!(run_id = %run.id, steps = suggested, "adaptive step limit reached");
                    run.transition(RunState::Completed, Some("adaptive step limit reached".into()));
                    return;
                }
                match self.suggest(&definition, suggested).await {
                    Some(step) => {
                        suggested += 1;
                        steps.push(step);
                    }
                    None => match self.park(&run, &mut control, "no confident next step").await {
                        Wake::Resumed(direction) => {
                            if let Some(step) = direction {
                                steps.insert(cursor, step);
                            }
                        }
                        Wake::Aborted => return,
                    },
                }
                continue;
            }

            let step = steps[cursor].clone();
            let outcome = self.run_step(&run, cursor, &step).await;
            let failed = outcome.has_failure();
            let interrupted = outcome.interrupted;
            run.report.lock().steps.push(outcome);

            if interrupted || run.abort.is_cancelled() {
                run.transition(RunState::Aborted, Some(format!("aborted during step '{}'", step.name)));
                return;
            }
            if step.critical && failed {
                warn!(run_id = %run.id, step = %step.name, "critical step failed, aborting run");
                run.transition(RunState::Aborted, Some(format!("critical step '{}' failed", step.name)));
                return;
            }

            cursor = match definition.policy {
                AdvancePolicy::Conditional if !step.branches.is_empty() => {
                    let store = self.dispatcher.scheduler().store();
                    let taken = step
                        .branches
                        .iter()
                        .find(|b| !store.find(&b.precondition).is_empty());
                    match taken.and_then(|b| steps.iter().skip(cursor + 1).position(|s| s.name == b.next)) {
                        Some(offset) => {
                            debug!(run_id = %run.id, from = %step.name, to = %steps[cursor + 1 + offset].name, "branch taken");
                            cursor + 1 + offset
                        }
                        None => {
                            info!(run_id = %run.id, step = %step.name, "no branch matched, run complete");
                            run.report.lock().cursor = cursor + 1;
                            run.transition(RunState::Completed, None);
                            return;
                        }
                    }
                }
                _ => cursor + 1,
            };
        }
    }

    /// Pause and wait for a resume or an abort
    async fn park(&self, run: &RunShared, control: &mut mpsc::UnboundedReceiver<Control>, reason: &str) -> Wake {
        run.transition(RunState::Paused, Some(reason.to_string()));
        let wake = tokio::select! {
            biased;
            _ = run.abort.cancelled() => Wake::Aborted,
            message = control.recv() => match message {
                Some(Control::Resume(direction)) => Wake::Resumed(direction),
                None => Wake::Aborted,
            },
        };
        // resume() has already moved the run back to running
        if let Wake::Aborted = wake {
            run.transition(RunState::Aborted, Some("aborted while paused".into()));
        }
        wake
    }

    /// Confident suggestions become one concurrent step
    async fn suggest(&self, definition: &WorkflowDefinition, index: usize) -> Option<StepSpec> {
        let summary = self
            .dispatcher
            .scheduler()
            .store()
            .snapshot_context(self.intents.settings().context_items);
        let threshold = self.intents.settings().confidence_threshold;
        let candidates = self.intents.suggest_next(&summary, definition.goal.as_deref()).await;

        let mut step = StepSpec::new(format!("suggested-{}", index + 1));
        for candidate in candidates {
            if candidate.confidence >= threshold {
                step = step.with_action(ActionTemplate::new(candidate.action, candidate.parameters));
            } else {
                debug!(action = %candidate.action, confidence = candidate.confidence, "suggestion below threshold");
            }
        }
        (!step.actions.is_empty()).then_some(step)
    }

    async fn run_step(&self, run: &RunShared, index: usize, step: &StepSpec) -> StepOutcome {
        let mut outcome = StepOutcome::begin(index, &step.name);
        let scheduler = self.dispatcher.scheduler();
        let snapshot = self.dispatcher.snapshot();
        let step_ref = StepRef {
            run_id: run.id,
            step_index: index,
            step_name: step.name.clone(),
        };

        let mut pending = Vec::new();
        for template in &step.actions {
            let parameter_sets = match &template.fan_out {
                Some(binding) => template.expand(&scheduler.store().find(&binding.query)),
                None => template.expand(&[]),
            };
            if parameter_sets.is_empty() {
                debug!(run_id = %run.id, step = %step.name, action = %template.action, "fan-out matched nothing");
            }
            for parameters in parameter_sets {
                let draft = ActionRequest::new(template.action.clone(), parameters)
                    .with_origin(format!("workflow step '{}'", step.name))
                    .with_step(step_ref.clone());
                match self.dispatcher.prepare(draft, &snapshot) {
                    Ok(request) => pending.push(self.dispatcher.dispatch(request)),
                    Err(rejected) => outcome.record(&self.dispatcher.reject(&rejected)),
                }
            }
        }

        let ids: Vec<RequestId> = pending.iter().map(|p| p.request_id()).collect();
        info!(run_id = %run.id, step = %step.name, requests = ids.len(), "step dispatched");

        if step.critical && outcome.has_failure() {
            cancel_all(scheduler, &ids);
            outcome.siblings_cancelled = !ids.is_empty();
        }

        let mut in_flight: FuturesUnordered<_> = pending.into_iter().collect();
        loop {
            tokio::select! {
                biased;
                _ = run.abort.cancelled(), if !outcome.interrupted => {
                    outcome.interrupted = true;
                    cancel_all(scheduler, &ids);
                }
                next = in_flight.next() => match next {
                    Some(result) => {
                        let failed = !result.is_success();
                        outcome.record(&result);
                        if failed && step.critical && !outcome.siblings_cancelled {
                            warn!(run_id = %run.id, step = %step.name, request_id = %result.request_id, "critical request failed, cancelling siblings");
                            cancel_all(scheduler, &ids);
                            outcome.siblings_cancelled = true;
                        }
                    }
                    None => break,
                },
            }
        }

        outcome.end()
    }
}

fn cancel_all(scheduler: &crate::scheduler::ExecutionScheduler, ids: &[RequestId]) {
    for id in ids {
        scheduler.cancel(*id);
    }
}
