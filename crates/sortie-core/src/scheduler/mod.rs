//! Execution scheduler
//!
//! Runs [`ActionRequest`]s against their registered modules with bounded
//! concurrency, per-request timeouts, retry of recoverable failures and
//! cooperative cancellation. Every submitted request reaches exactly one
//! terminal [`ActionResult`], which is committed to the knowledge store,
//! broadcast as an event and handed to the submitter, in that order.
//!
//! A module runs in its own task and holds its execution slot for as long as
//! it actually runs. When a request is cancelled or times out the scheduler
//! records the terminal result right away, signals the module and detaches
//! its task; whatever the module produces afterwards is dropped.

pub mod slots;
pub mod state;

pub use slots::{SlotGuard, SlotPool, SlotsClosed};
pub use state::RequestState;

use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::action::{ActionRequest, ActionResult};
use crate::config::SchedulerSettings;
use crate::error::{ErrorClass, ErrorDetail, ModuleError};
use crate::events::EventStream;
use crate::knowledge::KnowledgeStore;
use crate::module::{AssessmentModule, ModuleContext, ModuleOutput, ProgressReporter};
use crate::registry::{ModuleDescriptor, ModuleRegistry};
use crate::types::RequestId;

/// Handle on a submitted request; resolves to its terminal result
#[derive(Debug)]
pub struct PendingResult {
    request: Arc<ActionRequest>,
    rx: oneshot::Receiver<Arc<ActionResult>>,
}

impl PendingResult {
    pub fn request_id(&self) -> RequestId {
        self.request.id
    }

    pub fn request(&self) -> &Arc<ActionRequest> {
        &self.request
    }
}

impl Future for PendingResult {
    type Output = Arc<ActionResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Only reachable when the runtime drops the driver task
            Poll::Ready(Err(_)) => Poll::Ready(Arc::new(ActionResult::cancelled(
                &self.request,
                "scheduler dropped the request",
                Duration::ZERO,
                0,
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Snapshot of the scheduler's queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub queued: usize,
    pub running: usize,
    /// Terminal requests not yet cleared
    pub finished: usize,
    pub waiting_for_slot: usize,
    pub shared_in_use: usize,
    pub shared_pool_size: usize,
}

#[derive(Debug)]
struct Tracked {
    state: RequestState,
    cancel: CancellationToken,
}

enum Attempt {
    Finished(Result<Result<ModuleOutput, ModuleError>, JoinError>),
    Cancelled,
    TimedOut,
}

struct Inner {
    registry: Arc<ModuleRegistry>,
    store: Arc<KnowledgeStore>,
    events: EventStream,
    settings: SchedulerSettings,
    slots: SlotPool,
    requests: DashMap<RequestId, Tracked>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Bounded-concurrency executor for action requests
#[derive(Clone)]
pub struct ExecutionScheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ExecutionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionScheduler")
            .field("session", &self.inner.store.session_id())
            .field("shared_pool_size", &self.inner.slots.shared_size())
            .field("tracked", &self.inner.requests.len())
            .finish()
    }
}

impl ExecutionScheduler {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        store: Arc<KnowledgeStore>,
        events: EventStream,
        settings: SchedulerSettings,
    ) -> Self {
        let slots = SlotPool::new(settings.shared_pool_size);
        Self {
            inner: Arc::new(Inner {
                registry,
                store,
                events,
                settings,
                slots,
                requests: DashMap::new(),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Queue a request for execution.
    ///
    /// Never fails: requests that cannot run (unknown action, module-level
    /// validation failure, scheduler shut down) resolve immediately to a
    /// failed or cancelled result that is committed like any other.
    pub fn submit(&self, request: ActionRequest) -> PendingResult {
        let request = Arc::new(request);
        let (tx, rx) = oneshot::channel();
        let pending = PendingResult {
            request: request.clone(),
            rx,
        };

        let cancel = self.inner.shutdown.child_token();
        self.inner.requests.insert(
            request.id,
            Tracked {
                state: RequestState::Queued,
                cancel: cancel.clone(),
            },
        );

        if self.inner.shutdown.is_cancelled() {
            let result = ActionResult::cancelled(&request, "scheduler is shut down", Duration::ZERO, 0);
            self.inner.finish(request, result, tx);
            return pending;
        }

        let prepared = self
            .inner
            .registry
            .lookup(&request.action)
            .and_then(|descriptor| Ok((descriptor, self.inner.registry.executor(&request.action)?)));

        match prepared {
            Ok((descriptor, executor)) => {
                debug!(request_id = %request.id, action = %request.action, "request queued");
                let inner = self.inner.clone();
                self.inner
                    .tracker
                    .spawn(inner.drive(request, descriptor, executor, cancel, tx));
            }
            Err(e) => {
                let detail = ErrorDetail::new(ErrorClass::Validation, e.to_string());
                let result = ActionResult::failure(&request, detail, Duration::ZERO, 0);
                self.inner.finish(request, result, tx);
            }
        }

        pending
    }

    pub fn submit_batch(&self, requests: impl IntoIterator<Item = ActionRequest>) -> Vec<PendingResult> {
        requests.into_iter().map(|r| self.submit(r)).collect()
    }

    /// Signal cancellation of a queued or running request.
    ///
    /// Returns false when the request is unknown or already terminal.
    pub fn cancel(&self, request_id: RequestId) -> bool {
        match self.inner.requests.get(&request_id) {
            Some(tracked) if !tracked.state.is_terminal() => {
                info!(request_id = %request_id, "cancelling request");
                tracked.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn state(&self, request_id: RequestId) -> Option<RequestState> {
        self.inner.requests.get(&request_id).map(|t| t.state)
    }

    /// Requests not yet terminal
    pub fn in_flight(&self) -> usize {
        self.inner
            .requests
            .iter()
            .filter(|t| !t.state.is_terminal())
            .count()
    }

    /// Queue counts at this instant
    pub fn status(&self) -> SchedulerStatus {
        let mut status = SchedulerStatus {
            waiting_for_slot: self.inner.slots.waiting(),
            shared_in_use: self.inner.slots.shared_in_use(),
            shared_pool_size: self.inner.slots.shared_size(),
            ..SchedulerStatus::default()
        };
        for tracked in self.inner.requests.iter() {
            match tracked.state {
                RequestState::Queued => status.queued += 1,
                RequestState::Running => status.running += 1,
                _ => status.finished += 1,
            }
        }
        status
    }

    /// Forget requests that reached a terminal state; their results stay in
    /// the knowledge store history. Returns how many were dropped.
    pub fn clear_completed(&self) -> usize {
        let before = self.inner.requests.len();
        self.inner.requests.retain(|_, tracked| !tracked.state.is_terminal());
        let cleared = before.saturating_sub(self.inner.requests.len());
        debug!(cleared, "cleared completed requests");
        cleared
    }

    /// Slots currently held by modules of this action
    pub fn active_slots(&self, action: &str) -> usize {
        self.inner.slots.active(action)
    }

    pub fn shared_in_use(&self) -> usize {
        self.inner.slots.shared_in_use()
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<KnowledgeStore> {
        &self.inner.store
    }

    pub fn events(&self) -> &EventStream {
        &self.inner.events
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Cancel everything in flight and wait until every request has its
    /// terminal result recorded. Later submissions resolve as cancelled.
    pub async fn shutdown(&self) {
        info!(session = %self.inner.store.session_id(), in_flight = self.in_flight(), "scheduler shutting down");
        self.inner.shutdown.cancel();
        self.inner.slots.close();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

impl Inner {
    async fn drive(
        self: Arc<Self>,
        request: Arc<ActionRequest>,
        descriptor: Arc<ModuleDescriptor>,
        executor: Arc<dyn AssessmentModule>,
        cancel: CancellationToken,
        tx: oneshot::Sender<Arc<ActionResult>>,
    ) {
        let started = Instant::now();
        let limit = self
            .settings
            .timeout_for(descriptor.duration_hint(self.settings.default_duration_hint()));
        let mut attempts = 0u32;

        let result = loop {
            if let Err(e) = executor.validate(&request.parameters) {
                let detail = ErrorDetail::new(ErrorClass::Validation, e.to_string());
                break ActionResult::failure(&request, detail, started.elapsed(), attempts);
            }

            let slot = tokio::select! {
                biased;
                _ = cancel.cancelled() => break self.cancelled(&request, started, attempts),
                slot = self.slots.acquire(&descriptor, request.priority) => match slot {
                    Ok(slot) => slot,
                    Err(SlotsClosed) => break self.cancelled(&request, started, attempts),
                },
            };

            attempts += 1;
            self.transition(request.id, RequestState::Running);
            debug!(request_id = %request.id, action = %request.action, attempt = attempts, "attempt started");

            let attempt_cancel = cancel.child_token();
            let ctx = ModuleContext {
                request_id: request.id,
                action: request.action.clone(),
                parameters: request.parameters.clone(),
                attempt: attempts,
                cancel: attempt_cancel.clone(),
                progress: ProgressReporter::new(request.id, self.events.clone()),
            };
            let module = executor.clone();
            let mut task = tokio::spawn(async move {
                let _slot = slot;
                module.execute(ctx).await
            });

            // An explicit cancel wins over a module that reacts to it
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Attempt::Cancelled,
                joined = &mut task => Attempt::Finished(joined),
                _ = tokio::time::sleep(limit) => Attempt::TimedOut,
            };

            match outcome {
                Attempt::Finished(Ok(Ok(output))) => {
                    break ActionResult::success(&request, output.entities, output.payload, started.elapsed(), attempts);
                }
                Attempt::Finished(Ok(Err(e))) if e.is_retryable() && attempts <= self.settings.max_retries => {
                    warn!(request_id = %request.id, action = %request.action, attempt = attempts, "recoverable failure, retrying: {}", e);
                }
                Attempt::Finished(Ok(Err(e))) => {
                    if !e.is_retryable() {
                        error!(request_id = %request.id, action = %request.action, "module failed: {}", e);
                    }
                    break ActionResult::failure(&request, ErrorDetail::from(&e), started.elapsed(), attempts);
                }
                Attempt::Finished(Err(e)) => {
                    error!(request_id = %request.id, action = %request.action, "module task aborted: {}", e);
                    let detail = ErrorDetail::new(ErrorClass::Fatal, format!("module task aborted: {}", e));
                    break ActionResult::failure(&request, detail, started.elapsed(), attempts);
                }
                Attempt::Cancelled => {
                    attempt_cancel.cancel();
                    detach(&request, task);
                    break self.cancelled(&request, started, attempts);
                }
                Attempt::TimedOut => {
                    attempt_cancel.cancel();
                    detach(&request, task);
                    if !(descriptor.idempotent && attempts <= self.settings.max_retries) {
                        warn!(request_id = %request.id, action = %request.action, limit_ms = limit.as_millis() as u64, "request timed out");
                        break ActionResult::timed_out(&request, limit, started.elapsed(), attempts);
                    }
                    warn!(request_id = %request.id, action = %request.action, attempt = attempts, "attempt timed out, retrying");
                }
            }

            self.transition(request.id, RequestState::Queued);
            let delay = jittered(self.settings.backoff(attempts));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break self.cancelled(&request, started, attempts),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        self.finish(request, result, tx);
    }

    fn cancelled(&self, request: &ActionRequest, started: Instant, attempts: u32) -> ActionResult {
        let reason = if self.shutdown.is_cancelled() {
            "scheduler shut down"
        } else {
            "cancelled by caller"
        };
        ActionResult::cancelled(request, reason, started.elapsed(), attempts)
    }

    fn transition(&self, request_id: RequestId, next: RequestState) -> bool {
        let Some(mut tracked) = self.requests.get_mut(&request_id) else {
            return false;
        };
        if tracked.state.can_transition_to(next) {
            tracked.state = next;
            true
        } else {
            debug!(request_id = %request_id, from = %tracked.state, to = %next, "ignored request transition");
            false
        }
    }

    /// Record the terminal result: store, then observers, then submitter
    fn finish(&self, request: Arc<ActionRequest>, result: ActionResult, tx: oneshot::Sender<Arc<ActionResult>>) {
        let result = Arc::new(result);
        self.transition(request.id, RequestState::from(result.status));

        match self.store.commit_result(request.clone(), result.clone()) {
            Ok(true) => {}
            Ok(false) => debug!(request_id = %request.id, "result was already committed"),
            Err(e) => warn!(request_id = %request.id, "result not committed: {}", e),
        }
        self.events.action_completed(request.clone(), result.clone());

        info!(
            request_id = %request.id,
            action = %request.action,
            status = %result.status,
            attempts = result.attempts,
            duration_ms = result.duration.as_millis() as u64,
            "action finished"
        );

        // The submitter may have dropped its handle
        let _ = tx.send(result);
    }
}

/// Up to 10% extra so retries of a batch do not land together
fn jittered(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 10;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

/// Let a cancelled or timed-out module run to completion on its own
fn detach(request: &ActionRequest, task: JoinHandle<Result<ModuleOutput, ModuleError>>) {
    let request_id = request.id;
    let action = request.action.clone();
    tokio::spawn(async move {
        match task.await {
            Ok(Ok(output)) => warn!(
                request_id = %request_id,
                action = %action,
                entities = output.entities.len(),
                "late module result dropped"
            ),
            Ok(Err(e)) => debug!(request_id = %request_id, action = %action, "detached module stopped: {}", e),
            Err(e) => debug!(request_id = %request_id, action = %action, "detached module task aborted: {}", e),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Priority, ResultStatus};
    use crate::events::OrchestratorEvent;
    use crate::knowledge::{AttributeFilter, Entity, EntityKind};
    use crate::registry::ConcurrencyClass;
    use crate::types::{ParameterMap, SessionId};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    struct FakeScan {
        delay: Duration,
        address: String,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl FakeScan {
        fn new(delay: Duration, address: &str) -> Self {
            Self {
                delay,
                address: address.to_string(),
                running: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl AssessmentModule for FakeScan {
        async fn execute(&self, ctx: ModuleContext) -> Result<ModuleOutput, ModuleError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            ctx.progress.report(Some(0.5), "scanning");
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(ModuleOutput::new().with_entity(Entity::host(self.address.clone()).with_attribute("up", true)))
        }
    }

    struct Flaky {
        failures: AtomicU32,
        fatal: bool,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl AssessmentModule for Flaky {
        fn validate(&self, parameters: &ParameterMap) -> Result<(), ModuleError> {
            if parameters.contains_key("forbidden") {
                return Err(ModuleError::Fatal("forbidden parameter".into()));
            }
            Ok(())
        }

        async fn execute(&self, _ctx: ModuleContext) -> Result<ModuleOutput, ModuleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(if self.fatal {
                    ModuleError::Fatal("crashed".into())
                } else {
                    ModuleError::Recoverable("connection reset".into())
                });
            }
            Ok(ModuleOutput::new().with_payload(serde_json::json!({"ok": true})))
        }
    }

    struct Emits(Vec<Entity>);

    #[async_trait]
    impl AssessmentModule for Emits {
        async fn execute(&self, _ctx: ModuleContext) -> Result<ModuleOutput, ModuleError> {
            Ok(self.0.iter().cloned().fold(ModuleOutput::new(), ModuleOutput::with_entity))
        }
    }

    /// Hangs on its first attempt, answers on later ones
    struct StallsOnce {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl AssessmentModule for StallsOnce {
        async fn execute(&self, _ctx: ModuleContext) -> Result<ModuleOutput, ModuleError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(ModuleOutput::new())
        }
    }

    /// Records the `label` parameter of each run in start order
    struct Recorder {
        order: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl AssessmentModule for Recorder {
        async fn execute(&self, ctx: ModuleContext) -> Result<ModuleOutput, ModuleError> {
            let label = ctx.parameters.get("label").and_then(|v| v.as_str()).unwrap_or_default();
            self.order.lock().push(label.to_string());
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(ModuleOutput::new())
        }
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            shared_pool_size: 2,
            max_retries: 2,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            ..SchedulerSettings::default()
        }
    }

    fn scheduler(modules: Vec<(ModuleDescriptor, Arc<dyn AssessmentModule>)>) -> ExecutionScheduler {
        let mut builder = ModuleRegistry::builder();
        for (descriptor, module) in modules {
            builder.register(descriptor, module).unwrap();
        }
        let store = Arc::new(KnowledgeStore::new(SessionId::new()));
        ExecutionScheduler::new(Arc::new(builder.build()), store, EventStream::default(), settings())
    }

    fn bind(descriptor: ModuleDescriptor, module: Arc<dyn AssessmentModule>) -> (ModuleDescriptor, Arc<dyn AssessmentModule>) {
        (descriptor, module)
    }

    fn flaky(failures: u32, fatal: bool) -> (Arc<Flaky>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let module = Arc::new(Flaky {
            failures: AtomicU32::new(failures),
            fatal,
            calls: calls.clone(),
        });
        (module, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn success_is_committed_then_broadcast() {
        let scan = Arc::new(FakeScan::new(Duration::from_secs(1), "10.0.0.5"));
        let scheduler = scheduler(vec![bind(ModuleDescriptor::new("scan"), scan)]);
        let mut events = scheduler.events().subscribe();

        let pending = scheduler.submit(ActionRequest::new("scan", ParameterMap::new()));
        let id = pending.request_id();
        let result = pending.await;

        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.attempts, 1);
        assert_eq!(scheduler.state(id), Some(RequestState::Succeeded));
        assert_eq!(scheduler.store().query(Some(EntityKind::Host), &AttributeFilter::any()).len(), 1);

        let mut completed = false;
        while let Ok(event) = events.try_recv() {
            if let OrchestratorEvent::ActionCompleted { result, .. } = event {
                assert_eq!(result.request_id, id);
                completed = true;
            }
        }
        assert!(completed);
    }

    #[tokio::test(start_paused = true)]
    async fn recoverable_failures_are_retried() {
        let (module, calls) = flaky(2, false);
        let scheduler = scheduler(vec![bind(ModuleDescriptor::new("brute_force"), module)]);

        let result = scheduler.submit(ActionRequest::new("brute_force", ParameterMap::new())).await;
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.store().history_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let (module, calls) = flaky(10, false);
        let scheduler = scheduler(vec![bind(ModuleDescriptor::new("brute_force"), module)]);

        let result = scheduler.submit(ActionRequest::new("brute_force", ParameterMap::new())).await;
        assert_eq!(result.status, ResultStatus::Failure);
        assert_eq!(result.error_class(), Some(ErrorClass::Recoverable));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failures_are_not_retried() {
        let (module, calls) = flaky(1, true);
        let scheduler = scheduler(vec![bind(ModuleDescriptor::new("exploit"), module)]);

        let result = scheduler.submit(ActionRequest::new("exploit", ParameterMap::new())).await;
        assert_eq!(result.error_class(), Some(ErrorClass::Fatal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn module_validation_failure_never_executes() {
        let (module, calls) = flaky(0, false);
        let scheduler = scheduler(vec![bind(ModuleDescriptor::new("exploit"), module)]);

        let mut parameters = ParameterMap::new();
        parameters.insert("forbidden".into(), serde_json::json!(true));
        let result = scheduler.submit(ActionRequest::new("exploit", parameters)).await;

        assert_eq!(result.error_class(), Some(ErrorClass::Validation));
        assert_eq!(result.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_action_fails_immediately() {
        let scheduler = scheduler(vec![]);
        let result = scheduler.submit(ActionRequest::new("teleport", ParameterMap::new())).await;
        assert_eq!(result.error_class(), Some(ErrorClass::Validation));
        assert_eq!(scheduler.store().history_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_idempotent_timeout_is_terminal() {
        let scan = Arc::new(FakeScan::new(Duration::from_secs(60), "10.0.0.5"));
        let descriptor = ModuleDescriptor::new("exploit")
            .with_duration_hint(Duration::from_secs(1))
            .non_idempotent();
        let scheduler = scheduler(vec![bind(descriptor, scan)]);

        let result = scheduler.submit(ActionRequest::new("exploit", ParameterMap::new())).await;
        assert_eq!(result.status, ResultStatus::Timeout);
        assert_eq!(result.attempts, 1);
        assert!(result.duration >= Duration::from_secs(3));
        assert!(result.duration < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn late_result_after_cancel_is_dropped() {
        let scan = Arc::new(FakeScan::new(Duration::from_secs(5), "10.0.0.9"));
        let scheduler = scheduler(vec![bind(ModuleDescriptor::new("scan"), scan)]);

        let pending = scheduler.submit(ActionRequest::new("scan", ParameterMap::new()));
        let id = pending.request_id();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(scheduler.state(id), Some(RequestState::Running));

        assert!(scheduler.cancel(id));
        let result = pending.await;
        assert_eq!(result.status, ResultStatus::Cancelled);
        assert!(!scheduler.cancel(id));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(scheduler.store().entity_count(), 0);
        assert_eq!(scheduler.store().history_len(), 1);
        assert_eq!(scheduler.active_slots("scan"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exclusive_module_never_overlaps() {
        let scan = Arc::new(FakeScan::new(Duration::from_secs(2), "10.0.0.5"));
        let peak = scan.peak.clone();
        let descriptor = ModuleDescriptor::new("exploit").with_concurrency(ConcurrencyClass::Exclusive);
        let scheduler = scheduler(vec![bind(descriptor, scan)]);

        let pending = scheduler.submit_batch((0..4).map(|_| ActionRequest::new("exploit", ParameterMap::new())));
        let results = futures::future::join_all(pending).await;

        assert!(results.iter().all(|r| r.is_success()));
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shared_pool_bounds_parallelism() {
        let scan = Arc::new(FakeScan::new(Duration::from_secs(2), "10.0.0.5"));
        let peak = scan.peak.clone();
        let scheduler = scheduler(vec![bind(ModuleDescriptor::new("scan"), scan)]);

        let pending = scheduler.submit_batch((0..6).map(|_| ActionRequest::new("scan", ParameterMap::new())));
        let results = futures::future::join_all(pending).await;

        assert_eq!(results.len(), 6);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_outstanding_work() {
        let scan = Arc::new(FakeScan::new(Duration::from_secs(30), "10.0.0.5"));
        let scheduler = scheduler(vec![bind(ModuleDescriptor::new("scan"), scan)]);

        let pending = scheduler.submit_batch((0..4).map(|_| ActionRequest::new("scan", ParameterMap::new())));
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.shutdown().await;

        for result in futures::future::join_all(pending).await {
            assert_eq!(result.status, ResultStatus::Cancelled);
        }
        assert_eq!(scheduler.in_flight(), 0);

        let late = scheduler.submit(ActionRequest::new("scan", ParameterMap::new())).await;
        assert_eq!(late.status, ResultStatus::Cancelled);
    }

    #[tokio::test]
    async fn invalid_entity_still_leaves_a_history_record() {
        let module = Arc::new(Emits(vec![Entity::new(EntityKind::Host, ""), Entity::host("10.0.0.8")]));
        let scheduler = scheduler(vec![bind(ModuleDescriptor::new("scan"), module)]);

        let result = scheduler.submit(ActionRequest::new("scan", ParameterMap::new())).await;
        assert!(result.is_success());
        assert_eq!(scheduler.store().history_len(), 1);
        assert!(scheduler.store().history_for(result.request_id).is_some());
        assert_eq!(scheduler.store().entity_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idempotent_timeout_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let module = Arc::new(StallsOnce { calls: calls.clone() });
        let descriptor = ModuleDescriptor::new("scan").with_duration_hint(Duration::from_secs(1));
        let scheduler = scheduler(vec![bind(descriptor, module)]);

        let result = scheduler.submit(ActionRequest::new("scan", ParameterMap::new())).await;
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(result.duration >= Duration::from_secs(3));
        assert!(result.duration < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_waiting_for_a_slot() {
        let scan = Arc::new(FakeScan::new(Duration::from_secs(30), "10.0.0.5"));
        let descriptor = ModuleDescriptor::new("exploit").with_concurrency(ConcurrencyClass::Exclusive);
        let scheduler = scheduler(vec![bind(descriptor, scan)]);

        let first = scheduler.submit(ActionRequest::new("exploit", ParameterMap::new()));
        let second = scheduler.submit(ActionRequest::new("exploit", ParameterMap::new()));
        let second_id = second.request_id();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.state(first.request_id()), Some(RequestState::Running));
        assert_eq!(scheduler.state(second_id), Some(RequestState::Queued));
        assert_eq!(scheduler.status().waiting_for_slot, 1);

        assert!(scheduler.cancel(second_id));
        let result = second.await;
        assert_eq!(result.status, ResultStatus::Cancelled);
        assert_eq!(result.attempts, 0);
        assert_eq!(scheduler.status().waiting_for_slot, 0);
        assert_eq!(scheduler.active_slots("exploit"), 1);

        assert!(first.await.is_success());
        assert_eq!(scheduler.active_slots("exploit"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff() {
        let (module, calls) = flaky(10, false);
        let scheduler = scheduler(vec![bind(ModuleDescriptor::new("brute_force"), module)]);

        let pending = scheduler.submit(ActionRequest::new("brute_force", ParameterMap::new()));
        let id = pending.request_id();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.state(id), Some(RequestState::Queued));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(scheduler.cancel(id));
        let result = pending.await;
        assert_eq!(result.status, ResultStatus::Cancelled);
        assert_eq!(result.attempts, 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.store().history_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn higher_priority_requests_take_freed_slots_first() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let module = Arc::new(Recorder { order: order.clone() });
        let descriptor = ModuleDescriptor::new("exploit").with_concurrency(ConcurrencyClass::Exclusive);
        let scheduler = scheduler(vec![bind(descriptor, module)]);

        let labelled = |label: &str, priority: Priority| {
            let mut parameters = ParameterMap::new();
            parameters.insert("label".into(), serde_json::json!(label));
            ActionRequest::new("exploit", parameters).with_priority(priority)
        };

        let mut pending = vec![scheduler.submit(labelled("first", Priority::Low))];
        tokio::time::sleep(Duration::from_millis(10)).await;
        for (label, priority) in [
            ("low", Priority::Low),
            ("medium", Priority::Medium),
            ("critical", Priority::Critical),
            ("high", Priority::High),
        ] {
            pending.push(scheduler.submit(labelled(label, priority)));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(scheduler.status().waiting_for_slot, 4);

        let results = futures::future::join_all(pending).await;
        assert!(results.iter().all(|r| r.is_success()));
        assert_eq!(*order.lock(), vec!["first", "critical", "high", "medium", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_completed_forgets_only_terminal_requests() {
        let scan = Arc::new(FakeScan::new(Duration::from_secs(5), "10.0.0.5"));
        let scheduler = scheduler(vec![bind(ModuleDescriptor::new("scan"), scan)]);

        let done = scheduler.submit(ActionRequest::new("scan", ParameterMap::new())).await;
        let running = scheduler.submit(ActionRequest::new("scan", ParameterMap::new()));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let status = scheduler.status();
        assert_eq!((status.queued, status.running, status.finished), (0, 1, 1));
        assert_eq!(status.shared_in_use, 1);

        assert_eq!(scheduler.clear_completed(), 1);
        assert_eq!(scheduler.state(done.request_id), None);
        assert_eq!(scheduler.state(running.request_id()), Some(RequestState::Running));
        assert_eq!(scheduler.store().history_len(), 1);

        assert!(running.await.is_success());
        assert_eq!(scheduler.clear_completed(), 1);
        assert_eq!(
            scheduler.status(),
            SchedulerStatus {
                shared_pool_size: 2,
                ..SchedulerStatus::default()
            }
        );
    }
}
