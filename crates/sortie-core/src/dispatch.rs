//! Pre-dispatch pipeline shared by ad-hoc commands and workflow steps
//!
//! dependency resolution → scope check → scheduler. A request that fails
//! before reaching the scheduler still gets a failed result committed to the
//! knowledge store, so the assessment history stays complete.

use std::sync::Arc;
use std::time::Duration;

use crate::action::{ActionRequest, ActionResult};
use crate::error::{ErrorDetail, OrchestratorError};
use crate::knowledge::ContextSummary;
use crate::policy::{check_request, ScopePolicy};
use crate::resolver::{resolve_with, DependencyResolver};
use crate::scheduler::{ExecutionScheduler, PendingResult};

/// A request stopped before dispatch, with the reason
#[derive(Debug)]
pub struct Rejected {
    pub request: ActionRequest,
    pub error: OrchestratorError,
}

#[derive(Clone)]
pub struct Dispatcher {
    scheduler: ExecutionScheduler,
    resolver: DependencyResolver,
    policy: Arc<dyn ScopePolicy>,
    snapshot_items: usize,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("policy", &self.policy)
            .field("snapshot_items", &self.snapshot_items)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(scheduler: ExecutionScheduler, policy: Arc<dyn ScopePolicy>, snapshot_items: usize) -> Self {
        let resolver = DependencyResolver::new(scheduler.registry().clone());
        Self {
            scheduler,
            resolver,
            policy,
            snapshot_items,
        }
    }

    pub fn scheduler(&self) -> &ExecutionScheduler {
        &self.scheduler
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    pub fn policy(&self) -> &Arc<dyn ScopePolicy> {
        &self.policy
    }

    /// Fresh context snapshot for dependency resolution
    pub fn snapshot(&self) -> ContextSummary {
        self.scheduler.store().snapshot_context(self.snapshot_items)
    }

    /// Fill the draft's parameters from the snapshot and check its targets.
    ///
    /// The returned request keeps the draft's id, origin and step link.
    pub fn prepare(&self, draft: ActionRequest, snapshot: &ContextSummary) -> Result<ActionRequest, Box<Rejected>> {
        let descriptor = match self.resolver.registry().lookup(&draft.action) {
            Ok(descriptor) => descriptor,
            Err(error) => return Err(Box::new(Rejected { request: draft, error })),
        };

        let resolved = match resolve_with(&descriptor, &draft.parameters, snapshot) {
            Ok(resolved) => resolved,
            Err(error) => return Err(Box::new(Rejected { request: draft, error })),
        };
        for filled in resolved.inferred() {
            tracing::debug!(request_id = %draft.id, action = %draft.action, parameter = %filled.name, value = %filled.value, "parameter inferred");
        }

        let request = ActionRequest {
            parameters: resolved.parameters,
            ..draft
        };
        if let Err(error) = check_request(self.policy.as_ref(), &descriptor, &request) {
            return Err(Box::new(Rejected { request, error }));
        }
        Ok(request)
    }

    pub fn dispatch(&self, request: ActionRequest) -> PendingResult {
        self.scheduler.submit(request)
    }

    /// Record a pre-dispatch failure as the request's terminal result
    pub fn reject(&self, rejected: &Rejected) -> Arc<ActionResult> {
        let Rejected { request, error } = rejected;
        let detail = ErrorDetail::new(error.class(), error.to_string());
        let request = Arc::new(request.clone());
        let result = Arc::new(ActionResult::failure(&request, detail, Duration::ZERO, 0));

        tracing::warn!(request_id = %request.id, action = %request.action, class = %error.class(), "request rejected before dispatch: {}", error);
        if let Err(e) = self.scheduler.store().commit_result(request.clone(), result.clone()) {
            tracing::warn!(request_id = %request.id, "rejection not committed: {}", e);
        }
        self.scheduler.events().action_completed(request, result.clone());
        result
    }
}
