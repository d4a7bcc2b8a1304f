//! Assessment sessions
//!
//! A [`Session`] is the composition root: it owns one knowledge store, one
//! scheduler and one workflow engine, and wires them to the registry, the
//! oracle and the scope policy handed to its [`SessionBuilder`]. Nothing in
//! the core is global; two sessions share only what the caller shares.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::action::{ActionRequest, ActionResult};
use crate::config::CoreConfig;
use crate::dispatch::Dispatcher;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventStream, OrchestratorEvent, DEFAULT_EVENT_CAPACITY};
use crate::intent::{IntentResolution, IntentResolver, ReasoningOracle};
use crate::knowledge::KnowledgeStore;
use crate::policy::{AuthorizedScope, ScopePolicy};
use crate::registry::ModuleRegistry;
use crate::scheduler::ExecutionScheduler;
use crate::types::{now, ParameterMap, SessionId, SessionStatus, Timestamp};
use crate::workflow::{RunReport, WorkflowDefinition, WorkflowEngine};

/// Knobs for one command
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandOptions {
    /// Dispatch even when the resolution asks for confirmation
    pub auto_confirm: bool,
}

impl CommandOptions {
    pub fn confirmed() -> Self {
        Self { auto_confirm: true }
    }
}

/// What a command led to
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// Nothing ran; hand the resolution back to [`Session::confirm`] once
    /// the user agrees
    NeedsConfirmation { resolution: IntentResolution },

    /// A single action ran
    Executed {
        resolution: IntentResolution,
        result: ActionResult,
    },

    /// Several steps ran as a workflow (until completion, abort or pause)
    Workflow {
        resolution: IntentResolution,
        report: RunReport,
    },
}

impl CommandOutcome {
    pub fn resolution(&self) -> &IntentResolution {
        match self {
            CommandOutcome::NeedsConfirmation { resolution }
            | CommandOutcome::Executed { resolution, .. }
            | CommandOutcome::Workflow { resolution, .. } => resolution,
        }
    }
}

/// Wires collaborators into a [`Session`]
#[derive(Default)]
pub struct SessionBuilder {
    config: CoreConfig,
    registry: Option<Arc<ModuleRegistry>>,
    oracle: Option<Arc<dyn ReasoningOracle>>,
    scope: AuthorizedScope,
    policy: Option<Arc<dyn ScopePolicy>>,
    events: Option<EventStream>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_registry(mut self, registry: Arc<ModuleRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn ReasoningOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_scope(mut self, scope: AuthorizedScope) -> Self {
        self.scope = scope;
        self
    }

    /// Consult this policy instead of the authorized scope
    pub fn with_policy(mut self, policy: Arc<dyn ScopePolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Share an observer stream across sessions
    pub fn with_events(mut self, events: EventStream) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<Session> {
        self.config.validate()?;
        let registry = self
            .registry
            .ok_or_else(|| OrchestratorError::Config("session needs a module registry".into()))?;

        let id = SessionId::new();
        let events = self
            .events
            .unwrap_or_else(|| EventStream::new(DEFAULT_EVENT_CAPACITY));
        let store = Arc::new(KnowledgeStore::new(id));
        let scheduler = ExecutionScheduler::new(
            registry.clone(),
            store.clone(),
            events.clone(),
            self.config.scheduler.clone(),
        );

        let policy: Arc<dyn ScopePolicy> = match self.policy {
            Some(policy) => policy,
            None => Arc::new(self.scope.clone()),
        };
        let dispatcher = Dispatcher::new(
            scheduler.clone(),
            policy,
            self.config.knowledge.resolver_snapshot_items,
        );

        let intents = Arc::new(IntentResolver::new(
            self.oracle,
            Arc::new(registry.catalog()),
            self.config.intent.clone(),
        ));
        let workflows = WorkflowEngine::new(dispatcher.clone(), intents.clone(), self.config.workflow.clone());

        info!(session_id = %id, modules = registry.len(), oracle = intents.has_oracle(), "session created");
        Ok(Session {
            id,
            created_at: now(),
            scope: self.scope,
            status: RwLock::new(SessionStatus::Active),
            config: self.config,
            registry,
            store,
            scheduler,
            dispatcher,
            intents,
            workflows,
            events,
        })
    }
}

/// One assessment
pub struct Session {
    id: SessionId,
    created_at: Timestamp,
    scope: AuthorizedScope,
    status: RwLock<SessionStatus>,
    config: CoreConfig,
    registry: Arc<ModuleRegistry>,
    store: Arc<KnowledgeStore>,
    scheduler: ExecutionScheduler,
    dispatcher: Dispatcher,
    intents: Arc<IntentResolver>,
    workflows: WorkflowEngine,
    events: EventStream,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("scope", &self.scope)
            .field("entities", &self.store.entity_count())
            .finish()
    }
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.read()
    }

    pub fn scope(&self) -> &AuthorizedScope {
        &self.scope
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<KnowledgeStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &ExecutionScheduler {
        &self.scheduler
    }

    pub fn intents(&self) -> &IntentResolver {
        &self.intents
    }

    pub fn workflows(&self) -> &WorkflowEngine {
        &self.workflows
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    /// Resolve a free-text command and run it.
    ///
    /// Low-confidence or ambiguous resolutions come back as
    /// [`CommandOutcome::NeedsConfirmation`] unless `auto_confirm` is set.
    pub async fn execute_command(&self, text: &str, options: CommandOptions) -> Result<CommandOutcome> {
        self.ensure_accepting()?;
        self.store.record_utterance(text)?;

        let summary = self.dispatcher.snapshot();
        let resolution = self.intents.resolve(text, &summary).await?;
        info!(
            session_id = %self.id,
            source = %resolution.source,
            candidates = resolution.candidates().count(),
            follow_ups = resolution.follow_ups.len(),
            "command resolved"
        );

        if resolution.requires_confirmation && !options.auto_confirm {
            return Ok(CommandOutcome::NeedsConfirmation { resolution });
        }
        self.run_resolution(resolution).await
    }

    /// Dispatch a resolution the user has confirmed
    pub async fn confirm(&self, resolution: IntentResolution) -> Result<CommandOutcome> {
        self.ensure_accepting()?;
        self.run_resolution(resolution).await
    }

    /// Run one structured action, bypassing intent resolution
    pub async fn execute_action(&self, action: &str, parameters: ParameterMap) -> Result<ActionResult> {
        self.ensure_accepting()?;
        self.run_single(ActionRequest::new(action, parameters)).await
    }

    pub fn start_workflow(&self, definition: WorkflowDefinition) -> Result<crate::types::WorkflowRunId> {
        self.ensure_accepting()?;
        self.workflows.start(definition)
    }

    pub fn pause(&self) -> Result<()> {
        self.set_status(SessionStatus::Paused)
    }

    pub fn resume(&self) -> Result<()> {
        self.set_status(SessionStatus::Active)
    }

    /// Close the session: abort runs, cancel everything in flight, then
    /// seal the store. Terminal.
    pub async fn close(&self) -> Result<()> {
        self.set_status(SessionStatus::Closed)?;
        self.workflows.abort_all();
        self.scheduler.shutdown().await;
        self.store.seal();
        info!(session_id = %self.id, history = self.store.history_len(), entities = self.store.entity_count(), "session closed");
        Ok(())
    }

    async fn run_resolution(&self, resolution: IntentResolution) -> Result<CommandOutcome> {
        if resolution.is_empty() {
            return Err(OrchestratorError::IntentUnresolved {
                text: resolution.text.clone(),
                reason: "resolution has no actions".into(),
            });
        }

        if resolution.is_single_action() {
            let Some(candidate) = resolution.candidates().next() else {
                return Err(OrchestratorError::IntentUnresolved {
                    text: resolution.text.clone(),
                    reason: "resolution has no actions".into(),
                });
            };
            let draft = ActionRequest::new(candidate.action.clone(), candidate.parameters.clone())
                .with_origin(resolution.text.clone());
            let result = self.run_single(draft).await?;
            return Ok(CommandOutcome::Executed { resolution, result });
        }

        let run = self
            .workflows
            .start(WorkflowDefinition::from_resolution(&resolution))?;
        let report = self.workflows.wait(run).await?;
        Ok(CommandOutcome::Workflow { resolution, report })
    }

    async fn run_single(&self, draft: ActionRequest) -> Result<ActionResult> {
        let snapshot = self.dispatcher.snapshot();
        match self.dispatcher.prepare(draft, &snapshot) {
            Ok(request) => {
                let result = self.dispatcher.dispatch(request).await;
                Ok(result.as_ref().clone())
            }
            Err(rejected) => {
                self.dispatcher.reject(&rejected);
                Err(rejected.error)
            }
        }
    }

    fn ensure_accepting(&self) -> Result<()> {
        match self.status() {
            SessionStatus::Active => Ok(()),
            SessionStatus::Paused => Err(OrchestratorError::SessionPaused(self.id)),
            SessionStatus::Closed => Err(OrchestratorError::SessionClosed(self.id)),
        }
    }

    fn set_status(&self, next: SessionStatus) -> Result<()> {
        let mut status = self.status.write();
        if status.is_terminal() {
            return Err(OrchestratorError::SessionClosed(self.id));
        }
        if !status.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition {
                from: status.to_string(),
                to: next.to_string(),
            });
        }
        info!(session_id = %self.id, from = %*status, to = %next, "session status");
        *status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ResultStatus;
    use crate::error::ModuleError;
    use crate::knowledge::Entity;
    use crate::module::{AssessmentModule, ModuleContext, ModuleOutput};
    use crate::registry::{ModuleDescriptor, ParameterKind, ParameterSpec, EntitySource};
    use crate::knowledge::EntityKind;
    use async_trait::async_trait;

    struct Ping;

    #[async_trait]
    impl AssessmentModule for Ping {
        async fn execute(&self, ctx: ModuleContext) -> std::result::Result<ModuleOutput, ModuleError> {
            let target = ctx.parameter_str("target").unwrap_or_default().to_string();
            Ok(ModuleOutput::new().with_entity(Entity::host(target).with_attribute("alive", true)))
        }
    }

    fn session() -> Session {
        let mut builder = ModuleRegistry::builder();
        builder
            .register(
                ModuleDescriptor::new("scan").with_capability("network").with_parameter(
                    "target",
                    ParameterSpec::required(ParameterKind::Target)
                        .from_entities(EntitySource::new(EntityKind::Host).attribute("address")),
                ),
                Arc::new(Ping),
            )
            .unwrap();
        Session::builder()
            .with_registry(Arc::new(builder.build()))
            .with_scope(AuthorizedScope::from_specifiers(["10.0.0.0/24"]).unwrap())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn explicit_command_runs_directly() {
        let session = session();
        let outcome = session
            .execute_command("scan 10.0.0.5", CommandOptions::default())
            .await
            .unwrap();

        match outcome {
            CommandOutcome::Executed { result, .. } => assert_eq!(result.status, ResultStatus::Success),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(session.store().entity_count(), 1);
        assert_eq!(session.store().snapshot_context(4).utterances, vec!["scan 10.0.0.5".to_string()]);
    }

    #[tokio::test]
    async fn vague_command_waits_for_confirmation() {
        let session = session();
        session.store().upsert_entity(Entity::host("10.0.0.9")).unwrap();

        let outcome = session.execute_command("scan", CommandOptions::default()).await.unwrap();
        let CommandOutcome::NeedsConfirmation { resolution } = outcome else {
            panic!("expected a confirmation request");
        };
        assert_eq!(session.store().history_len(), 0);

        let outcome = session.confirm(resolution).await.unwrap();
        let CommandOutcome::Executed { result, .. } = outcome else {
            panic!("expected execution");
        };
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn out_of_scope_command_is_refused_and_recorded() {
        let session = session();
        let err = session
            .execute_command("scan 192.0.2.10", CommandOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ScopeViolation { .. }));
        assert_eq!(session.store().history_len(), 1);
    }

    #[tokio::test]
    async fn paused_and_closed_sessions_refuse_work() {
        let session = session();
        session.pause().unwrap();
        assert!(matches!(
            session.execute_command("scan 10.0.0.5", CommandOptions::default()).await,
            Err(OrchestratorError::SessionPaused(_))
        ));
        session.resume().unwrap();

        session.close().await.unwrap();
        assert_eq!(session.status(), SessionStatus::Closed);
        assert!(matches!(
            session.execute_action("scan", ParameterMap::new()).await,
            Err(OrchestratorError::SessionClosed(_))
        ));
        assert!(matches!(session.resume(), Err(OrchestratorError::SessionClosed(_))));
        assert!(session.store().upsert_entity(Entity::host("10.0.0.1")).is_err());
    }
}
