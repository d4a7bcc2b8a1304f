//! Sortie Core - orchestration engine for natural-language driven security assessments
//!
//! A user states an intent in free text; the core resolves it to structured
//! module invocations, fills missing parameters from earlier findings, runs
//! the invocations under concurrency, timeout, retry and cancellation policy,
//! folds the results into a shared knowledge store and uses that knowledge to
//! pick the next step.
//!
//! # Architecture
//!
//! Leaf first:
//!
//! 1. **Knowledge Store** (`knowledge`): deduplicated entities, action history, utterances
//! 2. **Module Registry** (`registry`): frozen action → descriptor/executor map
//! 3. **Dependency Resolver** (`resolver`): fills parameters from the context snapshot
//! 4. **Intent Resolver** (`intent`): oracle first, deterministic rules as fallback
//! 5. **Execution Scheduler** (`scheduler`): slots, timeouts, retries, cancellation
//! 6. **Workflow Engine** (`workflow`): sequential, conditional and adaptive runs
//!
//! A [`Session`] wires them together with a scope policy and an observer
//! [`EventStream`]. Concrete modules and oracles live outside this crate and
//! plug in through [`AssessmentModule`] and [`ReasoningOracle`].
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use sortie_core::config::IntentSettings;
//! use sortie_core::intent::IntentResolver;
//! use sortie_core::registry::{ModuleDescriptor, ModuleRegistry, ParameterKind, ParameterSpec};
//!
//! let mut builder = ModuleRegistry::builder();
//! builder.register_descriptor(
//!     ModuleDescriptor::new("scan")
//!         .with_capability("network")
//!         .with_parameter("target", ParameterSpec::required(ParameterKind::Target)),
//! )?;
//! let registry = builder.build();
//!
//! let intents = IntentResolver::new(None, Arc::new(registry.catalog()), IntentSettings::default());
//! let resolution = intents.resolve_offline("scan 10.0.0.0/24")?;
//! assert_eq!(resolution.stages[0][0].action, "scan");
//! # Ok::<(), sortie_core::OrchestratorError>(())
//! ```

#![deny(unsafe_code)]
#![warn(rust_2018_idioms, clippy::all)]

pub mod action;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod intent;
pub mod knowledge;
pub mod module;
pub mod policy;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod session;
pub mod types;
pub mod workflow;

// Re-export commonly used types for convenience
pub use action::{ActionRequest, ActionResult, Priority, ResultStatus, StepRef};
pub use config::CoreConfig;
pub use error::{ErrorClass, ErrorDetail, ModuleError, OracleError, OrchestratorError, Result, ResultExt};
pub use events::{EventStream, OrchestratorEvent};
pub use intent::{Candidate, IntentResolution, IntentResolver, OraclePrompt, ReasoningOracle};
pub use knowledge::{ContextSummary, Entity, EntityId, EntityKind, EntityQuery, KnowledgeStore};
pub use module::{AssessmentModule, ModuleContext, ModuleOutput};
pub use policy::{AuthorizedScope, ScopePolicy};
pub use registry::{ConcurrencyClass, ModuleDescriptor, ModuleRegistry, ParameterKind, ParameterSpec};
pub use resolver::{DependencyResolver, ResolvedAction};
pub use scheduler::{ExecutionScheduler, PendingResult, RequestState, SchedulerStatus};
pub use session::{CommandOptions, CommandOutcome, Session, SessionBuilder};
pub use types::{ParameterMap, RequestId, SessionId, SessionStatus, Timestamp, WorkflowRunId};
pub use workflow::{AdvancePolicy, RunReport, RunState, StepSpec, WorkflowDefinition, WorkflowEngine};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
