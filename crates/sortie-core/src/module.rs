//! Executable module contract
//!
//! Concrete modules (scanners, brute forcers, exploit runners) live outside
//! the core. They implement [`AssessmentModule`] and are bound to a
//! descriptor in the [`ModuleRegistry`](crate::registry::ModuleRegistry).
//! Cancellation is cooperative: the module receives a
//! [`CancellationToken`] and is expected to stop when it fires. The core
//! never waits for it to do so.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ModuleError;
use crate::events::EventStream;
use crate::knowledge::Entity;
use crate::types::{ParameterMap, RequestId};

/// Everything a module receives for one attempt
#[derive(Debug, Clone)]
pub struct ModuleContext {
    pub request_id: RequestId,
    pub action: String,
    pub parameters: ParameterMap,

    /// 1-based attempt number
    pub attempt: u32,

    /// Fires on explicit cancel, timeout or session shutdown
    pub cancel: CancellationToken,

    pub progress: ProgressReporter,
}

impl ModuleContext {
    pub fn parameter(&self, name: &str) -> Option<&serde_json::Value> {
        self.parameters.get(name)
    }

    pub fn parameter_str(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).and_then(|v| v.as_str())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Progress callback handed to modules; reports are advisory and only
/// forwarded to observers
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    request_id: RequestId,
    events: EventStream,
}

impl ProgressReporter {
    pub fn new(request_id: RequestId, events: EventStream) -> Self {
        Self { request_id, events }
    }

    pub fn report(&self, fraction: Option<f32>, message: impl Into<String>) {
        let fraction = fraction.map(|f| f.clamp(0.0, 1.0));
        self.events.progress(self.request_id, fraction, message);
    }
}

/// What a module hands back on success
#[derive(Debug, Clone, Default)]
pub struct ModuleOutput {
    pub entities: Vec<Entity>,
    pub payload: serde_json::Value,
}

impl ModuleOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity: Entity) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn with_entities(mut self, entities: impl IntoIterator<Item = Entity>) -> Self {
        self.entities.extend(entities);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A pluggable execution unit
#[async_trait]
pub trait AssessmentModule: Send + Sync {
    /// Module-specific parameter checks run before every attempt.
    /// Schema-level checks already happened in the dependency resolver.
    fn validate(&self, _parameters: &ParameterMap) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Run the module once
    async fn execute(&self, ctx: ModuleContext) -> Result<ModuleOutput, ModuleError>;
}
