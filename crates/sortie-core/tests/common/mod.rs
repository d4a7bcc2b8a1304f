//! In-process modules and oracles shared by the end-to-end tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use sortie_core::registry::EntitySource;
use sortie_core::{
    AssessmentModule, AuthorizedScope, ConcurrencyClass, Entity, EntityKind, ModuleContext, ModuleDescriptor,
    ModuleError, ModuleOutput, ModuleRegistry, OracleError, OraclePrompt, ParameterKind, ParameterSpec,
    ReasoningOracle, Session,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Host discovery: a /24 yields a web server and an ssh server, a single
/// address yields itself
pub struct FakeScanner;

#[async_trait]
impl AssessmentModule for FakeScanner {
    async fn execute(&self, ctx: ModuleContext) -> Result<ModuleOutput, ModuleError> {
        let target = ctx
            .parameter_str("target")
            .ok_or_else(|| ModuleError::Fatal("missing target".into()))?
            .to_string();
        ctx.progress.report(Some(0.0), format!("scanning {}", target));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let output = match target.strip_suffix(".0/24") {
            Some(prefix) => ModuleOutput::new()
                .with_entity(
                    Entity::host(format!("{}.5", prefix))
                        .with_tag("http")
                        .with_attribute("os", "linux"),
                )
                .with_entity(Entity::service(&format!("{}.5", prefix), 80, "tcp").with_tag("http"))
                .with_entity(Entity::host(format!("{}.6", prefix)).with_tag("ssh"))
                .with_entity(Entity::service(&format!("{}.6", prefix), 22, "tcp").with_tag("ssh")),
            None => ModuleOutput::new().with_entity(Entity::host(target).with_attribute("alive", true)),
        };
        ctx.progress.report(Some(1.0), "done");
        Ok(output)
    }
}

/// Web scanner reporting one finding per target
pub struct FakeWebScanner;

#[async_trait]
impl AssessmentModule for FakeWebScanner {
    async fn execute(&self, ctx: ModuleContext) -> Result<ModuleOutput, ModuleError> {
        let target = ctx.parameter_str("target").unwrap_or_default().to_string();
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(ModuleOutput::new().with_entity(
            Entity::new(EntityKind::Finding, format!("directory-listing@{}", target))
                .with_attribute("host", target)
                .with_attribute("severity", "medium"),
        ))
    }
}

/// Records how many copies run at once
#[derive(Default)]
pub struct Gauge {
    pub running: AtomicUsize,
    pub peak: AtomicUsize,
    pub delay: Duration,
}

impl Gauge {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Module wrapper around a shared gauge
pub struct Gauged(pub Arc<Gauge>);

#[async_trait]
impl AssessmentModule for Gauged {
    async fn execute(&self, _ctx: ModuleContext) -> Result<ModuleOutput, ModuleError> {
        let now = self.0.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.0.delay).await;
        self.0.running.fetch_sub(1, Ordering::SeqCst);
        Ok(ModuleOutput::new())
    }
}

/// Ignores cancellation and reports a host after its delay
pub struct Stubborn {
    pub address: String,
    pub delay: Duration,
}

#[async_trait]
impl AssessmentModule for Stubborn {
    async fn execute(&self, _ctx: ModuleContext) -> Result<ModuleOutput, ModuleError> {
        tokio::time::sleep(self.delay).await;
        Ok(ModuleOutput::new().with_entity(Entity::host(self.address.clone()).with_attribute("late", true)))
    }
}

/// Reports a fixed host with fixed attributes
pub struct Reporter {
    pub entity: Entity,
    pub delay: Duration,
}

#[async_trait]
impl AssessmentModule for Reporter {
    async fn execute(&self, _ctx: ModuleContext) -> Result<ModuleOutput, ModuleError> {
        tokio::time::sleep(self.delay).await;
        Ok(ModuleOutput::new().with_entity(self.entity.clone()))
    }
}

/// Fails fatally on one marker target, otherwise runs until cancelled
pub struct Tripwire {
    pub marker: String,
}

#[async_trait]
impl AssessmentModule for Tripwire {
    async fn execute(&self, ctx: ModuleContext) -> Result<ModuleOutput, ModuleError> {
        if ctx.parameter_str("target") == Some(self.marker.as_str()) {
            tokio::time::sleep(Duration::from_millis(20)).await;
            return Err(ModuleError::Fatal("target crashed".into()));
        }
        ctx.cancel.cancelled().await;
        Err(ModuleError::Recoverable("interrupted".into()))
    }
}

/// Oracle that is always down
pub struct DownOracle;

#[async_trait]
impl ReasoningOracle for DownOracle {
    fn name(&self) -> &str {
        "down"
    }

    async fn complete(&self, _prompt: &OraclePrompt) -> Result<String, OracleError> {
        Err(OracleError::Unavailable("connection refused".into()))
    }
}

/// Oracle replaying canned replies in order, recording prompts
pub struct ScriptedOracle {
    replies: Mutex<Vec<Result<String, OracleError>>>,
    pub prompts: Mutex<Vec<OraclePrompt>>,
}

impl ScriptedOracle {
    pub fn new(mut replies: Vec<Result<String, OracleError>>) -> Arc<Self> {
        replies.reverse();
        Arc::new(Self {
            replies: Mutex::new(replies),
            prompts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ReasoningOracle for ScriptedOracle {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, prompt: &OraclePrompt) -> Result<String, OracleError> {
        self.prompts.lock().push(prompt.clone());
        self.replies
            .lock()
            .pop()
            .unwrap_or_else(|| Err(OracleError::Unavailable("script exhausted".into())))
    }
}

pub fn target() -> ParameterSpec {
    ParameterSpec::required(ParameterKind::Target)
}

/// scan / web_scan / exploit bound to the fakes above
pub fn assessment_registry() -> Arc<ModuleRegistry> {
    let mut builder = ModuleRegistry::builder();
    builder
        .register(
            ModuleDescriptor::new("scan")
                .with_description("Host and service discovery")
                .with_capability("network")
                .with_parameter("target", target()),
            Arc::new(FakeScanner),
        )
        .unwrap();
    builder
        .register(
            ModuleDescriptor::new("web_scan")
                .with_description("Web application scanner")
                .with_capability("web")
                .with_parameter(
                    "target",
                    target().from_entities(EntitySource::new(EntityKind::Host).attribute("address")),
                ),
            Arc::new(FakeWebScanner),
        )
        .unwrap();
    builder
        .register(
            ModuleDescriptor::new("exploit")
                .with_capability("exploit")
                .with_concurrency(ConcurrencyClass::Exclusive)
                .non_idempotent()
                .with_parameter("target", target()),
            Arc::new(Tripwire {
                marker: "10.0.0.66".into(),
            }),
        )
        .unwrap();
    Arc::new(builder.build())
}

pub fn lab_scope() -> AuthorizedScope {
    AuthorizedScope::from_specifiers(["10.0.0.0/24"]).unwrap()
}

pub fn session(oracle: Option<Arc<dyn ReasoningOracle>>) -> Session {
    let mut builder = Session::builder()
        .with_registry(assessment_registry())
        .with_scope(lab_scope());
    if let Some(oracle) = oracle {
        builder = builder.with_oracle(oracle);
    }
    builder.build().unwrap()
}
