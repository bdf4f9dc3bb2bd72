//! Composition root.
//!
//! A [`Core`] bundles the configuration, every collaborator, and every
//! pipeline component. The HTTP layer holds one `Arc<Core>` per process
//! and hands it to each request; tests build one with in-memory fakes.

use std::sync::Arc;
use std::time::Duration;

use crate::approval::ApprovalRegistry;
use crate::checkpoint::{Checkpointer, MemoryCheckpointer};
use crate::config::CoreConfig;
use crate::cost::{CostEstimator, HeuristicCostEstimator};
use crate::events::EventBus;
use crate::executor::ExecutorFacade;
use crate::kv::{KvStore, MemoryKv};
use crate::llm::{LlmProvider, UnconfiguredProvider};
use crate::orchestrator::Orchestrator;
use crate::rls::{AllowAllRls, RlsService};
use crate::router::IntentRouter;
use crate::schema::SchemaService;
use crate::sentiment::SentimentTracker;
use crate::skills::generation::SkillGenerator;
use crate::synth::Synthesizer;
use crate::validate::Validator;

/// The assembled core.
pub struct Core {
    /// Immutable configuration.
    pub config: CoreConfig,
    /// Per-ticket event bus.
    pub events: EventBus,
    /// Pending-approval registry.
    pub approvals: ApprovalRegistry,
    /// Executor facade (register backends here).
    pub executor: ExecutorFacade,
    /// Schema fetch/cache service.
    pub schema: SchemaService,
    /// Durable checkpoint store.
    pub checkpointer: Arc<dyn Checkpointer>,
    /// Shared KV store.
    pub kv: Arc<dyn KvStore>,
    /// User sentiment tracking and response adaptation.
    pub sentiment: SentimentTracker,
    /// Skill mining over successful queries.
    pub skill_generator: SkillGenerator,
    pub(crate) router: IntentRouter,
    pub(crate) synthesizer: Synthesizer,
    pub(crate) validator: Validator,
    pub(crate) llm: Arc<dyn LlmProvider>,
}

impl Core {
    /// Start building a core.
    #[must_use]
    pub fn builder(config: CoreConfig) -> CoreBuilder {
        CoreBuilder {
            config,
            llm: None,
            kv: None,
            checkpointer: None,
            cost: None,
            rls: None,
        }
    }

    /// An orchestrator view over this core.
    #[must_use]
    pub fn orchestrator(&self) -> Orchestrator<'_> {
        Orchestrator::new(self)
    }
}

/// Builder for [`Core`]. Every collaborator has an in-memory default so
/// a dev-mode core assembles with nothing but a config.
pub struct CoreBuilder {
    config: CoreConfig,
    llm: Option<Arc<dyn LlmProvider>>,
    kv: Option<Arc<dyn KvStore>>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    cost: Option<Arc<dyn CostEstimator>>,
    rls: Option<Arc<dyn RlsService>>,
}

impl CoreBuilder {
    /// Wire the LLM provider.
    #[must_use]
    pub fn llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Wire the KV store.
    #[must_use]
    pub fn kv(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Wire the checkpoint store.
    #[must_use]
    pub fn checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Wire the cost estimator.
    #[must_use]
    pub fn cost_estimator(mut self, cost: Arc<dyn CostEstimator>) -> Self {
        self.cost = Some(cost);
        self
    }

    /// Wire the RLS service.
    #[must_use]
    pub fn rls(mut self, rls: Arc<dyn RlsService>) -> Self {
        self.rls = Some(rls);
        self
    }

    /// Assemble the core.
    #[must_use]
    pub fn build(self) -> Core {
        let config = self.config;
        let llm = self.llm.unwrap_or_else(|| Arc::new(UnconfiguredProvider));
        let kv: Arc<dyn KvStore> = self.kv.unwrap_or_else(|| Arc::new(MemoryKv::new()));
        let checkpointer: Arc<dyn Checkpointer> = self.checkpointer.unwrap_or_else(|| {
            Arc::new(MemoryCheckpointer::new(Duration::from_secs(
                config.checkpoint_ttl_s,
            )))
        });
        let cost: Arc<dyn CostEstimator> =
            self.cost.unwrap_or_else(|| Arc::new(HeuristicCostEstimator));
        let rls: Arc<dyn RlsService> = self.rls.unwrap_or_else(|| Arc::new(AllowAllRls));

        let schema = SchemaService::new(
            Arc::clone(&kv),
            Duration::from_secs(config.schema_cache_ttl_s),
            Duration::from_secs(config.sample_cache_ttl_s),
            Duration::from_secs(config.schema_fetch_timeout_s),
        );
        let executor = ExecutorFacade::new(Arc::clone(&kv), config.clone());
        let synthesizer = Synthesizer::new(
            Arc::clone(&llm),
            Arc::clone(&cost),
            Arc::clone(&kv),
            config.clone(),
        );
        let validator = Validator::new(
            Arc::clone(&cost),
            Arc::clone(&rls),
            Arc::clone(&kv),
            config.clone(),
        );
        let router = IntentRouter::new(config.router_llm_fallback);
        let sentiment = SentimentTracker::new(Arc::clone(&kv), config.sentiment_tracking_enabled);
        let skill_generator =
            SkillGenerator::new(Arc::clone(&kv), config.skill_generation_enabled);

        Core {
            events: EventBus::new(),
            approvals: ApprovalRegistry::new(),
            executor,
            schema,
            checkpointer,
            kv,
            sentiment,
            skill_generator,
            router,
            synthesizer,
            validator,
            llm,
            config,
        }
    }
}
