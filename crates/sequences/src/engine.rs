use std::sync::Arc;
use std::time::Duration;

use outreach_core::collaborators::{
    ContactStore, EngagementSource, MessageTransport, TemplateRenderer, WebhookClient,
};
use outreach_core::event_bus::{noop_sink, EventSink};
use outreach_core::AppConfig;
use tracing::info;
use uuid::Uuid;

use crate::analytics::SequenceAnalytics;
use crate::clock::{Clock, SystemClock};
use crate::enrollment::EnrollmentManager;
use crate::error::SequenceResult;
use crate::executions::ExecutionStore;
use crate::executor::StepExecutor;
use crate::exit::ExitEvaluator;
use crate::handlers::{
    AbTestHandler, ActionHandler, ConditionHandler, CustomPredicate, EmailHandler,
    HandlerRegistry, WaitHandler,
};
use crate::ledger::ExecutionLedger;
use crate::queue::InMemoryQueue;
use crate::repo::EnrollmentRepo;
use crate::scheduler::Scheduler;
use crate::store::SequenceStore;
use crate::templates::TemplateLibrary;
use crate::worker::SequenceWorker;

/// The external services the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub renderer: Arc<dyn TemplateRenderer>,
    pub transport: Arc<dyn MessageTransport>,
    pub contacts: Arc<dyn ContactStore>,
    pub engagement: Arc<dyn EngagementSource>,
    pub webhooks: Arc<dyn WebhookClient>,
}

pub struct SequenceEngineBuilder {
    collaborators: Collaborators,
    config: AppConfig,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
    ab_seed: Option<u64>,
    predicates: Vec<(String, CustomPredicate)>,
}

impl SequenceEngineBuilder {
    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attach an event sink for emitting analytics events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Seeds the A/B variant draw so assignments are reproducible.
    pub fn with_ab_seed(mut self, seed: u64) -> Self {
        self.ab_seed = Some(seed);
        self
    }

    pub fn with_predicate(mut self, key: impl Into<String>, predicate: CustomPredicate) -> Self {
        self.predicates.push((key.into(), predicate));
        self
    }

    pub fn build(self) -> SequenceEngine {
        let Self {
            collaborators,
            config,
            clock,
            event_sink,
            ab_seed,
            predicates,
        } = self;
        let call_timeout = Duration::from_millis(config.executor.handler_timeout_ms);

        let store = Arc::new(SequenceStore::new());
        let enrollments = Arc::new(EnrollmentRepo::new());
        let ledger = Arc::new(ExecutionLedger::new());
        let executions = Arc::new(ExecutionStore::new(ledger.clone()));
        let queue = Arc::new(InMemoryQueue::new());

        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            enrollments.clone(),
            executions.clone(),
            queue.clone(),
            clock.clone(),
            collaborators.contacts.clone(),
            event_sink.clone(),
            config.scheduler.default_utc_offset.clone(),
            call_timeout,
        ));
        let manager = Arc::new(EnrollmentManager::new(
            store.clone(),
            enrollments.clone(),
            executions.clone(),
            scheduler.clone(),
            collaborators.contacts.clone(),
            clock.clone(),
            event_sink.clone(),
            call_timeout,
        ));

        let condition = ConditionHandler::new(collaborators.engagement.clone(), call_timeout);
        for (key, predicate) in predicates {
            condition.register_custom(key, predicate);
        }
        let ab_test = match ab_seed {
            Some(seed) => AbTestHandler::with_seed(seed),
            None => AbTestHandler::new(),
        };
        let mut handlers = HandlerRegistry::new();
        handlers.register(Arc::new(EmailHandler::new(
            collaborators.renderer.clone(),
            collaborators.transport.clone(),
            config.email.clone(),
            call_timeout,
        )));
        handlers.register(Arc::new(WaitHandler));
        handlers.register(Arc::new(condition));
        handlers.register(Arc::new(ActionHandler::new(
            collaborators.contacts.clone(),
            collaborators.webhooks.clone(),
            call_timeout,
        )));
        handlers.register(Arc::new(ab_test));

        let exit_evaluator = Arc::new(ExitEvaluator::new(
            collaborators.engagement.clone(),
            call_timeout,
        ));
        let executor = Arc::new(StepExecutor::new(
            store.clone(),
            enrollments.clone(),
            executions.clone(),
            scheduler.clone(),
            manager.clone(),
            exit_evaluator,
            handlers,
            collaborators.contacts.clone(),
            clock.clone(),
            event_sink.clone(),
            config.executor.clone(),
        ));
        let worker = Arc::new(SequenceWorker::new(
            executor.clone(),
            queue.clone(),
            clock.clone(),
            config.executor.max_concurrency,
            Duration::from_millis(config.scheduler.poll_interval_ms),
        ));
        let analytics = Arc::new(SequenceAnalytics::new(
            store.clone(),
            enrollments,
            executions,
            collaborators.engagement.clone(),
            event_sink,
            call_timeout,
        ));
        let templates = Arc::new(TemplateLibrary::new(store.clone()));

        info!(
            node_id = %config.node_id,
            max_concurrency = config.executor.max_concurrency,
            max_retries = config.executor.max_retries,
            "Sequence engine built"
        );

        SequenceEngine {
            config,
            store,
            ledger,
            queue,
            scheduler,
            manager,
            executor,
            worker,
            analytics,
            templates,
        }
    }
}

/// Owns every engine component and hands out shared references to them.
pub struct SequenceEngine {
    config: AppConfig,
    store: Arc<SequenceStore>,
    ledger: Arc<ExecutionLedger>,
    queue: Arc<InMemoryQueue>,
    scheduler: Arc<Scheduler>,
    manager: Arc<EnrollmentManager>,
    executor: Arc<StepExecutor>,
    worker: Arc<SequenceWorker>,
    analytics: Arc<SequenceAnalytics>,
    templates: Arc<TemplateLibrary>,
}

impl std::fmt::Debug for SequenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceEngine")
            .field("node_id", &self.config.node_id)
            .field("sequences", &self.store.list_sequences().len())
            .field("queued", &self.queue.len())
            .field("ledger_entries", &self.ledger.len())
            .finish()
    }
}

impl SequenceEngine {
    /// Starts a builder with default config, the system clock and no event
    /// sink.
    pub fn builder(collaborators: Collaborators) -> SequenceEngineBuilder {
        SequenceEngineBuilder {
            collaborators,
            config: AppConfig::default(),
            clock: Arc::new(SystemClock),
            event_sink: noop_sink(),
            ab_seed: None,
            predicates: Vec::new(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SequenceStore> {
        &self.store
    }

    pub fn manager(&self) -> &Arc<EnrollmentManager> {
        &self.manager
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn executor(&self) -> &Arc<StepExecutor> {
        &self.executor
    }

    pub fn ledger(&self) -> &Arc<ExecutionLedger> {
        &self.ledger
    }

    pub fn queue(&self) -> &Arc<InMemoryQueue> {
        &self.queue
    }

    pub fn analytics(&self) -> &Arc<SequenceAnalytics> {
        &self.analytics
    }

    pub fn templates(&self) -> &Arc<TemplateLibrary> {
        &self.templates
    }

    pub fn worker(&self) -> Arc<SequenceWorker> {
        self.worker.clone()
    }

    /// Registers the built-in templates and creates an ACTIVE sequence from
    /// each of them.
    pub fn seed_demo_sequences(&self) -> SequenceResult<Vec<Uuid>> {
        info!("Seeding demo sequences");
        let mut sequence_ids = Vec::new();
        for template_id in self.templates.seed_builtin()? {
            let sequence_id = self.templates.instantiate(&template_id, None)?;
            self.manager.activate_sequence(&sequence_id)?;
            sequence_ids.push(sequence_id);
        }
        Ok(sequence_ids)
    }
}
