//! Assemble a [`Scheduler`] from configuration, executors and the host hooks.

use std::sync::Arc;

use crate::config::SchedulerConfig;
use crate::core::audit::{AuditSink, InMemoryAuditSink};
use crate::core::dispatcher::{Dispatcher, DispatcherSettings};
use crate::core::environment::{EnvironmentProvider, EnvironmentSnapshot};
use crate::core::executor::{ExecutorSet, TaskExecutor};
use crate::core::scheduler::{Scheduler, SchedulerParts};
use crate::core::SchedulerError;
use crate::util::clock::{Clock, SystemClock};

/// Builder for [`Scheduler`].
///
/// A default executor is required; everything else has a default (system
/// clock, no environment provider, empty environment, no audit trail).
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    executor: Option<Arc<dyn TaskExecutor>>,
    one_shot: Option<Arc<dyn TaskExecutor>>,
    periodic: Option<Arc<dyn TaskExecutor>>,
    clock: Arc<dyn Clock>,
    environment: Option<Arc<dyn EnvironmentProvider>>,
    context: EnvironmentSnapshot,
    audit: Option<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for SchedulerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerBuilder")
            .field("config", &self.config)
            .field("executor", &self.executor.is_some())
            .field("environment", &self.environment.is_some())
            .field("audit", &self.audit.is_some())
            .finish_non_exhaustive()
    }
}

impl SchedulerBuilder {
    /// Start from `config`.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            executor: None,
            one_shot: None,
            periodic: None,
            clock: Arc::new(SystemClock),
            environment: None,
            context: EnvironmentSnapshot::default(),
            audit: None,
        }
    }

    /// Configuration being built.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Executor for every kind without a dedicated one.
    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Executor for one-shot tasks.
    #[must_use]
    pub fn one_shot_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.one_shot = Some(executor);
        self
    }

    /// Executor for periodic tasks.
    #[must_use]
    pub fn periodic_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.periodic = Some(executor);
        self
    }

    /// Time source.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Environment provider polled on every tick.
    #[must_use]
    pub fn environment_provider(mut self, provider: Arc<dyn EnvironmentProvider>) -> Self {
        self.environment = Some(provider);
        self
    }

    /// Environment in effect until the first `set_context` or poll.
    #[must_use]
    pub fn initial_context(mut self, context: EnvironmentSnapshot) -> Self {
        self.context = context;
        self
    }

    /// Report lifecycle transitions to `sink`.
    #[must_use]
    pub fn audit_sink(mut self, sink: Box<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Keep an in-memory audit trail of `config.audit_capacity` events and
    /// return a handle to read it.
    #[must_use]
    pub fn in_memory_audit(mut self) -> (Self, InMemoryAuditSink) {
        let sink = InMemoryAuditSink::new(self.config.audit_capacity);
        self.audit = Some(Box::new(sink.clone()));
        (self, sink)
    }

    /// Validate the configuration, spawn the worker pool and build.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidConfig`] for an invalid configuration or a
    /// missing default executor, or a pool error when workers cannot start.
    pub fn build(self) -> Result<Scheduler, SchedulerError> {
        self.config.validate().map_err(SchedulerError::InvalidConfig)?;
        let executor = self
            .executor
            .ok_or_else(|| SchedulerError::InvalidConfig("a default executor is required".into()))?;

        let mut executors = ExecutorSet::new(executor);
        if let Some(one_shot) = self.one_shot {
            executors = executors.with_one_shot(one_shot);
        }
        if let Some(periodic) = self.periodic {
            executors = executors.with_periodic(periodic);
        }

        let mut dispatcher = Dispatcher::new(DispatcherSettings::from_config(&self.config));
        dispatcher.set_context(self.context);
        if let Some(audit) = self.audit {
            dispatcher = dispatcher.with_audit(audit);
        }

        Scheduler::from_parts(SchedulerParts {
            config: self.config,
            dispatcher,
            executors,
            clock: self.clock,
            environment: self.environment,
        })
    }
}
