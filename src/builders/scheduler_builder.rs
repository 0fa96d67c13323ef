//! Builder assembling a scheduler from configuration.

use std::sync::Arc;

use crate::config::SchedulerConfig;
use crate::core::admission::{AdmissionController, TaskQueue};
use crate::core::events::{EventBus, EventSink};
use crate::core::resource_pool::ResourcePool;
use crate::core::scheduler::Scheduler;
use crate::core::SchedulerError;
use crate::infra::queue::InMemoryQueue;
use crate::util::clock::{Clock, SystemClock};

/// Build a resource pool with one bucket per configured resource.
pub fn build_pool(cfg: &SchedulerConfig, clock: Arc<dyn Clock>) -> Result<ResourcePool, SchedulerError> {
    let pool = ResourcePool::new(clock);
    for (resource, bucket) in &cfg.resources {
        pool.configure(resource.clone(), bucket.capacity, bucket.refill_rate)?;
    }
    Ok(pool)
}

/// Assembles pool, admission controller, event bus and clock.
///
/// Defaults: [`SystemClock`], no event sink, [`InMemoryQueue`] sized by
/// `max_queue_depth`.
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    clock: Option<Arc<dyn Clock>>,
    sink: Option<Box<dyn EventSink>>,
    queue: Option<Box<dyn TaskQueue>>,
}

impl SchedulerBuilder {
    /// Start from a configuration.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            clock: None,
            sink: None,
            queue: None,
        }
    }

    /// Use an injected clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Publish events into `sink`.
    #[must_use]
    pub fn with_event_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Use a custom wait queue backend.
    #[must_use]
    pub fn with_queue(mut self, queue: impl TaskQueue + 'static) -> Self {
        self.queue = Some(Box::new(queue));
        self
    }

    /// Validate the configuration and build the scheduler.
    pub fn build<P, R>(self) -> Result<Scheduler<P, R>, SchedulerError>
    where
        P: Clone + Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
    {
        let Self {
            config,
            clock,
            sink,
            queue,
        } = self;
        config.validate()?;

        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let pool = Arc::new(build_pool(&config, Arc::clone(&clock))?);
        let events = EventBus::new(Arc::clone(&clock), sink);
        let queue = queue.unwrap_or_else(|| Box::new(InMemoryQueue::new(config.max_queue_depth)));
        let admission = AdmissionController::new(Arc::clone(&pool), queue, events.clone())
            .with_preemption_threshold(config.preemption_priority())
            .with_stale_after(config.queue_stale_after());

        tracing::debug!(
            resources = config.resources.len(),
            max_queue_depth = config.max_queue_depth,
            "scheduler built"
        );
        Ok(Scheduler::from_parts(
            config,
            clock,
            Arc::new(admission),
            pool,
            events,
        ))
    }
}
