use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use holt_world::{
    Call, Challenges, EventPayload, EventQueue, ExecutionOutcome, IntervalStore, ObjectId,
    QueueEvent, Storage, TelemetrySink, WorldError,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::CallDispatcher;
use crate::executor::{ObjectExecutor, DEFAULT_SCRIPT_TIMEOUT};
use crate::intervals::IntervalScheduler;
use crate::registry::ConnectionRegistry;

/// Upper bound on one pump sleep, so events pushed while sleeping are
/// noticed promptly.
const PUMP_NAP: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub script_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            script_timeout: DEFAULT_SCRIPT_TIMEOUT,
        }
    }
}

/// The assembled behavioral core: collaborators, executor, dispatcher,
/// scheduler, and the queue pump that drives delivery.
pub struct Engine {
    queue: Arc<dyn EventQueue>,
    connections: Arc<ConnectionRegistry>,
    scheduler: Arc<IntervalScheduler>,
    executor: Arc<ObjectExecutor>,
    dispatcher: CallDispatcher,
}

impl Engine {
    pub fn new(
        storage: Arc<dyn Storage>,
        queue: Arc<dyn EventQueue>,
        intervals: Arc<dyn IntervalStore>,
        challenges: Arc<dyn Challenges>,
        telemetry: Arc<dyn TelemetrySink>,
        options: EngineOptions,
    ) -> Self {
        let connections = Arc::new(ConnectionRegistry::new());
        let executor = Arc::new(ObjectExecutor::new(
            storage.clone(),
            queue.clone(),
            intervals,
            challenges.clone(),
            telemetry,
            connections.clone(),
            options.script_timeout,
        ));
        let scheduler = executor.scheduler();
        let dispatcher = CallDispatcher::new(storage, challenges, executor.clone());
        Engine {
            queue,
            connections,
            scheduler,
            executor,
            dispatcher,
        }
    }

    pub fn connections(&self) -> Arc<ConnectionRegistry> {
        self.connections.clone()
    }

    pub fn executor(&self) -> Arc<ObjectExecutor> {
        self.executor.clone()
    }

    pub fn scheduler(&self) -> Arc<IntervalScheduler> {
        self.scheduler.clone()
    }

    /// Replay persisted intervals. Must run once, before the pump serves
    /// traffic.
    pub fn recover(&self) -> usize {
        let recovered = self.scheduler.recover_intervals();
        info!(recovered, "interval recovery complete");
        recovered
    }

    /// One typed session line from `actor`.
    pub async fn command(&self, actor: &ObjectId, line: &str) -> Result<bool, WorldError> {
        self.dispatcher.dispatch_command(actor, line).await
    }

    /// Handle one due event inline. Returns false when nothing is due.
    /// Delivery failures are logged, not retried; retry policy belongs to
    /// the scripts themselves.
    pub async fn pump_once(&self) -> bool {
        let Some(event) = self.queue.pop_due(self.queue.now()) else {
            return false;
        };
        self.handle_event(event).await;
        true
    }

    /// Drain everything currently due, inline and in order.
    pub async fn pump_due(&self) -> usize {
        let mut handled = 0;
        while self.pump_once().await {
            handled += 1;
        }
        handled
    }

    /// Serve the queue until the future is dropped.
    ///
    /// Events pop in `(at, insertion)` order. Each is handled on its own
    /// task, chained on the previous task for the same object so deliveries
    /// to one object keep submission order while distinct objects proceed in
    /// parallel. Dropping the future stops the pump between events; it never
    /// interrupts an execution already under way.
    pub async fn run_pump(self: Arc<Self>) {
        let mut chains: HashMap<ObjectId, JoinHandle<()>> = HashMap::new();
        loop {
            while let Some(event) = self.queue.pop_due(self.queue.now()) {
                chains.retain(|_, handle| !handle.is_finished());
                let engine = Arc::clone(&self);
                let object = event.object.clone();
                let previous = chains.remove(&object);
                let handle = tokio::spawn(async move {
                    if let Some(previous) = previous {
                        let _ = previous.await;
                    }
                    engine.handle_event(event).await;
                });
                chains.insert(object, handle);
            }
            let now = self.queue.now();
            let nap = match self.queue.peek_at() {
                Some(at) => Duration::from_millis(at.saturating_sub(now)).min(PUMP_NAP),
                None => PUMP_NAP,
            };
            tokio::time::sleep(nap.max(Duration::from_millis(1))).await;
        }
    }

    async fn handle_event(&self, event: QueueEvent) {
        match event.payload {
            EventPayload::Deliver { call } => {
                self.deliver_logged(&event.object, &call).await;
            }
            EventPayload::IntervalFire { interval, call } => {
                self.deliver_logged(&event.object, &call).await;
                // The handler has completed (or failed); either way the
                // interval advances. A concurrently cleared record stays
                // cleared.
                if let Err(err) = self.scheduler.reschedule(&event.object, interval) {
                    warn!(object = %event.object, interval, error = %err, "interval reschedule failed");
                }
            }
        }
    }

    async fn deliver_logged(&self, target: &ObjectId, call: &Call) {
        match self.dispatcher.deliver(target, call).await {
            Ok(handled) => {
                debug!(object = %target, call = %call.name, handled, "event delivered");
            }
            Err(err) => {
                warn!(object = %target, call = %call.name, error = %err, "event delivery failed");
            }
        }
    }
}

/// Telemetry sink that reports through the tracing layer. Used by the
/// binary; tests use the counting sink from `holt_world`.
#[derive(Debug, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn execution(&self, object: &ObjectId, duration: Duration, outcome: ExecutionOutcome) {
        debug!(object = %object, ?duration, ?outcome, "script execution");
    }

    fn recovery_failure(&self, object: &ObjectId, interval: u64, error: &WorldError) {
        warn!(object = %object, interval, error = %error, "interval recovery failure");
    }
}
