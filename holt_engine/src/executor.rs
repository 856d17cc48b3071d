use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use holt_world::{
    Call, Challenges, EventQueue, ExecutionOutcome, ExecutionUpdate, IntervalStore, Object,
    ObjectId, Storage, TelemetrySink, WorldError,
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::intervals::IntervalScheduler;
use crate::movement::MovementEngine;
use crate::registry::ConnectionRegistry;
use crate::script_host::{self, HostEnv, ScriptJob};

/// Default wall-clock budget for one script execution.
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_millis(200);

/// Orchestrates one execution of one object's script in reaction to a call.
///
/// Owns the per-object execution locks, the skip-if-irrelevant optimization,
/// and the commit-or-discard decision. Different objects execute fully
/// concurrently; a second call for the same object waits for the first.
pub struct ObjectExecutor {
    storage: Arc<dyn Storage>,
    queue: Arc<dyn EventQueue>,
    challenges: Arc<dyn Challenges>,
    telemetry: Arc<dyn TelemetrySink>,
    scheduler: Arc<IntervalScheduler>,
    movement: Arc<MovementEngine>,
    connections: Arc<ConnectionRegistry>,
    script_timeout: Duration,
    locks: Mutex<HashMap<ObjectId, Arc<AsyncMutex<()>>>>,
}

impl ObjectExecutor {
    pub fn new(
        storage: Arc<dyn Storage>,
        queue: Arc<dyn EventQueue>,
        intervals: Arc<dyn IntervalStore>,
        challenges: Arc<dyn Challenges>,
        telemetry: Arc<dyn TelemetrySink>,
        connections: Arc<ConnectionRegistry>,
        script_timeout: Duration,
    ) -> Self {
        let scheduler = Arc::new(IntervalScheduler::new(
            intervals,
            queue.clone(),
            telemetry.clone(),
        ));
        let movement = Arc::new(MovementEngine::new(
            storage.clone(),
            queue.clone(),
            challenges.clone(),
        ));
        ObjectExecutor {
            storage,
            queue,
            challenges,
            telemetry,
            scheduler,
            movement,
            connections,
            script_timeout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn scheduler(&self) -> Arc<IntervalScheduler> {
        self.scheduler.clone()
    }

    pub fn movement(&self) -> Arc<MovementEngine> {
        self.movement.clone()
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<ObjectId, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_for(&self, id: &ObjectId) -> Arc<AsyncMutex<()>> {
        self.locks()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn host_env(&self) -> HostEnv {
        HostEnv {
            storage: self.storage.clone(),
            queue: self.queue.clone(),
            challenges: self.challenges.clone(),
            scheduler: self.scheduler.clone(),
            movement: self.movement.clone(),
            connections: self.connections.clone(),
        }
    }

    /// Deliver `call` to the object's script. Returns whether a listener was
    /// invoked. On any error the object's persisted state survives
    /// untouched.
    pub async fn run(&self, id: &ObjectId, call: &Call) -> Result<bool, WorldError> {
        let lock = self.lock_for(id);
        let _serialized = lock.lock().await;

        let object = self.storage.access_object(id)?;
        let current_mod_time = self.storage.resolved_source_mod_time(&object.source_path)?;

        // Skip-if-irrelevant: when the cached callback table is at least as
        // new as the script on disk and has no entry for this call, the
        // script cannot handle it and is not worth compiling. An older cache
        // never short-circuits, so a freshly added handler always runs.
        if object.source_mod_time >= current_mod_time && !object.listens_for(&call.name, call.tag)
        {
            debug!(object = %id, call = %call.name, tag = %call.tag, "skipped irrelevant call");
            return Ok(false);
        }

        self.execute(id, object, Some(call.clone())).await
    }

    /// Source refresh: run the script once with no call when the cached
    /// callback table is older than the script on disk, so top-level
    /// registrations and initialisation take effect. A fresh object is left
    /// alone.
    pub async fn refresh(&self, id: &ObjectId) -> Result<(), WorldError> {
        let lock = self.lock_for(id);
        let _serialized = lock.lock().await;

        let object = self.storage.access_object(id)?;
        let current_mod_time = self.storage.resolved_source_mod_time(&object.source_path)?;
        if object.source_mod_time >= current_mod_time {
            return Ok(());
        }
        self.execute(id, object, None).await.map(|_| ())
    }

    /// Run and re-load, for callers that need the post-run object.
    pub async fn load_run(
        &self,
        id: &ObjectId,
        call: &Call,
    ) -> Result<(Object, bool), WorldError> {
        let handled = self.run(id, call).await?;
        let object = self.storage.access_object(id)?;
        Ok((object, handled))
    }

    /// Run the loaded object's script and commit or discard. Caller holds
    /// the object's lock.
    async fn execute(
        &self,
        id: &ObjectId,
        object: Object,
        call: Option<Call>,
    ) -> Result<bool, WorldError> {
        let (source, mod_time) = self.storage.load_resolved_source(&object.source_path)?;
        let origin = object.source_path.clone();
        let call_name = call.as_ref().map(|call| call.name.clone());
        let job = ScriptJob {
            source,
            origin,
            object,
            call,
            timeout: self.script_timeout,
            env: self.host_env(),
        };

        let started = Instant::now();
        let report = tokio::task::spawn_blocking(move || script_host::run(job))
            .await
            .map_err(|err| {
                WorldError::script(id.as_str(), format!("script worker failed: {err}"))
            })?;
        let duration = started.elapsed();

        match report.error {
            None => {
                let update = ExecutionUpdate::from_object(&report.object, mod_time);
                self.storage.persist_execution(id, update)?;
                if let Some(value) = &report.returned {
                    // Informational only: handled does not depend on what the
                    // listener returned.
                    debug!(object = %id, %value, "listener returned");
                }
                let outcome = if report.handled {
                    ExecutionOutcome::Handled
                } else {
                    ExecutionOutcome::Unhandled
                };
                self.telemetry.execution(id, duration, outcome);
                Ok(report.handled)
            }
            Some(error) => {
                let outcome = if error.is_timeout() {
                    ExecutionOutcome::Timeout
                } else {
                    ExecutionOutcome::ScriptError
                };
                self.telemetry.execution(id, duration, outcome);
                warn!(
                    object = %id,
                    call = call_name.as_deref().unwrap_or("<refresh>"),
                    error = %error,
                    "execution discarded"
                );
                Err(error)
            }
        }
    }
}
