use std::sync::Arc;
use std::time::Duration;

use holt_engine::runtime::{Engine, EngineOptions};
use holt_world::memory::{
    CountingTelemetry, ManualClock, MemoryIntervals, MemoryQueue, MemoryStore, ScriptedChallenges,
};
use holt_world::{Object, ObjectId, Storage};

/// A fully wired engine over the in-memory collaborators, with a manual
/// clock so queue time only moves when a test says so.
pub struct World {
    pub clock: Arc<ManualClock>,
    pub storage: Arc<MemoryStore>,
    pub queue: Arc<MemoryQueue>,
    pub intervals: Arc<MemoryIntervals>,
    pub challenges: Arc<ScriptedChallenges>,
    pub telemetry: Arc<CountingTelemetry>,
    pub engine: Arc<Engine>,
}

pub fn world() -> World {
    world_with_timeout(Duration::from_millis(500))
}

pub fn world_with_timeout(script_timeout: Duration) -> World {
    let clock = Arc::new(ManualClock::at(0));
    let storage = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new(clock.clone()));
    let intervals = Arc::new(MemoryIntervals::new());
    let challenges = Arc::new(ScriptedChallenges::new());
    let telemetry = Arc::new(CountingTelemetry::new());
    let engine = Arc::new(Engine::new(
        storage.clone(),
        queue.clone(),
        intervals.clone(),
        challenges.clone(),
        telemetry.clone(),
        EngineOptions { script_timeout },
    ));
    World {
        clock,
        storage,
        queue,
        intervals,
        challenges,
        telemetry,
        engine,
    }
}

impl World {
    /// Register script text under `path` at the given mod time.
    pub fn put_script(&self, path: &str, text: &str, mod_time: u64) {
        self.storage.put_source(path, text, mod_time);
    }

    pub fn add_object(&self, id: &str, script: &str) {
        self.add_object_in(id, script, None);
    }

    pub fn add_object_in(&self, id: &str, script: &str, location: Option<&str>) {
        let mut object = Object::new(id, script);
        object.location = location.map(ObjectId::from);
        self.storage.create_object(object).expect("create object");
    }

    pub fn state_of(&self, id: &str) -> serde_json::Value {
        self.storage
            .access_object(&ObjectId::new(id))
            .expect("object exists")
            .state
            .clone()
    }

    pub fn object(&self, id: &str) -> Object {
        self.storage
            .access_object(&ObjectId::new(id))
            .expect("object exists")
    }

    /// Advance logical time and drain everything that became due.
    pub async fn settle(&self, delta_ms: u64) -> usize {
        self.clock.advance(Duration::from_millis(delta_ms));
        self.engine.pump_due().await
    }
}
