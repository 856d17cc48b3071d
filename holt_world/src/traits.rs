use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::call::{Call, CallbackSet};
use crate::error::WorldError;
use crate::interval::{Interval, IntervalId};
use crate::object::{Description, Exit, Learning, MovementProfile, Object, ObjectId};

/// Logical time in milliseconds. Produced only by the queue's clock so tests
/// can drive it deterministically.
pub type Timestamp = u64;

/// One scheduled delivery: a call that becomes due for `object` at `at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEvent {
    pub at: Timestamp,
    pub object: ObjectId,
    pub payload: EventPayload,
}

/// What the pump should do when a queue event comes due.
///
/// `IntervalFire` runs the normal delivery path and then hands the interval
/// back to the scheduler for its atomic fire-to-reschedule step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EventPayload {
    Deliver { call: Call },
    IntervalFire { interval: IntervalId, call: Call },
}

impl EventPayload {
    pub fn call(&self) -> &Call {
        match self {
            EventPayload::Deliver { call } => call,
            EventPayload::IntervalFire { call, .. } => call,
        }
    }
}

/// The script-owned fields committed together after a successful execution.
///
/// Containment (`location`/`content`) is deliberately absent: a script that
/// moved itself mid-run must not have that move clobbered by the commit.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionUpdate {
    pub state: serde_json::Value,
    pub callbacks: CallbackSet,
    pub source_mod_time: u64,
    pub skills: BTreeMap<String, f64>,
    pub descriptions: Vec<Description>,
    pub exits: Vec<Exit>,
    pub movement: MovementProfile,
    pub learning: Learning,
}

impl ExecutionUpdate {
    /// Capture the commit fields from a post-run object snapshot.
    pub fn from_object(object: &Object, source_mod_time: u64) -> Self {
        ExecutionUpdate {
            state: object.state.clone(),
            callbacks: object.callbacks.clone(),
            source_mod_time,
            skills: object.skills.clone(),
            descriptions: object.descriptions.clone(),
            exits: object.exits.clone(),
            movement: object.movement.clone(),
            learning: object.learning.clone(),
        }
    }
}

/// The object storage engine. Owns the `content`/`location` invariant; the
/// core only relocates objects through these primitives.
pub trait Storage: Send + Sync {
    fn access_object(&self, id: &ObjectId) -> Result<Object, WorldError>;

    /// Atomically persist the commit triple (plus typed accessor fields) of
    /// one successful execution. Nothing else on the object changes.
    fn persist_execution(&self, id: &ObjectId, update: ExecutionUpdate) -> Result<(), WorldError>;

    /// Atomic relocation preserving the containment invariant. `None` moves
    /// to the universe root. Rejects containment cycles.
    fn move_object(&self, id: &ObjectId, destination: Option<&ObjectId>)
        -> Result<(), WorldError>;

    /// Mint an id no existing or future object will collide with.
    fn allocate_object_id(&self) -> ObjectId;

    fn create_object(&self, object: Object) -> Result<(), WorldError>;

    /// Rejects removal of non-empty containers.
    fn remove_object(&self, id: &ObjectId) -> Result<(), WorldError>;

    /// Import-resolved script text and its modification time.
    fn load_resolved_source(&self, path: &str) -> Result<(String, u64), WorldError>;

    fn resolved_source_mod_time(&self, path: &str) -> Result<u64, WorldError>;
}

/// Durable, time-ordered delivery. The queue stores and orders; draining is
/// the engine pump's job.
pub trait EventQueue: Send + Sync {
    fn push(&self, event: QueueEvent) -> Result<(), WorldError>;

    fn now(&self) -> Timestamp;

    fn after(&self, delay: Duration) -> Timestamp;

    /// Pop the earliest event due at or before `now`, in `(at, insertion)`
    /// order. `None` when nothing is due yet.
    fn pop_due(&self, now: Timestamp) -> Option<QueueEvent>;

    /// When the earliest stored event comes due, if any.
    fn peek_at(&self) -> Option<Timestamp>;
}

/// Durable interval records with an atomic read-and-update primitive.
pub trait IntervalStore: Send + Sync {
    fn allocate_id(&self) -> IntervalId;

    fn set(&self, interval: Interval) -> Result<(), WorldError>;

    /// Run `mutate` on the stored record under the store's lock and return
    /// the updated record, or `None` when the record no longer exists. This
    /// is the only way the core mutates a persisted interval.
    fn update(
        &self,
        object: &ObjectId,
        id: IntervalId,
        mutate: &mut dyn FnMut(&mut Interval),
    ) -> Result<Option<Interval>, WorldError>;

    /// Delete the record. Returns whether it existed; deleting a missing
    /// record is not an error.
    fn del(&self, object: &ObjectId, id: IntervalId) -> Result<bool, WorldError>;

    fn count_for_object(&self, object: &ObjectId) -> usize;

    fn each(&self, visit: &mut dyn FnMut(&Interval));
}

/// Opaque skill-check predicate gating perception and exit traversal.
pub trait Challenges: Send + Sync {
    fn check(&self, subject: &ObjectId, target: &ObjectId) -> bool;
}

/// How one script execution ended, for the telemetry sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Handled,
    Unhandled,
    ScriptError,
    Timeout,
}

/// Purely observational; never influences control flow.
pub trait TelemetrySink: Send + Sync {
    fn execution(&self, object: &ObjectId, duration: Duration, outcome: ExecutionOutcome);

    fn recovery_failure(&self, object: &ObjectId, interval: IntervalId, error: &WorldError);
}
