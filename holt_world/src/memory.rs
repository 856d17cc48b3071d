//! In-memory reference implementations of the collaborator contracts.
//!
//! These back the engine's test suites and the demo binary. They keep the
//! same semantics a durable backend must provide: atomic containment moves,
//! the interval store's locked read-and-update, and `(at, insertion)` queue
//! ordering over a pluggable clock.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::WorldError;
use crate::interval::{Interval, IntervalId};
use crate::object::{Object, ObjectId};
use crate::traits::{
    Challenges, EventQueue, ExecutionOutcome, ExecutionUpdate, IntervalStore, QueueEvent, Storage,
    TelemetrySink, Timestamp,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Source of logical time for a queue.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock milliseconds since the Unix epoch.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Test clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn at(now: Timestamp) -> Self {
        ManualClock {
            now: AtomicU64::new(now),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, delta: Duration) {
        self.now
            .fetch_add(delta.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueuedEntry {
    at: Timestamp,
    seq: u64,
}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Time-ordered event queue over a pluggable [`Clock`].
pub struct MemoryQueue {
    clock: std::sync::Arc<dyn Clock>,
    inner: Mutex<QueueInner>,
}

struct QueueInner {
    heap: BinaryHeap<Reverse<QueuedEntry>>,
    events: BTreeMap<u64, QueueEvent>,
    seq: u64,
}

impl MemoryQueue {
    pub fn new(clock: std::sync::Arc<dyn Clock>) -> Self {
        MemoryQueue {
            clock,
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                events: BTreeMap::new(),
                seq: 0,
            }),
        }
    }

    pub fn system() -> Self {
        Self::new(std::sync::Arc::new(SystemClock))
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain every stored event regardless of due time, in order. Test aid.
    pub fn drain_all(&self) -> Vec<QueueEvent> {
        let mut inner = lock(&self.inner);
        let mut drained = Vec::with_capacity(inner.events.len());
        while let Some(Reverse(entry)) = inner.heap.pop() {
            if let Some(event) = inner.events.remove(&entry.seq) {
                drained.push(event);
            }
        }
        drained
    }
}

impl EventQueue for MemoryQueue {
    fn push(&self, event: QueueEvent) -> Result<(), WorldError> {
        let mut inner = lock(&self.inner);
        let seq = inner.seq;
        inner.seq += 1;
        inner.heap.push(Reverse(QueuedEntry { at: event.at, seq }));
        inner.events.insert(seq, event);
        Ok(())
    }

    fn now(&self) -> Timestamp {
        self.clock.now()
    }

    fn after(&self, delay: Duration) -> Timestamp {
        self.clock.now() + delay.as_millis() as u64
    }

    fn pop_due(&self, now: Timestamp) -> Option<QueueEvent> {
        let mut inner = lock(&self.inner);
        match inner.heap.peek() {
            Some(Reverse(entry)) if entry.at <= now => {}
            _ => return None,
        }
        let Reverse(entry) = inner.heap.pop()?;
        inner.events.remove(&entry.seq)
    }

    fn peek_at(&self) -> Option<Timestamp> {
        let inner = lock(&self.inner);
        inner.heap.peek().map(|Reverse(entry)| entry.at)
    }
}

/// Object storage with the containment invariant enforced on every move.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<ObjectId, Object>>,
    sources: Mutex<BTreeMap<String, (String, u64)>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Register script source text under `path` with the given mod time.
    pub fn put_source(&self, path: &str, text: &str, mod_time: u64) {
        lock(&self.sources).insert(path.to_string(), (text.to_string(), mod_time));
    }

    pub fn object_ids(&self) -> Vec<ObjectId> {
        lock(&self.objects).keys().cloned().collect()
    }

    fn ancestors(objects: &BTreeMap<ObjectId, Object>, start: &ObjectId) -> Vec<ObjectId> {
        let mut chain = Vec::new();
        let mut cursor = Some(start.clone());
        while let Some(id) = cursor {
            if chain.contains(&id) {
                break;
            }
            cursor = objects.get(&id).and_then(|object| object.location.clone());
            chain.push(id);
        }
        chain
    }
}

impl Storage for MemoryStore {
    fn access_object(&self, id: &ObjectId) -> Result<Object, WorldError> {
        lock(&self.objects)
            .get(id)
            .cloned()
            .ok_or_else(|| WorldError::NotFound(id.clone()))
    }

    fn persist_execution(&self, id: &ObjectId, update: ExecutionUpdate) -> Result<(), WorldError> {
        let mut objects = lock(&self.objects);
        let object = objects
            .get_mut(id)
            .ok_or_else(|| WorldError::NotFound(id.clone()))?;
        object.state = update.state;
        object.callbacks = update.callbacks;
        object.source_mod_time = update.source_mod_time;
        object.skills = update.skills;
        object.descriptions = update.descriptions;
        object.exits = update.exits;
        object.movement = update.movement;
        object.learning = update.learning;
        Ok(())
    }

    fn move_object(
        &self,
        id: &ObjectId,
        destination: Option<&ObjectId>,
    ) -> Result<(), WorldError> {
        let mut objects = lock(&self.objects);
        if !objects.contains_key(id) {
            return Err(WorldError::NotFound(id.clone()));
        }
        if let Some(destination) = destination {
            if !objects.contains_key(destination) {
                return Err(WorldError::NotFound(destination.clone()));
            }
            if Self::ancestors(&objects, destination)
                .iter()
                .any(|ancestor| ancestor == id)
            {
                return Err(WorldError::Invalid(format!(
                    "moving {id} into {destination} would create a containment cycle"
                )));
            }
        }
        let previous = objects
            .get_mut(id)
            .map(|object| object.location.take())
            .unwrap_or(None);
        if let Some(previous) = previous {
            if let Some(container) = objects.get_mut(&previous) {
                container.content.remove(id);
            }
        }
        if let Some(destination) = destination {
            if let Some(container) = objects.get_mut(destination) {
                container.content.insert(id.clone());
            }
        }
        if let Some(object) = objects.get_mut(id) {
            object.location = destination.cloned();
        }
        Ok(())
    }

    fn allocate_object_id(&self) -> ObjectId {
        let objects = lock(&self.objects);
        loop {
            let serial = self.next_id.fetch_add(1, Ordering::SeqCst);
            let candidate = ObjectId::new(format!("obj-{serial}"));
            if !objects.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    fn create_object(&self, mut object: Object) -> Result<(), WorldError> {
        let mut objects = lock(&self.objects);
        if objects.contains_key(&object.id) {
            return Err(WorldError::Invalid(format!(
                "object {} already exists",
                object.id
            )));
        }
        if let Some(location) = object.location.clone() {
            let container = objects
                .get_mut(&location)
                .ok_or(WorldError::NotFound(location))?;
            container.content.insert(object.id.clone());
        }
        object.content.clear();
        objects.insert(object.id.clone(), object);
        Ok(())
    }

    fn remove_object(&self, id: &ObjectId) -> Result<(), WorldError> {
        let mut objects = lock(&self.objects);
        let object = objects.get(id).ok_or_else(|| WorldError::NotFound(id.clone()))?;
        if !object.content.is_empty() {
            return Err(WorldError::Invalid(format!(
                "object {id} still contains {} objects",
                object.content.len()
            )));
        }
        let location = object.location.clone();
        objects.remove(id);
        if let Some(location) = location {
            if let Some(container) = objects.get_mut(&location) {
                container.content.remove(id);
            }
        }
        Ok(())
    }

    fn load_resolved_source(&self, path: &str) -> Result<(String, u64), WorldError> {
        lock(&self.sources)
            .get(path)
            .cloned()
            .ok_or_else(|| WorldError::Storage(format!("no source registered at {path}")))
    }

    fn resolved_source_mod_time(&self, path: &str) -> Result<u64, WorldError> {
        lock(&self.sources)
            .get(path)
            .map(|(_, mod_time)| *mod_time)
            .ok_or_else(|| WorldError::Storage(format!("no source registered at {path}")))
    }
}

/// Interval records keyed by `(object, id)` with a locked update primitive.
#[derive(Default)]
pub struct MemoryIntervals {
    records: Mutex<BTreeMap<(ObjectId, IntervalId), Interval>>,
    next_id: AtomicU64,
}

impl MemoryIntervals {
    pub fn new() -> Self {
        MemoryIntervals {
            records: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl IntervalStore for MemoryIntervals {
    fn allocate_id(&self) -> IntervalId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn set(&self, interval: Interval) -> Result<(), WorldError> {
        lock(&self.records).insert((interval.object.clone(), interval.id), interval);
        Ok(())
    }

    fn update(
        &self,
        object: &ObjectId,
        id: IntervalId,
        mutate: &mut dyn FnMut(&mut Interval),
    ) -> Result<Option<Interval>, WorldError> {
        let mut records = lock(&self.records);
        match records.get_mut(&(object.clone(), id)) {
            Some(record) => {
                mutate(record);
                Ok(Some(record.clone()))
            }
            None => Ok(None),
        }
    }

    fn del(&self, object: &ObjectId, id: IntervalId) -> Result<bool, WorldError> {
        Ok(lock(&self.records).remove(&(object.clone(), id)).is_some())
    }

    fn count_for_object(&self, object: &ObjectId) -> usize {
        lock(&self.records)
            .keys()
            .filter(|(owner, _)| owner == object)
            .count()
    }

    fn each(&self, visit: &mut dyn FnMut(&Interval)) {
        for record in lock(&self.records).values() {
            visit(record);
        }
    }
}

/// Challenge predicate that always passes.
#[derive(Debug, Default)]
pub struct AllowChallenges;

impl Challenges for AllowChallenges {
    fn check(&self, _subject: &ObjectId, _target: &ObjectId) -> bool {
        true
    }
}

/// Challenge predicate with an explicit deny list, for tests.
#[derive(Default)]
pub struct ScriptedChallenges {
    denied: Mutex<Vec<(ObjectId, ObjectId)>>,
}

impl ScriptedChallenges {
    pub fn new() -> Self {
        ScriptedChallenges::default()
    }

    pub fn deny(&self, subject: impl Into<ObjectId>, target: impl Into<ObjectId>) {
        lock(&self.denied).push((subject.into(), target.into()));
    }
}

impl Challenges for ScriptedChallenges {
    fn check(&self, subject: &ObjectId, target: &ObjectId) -> bool {
        !lock(&self.denied)
            .iter()
            .any(|(s, t)| s == subject && t == target)
    }
}

/// Telemetry sink that records everything it is told.
#[derive(Default)]
pub struct CountingTelemetry {
    executions: Mutex<Vec<(ObjectId, ExecutionOutcome)>>,
    recovery_failures: Mutex<Vec<(ObjectId, IntervalId, String)>>,
}

impl CountingTelemetry {
    pub fn new() -> Self {
        CountingTelemetry::default()
    }

    pub fn outcome_count(&self, outcome: ExecutionOutcome) -> usize {
        lock(&self.executions)
            .iter()
            .filter(|(_, recorded)| *recorded == outcome)
            .count()
    }

    pub fn recovery_failure_count(&self) -> usize {
        lock(&self.recovery_failures).len()
    }
}

impl TelemetrySink for CountingTelemetry {
    fn execution(&self, object: &ObjectId, _duration: Duration, outcome: ExecutionOutcome) {
        lock(&self.executions).push((object.clone(), outcome));
    }

    fn recovery_failure(&self, object: &ObjectId, interval: IntervalId, error: &WorldError) {
        lock(&self.recovery_failures).push((object.clone(), interval, error.to_string()));
    }
}
