use std::sync::Arc;

use holt_world::{
    Call, CallTag, EventPayload, EventQueue, Interval, IntervalId, IntervalStore, ObjectId,
    QueueEvent, TelemetrySink, Timestamp, WorldError,
};
use tracing::warn;

/// Shortest cadence a script may request.
pub const MIN_INTERVAL_MS: u64 = 5_000;

/// Ceiling on live intervals per owning object.
pub const MAX_INTERVALS_PER_OBJECT: usize = 10;

/// Persists script-requested repeating timers, re-enqueues the next tick
/// after each fire, and replays missed ticks after a restart.
pub struct IntervalScheduler {
    store: Arc<dyn IntervalStore>,
    queue: Arc<dyn EventQueue>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl IntervalScheduler {
    pub fn new(
        store: Arc<dyn IntervalStore>,
        queue: Arc<dyn EventQueue>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        IntervalScheduler {
            store,
            queue,
            telemetry,
        }
    }

    /// Create an interval and enqueue its first fire.
    ///
    /// If the enqueue fails after the record was persisted, the record is
    /// deleted again so no orphaned interval outlives its first event.
    pub fn set_interval(
        &self,
        object: &ObjectId,
        interval_ms: u64,
        event_name: &str,
        event_data: serde_json::Value,
    ) -> Result<IntervalId, WorldError> {
        if interval_ms < MIN_INTERVAL_MS {
            return Err(WorldError::Scheduling(format!(
                "interval of {interval_ms}ms is below the {MIN_INTERVAL_MS}ms minimum"
            )));
        }
        if self.store.count_for_object(object) >= MAX_INTERVALS_PER_OBJECT {
            return Err(WorldError::Scheduling(format!(
                "object {object} already holds {MAX_INTERVALS_PER_OBJECT} intervals"
            )));
        }
        let id = self.store.allocate_id();
        let interval = Interval {
            object: object.clone(),
            id,
            interval_ms,
            event_name: event_name.to_string(),
            event_data,
            next_fire: self.queue.now() + interval_ms,
        };
        self.store.set(interval.clone())?;
        if let Err(err) = self.queue.push(fire_event(&interval, 0)) {
            let _ = self.store.del(object, id);
            return Err(err);
        }
        Ok(id)
    }

    /// Idempotent delete; clearing an unknown interval is success.
    pub fn clear_interval(&self, object: &ObjectId, id: IntervalId) -> Result<(), WorldError> {
        self.store.del(object, id).map(|_| ())
    }

    /// Drop every interval owned by `object` (object removal path).
    pub fn clear_for_object(&self, object: &ObjectId) -> Result<(), WorldError> {
        let mut owned = Vec::new();
        self.store.each(&mut |interval| {
            if interval.object == *object {
                owned.push(interval.id);
            }
        });
        for id in owned {
            self.store.del(object, id)?;
        }
        Ok(())
    }

    /// Fire-to-reschedule step, run after a fired interval's handler
    /// completes.
    ///
    /// The stored record is advanced atomically before the next event is
    /// enqueued; enqueueing first would let a concurrent `clearInterval`
    /// race ahead and be silently overridden. A record that no longer exists
    /// was cleared concurrently and stays cleared.
    pub fn reschedule(&self, object: &ObjectId, id: IntervalId) -> Result<(), WorldError> {
        let now = self.queue.now();
        let updated = self.store.update(object, id, &mut |record| {
            record.next_fire = now + record.interval_ms;
        })?;
        match updated {
            Some(record) => self.queue.push(fire_event(&record, 0)),
            None => Ok(()),
        }
    }

    /// Replay persisted intervals after a restart. Runs once, before the
    /// pump starts serving traffic. Returns how many intervals were
    /// re-enqueued; per-interval failures are logged and reported to
    /// telemetry without aborting the rest of the pass.
    pub fn recover_intervals(&self) -> usize {
        let now = self.queue.now();
        let mut records = Vec::new();
        self.store.each(&mut |interval| records.push(interval.clone()));

        let mut recovered = 0;
        for record in records {
            match self.recover_one(&record, now) {
                Ok(true) => recovered += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        object = %record.object,
                        interval = record.id,
                        error = %err,
                        "interval recovery failed"
                    );
                    self.telemetry
                        .recovery_failure(&record.object, record.id, &err);
                }
            }
        }
        recovered
    }

    fn recover_one(&self, record: &Interval, now: Timestamp) -> Result<bool, WorldError> {
        if record.next_fire > now {
            // Clean shutdown: the original cadence is preserved exactly.
            // Still goes through the atomic update so a clear racing this
            // pass wins.
            let current = self.store.update(&record.object, record.id, &mut |_| {})?;
            return match current {
                Some(current) => {
                    self.queue.push(fire_event(&current, 0))?;
                    Ok(true)
                }
                None => Ok(false),
            };
        }
        // Missed ticks collapse into one catch-up event carrying the count;
        // fractional remainders are dropped, not accumulated.
        let missed = (now - record.next_fire) / record.interval_ms;
        let updated = self.store.update(&record.object, record.id, &mut |current| {
            current.next_fire = now;
        })?;
        match updated {
            Some(updated) => {
                self.queue.push(fire_event(&updated, missed))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Interval deliveries always carry `{"missed": n, "data": ...}` so handlers
/// see one payload shape; only the recovery catch-up event has `missed > 0`.
fn fire_event(interval: &Interval, missed: u64) -> QueueEvent {
    QueueEvent {
        at: interval.next_fire,
        object: interval.object.clone(),
        payload: EventPayload::IntervalFire {
            interval: interval.id,
            call: Call::new(
                interval.event_name.clone(),
                CallTag::Emit,
                serde_json::json!({
                    "missed": missed,
                    "data": interval.event_data,
                }),
            ),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use holt_world::memory::{CountingTelemetry, ManualClock, MemoryIntervals, MemoryQueue};

    struct Fixture {
        clock: Arc<ManualClock>,
        queue: Arc<MemoryQueue>,
        store: Arc<MemoryIntervals>,
        telemetry: Arc<CountingTelemetry>,
        scheduler: IntervalScheduler,
    }

    fn fixture(now: Timestamp) -> Fixture {
        let clock = Arc::new(ManualClock::at(now));
        let queue = Arc::new(MemoryQueue::new(clock.clone()));
        let store = Arc::new(MemoryIntervals::new());
        let telemetry = Arc::new(CountingTelemetry::new());
        let scheduler = IntervalScheduler::new(store.clone(), queue.clone(), telemetry.clone());
        Fixture {
            clock,
            queue,
            store,
            telemetry,
            scheduler,
        }
    }

    fn missed_of(event: &QueueEvent) -> u64 {
        event.payload.call().content["missed"]
            .as_u64()
            .expect("missed count")
    }

    #[test]
    fn rejects_sub_minimum_cadence() {
        let fx = fixture(0);
        let clock_id = ObjectId::new("clock");
        let err = fx
            .scheduler
            .set_interval(&clock_id, 4_999, "tick", serde_json::Value::Null)
            .expect_err("4999ms must be rejected");
        assert!(matches!(err, WorldError::Scheduling(_)));

        fx.scheduler
            .set_interval(&clock_id, 5_000, "tick", serde_json::Value::Null)
            .expect("5000ms is the accepted minimum");
        assert_eq!(fx.queue.len(), 1);
    }

    /// Queue that refuses every push, for the rollback path.
    struct RejectingQueue {
        inner: MemoryQueue,
    }

    impl EventQueue for RejectingQueue {
        fn push(&self, _event: QueueEvent) -> Result<(), WorldError> {
            Err(WorldError::Scheduling("queue rejected the event".to_string()))
        }

        fn now(&self) -> Timestamp {
            self.inner.now()
        }

        fn after(&self, delay: std::time::Duration) -> Timestamp {
            self.inner.after(delay)
        }

        fn pop_due(&self, now: Timestamp) -> Option<QueueEvent> {
            self.inner.pop_due(now)
        }

        fn peek_at(&self) -> Option<Timestamp> {
            self.inner.peek_at()
        }
    }

    #[test]
    fn failed_first_enqueue_rolls_the_record_back() {
        let queue = Arc::new(RejectingQueue {
            inner: MemoryQueue::new(Arc::new(ManualClock::at(0))),
        });
        let store = Arc::new(MemoryIntervals::new());
        let telemetry = Arc::new(CountingTelemetry::new());
        let scheduler = IntervalScheduler::new(store.clone(), queue, telemetry);
        let clock_id = ObjectId::new("clock");

        let err = scheduler
            .set_interval(&clock_id, 5_000, "tick", serde_json::Value::Null)
            .expect_err("enqueue failure must surface");
        assert!(matches!(err, WorldError::Scheduling(_)));
        assert_eq!(
            store.count_for_object(&clock_id),
            0,
            "no orphaned interval outlives its first event"
        );
    }

    #[test]
    fn rejects_eleventh_interval_for_one_object() {
        let fx = fixture(0);
        let clock_id = ObjectId::new("clock");
        for _ in 0..MAX_INTERVALS_PER_OBJECT {
            fx.scheduler
                .set_interval(&clock_id, 5_000, "tick", serde_json::Value::Null)
                .expect("interval within the cap");
        }
        let err = fx
            .scheduler
            .set_interval(&clock_id, 5_000, "tick", serde_json::Value::Null)
            .expect_err("the eleventh interval must be rejected");
        assert!(matches!(err, WorldError::Scheduling(_)));
        assert_eq!(fx.store.count_for_object(&clock_id), MAX_INTERVALS_PER_OBJECT);

        // Another object is unaffected by the first one's cap.
        fx.scheduler
            .set_interval(&ObjectId::new("other"), 5_000, "tick", serde_json::Value::Null)
            .expect("per-object cap only");
    }

    #[test]
    fn reschedule_advances_then_enqueues() {
        let fx = fixture(0);
        let clock_id = ObjectId::new("clock");
        let id = fx
            .scheduler
            .set_interval(&clock_id, 5_000, "tick", serde_json::Value::Null)
            .expect("set");
        let first = fx.queue.drain_all();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].at, 5_000);

        fx.clock.set(5_100);
        fx.scheduler.reschedule(&clock_id, id).expect("reschedule");
        let second = fx.queue.drain_all();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].at, 10_100);
        assert_eq!(missed_of(&second[0]), 0);
    }

    #[test]
    fn reschedule_after_clear_does_not_resurrect() {
        let fx = fixture(0);
        let clock_id = ObjectId::new("clock");
        let id = fx
            .scheduler
            .set_interval(&clock_id, 5_000, "tick", serde_json::Value::Null)
            .expect("set");
        fx.queue.drain_all();

        fx.scheduler.clear_interval(&clock_id, id).expect("clear");
        fx.scheduler.reschedule(&clock_id, id).expect("reschedule");
        assert!(fx.queue.is_empty());
        // Clearing again is still success.
        fx.scheduler.clear_interval(&clock_id, id).expect("idempotent clear");
    }

    #[test]
    fn recovery_collapses_missed_ticks_into_one_fire() {
        let fx = fixture(10_000);
        let clock_id = ObjectId::new("clock");
        fx.store
            .set(Interval {
                object: clock_id.clone(),
                id: 7,
                interval_ms: 1_000,
                event_name: "tick".to_string(),
                event_data: serde_json::Value::Null,
                next_fire: 4_500,
            })
            .expect("seed record");

        assert_eq!(fx.scheduler.recover_intervals(), 1);
        let events = fx.queue.drain_all();
        assert_eq!(events.len(), 1, "one catch-up fire, not five replays");
        assert_eq!(events[0].at, 10_000);
        assert_eq!(missed_of(&events[0]), 5);

        let record = fx
            .store
            .update(&clock_id, 7, &mut |_| {})
            .expect("read back")
            .expect("record survives recovery");
        assert_eq!(record.next_fire, 10_000);
    }

    #[test]
    fn recovery_preserves_future_cadence_unchanged() {
        let fx = fixture(10_000);
        let clock_id = ObjectId::new("clock");
        fx.store
            .set(Interval {
                object: clock_id.clone(),
                id: 3,
                interval_ms: 60_000,
                event_name: "tick".to_string(),
                event_data: serde_json::Value::Null,
                next_fire: 42_000,
            })
            .expect("seed record");

        assert_eq!(fx.scheduler.recover_intervals(), 1);
        let events = fx.queue.drain_all();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].at, 42_000);
        assert_eq!(missed_of(&events[0]), 0);
        assert_eq!(fx.telemetry.recovery_failure_count(), 0);
    }

    #[test]
    fn clear_for_object_leaves_other_owners_alone() {
        let fx = fixture(0);
        let clock_id = ObjectId::new("clock");
        let other_id = ObjectId::new("other");
        fx.scheduler
            .set_interval(&clock_id, 5_000, "tick", serde_json::Value::Null)
            .expect("set");
        fx.scheduler
            .set_interval(&other_id, 5_000, "tock", serde_json::Value::Null)
            .expect("set");

        fx.scheduler.clear_for_object(&clock_id).expect("clear all");
        assert_eq!(fx.store.count_for_object(&clock_id), 0);
        assert_eq!(fx.store.count_for_object(&other_id), 1);
    }
}
