use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use holt_world::{
    Call, CallTag, Challenges, DeepNeighbourhood, EventPayload, EventQueue, Location, Movement,
    Object, ObjectId, QueueEvent, Storage, WorldError,
};
use serde::Serialize;
use tracing::debug;

/// Delay between a relocation and the moment observers perceive it, so
/// perception is decoupled from the transaction that caused the move.
pub const REACTION_DELAY: Duration = Duration::from_millis(250);

/// What a detector is told about one relocation: the movement itself plus
/// the first perspective object it was detected through.
#[derive(Debug, Clone, Serialize)]
struct MovementNotice {
    #[serde(flatten)]
    movement: Movement,
    via: ObjectId,
}

/// Computes observer sets for relocations and emits differentiated events to
/// each observer. Reads deep neighbourhoods and enqueues; never mutates
/// shared state directly.
pub struct MovementEngine {
    storage: Arc<dyn Storage>,
    queue: Arc<dyn EventQueue>,
    challenges: Arc<dyn Challenges>,
}

impl MovementEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        queue: Arc<dyn EventQueue>,
        challenges: Arc<dyn Challenges>,
    ) -> Self {
        MovementEngine {
            storage,
            queue,
            challenges,
        }
    }

    /// Notify every qualifying observer of one relocation, creation
    /// (`source` absent), or removal (`destination` absent).
    ///
    /// Detectors visible from both ends get a single combined event;
    /// detectors visible from only one end are never told about the other.
    /// The source and destination containers additionally get content
    /// lost/gained notifications, independent of the observer sets.
    pub fn emit_movement(
        &self,
        object: &Object,
        source: Option<&Location>,
        destination: Option<&Location>,
    ) -> Result<(), WorldError> {
        // The move itself already succeeded, so a location that fails to
        // load here is an invariant violation, not a soft miss.
        let source_detectors = match source {
            Some(location) => {
                let deep = DeepNeighbourhood::load(self.storage.as_ref(), &location.container.id)?;
                self.detectors(&deep, &object.id)
            }
            None => BTreeMap::new(),
        };
        let destination_detectors = match destination {
            Some(location) => {
                let deep = DeepNeighbourhood::load(self.storage.as_ref(), &location.container.id)?;
                self.detectors(&deep, &object.id)
            }
            None => BTreeMap::new(),
        };

        let source_id = source.map(|location| location.container.id.clone());
        let destination_id = destination.map(|location| location.container.id.clone());
        let at = self.queue.after(REACTION_DELAY);

        for (detector, via) in &source_detectors {
            let destination_seen = destination_detectors.contains_key(detector);
            let notice = MovementNotice {
                movement: Movement {
                    object: object.id.clone(),
                    source: source_id.clone(),
                    destination: destination_seen.then(|| destination_id.clone()).flatten(),
                },
                via: via.clone(),
            };
            self.push_notice(at, detector, notice)?;
        }
        for (detector, via) in &destination_detectors {
            if source_detectors.contains_key(detector) {
                continue;
            }
            let notice = MovementNotice {
                movement: Movement {
                    object: object.id.clone(),
                    source: None,
                    destination: destination_id.clone(),
                },
                via: via.clone(),
            };
            self.push_notice(at, detector, notice)?;
        }

        if let Some(container) = source_id {
            self.queue.push(QueueEvent {
                at,
                object: container,
                payload: EventPayload::Deliver {
                    call: Call::new(
                        "contentLost",
                        CallTag::Emit,
                        serde_json::json!({ "object": object.id }),
                    ),
                },
            })?;
        }
        if let Some(container) = destination_id {
            self.queue.push(QueueEvent {
                at,
                object: container,
                payload: EventPayload::Deliver {
                    call: Call::new(
                        "contentGained",
                        CallTag::Emit,
                        serde_json::json!({ "object": object.id }),
                    ),
                },
            })?;
        }
        Ok(())
    }

    /// Objects in `deep` that can perceive `mover`, each mapped to the first
    /// perspective object it was detected through.
    ///
    /// Scan order is fixed: the centre location first, then neighbours in
    /// exit order; within a location the container before its content in id
    /// order. The first passing challenge wins.
    fn detectors(
        &self,
        deep: &DeepNeighbourhood,
        mover: &ObjectId,
    ) -> BTreeMap<ObjectId, ObjectId> {
        let mut found = BTreeMap::new();
        for location in deep.locations() {
            let perspective = location.container.id.clone();
            let mut candidates: Vec<&Object> = Vec::with_capacity(location.content.len() + 1);
            candidates.push(&location.container);
            let mut content: Vec<&Object> = location.content.iter().collect();
            content.sort_by(|a, b| a.id.cmp(&b.id));
            candidates.extend(content);

            for candidate in candidates {
                if candidate.id == *mover || found.contains_key(&candidate.id) {
                    continue;
                }
                if self.challenges.check(&candidate.id, mover) {
                    found.insert(candidate.id.clone(), perspective.clone());
                }
            }
        }
        found
    }

    fn push_notice(
        &self,
        at: holt_world::Timestamp,
        detector: &ObjectId,
        notice: MovementNotice,
    ) -> Result<(), WorldError> {
        debug!(detector = %detector, object = %notice.movement.object, "movement notice");
        let content = serde_json::to_value(&notice)
            .map_err(|err| WorldError::Invalid(format!("encoding movement notice: {err}")))?;
        self.queue.push(QueueEvent {
            at,
            object: detector.clone(),
            payload: EventPayload::Deliver {
                call: Call::new("movement", CallTag::Emit, content),
            },
        })
    }
}
