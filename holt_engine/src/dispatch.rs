use std::sync::Arc;

use holt_world::{Call, CallTag, Challenges, Location, ObjectId, Storage, WorldError};
use tracing::debug;

use crate::executor::ObjectExecutor;
use crate::movement::MovementEngine;

/// Resolves which object a session line or queued call lands on.
///
/// Candidate order for typed commands is fixed: the actor's own command
/// table, then the location and each sibling as actions (siblings in id
/// order), and only after every script declined, a matching location exit.
/// Exits come last so scripted behavior can intercept an exit name before it
/// triggers movement.
pub struct CallDispatcher {
    storage: Arc<dyn Storage>,
    challenges: Arc<dyn Challenges>,
    executor: Arc<ObjectExecutor>,
    movement: Arc<MovementEngine>,
}

impl CallDispatcher {
    pub fn new(
        storage: Arc<dyn Storage>,
        challenges: Arc<dyn Challenges>,
        executor: Arc<ObjectExecutor>,
    ) -> Self {
        let movement = executor.movement();
        CallDispatcher {
            storage,
            challenges,
            executor,
            movement,
        }
    }

    /// Walk one typed player line through the candidate chain. Returns
    /// whether anything handled it; the session loop turns `false` into a
    /// human-readable failure line.
    pub async fn dispatch_command(&self, actor: &ObjectId, line: &str) -> Result<bool, WorldError> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(true);
        };
        let args: Vec<&str> = words.collect();
        let content = serde_json::json!({ "verb": verb, "args": args, "line": line });

        let command = Call::new(verb, CallTag::Command, content.clone());
        if self.executor.run(actor, &command).await? {
            return Ok(true);
        }

        let actor_object = self.storage.access_object(actor)?;
        let Some(location_id) = actor_object.location else {
            return Ok(false);
        };

        let action = Call::new(verb, CallTag::Action, content);
        if self.executor.run(&location_id, &action).await? {
            return Ok(true);
        }
        let location = self.storage.access_object(&location_id)?;
        for sibling in location.content.iter().filter(|sibling| *sibling != actor) {
            if self.executor.run(sibling, &action).await? {
                return Ok(true);
            }
        }

        if let Some(exit) = location.exit_named(verb) {
            if self.challenges.check(actor, &exit.destination) {
                let destination_id = exit.destination.clone();
                debug!(actor = %actor, exit = verb, destination = %destination_id, "exit traversal");
                let source = Location::load(self.storage.as_ref(), &location_id)?;
                self.storage.move_object(actor, Some(&destination_id))?;
                let destination = Location::load(self.storage.as_ref(), &destination_id)?;
                let moved = self.storage.access_object(actor)?;
                self.movement
                    .emit_movement(&moved, Some(&source), Some(&destination))?;
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Queue-delivered dispatch: an emit goes straight to its addressed
    /// recipient, with no synchronous candidate chain.
    pub async fn deliver(&self, target: &ObjectId, call: &Call) -> Result<bool, WorldError> {
        self.executor.run(target, call).await
    }
}
