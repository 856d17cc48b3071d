use serde::{Deserialize, Serialize};

use crate::object::ObjectId;
use crate::traits::Timestamp;

/// Store-unique identity of a durable repeating timer.
pub type IntervalId = u64;

/// A durable, script-requested repeating timer.
///
/// Created by a script's `setInterval`, mutated only through the interval
/// store's atomic update step, deleted by `clearInterval` or when the owning
/// object is removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub object: ObjectId,
    pub id: IntervalId,
    pub interval_ms: u64,
    pub event_name: String,
    /// Opaque payload captured at creation time.
    pub event_data: serde_json::Value,
    pub next_fire: Timestamp,
}
