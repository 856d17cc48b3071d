//! Shared data model and collaborator contracts for the holt world server.
//!
//! Everything the behavioral core touches goes through the seams defined
//! here: the persistent [`Object`] record, the [`Call`] envelope delivered to
//! scripts, the durable [`Interval`] timers, the transient perception views,
//! and the collaborator traits in [`traits`]. The [`memory`] module provides
//! reference in-memory implementations of every collaborator; they back the
//! engine's test suites and the demo binary.

pub mod call;
pub mod error;
pub mod interval;
pub mod memory;
pub mod object;
pub mod traits;
pub mod view;

pub use call::{Call, CallTag, CallbackSet};
pub use error::WorldError;
pub use interval::{Interval, IntervalId};
pub use object::{Description, Exit, Learning, MovementProfile, Object, ObjectId};
pub use traits::{
    Challenges, EventPayload, EventQueue, ExecutionOutcome, ExecutionUpdate, IntervalStore,
    QueueEvent, Storage, TelemetrySink, Timestamp,
};
pub use view::{DeepNeighbourhood, Location, Movement, Neighbourhood};
