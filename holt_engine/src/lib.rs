//! Behavioral core of the holt world server.
//!
//! Four subsystems carry the actual engineering risk: the sandboxed
//! [`script_host`] that runs untrusted per-object Lua with a wall-clock
//! budget, the [`executor`] that serializes execution per object and commits
//! state only on success, the durable [`intervals`] scheduler that survives
//! restarts, and the [`movement`] engine that computes who perceives each
//! relocation. [`runtime::Engine`] wires them to the collaborator contracts
//! from `holt_world` and pumps the event queue.

pub mod boot;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod executor;
pub mod intervals;
pub mod movement;
pub mod registry;
pub mod runtime;
pub mod script_host;
