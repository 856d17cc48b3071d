//! One sandboxed script execution: load source, install host callbacks, run
//! with a wall-clock deadline, and round-trip the object's JSON state.
//!
//! Every run gets a fresh VM with a restricted stdlib, so scripts have no
//! ambient I/O and nothing leaks between invocations. Side effects reach the
//! world only through the host callbacks installed by [`bindings`].

mod bindings;

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use holt_world::{
    Call, CallTag, CallbackSet, Challenges, EventQueue, Object, Storage, WorldError,
};
use mlua::{
    Function, HookTriggers, Lua, LuaOptions, LuaSerdeExt, MultiValue, RegistryKey, StdLib, Value,
};

use crate::intervals::IntervalScheduler;
use crate::movement::MovementEngine;
use crate::registry::ConnectionRegistry;

/// How often the deadline hook samples the clock, in VM instructions.
const HOOK_INSTRUCTION_INTERVAL: u32 = 2048;

/// Capabilities the host lends to one execution.
#[derive(Clone)]
pub struct HostEnv {
    pub storage: Arc<dyn Storage>,
    pub queue: Arc<dyn EventQueue>,
    pub challenges: Arc<dyn Challenges>,
    pub scheduler: Arc<IntervalScheduler>,
    pub movement: Arc<MovementEngine>,
    pub connections: Arc<ConnectionRegistry>,
}

/// One script execution request.
pub struct ScriptJob {
    pub source: String,
    /// Chunk name for error locations, usually the script path.
    pub origin: String,
    pub object: Object,
    pub call: Option<Call>,
    pub timeout: Duration,
    pub env: HostEnv,
}

/// Result of one execution.
///
/// `error == None` is the commit signal. On error the state and callback
/// extraction is still best-effort, but callers must discard it.
pub struct RunReport {
    /// Whether a listener was actually invoked; latched before the listener
    /// body runs, so a throw after invocation still counts.
    pub handled: bool,
    /// First value the invoked listener returned, when serializable.
    pub returned: Option<serde_json::Value>,
    pub state: serde_json::Value,
    pub callbacks: CallbackSet,
    /// Post-run object snapshot with accessor mutations applied.
    pub object: Object,
    pub error: Option<WorldError>,
}

pub(crate) struct Listener {
    pub(crate) tags: BTreeSet<CallTag>,
    pub(crate) key: RegistryKey,
}

/// Mutable per-run scope shared with the host callbacks.
pub(crate) struct ScriptScope {
    pub(crate) object: Object,
    pub(crate) listeners: BTreeMap<String, Listener>,
    pub(crate) handled: bool,
}

/// Execute one script job to completion. Synchronous; the executor calls
/// this on a blocking worker.
pub fn run(job: ScriptJob) -> RunReport {
    let ScriptJob {
        source,
        origin,
        object,
        call,
        timeout,
        env,
    } = job;
    let prior_state = object.state.clone();
    let prior_callbacks = object.callbacks.clone();

    let lua = match Lua::new_with(
        StdLib::MATH | StdLib::STRING | StdLib::TABLE,
        LuaOptions::default(),
    ) {
        Ok(lua) => lua,
        Err(err) => {
            let error = WorldError::script(&origin, err.to_string());
            return RunReport {
                handled: false,
                returned: None,
                state: prior_state,
                callbacks: prior_callbacks,
                object,
                error: Some(error),
            };
        }
    };

    let scope = Rc::new(RefCell::new(ScriptScope {
        object,
        listeners: BTreeMap::new(),
        handled: false,
    }));

    let prepared = bindings::install_globals(&lua, scope.clone(), &env)
        .and_then(|_| seed_state(&lua, &prior_state));
    let executed = match prepared {
        Ok(()) => with_deadline(&lua, timeout, || {
            // The whole chunk runs first so top-level registrations take
            // effect, then the matching listener (if any) is invoked.
            lua.load(&source).set_name(origin.as_str()).exec()?;
            match call.as_ref() {
                Some(call) => invoke_listener(&lua, &scope, call),
                None => Ok(None),
            }
        }),
        Err(err) => Err(err),
    };

    let (returned, mut error) = match executed {
        Ok(returned) => (returned, None),
        Err(err) => (None, Some(classify_error(err, &origin))),
    };
    let state = match extract_state(&lua) {
        Ok(state) => state,
        Err(err) => {
            if error.is_none() {
                error = Some(WorldError::script(
                    &origin,
                    format!("state is not serializable: {err}"),
                ));
            }
            prior_state
        }
    };

    let scope = scope.borrow();
    let callbacks: CallbackSet = scope
        .listeners
        .iter()
        .map(|(name, listener)| (name.clone(), listener.tags.clone()))
        .collect();
    let mut object = scope.object.clone();
    object.state = state.clone();
    object.callbacks = callbacks.clone();

    RunReport {
        handled: scope.handled,
        returned,
        state,
        callbacks,
        object,
        error,
    }
}

/// Bind the prior state JSON to the VM's global `state` before any script
/// code runs. A null prior state becomes an empty table.
fn seed_state(lua: &Lua, prior: &serde_json::Value) -> mlua::Result<()> {
    let value = if prior.is_null() {
        Value::Table(lua.create_table()?)
    } else {
        lua.to_value(prior)?
    };
    lua.globals().set("state", value)
}

/// Race `run` against the wall clock. The hook samples the elapsed time
/// every few thousand instructions and terminates the VM with the sentinel
/// timeout error once the budget is spent.
fn with_deadline<T>(
    lua: &Lua,
    budget: Duration,
    run: impl FnOnce() -> mlua::Result<T>,
) -> mlua::Result<T> {
    let started = Instant::now();
    let budget_ms = budget.as_millis() as u64;
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
        move |_lua, _debug| {
            if started.elapsed() >= budget {
                return Err(mlua::Error::external(WorldError::Timeout { budget_ms }));
            }
            Ok(())
        },
    );
    let out = run();
    lua.remove_hook();
    out
}

/// Invoke the registered listener for `(call.name, call.tag)`, if any, and
/// return the first value it returned when that value is serializable.
fn invoke_listener(
    lua: &Lua,
    scope: &Rc<RefCell<ScriptScope>>,
    call: &Call,
) -> mlua::Result<Option<serde_json::Value>> {
    let handler = {
        let scope = scope.borrow();
        match scope.listeners.get(&call.name) {
            Some(listener) if listener.tags.contains(&call.tag) => {
                Some(lua.registry_value::<Function>(&listener.key)?)
            }
            _ => None,
        }
    };
    let Some(handler) = handler else {
        return Ok(None);
    };
    scope.borrow_mut().handled = true;
    let payload = lua.to_value(&call.content)?;
    let results = handler.call::<_, MultiValue>(payload)?;
    Ok(results
        .into_iter()
        .next()
        .and_then(|value| lua.from_value::<serde_json::Value>(value).ok()))
}

fn extract_state(lua: &Lua) -> mlua::Result<serde_json::Value> {
    let value: Value = lua.globals().get("state")?;
    if let Value::Nil = value {
        return Ok(serde_json::json!({}));
    }
    lua.from_value(value)
}

/// Map a VM error back onto the shared taxonomy. Host-callback failures keep
/// their original classification (storage and scheduling errors pass through
/// unchanged); everything else is a script error carrying Lua's
/// file:line detail.
fn classify_error(err: mlua::Error, origin: &str) -> WorldError {
    if let Some(world) = find_world_error(&err) {
        return world;
    }
    WorldError::script(origin, err.to_string())
}

fn find_world_error(err: &mlua::Error) -> Option<WorldError> {
    match err {
        mlua::Error::CallbackError { cause, .. } => find_world_error(cause),
        mlua::Error::ExternalError(external) => external.downcast_ref::<WorldError>().cloned(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use holt_world::memory::{
        AllowChallenges, CountingTelemetry, ManualClock, MemoryIntervals, MemoryQueue, MemoryStore,
    };

    fn host_env() -> (HostEnv, Arc<MemoryQueue>) {
        let storage = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(Arc::new(ManualClock::at(0))));
        let intervals = Arc::new(MemoryIntervals::new());
        let challenges: Arc<dyn Challenges> = Arc::new(AllowChallenges);
        let telemetry = Arc::new(CountingTelemetry::new());
        let scheduler = Arc::new(IntervalScheduler::new(
            intervals,
            queue.clone(),
            telemetry,
        ));
        let movement = Arc::new(MovementEngine::new(
            storage.clone(),
            queue.clone(),
            challenges.clone(),
        ));
        let env = HostEnv {
            storage,
            queue: queue.clone(),
            challenges,
            scheduler,
            movement,
            connections: Arc::new(ConnectionRegistry::new()),
        };
        (env, queue)
    }

    fn job(source: &str, call: Option<Call>) -> ScriptJob {
        let (env, _) = host_env();
        ScriptJob {
            source: source.to_string(),
            origin: "test.lua".to_string(),
            object: Object::new("subject", "test.lua"),
            call,
            timeout: Duration::from_millis(200),
            env,
        }
    }

    #[test]
    fn round_trips_state_and_extracts_callbacks() {
        let source = r#"
state.count = (state.count or 0) + 1
addCallback("poke", {"command", "emit"}, function() end)
"#;
        let report = run(job(source, None));
        assert!(report.error.is_none(), "{:?}", report.error);
        assert_eq!(report.state["count"].as_f64(), Some(1.0));
        let tags = report.callbacks.get("poke").expect("poke listener");
        assert!(tags.contains(&CallTag::Command));
        assert!(tags.contains(&CallTag::Emit));
        assert!(!tags.contains(&CallTag::Action));
        assert!(!report.handled, "no call was supplied");
    }

    #[test]
    fn invokes_matching_listener_with_payload() {
        let source = r#"
addCallback("poke", {"command"}, function(content)
  state.poked_by = content.who
  return "ouch"
end)
"#;
        let call = Call::new(
            "poke",
            CallTag::Command,
            serde_json::json!({ "who": "badger" }),
        );
        let report = run(job(source, Some(call)));
        assert!(report.error.is_none(), "{:?}", report.error);
        assert!(report.handled);
        assert_eq!(report.state["poked_by"], serde_json::json!("badger"));
        assert_eq!(report.returned, Some(serde_json::json!("ouch")));
    }

    #[test]
    fn listener_without_a_return_value_reports_none() {
        let source = r#"addCallback("poke", {"command"}, function() end)"#;
        let call = Call::new("poke", CallTag::Command, serde_json::Value::Null);
        let report = run(job(source, Some(call)));
        assert!(report.handled);
        assert_eq!(report.returned, None);
    }

    #[test]
    fn tag_mismatch_is_not_handled() {
        let source = r#"addCallback("poke", {"command"}, function() end)"#;
        let call = Call::new("poke", CallTag::Action, serde_json::Value::Null);
        let report = run(job(source, Some(call)));
        assert!(report.error.is_none());
        assert!(!report.handled);
    }

    #[test]
    fn throw_after_invocation_still_counts_as_handled() {
        let source = r#"
addCallback("poke", {"command"}, function()
  error("deliberate")
end)
"#;
        let call = Call::new("poke", CallTag::Command, serde_json::Value::Null);
        let report = run(job(source, Some(call)));
        assert!(report.handled);
        match report.error {
            Some(WorldError::Script { ref message, .. }) => {
                assert!(message.contains("deliberate"), "{message}");
            }
            other => panic!("expected script error, got {other:?}"),
        }
    }

    #[test]
    fn runaway_script_hits_the_timeout_sentinel() {
        let source = r#"
state.touched = true
while true do end
"#;
        let started = Instant::now();
        let mut j = job(source, None);
        j.timeout = Duration::from_millis(50);
        let report = run(j);
        let elapsed = started.elapsed();
        assert!(
            matches!(report.error, Some(WorldError::Timeout { budget_ms: 50 })),
            "{:?}",
            report.error
        );
        // Termination within a coarse margin of the deadline, not hanging.
        assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    }

    #[test]
    fn script_error_reports_chunk_origin() {
        let report = run(job("this is not lua", None));
        match report.error {
            Some(WorldError::Script { ref origin, .. }) => assert_eq!(origin, "test.lua"),
            other => panic!("expected script error, got {other:?}"),
        }
    }

    #[test]
    fn sandbox_has_no_io_or_os_access() {
        let report = run(job("state.has_io = io ~= nil; state.has_os = os ~= nil", None));
        assert!(report.error.is_none(), "{:?}", report.error);
        assert_eq!(report.state["has_io"], serde_json::json!(false));
        assert_eq!(report.state["has_os"], serde_json::json!(false));
    }

    #[test]
    fn accessor_mutations_survive_in_the_snapshot() {
        let source = r#"setSkills({ sneak = 3.5, listen = 1.0 })"#;
        let report = run(job(source, None));
        assert!(report.error.is_none(), "{:?}", report.error);
        assert_eq!(report.object.skills.get("sneak"), Some(&3.5));
        assert_eq!(report.object.skills.get("listen"), Some(&1.0));
    }

    #[test]
    fn set_timeout_enqueues_a_delayed_call() {
        let (env, queue) = host_env();
        let j = ScriptJob {
            source: r#"setTimeout(1500, "wake", { reason = "nap over" })"#.to_string(),
            origin: "test.lua".to_string(),
            object: Object::new("sleeper", "test.lua"),
            call: None,
            timeout: Duration::from_millis(200),
            env,
        };
        let report = run(j);
        assert!(report.error.is_none(), "{:?}", report.error);
        let events = queue.drain_all();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].at, 1_500);
        assert_eq!(events[0].object, holt_world::ObjectId::new("sleeper"));
        assert_eq!(events[0].payload.call().name, "wake");
    }

    #[test]
    fn scheduling_failure_surfaces_as_a_thrown_exception() {
        // Below the 5000ms floor; setInterval must throw into the script,
        // and an uncaught throw keeps its scheduling classification.
        let report = run(job(r#"setInterval(10, "tick", {})"#, None));
        assert!(
            matches!(report.error, Some(WorldError::Scheduling(_))),
            "{:?}",
            report.error
        );

        // A script can also catch it and carry on.
        let source = r#"
local ok = pcall(function() setInterval(10, "tick", {}) end)
state.rejected = not ok
"#;
        let report = run(job(source, None));
        assert!(report.error.is_none(), "{:?}", report.error);
        assert_eq!(report.state["rejected"], serde_json::json!(true));
    }
}
