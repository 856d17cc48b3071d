//! Host callbacks installed into every script VM.
//!
//! Scripts never see native references: every global here marshals explicit
//! arguments, calls into the capability objects carried by [`HostEnv`], and
//! marshals plain values back. Failures from the collaborators are thrown
//! into the script as errors that keep their original classification.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use holt_world::{
    Call, CallTag, Challenges, EventPayload, EventQueue, Location, Neighbourhood, Object, ObjectId,
    QueueEvent, Storage, WorldError,
};
use mlua::{Function, Lua, LuaSerdeExt, Result as LuaResult, Table, Value, Variadic};
use tracing::debug;

use super::{HostEnv, Listener, ScriptScope};

pub(super) fn install_globals(
    lua: &Lua,
    scope: Rc<RefCell<ScriptScope>>,
    env: &HostEnv,
) -> LuaResult<()> {
    let self_id = scope.borrow().object.id.clone();
    install_log(lua, &self_id, env)?;
    install_listeners(lua, scope.clone())?;
    install_queries(lua, &self_id, env)?;
    install_accessors(lua, scope.clone())?;
    install_world_mutators(lua, &self_id, scope, env)?;
    install_emitters(lua, &self_id, env)?;
    install_timers(lua, &self_id, env)?;
    Ok(())
}

fn external(err: WorldError) -> mlua::Error {
    mlua::Error::external(err)
}

fn describe_value(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(flag) => flag.to_string(),
        Value::Integer(number) => number.to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(text) => text.to_string_lossy().into_owned(),
        other => format!("<{}>", other.type_name()),
    }
}

fn join_args(args: &Variadic<Value>) -> String {
    args.iter()
        .map(describe_value)
        .collect::<Vec<_>>()
        .join(" ")
}

fn install_log(lua: &Lua, self_id: &ObjectId, env: &HostEnv) -> LuaResult<()> {
    let globals = lua.globals();

    let id = self_id.clone();
    let connections = env.connections.clone();
    let log = lua.create_function(move |_, args: Variadic<Value>| {
        let line = join_args(&args);
        debug!(target: "holt_script", object = %id, "{line}");
        connections.send_line(&id, format!("log: {line}"));
        Ok(())
    })?;
    globals.set("log", log)?;

    let id = self_id.clone();
    let connections = env.connections.clone();
    let print = lua.create_function(move |_, args: Variadic<Value>| {
        // Best-effort write to the live connection; silently nothing
        // without one.
        connections.send_line(&id, join_args(&args));
        Ok(())
    })?;
    globals.set("print", print)?;

    Ok(())
}

fn install_listeners(lua: &Lua, scope: Rc<RefCell<ScriptScope>>) -> LuaResult<()> {
    let register = lua.create_function(
        move |lua, (name, tags, handler): (String, Table, Function)| {
            let mut parsed = BTreeSet::new();
            for tag in tags.sequence_values::<String>() {
                let tag = tag?;
                let tag = CallTag::parse(&tag).ok_or_else(|| {
                    mlua::Error::RuntimeError(format!("unknown call tag {tag:?}"))
                })?;
                parsed.insert(tag);
            }
            if parsed.is_empty() {
                return Err(mlua::Error::RuntimeError(
                    "addCallback needs at least one tag".to_string(),
                ));
            }
            let key = lua.create_registry_value(handler)?;
            scope
                .borrow_mut()
                .listeners
                .insert(name, Listener { tags: parsed, key });
            Ok(())
        },
    )?;
    lua.globals().set("addCallback", register)
}

fn install_queries(lua: &Lua, self_id: &ObjectId, env: &HostEnv) -> LuaResult<()> {
    let globals = lua.globals();

    let id = self_id.clone();
    let get_id = lua.create_function(move |_, ()| Ok(id.to_string()))?;
    globals.set("getId", get_id)?;

    let id = self_id.clone();
    let storage = env.storage.clone();
    let get_neighbourhood = lua.create_function(move |lua, ()| {
        // Read the live record so a script that moved itself sees its new
        // surroundings.
        let current = storage.access_object(&id).map_err(external)?;
        match current.location {
            None => Ok(Value::Nil),
            Some(location) => {
                let view = Neighbourhood::load(storage.as_ref(), &location).map_err(external)?;
                lua.to_value(&view)
            }
        }
    })?;
    globals.set("getNeighbourhood", get_neighbourhood)?;

    Ok(())
}

/// Typed get/set pairs for the script-mutable object fields. Mutations land
/// on the in-run snapshot and are persisted by the executor's commit, so a
/// failed run discards them along with `state`.
fn install_accessors(lua: &Lua, scope: Rc<RefCell<ScriptScope>>) -> LuaResult<()> {
    let globals = lua.globals();

    let reader = scope.clone();
    let get_skills =
        lua.create_function(move |lua, ()| lua.to_value(&reader.borrow().object.skills))?;
    globals.set("getSkills", get_skills)?;
    let writer = scope.clone();
    let set_skills = lua.create_function(move |lua, value: Value| {
        let parsed: BTreeMap<String, f64> = lua.from_value(value)?;
        writer.borrow_mut().object.skills = parsed;
        Ok(())
    })?;
    globals.set("setSkills", set_skills)?;

    let reader = scope.clone();
    let get_descriptions =
        lua.create_function(move |lua, ()| lua.to_value(&reader.borrow().object.descriptions))?;
    globals.set("getDescriptions", get_descriptions)?;
    let writer = scope.clone();
    let set_descriptions = lua.create_function(move |lua, value: Value| {
        let parsed: Vec<holt_world::Description> = lua.from_value(value)?;
        writer.borrow_mut().object.descriptions = parsed;
        Ok(())
    })?;
    globals.set("setDescriptions", set_descriptions)?;

    let reader = scope.clone();
    let get_exits =
        lua.create_function(move |lua, ()| lua.to_value(&reader.borrow().object.exits))?;
    globals.set("getExits", get_exits)?;
    let writer = scope.clone();
    let set_exits = lua.create_function(move |lua, value: Value| {
        let parsed: Vec<holt_world::Exit> = lua.from_value(value)?;
        writer.borrow_mut().object.exits = parsed;
        Ok(())
    })?;
    globals.set("setExits", set_exits)?;

    let reader = scope.clone();
    let get_movement =
        lua.create_function(move |lua, ()| lua.to_value(&reader.borrow().object.movement))?;
    globals.set("getMovement", get_movement)?;
    let writer = scope.clone();
    let set_movement = lua.create_function(move |lua, value: Value| {
        let parsed: holt_world::MovementProfile = lua.from_value(value)?;
        writer.borrow_mut().object.movement = parsed;
        Ok(())
    })?;
    globals.set("setMovement", set_movement)?;

    let reader = scope.clone();
    let get_learning =
        lua.create_function(move |lua, ()| lua.to_value(&reader.borrow().object.learning))?;
    globals.set("getLearning", get_learning)?;
    let writer = scope;
    let set_learning = lua.create_function(move |lua, value: Value| {
        let parsed: holt_world::Learning = lua.from_value(value)?;
        writer.borrow_mut().object.learning = parsed;
        Ok(())
    })?;
    globals.set("setLearning", set_learning)?;

    Ok(())
}

fn install_world_mutators(
    lua: &Lua,
    self_id: &ObjectId,
    scope: Rc<RefCell<ScriptScope>>,
    env: &HostEnv,
) -> LuaResult<()> {
    let globals = lua.globals();

    let id = self_id.clone();
    let mover_env = env.clone();
    let mover_scope = scope.clone();
    let move_object = lua.create_function(
        move |_, (target, destination): (String, Option<String>)| {
            let target = ObjectId::new(target);
            let destination = destination.map(ObjectId::new);
            let before = mover_env.storage.access_object(&target).map_err(external)?;
            let source = match before.location.as_ref() {
                Some(location) => Some(
                    Location::load(mover_env.storage.as_ref(), location).map_err(external)?,
                ),
                None => None,
            };
            mover_env
                .storage
                .move_object(&target, destination.as_ref())
                .map_err(external)?;
            let landed = match destination.as_ref() {
                Some(destination) => Some(
                    Location::load(mover_env.storage.as_ref(), destination).map_err(external)?,
                ),
                None => None,
            };
            let moved = mover_env.storage.access_object(&target).map_err(external)?;
            mover_env
                .movement
                .emit_movement(&moved, source.as_ref(), landed.as_ref())
                .map_err(external)?;
            if target == id {
                // Keep the executing snapshot coherent with its own move.
                mover_scope.borrow_mut().object.location = moved.location;
            }
            Ok(())
        },
    )?;
    globals.set("moveObject", move_object)?;

    let creator_env = env.clone();
    let create_object = lua.create_function(move |lua, spec: Value| {
        #[derive(serde::Deserialize)]
        struct CreateSpec {
            source_path: String,
            #[serde(default)]
            location: Option<String>,
        }
        let spec: CreateSpec = lua.from_value(spec)?;
        let id = creator_env.storage.allocate_object_id();
        let mut object = Object::new(id.clone(), spec.source_path);
        object.location = spec.location.map(ObjectId::new);
        creator_env
            .storage
            .create_object(object.clone())
            .map_err(external)?;
        let landed = match object.location.as_ref() {
            Some(location) => Some(
                Location::load(creator_env.storage.as_ref(), location).map_err(external)?,
            ),
            None => None,
        };
        creator_env
            .movement
            .emit_movement(&object, None, landed.as_ref())
            .map_err(external)?;
        Ok(id.to_string())
    })?;
    globals.set("createObject", create_object)?;

    let id = self_id.clone();
    let remover_env = env.clone();
    let remover_scope = scope;
    let remove_object = lua.create_function(move |_, target: String| {
        let target = ObjectId::new(target);
        if target == id {
            return Err(mlua::Error::RuntimeError(
                "cannot remove the executing object".to_string(),
            ));
        }
        let occupied = remover_scope.borrow().object.location.clone();
        if occupied.as_ref() == Some(&target) {
            return Err(mlua::Error::RuntimeError(
                "cannot remove the location you occupy".to_string(),
            ));
        }
        let doomed = remover_env.storage.access_object(&target).map_err(external)?;
        let source = match doomed.location.as_ref() {
            Some(location) => Some(
                Location::load(remover_env.storage.as_ref(), location).map_err(external)?,
            ),
            None => None,
        };
        remover_env.storage.remove_object(&target).map_err(external)?;
        remover_env
            .scheduler
            .clear_for_object(&target)
            .map_err(external)?;
        remover_env
            .movement
            .emit_movement(&doomed, source.as_ref(), None)
            .map_err(external)?;
        Ok(())
    })?;
    globals.set("removeObject", remove_object)?;

    Ok(())
}

fn install_emitters(lua: &Lua, self_id: &ObjectId, env: &HostEnv) -> LuaResult<()> {
    let globals = lua.globals();

    let emitter_env = env.clone();
    let emit = lua.create_function(
        move |lua, (target, name, content): (String, String, Value)| {
            let content: serde_json::Value = lua.from_value(content)?;
            emitter_env
                .queue
                .push(QueueEvent {
                    at: emitter_env.queue.now(),
                    object: ObjectId::new(target),
                    payload: EventPayload::Deliver {
                        call: Call::new(name, CallTag::Emit, content),
                    },
                })
                .map_err(external)
        },
    )?;
    globals.set("emit", emit)?;

    let id = self_id.clone();
    let emitter_env = env.clone();
    let emit_to_location = lua.create_function(
        move |lua, (location, name, content, gated): (String, String, Value, Option<bool>)| {
            let content: serde_json::Value = lua.from_value(content)?;
            let location = ObjectId::new(location);
            let view =
                Location::load(emitter_env.storage.as_ref(), &location).map_err(external)?;
            let gated = gated.unwrap_or(false);
            let at = emitter_env.queue.now();
            let mut recipients = vec![view.container.id.clone()];
            recipients.extend(view.content.iter().map(|object| object.id.clone()));
            for recipient in recipients {
                if recipient == id {
                    continue;
                }
                if gated && !emitter_env.challenges.check(&recipient, &id) {
                    continue;
                }
                emitter_env
                    .queue
                    .push(QueueEvent {
                        at,
                        object: recipient,
                        payload: EventPayload::Deliver {
                            call: Call::new(name.clone(), CallTag::Emit, content.clone()),
                        },
                    })
                    .map_err(external)?;
            }
            Ok(())
        },
    )?;
    globals.set("emitToLocation", emit_to_location)?;

    Ok(())
}

fn install_timers(lua: &Lua, self_id: &ObjectId, env: &HostEnv) -> LuaResult<()> {
    let globals = lua.globals();

    let id = self_id.clone();
    let timer_env = env.clone();
    let set_timeout = lua.create_function(
        move |lua, (delay_ms, name, content): (u64, String, Value)| {
            let content: serde_json::Value = lua.from_value(content)?;
            timer_env
                .queue
                .push(QueueEvent {
                    at: timer_env
                        .queue
                        .after(std::time::Duration::from_millis(delay_ms)),
                    object: id.clone(),
                    payload: EventPayload::Deliver {
                        call: Call::new(name, CallTag::Emit, content),
                    },
                })
                .map_err(external)
        },
    )?;
    globals.set("setTimeout", set_timeout)?;

    let id = self_id.clone();
    let timer_env = env.clone();
    let set_interval = lua.create_function(
        move |lua, (interval_ms, name, content): (u64, String, Value)| {
            let content: serde_json::Value = lua.from_value(content)?;
            timer_env
                .scheduler
                .set_interval(&id, interval_ms, &name, content)
                .map_err(external)
        },
    )?;
    globals.set("setInterval", set_interval)?;

    let id = self_id.clone();
    let timer_env = env.clone();
    let clear_interval = lua.create_function(move |_, interval: u64| {
        timer_env
            .scheduler
            .clear_interval(&id, interval)
            .map_err(external)
    })?;
    globals.set("clearInterval", clear_interval)?;

    Ok(())
}
