use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::call::{CallTag, CallbackSet};

/// Identity of a world entity. The universe root is not an object; an object
/// whose `location` is `None` sits at the root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        ObjectId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(value: &str) -> Self {
        ObjectId(value.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(value: String) -> Self {
        ObjectId(value)
    }
}

/// One way of describing an object to an observer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Description {
    pub name: String,
    #[serde(default)]
    pub short: String,
    #[serde(default)]
    pub long: String,
}

/// A named passage from a container to another container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exit {
    pub name: String,
    pub destination: ObjectId,
}

/// How an object moves, when it does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementProfile {
    #[serde(default = "MovementProfile::default_mode")]
    pub mode: String,
    #[serde(default = "MovementProfile::default_speed")]
    pub speed: f64,
}

impl MovementProfile {
    fn default_mode() -> String {
        "walk".to_string()
    }

    fn default_speed() -> f64 {
        1.0
    }
}

impl Default for MovementProfile {
    fn default() -> Self {
        MovementProfile {
            mode: Self::default_mode(),
            speed: Self::default_speed(),
        }
    }
}

/// Skill advancement configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Learning {
    #[serde(default = "Learning::default_rate")]
    pub rate: f64,
}

impl Learning {
    fn default_rate() -> f64 {
        1.0
    }
}

impl Default for Learning {
    fn default() -> Self {
        Learning {
            rate: Self::default_rate(),
        }
    }
}

/// A world entity: a script, its opaque JSON state, and its containment
/// relationships.
///
/// `content` and `location` are kept mutually consistent by the storage
/// collaborator; the core only ever changes them through the storage
/// move/create/remove primitives. The script-owned fields (`state`,
/// `callbacks`, the typed accessors' fields, and `source_mod_time`) are
/// mutated only by the object's own executor run, under its per-object lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub id: ObjectId,
    #[serde(default)]
    pub location: Option<ObjectId>,
    #[serde(default)]
    pub content: BTreeSet<ObjectId>,
    pub source_path: String,
    /// Script version (milliseconds) the cached `callbacks` were captured at.
    #[serde(default)]
    pub source_mod_time: u64,
    #[serde(default)]
    pub state: serde_json::Value,
    #[serde(default)]
    pub callbacks: CallbackSet,
    #[serde(default)]
    pub skills: BTreeMap<String, f64>,
    #[serde(default)]
    pub descriptions: Vec<Description>,
    #[serde(default)]
    pub exits: Vec<Exit>,
    #[serde(default)]
    pub movement: MovementProfile,
    #[serde(default)]
    pub learning: Learning,
}

impl Object {
    pub fn new(id: impl Into<ObjectId>, source_path: impl Into<String>) -> Self {
        Object {
            id: id.into(),
            location: None,
            content: BTreeSet::new(),
            source_path: source_path.into(),
            source_mod_time: 0,
            state: serde_json::Value::Null,
            callbacks: CallbackSet::new(),
            skills: BTreeMap::new(),
            descriptions: Vec::new(),
            exits: Vec::new(),
            movement: MovementProfile::default(),
            learning: Learning::default(),
        }
    }

    /// Whether the cached callback set has a listener for `(name, tag)`.
    pub fn listens_for(&self, name: &str, tag: CallTag) -> bool {
        self.callbacks
            .get(name)
            .map(|tags| tags.contains(&tag))
            .unwrap_or(false)
    }

    pub fn exit_named(&self, name: &str) -> Option<&Exit> {
        self.exits.iter().find(|exit| exit.name == name)
    }
}
