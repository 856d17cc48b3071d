use serde::{Deserialize, Serialize};

use crate::error::WorldError;
use crate::object::{Object, ObjectId};
use crate::traits::Storage;

/// A container paired with its resolved content. Built on demand, never
/// persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Location {
    pub container: Object,
    pub content: Vec<Object>,
}

impl Location {
    pub fn load(storage: &dyn Storage, container: &ObjectId) -> Result<Self, WorldError> {
        let container = storage.access_object(container)?;
        let mut content = Vec::with_capacity(container.content.len());
        for id in &container.content {
            content.push(storage.access_object(id)?);
        }
        Ok(Location { container, content })
    }
}

/// A location plus the containers reachable through its exits.
#[derive(Debug, Clone, Serialize)]
pub struct Neighbourhood {
    pub location: Location,
    pub neighbours: Vec<Object>,
}

impl Neighbourhood {
    /// Exits whose destination fails to load are skipped rather than failing
    /// the whole view; a dangling exit must not make a room unreadable.
    pub fn load(storage: &dyn Storage, container: &ObjectId) -> Result<Self, WorldError> {
        let location = Location::load(storage, container)?;
        let mut neighbours = Vec::new();
        for exit in &location.container.exits {
            if let Ok(neighbour) = storage.access_object(&exit.destination) {
                neighbours.push(neighbour);
            }
        }
        Ok(Neighbourhood {
            location,
            neighbours,
        })
    }
}

/// A location, its content, and the resolved content of every location one
/// exit hop away.
#[derive(Debug, Clone, Serialize)]
pub struct DeepNeighbourhood {
    pub location: Location,
    pub neighbours: Vec<Location>,
}

impl DeepNeighbourhood {
    pub fn load(storage: &dyn Storage, container: &ObjectId) -> Result<Self, WorldError> {
        let location = Location::load(storage, container)?;
        let mut neighbours = Vec::new();
        for exit in &location.container.exits {
            if let Ok(neighbour) = Location::load(storage, &exit.destination) {
                neighbours.push(neighbour);
            }
        }
        Ok(DeepNeighbourhood {
            location,
            neighbours,
        })
    }

    /// The locations of this view in detector scan order: the centre first,
    /// then neighbours in exit order.
    pub fn locations(&self) -> impl Iterator<Item = &Location> {
        std::iter::once(&self.location).chain(self.neighbours.iter())
    }
}

/// One relocation event, used only as an in-flight message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movement {
    pub object: ObjectId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ObjectId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<ObjectId>,
}
