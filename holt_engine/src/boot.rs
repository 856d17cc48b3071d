//! World bootstrap: read a `world.toml` manifest plus its Lua scripts from
//! disk and seed the object store.

use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use anyhow::{bail, Context, Result};
use holt_world::memory::MemoryStore;
use holt_world::{Object, ObjectId, Storage};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct WorldManifest {
    #[serde(default, rename = "object")]
    pub objects: Vec<ManifestObject>,
}

#[derive(Debug, Deserialize)]
pub struct ManifestObject {
    pub id: String,
    pub script: String,
    #[serde(default)]
    pub location: Option<String>,
}

/// Load `root/world.toml`, register every referenced script with its file
/// modification time, and create the objects containers-first.
pub fn load_world(root: &Path, storage: &MemoryStore) -> Result<()> {
    let manifest_path = root.join("world.toml");
    let text = fs::read_to_string(&manifest_path)
        .with_context(|| format!("reading world manifest {}", manifest_path.display()))?;
    let manifest: WorldManifest = toml::from_str(&text)
        .with_context(|| format!("parsing world manifest {}", manifest_path.display()))?;

    for entry in &manifest.objects {
        let script_path = root.join(&entry.script);
        let source = fs::read_to_string(&script_path)
            .with_context(|| format!("reading script {}", script_path.display()))?;
        let mod_time = fs::metadata(&script_path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0);
        storage.put_source(&entry.script, &source, mod_time);
    }

    // Containers before occupants, so every `location` resolves when its
    // occupant is created.
    let mut pending: Vec<&ManifestObject> = manifest.objects.iter().collect();
    let mut created = std::collections::BTreeSet::new();
    while !pending.is_empty() {
        let before = pending.len();
        pending.retain(|entry| {
            let ready = match entry.location.as_deref() {
                None => true,
                Some(location) => created.contains(location),
            };
            if !ready {
                return true;
            }
            let mut object = Object::new(entry.id.as_str(), entry.script.as_str());
            object.location = entry.location.as_deref().map(ObjectId::from);
            if let Err(err) = storage.create_object(object) {
                info!(object = %entry.id, error = %err, "object creation failed");
            }
            created.insert(entry.id.clone());
            false
        });
        if pending.len() == before {
            let unresolved: Vec<&str> = pending.iter().map(|entry| entry.id.as_str()).collect();
            bail!(
                "world manifest has unresolvable locations for: {}",
                unresolved.join(", ")
            );
        }
    }

    info!(
        objects = manifest.objects.len(),
        root = %root.display(),
        "world loaded"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) {
        let mut file = fs::File::create(dir.join(name)).expect("create file");
        file.write_all(contents.as_bytes()).expect("write file");
    }

    #[test]
    fn loads_objects_containers_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_file(
            dir.path(),
            "world.toml",
            r#"
[[object]]
id = "nest"
script = "nest.lua"

[[object]]
id = "egg"
script = "egg.lua"
location = "nest"
"#,
        );
        write_file(dir.path(), "nest.lua", "-- nest\n");
        write_file(dir.path(), "egg.lua", "-- egg\n");

        let storage = MemoryStore::new();
        load_world(dir.path(), &storage).expect("load world");

        let nest = storage.access_object(&ObjectId::new("nest")).expect("nest");
        assert!(nest.content.contains(&ObjectId::new("egg")));
        let egg = storage.access_object(&ObjectId::new("egg")).expect("egg");
        assert_eq!(egg.location, Some(ObjectId::new("nest")));
        assert!(storage.resolved_source_mod_time("egg.lua").expect("mtime") > 0);
    }

    #[test]
    fn reports_unresolvable_locations() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_file(
            dir.path(),
            "world.toml",
            r#"
[[object]]
id = "ghost"
script = "ghost.lua"
location = "nowhere"
"#,
        );
        write_file(dir.path(), "ghost.lua", "-- ghost\n");

        let storage = MemoryStore::new();
        let err = load_world(dir.path(), &storage).expect_err("must fail");
        assert!(err.to_string().contains("ghost"));
    }
}
