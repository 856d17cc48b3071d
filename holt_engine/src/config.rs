use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::Args;
use crate::executor::DEFAULT_SCRIPT_TIMEOUT;

/// Optional on-disk configuration; every field has a flag equivalent and the
/// flag wins.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub world_root: Option<PathBuf>,
    pub avatar: Option<String>,
    pub script_timeout_ms: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub world_root: PathBuf,
    pub avatar: String,
    pub script_timeout: Duration,
}

pub fn resolve(args: &Args) -> Result<Settings> {
    let file = match args.config.as_ref() {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let world_root = args
        .world_root
        .clone()
        .or(file.world_root)
        .unwrap_or_else(|| PathBuf::from("demos/meadow"));
    let avatar = args
        .avatar
        .clone()
        .or(file.avatar)
        .unwrap_or_else(|| "visitor".to_string());
    let script_timeout = args
        .script_timeout_ms
        .or(file.script_timeout_ms)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_SCRIPT_TIMEOUT);
    Ok(Settings {
        world_root,
        avatar,
        script_timeout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn flags_win_over_file_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_path = dir.path().join("holt.toml");
        fs::write(
            &config_path,
            "avatar = \"badger\"\nscript_timeout_ms = 900\n",
        )
        .expect("write config");

        let args = Args::parse_from([
            "holt_engine",
            "--config",
            config_path.to_str().expect("utf8 path"),
            "--avatar",
            "stoat",
        ]);
        let settings = resolve(&args).expect("resolve");
        assert_eq!(settings.avatar, "stoat");
        assert_eq!(settings.script_timeout, Duration::from_millis(900));
        assert_eq!(settings.world_root, PathBuf::from("demos/meadow"));
    }
}
