//! Runtime configuration for the addon engine.
//!
//! The config is a plain `Resource` so systems can read it through `Res<AddonsConfig>`; it is
//! deserialized once at startup and cloned into the app. Every field has a default so a partial
//! (or missing) config file still yields a usable value.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bevy::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Resource, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AddonsConfig {
    /// Location of the persisted addon document.
    pub data_file: PathBuf,
    /// Aliases naming dynamic landmark classes. Resolution of these aliases never goes through
    /// the discovery collaborator, even when no instance currently exists.
    pub mobile_aliases: Vec<String>,
    /// Vertical distance (metres) between an aim point and the terrain under it that still counts
    /// as "on terrain" when a spawn command records a definition.
    pub terrain_snap_tolerance: f32,
    /// Start replication as soon as the discovery collaborator becomes available.
    pub auto_start: bool,
}

impl Default for AddonsConfig {
    fn default() -> Self {
        Self {
            data_file: PathBuf::from("data/landmark_addons.json"),
            mobile_aliases: Vec::new(),
            terrain_snap_tolerance: 0.25,
            auto_start: true,
        }
    }
}

impl AddonsConfig {
    pub fn from_json_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(contents)?)
    }

    /// Reads the config at `path`. A missing file is not an error: defaults apply.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => Self::from_json_str(&contents),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}
