//! Addon store: the versioned, persisted mapping from landmark alias to addon definitions.
//!
//! The store is the authoritative source of truth. It is rewritten in full on every mutation
//! through a pluggable `StoreBackend`; a process restart replays it from scratch, so nothing else
//! in the engine needs to persist.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bevy::prelude::*;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::kinds::BUILTIN_KIND;
use crate::migration::{self, CURRENT_VERSION};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed addon document: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("failed to serialize addon document: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Runtime identity of one stored definition. Assigned on load/add, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddonId(Uuid);

impl AddonId {
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for AddonId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// One addon: what to build and where, in the local frame of its landmark type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddonDefinition {
    #[serde(skip, default = "AddonId::fresh")]
    pub id: AddonId,
    #[serde(default)]
    pub prefab: String,
    #[serde(with = "vector")]
    pub position: Vec3,
    #[serde(default)]
    pub rotation_angle: f32,
    #[serde(default)]
    pub on_terrain: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_addon_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_data: Option<serde_json::Value>,
}

impl AddonDefinition {
    pub fn prefab(prefab: impl Into<String>, position: Vec3, rotation_angle: f32) -> Self {
        Self {
            id: AddonId::fresh(),
            prefab: prefab.into(),
            position,
            rotation_angle,
            on_terrain: false,
            custom_addon_name: None,
            plugin_data: None,
        }
    }

    pub fn custom(
        kind: impl Into<String>,
        position: Vec3,
        rotation_angle: f32,
        plugin_data: serde_json::Value,
    ) -> Self {
        Self {
            custom_addon_name: Some(kind.into()),
            plugin_data: Some(plugin_data),
            ..Self::prefab(String::new(), position, rotation_angle)
        }
    }

    pub fn with_on_terrain(mut self, on_terrain: bool) -> Self {
        self.on_terrain = on_terrain;
        self
    }

    /// Key into the kind dispatch table.
    pub fn kind_name(&self) -> &str {
        self.custom_addon_name.as_deref().unwrap_or(BUILTIN_KIND)
    }

    /// Identifier handed to the kind's spawn callback: the custom addon name, or the prefab path
    /// for built-in prefabs.
    pub fn kind_id(&self) -> &str {
        self.custom_addon_name.as_deref().unwrap_or(&self.prefab)
    }
}

/// Structural equality; the runtime id is ignored.
impl PartialEq for AddonDefinition {
    fn eq(&self, other: &Self) -> bool {
        self.prefab == other.prefab
            && self.position == other.position
            && self.rotation_angle == other.rotation_angle
            && self.on_terrain == other.on_terrain
            && self.custom_addon_name == other.custom_addon_name
            && self.plugin_data == other.plugin_data
    }
}

mod vector {
    use bevy::math::Vec3;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Xyz {
        #[serde(default)]
        x: f32,
        #[serde(default)]
        y: f32,
        #[serde(default)]
        z: f32,
    }

    pub fn serialize<S: Serializer>(value: &Vec3, serializer: S) -> Result<S::Ok, S::Error> {
        Xyz {
            x: value.x,
            y: value.y,
            z: value.z,
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec3, D::Error> {
        let Xyz { x, y, z } = Xyz::deserialize(deserializer)?;
        Ok(Vec3::new(x, y, z))
    }
}

/// The persisted document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredData {
    /// Schema version; missing means 0.
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub monuments: BTreeMap<String, Vec<AddonDefinition>>,
}

impl StoredData {
    pub fn current() -> Self {
        Self {
            version: CURRENT_VERSION,
            monuments: BTreeMap::new(),
        }
    }

    pub fn from_json_str(contents: &str) -> StoreResult<Self> {
        serde_json::from_str(contents).map_err(StoreError::Parse)
    }

    pub fn to_json_string(&self) -> StoreResult<String> {
        serde_json::to_string_pretty(self).map_err(StoreError::Serialize)
    }
}

/// Durable storage for the whole document.
pub trait StoreBackend: Send + Sync {
    /// Current contents, or `None` when nothing was ever written.
    fn read(&self) -> StoreResult<Option<String>>;

    /// Replaces the stored contents.
    fn write(&self, contents: &str) -> StoreResult<()>;
}

impl<B: StoreBackend + ?Sized> StoreBackend for Arc<B> {
    fn read(&self) -> StoreResult<Option<String>> {
        (**self).read()
    }

    fn write(&self, contents: &str) -> StoreResult<()> {
        (**self).write(contents)
    }
}

/// JSON document on disk.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl StoreBackend for JsonFileBackend {
    fn read(&self) -> StoreResult<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(self.io_error(err)),
        }
    }

    fn write(&self, contents: &str) -> StoreResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| self.io_error(err))?;
        }
        fs::write(&self.path, contents).map_err(|err| self.io_error(err))
    }
}

/// In-memory backend for testing/development. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    contents: Arc<RwLock<Option<String>>>,
    writes: Arc<AtomicUsize>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn with_contents(contents: impl Into<String>) -> Self {
        let backend = Self::default();
        *backend.contents.write() = Some(contents.into());
        backend
    }

    pub fn contents(&self) -> Option<String> {
        self.contents.read().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Makes every subsequent write fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }
}

impl StoreBackend for MemoryBackend {
    fn read(&self) -> StoreResult<Option<String>> {
        Ok(self.contents.read().clone())
    }

    fn write(&self, contents: &str) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StoreError::Backend("writes are disabled".into()));
        }
        *self.contents.write() = Some(contents.to_owned());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Resource)]
pub struct AddonStore {
    data: StoredData,
    backend: Box<dyn StoreBackend>,
}

impl AddonStore {
    /// Empty store at the current schema version. Nothing is written until the first mutation.
    pub fn empty(backend: impl StoreBackend + 'static) -> Self {
        Self {
            data: StoredData::current(),
            backend: Box::new(backend),
        }
    }

    /// Reads the document, runs pending migrations and writes it back once if any migration
    /// changed it. Storage is left untouched otherwise.
    pub fn load(backend: impl StoreBackend + 'static) -> StoreResult<Self> {
        let Some(contents) = backend.read()? else {
            return Ok(Self::empty(backend));
        };

        let mut data = StoredData::from_json_str(&contents)?;
        let store_version = data.version;
        let migrated = migration::migrate(&mut data);
        let store = Self {
            data,
            backend: Box::new(backend),
        };
        if migrated {
            info!(
                "Migrated addon document from version {} to {}",
                store_version, store.data.version
            );
            if let Err(err) = store.save() {
                warn!("Failed to persist migrated addon document: {}", err);
            }
        }
        Ok(store)
    }

    pub fn save(&self) -> StoreResult<()> {
        self.backend.write(&self.data.to_json_string()?)
    }

    pub fn data(&self) -> &StoredData {
        &self.data
    }

    /// Appends `definition` under `alias` and persists. On a persistence error the definition
    /// stays in memory; the error is returned for the caller to report.
    pub fn add(&mut self, definition: AddonDefinition, alias: &str) -> StoreResult<()> {
        self.data
            .monuments
            .entry(alias.to_owned())
            .or_default()
            .push(definition);
        self.save()
    }

    /// Removes `definition` from whichever bucket holds it: the entry with the same runtime id
    /// if present, otherwise the first structurally equal one. Persists only when something was
    /// removed.
    pub fn remove(&mut self, definition: &AddonDefinition) -> StoreResult<bool> {
        let position = self
            .locate(|entry| entry.id == definition.id)
            .or_else(|| self.locate(|entry| entry == definition));
        let Some((alias, index)) = position else {
            return Ok(false);
        };

        if let Some(bucket) = self.data.monuments.get_mut(&alias) {
            bucket.remove(index);
            if bucket.is_empty() {
                self.data.monuments.remove(&alias);
            }
        }
        self.save()?;
        Ok(true)
    }

    /// Replaces the opaque config of the definition `id`. Returns `Ok(false)` when it is gone.
    pub fn set_plugin_data(&mut self, id: AddonId, data: serde_json::Value) -> StoreResult<bool> {
        let entry = self
            .data
            .monuments
            .values_mut()
            .flat_map(|bucket| bucket.iter_mut())
            .find(|entry| entry.id == id);
        let Some(entry) = entry else {
            return Ok(false);
        };
        entry.plugin_data = Some(data);
        self.save()?;
        Ok(true)
    }

    fn locate(&self, predicate: impl Fn(&AddonDefinition) -> bool) -> Option<(String, usize)> {
        self.data.monuments.iter().find_map(|(alias, bucket)| {
            bucket
                .iter()
                .position(&predicate)
                .map(|index| (alias.clone(), index))
        })
    }

    pub fn find(&self, id: AddonId) -> Option<(&str, &AddonDefinition)> {
        self.iter().find(|(_, definition)| definition.id == id)
    }

    pub fn contains(&self, id: AddonId) -> bool {
        self.find(id).is_some()
    }

    pub fn definitions_for(&self, alias: &str) -> &[AddonDefinition] {
        self.data
            .monuments
            .get(alias)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.data.monuments.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AddonDefinition)> {
        self.data.monuments.iter().flat_map(|(alias, bucket)| {
            bucket
                .iter()
                .map(move |definition| (alias.as_str(), definition))
        })
    }

    pub fn len(&self) -> usize {
        self.data.monuments.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
