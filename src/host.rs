//! Host-world boundary: the components and collaborators the engine expects the surrounding game
//! to provide.
//!
//! Replicas are ordinary entities. The components below are the host's own vocabulary for
//! persistence, damage, pickup, power and ground checks; the engine only flips them during
//! hardening. The prefab catalog describes which components a freshly constructed prefab carries
//! by default, mirroring what the host would attach when it instantiates the prefab itself.

use std::collections::BTreeMap;
use std::sync::Arc;

use bevy::prelude::*;

/// Prefab path the entity was built from.
#[derive(Component, Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrefabId(pub String);

/// Whether the host's own save/restore cycle records this entity.
#[derive(Component, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SavePolicy {
    #[default]
    Persist,
    Disabled,
}

#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct Health {
    pub current: f32,
    pub invulnerable: bool,
}

/// Players may pick up or salvage the entity.
#[derive(Component, Debug, Clone, Copy, Default)]
pub struct Pickup;

#[derive(Component, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Power {
    pub powered: bool,
}

/// Host behaviour that despawns the entity when the ground beneath it disappears.
#[derive(Component, Debug, Clone, Copy, Default)]
pub struct GroundWatch;

/// Marks an entity parented to a moving landmark so the host moves it along.
#[derive(Component, Debug, Clone, Copy, Default)]
pub struct MovesWithParent;

/// Default component set of a host prefab.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefabTemplate {
    pub short_name: String,
    pub health: Option<f32>,
    pub pickup: bool,
    pub powered: Option<bool>,
    pub ground_watch: bool,
}

impl PrefabTemplate {
    pub fn new(short_name: impl Into<String>) -> Self {
        Self {
            short_name: short_name.into(),
            health: None,
            pickup: false,
            powered: None,
            ground_watch: false,
        }
    }

    pub fn with_health(mut self, health: f32) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_pickup(mut self) -> Self {
        self.pickup = true;
        self
    }

    pub fn with_power(mut self) -> Self {
        self.powered = Some(false);
        self
    }

    pub fn with_ground_watch(mut self) -> Self {
        self.ground_watch = true;
        self
    }
}

/// Every prefab the host can construct, keyed by full prefab path.
#[derive(Resource, Debug, Clone, Default)]
pub struct PrefabCatalog {
    prefabs: BTreeMap<String, PrefabTemplate>,
}

impl PrefabCatalog {
    pub fn insert(&mut self, path: impl Into<String>, template: PrefabTemplate) -> &mut Self {
        self.prefabs.insert(path.into(), template);
        self
    }

    pub fn get(&self, path: &str) -> Option<&PrefabTemplate> {
        self.prefabs.get(path)
    }

    pub fn len(&self) -> usize {
        self.prefabs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefabs.is_empty()
    }

    /// Case-insensitive lookup of a (possibly partial) name token.
    ///
    /// An exact match on either the full path or the short name wins outright; otherwise every
    /// path or short name containing the token is returned, in path order.
    pub fn find_matches(&self, token: &str) -> Vec<&str> {
        let needle = token.to_lowercase();
        let exact: Vec<&str> = self
            .prefabs
            .iter()
            .filter(|(path, template)| {
                path.to_lowercase() == needle || template.short_name.to_lowercase() == needle
            })
            .map(|(path, _)| path.as_str())
            .collect();
        if !exact.is_empty() {
            return exact;
        }

        self.prefabs
            .iter()
            .filter(|(path, template)| {
                path.to_lowercase().contains(&needle)
                    || template.short_name.to_lowercase().contains(&needle)
            })
            .map(|(path, _)| path.as_str())
            .collect()
    }

    /// Instantiates `path` with its default component set. Returns `None` for unknown prefabs.
    pub fn construct(&self, world: &mut World, path: &str, transform: Transform) -> Option<Entity> {
        let template = self.get(path)?;
        let mut entity = world.spawn((
            Name::new(template.short_name.clone()),
            PrefabId(path.to_owned()),
            transform,
            SavePolicy::Persist,
        ));
        if let Some(current) = template.health {
            entity.insert(Health {
                current,
                invulnerable: false,
            });
        }
        if template.pickup {
            entity.insert(Pickup);
        }
        if let Some(powered) = template.powered {
            entity.insert(Power { powered });
        }
        if template.ground_watch {
            entity.insert(GroundWatch);
        }
        Some(entity.id())
    }
}

/// The host's terrain height query.
pub trait TerrainSampler: Send + Sync {
    fn height_at(&self, x: f32, z: f32) -> f32;
}

/// Optional terrain collaborator. Without it, terrain-snapped definitions keep their computed
/// height.
#[derive(Resource, Clone)]
pub struct Terrain(pub Arc<dyn TerrainSampler>);

impl Terrain {
    pub fn new(sampler: impl TerrainSampler + 'static) -> Self {
        Self(Arc::new(sampler))
    }

    pub fn height_at(&self, x: f32, z: f32) -> f32 {
        self.0.height_at(x, z)
    }
}

/// Perfectly flat terrain at a fixed height.
#[derive(Debug, Clone, Copy)]
pub struct FlatTerrain(pub f32);

impl TerrainSampler for FlatTerrain {
    fn height_at(&self, _x: f32, _z: f32) -> f32 {
        self.0
    }
}
