//! Controller registry: one controller per live addon definition, each owning the adapters (live
//! replicas) spawned for it.
//!
//! The registry also keeps the replica -> addon index used when the host reports that a replica
//! entity went away. All mutation happens on the main schedule, from exclusive systems or
//! observers, so there is no locking.

use std::collections::HashMap;

use bevy::prelude::*;
use serde_json::Value;

use crate::landmark::{LandmarkHandle, LandmarkInstance};
use crate::store::{AddonDefinition, AddonId};

/// Marker placed on every replica entity. Its removal (despawn included) is the single
/// notification path for "this replica is gone".
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replica {
    pub addon: AddonId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControllerId(u64);

/// One live replica at one landmark instance.
#[derive(Debug, Clone)]
pub struct Adapter {
    pub replica: Entity,
    pub landmark: LandmarkInstance,
}

/// All live replicas of one addon definition.
#[derive(Debug)]
pub struct Controller {
    id: ControllerId,
    definition: AddonDefinition,
    alias: String,
    adapters: Vec<Adapter>,
}

impl Controller {
    pub fn id(&self) -> ControllerId {
        self.id
    }

    pub fn addon(&self) -> AddonId {
        self.definition.id
    }

    pub fn definition(&self) -> &AddonDefinition {
        &self.definition
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn adapters(&self) -> &[Adapter] {
        &self.adapters
    }

    pub fn adapter_count(&self) -> usize {
        self.adapters.len()
    }

    pub fn replicas(&self) -> impl Iterator<Item = Entity> + '_ {
        self.adapters.iter().map(|adapter| adapter.replica)
    }

    pub fn adapter_for(&self, replica: Entity) -> Option<&Adapter> {
        self.adapters.iter().find(|adapter| adapter.replica == replica)
    }

    pub fn has_adapter_at(&self, landmark: LandmarkHandle) -> bool {
        self.adapters
            .iter()
            .any(|adapter| adapter.landmark.handle == landmark)
    }

    pub(crate) fn set_plugin_data(&mut self, data: Value) {
        self.definition.plugin_data = Some(data);
    }

    fn remove_adapter(&mut self, replica: Entity) -> Option<Adapter> {
        let index = self
            .adapters
            .iter()
            .position(|adapter| adapter.replica == replica)?;
        Some(self.adapters.remove(index))
    }
}

/// Reported when an adapter is dropped because its replica disappeared.
#[derive(Debug, Clone)]
pub struct LostAdapter {
    pub addon: AddonId,
    pub adapter: Adapter,
    /// The controller was removed because this was its last adapter.
    pub controller_removed: bool,
}

#[derive(Resource, Debug, Default)]
pub struct ControllerRegistry {
    controllers: HashMap<AddonId, Controller>,
    replicas: HashMap<Entity, AddonId>,
    next_id: u64,
}

impl ControllerRegistry {
    /// The controller for `definition`, created if absent.
    pub fn ensure_controller(
        &mut self,
        definition: &AddonDefinition,
        alias: &str,
    ) -> &mut Controller {
        let next_id = &mut self.next_id;
        self.controllers.entry(definition.id).or_insert_with(|| {
            let id = ControllerId(*next_id);
            *next_id += 1;
            Controller {
                id,
                definition: definition.clone(),
                alias: alias.to_owned(),
                adapters: Vec::new(),
            }
        })
    }

    /// Records a freshly spawned replica under `definition`'s controller.
    pub fn register_adapter(
        &mut self,
        definition: &AddonDefinition,
        alias: &str,
        adapter: Adapter,
    ) {
        self.replicas.insert(adapter.replica, definition.id);
        self.ensure_controller(definition, alias).adapters.push(adapter);
    }

    /// Removes the mapping for `addon`. Adapters are not destroyed here; replica index entries
    /// stay until their replicas report in, and are then ignored.
    pub fn unregister(&mut self, addon: AddonId) -> Option<Controller> {
        self.controllers.remove(&addon)
    }

    /// Drops the adapter of `replica`, removing its controller when that was the last one.
    /// Safe to call more than once for the same replica.
    pub fn on_replica_lost(&mut self, replica: Entity) -> Option<LostAdapter> {
        let addon = self.replicas.remove(&replica)?;
        let controller = self.controllers.get_mut(&addon)?;
        let adapter = controller.remove_adapter(replica)?;
        let controller_removed = controller.adapters.is_empty();
        if controller_removed {
            self.controllers.remove(&addon);
        }
        Some(LostAdapter {
            addon,
            adapter,
            controller_removed,
        })
    }

    pub fn controller(&self, addon: AddonId) -> Option<&Controller> {
        self.controllers.get(&addon)
    }

    pub fn addon_for_replica(&self, replica: Entity) -> Option<AddonId> {
        self.replicas
            .get(&replica)
            .copied()
            .filter(|addon| self.controllers.contains_key(addon))
    }

    pub fn controller_for_replica(&self, replica: Entity) -> Option<&Controller> {
        self.addon_for_replica(replica)
            .and_then(|addon| self.controllers.get(&addon))
    }

    pub(crate) fn controller_for_replica_mut(
        &mut self,
        replica: Entity,
    ) -> Option<&mut Controller> {
        let addon = self.addon_for_replica(replica)?;
        self.controllers.get_mut(&addon)
    }

    pub fn controllers(&self) -> impl Iterator<Item = &Controller> {
        self.controllers.values()
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    pub fn adapter_count(&self) -> usize {
        self.controllers.values().map(Controller::adapter_count).sum()
    }
}
