//! Controller and adapter operations against the live `World`.
//!
//! The bookkeeping types live in `registry`; this module builds replicas (`spawn_at`), tears them
//! down (`destroy_all`, `destroy_adapter`) and reacts to replicas vanishing (`on_replica_removed`).
//! Kind-specific behaviour is always reached through `AddonKinds`.

use std::sync::Arc;

use bevy::prelude::*;
use serde_json::Value;

use crate::hardening::harden_replica;
use crate::host::Terrain;
use crate::kinds::{builtin_prefab_kind, AddonKind, AddonKinds, SpawnRequest};
use crate::landmark::{LandmarkHandle, LandmarkInstance};
use crate::registry::{Adapter, ControllerRegistry, Replica};
use crate::scheduler::{Batch, BatchHandle, BatchScheduler};
use crate::store::{AddonId, AddonStore};

/// Owns the controller registry and kind table, and wires replica removal back into them.
pub struct ControllerPlugin;

impl Plugin for ControllerPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<ControllerRegistry>()
            .init_resource::<AddonKinds>()
            .observe(on_replica_removed);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpawnError {
    #[error("addon {0} is no longer stored")]
    DefinitionRemoved(AddonId),

    #[error("landmark instance no longer exists")]
    LandmarkGone,

    #[error("addon {0} already has a replica at this landmark")]
    AlreadySpawned(AddonId),

    #[error("no addon kind named '{0}' is registered")]
    UnknownKind(String),

    #[error("kind '{kind}' could not construct '{kind_id}'")]
    ConstructionFailed { kind: String, kind_id: String },
}

impl SpawnError {
    /// Expected races (the definition was killed, the landmark drove away) rather than faults.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            Self::DefinitionRemoved(_) | Self::LandmarkGone | Self::AlreadySpawned(_)
        )
    }
}

/// Builds one replica of `addon` at `instance` and registers its adapter.
///
/// The definition is re-read from the store and the landmark re-validated first, so stale batch
/// items fail cleanly instead of resurrecting killed addons or spawning on despawned landmarks.
pub fn spawn_at(
    world: &mut World,
    addon: AddonId,
    instance: &LandmarkInstance,
) -> Result<Entity, SpawnError> {
    let (alias, definition) = world
        .resource::<AddonStore>()
        .find(addon)
        .map(|(alias, definition)| (alias.to_owned(), definition.clone()))
        .ok_or(SpawnError::DefinitionRemoved(addon))?;
    let landmark = instance.refreshed(world).ok_or(SpawnError::LandmarkGone)?;

    let already_spawned = world
        .resource::<ControllerRegistry>()
        .controller(addon)
        .is_some_and(|controller| controller.has_adapter_at(landmark.handle));
    if already_spawned {
        return Err(SpawnError::AlreadySpawned(addon));
    }

    let kind = world
        .resource::<AddonKinds>()
        .get(definition.kind_name())
        .ok_or_else(|| SpawnError::UnknownKind(definition.kind_name().to_owned()))?;

    let transform = if landmark.is_mobile() {
        // Parented below; the transform stays relative to the landmark.
        Transform::from_translation(definition.position)
            .with_rotation(Quat::from_rotation_y(definition.rotation_angle.to_radians()))
    } else {
        let mut transform =
            landmark.world_transform(definition.position, definition.rotation_angle);
        if definition.on_terrain {
            if let Some(terrain) = world.get_resource::<Terrain>() {
                let translation = transform.translation;
                transform.translation.y = terrain.height_at(translation.x, translation.z);
            }
        }
        transform
    };

    let config = definition.plugin_data.clone().unwrap_or(Value::Null);
    let request = SpawnRequest {
        kind_id: definition.kind_id(),
        landmark: &landmark,
        transform,
        config: &config,
    };
    let replica = kind
        .spawn(world, &request)
        .filter(|replica| world.get_entity(*replica).is_some())
        .ok_or_else(|| SpawnError::ConstructionFailed {
            kind: kind.name().to_owned(),
            kind_id: definition.kind_id().to_owned(),
        })?;

    harden_replica(world, replica, &landmark);
    world.entity_mut(replica).insert(Replica { addon });
    world.resource_mut::<ControllerRegistry>().register_adapter(
        &definition,
        &alias,
        Adapter { replica, landmark },
    );
    Ok(replica)
}

/// `spawn_at` for batch work: failures are logged, never propagated.
pub fn spawn_logged(world: &mut World, addon: AddonId, instance: &LandmarkInstance) {
    match spawn_at(world, addon, instance) {
        Ok(replica) => debug!(
            "Spawned addon {} at {} ({:?}) as {:?}",
            addon, instance.short_name, instance.handle, replica
        ),
        Err(err) if err.is_benign() => debug!("Skipped addon {}: {}", addon, err),
        Err(err) => warn!(
            "Failed to spawn addon {} at {}: {}",
            addon, instance.short_name, err
        ),
    }
}

/// Batch item for teardown: the replica plus the kind that knows how to kill it.
#[derive(Debug, Clone)]
pub struct Teardown {
    pub replica: Entity,
    pub kind: Arc<AddonKind>,
}

/// Destroys one replica. The replica may already be gone; either way its adapter is dropped
/// exactly once, through the `Replica` removal observer.
pub fn destroy_adapter(world: &mut World, teardown: Teardown) {
    let Teardown { replica, kind } = teardown;
    if world.get_entity(replica).is_none() {
        return;
    }
    kind.kill(world, replica);
    if let Some(mut entity) = world.get_entity_mut(replica) {
        // The kind left the entity alive; detach it so the loss is still reported.
        if entity.contains::<Replica>() {
            entity.remove::<Replica>();
        }
    }
}

/// Destroys one replica right away through its kind. `false` when `replica` is not a live
/// addon replica.
pub fn destroy_replica(world: &mut World, replica: Entity) -> bool {
    let kind_name = world
        .resource::<ControllerRegistry>()
        .controller_for_replica(replica)
        .map(|controller| controller.definition().kind_name().to_owned());
    let Some(kind_name) = kind_name else {
        return false;
    };
    let kind = kind_for(world, &kind_name).unwrap_or_else(despawn_kind);
    destroy_adapter(world, Teardown { replica, kind });
    true
}

fn teardown_batch(label: String, teardowns: Vec<Teardown>) -> Batch {
    Batch::new(label, teardowns, |world: &mut World, teardown: Teardown| {
        destroy_adapter(world, teardown)
    })
}

fn kind_for(world: &World, kind_name: &str) -> Option<Arc<AddonKind>> {
    let kind = world.resource::<AddonKinds>().get(kind_name);
    if kind.is_none() {
        warn!("Addon kind '{}' vanished; replicas will be despawned directly", kind_name);
    }
    kind
}

/// Fallback for replicas whose kind was unregistered before teardown.
fn despawn_kind() -> Arc<AddonKind> {
    Arc::new(builtin_prefab_kind())
}

/// Destroys every replica of `addon` and detaches its controller from the registry right away,
/// so an identical definition can start a fresh controller immediately. The destruction runs as
/// a detached batch and therefore completes even during shutdown.
pub fn destroy_all(world: &mut World, addon: AddonId) -> Option<BatchHandle> {
    let controller = world.resource_mut::<ControllerRegistry>().unregister(addon)?;
    let kind = kind_for(world, controller.definition().kind_name()).unwrap_or_else(despawn_kind);
    let teardowns: Vec<Teardown> = controller
        .replicas()
        .map(|replica| Teardown {
            replica,
            kind: kind.clone(),
        })
        .collect();
    debug!(
        "Destroying {} replicas of addon {} ({})",
        teardowns.len(),
        addon,
        controller.definition().kind_id()
    );
    Some(
        world
            .resource_mut::<BatchScheduler>()
            .fire_and_forget(teardown_batch(format!("destroy {}", addon), teardowns)),
    )
}

/// Destroys every adapter spawned at `landmark`, across all controllers.
///
/// The adapters are detached right away and only the replicas are torn down over the following
/// ticks, so a landmark that re-arrives in the same frame is replicated again instead of being
/// treated as already populated.
pub fn destroy_at_landmark(world: &mut World, landmark: LandmarkHandle) -> Option<BatchHandle> {
    let targets: Vec<(Entity, String)> = world
        .resource::<ControllerRegistry>()
        .controllers()
        .flat_map(|controller| {
            controller
                .adapters()
                .iter()
                .filter(|adapter| adapter.landmark.handle == landmark)
                .map(move |adapter| {
                    (adapter.replica, controller.definition().kind_name().to_owned())
                })
        })
        .collect();
    if targets.is_empty() {
        return None;
    }

    let mut registry = world.resource_mut::<ControllerRegistry>();
    for (replica, _) in &targets {
        registry.on_replica_lost(*replica);
    }

    let teardowns: Vec<Teardown> = targets
        .into_iter()
        .map(|(replica, kind_name)| Teardown {
            replica,
            kind: kind_for(world, &kind_name).unwrap_or_else(despawn_kind),
        })
        .collect();
    Some(
        world
            .resource_mut::<BatchScheduler>()
            .fire_and_forget(teardown_batch(format!("departed {:?}", landmark), teardowns)),
    )
}

/// Drops the adapter of a replica that vanished. Adapters already detached are ignored.
pub(crate) fn on_replica_removed(
    trigger: Trigger<OnRemove, Replica>,
    mut registry: ResMut<ControllerRegistry>,
) {
    let Some(lost) = registry.on_replica_lost(trigger.entity()) else {
        return;
    };
    debug!(
        "Replica {:?} of addon {} at {} is gone{}",
        lost.adapter.replica,
        lost.addon,
        lost.adapter.landmark.short_name,
        if lost.controller_removed {
            "; controller removed"
        } else {
            ""
        }
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AddonsPlugin;
    use crate::config::AddonsConfig;
    use crate::host::{FlatTerrain, PrefabCatalog, PrefabTemplate, SavePolicy};
    use crate::landmark::{LandmarkBounds, MobileLandmark};
    use crate::store::{AddonDefinition, MemoryBackend};

    const CRATE: &str = "assets/crate.prefab";

    fn app() -> App {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins).add_plugins(AddonsPlugin::with_backend(
            AddonsConfig::default(),
            MemoryBackend::default(),
        ));
        app.world_mut()
            .resource_mut::<PrefabCatalog>()
            .insert(CRATE, PrefabTemplate::new("crate").with_pickup());
        app
    }

    fn outpost(id: u64, x: f32) -> LandmarkInstance {
        LandmarkInstance::new_static(
            id,
            "outpost",
            "Outpost",
            Transform::from_xyz(x, 10.0, 0.0),
            LandmarkBounds::from_size(Vec3::splat(20.0)),
        )
    }

    fn store_definition(world: &mut World, definition: AddonDefinition) -> AddonId {
        let id = definition.id;
        world
            .resource_mut::<AddonStore>()
            .add(definition, "Outpost")
            .unwrap();
        id
    }

    #[test]
    fn spawn_at_builds_hardened_registered_replica() {
        let mut app = app();
        let world = app.world_mut();
        let definition = AddonDefinition::prefab(CRATE, Vec3::new(1.0, 0.0, 1.0), 90.0);
        let addon = store_definition(world, definition);

        let replica = spawn_at(world, addon, &outpost(1, 100.0)).unwrap();

        let entity = world.entity(replica);
        assert_eq!(entity.get::<Replica>(), Some(&Replica { addon }));
        assert_eq!(entity.get::<SavePolicy>(), Some(&SavePolicy::Disabled));
        let translation = entity.get::<Transform>().unwrap().translation;
        assert!(translation.abs_diff_eq(Vec3::new(101.0, 10.0, 1.0), 1e-4));

        let registry = world.resource::<ControllerRegistry>();
        assert_eq!(registry.controller(addon).unwrap().adapter_count(), 1);
        assert_eq!(registry.addon_for_replica(replica), Some(addon));
    }

    #[test]
    fn spawn_at_rejects_stale_items() {
        let mut app = app();
        let world = app.world_mut();
        let addon = store_definition(world, AddonDefinition::prefab(CRATE, Vec3::ZERO, 0.0));
        spawn_at(world, addon, &outpost(1, 0.0)).unwrap();

        assert_eq!(
            spawn_at(world, addon, &outpost(1, 0.0)),
            Err(SpawnError::AlreadySpawned(addon))
        );
        let unknown = AddonId::fresh();
        assert_eq!(
            spawn_at(world, unknown, &outpost(2, 0.0)),
            Err(SpawnError::DefinitionRemoved(unknown))
        );

        let missing = store_definition(
            world,
            AddonDefinition::prefab("assets/nope.prefab", Vec3::ZERO, 0.0),
        );
        assert!(matches!(
            spawn_at(world, missing, &outpost(1, 0.0)),
            Err(SpawnError::ConstructionFailed { .. })
        ));
        assert!(world.resource::<ControllerRegistry>().controller(missing).is_none());
    }

    #[test]
    fn terrain_snap_overrides_height() {
        let mut app = app();
        let world = app.world_mut();
        world.insert_resource(Terrain::new(FlatTerrain(3.5)));
        let addon = store_definition(
            world,
            AddonDefinition::prefab(CRATE, Vec3::new(0.0, 2.0, 0.0), 0.0).with_on_terrain(true),
        );

        let replica = spawn_at(world, addon, &outpost(1, 0.0)).unwrap();
        assert_eq!(world.entity(replica).get::<Transform>().unwrap().translation.y, 3.5);
    }

    #[test]
    fn mobile_landmark_spawn_uses_local_transform_and_revalidates() {
        let mut app = app();
        let world = app.world_mut();
        let definition = AddonDefinition::prefab(CRATE, Vec3::new(1.0, 0.0, 0.0), 0.0);
        let addon = definition.id;
        world
            .resource_mut::<AddonStore>()
            .add(definition, "Tugboat")
            .unwrap();
        let tugboat = MobileLandmark {
            alias: "Tugboat".into(),
            short_name: "tugboat".into(),
            bounds: LandmarkBounds::from_size(Vec3::splat(8.0)),
        };
        let boat_transform = Transform::from_xyz(50.0, 0.0, 0.0);
        let boat = world.spawn((tugboat.clone(), boat_transform)).id();
        let instance = LandmarkInstance::from_mobile(boat, &tugboat, &boat_transform);

        let replica = spawn_at(world, addon, &instance).unwrap();
        assert_eq!(
            world.entity(replica).get::<Transform>().unwrap().translation,
            Vec3::new(1.0, 0.0, 0.0)
        );
        assert_eq!(world.entity(replica).get::<Parent>().map(Parent::get), Some(boat));

        world.entity_mut(boat).despawn_recursive();
        assert!(world.resource::<ControllerRegistry>().controller(addon).is_none());
        assert_eq!(spawn_at(world, addon, &instance), Err(SpawnError::LandmarkGone));
    }

    #[test]
    fn external_despawn_notifies_once() {
        let mut app = app();
        let world = app.world_mut();
        let addon = store_definition(world, AddonDefinition::prefab(CRATE, Vec3::ZERO, 0.0));
        let first = spawn_at(world, addon, &outpost(1, 0.0)).unwrap();
        spawn_at(world, addon, &outpost(2, 50.0)).unwrap();

        world.despawn(first);
        let registry = world.resource::<ControllerRegistry>();
        assert_eq!(registry.controller(addon).unwrap().adapter_count(), 1);
        assert!(registry.addon_for_replica(first).is_none());
    }

    #[test]
    fn destroy_all_detaches_immediately_and_despawns_over_ticks() {
        let mut app = app();
        let (addon, replicas) = {
            let world = app.world_mut();
            let addon = store_definition(world, AddonDefinition::prefab(CRATE, Vec3::ZERO, 0.0));
            let replicas = vec![
                spawn_at(world, addon, &outpost(1, 0.0)).unwrap(),
                spawn_at(world, addon, &outpost(2, 50.0)).unwrap(),
            ];
            (addon, replicas)
        };

        let handle = destroy_all(app.world_mut(), addon).unwrap();
        assert!(app.world().resource::<ControllerRegistry>().controller(addon).is_none());
        assert!(replicas.iter().all(|r| app.world().get_entity(*r).is_some()));

        app.update();
        app.update();
        assert!(handle.is_finished());
        assert!(replicas.iter().all(|r| app.world().get_entity(*r).is_none()));
        assert!(destroy_all(app.world_mut(), addon).is_none());
    }

    #[test]
    fn destroy_adapter_reports_loss_when_kill_keeps_entity() {
        use crate::kinds::AddonKindSpec;

        let mut app = app();
        let world = app.world_mut();
        world
            .resource_mut::<AddonKinds>()
            .register(
                "marker",
                AddonKindSpec::new()
                    .initialize(|_, _| Ok(Value::Null))
                    .spawn(|world, request| Some(world.spawn(request.transform).id()))
                    .kill(|_, _| {})
                    .update(|_, _, _| {}),
            )
            .unwrap();
        let definition = AddonDefinition::custom("marker", Vec3::ZERO, 0.0, Value::Null);
        let addon = store_definition(world, definition);
        let replica = spawn_at(world, addon, &outpost(1, 0.0)).unwrap();
        let kind = world.resource::<AddonKinds>().get("marker").unwrap();

        destroy_adapter(world, Teardown { replica, kind: kind.clone() });
        assert!(world.get_entity(replica).is_some());
        assert!(world.resource::<ControllerRegistry>().controller(addon).is_none());

        // A second teardown of the same replica changes nothing.
        destroy_adapter(world, Teardown { replica, kind });
        assert!(world.resource::<ControllerRegistry>().is_empty());
    }
}
