//! Replication driver: turns stored definitions into replicas.
//!
//! Startup walks the whole store once discovery is available. After that, replicas are added
//! per definition (spawn command, late kind registration) or per landmark (arrival events), and
//! removed per definition, per landmark or per kind. Every spawn and destroy goes through the
//! batch scheduler.

use bevy::app::AppExit;
use bevy::prelude::*;

use crate::config::AddonsConfig;
use crate::controller::{destroy_all, destroy_at_landmark, spawn_logged};
use crate::kinds::{AddonKindSpec, AddonKinds, KindRegistration, RegistrationError};
use crate::landmark::{
    resolve_all_by_alias, LandmarkArrived, LandmarkDeparted, LandmarkInstance, LandmarkResolver,
};
use crate::registry::ControllerRegistry;
use crate::scheduler::{drive_batches, flush_detached, Batch, BatchHandle, BatchScheduler};
use crate::state::{AddonSet, ReplicationPhase};
use crate::store::{AddonId, AddonStore};

/// Schedules startup replication, landmark events and the batch driver, plus shutdown on exit.
pub struct ReplicationPlugin;

impl Plugin for ReplicationPlugin {
    fn build(&self, app: &mut App) {
        app.configure_sets(Update, (AddonSet::Enqueue, AddonSet::Drive).chain())
            .add_systems(
                Update,
                (start_when_ready, handle_departures, replicate_arrivals)
                    .chain()
                    .in_set(AddonSet::Enqueue),
            )
            .add_systems(Update, drive_batches.in_set(AddonSet::Drive))
            .add_systems(Last, shutdown_on_exit);
    }
}

type SpawnItem = (AddonId, LandmarkInstance);

fn spawn_batch(label: String, items: Vec<SpawnItem>) -> Batch {
    Batch::new(label, items, |world: &mut World, (addon, instance): SpawnItem| {
        spawn_logged(world, addon, &instance)
    })
}

/// Starts replication once the discovery collaborator shows up, unless `autoStart` is off.
pub fn start_when_ready(world: &mut World) {
    if *world.resource::<ReplicationPhase>() != ReplicationPhase::WaitingForDiscovery {
        return;
    }
    if !world.resource::<AddonsConfig>().auto_start
        || !world.resource::<LandmarkResolver>().is_available()
    {
        return;
    }
    start_replication(world);
}

/// Queues one spawn per (stored definition, current landmark instance) pair.
///
/// Returns `None` and leaves the phase untouched when an alias cannot be resolved because
/// discovery is unavailable; the next tick retries. Aliases with no instances are skipped and
/// their definitions stay stored.
pub fn start_replication(world: &mut World) -> Option<BatchHandle> {
    let aliases: Vec<String> = world
        .resource::<AddonStore>()
        .aliases()
        .map(str::to_owned)
        .collect();

    let mut items = Vec::new();
    let mut definitions = 0;
    for alias in aliases {
        let Some(instances) = resolve_all_by_alias(world, &alias) else {
            debug!("Landmark discovery unavailable; startup replication deferred");
            return None;
        };
        let addons: Vec<AddonId> = world
            .resource::<AddonStore>()
            .definitions_for(&alias)
            .iter()
            .map(|definition| definition.id)
            .collect();
        definitions += addons.len();
        if instances.is_empty() {
            debug!("No instances of '{}'; {} definitions wait", alias, addons.len());
            continue;
        }
        for addon in addons {
            items.extend(instances.iter().map(|instance| (addon, instance.clone())));
        }
    }

    *world.resource_mut::<ReplicationPhase>() = ReplicationPhase::Replicating;
    info!(
        "Replicating {} addon definitions ({} spawns queued)",
        definitions,
        items.len()
    );
    let batch = spawn_batch("startup".to_owned(), items).on_complete(|world, outcome| {
        let mut phase = world.resource_mut::<ReplicationPhase>();
        if !phase.is_shut_down() {
            *phase = ReplicationPhase::Ready;
        }
        let registry = world.resource::<ControllerRegistry>();
        info!(
            "Startup replication {:?}: {} controllers, {} replicas",
            outcome,
            registry.len(),
            registry.adapter_count()
        );
    });
    Some(world.resource_mut::<BatchScheduler>().run_batch(batch))
}

/// Queues spawns of one stored definition at every current instance of its alias. `None` when
/// the definition is gone or its alias cannot be resolved right now.
pub fn replicate_definition(world: &mut World, addon: AddonId) -> Option<BatchHandle> {
    let alias = world.resource::<AddonStore>().find(addon)?.0.to_owned();
    let Some(instances) = resolve_all_by_alias(world, &alias) else {
        debug!("Landmark discovery unavailable; addon {} waits for startup", addon);
        return None;
    };
    let items: Vec<SpawnItem> = instances
        .into_iter()
        .map(|instance| (addon, instance))
        .collect();
    Some(
        world
            .resource_mut::<BatchScheduler>()
            .run_batch(spawn_batch(format!("replicate {}", addon), items)),
    )
}

/// Replicates every definition of the arriving landmark's alias onto it. Arrivals before startup
/// are dropped: startup resolves mobile landmarks from live entities anyway.
pub fn replicate_arrivals(world: &mut World) {
    let arrivals: Vec<LandmarkInstance> = world
        .resource_mut::<Events<LandmarkArrived>>()
        .drain()
        .map(|LandmarkArrived(instance)| instance)
        .collect();
    let phase = *world.resource::<ReplicationPhase>();
    if arrivals.is_empty() || !phase.has_started() || phase.is_shut_down() {
        return;
    }

    for instance in arrivals {
        let items: Vec<SpawnItem> = world
            .resource::<AddonStore>()
            .definitions_for(&instance.alias)
            .iter()
            .map(|definition| (definition.id, instance.clone()))
            .collect();
        if items.is_empty() {
            continue;
        }
        debug!(
            "Landmark {} ({}) arrived; queueing {} spawns",
            instance.short_name,
            instance.alias,
            items.len()
        );
        world
            .resource_mut::<BatchScheduler>()
            .run_batch(spawn_batch(format!("arrival {:?}", instance.handle), items));
    }
}

/// Destroys the replicas left behind on departed mobile landmarks.
pub fn handle_departures(world: &mut World) {
    let departures: Vec<LandmarkDeparted> = world
        .resource_mut::<Events<LandmarkDeparted>>()
        .drain()
        .collect();
    for LandmarkDeparted(handle) in departures {
        if destroy_at_landmark(world, handle).is_some() {
            debug!("Landmark {:?} departed; destroying its replicas", handle);
        }
    }
}

/// Registers an addon kind and, when replication has already started, replicates the stored
/// definitions that were waiting for it.
pub fn register_kind(
    world: &mut World,
    name: &str,
    spec: AddonKindSpec,
) -> Result<KindRegistration, RegistrationError> {
    let registration = world.resource_mut::<AddonKinds>().register(name, spec)?;
    info!("Registered addon kind '{}'", name);

    let phase = *world.resource::<ReplicationPhase>();
    if phase.has_started() && !phase.is_shut_down() {
        let waiting: Vec<AddonId> = world
            .resource::<AddonStore>()
            .iter()
            .filter(|(_, definition)| definition.kind_name() == name)
            .map(|(_, definition)| definition.id)
            .collect();
        for addon in waiting {
            replicate_definition(world, addon);
        }
    }
    Ok(registration)
}

/// Destroys every live replica of `name` and removes the kind. Stored definitions are kept and
/// come back when the kind is registered again. Returns `false` for unknown or built-in kinds.
pub fn unregister_kind(world: &mut World, name: &str) -> bool {
    if world.resource::<AddonKinds>().get(name).is_none() || name == crate::kinds::BUILTIN_KIND {
        return false;
    }
    let addons: Vec<AddonId> = world
        .resource::<ControllerRegistry>()
        .controllers()
        .filter(|controller| controller.definition().kind_name() == name)
        .map(|controller| controller.addon())
        .collect();
    for addon in &addons {
        destroy_all(world, *addon);
    }
    world.resource_mut::<AddonKinds>().unregister(name);
    info!(
        "Unregistered addon kind '{}'; destroying {} controllers",
        name,
        addons.len()
    );
    true
}

/// Tears the engine down: cancels pending replication, destroys every replica and runs that
/// destruction to completion before returning. The store is left as is.
pub fn shutdown(world: &mut World) {
    if world.resource::<ReplicationPhase>().is_shut_down() {
        return;
    }
    *world.resource_mut::<ReplicationPhase>() = ReplicationPhase::ShutDown;
    let cancelled = world.resource_mut::<BatchScheduler>().teardown();

    let addons: Vec<AddonId> = world
        .resource::<ControllerRegistry>()
        .controllers()
        .map(|controller| controller.addon())
        .collect();
    for addon in &addons {
        destroy_all(world, *addon);
    }
    flush_detached(world);
    info!(
        "Addon engine shut down: {} batches cancelled, {} controllers destroyed",
        cancelled,
        addons.len()
    );
}

fn shutdown_on_exit(world: &mut World) {
    let exiting = world
        .get_resource::<Events<AppExit>>()
        .is_some_and(|events| !events.is_empty());
    if exiting {
        shutdown(world);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AddonsPlugin;
    use crate::host::{PrefabCatalog, PrefabTemplate};
    use crate::landmark::{LandmarkBounds, LandmarkHandle, MobileLandmark, StaticDiscovery};
    use crate::registry::Replica;
    use crate::scheduler::BatchOutcome;
    use crate::store::{AddonDefinition, MemoryBackend};
    use serde_json::Value;

    const CRATE: &str = "assets/crate.prefab";

    fn outpost(id: u64, x: f32) -> LandmarkInstance {
        LandmarkInstance::new_static(
            id,
            "outpost",
            "Outpost",
            Transform::from_xyz(x, 0.0, 0.0),
            LandmarkBounds::from_size(Vec3::splat(20.0)),
        )
    }

    fn app_with(config: AddonsConfig, definitions: Vec<(&str, AddonDefinition)>) -> App {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins)
            .add_plugins(AddonsPlugin::with_backend(config, MemoryBackend::default()));
        let world = app.world_mut();
        world
            .resource_mut::<PrefabCatalog>()
            .insert(CRATE, PrefabTemplate::new("crate"));
        for (alias, definition) in definitions {
            world
                .resource_mut::<AddonStore>()
                .add(definition, alias)
                .unwrap();
        }
        app
    }

    fn app(definitions: Vec<(&str, AddonDefinition)>) -> App {
        app_with(AddonsConfig::default(), definitions)
    }

    fn set_discovery(app: &mut App, instances: Vec<LandmarkInstance>) {
        app.world_mut()
            .resource_mut::<LandmarkResolver>()
            .set_discovery(StaticDiscovery::new(instances));
    }

    fn run_until_idle(app: &mut App) {
        for _ in 0..64 {
            app.update();
            if app.world().resource::<BatchScheduler>().is_idle() {
                return;
            }
        }
        panic!("batches never drained");
    }

    fn replica_count(app: &mut App) -> usize {
        app.world_mut()
            .query::<&Replica>()
            .iter(app.world())
            .count()
    }

    #[test]
    fn startup_waits_for_discovery() {
        let mut app = app(vec![("Outpost", AddonDefinition::prefab(CRATE, Vec3::ZERO, 0.0))]);
        app.update();
        app.update();
        assert_eq!(
            *app.world().resource::<ReplicationPhase>(),
            ReplicationPhase::WaitingForDiscovery
        );

        set_discovery(&mut app, vec![outpost(1, 0.0), outpost(2, 100.0)]);
        run_until_idle(&mut app);
        assert_eq!(*app.world().resource::<ReplicationPhase>(), ReplicationPhase::Ready);
        assert_eq!(app.world().resource::<ControllerRegistry>().adapter_count(), 2);
    }

    #[test]
    fn auto_start_off_requires_explicit_start() {
        let config = AddonsConfig {
            auto_start: false,
            ..default()
        };
        let mut app = app_with(
            config,
            vec![("Outpost", AddonDefinition::prefab(CRATE, Vec3::ZERO, 0.0))],
        );
        set_discovery(&mut app, vec![outpost(1, 0.0)]);
        app.update();
        assert!(app.world().resource::<ControllerRegistry>().is_empty());

        let handle = start_replication(app.world_mut()).unwrap();
        run_until_idle(&mut app);
        assert_eq!(handle.processed(), 1);
        assert_eq!(app.world().resource::<ControllerRegistry>().adapter_count(), 1);
    }

    #[test]
    fn startup_spawns_one_item_per_tick() {
        let mut app = app(vec![
            ("Outpost", AddonDefinition::prefab(CRATE, Vec3::ZERO, 0.0)),
            ("Outpost", AddonDefinition::prefab(CRATE, Vec3::X, 0.0)),
        ]);
        set_discovery(&mut app, vec![outpost(1, 0.0), outpost(2, 100.0)]);

        app.update();
        let after_first = app.world().resource::<ControllerRegistry>().adapter_count();
        assert_eq!(after_first, 1);
        run_until_idle(&mut app);
        let registry = app.world().resource::<ControllerRegistry>();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.adapter_count(), 4);
    }

    #[test]
    fn mobile_landmarks_replicate_on_arrival_and_clean_up_on_departure() {
        let config = AddonsConfig {
            mobile_aliases: vec!["Tugboat".into()],
            ..default()
        };
        let mut app = app_with(
            config,
            vec![("Tugboat", AddonDefinition::prefab(CRATE, Vec3::Y, 0.0))],
        );
        set_discovery(&mut app, Vec::new());
        run_until_idle(&mut app);
        assert_eq!(*app.world().resource::<ReplicationPhase>(), ReplicationPhase::Ready);
        assert_eq!(replica_count(&mut app), 0);

        let boat = app
            .world_mut()
            .spawn((
                MobileLandmark {
                    alias: "Tugboat".into(),
                    short_name: "tugboat".into(),
                    bounds: LandmarkBounds::from_size(Vec3::splat(8.0)),
                },
                Transform::from_xyz(10.0, 0.0, 0.0),
            ))
            .id();
        run_until_idle(&mut app);
        assert_eq!(replica_count(&mut app), 1);

        app.world_mut().entity_mut(boat).remove::<MobileLandmark>();
        run_until_idle(&mut app);
        assert_eq!(replica_count(&mut app), 0);
        assert!(app.world().resource::<ControllerRegistry>().is_empty());
        assert_eq!(app.world().resource::<AddonStore>().len(), 1);
    }

    #[test]
    fn late_kind_registration_replicates_waiting_definitions() {
        let mut app = app(vec![(
            "Outpost",
            AddonDefinition::custom("beacon", Vec3::ZERO, 0.0, Value::from(3)),
        )]);
        set_discovery(&mut app, vec![outpost(1, 0.0), outpost(2, 100.0)]);
        run_until_idle(&mut app);
        assert!(app.world().resource::<ControllerRegistry>().is_empty());

        let spec = AddonKindSpec::new()
            .initialize(|_, _| Ok(Value::Null))
            .spawn(|world, request| Some(world.spawn(request.transform).id()))
            .kill(|world, replica| {
                world.despawn(replica);
            })
            .update(|_, _, _| {});
        register_kind(app.world_mut(), "beacon", spec).unwrap();
        run_until_idle(&mut app);
        assert_eq!(app.world().resource::<ControllerRegistry>().adapter_count(), 2);

        assert!(unregister_kind(app.world_mut(), "beacon"));
        run_until_idle(&mut app);
        assert_eq!(replica_count(&mut app), 0);
        assert_eq!(app.world().resource::<AddonStore>().len(), 1);
        assert!(!unregister_kind(app.world_mut(), "beacon"));
    }

    #[test]
    fn app_exit_destroys_every_replica_and_cancels_startup() {
        let mut app = app(vec![
            ("Outpost", AddonDefinition::prefab(CRATE, Vec3::ZERO, 0.0)),
            ("Outpost", AddonDefinition::prefab(CRATE, Vec3::X, 0.0)),
        ]);
        set_discovery(&mut app, vec![outpost(1, 0.0), outpost(2, 100.0)]);
        app.update();
        app.update();
        assert_eq!(replica_count(&mut app), 2);

        app.world_mut().send_event(AppExit::Success);
        app.update();

        assert_eq!(*app.world().resource::<ReplicationPhase>(), ReplicationPhase::ShutDown);
        assert_eq!(replica_count(&mut app), 0);
        assert!(app.world().resource::<ControllerRegistry>().is_empty());
        assert!(app.world().resource::<BatchScheduler>().is_idle());
        assert_eq!(app.world().resource::<AddonStore>().len(), 2);
    }

    fn tugboat(app: &mut App, x: f32) -> Entity {
        app.world_mut()
            .spawn((
                MobileLandmark {
                    alias: "Tugboat".into(),
                    short_name: "tugboat".into(),
                    bounds: LandmarkBounds::from_size(Vec3::splat(8.0)),
                },
                Transform::from_xyz(x, 0.0, 0.0),
            ))
            .id()
    }

    fn tugboat_app(auto_start: bool, definitions: usize) -> App {
        let config = AddonsConfig {
            mobile_aliases: vec!["Tugboat".into()],
            auto_start,
            ..default()
        };
        let definitions = (0..definitions)
            .map(|i| ("Tugboat", AddonDefinition::prefab(CRATE, Vec3::X * i as f32, 0.0)))
            .collect();
        let mut app = app_with(config, definitions);
        set_discovery(&mut app, Vec::new());
        app
    }

    #[test]
    fn landmark_reattached_in_one_frame_is_replicated_again() {
        let mut app = tugboat_app(true, 1);
        run_until_idle(&mut app);
        let boat = tugboat(&mut app, 10.0);
        run_until_idle(&mut app);
        let before: Vec<Entity> = app
            .world()
            .resource::<ControllerRegistry>()
            .controllers()
            .flat_map(|controller| controller.replicas().collect::<Vec<_>>())
            .collect();
        assert_eq!(before.len(), 1);

        let landmark = app.world().get::<MobileLandmark>(boat).unwrap().clone();
        let mut entity = app.world_mut().entity_mut(boat);
        entity.remove::<MobileLandmark>();
        entity.insert(landmark);
        run_until_idle(&mut app);

        assert_eq!(replica_count(&mut app), 1);
        let registry = app.world().resource::<ControllerRegistry>();
        assert_eq!(registry.adapter_count(), 1);
        let controller = registry.controllers().next().unwrap();
        let adapter = &controller.adapters()[0];
        assert_eq!(adapter.landmark.handle, LandmarkHandle::Mobile(boat));
        assert_ne!(adapter.replica, before[0]);
        assert!(app.world().get_entity(before[0]).is_none());
        assert_eq!(app.world().get::<Parent>(adapter.replica).map(Parent::get), Some(boat));
    }

    #[test]
    fn losing_one_landmark_mid_batch_skips_only_its_spawns() {
        let mut app = tugboat_app(false, 2);
        let first = tugboat(&mut app, 10.0);
        let second = tugboat(&mut app, 40.0);
        // Arrivals before startup are dropped.
        app.update();
        assert!(app.world().resource::<ControllerRegistry>().is_empty());

        let handle = start_replication(app.world_mut()).unwrap();
        assert_eq!(handle.total(), 4);
        app.update();
        let populated = app
            .world()
            .resource::<ControllerRegistry>()
            .controllers()
            .next()
            .unwrap()
            .adapters()[0]
            .landmark
            .handle;
        let (survivor, doomed) = if populated == LandmarkHandle::Mobile(first) {
            (first, second)
        } else {
            (second, first)
        };
        app.world_mut().despawn(doomed);

        run_until_idle(&mut app);
        assert_eq!(handle.outcome(), BatchOutcome::Completed);
        assert_eq!(handle.processed(), 4);
        assert_eq!(*app.world().resource::<ReplicationPhase>(), ReplicationPhase::Ready);

        let registry = app.world().resource::<ControllerRegistry>();
        assert_eq!(registry.len(), 2);
        assert!(registry.controllers().all(|controller| controller.adapter_count() == 1
            && controller.has_adapter_at(LandmarkHandle::Mobile(survivor))));
        assert_eq!(replica_count(&mut app), 2);
    }
}
