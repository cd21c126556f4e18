//! Headless demo host: composes the Bevy runtime, a scripted admin and the addon engine.
//!
//! Two static "Outpost" landmarks come from a fixed discovery list and a "Tugboat" mobile landmark
//! drives in and out of the world. The script spawns and kills addons the way an admin would, then
//! exits; shutdown destroys every replica while the store keeps the definitions.
//!
//! Usage: `landmark_addons_demo [config.json]`

use std::time::Duration;

use bevy::app::{AppExit, ScheduleRunnerPlugin};
use bevy::log::LogPlugin;
use bevy::prelude::*;

use landmark_addons::commands::{kill_command, spawn_command, Actor, AllowList, Permissions};
use landmark_addons::config::{AddonsConfig, ConfigError};
use landmark_addons::host::{FlatTerrain, PrefabCatalog, PrefabTemplate, Terrain};
use landmark_addons::kinds::ActorContext;
use landmark_addons::landmark::{LandmarkBounds, LandmarkInstance, MobileLandmark, StaticDiscovery};
use landmark_addons::registry::ControllerRegistry;
use landmark_addons::store::AddonId;
use landmark_addons::{AddonsPlugin, LandmarkResolver};

const ADMIN_ID: &str = "admin";
const EXIT_FRAME: u32 = 60;

fn main() -> Result<(), ConfigError> {
    let config = match std::env::args().nth(1) {
        Some(path) => AddonsConfig::load(path)?,
        None => AddonsConfig {
            mobile_aliases: vec!["Tugboat".to_owned()],
            ..default()
        },
    };

    // 30 ticks per second; every tick advances each batch by one item.
    App::new()
        .add_plugins(
            MinimalPlugins.set(ScheduleRunnerPlugin::run_loop(Duration::from_secs_f64(
                1.0 / 30.0,
            ))),
        )
        .add_plugins(LogPlugin::default())
        .add_plugins(AddonsPlugin::new(config))
        .add_systems(Startup, setup_host)
        .add_systems(Update, run_script)
        .run();
    Ok(())
}

fn outpost(id: u64, translation: Vec3, yaw_degrees: f32) -> LandmarkInstance {
    LandmarkInstance::new_static(
        id,
        "outpost_a",
        "Outpost",
        Transform::from_translation(translation)
            .with_rotation(Quat::from_rotation_y(yaw_degrees.to_radians())),
        LandmarkBounds::from_size(Vec3::new(60.0, 30.0, 60.0)),
    )
}

/// Stands in for the host game: prefabs, terrain, permissions and landmark discovery.
fn setup_host(
    mut catalog: ResMut<PrefabCatalog>,
    mut resolver: ResMut<LandmarkResolver>,
    mut commands: Commands,
) {
    catalog
        .insert(
            "assets/prefabs/deployable/woodenbox/box.wooden.large.prefab",
            PrefabTemplate::new("box.wooden.large")
                .with_health(300.0)
                .with_pickup()
                .with_ground_watch(),
        )
        .insert(
            "assets/prefabs/deployable/lantern/lantern.deployed.prefab",
            PrefabTemplate::new("lantern.deployed").with_power(),
        );
    resolver.set_discovery(StaticDiscovery::new(vec![
        outpost(1, Vec3::new(-400.0, 12.0, 250.0), 0.0),
        outpost(2, Vec3::new(900.0, 4.0, -300.0), 135.0),
    ]));
    commands.insert_resource(Terrain::new(FlatTerrain(0.0)));
    commands.insert_resource(Permissions::new(AllowList::new([ADMIN_ID])));
}

fn admin(aim_point: Vec3, yaw_degrees: f32, target: Option<Entity>) -> Actor {
    Actor {
        context: ActorContext {
            id: ADMIN_ID.to_owned(),
            name: "demo-admin".to_owned(),
            aim_point,
            yaw_degrees,
        },
        target,
    }
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_owned()).collect()
}

#[derive(Default)]
struct Script {
    frame: u32,
    tugboat: Option<Entity>,
    first_box: Option<AddonId>,
}

fn first_replica(world: &World, addon: AddonId) -> Option<Entity> {
    world
        .resource::<ControllerRegistry>()
        .controller(addon)?
        .replicas()
        .next()
}

fn run_script(world: &mut World, mut script: Local<Script>) {
    script.frame += 1;
    match script.frame {
        5 => {
            let actor = admin(Vec3::new(-395.0, 12.0, 252.0), 30.0, None);
            match spawn_command(world, &actor, &args(&["box.wooden"])) {
                Ok(outcome) => {
                    info!("Spawned {} under {}", outcome.kind_id, outcome.alias);
                    script.first_box = Some(outcome.addon);
                }
                Err(err) => warn!("Spawn failed: {}", err),
            }
        }
        10 => {
            let tugboat = world
                .spawn((
                    Name::new("tugboat"),
                    MobileLandmark {
                        alias: "Tugboat".to_owned(),
                        short_name: "tugboat".to_owned(),
                        bounds: LandmarkBounds::from_size(Vec3::new(6.0, 4.0, 14.0)),
                    },
                    Transform::IDENTITY,
                ))
                .id();
            script.tugboat = Some(tugboat);
        }
        12 => {
            let actor = admin(Vec3::new(0.5, 1.0, 3.0), 90.0, None);
            if let Err(err) = spawn_command(world, &actor, &args(&["lantern"])) {
                warn!("Spawn failed: {}", err);
            }
        }
        20 => {
            let target = script.first_box.and_then(|addon| first_replica(world, addon));
            match kill_command(world, &admin(Vec3::ZERO, 0.0, target)) {
                Ok(outcome) => info!("Killed {} at {}", outcome.kind_id, outcome.alias),
                Err(err) => warn!("Kill failed: {}", err),
            }
        }
        30 => {
            if let Some(tugboat) = script.tugboat.take().and_then(|t| world.get_entity_mut(t)) {
                tugboat.despawn_recursive();
            }
        }
        EXIT_FRAME => {
            let registry = world.resource::<ControllerRegistry>();
            info!(
                "Exiting with {} controllers and {} replicas",
                registry.len(),
                registry.adapter_count()
            );
            world.send_event(AppExit::Success);
        }
        _ => {}
    }
}
