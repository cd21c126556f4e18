//! Admin command surface: spawn, kill and show.
//!
//! Commands are plain functions over the `World` so any front end (chat, console, RPC) can call
//! them. Each one checks the admin permission before touching anything and reports failures as a
//! `CommandError` whose message is fit to show the actor.

use std::collections::BTreeSet;
use std::sync::Arc;

use bevy::prelude::*;
use serde_json::Value;

use crate::config::AddonsConfig;
use crate::controller::{destroy_all, destroy_replica};
use crate::host::{PrefabCatalog, Terrain};
use crate::kinds::{ActorContext, AddonKinds};
use crate::landmark::{resolve_closest, LandmarkResolver};
use crate::migration::normalize_angle;
use crate::registry::ControllerRegistry;
use crate::replication::replicate_definition;
use crate::scheduler::BatchHandle;
use crate::store::{AddonDefinition, AddonId, AddonStore};

/// Permission every command requires.
pub const ADMIN_PERMISSION: &str = "landmarkaddons.admin";

pub trait PermissionCheck: Send + Sync {
    fn has_permission(&self, actor: &ActorContext, permission: &str) -> bool;
}

/// Grants every permission to a fixed set of actor ids.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    actors: BTreeSet<String>,
}

impl AllowList {
    pub fn new(actors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            actors: actors.into_iter().map(Into::into).collect(),
        }
    }
}

impl PermissionCheck for AllowList {
    fn has_permission(&self, actor: &ActorContext, _permission: &str) -> bool {
        self.actors.contains(&actor.id)
    }
}

/// The host's permission collaborator. Defaults to an empty allow list.
#[derive(Resource, Clone)]
pub struct Permissions(pub Arc<dyn PermissionCheck>);

impl Permissions {
    pub fn new(check: impl PermissionCheck + 'static) -> Self {
        Self(Arc::new(check))
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Self::new(AllowList::default())
    }
}

/// An actor issuing a command, plus whatever entity the host reports under its crosshair.
#[derive(Debug, Clone)]
pub struct Actor {
    pub context: ActorContext,
    pub target: Option<Entity>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("You don't have permission to use this command.")]
    NoPermission,

    #[error("Syntax: {0}")]
    MissingArgument(&'static str),

    #[error("No addon kind or prefab matches '{0}'.")]
    NoPrefabMatch(String),

    #[error("'{token}' matches multiple prefabs: {}", .candidates.join(", "))]
    AmbiguousPrefab {
        token: String,
        candidates: Vec<String>,
    },

    #[error("Landmark discovery is not available yet.")]
    DiscoveryUnavailable,

    #[error("You are not at a landmark.")]
    NotAtLandmark,

    #[error("You are not looking at anything.")]
    NoTarget,

    #[error("That is not an addon.")]
    NotAnAddon,

    #[error("Could not create addon: {0}")]
    KindInitialize(String),
}

#[derive(Debug, Clone)]
pub struct SpawnOutcome {
    pub addon: AddonId,
    pub kind_id: String,
    pub alias: String,
    pub local_position: Vec3,
    pub rotation_angle: f32,
    /// The batch spawning one replica per instance of `alias`, when it could be resolved.
    pub replication: Option<BatchHandle>,
}

#[derive(Debug, Clone)]
pub struct KillOutcome {
    pub addon: AddonId,
    pub kind_id: String,
    pub alias: String,
    /// Whether the definition was still stored (a concurrent kill may have removed it first).
    pub removed_from_store: bool,
    /// Destruction of the remaining replicas, if any were left after the targeted one.
    pub teardown: Option<BatchHandle>,
}

fn require_admin(world: &World, actor: &Actor) -> Result<(), CommandError> {
    let allowed = world
        .get_resource::<Permissions>()
        .is_some_and(|permissions| permissions.0.has_permission(&actor.context, ADMIN_PERMISSION));
    if allowed {
        Ok(())
    } else {
        Err(CommandError::NoPermission)
    }
}

enum SpawnTarget {
    Prefab(String),
    Custom { kind: String, config: Value },
}

fn resolve_spawn_target(
    world: &World,
    actor: &Actor,
    token: &str,
    args: &[String],
) -> Result<SpawnTarget, CommandError> {
    if let Some(kind) = world.resource::<AddonKinds>().find_custom(token) {
        let config = kind
            .initialize(&actor.context, args)
            .map_err(CommandError::KindInitialize)?;
        return Ok(SpawnTarget::Custom {
            kind: kind.name().to_owned(),
            config,
        });
    }

    let catalog = world.resource::<PrefabCatalog>();
    match catalog.find_matches(token).as_slice() {
        [] => Err(CommandError::NoPrefabMatch(token.to_owned())),
        [path] => Ok(SpawnTarget::Prefab((*path).to_owned())),
        candidates => Err(CommandError::AmbiguousPrefab {
            token: token.to_owned(),
            candidates: candidates.iter().map(|path| (*path).to_owned()).collect(),
        }),
    }
}

/// Creates a definition for the prefab or custom kind named by `args[0]` at the actor's aim
/// point, stores it under the landmark's alias and replicates it to every instance of that alias.
/// Remaining arguments go to a custom kind's `initialize`.
pub fn spawn_command(
    world: &mut World,
    actor: &Actor,
    args: &[String],
) -> Result<SpawnOutcome, CommandError> {
    require_admin(world, actor)?;
    let (token, rest) = args
        .split_first()
        .ok_or(CommandError::MissingArgument("spawn <prefab or kind> [args...]"))?;
    let target = resolve_spawn_target(world, actor, token, rest)?;

    let aim_point = actor.context.aim_point;
    let landmark = match resolve_closest(world, aim_point) {
        Some(landmark) => landmark,
        None if !world.resource::<LandmarkResolver>().is_available() => {
            return Err(CommandError::DiscoveryUnavailable)
        }
        None => return Err(CommandError::NotAtLandmark),
    };
    if !landmark.contains(aim_point) {
        return Err(CommandError::NotAtLandmark);
    }

    let local_position = landmark.inverse_transform_point(aim_point);
    let rotation_angle = normalize_angle(actor.context.yaw_degrees - landmark.yaw_degrees());
    let tolerance = world.resource::<AddonsConfig>().terrain_snap_tolerance;
    let on_terrain = !landmark.is_mobile()
        && world
            .get_resource::<Terrain>()
            .is_some_and(|terrain| {
                (aim_point.y - terrain.height_at(aim_point.x, aim_point.z)).abs() <= tolerance
            });

    let definition = match target {
        SpawnTarget::Prefab(path) => AddonDefinition::prefab(path, local_position, rotation_angle),
        SpawnTarget::Custom { kind, config } => {
            AddonDefinition::custom(kind, local_position, rotation_angle, config)
        }
    }
    .with_on_terrain(on_terrain);
    let addon = definition.id;
    let kind_id = definition.kind_id().to_owned();

    if let Err(err) = world
        .resource_mut::<AddonStore>()
        .add(definition, &landmark.alias)
    {
        warn!("Addon {} was added but could not be persisted: {}", addon, err);
    }
    info!(
        "{} ({}) added '{}' at {} {:?}",
        actor.context.name, actor.context.id, kind_id, landmark.alias, local_position
    );

    let replication = replicate_definition(world, addon);
    Ok(SpawnOutcome {
        addon,
        kind_id,
        alias: landmark.alias,
        local_position,
        rotation_angle,
        replication,
    })
}

/// Removes the definition behind the targeted replica from the store and destroys every replica
/// of it. The targeted replica goes immediately; the others follow through the scheduler.
pub fn kill_command(world: &mut World, actor: &Actor) -> Result<KillOutcome, CommandError> {
    require_admin(world, actor)?;
    let target = actor.target.ok_or(CommandError::NoTarget)?;
    let (definition, alias) = world
        .resource::<ControllerRegistry>()
        .controller_for_replica(target)
        .map(|controller| (controller.definition().clone(), controller.alias().to_owned()))
        .ok_or(CommandError::NotAnAddon)?;
    let addon = definition.id;

    let removed_from_store = match world.resource_mut::<AddonStore>().remove(&definition) {
        Ok(removed) => removed,
        Err(err) => {
            warn!("Addon {} was removed but the store could not be persisted: {}", addon, err);
            true
        }
    };

    destroy_replica(world, target);
    let teardown = destroy_all(world, addon);
    info!(
        "{} ({}) killed '{}' at {}",
        actor.context.name,
        actor.context.id,
        definition.kind_id(),
        alias
    );
    Ok(KillOutcome {
        addon,
        kind_id: definition.kind_id().to_owned(),
        alias,
        removed_from_store,
        teardown,
    })
}

/// Describes the targeted replica, one line per fact.
pub fn show_command(world: &World, actor: &Actor) -> Result<Vec<String>, CommandError> {
    require_admin(world, actor)?;
    let target = actor.target.ok_or(CommandError::NoTarget)?;
    let registry = world.resource::<ControllerRegistry>();
    let controller = registry
        .controller_for_replica(target)
        .ok_or(CommandError::NotAnAddon)?;
    let definition = controller.definition();
    let landmark = controller
        .adapter_for(target)
        .map(|adapter| adapter.landmark.short_name.as_str())
        .unwrap_or(controller.alias());

    let mut lines = vec![
        format!("Addon: {}", definition.kind_id()),
        format!("Landmark: {} ({})", landmark, controller.alias()),
        format!(
            "Position: ({:.2}, {:.2}, {:.2})",
            definition.position.x, definition.position.y, definition.position.z
        ),
        format!("Rotation: {:.1}", definition.rotation_angle),
        format!("On terrain: {}", definition.on_terrain),
        format!("Replicas: {}", controller.adapter_count()),
    ];

    let config = definition.plugin_data.clone().unwrap_or(Value::Null);
    let kind = world.resource::<AddonKinds>().get(definition.kind_name());
    if let Some(description) = kind.and_then(|kind| kind.describe(world, target, &config)) {
        lines.push(description);
    }
    Ok(lines)
}
