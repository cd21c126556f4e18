//! Addon kinds: the dispatch table behind construction, teardown and config updates.
//!
//! The controller/adapter machinery never branches on what a replica is. It looks up the
//! definition's kind name here and calls through the registered callback record. The built-in
//! prefab kind is registered the same way third-party kinds are.

use std::collections::BTreeMap;
use std::sync::Arc;

use bevy::prelude::*;
use serde_json::Value;

use crate::host::PrefabCatalog;
use crate::landmark::LandmarkInstance;
use crate::registry::ControllerRegistry;
use crate::store::AddonStore;

/// Kind name of plain prefab definitions.
pub const BUILTIN_KIND: &str = "prefab";

/// Who issued the command that created a definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ActorContext {
    pub id: String,
    pub name: String,
    /// Point the actor is aiming at, as reported by the host's ray query.
    pub aim_point: Vec3,
    /// Facing of the actor about the vertical axis, in degrees.
    pub yaw_degrees: f32,
}

/// Everything a kind needs to construct one replica.
#[derive(Debug)]
pub struct SpawnRequest<'a> {
    pub kind_id: &'a str,
    pub landmark: &'a LandmarkInstance,
    pub transform: Transform,
    pub config: &'a Value,
}

pub type InitializeFn = dyn Fn(&ActorContext, &[String]) -> Result<Value, String> + Send + Sync;
pub type SpawnFn = dyn Fn(&mut World, &SpawnRequest) -> Option<Entity> + Send + Sync;
pub type KillFn = dyn Fn(&mut World, Entity) + Send + Sync;
pub type UpdateFn = dyn Fn(&mut World, Entity, &Value) + Send + Sync;
pub type DescribeFn = dyn Fn(&World, Entity, &Value) -> String + Send + Sync;

/// Callback record a registrant fills in. `initialize`, `spawn`, `kill` and `update` are required.
#[derive(Default)]
pub struct AddonKindSpec {
    initialize: Option<Box<InitializeFn>>,
    spawn: Option<Box<SpawnFn>>,
    kill: Option<Box<KillFn>>,
    update: Option<Box<UpdateFn>>,
    describe: Option<Box<DescribeFn>>,
}

impl AddonKindSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(
        mut self,
        f: impl Fn(&ActorContext, &[String]) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        self.initialize = Some(Box::new(f));
        self
    }

    pub fn spawn(
        mut self,
        f: impl Fn(&mut World, &SpawnRequest) -> Option<Entity> + Send + Sync + 'static,
    ) -> Self {
        self.spawn = Some(Box::new(f));
        self
    }

    pub fn kill(mut self, f: impl Fn(&mut World, Entity) + Send + Sync + 'static) -> Self {
        self.kill = Some(Box::new(f));
        self
    }

    pub fn update(
        mut self,
        f: impl Fn(&mut World, Entity, &Value) + Send + Sync + 'static,
    ) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn describe(
        mut self,
        f: impl Fn(&World, Entity, &Value) -> String + Send + Sync + 'static,
    ) -> Self {
        self.describe = Some(Box::new(f));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("addon kind name must not be empty")]
    EmptyName,

    #[error("addon kind name '{0}' is reserved")]
    Reserved(String),

    #[error("addon kind '{0}' is already registered")]
    Duplicate(String),

    #[error("addon kind '{kind}' is missing required callbacks: {}", .missing.join(", "))]
    MissingCallbacks {
        kind: String,
        missing: Vec<&'static str>,
    },
}

/// A validated, registered kind.
pub struct AddonKind {
    name: String,
    initialize: Box<InitializeFn>,
    spawn: Box<SpawnFn>,
    kill: Box<KillFn>,
    update: Box<UpdateFn>,
    describe: Option<Box<DescribeFn>>,
}

impl std::fmt::Debug for AddonKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddonKind")
            .field("name", &self.name)
            .field("describe", &self.describe.is_some())
            .finish_non_exhaustive()
    }
}

impl AddonKind {
    fn from_spec(name: &str, spec: AddonKindSpec) -> Result<Self, RegistrationError> {
        let missing: Vec<&'static str> = [
            ("initialize", spec.initialize.is_none()),
            ("spawn", spec.spawn.is_none()),
            ("kill", spec.kill.is_none()),
            ("update", spec.update.is_none()),
        ]
        .into_iter()
        .filter_map(|(callback, absent)| absent.then_some(callback))
        .collect();

        match (spec.initialize, spec.spawn, spec.kill, spec.update) {
            (Some(initialize), Some(spawn), Some(kill), Some(update)) => Ok(Self {
                name: name.to_owned(),
                initialize,
                spawn,
                kill,
                update,
                describe: spec.describe,
            }),
            _ => Err(RegistrationError::MissingCallbacks {
                kind: name.to_owned(),
                missing,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initialize(&self, actor: &ActorContext, args: &[String]) -> Result<Value, String> {
        (self.initialize)(actor, args)
    }

    pub fn spawn(&self, world: &mut World, request: &SpawnRequest) -> Option<Entity> {
        (self.spawn)(world, request)
    }

    pub fn kill(&self, world: &mut World, replica: Entity) {
        (self.kill)(world, replica)
    }

    pub fn update(&self, world: &mut World, replica: Entity, config: &Value) {
        (self.update)(world, replica, config)
    }

    pub fn describe(&self, world: &World, replica: Entity, config: &Value) -> Option<String> {
        self.describe
            .as_ref()
            .map(|describe| describe(world, replica, config))
    }
}

pub(crate) fn builtin_prefab_kind() -> AddonKind {
    AddonKind {
        name: BUILTIN_KIND.to_owned(),
        initialize: Box::new(|_: &ActorContext, _: &[String]| Ok(Value::Null)),
        spawn: Box::new(|world: &mut World, request: &SpawnRequest| {
            if !world.contains_resource::<PrefabCatalog>() {
                return None;
            }
            world.resource_scope(|world, catalog: Mut<PrefabCatalog>| {
                catalog.construct(world, request.kind_id, request.transform)
            })
        }),
        kill: Box::new(|world: &mut World, replica: Entity| {
            if let Some(entity) = world.get_entity_mut(replica) {
                entity.despawn_recursive();
            }
        }),
        update: Box::new(|_: &mut World, _: Entity, _: &Value| {}),
        describe: None,
    }
}

/// Kind dispatch table. Always contains the built-in prefab kind.
#[derive(Resource, Debug)]
pub struct AddonKinds {
    kinds: BTreeMap<String, Arc<AddonKind>>,
}

impl Default for AddonKinds {
    fn default() -> Self {
        let mut kinds = BTreeMap::new();
        kinds.insert(BUILTIN_KIND.to_owned(), Arc::new(builtin_prefab_kind()));
        Self { kinds }
    }
}

impl AddonKinds {
    /// Validates and registers `spec` under `name`. Prefer
    /// [`crate::replication::register_kind`], which also replicates stored definitions of the
    /// new kind.
    pub fn register(
        &mut self,
        name: &str,
        spec: AddonKindSpec,
    ) -> Result<KindRegistration, RegistrationError> {
        if name.trim().is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        if name.eq_ignore_ascii_case(BUILTIN_KIND) {
            return Err(RegistrationError::Reserved(name.to_owned()));
        }
        if self.kinds.contains_key(name) {
            return Err(RegistrationError::Duplicate(name.to_owned()));
        }
        let kind = AddonKind::from_spec(name, spec)?;
        self.kinds.insert(name.to_owned(), Arc::new(kind));
        Ok(KindRegistration {
            kind: name.to_owned(),
        })
    }

    pub fn unregister(&mut self, name: &str) -> Option<Arc<AddonKind>> {
        if name == BUILTIN_KIND {
            return None;
        }
        self.kinds.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<AddonKind>> {
        self.kinds.get(name).cloned()
    }

    /// Case-insensitive lookup among registered (non built-in) kinds.
    pub fn find_custom(&self, token: &str) -> Option<Arc<AddonKind>> {
        self.kinds
            .iter()
            .find(|(name, _)| name.as_str() != BUILTIN_KIND && name.eq_ignore_ascii_case(token))
            .map(|(_, kind)| kind.clone())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SetDataError {
    #[error("entity is not a replica of kind '{0}'")]
    NotThisKind(String),

    #[error("kind '{0}' is no longer registered")]
    Unregistered(String),
}

/// Returned to a registrant. Pushes config updates into already spawned replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindRegistration {
    kind: String,
}

impl KindRegistration {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Replaces the config of the definition that owns `replica`, persists it and calls the
    /// kind's `update` on every replica of that definition. Returns how many were updated.
    pub fn set_data(
        &self,
        world: &mut World,
        replica: Entity,
        data: Value,
    ) -> Result<usize, SetDataError> {
        let kind = world
            .resource::<AddonKinds>()
            .get(&self.kind)
            .ok_or_else(|| SetDataError::Unregistered(self.kind.clone()))?;

        let (addon, replicas) = {
            let mut registry = world.resource_mut::<ControllerRegistry>();
            let controller = registry
                .controller_for_replica_mut(replica)
                .filter(|controller| controller.definition().kind_name() == self.kind)
                .ok_or_else(|| SetDataError::NotThisKind(self.kind.clone()))?;
            controller.set_plugin_data(data.clone());
            (controller.addon(), controller.replicas().collect::<Vec<_>>())
        };

        if let Err(err) = world
            .resource_mut::<AddonStore>()
            .set_plugin_data(addon, data.clone())
        {
            warn!("Failed to persist config update for addon {}: {}", addon, err);
        }

        for replica in &replicas {
            kind.update(world, *replica, &data);
        }
        Ok(replicas.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_spec() -> AddonKindSpec {
        AddonKindSpec::new()
            .initialize(|_, args| Ok(Value::from(args.join(" "))))
            .spawn(|world, request| Some(world.spawn(request.transform).id()))
            .kill(|world, replica| {
                world.despawn(replica);
            })
            .update(|_, _, _| {})
    }

    #[test]
    fn missing_callbacks_are_reported() {
        let mut kinds = AddonKinds::default();
        let err = kinds
            .register("sign", AddonKindSpec::new().spawn(|_, _| None))
            .unwrap_err();
        assert_eq!(
            err,
            RegistrationError::MissingCallbacks {
                kind: "sign".into(),
                missing: vec!["initialize", "kill", "update"],
            }
        );
        assert!(err.to_string().contains("initialize, kill, update"));
        assert!(kinds.get("sign").is_none());
    }

    #[test]
    fn names_are_validated() {
        let mut kinds = AddonKinds::default();
        assert_eq!(
            kinds.register(" ", complete_spec()).unwrap_err(),
            RegistrationError::EmptyName
        );
        assert_eq!(
            kinds.register("Prefab", complete_spec()).unwrap_err(),
            RegistrationError::Reserved("Prefab".into())
        );
        kinds.register("sign", complete_spec()).unwrap();
        assert_eq!(
            kinds.register("sign", complete_spec()).unwrap_err(),
            RegistrationError::Duplicate("sign".into())
        );
    }

    #[test]
    fn registered_kind_dispatches_callbacks() {
        let mut kinds = AddonKinds::default();
        let registration = kinds.register("Sign", complete_spec()).unwrap();
        assert_eq!(registration.kind(), "Sign");

        let kind = kinds.find_custom("sign").unwrap();
        assert!(kinds.find_custom("prefab").is_none());
        let actor = ActorContext {
            id: "1".into(),
            name: "admin".into(),
            aim_point: Vec3::ZERO,
            yaw_degrees: 0.0,
        };
        assert_eq!(
            kind.initialize(&actor, &["hello".into(), "world".into()]),
            Ok(Value::from("hello world"))
        );
        assert!(kind.describe(&World::new(), Entity::PLACEHOLDER, &Value::Null).is_none());
        assert!(kinds.unregister("Sign").is_some());
        assert!(kinds.unregister(BUILTIN_KIND).is_none());
    }
}
