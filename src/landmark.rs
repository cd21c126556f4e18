//! Landmark abstraction: a uniform view over "a place in the world with a transform and a
//! containment test".
//!
//! Static landmarks come from the external discovery collaborator (`LandmarkDiscovery`). Mobile
//! landmarks are live entities carrying a `MobileLandmark` component; they appear and disappear at
//! runtime, so every `LandmarkInstance` built from one must be re-validated against the `World`
//! right before use. Nothing here is persisted: aliases are always resolved fresh.

use std::collections::BTreeSet;
use std::sync::Arc;

use bevy::math::EulerRot;
use bevy::prelude::*;

/// Opaque identity of a landmark instance in the host world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LandmarkHandle {
    /// Discovered landmark; the id is whatever the discovery collaborator hands out.
    Static(u64),
    /// Dynamic landmark backed by a live entity.
    Mobile(Entity),
}

/// Axis-aligned box in the landmark's local frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LandmarkBounds {
    pub center: Vec3,
    pub half_extents: Vec3,
}

impl LandmarkBounds {
    pub fn new(center: Vec3, half_extents: Vec3) -> Self {
        Self {
            center,
            half_extents: half_extents.abs(),
        }
    }

    pub fn from_size(size: Vec3) -> Self {
        Self::new(Vec3::ZERO, size * 0.5)
    }

    fn contains_local(&self, local: Vec3) -> bool {
        let offset = (local - self.center).abs();
        offset.cmple(self.half_extents).all()
    }

    fn clamp_local(&self, local: Vec3) -> Vec3 {
        local.clamp(
            self.center - self.half_extents,
            self.center + self.half_extents,
        )
    }
}

/// Dynamic landmark marker. Entities carrying it (vehicles, moving platforms) are landmarks for as
/// long as they exist.
#[derive(Component, Debug, Clone, PartialEq)]
pub struct MobileLandmark {
    pub alias: String,
    pub short_name: String,
    pub bounds: LandmarkBounds,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkInstance {
    pub handle: LandmarkHandle,
    pub short_name: String,
    pub alias: String,
    pub transform: Transform,
    pub bounds: LandmarkBounds,
}

impl LandmarkInstance {
    pub fn new_static(
        id: u64,
        short_name: impl Into<String>,
        alias: impl Into<String>,
        transform: Transform,
        bounds: LandmarkBounds,
    ) -> Self {
        Self {
            handle: LandmarkHandle::Static(id),
            short_name: short_name.into(),
            alias: alias.into(),
            transform,
            bounds,
        }
    }

    pub fn from_mobile(entity: Entity, landmark: &MobileLandmark, transform: &Transform) -> Self {
        Self {
            handle: LandmarkHandle::Mobile(entity),
            short_name: landmark.short_name.clone(),
            alias: landmark.alias.clone(),
            transform: *transform,
            bounds: landmark.bounds,
        }
    }

    pub fn is_mobile(&self) -> bool {
        matches!(self.handle, LandmarkHandle::Mobile(_))
    }

    /// Rotation about the vertical axis, in degrees.
    pub fn yaw_degrees(&self) -> f32 {
        let (yaw, _, _) = self.transform.rotation.to_euler(EulerRot::YXZ);
        yaw.to_degrees()
    }

    pub fn transform_point(&self, local: Vec3) -> Vec3 {
        self.transform.transform_point(local)
    }

    pub fn inverse_transform_point(&self, point: Vec3) -> Vec3 {
        let scale = self.transform.scale.max(Vec3::splat(f32::EPSILON));
        (self.transform.rotation.inverse() * (point - self.transform.translation)) / scale
    }

    pub fn contains(&self, point: Vec3) -> bool {
        self.bounds.contains_local(self.inverse_transform_point(point))
    }

    pub fn closest_point(&self, point: Vec3) -> Vec3 {
        let local = self.bounds.clamp_local(self.inverse_transform_point(point));
        self.transform_point(local)
    }

    /// World-space transform of something placed at `local_position` and rotated
    /// `rotation_angle` degrees about the vertical axis in this landmark's frame.
    pub fn world_transform(&self, local_position: Vec3, rotation_angle: f32) -> Transform {
        let local_rotation = Quat::from_rotation_y(rotation_angle.to_radians());
        Transform {
            translation: self.transform_point(local_position),
            rotation: self.transform.rotation * local_rotation,
            scale: Vec3::ONE,
        }
    }

    /// Whether the backing object still exists. Static landmarks never go away mid-session.
    pub fn is_alive(&self, world: &World) -> bool {
        match self.handle {
            LandmarkHandle::Static(_) => true,
            LandmarkHandle::Mobile(entity) => world
                .get_entity(entity)
                .is_some_and(|entity| entity.contains::<MobileLandmark>()),
        }
    }

    /// Re-validates the instance and returns a copy carrying the current transform, or `None`
    /// when its backing object has been destroyed since the instance was resolved.
    pub fn refreshed(&self, world: &World) -> Option<Self> {
        match self.handle {
            LandmarkHandle::Static(_) => Some(self.clone()),
            LandmarkHandle::Mobile(entity) => {
                let entity_ref = world.get_entity(entity)?;
                let landmark = entity_ref.get::<MobileLandmark>()?;
                let transform = entity_ref.get::<Transform>().copied().unwrap_or_default();
                Some(Self::from_mobile(entity, landmark, &transform))
            }
        }
    }
}

/// Landmark events plus the observers that announce mobile landmarks.
pub struct LandmarkPlugin;

impl Plugin for LandmarkPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<LandmarkResolver>()
            .add_event::<LandmarkArrived>()
            .add_event::<LandmarkDeparted>()
            .observe(announce_mobile_landmark)
            .observe(announce_mobile_departure);
    }
}

/// External landmark-discovery collaborator.
pub trait LandmarkDiscovery: Send + Sync {
    /// The landmark closest to `point`, if any exists.
    fn closest(&self, point: Vec3) -> Option<LandmarkInstance>;

    /// Every current instance of `alias`. `None` means the alias is unknown to the service.
    fn by_alias(&self, alias: &str) -> Option<Vec<LandmarkInstance>>;
}

/// Fixed list of landmarks, used by tests and the demo host.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    instances: Vec<LandmarkInstance>,
}

impl StaticDiscovery {
    pub fn new(instances: Vec<LandmarkInstance>) -> Self {
        Self { instances }
    }
}

impl LandmarkDiscovery for StaticDiscovery {
    fn closest(&self, point: Vec3) -> Option<LandmarkInstance> {
        self.instances
            .iter()
            .min_by(|a, b| {
                let da = a.closest_point(point).distance_squared(point);
                let db = b.closest_point(point).distance_squared(point);
                da.total_cmp(&db)
            })
            .cloned()
    }

    fn by_alias(&self, alias: &str) -> Option<Vec<LandmarkInstance>> {
        Some(
            self.instances
                .iter()
                .filter(|instance| instance.alias == alias)
                .cloned()
                .collect(),
        )
    }
}

/// Entry point for resolving landmarks. Holds the (optional) discovery collaborator and the set of
/// aliases that name dynamic landmark classes.
#[derive(Resource, Default, Clone)]
pub struct LandmarkResolver {
    discovery: Option<Arc<dyn LandmarkDiscovery>>,
    mobile_aliases: BTreeSet<String>,
}

impl LandmarkResolver {
    pub fn set_discovery(&mut self, discovery: impl LandmarkDiscovery + 'static) {
        self.discovery = Some(Arc::new(discovery));
    }

    pub fn is_available(&self) -> bool {
        self.discovery.is_some()
    }

    pub fn register_mobile_alias(&mut self, alias: impl Into<String>) {
        self.mobile_aliases.insert(alias.into());
    }

    pub fn is_mobile_alias(&self, alias: &str) -> bool {
        self.mobile_aliases.contains(alias)
    }
}

/// Sent whenever a new landmark instance appears. Mobile landmarks raise it automatically; other
/// collaborators may send it directly.
#[derive(Event, Debug, Clone)]
pub struct LandmarkArrived(pub LandmarkInstance);

/// Sent when a mobile landmark loses its `MobileLandmark` component or is despawned.
#[derive(Event, Debug, Clone, Copy)]
pub struct LandmarkDeparted(pub LandmarkHandle);

fn mobile_instances(world: &mut World, alias: Option<&str>) -> Vec<LandmarkInstance> {
    let mut query = world.query::<(Entity, &MobileLandmark, Option<&Transform>)>();
    query
        .iter(world)
        .filter(|(_, landmark, _)| alias.map_or(true, |alias| landmark.alias == alias))
        .map(|(entity, landmark, transform)| {
            LandmarkInstance::from_mobile(entity, landmark, &transform.copied().unwrap_or_default())
        })
        .collect()
}

/// All current instances of `alias`.
///
/// Mobile aliases resolve against live entities and always succeed (possibly empty). Other aliases
/// go through the discovery collaborator; `None` means that collaborator is unavailable.
pub fn resolve_all_by_alias(world: &mut World, alias: &str) -> Option<Vec<LandmarkInstance>> {
    let resolver = world.resource::<LandmarkResolver>().clone();
    if resolver.is_mobile_alias(alias) {
        return Some(mobile_instances(world, Some(alias)));
    }
    resolver
        .discovery
        .as_ref()
        .map(|discovery| discovery.by_alias(alias).unwrap_or_default())
}

/// The landmark that best matches `point`: a mobile landmark containing it, otherwise whatever
/// the discovery collaborator reports as closest.
pub fn resolve_closest(world: &mut World, point: Vec3) -> Option<LandmarkInstance> {
    let containing = mobile_instances(world, None)
        .into_iter()
        .filter(|instance| instance.contains(point))
        .min_by(|a, b| {
            let da = a.transform.translation.distance_squared(point);
            let db = b.transform.translation.distance_squared(point);
            da.total_cmp(&db)
        });
    if containing.is_some() {
        return containing;
    }

    let resolver = world.resource::<LandmarkResolver>();
    resolver
        .discovery
        .as_ref()
        .and_then(|discovery| discovery.closest(point))
}

pub(crate) fn announce_mobile_landmark(
    trigger: Trigger<OnAdd, MobileLandmark>,
    landmarks: Query<(&MobileLandmark, Option<&Transform>)>,
    mut resolver: ResMut<LandmarkResolver>,
    mut arrivals: EventWriter<LandmarkArrived>,
) {
    let entity = trigger.entity();
    let Ok((landmark, transform)) = landmarks.get(entity) else {
        return;
    };
    if !resolver.is_mobile_alias(&landmark.alias) {
        resolver.register_mobile_alias(landmark.alias.clone());
    }
    arrivals.send(LandmarkArrived(LandmarkInstance::from_mobile(
        entity,
        landmark,
        &transform.copied().unwrap_or_default(),
    )));
}

pub(crate) fn announce_mobile_departure(
    trigger: Trigger<OnRemove, MobileLandmark>,
    mut departures: EventWriter<LandmarkDeparted>,
) {
    departures.send(LandmarkDeparted(LandmarkHandle::Mobile(trigger.entity())));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outpost(id: u64, x: f32, yaw: f32) -> LandmarkInstance {
        LandmarkInstance::new_static(
            id,
            "outpost",
            "Outpost",
            Transform::from_xyz(x, 0.0, 0.0).with_rotation(Quat::from_rotation_y(yaw.to_radians())),
            LandmarkBounds::from_size(Vec3::new(20.0, 10.0, 20.0)),
        )
    }

    #[test]
    fn local_and_world_frames_round_trip() {
        let instance = outpost(1, 100.0, 90.0);
        let world_point = instance.transform_point(Vec3::new(1.0, 0.0, 1.0));
        let local = instance.inverse_transform_point(world_point);
        assert!(local.abs_diff_eq(Vec3::new(1.0, 0.0, 1.0), 1e-4));
        assert!((instance.yaw_degrees() - 90.0).abs() < 1e-3);
    }

    #[test]
    fn containment_uses_local_bounds() {
        let instance = outpost(1, 100.0, 45.0);
        assert!(instance.contains(Vec3::new(100.0, 1.0, 0.0)));
        assert!(!instance.contains(Vec3::new(130.0, 1.0, 0.0)));
        let clamped = instance.closest_point(Vec3::new(100.0, 50.0, 0.0));
        assert!((clamped.y - 5.0).abs() < 1e-4);
    }

    #[test]
    fn world_transform_composes_rotation() {
        let instance = outpost(1, 0.0, 90.0);
        let transform = instance.world_transform(Vec3::X, 90.0);
        let expected = Quat::from_rotation_y(180f32.to_radians());
        assert!(transform.rotation.angle_between(expected) < 1e-4);
        assert!(transform.translation.abs_diff_eq(Vec3::new(0.0, 0.0, -1.0), 1e-4));
    }

    #[test]
    fn unavailable_discovery_is_distinct_from_empty() {
        let mut world = World::new();
        world.init_resource::<LandmarkResolver>();
        assert!(resolve_all_by_alias(&mut world, "Outpost").is_none());

        world
            .resource_mut::<LandmarkResolver>()
            .set_discovery(StaticDiscovery::new(vec![outpost(1, 0.0, 0.0)]));
        assert_eq!(resolve_all_by_alias(&mut world, "Outpost").map(|v| v.len()), Some(1));
        assert_eq!(resolve_all_by_alias(&mut world, "Lighthouse").map(|v| v.len()), Some(0));
    }

    #[test]
    fn mobile_instances_revalidate_against_world() {
        let mut world = World::new();
        world.init_resource::<LandmarkResolver>();
        world.resource_mut::<LandmarkResolver>().register_mobile_alias("Tugboat");
        let boat = world
            .spawn((
                MobileLandmark {
                    alias: "Tugboat".into(),
                    short_name: "tugboat".into(),
                    bounds: LandmarkBounds::from_size(Vec3::splat(8.0)),
                },
                Transform::from_xyz(5.0, 0.0, 5.0),
            ))
            .id();

        let instances = resolve_all_by_alias(&mut world, "Tugboat").unwrap();
        assert_eq!(instances.len(), 1);
        let instance = instances[0].clone();
        assert!(instance.is_alive(&world));

        world.entity_mut(boat).insert(Transform::from_xyz(9.0, 0.0, 5.0));
        let refreshed = instance.refreshed(&world).unwrap();
        assert_eq!(refreshed.transform.translation, Vec3::new(9.0, 0.0, 5.0));

        world.despawn(boat);
        assert!(!instance.is_alive(&world));
        assert!(instance.refreshed(&world).is_none());
        assert_eq!(resolve_all_by_alias(&mut world, "Tugboat").map(|v| v.len()), Some(0));
    }

    #[test]
    fn closest_prefers_containing_mobile_landmark() {
        let mut world = World::new();
        world.init_resource::<LandmarkResolver>();
        world
            .resource_mut::<LandmarkResolver>()
            .set_discovery(StaticDiscovery::new(vec![outpost(1, 0.0, 0.0)]));
        let boat = world
            .spawn((
                MobileLandmark {
                    alias: "Tugboat".into(),
                    short_name: "tugboat".into(),
                    bounds: LandmarkBounds::from_size(Vec3::splat(4.0)),
                },
                Transform::from_xyz(3.0, 0.0, 0.0),
            ))
            .id();

        let hit = resolve_closest(&mut world, Vec3::new(3.5, 0.0, 0.0)).unwrap();
        assert_eq!(hit.handle, LandmarkHandle::Mobile(boat));
        let miss = resolve_closest(&mut world, Vec3::new(-3.0, 0.0, 0.0)).unwrap();
        assert_eq!(miss.handle, LandmarkHandle::Static(1));
    }
}
