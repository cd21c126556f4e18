//! Post-spawn invariants for replicas.
//!
//! Runs inside the same exclusive step that constructed the replica, so no other system ever
//! observes an unhardened replica.

use bevy::prelude::*;

use crate::host::{GroundWatch, Health, MovesWithParent, Pickup, Power, SavePolicy};
use crate::landmark::{LandmarkHandle, LandmarkInstance};

/// Makes `replica` safe to leave under engine-managed lifetime:
///
/// - host saves skip it, so a restore cannot resurrect a duplicate;
/// - it cannot be damaged, picked up or salvaged;
/// - anything with a power switch is forced on;
/// - host behaviours that would despawn it on their own are removed;
/// - on a mobile landmark it becomes a child of the landmark's entity and moves with it.
///
/// Replicas on mobile landmarks must already carry their transform relative to the landmark.
pub fn harden_replica(world: &mut World, replica: Entity, landmark: &LandmarkInstance) {
    let Some(mut entity) = world.get_entity_mut(replica) else {
        return;
    };

    entity.insert(SavePolicy::Disabled);
    if let Some(mut health) = entity.get_mut::<Health>() {
        health.invulnerable = true;
    }
    if let Some(mut power) = entity.get_mut::<Power>() {
        power.powered = true;
    }
    entity.remove::<(Pickup, GroundWatch)>();

    if let LandmarkHandle::Mobile(parent) = landmark.handle {
        entity.insert(MovesWithParent);
        entity.set_parent(parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmark::LandmarkBounds;

    fn spawn_default_replica(world: &mut World) -> Entity {
        world
            .spawn((
                Transform::IDENTITY,
                SavePolicy::Persist,
                Health {
                    current: 100.0,
                    invulnerable: false,
                },
                Pickup,
                Power { powered: false },
                GroundWatch,
            ))
            .id()
    }

    #[test]
    fn static_landmark_replica_is_hardened_in_place() {
        let mut world = World::new();
        let replica = spawn_default_replica(&mut world);
        let landmark = LandmarkInstance::new_static(
            1,
            "outpost",
            "Outpost",
            Transform::IDENTITY,
            LandmarkBounds::from_size(Vec3::splat(10.0)),
        );

        harden_replica(&mut world, replica, &landmark);

        let entity = world.entity(replica);
        assert_eq!(entity.get::<SavePolicy>(), Some(&SavePolicy::Disabled));
        assert!(entity.get::<Health>().unwrap().invulnerable);
        assert_eq!(entity.get::<Power>(), Some(&Power { powered: true }));
        assert!(!entity.contains::<Pickup>());
        assert!(!entity.contains::<GroundWatch>());
        assert!(!entity.contains::<Parent>());
        assert!(!entity.contains::<MovesWithParent>());
    }

    #[test]
    fn mobile_landmark_replica_is_parented() {
        let mut world = World::new();
        let boat = world.spawn(Transform::from_xyz(5.0, 0.0, 0.0)).id();
        let replica = world.spawn(Transform::from_xyz(1.0, 0.0, 0.0)).id();
        let landmark = LandmarkInstance {
            handle: LandmarkHandle::Mobile(boat),
            short_name: "tugboat".into(),
            alias: "Tugboat".into(),
            transform: Transform::from_xyz(5.0, 0.0, 0.0),
            bounds: LandmarkBounds::from_size(Vec3::splat(8.0)),
        };

        harden_replica(&mut world, replica, &landmark);

        assert_eq!(world.entity(replica).get::<Parent>().map(Parent::get), Some(boat));
        assert!(world.entity(replica).contains::<MovesWithParent>());
        assert!(world.entity(boat).get::<Children>().unwrap().contains(&replica));
    }

    #[test]
    fn missing_entity_is_ignored() {
        let mut world = World::new();
        let replica = world.spawn_empty().id();
        world.despawn(replica);
        let landmark = LandmarkInstance::new_static(
            1,
            "outpost",
            "Outpost",
            Transform::IDENTITY,
            LandmarkBounds::from_size(Vec3::ONE),
        );
        harden_replica(&mut world, replica, &landmark);
        assert!(world.get_entity(replica).is_none());
    }
}
