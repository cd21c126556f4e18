//! Schema migrations for the persisted addon document.
//!
//! Each migration runs only when the document is exactly at its source version and bumps the
//! version itself, so a migration never reruns once the document has moved past it. Migrations
//! are total over every shape the older schema accepted.

use std::collections::BTreeMap;

use crate::store::{AddonDefinition, StoredData};

pub const CURRENT_VERSION: u32 = 2;

type Migration = fn(&mut StoredData) -> bool;

const MIGRATIONS: &[(u32, Migration)] = &[(0, rename_legacy_aliases), (1, normalize_entries)];

/// Legacy upper-case alias keys and their replacements.
const LEGACY_ALIASES: &[(&str, &str)] = &[
    ("TRAIN_STATION", "TrainStation"),
    ("TRAIN_TUNNEL_STRAIGHT", "TrainTunnelStraight"),
    ("TRAIN_TUNNEL_CURVE", "TrainTunnelCurve"),
    ("TRAIN_TUNNEL_INTERSECTION", "TrainTunnelIntersection"),
    ("LARGE_OIL_RIG", "LargeOilRig"),
    ("SMALL_OIL_RIG", "SmallOilRig"),
];

/// Aliases whose landmark forward axis was reported reversed before version 1. Angles stored
/// against them were measured from the opposite direction.
const REVERSED_FORWARD_ALIASES: &[&str] = &[
    "TrainStation",
    "TrainTunnelStraight",
    "TrainTunnelCurve",
    "TrainTunnelIntersection",
];

/// Runs every pending migration in ascending order. Returns whether the document changed.
pub fn migrate(data: &mut StoredData) -> bool {
    let mut mutated = false;
    for (version, migration) in MIGRATIONS {
        if data.version == *version {
            mutated |= migration(data);
        }
    }
    mutated
}

fn renamed_alias(alias: &str) -> &str {
    LEGACY_ALIASES
        .iter()
        .find(|(legacy, _)| *legacy == alias)
        .map_or(alias, |(_, current)| *current)
}

pub(crate) fn normalize_angle(angle: f32) -> f32 {
    let normalized = angle.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs.
    if normalized >= 360.0 {
        0.0
    } else {
        normalized
    }
}

/// v0 -> v1. Renames alias keys and re-derives rotation angles in the same pass over each entry:
/// the angle fix depends on the alias the entry ends up under.
fn rename_legacy_aliases(data: &mut StoredData) -> bool {
    let legacy = std::mem::take(&mut data.monuments);
    let mut migrated: BTreeMap<String, Vec<AddonDefinition>> = BTreeMap::new();

    for (alias, entries) in legacy {
        let alias = renamed_alias(&alias).to_owned();
        let reversed = REVERSED_FORWARD_ALIASES.contains(&alias.as_str());
        let bucket = migrated.entry(alias).or_default();
        for mut entry in entries {
            if reversed {
                entry.rotation_angle = normalize_angle(entry.rotation_angle + 180.0);
            }
            bucket.push(entry);
        }
    }

    data.monuments = migrated;
    data.version = 1;
    true
}

/// v1 -> v2. Normalizes rotation angles into [0, 360) and drops empty buckets.
fn normalize_entries(data: &mut StoredData) -> bool {
    data.monuments.retain(|_, entries| !entries.is_empty());
    for entry in data.monuments.values_mut().flatten() {
        entry.rotation_angle = normalize_angle(entry.rotation_angle);
    }
    data.version = 2;
    true
}
