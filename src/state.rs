//! Replication phase and system-set definitions. The phase is a plain resource rather than a Bevy
//! `States` machine: it only gates a handful of exclusive systems and never needs on-enter/on-exit
//! schedules, so flipping it is a single enum write.

use bevy::prelude::*;

/// Where the engine is in its lifecycle. Moves forward only.
#[derive(Resource, Debug, Clone, Copy, Default, Eq, PartialEq, Hash)]
pub enum ReplicationPhase {
    /// Waiting for the landmark-discovery collaborator to become available.
    #[default]
    WaitingForDiscovery,
    /// The startup batch is walking the addon store.
    Replicating,
    /// The startup batch finished (or was cancelled); runtime events still replicate.
    Ready,
    /// Teardown ran. No further cancellable work is accepted.
    ShutDown,
}

impl ReplicationPhase {
    pub fn has_started(self) -> bool {
        !matches!(self, Self::WaitingForDiscovery)
    }

    pub fn is_shut_down(self) -> bool {
        matches!(self, Self::ShutDown)
    }
}

/// Named system sets that order the engine's work inside `Update`.
#[derive(SystemSet, Debug, Clone, PartialEq, Eq, Hash)]
pub enum AddonSet {
    /// Startup replication and landmark arrival handling enqueue batches.
    Enqueue,
    /// The batch scheduler advances every live batch by one item.
    Drive,
}
