//! High-level plugin composition.
//!
//! `AddonsPlugin` loads the addon store, inserts the shared resources and glues together the
//! landmark, controller and replication plugins. Each of those owns its own systems and
//! observers; this orchestrator only registers them with the Bevy application.

use std::sync::Arc;

use bevy::prelude::*;

use crate::commands::Permissions;
use crate::config::AddonsConfig;
use crate::controller::ControllerPlugin;
use crate::host::PrefabCatalog;
use crate::landmark::{LandmarkPlugin, LandmarkResolver};
use crate::replication::ReplicationPlugin;
use crate::scheduler::BatchScheduler;
use crate::state::ReplicationPhase;
use crate::store::{AddonStore, JsonFileBackend, MemoryBackend, StoreBackend};

/// Bundles the whole addon engine into a single unit that can be added to the Bevy `App`.
pub struct AddonsPlugin {
    config: AddonsConfig,
    backend: Arc<dyn StoreBackend>,
}

impl AddonsPlugin {
    /// Persists to the JSON document at `config.data_file`.
    pub fn new(config: AddonsConfig) -> Self {
        let backend = JsonFileBackend::new(config.data_file.clone());
        Self::with_backend(config, backend)
    }

    pub fn with_backend(config: AddonsConfig, backend: impl StoreBackend + 'static) -> Self {
        Self {
            config,
            backend: Arc::new(backend),
        }
    }

    fn load_store(&self) -> AddonStore {
        match AddonStore::load(self.backend.clone()) {
            Ok(store) => {
                info!(
                    "Loaded {} addon definitions across {} landmark aliases",
                    store.len(),
                    store.aliases().count()
                );
                store
            }
            Err(err) => {
                // Keep the broken document on disk for inspection; nothing is written back to it.
                error!("Failed to load addon store: {}; starting empty and in memory", err);
                AddonStore::empty(MemoryBackend::default())
            }
        }
    }
}

impl Plugin for AddonsPlugin {
    fn build(&self, app: &mut App) {
        let mut resolver = LandmarkResolver::default();
        for alias in &self.config.mobile_aliases {
            resolver.register_mobile_alias(alias.clone());
        }

        app.insert_resource(self.config.clone())
            .insert_resource(self.load_store())
            .insert_resource(resolver)
            .init_resource::<ReplicationPhase>()
            .init_resource::<BatchScheduler>()
            .init_resource::<PrefabCatalog>()
            .init_resource::<Permissions>()
            .add_plugins((
                LandmarkPlugin,    // Arrival/departure events for mobile landmarks.
                ControllerPlugin,  // Registry, kind table and replica-loss observer.
                ReplicationPlugin, // Startup replication, batch driver, shutdown.
            ));
    }
}
