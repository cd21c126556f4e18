//! Landmark addons: persistent objects authored once relative to a landmark type and replicated
//! at every instance of that landmark in a Bevy world.
//!
//! Add [`AddonsPlugin`] to an `App`, hand the [`LandmarkResolver`] a discovery collaborator, and
//! the engine replicates the stored definitions over the following ticks. Admin commands live in
//! [`commands`]; third-party kinds register through [`replication::register_kind`].

pub mod app;
pub mod commands;
pub mod config;
pub mod controller;
pub mod hardening;
pub mod host;
pub mod kinds;
pub mod landmark;
pub mod migration;
pub mod registry;
pub mod replication;
pub mod scheduler;
pub mod state;
pub mod store;

pub use app::AddonsPlugin;
pub use config::AddonsConfig;
pub use landmark::LandmarkResolver;
