pub mod boot;
pub mod config;
pub mod daemon;
mod errors;
pub mod rollout;
mod upgrader;
pub mod watcher;
pub mod zinit;

pub use config::UpgraderConfig;
pub use errors::{StepOutcome, UpgradeError, UpgradeReport};
pub use upgrader::{services_from_manifest, PackageRef, Upgrader};

#[cfg(test)]
mod tests;
