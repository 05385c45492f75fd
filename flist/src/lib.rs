mod errors;
mod package;

pub mod archive;
pub mod fixtures;
pub mod hub;
pub mod manifest;

pub use errors::Error;
pub use hub::{Filter, HubClient, HubConfig};
pub use manifest::{Entry, Manifest, Walk};
pub use package::{FList, Kind, Package, Regular, Symlink, Tag, TagLink};
