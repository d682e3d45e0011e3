//! Mirroring daemon library.
//!
//! Glues the replayer core to the in-memory image store: configuration,
//! trait adapters, and the per-image supervisor that constructs and tears
//! down replayers.

pub mod adapter;
pub mod config;
pub mod supervisor;

pub use adapter::{StaticPoolMetaCache, StoreDeepCopy, StoreImage};
pub use config::{Config, ConfigError};
pub use supervisor::{ImageMirror, MirrorOutcome};
