//! Snapshot-based image replayer.
//!
//! One [`Replayer`] exists per (local image, remote image) pair. It
//! continuously drags the local image forward so that it reflects each new
//! mirror snapshot produced on the remote image, preserving crash
//! consistency: object data for a sync point is only declared complete after
//! the local mirror snapshot's metadata has been durably finalized.
//!
//! The replayer talks to the outside world exclusively through the traits in
//! [`traits`]: an image handle per side, a deep-copy engine bound to the
//! pair, a pool-meta cache for peer discovery, and a status listener.

pub mod error;
mod replay;
pub mod tracker;
pub mod traits;

pub use error::ReplayError;
pub use replay::{Replayer, ReplayerOptions, State};
pub use tracker::AsyncOpTracker;
pub use traits::{
    DeepCopyEngine, MirrorImage, PoolMetaCache, RemotePoolMeta, ReplayerListener,
    SyncProgressHandler, UpdateWatcher, WatchHandle,
};
