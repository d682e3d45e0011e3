//! Shared domain types for the snapmirror workspace.
//!
//! Everything that is persisted in snapshot metadata or exchanged between the
//! replayer core and a block-storage backend lives here: identifiers, the
//! mirror snapshot namespace, and the common error/result types.

pub mod error;
pub mod snapshot;
mod types;

pub use error::{code, ImageError, ImageResult};
pub use snapshot::{
    ImageState, MirrorSnapshotNamespace, MirrorSnapshotState, SnapInfo, SnapshotNamespace,
};
pub use types::{ImageSpec, PoolId, SnapId, SnapSeqs, NO_SNAP};
