//! Outbound service traits required by the replayer.
//!
//! The replayer is generic over its backend: everything it needs from the
//! block-storage client library is expressed here and injected through
//! [`ReplayerOptions`](crate::ReplayerOptions). Backends implement these
//! traits; the replayer never talks to a cluster directly.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use mirror_core::{ImageResult, ImageSpec, ImageState, PoolId, SnapId, SnapInfo, SnapSeqs};

/// Opaque handle returned by [`MirrorImage::register_update_watcher`].
pub type WatchHandle = u64;

/// Callback invoked by the backend whenever the watched image's metadata
/// changes. May be called from any task at any time between registration and
/// unregistration.
#[async_trait]
pub trait UpdateWatcher: Send + Sync {
    async fn handle_notify(&self);
}

/// Handle to one image of the mirrored pair.
#[async_trait]
pub trait MirrorImage: Send + Sync {
    /// Identity of the image, used for peer discovery and log messages.
    fn spec(&self) -> &ImageSpec;

    /// Whether the cached image metadata is stale and needs a refresh before
    /// the snapshot listing can be trusted.
    fn is_refresh_required(&self) -> bool;

    /// Re-read image metadata from the cluster.
    async fn refresh(&self) -> ImageResult<()>;

    /// Snapshot listing in ascending snap-id order, taken as one consistent
    /// view under the image lock.
    fn snap_infos(&self) -> BTreeMap<SnapId, SnapInfo>;

    /// Subscribe to image-update notifications.
    async fn register_update_watcher(
        &self,
        watcher: Arc<dyn UpdateWatcher>,
    ) -> ImageResult<WatchHandle>;

    /// Drop a previously registered watcher. After this returns the watcher
    /// will not be notified again.
    async fn unregister_update_watcher(&self, handle: WatchHandle) -> ImageResult<()>;

    /// Best-effort notification to other watchers of this image.
    async fn notify_update(&self) -> ImageResult<()>;

    /// Atomically persist sync progress into a mirror snapshot's metadata.
    async fn set_mirror_snapshot_copy_progress(
        &self,
        snap_id: SnapId,
        complete: bool,
        last_copied_object_number: u64,
    ) -> ImageResult<()>;
}

/// Receives `(offset, total)` updates while an object copy is in flight.
pub trait SyncProgressHandler: Send + Sync {
    fn update_progress(&self, offset: u64, total: u64);
}

/// Deep-copy primitives bound to one (remote, local) image pair.
///
/// All operations are asynchronous and guarantee object-level durability on
/// success; the replayer does not issue separate flushes.
#[async_trait]
pub trait DeepCopyEngine: Send + Sync {
    /// Replicate snapshot definitions in `(remote_snap_id_start,
    /// remote_snap_id_end]` onto the local image and return the
    /// remote-to-local snap-id translation table.
    async fn copy_snapshots(
        &self,
        remote_snap_id_start: SnapId,
        remote_snap_id_end: SnapId,
        local_snap_id_start: SnapId,
    ) -> ImageResult<SnapSeqs>;

    /// Fetch the opaque image-state blob attached to a remote snapshot.
    async fn get_image_state(&self, remote_snap_id: SnapId) -> ImageResult<ImageState>;

    /// Create the local incomplete non-primary mirror snapshot and return
    /// its snap-id.
    async fn create_non_primary_snapshot(
        &self,
        demoted: bool,
        primary_mirror_uuid: &str,
        primary_snap_id: SnapId,
        snap_seqs: &SnapSeqs,
        image_state: &ImageState,
    ) -> ImageResult<SnapId>;

    /// Object-level deep copy over `(remote_snap_id_start,
    /// remote_snap_id_end]`, skipping object numbers below `resume_object`
    /// when resuming an interrupted sync.
    async fn copy_image(
        &self,
        remote_snap_id_start: SnapId,
        remote_snap_id_end: SnapId,
        local_snap_id_start: SnapId,
        resume_object: Option<u64>,
        snap_seqs: &SnapSeqs,
        progress: Arc<dyn SyncProgressHandler>,
    ) -> ImageResult<()>;

    /// Remove our peer uuid from a remote primary mirror snapshot so the
    /// remote may prune it.
    async fn unlink_peer(&self, remote_snap_id: SnapId, peer_uuid: &str) -> ImageResult<()>;
}

/// Peer metadata for a remote pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePoolMeta {
    /// Uuid under which this (local) cluster is registered as a mirror peer
    /// on the remote pool.
    pub mirror_peer_uuid: String,
}

/// Pool/peer metadata discovery.
pub trait PoolMetaCache: Send + Sync {
    fn remote_pool_meta(&self, pool_id: PoolId) -> Option<RemotePoolMeta>;
}

/// Status notifications emitted by the replayer.
///
/// One coarse notification per state transition worth observing; the
/// listener reacts by inspecting the replayer's state and recorded status.
#[async_trait]
pub trait ReplayerListener: Send + Sync {
    async fn handle_notification(&self);
}
