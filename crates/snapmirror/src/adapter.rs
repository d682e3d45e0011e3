//! Adapters implementing the replayer's outbound traits over the in-memory
//! image store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use imagestore::{DeepCopier, MemoryImage};
use mirror_core::{ImageError, ImageResult, ImageSpec, ImageState, PoolId, SnapId, SnapInfo, SnapSeqs};
use replayer::{
    DeepCopyEngine, MirrorImage, PoolMetaCache, RemotePoolMeta, SyncProgressHandler,
    UpdateWatcher, WatchHandle,
};

/// [`MirrorImage`] over a [`MemoryImage`].
///
/// Update watchers are bridged by one forwarding task per registration: the
/// task drains the store's broadcast channel and invokes the watcher.
/// Unregistration aborts the task, so no notification is delivered after
/// `unregister_update_watcher` returns.
pub struct StoreImage {
    image: Arc<MemoryImage>,
    next_watch_handle: AtomicU64,
    watch_tasks: Mutex<HashMap<WatchHandle, JoinHandle<()>>>,
}

impl StoreImage {
    pub fn new(image: Arc<MemoryImage>) -> Self {
        Self {
            image,
            next_watch_handle: AtomicU64::new(1),
            watch_tasks: Mutex::new(HashMap::new()),
        }
    }
}

impl Drop for StoreImage {
    fn drop(&mut self) {
        for (_, task) in self.watch_tasks.lock().drain() {
            task.abort();
        }
    }
}

#[async_trait]
impl MirrorImage for StoreImage {
    fn spec(&self) -> &ImageSpec {
        self.image.spec()
    }

    fn is_refresh_required(&self) -> bool {
        self.image.is_refresh_required()
    }

    async fn refresh(&self) -> ImageResult<()> {
        self.image.refresh();
        Ok(())
    }

    fn snap_infos(&self) -> BTreeMap<SnapId, SnapInfo> {
        self.image.snap_infos()
    }

    async fn register_update_watcher(
        &self,
        watcher: Arc<dyn UpdateWatcher>,
    ) -> ImageResult<WatchHandle> {
        let mut rx = self.image.watch_updates();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    // lagged notifications coalesce into one
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        watcher.handle_notify().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let handle = self.next_watch_handle.fetch_add(1, Ordering::AcqRel);
        self.watch_tasks.lock().insert(handle, task);
        Ok(handle)
    }

    async fn unregister_update_watcher(&self, handle: WatchHandle) -> ImageResult<()> {
        match self.watch_tasks.lock().remove(&handle) {
            Some(task) => {
                task.abort();
                Ok(())
            }
            None => Err(ImageError::NotFound),
        }
    }

    async fn notify_update(&self) -> ImageResult<()> {
        self.image.notify_update();
        Ok(())
    }

    async fn set_mirror_snapshot_copy_progress(
        &self,
        snap_id: SnapId,
        complete: bool,
        last_copied_object_number: u64,
    ) -> ImageResult<()> {
        self.image
            .set_mirror_snapshot_copy_progress(snap_id, complete, last_copied_object_number)
    }
}

/// [`DeepCopyEngine`] over a [`DeepCopier`].
pub struct StoreDeepCopy {
    copier: DeepCopier,
}

impl StoreDeepCopy {
    pub fn new(copier: DeepCopier) -> Self {
        Self { copier }
    }
}

#[async_trait]
impl DeepCopyEngine for StoreDeepCopy {
    async fn copy_snapshots(
        &self,
        remote_snap_id_start: SnapId,
        remote_snap_id_end: SnapId,
        local_snap_id_start: SnapId,
    ) -> ImageResult<SnapSeqs> {
        self.copier
            .copy_snapshots(remote_snap_id_start, remote_snap_id_end, local_snap_id_start)
            .await
    }

    async fn get_image_state(&self, remote_snap_id: SnapId) -> ImageResult<ImageState> {
        self.copier.get_image_state(remote_snap_id).await
    }

    async fn create_non_primary_snapshot(
        &self,
        demoted: bool,
        primary_mirror_uuid: &str,
        primary_snap_id: SnapId,
        snap_seqs: &SnapSeqs,
        image_state: &ImageState,
    ) -> ImageResult<SnapId> {
        self.copier
            .create_non_primary_snapshot(
                demoted,
                primary_mirror_uuid,
                primary_snap_id,
                snap_seqs,
                image_state,
            )
            .await
    }

    async fn copy_image(
        &self,
        remote_snap_id_start: SnapId,
        remote_snap_id_end: SnapId,
        local_snap_id_start: SnapId,
        resume_object: Option<u64>,
        snap_seqs: &SnapSeqs,
        progress: Arc<dyn SyncProgressHandler>,
    ) -> ImageResult<()> {
        self.copier
            .copy_image(
                remote_snap_id_start,
                remote_snap_id_end,
                local_snap_id_start,
                resume_object,
                snap_seqs,
                &|offset, total| progress.update_progress(offset, total),
            )
            .await
    }

    async fn unlink_peer(&self, remote_snap_id: SnapId, peer_uuid: &str) -> ImageResult<()> {
        self.copier.unlink_peer(remote_snap_id, peer_uuid).await
    }
}

/// Static pool-meta cache populated at startup.
#[derive(Default)]
pub struct StaticPoolMetaCache {
    pools: Mutex<HashMap<PoolId, RemotePoolMeta>>,
}

impl StaticPoolMetaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pool_id: PoolId, meta: RemotePoolMeta) {
        self.pools.lock().insert(pool_id, meta);
    }
}

impl PoolMetaCache for StaticPoolMetaCache {
    fn remote_pool_meta(&self, pool_id: PoolId) -> Option<RemotePoolMeta> {
        self.pools.lock().get(&pool_id).cloned()
    }
}
