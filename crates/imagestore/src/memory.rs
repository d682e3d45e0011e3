//! In-memory cluster and image implementation.
//!
//! One [`MemoryCluster`] stands in for a block-storage cluster: it owns the
//! cluster-wide mirror uuid, the monotonic snap-id allocator and the pools
//! of images. A [`MemoryImage`] stores its head objects plus one frozen
//! object map per snapshot, so point-in-time reads stay cheap and exact.
//!
//! The staleness protocol of a real cluster client is modelled with a
//! `refresh_required` flag: snapshot-metadata mutations set it, `refresh`
//! clears it. Update watchers are a broadcast channel; `notify_update`
//! wakes every subscriber.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use mirror_core::{
    ImageError, ImageResult, ImageSpec, ImageState, MirrorSnapshotNamespace, PoolId, SnapId,
    SnapInfo, SnapshotNamespace, NO_SNAP,
};

const UPDATE_CHANNEL_CAPACITY: usize = 16;

/// In-memory stand-in for one block-storage cluster.
pub struct MemoryCluster {
    mirror_uuid: String,
    snap_ids: Arc<AtomicU64>,
    pools: RwLock<HashMap<PoolId, HashMap<String, Arc<MemoryImage>>>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::with_mirror_uuid(Uuid::new_v4().to_string())
    }

    pub fn with_mirror_uuid(mirror_uuid: impl Into<String>) -> Self {
        Self {
            mirror_uuid: mirror_uuid.into(),
            snap_ids: Arc::new(AtomicU64::new(1)),
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Uuid under which this cluster identifies itself for mirroring.
    pub fn mirror_uuid(&self) -> &str {
        &self.mirror_uuid
    }

    /// Create an image; the pool is created on first use.
    pub fn create_image(&self, spec: ImageSpec) -> ImageResult<Arc<MemoryImage>> {
        let mut pools = self.pools.write();
        let pool = pools.entry(spec.pool_id).or_default();
        if pool.contains_key(&spec.image_id) {
            return Err(ImageError::Exists);
        }

        let image = Arc::new(MemoryImage::new(spec.clone(), self.snap_ids.clone()));
        pool.insert(spec.image_id, image.clone());
        Ok(image)
    }

    pub fn image(&self, spec: &ImageSpec) -> Option<Arc<MemoryImage>> {
        let pools = self.pools.read();
        pools.get(&spec.pool_id)?.get(&spec.image_id).cloned()
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

struct SnapRecord {
    info: SnapInfo,
    objects: BTreeMap<u64, Bytes>,
    image_state: Option<ImageState>,
}

struct ImageInner {
    head: BTreeMap<u64, Bytes>,
    snaps: BTreeMap<SnapId, SnapRecord>,
    refresh_required: bool,
}

/// One image inside a [`MemoryCluster`].
pub struct MemoryImage {
    spec: ImageSpec,
    snap_ids: Arc<AtomicU64>,
    inner: RwLock<ImageInner>,
    update_tx: broadcast::Sender<()>,
}

impl MemoryImage {
    fn new(spec: ImageSpec, snap_ids: Arc<AtomicU64>) -> Self {
        let (update_tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            spec,
            snap_ids,
            inner: RwLock::new(ImageInner {
                head: BTreeMap::new(),
                snaps: BTreeMap::new(),
                refresh_required: false,
            }),
            update_tx,
        }
    }

    pub fn spec(&self) -> &ImageSpec {
        &self.spec
    }

    // ========== Object I/O ==========

    /// Write one whole object at the head revision. Directionality (no
    /// client writes to a non-primary image) is enforced by the caller.
    pub fn write_object(&self, object_number: u64, data: Bytes) {
        let mut inner = self.inner.write();
        inner.head.insert(object_number, data);
    }

    /// Write one object at the head and into a not-yet-finalized snapshot's
    /// frozen object map. Deep copy writes through this so the copy target
    /// snapshot captures the copied data.
    pub fn write_object_with_snap(
        &self,
        snap_id: SnapId,
        object_number: u64,
        data: Bytes,
    ) -> ImageResult<()> {
        let mut inner = self.inner.write();
        let record = inner.snaps.get_mut(&snap_id).ok_or(ImageError::NotFound)?;
        record.objects.insert(object_number, data.clone());
        inner.head.insert(object_number, data);
        Ok(())
    }

    /// Read one object, either from the head (`NO_SNAP`) or from a
    /// snapshot's frozen object map.
    pub fn read_object(&self, snap_id: SnapId, object_number: u64) -> ImageResult<Option<Bytes>> {
        let inner = self.inner.read();
        if snap_id == NO_SNAP {
            return Ok(inner.head.get(&object_number).cloned());
        }
        let record = inner.snaps.get(&snap_id).ok_or(ImageError::NotFound)?;
        Ok(record.objects.get(&object_number).cloned())
    }

    /// Full object map at a revision (`NO_SNAP` for the head).
    pub fn objects_at(&self, snap_id: SnapId) -> ImageResult<BTreeMap<u64, Bytes>> {
        let inner = self.inner.read();
        if snap_id == NO_SNAP {
            return Ok(inner.head.clone());
        }
        let record = inner.snaps.get(&snap_id).ok_or(ImageError::NotFound)?;
        Ok(record.objects.clone())
    }

    // ========== Snapshots ==========

    /// Freeze the head object map under a new snap-id.
    pub fn create_snapshot(&self, info: SnapInfo, image_state: Option<ImageState>) -> SnapId {
        let snap_id = self.snap_ids.fetch_add(1, Ordering::AcqRel);
        let mut inner = self.inner.write();
        let objects = inner.head.clone();
        inner.snaps.insert(
            snap_id,
            SnapRecord {
                info,
                objects,
                image_state,
            },
        );
        inner.refresh_required = true;
        debug!("created snapshot {} on image {}", snap_id, self.spec);
        snap_id
    }

    pub fn create_mirror_snapshot(
        &self,
        name: impl Into<String>,
        ns: MirrorSnapshotNamespace,
        image_state: Option<ImageState>,
    ) -> SnapId {
        self.create_snapshot(SnapInfo::mirror(name, ns), image_state)
    }

    pub fn remove_snapshot(&self, snap_id: SnapId) -> ImageResult<()> {
        let mut inner = self.inner.write();
        if inner.snaps.remove(&snap_id).is_none() {
            return Err(ImageError::NotFound);
        }
        inner.refresh_required = true;
        Ok(())
    }

    /// Snapshot listing in ascending snap-id order, cloned as one view.
    pub fn snap_infos(&self) -> BTreeMap<SnapId, SnapInfo> {
        let inner = self.inner.read();
        inner
            .snaps
            .iter()
            .map(|(snap_id, record)| (*snap_id, record.info.clone()))
            .collect()
    }

    pub fn snap_info(&self, snap_id: SnapId) -> Option<SnapInfo> {
        let inner = self.inner.read();
        inner.snaps.get(&snap_id).map(|record| record.info.clone())
    }

    /// Image-state blob stored with a snapshot, if any was attached.
    pub fn image_state(&self, snap_id: SnapId) -> ImageResult<Option<ImageState>> {
        let inner = self.inner.read();
        let record = inner.snaps.get(&snap_id).ok_or(ImageError::NotFound)?;
        Ok(record.image_state.clone())
    }

    /// Atomically persist sync progress into a mirror snapshot's metadata.
    pub fn set_mirror_snapshot_copy_progress(
        &self,
        snap_id: SnapId,
        complete: bool,
        last_copied_object_number: u64,
    ) -> ImageResult<()> {
        let mut inner = self.inner.write();
        let record = inner.snaps.get_mut(&snap_id).ok_or(ImageError::NotFound)?;
        match &mut record.info.namespace {
            SnapshotNamespace::Mirror(ns) => {
                ns.complete = complete;
                ns.last_copied_object_number = last_copied_object_number;
                inner.refresh_required = true;
                Ok(())
            }
            SnapshotNamespace::User => Err(ImageError::InvalidArgument(format!(
                "snapshot {} is not a mirror snapshot",
                snap_id
            ))),
        }
    }

    /// Remove a peer uuid from a primary mirror snapshot. When the peer set
    /// drains and a later mirror snapshot exists, the snapshot is pruned:
    /// nothing references it as a sync point anymore.
    pub fn unlink_peer(&self, snap_id: SnapId, peer_uuid: &str) -> ImageResult<()> {
        let mut inner = self.inner.write();
        let drained = {
            let record = inner.snaps.get_mut(&snap_id).ok_or(ImageError::NotFound)?;
            let ns = match &mut record.info.namespace {
                SnapshotNamespace::Mirror(ns) if ns.is_primary() => ns,
                _ => {
                    return Err(ImageError::InvalidArgument(format!(
                        "snapshot {} is not a primary mirror snapshot",
                        snap_id
                    )))
                }
            };
            if !ns.mirror_peer_uuids.remove(peer_uuid) {
                return Err(ImageError::NotFound);
            }
            ns.mirror_peer_uuids.is_empty()
        };
        let has_later_mirror = inner
            .snaps
            .range((Excluded(snap_id), Unbounded))
            .any(|(_, rec)| rec.info.namespace.as_mirror().is_some());
        if drained && has_later_mirror {
            debug!("pruning drained mirror snapshot {} on image {}", snap_id, self.spec);
            inner.snaps.remove(&snap_id);
        }
        inner.refresh_required = true;
        Ok(())
    }

    /// Record a demotion: the image stops accepting the primary role.
    pub fn demote<I, S>(&self, mirror_peer_uuids: I) -> SnapId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ns = MirrorSnapshotNamespace::primary(mirror_peer_uuids)
            .demoted()
            .completed();
        self.create_mirror_snapshot("mirror.demoted", ns, None)
    }

    /// Record a (force) promotion: the image takes over the primary role.
    pub fn promote<I, S>(&self, mirror_peer_uuids: I) -> SnapId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ns = MirrorSnapshotNamespace::primary(mirror_peer_uuids).completed();
        self.create_mirror_snapshot("mirror.promoted", ns, None)
    }

    // ========== Staleness & watchers ==========

    pub fn is_refresh_required(&self) -> bool {
        self.inner.read().refresh_required
    }

    /// Re-read metadata. The store is the source of truth, so this only
    /// clears the staleness flag.
    pub fn refresh(&self) {
        self.inner.write().refresh_required = false;
    }

    /// Subscribe to image-update notifications.
    pub fn watch_updates(&self) -> broadcast::Receiver<()> {
        self.update_tx.subscribe()
    }

    /// Wake every update watcher.
    pub fn notify_update(&self) {
        // no receivers is fine
        let _ = self.update_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_core::MirrorSnapshotState;

    fn image() -> Arc<MemoryImage> {
        let cluster = MemoryCluster::new();
        cluster
            .create_image(ImageSpec::new(1, "img"))
            .expect("fresh image")
    }

    #[test]
    fn snapshot_freezes_objects() {
        let image = image();
        image.write_object(0, Bytes::from_static(b"v1"));
        let snap_id = image.create_snapshot(SnapInfo::user("snap1"), None);
        image.write_object(0, Bytes::from_static(b"v2"));

        assert_eq!(
            image.read_object(snap_id, 0).unwrap(),
            Some(Bytes::from_static(b"v1"))
        );
        assert_eq!(
            image.read_object(NO_SNAP, 0).unwrap(),
            Some(Bytes::from_static(b"v2"))
        );
    }

    #[test]
    fn snap_ids_are_monotonic_across_images() {
        let cluster = MemoryCluster::new();
        let a = cluster.create_image(ImageSpec::new(1, "a")).unwrap();
        let b = cluster.create_image(ImageSpec::new(1, "b")).unwrap();

        let s1 = a.create_snapshot(SnapInfo::user("s1"), None);
        let s2 = b.create_snapshot(SnapInfo::user("s2"), None);
        let s3 = a.create_snapshot(SnapInfo::user("s3"), None);
        assert!(s1 < s2 && s2 < s3);
    }

    #[test]
    fn copy_progress_updates_namespace() {
        let image = image();
        let ns = MirrorSnapshotNamespace::non_primary("remote-uuid", 5);
        let snap_id = image.create_mirror_snapshot("mirror.1", ns, None);

        image
            .set_mirror_snapshot_copy_progress(snap_id, true, 17)
            .unwrap();
        let info = image.snap_info(snap_id).unwrap();
        let ns = info.namespace.as_mirror().unwrap();
        assert!(ns.complete);
        assert_eq!(ns.last_copied_object_number, 17);

        assert_eq!(
            image.set_mirror_snapshot_copy_progress(999, true, 0),
            Err(ImageError::NotFound)
        );
    }

    #[test]
    fn unlink_peer_prunes_drained_snapshot() {
        let image = image();
        let first = image.create_mirror_snapshot(
            "mirror.1",
            MirrorSnapshotNamespace::primary(["peer-1"]).completed(),
            None,
        );
        let second = image.create_mirror_snapshot(
            "mirror.2",
            MirrorSnapshotNamespace::primary(["peer-1"]).completed(),
            None,
        );

        // latest snapshot keeps its entry even when drained
        image.unlink_peer(second, "peer-1").unwrap();
        assert!(image.snap_info(second).is_some());

        // the older one is pruned once no peer needs it
        image.unlink_peer(first, "peer-1").unwrap();
        assert!(image.snap_info(first).is_none());

        assert_eq!(image.unlink_peer(999, "peer-1"), Err(ImageError::NotFound));
    }

    #[test]
    fn refresh_protocol() {
        let image = image();
        assert!(!image.is_refresh_required());
        image.create_snapshot(SnapInfo::user("snap"), None);
        assert!(image.is_refresh_required());
        image.refresh();
        assert!(!image.is_refresh_required());
    }

    #[test]
    fn demote_promote_namespaces() {
        let image = image();
        let demoted = image.demote(["peer-1"]);
        let ns = image.snap_info(demoted).unwrap();
        let ns = ns.namespace.as_mirror().unwrap().clone();
        assert_eq!(ns.state, MirrorSnapshotState::PrimaryDemoted);
        assert!(ns.complete);

        let promoted = image.promote(["peer-1"]);
        let ns = image.snap_info(promoted).unwrap();
        assert_eq!(
            ns.namespace.as_mirror().unwrap().state,
            MirrorSnapshotState::Primary
        );
    }

    #[tokio::test]
    async fn watchers_receive_updates() {
        let image = image();
        let mut rx = image.watch_updates();
        image.notify_update();
        rx.recv().await.unwrap();
    }
}
