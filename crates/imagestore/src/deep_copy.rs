//! Deep-copy primitives between a (src, dst) image pair.
//!
//! Mirrors the copy pipeline the replayer drives: snapshot-metadata copy,
//! image-state capture, non-primary snapshot creation, object copy with
//! resume support, and peer unlink. All operations yield between objects so
//! a large copy never monopolizes the runtime.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use mirror_core::{
    ImageError, ImageResult, ImageState, MirrorSnapshotNamespace, SnapId, SnapInfo, SnapSeqs,
    SnapshotNamespace,
};

use crate::memory::MemoryImage;

/// Decoded form of the opaque image-state blob: the image metadata a
/// non-primary side needs to reconstruct the primary's view at a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStateRecord {
    pub image_id: String,
    pub object_count: u64,
    pub snapshot_names: Vec<String>,
}

impl ImageStateRecord {
    /// Capture the record for `snap_id` on `image`.
    pub fn capture(image: &MemoryImage, snap_id: SnapId) -> ImageResult<Self> {
        let objects = image.objects_at(snap_id)?;
        let snapshot_names = image
            .snap_infos()
            .range(..=snap_id)
            .map(|(_, info)| info.name.clone())
            .collect();
        Ok(Self {
            image_id: image.spec().image_id.clone(),
            object_count: objects.len() as u64,
            snapshot_names,
        })
    }

    pub fn encode(&self) -> ImageResult<ImageState> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map(ImageState)
            .map_err(|err| ImageError::Io(format!("failed to encode image state: {}", err)))
    }

    pub fn decode(state: &ImageState) -> ImageResult<Self> {
        bincode::serde::decode_from_slice(&state.0, bincode::config::standard())
            .map(|(record, _)| record)
            .map_err(|err| ImageError::Io(format!("failed to decode image state: {}", err)))
    }
}

/// Deep-copy engine bound to one (src, dst) image pair.
pub struct DeepCopier {
    src: Arc<MemoryImage>,
    dst: Arc<MemoryImage>,
}

impl DeepCopier {
    pub fn new(src: Arc<MemoryImage>, dst: Arc<MemoryImage>) -> Self {
        Self { src, dst }
    }

    /// Replicate user snapshot definitions in `(src_start, src_end]` onto
    /// dst, returning the src-to-dst snap-id translation table. Mirror
    /// snapshots in the range are not copied: the end snapshot gets its dst
    /// counterpart from `create_non_primary_snapshot`.
    pub async fn copy_snapshots(
        &self,
        src_snap_id_start: SnapId,
        src_snap_id_end: SnapId,
        _dst_snap_id_start: SnapId,
    ) -> ImageResult<SnapSeqs> {
        let src_snaps = self.src.snap_infos();
        if !src_snaps.contains_key(&src_snap_id_end) {
            return Err(ImageError::NotFound);
        }

        let mut snap_seqs = SnapSeqs::new();
        for (src_snap_id, info) in
            src_snaps.range((Excluded(src_snap_id_start), Included(src_snap_id_end)))
        {
            if let SnapshotNamespace::User = info.namespace {
                let dst_snap_id = self
                    .dst
                    .create_snapshot(SnapInfo::user(info.name.clone()), None);
                debug!(
                    "copied snapshot definition {} -> {} ({})",
                    src_snap_id, dst_snap_id, info.name
                );
                snap_seqs.insert(*src_snap_id, dst_snap_id);
            }
        }
        Ok(snap_seqs)
    }

    /// Capture and encode the image state attached to a src snapshot.
    pub async fn get_image_state(&self, src_snap_id: SnapId) -> ImageResult<ImageState> {
        ImageStateRecord::capture(&self.src, src_snap_id)?.encode()
    }

    /// Create the incomplete non-primary mirror snapshot on dst.
    pub async fn create_non_primary_snapshot(
        &self,
        demoted: bool,
        primary_mirror_uuid: &str,
        primary_snap_id: SnapId,
        snap_seqs: &SnapSeqs,
        image_state: &ImageState,
    ) -> ImageResult<SnapId> {
        let mut ns = MirrorSnapshotNamespace::non_primary(primary_mirror_uuid, primary_snap_id);
        if demoted {
            ns = ns.demoted();
        }
        ns.snap_seqs = snap_seqs.clone();

        let name = format!("mirror.non_primary.{}", primary_snap_id);
        Ok(self
            .dst
            .create_mirror_snapshot(name, ns, Some(image_state.clone())))
    }

    /// Object-level copy of everything that changed between `src_start` and
    /// `src_end`, resuming at `resume_object` when set. The resume point is
    /// persisted into dst's incomplete mirror snapshot as the copy advances,
    /// so a crashed sync restarts close to where it stopped.
    pub async fn copy_image(
        &self,
        src_snap_id_start: SnapId,
        src_snap_id_end: SnapId,
        _dst_snap_id_start: SnapId,
        resume_object: Option<u64>,
        _snap_seqs: &SnapSeqs,
        progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> ImageResult<()> {
        let end_objects = self.src.objects_at(src_snap_id_end)?;
        let base_objects: BTreeMap<u64, Bytes> = if src_snap_id_start > 0 {
            self.src.objects_at(src_snap_id_start)?
        } else {
            BTreeMap::new()
        };

        let dst_snap_id = self.dst.snap_infos().iter().rev().find_map(|(id, info)| {
            info.namespace
                .as_mirror()
                .filter(|ns| ns.is_non_primary() && !ns.complete)
                .map(|_| *id)
        });

        let total = end_objects.len() as u64;
        for (index, (object_number, data)) in end_objects.iter().enumerate() {
            let resumed_past = resume_object.is_some_and(|resume| *object_number < resume);
            let unchanged = base_objects.get(object_number) == Some(data);
            if !resumed_past && !unchanged {
                match dst_snap_id {
                    Some(dst_snap_id) => {
                        // the incomplete snapshot is the copy target; record
                        // the resume point as the copy advances
                        self.dst
                            .write_object_with_snap(dst_snap_id, *object_number, data.clone())?;
                        self.dst.set_mirror_snapshot_copy_progress(
                            dst_snap_id,
                            false,
                            *object_number,
                        )?;
                    }
                    None => self.dst.write_object(*object_number, data.clone()),
                }
                tokio::task::yield_now().await;
            }
            progress(index as u64 + 1, total);
        }
        Ok(())
    }

    /// Drop our peer uuid from a src primary mirror snapshot.
    pub async fn unlink_peer(&self, src_snap_id: SnapId, peer_uuid: &str) -> ImageResult<()> {
        self.src.unlink_peer(src_snap_id, peer_uuid)
    }
}
