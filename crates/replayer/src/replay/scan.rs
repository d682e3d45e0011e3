//! Snapshot scanner.
//!
//! Recomputes the sync window — `(local_snap_id_start, local_snap_id_end,
//! remote_snap_id_start, remote_snap_id_end)` — from both images' snapshot
//! listings on every cycle, so that the next sync step is unambiguous.

use tracing::{debug, error};

use mirror_core::{
    code, ImageState, MirrorSnapshotNamespace, MirrorSnapshotState, SnapId, NO_SNAP,
};

use crate::error::ReplayError;
use crate::replay::{ReplayerInner, State};

/// Per-cycle scan and sync bookkeeping, owned by the replay task.
pub(crate) struct CycleState {
    pub(crate) local_snap_id_start: SnapId,
    pub(crate) local_snap_id_end: SnapId,
    pub(crate) local_mirror_snap_ns: MirrorSnapshotNamespace,
    pub(crate) remote_snap_id_start: SnapId,
    pub(crate) remote_snap_id_end: SnapId,
    pub(crate) remote_mirror_snap_ns: MirrorSnapshotNamespace,
    pub(crate) remote_demoted: bool,
    pub(crate) image_state: ImageState,
}

impl CycleState {
    pub(crate) fn new() -> Self {
        Self {
            local_snap_id_start: 0,
            local_snap_id_end: NO_SNAP,
            local_mirror_snap_ns: MirrorSnapshotNamespace::default(),
            remote_snap_id_start: 0,
            remote_snap_id_end: NO_SNAP,
            remote_mirror_snap_ns: MirrorSnapshotNamespace::default(),
            remote_demoted: false,
            image_state: ImageState::default(),
        }
    }

    /// Whether the local image holds any mirror snapshot at all.
    pub(crate) fn has_local_mirror_snapshot(&self) -> bool {
        self.local_snap_id_start > 0 || self.local_snap_id_end != NO_SNAP
    }
}

/// What the remote scan decided the cycle should do next.
pub(crate) enum RemoteScanAction {
    /// Fresh sync: a new completed remote snapshot needs its metadata copied
    /// before objects move.
    SyncSnapshot,
    /// Resume the interrupted object copy of an incomplete local snapshot.
    ResumeSync,
    /// A notification raced in while scanning; restart from the local
    /// refresh.
    Rescan,
    /// Nothing to do; the replayer transitioned to idle.
    Idle,
    /// A pending shutdown was observed.
    Shutdown,
}

impl ReplayerInner {
    /// Walk the local snapshot listing and derive the local half of the sync
    /// window plus the starting point into the remote history.
    pub(crate) fn scan_local_mirror_snapshots(
        &self,
        cycle: &mut CycleState,
    ) -> Result<(), ReplayError> {
        debug!("scanning local mirror snapshots");

        for (local_snap_id, snap_info) in self.local_image.snap_infos() {
            let mirror_ns = match snap_info.namespace.as_mirror() {
                Some(ns) => ns,
                None => continue,
            };

            debug!(
                "local mirror snapshot: id={}, mirror_ns={}",
                local_snap_id, mirror_ns
            );
            cycle.local_mirror_snap_ns = mirror_ns.clone();

            match mirror_ns.state {
                MirrorSnapshotState::NonPrimary | MirrorSnapshotState::NonPrimaryDemoted => {
                    if mirror_ns.complete {
                        // if the remote has new snapshots, we sync from here
                        cycle.local_snap_id_start = local_snap_id;
                        cycle.local_snap_id_end = NO_SNAP;
                    } else {
                        // the start snap stays the last complete mirror
                        // snapshot or the initial image revision
                        cycle.local_snap_id_end = local_snap_id;
                    }
                }
                MirrorSnapshotState::Primary | MirrorSnapshotState::PrimaryDemoted => {
                    if mirror_ns.complete {
                        cycle.local_snap_id_start = local_snap_id;
                        cycle.local_snap_id_end = NO_SNAP;
                    } else {
                        error!("incomplete local primary snapshot");
                        return Err(ReplayError::new(
                            code::EINVAL,
                            "incomplete local primary snapshot",
                        ));
                    }
                }
            }
        }

        if cycle.has_local_mirror_snapshot() {
            let ns = &cycle.local_mirror_snap_ns;
            if ns.is_non_primary() && ns.primary_mirror_uuid != self.remote_mirror_uuid {
                // only a single remote peer is supported
                error!(
                    "local image linked to unknown peer: {}",
                    ns.primary_mirror_uuid
                );
                return Err(ReplayError::new(
                    code::EEXIST,
                    "local image linked to unknown peer",
                ));
            } else if ns.state == MirrorSnapshotState::Primary {
                debug!("local image promoted");
                return Err(ReplayError::new(0, "force promoted"));
            }

            debug!(
                "found local mirror snapshot: local_snap_id_start={}, \
                 local_snap_id_end={}, local_snap_ns={}",
                cycle.local_snap_id_start, cycle.local_snap_id_end, ns
            );
            if ns.complete {
                // the remote sync starts after this completed snapshot
                cycle.remote_snap_id_start = ns.primary_snap_id;
            }
        }

        Ok(())
    }

    /// Walk the remote snapshot listing, pick the next sync target and
    /// decide how the cycle continues.
    pub(crate) fn scan_remote_mirror_snapshots(
        &self,
        cycle: &mut CycleState,
    ) -> Result<RemoteScanAction, ReplayError> {
        debug!("scanning remote mirror snapshots");

        {
            // reset in case a new snapshot lands while we walk the listing
            let mut shared = self.shared.lock();
            shared.remote_image_updated = false;
        }

        let peer_uuid = self.remote_mirror_peer_uuid.lock().clone();
        let has_local = cycle.has_local_mirror_snapshot();

        for (remote_snap_id, snap_info) in self.remote_image.snap_infos() {
            let mirror_ns = match snap_info.namespace.as_mirror() {
                Some(ns) => ns,
                None => continue,
            };

            debug!(
                "remote mirror snapshot: id={}, mirror_ns={}",
                remote_snap_id, mirror_ns
            );
            cycle.remote_demoted = mirror_ns.is_primary() && mirror_ns.is_demoted();

            if has_local {
                let local_ns = &cycle.local_mirror_snap_ns;
                if local_ns.is_non_primary() {
                    // the local scan already validated the link to our remote
                    debug_assert_eq!(local_ns.primary_mirror_uuid, self.remote_mirror_uuid);

                    if local_ns.complete && local_ns.primary_snap_id >= remote_snap_id {
                        // skip past the already synced remote snapshot
                        cycle.remote_snap_id_start = remote_snap_id;
                        debug!("skipping synced remote snapshot {}", remote_snap_id);
                        continue;
                    } else if !local_ns.complete && local_ns.primary_snap_id > remote_snap_id {
                        // skip until we reach the in-progress remote snapshot
                        debug!(
                            "skipping synced remote snapshot {} while searching for \
                             in-progress sync",
                            remote_snap_id
                        );
                        cycle.remote_snap_id_start = remote_snap_id;
                        continue;
                    }
                } else if local_ns.state == MirrorSnapshotState::PrimaryDemoted {
                    // find the matching demotion snapshot in the remote image
                    debug_assert!(cycle.local_snap_id_start > 0);
                    if mirror_ns.state == MirrorSnapshotState::NonPrimaryDemoted
                        && mirror_ns.primary_mirror_uuid == self.local_mirror_uuid
                        && mirror_ns.primary_snap_id == cycle.local_snap_id_start
                    {
                        debug!(
                            "located matching demotion snapshot: remote_snap_id={}, \
                             local_snap_id={}",
                            remote_snap_id, cycle.local_snap_id_start
                        );
                        cycle.remote_snap_id_start = remote_snap_id;
                        continue;
                    } else if cycle.remote_snap_id_start == 0 {
                        // still looking for our matching demotion snapshot
                        debug!(
                            "skipping remote snapshot {} while searching for demotion",
                            remote_snap_id
                        );
                        continue;
                    }
                } else {
                    // reachable only when the local snapshot metadata is
                    // corrupt: a complete local primary would have ended the
                    // scan as "force promoted" already
                    error!("unknown local mirror snapshot state");
                    return Err(ReplayError::new(
                        code::EINVAL,
                        "invalid local mirror snapshot state",
                    ));
                }
            }

            // first snapshot where we are listed as a peer
            if !mirror_ns.is_primary() {
                debug!("skipping non-primary remote snapshot {}", remote_snap_id);
                continue;
            } else if !mirror_ns.mirror_peer_uuids.contains(&peer_uuid) {
                debug!(
                    "skipping remote snapshot {} due to missing mirror peer",
                    remote_snap_id
                );
                continue;
            }

            cycle.remote_snap_id_end = remote_snap_id;
            cycle.remote_mirror_snap_ns = mirror_ns.clone();
            break;
        }

        if cycle.remote_snap_id_end != NO_SNAP {
            debug!(
                "found remote mirror snapshot: remote_snap_id_start={}, \
                 remote_snap_id_end={}, remote_snap_ns={}",
                cycle.remote_snap_id_start,
                cycle.remote_snap_id_end,
                cycle.remote_mirror_snap_ns
            );
            if cycle.remote_mirror_snap_ns.complete {
                if cycle.local_snap_id_end != NO_SNAP && !cycle.local_mirror_snap_ns.complete {
                    // attempt to resume the interrupted image sync
                    debug!("local image contains in-progress mirror snapshot");
                    return Ok(RemoteScanAction::ResumeSync);
                }
                return Ok(RemoteScanAction::SyncSnapshot);
            }
            // raced with the creation of a remote mirror snapshot; refresh
            // and rescan once it completes
            debug!("remote mirror snapshot not complete");
        }

        let mut shared = self.shared.lock();
        if shared.remote_image_updated {
            // a notification arrived while scanning; restart the scan
            shared.remote_image_updated = false;
            drop(shared);

            debug!("restarting snapshot scan due to remote update notification");
            return Ok(RemoteScanAction::Rescan);
        }

        if shared.state == State::Complete {
            return Ok(RemoteScanAction::Shutdown);
        } else if cycle.remote_demoted {
            drop(shared);

            debug!("remote image demoted");
            return Err(ReplayError::new(0, "remote image demoted"));
        }

        debug!("all remote snapshots synced: idling waiting for new snapshot");
        assert_eq!(shared.state, State::Replaying);
        shared.state = State::Idle;
        self.notify_status_updated(&mut shared);

        Ok(RemoteScanAction::Idle)
    }
}
