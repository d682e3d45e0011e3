//! Sync orchestration: the replay cycle and its copy steps.
//!
//! Each step is one awaited call into the backend. A step failure records
//! the `(error_code, description)` pair through `handle_replay_complete`
//! and ends the replay task; a pending shutdown is resumed before exiting.

use std::sync::{Arc, Weak};

use tracing::{debug, error};

use mirror_core::{ImageError, MirrorSnapshotNamespace, NO_SNAP};

use crate::error::ReplayError;
use crate::replay::scan::{CycleState, RemoteScanAction};
use crate::replay::ReplayerInner;
use crate::traits::SyncProgressHandler;

/// How one pass through the cycle ended.
enum CycleOutcome {
    /// Loop back to the local refresh.
    Loop,
    /// No pending work; the replayer idled.
    Idle,
    /// A pending shutdown was observed at a continuation.
    Shutdown,
    /// Terminal status recorded (error or terminal success).
    Complete,
}

/// Forwards object-copy progress into the replayer.
///
/// Exactly one progress handler exists per copy; it is created right before
/// the copy request and dropped with it.
struct CopyProgress {
    replayer: Weak<ReplayerInner>,
}

impl SyncProgressHandler for CopyProgress {
    fn update_progress(&self, offset: u64, total: u64) {
        if let Some(replayer) = self.replayer.upgrade() {
            replayer.handle_copy_image_progress(offset, total);
        }
    }
}

impl ReplayerInner {
    /// Replay task entry point: run cycles until idle, completion or
    /// shutdown.
    pub(crate) async fn run_replay(self: Arc<Self>) {
        loop {
            match self.run_cycle().await {
                CycleOutcome::Loop => continue,
                CycleOutcome::Idle => return,
                CycleOutcome::Shutdown => {
                    debug!("resuming pending shut down");
                    self.tear_down().await;
                    return;
                }
                CycleOutcome::Complete => {
                    // a shutdown may have been deferred while the failing
                    // step was in flight
                    let pending = self.shared.lock().on_init_shutdown.is_some();
                    if pending {
                        debug!("resuming pending shut down");
                        self.tear_down().await;
                    }
                    return;
                }
            }
        }
    }

    async fn run_cycle(&self) -> CycleOutcome {
        if let Err(err) = self.refresh_local_image().await {
            self.handle_replay_complete(err.code, &err.description);
            return CycleOutcome::Complete;
        }
        if let Err(err) = self.refresh_remote_image().await {
            self.handle_replay_complete(err.code, &err.description);
            return CycleOutcome::Complete;
        }

        if self.is_replay_interrupted() {
            return CycleOutcome::Shutdown;
        }

        let mut cycle = CycleState::new();
        if let Err(err) = self.scan_local_mirror_snapshots(&mut cycle) {
            self.handle_replay_complete(err.code, &err.description);
            return CycleOutcome::Complete;
        }

        let action = match self.scan_remote_mirror_snapshots(&mut cycle) {
            Ok(action) => action,
            Err(err) => {
                self.handle_replay_complete(err.code, &err.description);
                return CycleOutcome::Complete;
            }
        };

        match action {
            RemoteScanAction::Rescan => return CycleOutcome::Loop,
            RemoteScanAction::Idle => return CycleOutcome::Idle,
            RemoteScanAction::Shutdown => return CycleOutcome::Shutdown,
            RemoteScanAction::SyncSnapshot => {
                let steps = async {
                    self.copy_snapshots(&mut cycle).await?;
                    self.get_image_state(&mut cycle).await?;
                    self.create_non_primary_snapshot(&mut cycle).await
                };
                if let Err(err) = steps.await {
                    self.handle_replay_complete(err.code, &err.description);
                    return CycleOutcome::Complete;
                }
            }
            RemoteScanAction::ResumeSync => {}
        }

        if let Err(err) = self.copy_image(&mut cycle).await {
            self.handle_replay_complete(err.code, &err.description);
            return CycleOutcome::Complete;
        }
        if let Err(err) = self.update_non_primary_snapshot(&mut cycle, true).await {
            self.handle_replay_complete(err.code, &err.description);
            return CycleOutcome::Complete;
        }

        self.notify_image_update().await;

        if self.is_replay_interrupted() {
            return CycleOutcome::Shutdown;
        }

        if let Err(err) = self.unlink_peer(&cycle).await {
            self.handle_replay_complete(err.code, &err.description);
            return CycleOutcome::Complete;
        }

        {
            let mut shared = self.shared.lock();
            self.notify_status_updated(&mut shared);
        }

        CycleOutcome::Loop
    }

    async fn refresh_local_image(&self) -> Result<(), ReplayError> {
        if !self.local_image.is_refresh_required() {
            return Ok(());
        }

        debug!("refreshing local image");
        self.local_image.refresh().await.map_err(|err| {
            error!("failed to refresh local image: {}", err);
            ReplayError::from_image_error(&err, "failed to refresh local image")
        })
    }

    async fn refresh_remote_image(&self) -> Result<(), ReplayError> {
        if !self.remote_image.is_refresh_required() {
            return Ok(());
        }

        debug!("refreshing remote image");
        self.remote_image.refresh().await.map_err(|err| {
            error!("failed to refresh remote image: {}", err);
            ReplayError::from_image_error(&err, "failed to refresh remote image")
        })
    }

    async fn copy_snapshots(&self, cycle: &mut CycleState) -> Result<(), ReplayError> {
        debug!("copying snapshots");

        debug_assert_ne!(cycle.remote_snap_id_start, NO_SNAP);
        debug_assert!(cycle.remote_snap_id_end > 0 && cycle.remote_snap_id_end != NO_SNAP);
        debug_assert_ne!(cycle.local_snap_id_start, NO_SNAP);

        cycle.local_mirror_snap_ns = MirrorSnapshotNamespace::default();
        let snap_seqs = self
            .deep_copy
            .copy_snapshots(
                cycle.remote_snap_id_start,
                cycle.remote_snap_id_end,
                cycle.local_snap_id_start,
            )
            .await
            .map_err(|err| {
                error!("failed to copy snapshots from remote to local image: {}", err);
                ReplayError::from_image_error(
                    &err,
                    "failed to copy snapshots from remote to local image",
                )
            })?;

        debug!(
            "remote_snap_id_start={}, remote_snap_id_end={}, local_snap_id_start={}, \
             snap_seqs={:?}",
            cycle.remote_snap_id_start,
            cycle.remote_snap_id_end,
            cycle.local_snap_id_start,
            snap_seqs
        );
        cycle.local_mirror_snap_ns.snap_seqs = snap_seqs;
        Ok(())
    }

    async fn get_image_state(&self, cycle: &mut CycleState) -> Result<(), ReplayError> {
        debug!(
            "retrieving image state for remote snapshot {}",
            cycle.remote_snap_id_end
        );

        cycle.image_state = self
            .deep_copy
            .get_image_state(cycle.remote_snap_id_end)
            .await
            .map_err(|err| {
                error!("failed to retrieve remote snapshot image state: {}", err);
                ReplayError::from_image_error(
                    &err,
                    "failed to retrieve remote snapshot image state",
                )
            })?;
        Ok(())
    }

    async fn create_non_primary_snapshot(&self, cycle: &mut CycleState) -> Result<(), ReplayError> {
        debug!("creating local non-primary snapshot");

        let snap_id = self
            .deep_copy
            .create_non_primary_snapshot(
                cycle.remote_mirror_snap_ns.is_demoted(),
                &self.remote_mirror_uuid,
                cycle.remote_snap_id_end,
                &cycle.local_mirror_snap_ns.snap_seqs,
                &cycle.image_state,
            )
            .await
            .map_err(|err| {
                error!("failed to create local mirror snapshot: {}", err);
                ReplayError::from_image_error(&err, "failed to create local mirror snapshot")
            })?;

        debug!("local_snap_id_end={}", snap_id);
        cycle.local_snap_id_end = snap_id;
        Ok(())
    }

    async fn copy_image(&self, cycle: &mut CycleState) -> Result<(), ReplayError> {
        debug!("copying image");

        let resume_object = if cycle.local_mirror_snap_ns.last_copied_object_number > 0 {
            Some(cycle.local_mirror_snap_ns.last_copied_object_number)
        } else {
            None
        };

        let progress: Arc<dyn SyncProgressHandler> = Arc::new(CopyProgress {
            replayer: self.self_ref.clone(),
        });
        let result = self
            .deep_copy
            .copy_image(
                cycle.remote_snap_id_start,
                cycle.remote_snap_id_end,
                cycle.local_snap_id_start,
                resume_object,
                &cycle.local_mirror_snap_ns.snap_seqs,
                progress,
            )
            .await;
        self.shared.lock().copy_progress = None;

        result.map_err(|err| {
            error!("failed to copy remote image to local image: {}", err);
            ReplayError::from_image_error(&err, "failed to copy remote image")
        })
    }

    pub(crate) fn handle_copy_image_progress(&self, offset: u64, total: u64) {
        debug!("copy image progress: offset={}, total={}", offset, total);
        self.shared.lock().copy_progress = Some((offset, total));
    }

    async fn update_non_primary_snapshot(
        &self,
        cycle: &mut CycleState,
        complete: bool,
    ) -> Result<(), ReplayError> {
        debug!("updating local non-primary snapshot");

        if complete {
            cycle.local_mirror_snap_ns.complete = true;
        }

        self.local_image
            .set_mirror_snapshot_copy_progress(
                cycle.local_snap_id_end,
                cycle.local_mirror_snap_ns.complete,
                cycle.local_mirror_snap_ns.last_copied_object_number,
            )
            .await
            .map_err(|err| {
                error!("failed to update local snapshot progress: {}", err);
                ReplayError::from_image_error(&err, "failed to update local snapshot progress")
            })
    }

    async fn notify_image_update(&self) {
        debug!("notifying local image update");

        if let Err(err) = self.local_image.notify_update().await {
            // best effort: other watchers fall back to their own refresh
            error!("failed to notify local image update: {}", err);
        }
    }

    async fn unlink_peer(&self, cycle: &CycleState) -> Result<(), ReplayError> {
        if cycle.remote_snap_id_start == 0 {
            return Ok(());
        }

        // the local snapshot is fully synced; we no longer depend on the
        // sync start snapshot in the remote image
        debug!("unlinking peer from remote snapshot {}", cycle.remote_snap_id_start);

        let peer_uuid = self.remote_mirror_peer_uuid.lock().clone();
        match self
            .deep_copy
            .unlink_peer(cycle.remote_snap_id_start, &peer_uuid)
            .await
        {
            Ok(()) | Err(ImageError::NotFound) => Ok(()),
            Err(err) => {
                error!("failed to unlink local peer from remote image: {}", err);
                Err(ReplayError::from_image_error(
                    &err,
                    "failed to unlink local peer from remote image",
                ))
            }
        }
    }
}
