//! Replayer state machine.
//!
//! Lifecycle:
//!
//! ```text
//! <init>
//!    |
//!    v
//! REGISTER_UPDATE_WATCHER
//!    |
//!    v
//! REFRESH_LOCAL_IMAGE <------------------------------\
//!    |                                               |
//!    v                                               |
//! REFRESH_REMOTE_IMAGE                               |
//!    |                                               |
//!    | (interrupted sync)                            |
//!    |\--------------------------------------------\ |
//!    |                                             | |
//!    | (new snapshot)                              | |
//!    |\--------------> COPY_SNAPSHOTS              | |
//!    |                     |                       | |
//!    |                     v                       | |
//!    |                 GET_IMAGE_STATE             | |
//!    |                     |                       | |
//!    |                     v                       | |
//!    |                 CREATE_NON_PRIMARY_SNAPSHOT | |
//!    |                     |                       | |
//!    |                     |/----------------------/ |
//!    |                     v                         |
//!    |                 COPY_IMAGE                    |
//!    |                     |                         |
//!    |                     v                         |
//!    |                 UPDATE_NON_PRIMARY_SNAPSHOT   |
//!    |                     |                         |
//!    |                     v                         |
//!    |                 NOTIFY_IMAGE_UPDATE           |
//!    |                     |                         |
//!    |                     v                         |
//!    |                 UNLINK_PEER                   |
//!    |                     |                         |
//!    |                     \------------------------/|
//!    |                                               |
//!    |   (update notification)                       |
//! <idle> --------------------------------------------/
//!    |
//!    v
//! <shut down>
//!    |
//!    v
//! UNREGISTER_UPDATE_WATCHER
//!    |
//!    v
//! WAIT_FOR_IN_FLIGHT_OPS
//!    |
//!    v
//! <finish>
//! ```
//!
//! The cycle runs as a single cooperative task that awaits each external
//! call, preserving the single-in-flight-step invariant. The task exits when
//! the scan finds no pending work (`IDLE`); the update-watcher bridge
//! respawns it on the next notification. `COMPLETE` is sticky: once entered
//! (error, terminal success, or shutdown) every continuation backs out
//! through the teardown path instead of advancing.

mod scan;
mod sync;
mod watch;

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error};

use mirror_core::code;

use crate::error::ReplayError;
use crate::tracker::AsyncOpTracker;
use crate::traits::{
    DeepCopyEngine, MirrorImage, PoolMetaCache, ReplayerListener, WatchHandle,
};

/// Replayer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Replaying,
    Idle,
    Complete,
}

/// State shared with the notifier task and the shutdown caller. Everything
/// else (the sync window, cached namespaces, progress context) is owned by
/// the replay task and needs no lock.
pub(crate) struct SharedState {
    pub(crate) state: State,
    pub(crate) remote_image_updated: bool,
    pub(crate) error_code: i32,
    pub(crate) error_description: String,
    pub(crate) on_init_shutdown: Option<oneshot::Sender<i32>>,
    pub(crate) copy_progress: Option<(u64, u64)>,
}

/// Construction parameters for a [`Replayer`].
pub struct ReplayerOptions {
    /// Mirror uuid of the local cluster.
    pub local_mirror_uuid: String,
    /// Mirror uuid of the remote cluster the local image is linked to.
    pub remote_mirror_uuid: String,
    pub local_image: Arc<dyn MirrorImage>,
    pub remote_image: Arc<dyn MirrorImage>,
    pub deep_copy: Arc<dyn DeepCopyEngine>,
    pub pool_meta_cache: Arc<dyn PoolMetaCache>,
    pub listener: Arc<dyn ReplayerListener>,
}

pub(crate) struct ReplayerInner {
    /// Back-reference handed to the watcher bridge and progress context so
    /// they can reach the state machine without keeping it alive.
    pub(crate) self_ref: Weak<ReplayerInner>,

    pub(crate) local_mirror_uuid: String,
    pub(crate) remote_mirror_uuid: String,
    pub(crate) local_image: Arc<dyn MirrorImage>,
    pub(crate) remote_image: Arc<dyn MirrorImage>,
    pub(crate) deep_copy: Arc<dyn DeepCopyEngine>,
    pub(crate) pool_meta_cache: Arc<dyn PoolMetaCache>,
    pub(crate) listener: Arc<dyn ReplayerListener>,

    pub(crate) shared: Mutex<SharedState>,
    pub(crate) remote_mirror_peer_uuid: Mutex<String>,
    pub(crate) watch_handle: Mutex<Option<WatchHandle>>,
    pub(crate) in_flight_ops: AsyncOpTracker,
}

/// Snapshot-based image replayer for one (local, remote) image pair.
///
/// Cheap to clone; all clones drive the same state machine.
#[derive(Clone)]
pub struct Replayer {
    inner: Arc<ReplayerInner>,
}

impl Replayer {
    pub fn new(options: ReplayerOptions) -> Self {
        Self {
            inner: Arc::new_cyclic(|self_ref| ReplayerInner {
                self_ref: self_ref.clone(),
                local_mirror_uuid: options.local_mirror_uuid,
                remote_mirror_uuid: options.remote_mirror_uuid,
                local_image: options.local_image,
                remote_image: options.remote_image,
                deep_copy: options.deep_copy,
                pool_meta_cache: options.pool_meta_cache,
                listener: options.listener,
                shared: Mutex::new(SharedState {
                    state: State::Init,
                    remote_image_updated: false,
                    error_code: 0,
                    error_description: String::new(),
                    on_init_shutdown: None,
                    copy_progress: None,
                }),
                remote_mirror_peer_uuid: Mutex::new(String::new()),
                watch_handle: Mutex::new(None),
                in_flight_ops: AsyncOpTracker::new(),
            }),
        }
    }

    /// One-shot initialization: resolve the remote mirror-peer uuid,
    /// register the remote update watcher and kick the first scan cycle.
    pub async fn init(&self) -> Result<(), ReplayError> {
        let inner = &self.inner;
        debug!("initializing replayer");

        {
            let shared = inner.shared.lock();
            assert_eq!(shared.state, State::Init, "init may only be called once");
        }

        let pool_id = inner.remote_image.spec().pool_id;
        let peer_uuid = match inner.pool_meta_cache.remote_pool_meta(pool_id) {
            Some(meta) if !meta.mirror_peer_uuid.is_empty() => meta.mirror_peer_uuid,
            _ => {
                error!(
                    "failed to retrieve mirror peer uuid from remote pool {}",
                    pool_id
                );
                inner.shared.lock().state = State::Complete;
                return Err(ReplayError::new(
                    code::ENOENT,
                    "failed to retrieve mirror peer uuid from remote pool",
                ));
            }
        };
        debug!("remote_mirror_peer_uuid={}", peer_uuid);
        *inner.remote_mirror_peer_uuid.lock() = peer_uuid;

        inner.register_update_watcher().await
    }

    /// One-shot teardown.
    ///
    /// If a sync is in flight the actual teardown is deferred until the
    /// replay task observes `COMPLETE` at its next continuation; otherwise
    /// the watcher is unregistered and in-flight listener callbacks are
    /// drained inline. Completes once no further listener callbacks can be
    /// issued.
    pub async fn shut_down(&self) -> Result<(), ReplayError> {
        let inner = &self.inner;
        debug!("shutting down replayer");

        let (tx, rx) = oneshot::channel();
        let deferred = {
            let mut shared = inner.shared.lock();
            assert!(
                shared.on_init_shutdown.is_none(),
                "init/shut_down already outstanding"
            );
            assert_ne!(shared.state, State::Init, "shut_down before init");
            shared.on_init_shutdown = Some(tx);
            shared.error_code = 0;
            shared.error_description.clear();
            let prev = std::mem::replace(&mut shared.state, State::Complete);
            prev == State::Replaying
        };

        if deferred {
            debug!("shut down pending on completion of snapshot replay");
        } else {
            inner.tear_down().await;
        }

        let code = rx.await.map_err(|_| {
            ReplayError::new(code::EIO, "replay task dropped shutdown completion")
        })?;
        if code < 0 {
            let description = inner.shared.lock().error_description.clone();
            return Err(ReplayError::new(code, description));
        }
        Ok(())
    }

    /// Completes immediately: object-level flush is guaranteed by the
    /// deep-copy primitives.
    pub async fn flush(&self) -> Result<(), ReplayError> {
        debug!("flush");
        Ok(())
    }

    /// Placeholder status query. Always fills in `description` and reports
    /// the `EEXIST` sentinel to signal that per-sync progress reporting is
    /// not implemented.
    pub fn get_replay_status(&self, description: &mut String) -> Result<(), ReplayError> {
        debug!("get replay status");
        *description = "NOT IMPLEMENTED".to_string();
        Err(ReplayError::new(
            code::EEXIST,
            "replay status not implemented",
        ))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.inner.shared.lock().state
    }

    /// Whether the replayer is still making (or waiting to make) progress.
    pub fn is_replaying(&self) -> bool {
        let shared = self.inner.shared.lock();
        shared.state == State::Replaying || shared.state == State::Idle
    }

    /// First recorded error code; 0 when none (including terminal-success
    /// reasons such as "remote image demoted").
    pub fn error_code(&self) -> i32 {
        self.inner.shared.lock().error_code
    }

    /// Description recorded with the first error or terminal reason.
    pub fn error_description(&self) -> String {
        self.inner.shared.lock().error_description.clone()
    }

    /// Last observed `(offset, total)` of an in-flight object copy.
    pub fn copy_progress(&self) -> Option<(u64, u64)> {
        self.inner.shared.lock().copy_progress
    }
}

impl ReplayerInner {
    /// Record a terminal status and transition to `COMPLETE`.
    ///
    /// The first writer wins: later errors do not overwrite an already
    /// recorded status. Notifies the listener only when this call performs
    /// the transition (a pending shutdown has already done so).
    pub(crate) fn handle_replay_complete(&self, r: i32, description: &str) {
        let mut shared = self.shared.lock();
        if shared.error_code == 0 {
            shared.error_code = r;
            shared.error_description = description.to_string();
        }

        if shared.state != State::Replaying && shared.state != State::Idle {
            return;
        }
        shared.state = State::Complete;
        self.notify_status_updated(&mut shared);
    }

    /// Queue one tracked listener notification. Callers hold the shared
    /// lock, which serializes submissions with state transitions.
    pub(crate) fn notify_status_updated(&self, _shared: &mut SharedState) {
        debug!("queueing status notification");
        self.in_flight_ops.start_op();
        let tracker = self.in_flight_ops.clone();
        let listener = self.listener.clone();
        tokio::spawn(async move {
            listener.handle_notification().await;
            tracker.finish_op();
        });
    }

    /// Sticky-`COMPLETE` check performed before every continuation.
    pub(crate) fn is_replay_interrupted(&self) -> bool {
        self.shared.lock().state == State::Complete
    }

    /// Deferred shutdown path: unregister the watcher, drain tracked
    /// listener callbacks, then complete the pending shutdown with the
    /// recorded status. Safe to run concurrently with a racing direct
    /// shutdown; both the handle and the completion sender are taken
    /// exactly once.
    pub(crate) async fn tear_down(&self) {
        debug!("unregistering update watcher");
        let handle = self.watch_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = self.remote_image.unregister_update_watcher(handle).await {
                error!("failed to unregister update watcher: {}", err);
                let mut shared = self.shared.lock();
                if shared.error_code == 0 {
                    shared.error_code = err.code();
                    shared.error_description =
                        "failed to unregister remote image update watcher".to_string();
                }
            }
        }

        debug!("waiting for in-flight operations");
        self.in_flight_ops.wait_for_ops().await;

        let (sender, code) = {
            let mut shared = self.shared.lock();
            (shared.on_init_shutdown.take(), shared.error_code)
        };
        if let Some(sender) = sender {
            let _ = sender.send(code);
        }
    }
}
