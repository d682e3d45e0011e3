//! Update-watcher bridge.
//!
//! Registered on the remote image at init; the backend invokes
//! [`UpdateWatcher::handle_notify`] whenever remote image metadata changes.
//! Notifications are debounced into a single "rescan pending" flag while a
//! scan cycle is running and respawn the replay task when idle.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, error};

use crate::error::ReplayError;
use crate::replay::{ReplayerInner, State};
use crate::traits::UpdateWatcher;

pub(crate) struct UpdateWatchBridge {
    pub(crate) replayer: Weak<ReplayerInner>,
}

#[async_trait]
impl UpdateWatcher for UpdateWatchBridge {
    async fn handle_notify(&self) {
        if let Some(replayer) = self.replayer.upgrade() {
            replayer.handle_remote_image_update_notify();
        }
    }
}

impl ReplayerInner {
    pub(crate) async fn register_update_watcher(&self) -> Result<(), ReplayError> {
        debug!("registering update watcher on remote image");

        let bridge = Arc::new(UpdateWatchBridge {
            replayer: self.self_ref.clone(),
        });
        match self.remote_image.register_update_watcher(bridge).await {
            Ok(handle) => {
                *self.watch_handle.lock() = Some(handle);
                {
                    let mut shared = self.shared.lock();
                    shared.state = State::Replaying;
                    self.notify_status_updated(&mut shared);
                }
                self.spawn_replay();
                Ok(())
            }
            Err(err) => {
                error!("failed to register update watcher: {}", err);
                let description = "failed to register remote image update watcher";
                let mut shared = self.shared.lock();
                if shared.error_code == 0 {
                    shared.error_code = err.code();
                    shared.error_description = description.to_string();
                }
                shared.state = State::Complete;
                Err(ReplayError::new(err.code(), description))
            }
        }
    }

    pub(crate) fn handle_remote_image_update_notify(&self) {
        debug!("remote image update notification");

        let mut shared = self.shared.lock();
        match shared.state {
            State::Replaying => {
                debug!("flagging snapshot rescan required");
                shared.remote_image_updated = true;
            }
            State::Idle => {
                shared.state = State::Replaying;
                drop(shared);

                debug!("restarting idle replayer");
                self.spawn_replay();
            }
            State::Init | State::Complete => {}
        }
    }

    /// Spawn the replay task. The task holds a strong reference for its
    /// lifetime; a failed upgrade means the replayer is already dropped.
    pub(crate) fn spawn_replay(&self) {
        if let Some(replayer) = self.self_ref.upgrade() {
            tokio::spawn(async move {
                replayer.run_replay().await;
            });
        }
    }
}
