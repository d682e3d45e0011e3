//! Per-image supervisor.
//!
//! One [`ImageMirror`] owns the replayer lifecycle for a (local, remote)
//! image pair: it builds the replayer with fresh adapters, waits on status
//! notifications, and on completion decides between stopping (terminal
//! success), restarting (transient error, bounded by the restart budget) and
//! giving up.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use imagestore::{DeepCopier, MemoryImage};
use replayer::{Replayer, ReplayerListener, ReplayerOptions};

use crate::adapter::{StaticPoolMetaCache, StoreDeepCopy, StoreImage};
use crate::config::SupervisorConfig;

/// Why the mirror stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOutcome {
    /// Stop was requested from the outside.
    Stopped,
    /// The replayer reached a terminal-success state ("remote image
    /// demoted", "force promoted").
    Finished { description: String },
}

/// Forwards replayer status notifications into the supervisor loop.
struct ChannelListener {
    tx: mpsc::UnboundedSender<()>,
}

#[async_trait]
impl ReplayerListener for ChannelListener {
    async fn handle_notification(&self) {
        let _ = self.tx.send(());
    }
}

/// Supervises mirroring of one image pair.
pub struct ImageMirror {
    local_mirror_uuid: String,
    remote_mirror_uuid: String,
    local_image: Arc<MemoryImage>,
    remote_image: Arc<MemoryImage>,
    pool_meta: Arc<StaticPoolMetaCache>,
    config: SupervisorConfig,
}

impl ImageMirror {
    pub fn new(
        local_mirror_uuid: impl Into<String>,
        remote_mirror_uuid: impl Into<String>,
        local_image: Arc<MemoryImage>,
        remote_image: Arc<MemoryImage>,
        pool_meta: Arc<StaticPoolMetaCache>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            local_mirror_uuid: local_mirror_uuid.into(),
            remote_mirror_uuid: remote_mirror_uuid.into(),
            local_image,
            remote_image,
            pool_meta,
            config,
        }
    }

    fn build_replayer(&self, listener: Arc<dyn ReplayerListener>) -> Replayer {
        Replayer::new(ReplayerOptions {
            local_mirror_uuid: self.local_mirror_uuid.clone(),
            remote_mirror_uuid: self.remote_mirror_uuid.clone(),
            local_image: Arc::new(StoreImage::new(self.local_image.clone())),
            remote_image: Arc::new(StoreImage::new(self.remote_image.clone())),
            deep_copy: Arc::new(StoreDeepCopy::new(DeepCopier::new(
                self.remote_image.clone(),
                self.local_image.clone(),
            ))),
            pool_meta_cache: self.pool_meta.clone(),
            listener,
        })
    }

    /// Run until terminal success, an external stop, or the restart budget
    /// is exhausted.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<MirrorOutcome> {
        let image = self.local_image.spec().clone();
        let mut attempts = 0u32;

        loop {
            let (tx, mut notifications) = mpsc::unbounded_channel();
            let replayer = self.build_replayer(Arc::new(ChannelListener { tx }));

            replayer
                .init()
                .await
                .with_context(|| format!("failed to initialize replayer for image {}", image))?;
            info!("replayer initialized for image {}", image);

            // wait until the replayer completes or a stop is requested
            let stopped = loop {
                if !replayer.is_replaying() {
                    break false;
                }
                tokio::select! {
                    _ = notifications.recv() => {}
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break true;
                        }
                    }
                }
            };

            // the recorded status is reset by shut_down; read it first
            let code = replayer.error_code();
            let description = replayer.error_description();

            if let Err(err) = replayer.shut_down().await {
                warn!("replayer shut down with error for image {}: {}", image, err);
            }

            if stopped {
                info!("mirror stopped for image {}", image);
                return Ok(MirrorOutcome::Stopped);
            }

            if code == 0 {
                info!("mirror finished for image {}: {}", image, description);
                return Ok(MirrorOutcome::Finished { description });
            }

            attempts += 1;
            if attempts > self.config.restart_limit {
                return Err(anyhow!(
                    "mirror for image {} failed after {} attempts: {} (code {})",
                    image,
                    attempts,
                    description,
                    code
                ));
            }
            warn!(
                "replayer failed for image {}: {} (code {}); restarting ({}/{})",
                image, description, code, attempts, self.config.restart_limit
            );
            tokio::time::sleep(self.config.restart_backoff()).await;
        }
    }
}
