//! Mirroring daemon binary.
//!
//! Runs a complete mirroring session over the in-memory store: a simulated
//! primary workload produces mirror snapshots on the remote image while the
//! supervisor replays them onto the local image, ending with a demotion and
//! an object-level consistency check.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use bytes::Bytes;
use clap::Parser;
use rand::RngCore;
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

use imagestore::{MemoryCluster, MemoryImage};
use mirror_core::{ImageSpec, MirrorSnapshotNamespace};
use replayer::RemotePoolMeta;
use snapmirror::config::{Config, WorkloadConfig};
use snapmirror::{ImageMirror, MirrorOutcome, StaticPoolMetaCache};

/// Daemon command line
#[derive(Parser, Debug)]
#[command(name = "snapmirrord")]
#[command(about = "Block image mirroring daemon (in-memory simulation)")]
struct Args {
    /// Configuration file path (YAML format)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "")]
    log_level: String,

    /// Number of mirror snapshots to produce before demoting
    #[arg(long)]
    snapshot_count: Option<u32>,

    /// Number of objects in the simulated image
    #[arg(long)]
    object_count: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };

    // Override config with command line arguments
    if !args.log_level.is_empty() {
        config.log.level = args.log_level.clone();
    }
    if let Some(snapshot_count) = args.snapshot_count {
        config.workload.snapshot_count = snapshot_count;
    }
    if let Some(object_count) = args.object_count {
        config.workload.object_count = object_count;
    }

    // Initialize logging
    let level = match config.log.level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("starting snapmirrord");

    // two stand-in clusters holding one mirrored image pair
    let remote_cluster = MemoryCluster::new();
    let local_cluster = MemoryCluster::new();
    let spec = ImageSpec::new(1, "image-1");
    let remote_image = remote_cluster.create_image(spec.clone())?;
    let local_image = local_cluster.create_image(spec.clone())?;

    // register the local cluster as a mirror peer of the remote pool
    let peer_uuid = Uuid::new_v4().to_string();
    let pool_meta = Arc::new(StaticPoolMetaCache::new());
    pool_meta.insert(
        spec.pool_id,
        RemotePoolMeta {
            mirror_peer_uuid: peer_uuid.clone(),
        },
    );

    // primary-side workload
    let workload = tokio::spawn(run_workload(
        remote_image.clone(),
        config.workload.clone(),
        peer_uuid,
    ));

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            let _ = stop_tx.send(true);
        }
    });

    let mirror = ImageMirror::new(
        local_cluster.mirror_uuid(),
        remote_cluster.mirror_uuid(),
        local_image.clone(),
        remote_image.clone(),
        pool_meta,
        config.supervisor.clone(),
    );
    let outcome = mirror.run(stop_rx).await?;

    workload.abort();
    let _ = workload.await;

    match outcome {
        MirrorOutcome::Stopped => {
            info!("stopped before mirroring completed");
            return Ok(());
        }
        MirrorOutcome::Finished { description } => {
            info!("mirroring finished: {}", description);
        }
    }

    verify_mirrored(&remote_image, &local_image)
}

/// Simulated primary workload: rewrite objects, take periodic mirror
/// snapshots, then demote the image.
async fn run_workload(image: Arc<MemoryImage>, config: WorkloadConfig, peer_uuid: String) {
    for round in 1..=config.snapshot_count {
        for object_number in 0..config.object_count {
            let data = {
                let mut buf = vec![0u8; config.object_size];
                rand::thread_rng().fill_bytes(&mut buf);
                Bytes::from(buf)
            };
            image.write_object(object_number, data);
            tokio::time::sleep(config.write_interval()).await;
        }

        let snap_id = image.create_mirror_snapshot(
            format!("mirror.{}", round),
            MirrorSnapshotNamespace::primary([peer_uuid.clone()]).completed(),
            None,
        );
        image.notify_update();
        info!("produced primary mirror snapshot {} (round {})", snap_id, round);
        tokio::time::sleep(config.snapshot_interval()).await;
    }

    // hand the primary role over; the replayer observes the demotion,
    // mirrors it and completes
    image.demote([peer_uuid]);
    image.notify_update();
    info!("remote image demoted");
}

/// Object-level comparison of the newest mirrored snapshot against its
/// remote counterpart.
fn verify_mirrored(remote: &MemoryImage, local: &MemoryImage) -> Result<()> {
    let local_snaps = local.snap_infos();
    let newest = local_snaps.iter().rev().find_map(|(snap_id, info)| {
        info.namespace
            .as_mirror()
            .filter(|ns| ns.is_non_primary() && ns.complete)
            .map(|ns| (*snap_id, ns.primary_snap_id))
    });
    let Some((local_snap_id, primary_snap_id)) = newest else {
        bail!("local image holds no completed mirror snapshot");
    };

    let local_objects = local.objects_at(local_snap_id)?;
    let remote_objects = remote.objects_at(primary_snap_id)?;
    if local_objects != remote_objects {
        bail!(
            "mirrored snapshot {} does not match remote snapshot {}",
            local_snap_id,
            primary_snap_id
        );
    }

    info!(
        "verified {} objects of local snapshot {} against remote snapshot {}",
        local_objects.len(),
        local_snap_id,
        primary_snap_id
    );
    Ok(())
}
