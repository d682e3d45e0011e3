//! Shared test fixtures: scriptable image and deep-copy mocks.
//!
//! The mocks mirror the service surface the replayer drives. `TestImage`
//! holds a snapshot map the tests edit directly; `TestDeepCopyEngine`
//! materializes created snapshots back into the local `TestImage` so that
//! multi-cycle scenarios observe their own effects. Every externally visible
//! action is appended to a shared op log for ordering assertions.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use mirror_core::{
    ImageError, ImageResult, ImageSpec, ImageState, MirrorSnapshotNamespace, SnapId, SnapInfo,
    SnapSeqs, SnapshotNamespace,
};
use replayer::{
    DeepCopyEngine, MirrorImage, PoolMetaCache, RemotePoolMeta, Replayer, ReplayerListener,
    ReplayerOptions, SyncProgressHandler, UpdateWatcher, WatchHandle,
};

pub const LOCAL_MIRROR_UUID: &str = "local-mirror-uuid";
pub const REMOTE_MIRROR_UUID: &str = "remote-mirror-uuid";
pub const PEER_UUID: &str = "p1";

pub type OpLog = Arc<Mutex<Vec<String>>>;

/// Poll until `cond` holds, panicking after five seconds.
pub async fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

// ========== TestImage ==========

struct TestImageState {
    snaps: BTreeMap<SnapId, SnapInfo>,
    refresh_required: bool,
    refresh_error: Option<ImageError>,
    refresh_count: u64,
    register_error: Option<ImageError>,
    unregister_error: Option<ImageError>,
    watchers: HashMap<WatchHandle, Arc<dyn UpdateWatcher>>,
    notify_update_count: u64,
    snap_infos_count: u64,
    snap_infos_hook: Option<Box<dyn FnOnce() + Send>>,
}

pub struct TestImage {
    spec: ImageSpec,
    ops: OpLog,
    label: &'static str,
    next_watch_handle: AtomicU64,
    state: Mutex<TestImageState>,
}

impl TestImage {
    pub fn new(label: &'static str, pool_id: i64, ops: OpLog) -> Arc<Self> {
        Arc::new(Self {
            spec: ImageSpec::new(pool_id, format!("{}-image", label)),
            ops,
            label,
            next_watch_handle: AtomicU64::new(1),
            state: Mutex::new(TestImageState {
                snaps: BTreeMap::new(),
                refresh_required: false,
                refresh_error: None,
                refresh_count: 0,
                register_error: None,
                unregister_error: None,
                watchers: HashMap::new(),
                notify_update_count: 0,
                snap_infos_count: 0,
                snap_infos_hook: None,
            }),
        })
    }

    pub fn insert_mirror_snapshot(&self, snap_id: SnapId, ns: MirrorSnapshotNamespace) {
        let mut state = self.state.lock();
        state
            .snaps
            .insert(snap_id, SnapInfo::mirror(format!("mirror.{}", snap_id), ns));
    }

    pub fn insert_user_snapshot(&self, snap_id: SnapId, name: &str) {
        let mut state = self.state.lock();
        state.snaps.insert(snap_id, SnapInfo::user(name));
    }

    pub fn remove_snapshot(&self, snap_id: SnapId) {
        self.state.lock().snaps.remove(&snap_id);
    }

    pub fn mirror_snapshot(&self, snap_id: SnapId) -> Option<MirrorSnapshotNamespace> {
        let state = self.state.lock();
        state
            .snaps
            .get(&snap_id)
            .and_then(|info| info.namespace.as_mirror().cloned())
    }

    pub fn set_refresh_required(&self, required: bool) {
        self.state.lock().refresh_required = required;
    }

    pub fn fail_refresh(&self, err: ImageError) {
        let mut state = self.state.lock();
        state.refresh_required = true;
        state.refresh_error = Some(err);
    }

    pub fn fail_register(&self, err: ImageError) {
        self.state.lock().register_error = Some(err);
    }

    pub fn fail_unregister(&self, err: ImageError) {
        self.state.lock().unregister_error = Some(err);
    }

    pub fn refresh_count(&self) -> u64 {
        self.state.lock().refresh_count
    }

    pub fn snap_infos_count(&self) -> u64 {
        self.state.lock().snap_infos_count
    }

    /// Run `hook` at the start of the next `snap_infos` call (once).
    pub fn hook_next_snap_infos(&self, hook: impl FnOnce() + Send + 'static) {
        self.state.lock().snap_infos_hook = Some(Box::new(hook));
    }

    pub fn watcher_count(&self) -> usize {
        self.state.lock().watchers.len()
    }

    pub fn notify_update_count(&self) -> u64 {
        self.state.lock().notify_update_count
    }

    /// Deliver an update notification to every registered watcher.
    pub async fn notify_watchers(&self) {
        let watchers: Vec<_> = self.state.lock().watchers.values().cloned().collect();
        for watcher in watchers {
            watcher.handle_notify().await;
        }
    }

    fn log(&self, op: impl Into<String>) {
        self.ops.lock().push(format!("{}:{}", self.label, op.into()));
    }
}

#[async_trait]
impl MirrorImage for TestImage {
    fn spec(&self) -> &ImageSpec {
        &self.spec
    }

    fn is_refresh_required(&self) -> bool {
        self.state.lock().refresh_required
    }

    async fn refresh(&self) -> ImageResult<()> {
        let mut state = self.state.lock();
        state.refresh_count += 1;
        if let Some(err) = state.refresh_error.take() {
            return Err(err);
        }
        state.refresh_required = false;
        self.log("refresh");
        Ok(())
    }

    fn snap_infos(&self) -> BTreeMap<SnapId, SnapInfo> {
        let hook = {
            let mut state = self.state.lock();
            state.snap_infos_count += 1;
            state.snap_infos_hook.take()
        };
        if let Some(hook) = hook {
            hook();
        }
        self.state.lock().snaps.clone()
    }

    async fn register_update_watcher(
        &self,
        watcher: Arc<dyn UpdateWatcher>,
    ) -> ImageResult<WatchHandle> {
        let mut state = self.state.lock();
        if let Some(err) = state.register_error.take() {
            return Err(err);
        }
        let handle = self.next_watch_handle.fetch_add(1, Ordering::AcqRel);
        state.watchers.insert(handle, watcher);
        self.log("register_update_watcher");
        Ok(handle)
    }

    async fn unregister_update_watcher(&self, handle: WatchHandle) -> ImageResult<()> {
        let mut state = self.state.lock();
        if let Some(err) = state.unregister_error.take() {
            return Err(err);
        }
        state.watchers.remove(&handle);
        self.log("unregister_update_watcher");
        Ok(())
    }

    async fn notify_update(&self) -> ImageResult<()> {
        self.state.lock().notify_update_count += 1;
        self.log("notify_update");
        Ok(())
    }

    async fn set_mirror_snapshot_copy_progress(
        &self,
        snap_id: SnapId,
        complete: bool,
        last_copied_object_number: u64,
    ) -> ImageResult<()> {
        let mut state = self.state.lock();
        let info = state.snaps.get_mut(&snap_id).ok_or(ImageError::NotFound)?;
        match &mut info.namespace {
            SnapshotNamespace::Mirror(ns) => {
                ns.complete = complete;
                ns.last_copied_object_number = last_copied_object_number;
            }
            SnapshotNamespace::User => return Err(ImageError::NotFound),
        }
        self.log(format!(
            "set_copy_progress(snap_id={}, complete={}, last_copied={})",
            snap_id, complete, last_copied_object_number
        ));
        Ok(())
    }
}

// ========== TestDeepCopyEngine ==========

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyImageCall {
    pub remote_snap_id_start: SnapId,
    pub remote_snap_id_end: SnapId,
    pub local_snap_id_start: SnapId,
    pub resume_object: Option<u64>,
}

struct EngineState {
    snap_seqs: SnapSeqs,
    image_state: ImageState,
    next_local_snap_id: SnapId,
    copy_snapshots_error: Option<ImageError>,
    get_image_state_error: Option<ImageError>,
    create_error: Option<ImageError>,
    copy_image_error: Option<ImageError>,
    unlink_error: Option<ImageError>,
    copy_image_calls: Vec<CopyImageCall>,
    unlink_calls: Vec<(SnapId, String)>,
    copy_gate: Option<Arc<Notify>>,
}

pub struct TestDeepCopyEngine {
    local_image: Arc<TestImage>,
    ops: OpLog,
    copy_started: Notify,
    state: Mutex<EngineState>,
}

impl TestDeepCopyEngine {
    pub fn new(local_image: Arc<TestImage>, ops: OpLog) -> Arc<Self> {
        Arc::new(Self {
            local_image,
            ops,
            copy_started: Notify::new(),
            state: Mutex::new(EngineState {
                snap_seqs: SnapSeqs::new(),
                image_state: ImageState(b"image-state".to_vec()),
                next_local_snap_id: 200,
                copy_snapshots_error: None,
                get_image_state_error: None,
                create_error: None,
                copy_image_error: None,
                unlink_error: None,
                copy_image_calls: Vec::new(),
                unlink_calls: Vec::new(),
                copy_gate: None,
            }),
        })
    }

    pub fn set_snap_seqs(&self, snap_seqs: SnapSeqs) {
        self.state.lock().snap_seqs = snap_seqs;
    }

    pub fn set_next_local_snap_id(&self, snap_id: SnapId) {
        self.state.lock().next_local_snap_id = snap_id;
    }

    pub fn fail_copy_snapshots(&self, err: ImageError) {
        self.state.lock().copy_snapshots_error = Some(err);
    }

    pub fn fail_get_image_state(&self, err: ImageError) {
        self.state.lock().get_image_state_error = Some(err);
    }

    pub fn fail_create(&self, err: ImageError) {
        self.state.lock().create_error = Some(err);
    }

    pub fn fail_copy_image(&self, err: ImageError) {
        self.state.lock().copy_image_error = Some(err);
    }

    pub fn fail_unlink(&self, err: ImageError) {
        self.state.lock().unlink_error = Some(err);
    }

    /// Make the next `copy_image` block until the returned gate is notified.
    /// `wait_copy_started` observes the copy entering the gate.
    pub fn block_copy_image(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().copy_gate = Some(gate.clone());
        gate
    }

    pub async fn wait_copy_started(&self) {
        self.copy_started.notified().await;
    }

    pub fn copy_image_calls(&self) -> Vec<CopyImageCall> {
        self.state.lock().copy_image_calls.clone()
    }

    pub fn unlink_calls(&self) -> Vec<(SnapId, String)> {
        self.state.lock().unlink_calls.clone()
    }

    fn log(&self, op: impl Into<String>) {
        self.ops.lock().push(format!("engine:{}", op.into()));
    }
}

#[async_trait]
impl DeepCopyEngine for TestDeepCopyEngine {
    async fn copy_snapshots(
        &self,
        remote_snap_id_start: SnapId,
        remote_snap_id_end: SnapId,
        local_snap_id_start: SnapId,
    ) -> ImageResult<SnapSeqs> {
        let mut state = self.state.lock();
        if let Some(err) = state.copy_snapshots_error.take() {
            return Err(err);
        }
        self.log(format!(
            "copy_snapshots(remote_start={}, remote_end={}, local_start={})",
            remote_snap_id_start, remote_snap_id_end, local_snap_id_start
        ));
        Ok(state.snap_seqs.clone())
    }

    async fn get_image_state(&self, remote_snap_id: SnapId) -> ImageResult<ImageState> {
        let mut state = self.state.lock();
        if let Some(err) = state.get_image_state_error.take() {
            return Err(err);
        }
        self.log(format!("get_image_state(remote_snap_id={})", remote_snap_id));
        Ok(state.image_state.clone())
    }

    async fn create_non_primary_snapshot(
        &self,
        demoted: bool,
        primary_mirror_uuid: &str,
        primary_snap_id: SnapId,
        snap_seqs: &SnapSeqs,
        _image_state: &ImageState,
    ) -> ImageResult<SnapId> {
        let snap_id = {
            let mut state = self.state.lock();
            if let Some(err) = state.create_error.take() {
                return Err(err);
            }
            let snap_id = state.next_local_snap_id;
            state.next_local_snap_id += 1;
            snap_id
        };

        let mut ns = MirrorSnapshotNamespace::non_primary(primary_mirror_uuid, primary_snap_id);
        if demoted {
            ns = ns.demoted();
        }
        ns.snap_seqs = snap_seqs.clone();
        self.local_image.insert_mirror_snapshot(snap_id, ns);

        self.log(format!(
            "create_non_primary(demoted={}, primary_snap_id={}, local_snap_id={})",
            demoted, primary_snap_id, snap_id
        ));
        Ok(snap_id)
    }

    async fn copy_image(
        &self,
        remote_snap_id_start: SnapId,
        remote_snap_id_end: SnapId,
        local_snap_id_start: SnapId,
        resume_object: Option<u64>,
        _snap_seqs: &SnapSeqs,
        progress: Arc<dyn SyncProgressHandler>,
    ) -> ImageResult<()> {
        let gate = {
            let mut state = self.state.lock();
            state.copy_image_calls.push(CopyImageCall {
                remote_snap_id_start,
                remote_snap_id_end,
                local_snap_id_start,
                resume_object,
            });
            state.copy_gate.take()
        };

        // permit-storing notify: the test may subscribe after the copy began
        self.copy_started.notify_one();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if let Some(err) = self.state.lock().copy_image_error.take() {
            return Err(err);
        }

        progress.update_progress(1, 1);
        self.log(format!(
            "copy_image(remote_start={}, remote_end={}, resume={:?})",
            remote_snap_id_start, remote_snap_id_end, resume_object
        ));
        Ok(())
    }

    async fn unlink_peer(&self, remote_snap_id: SnapId, peer_uuid: &str) -> ImageResult<()> {
        let mut state = self.state.lock();
        state
            .unlink_calls
            .push((remote_snap_id, peer_uuid.to_string()));
        if let Some(err) = state.unlink_error.take() {
            return Err(err);
        }
        self.log(format!("unlink_peer(remote_snap_id={})", remote_snap_id));
        Ok(())
    }
}

// ========== Listener & pool meta ==========

#[derive(Default)]
pub struct TestListener {
    entered: AtomicU64,
    finished: AtomicU64,
    delay_ms: AtomicU64,
}

impl TestListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        let listener = Self::default();
        listener
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::Release);
        Arc::new(listener)
    }

    pub fn notifications(&self) -> u64 {
        self.finished.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> u64 {
        // read finished first so the difference can never underflow
        let finished = self.finished.load(Ordering::Acquire);
        self.entered.load(Ordering::Acquire) - finished
    }
}

#[async_trait]
impl ReplayerListener for TestListener {
    async fn handle_notification(&self) {
        self.entered.fetch_add(1, Ordering::AcqRel);
        let delay = self.delay_ms.load(Ordering::Acquire);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.finished.fetch_add(1, Ordering::AcqRel);
    }
}

pub struct TestPoolMeta {
    meta: Option<RemotePoolMeta>,
}

impl TestPoolMeta {
    pub fn with_peer(peer_uuid: &str) -> Arc<Self> {
        Arc::new(Self {
            meta: Some(RemotePoolMeta {
                mirror_peer_uuid: peer_uuid.to_string(),
            }),
        })
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self { meta: None })
    }
}

impl PoolMetaCache for TestPoolMeta {
    fn remote_pool_meta(&self, _pool_id: i64) -> Option<RemotePoolMeta> {
        self.meta.clone()
    }
}

// ========== Harness ==========

pub struct Harness {
    pub ops: OpLog,
    pub local: Arc<TestImage>,
    pub remote: Arc<TestImage>,
    pub engine: Arc<TestDeepCopyEngine>,
    pub listener: Arc<TestListener>,
    pub replayer: Replayer,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_listener(TestListener::new())
    }

    pub fn with_listener(listener: Arc<TestListener>) -> Self {
        Self::build(listener, TestPoolMeta::with_peer(PEER_UUID))
    }

    pub fn with_empty_pool_meta() -> Self {
        Self::build(TestListener::new(), TestPoolMeta::empty())
    }

    fn build(listener: Arc<TestListener>, pool_meta: Arc<TestPoolMeta>) -> Self {
        let ops: OpLog = Arc::new(Mutex::new(Vec::new()));
        let local = TestImage::new("local", 1, ops.clone());
        let remote = TestImage::new("remote", 1, ops.clone());
        let engine = TestDeepCopyEngine::new(local.clone(), ops.clone());
        let replayer = Replayer::new(ReplayerOptions {
            local_mirror_uuid: LOCAL_MIRROR_UUID.to_string(),
            remote_mirror_uuid: REMOTE_MIRROR_UUID.to_string(),
            local_image: local.clone(),
            remote_image: remote.clone(),
            deep_copy: engine.clone(),
            pool_meta_cache: pool_meta,
            listener: listener.clone(),
        });
        Self {
            ops,
            local,
            remote,
            engine,
            listener,
            replayer,
        }
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }
}
