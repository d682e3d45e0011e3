//! Snapshot metadata types.
//!
//! Only snapshots carrying a [`MirrorSnapshotNamespace`] participate in
//! replication; every other namespace kind is ignored by the replayer's
//! scanner. The serialized form of the mirror namespace is the durable
//! replication state: it must preserve all four role variants and every
//! field below across releases.

use std::collections::BTreeSet;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::types::{SnapId, SnapSeqs};

/// Role of an image at the time a mirror snapshot was taken.
///
/// Demotion snapshots record a role handover and appear in both images with
/// symmetric `PrimaryDemoted` / `NonPrimaryDemoted` tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MirrorSnapshotState {
    Primary,
    PrimaryDemoted,
    NonPrimary,
    NonPrimaryDemoted,
}

impl MirrorSnapshotState {
    pub fn is_primary(&self) -> bool {
        matches!(
            self,
            MirrorSnapshotState::Primary | MirrorSnapshotState::PrimaryDemoted
        )
    }

    pub fn is_non_primary(&self) -> bool {
        matches!(
            self,
            MirrorSnapshotState::NonPrimary | MirrorSnapshotState::NonPrimaryDemoted
        )
    }

    pub fn is_demoted(&self) -> bool {
        matches!(
            self,
            MirrorSnapshotState::PrimaryDemoted | MirrorSnapshotState::NonPrimaryDemoted
        )
    }
}

impl Display for MirrorSnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorSnapshotState::Primary => write!(f, "primary"),
            MirrorSnapshotState::PrimaryDemoted => write!(f, "primary (demoted)"),
            MirrorSnapshotState::NonPrimary => write!(f, "non-primary"),
            MirrorSnapshotState::NonPrimaryDemoted => write!(f, "non-primary (demoted)"),
        }
    }
}

/// Replication metadata attached to a mirror snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorSnapshotNamespace {
    /// Image role at snapshot time.
    pub state: MirrorSnapshotState,
    /// Whether this snapshot is a finalized sync point. An incomplete
    /// snapshot is an in-progress placeholder that a replayer may resume.
    pub complete: bool,
    /// For non-primary snapshots, the mirror uuid of the remote cluster that
    /// produced the matching primary snapshot.
    pub primary_mirror_uuid: String,
    /// For non-primary snapshots, the remote snap-id being mirrored.
    pub primary_snap_id: SnapId,
    /// For primary snapshots, the set of peers authorized to consume it.
    /// The remote may prune the snapshot once this set drains.
    pub mirror_peer_uuids: BTreeSet<String>,
    /// Remote-to-local snap-id translation table populated during
    /// snapshot-metadata copy.
    pub snap_seqs: SnapSeqs,
    /// Resume point for object copy; 0 if untouched.
    pub last_copied_object_number: u64,
}

impl MirrorSnapshotNamespace {
    /// New incomplete primary namespace listing the given consumer peers.
    pub fn primary<I, S>(mirror_peer_uuids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state: MirrorSnapshotState::Primary,
            mirror_peer_uuids: mirror_peer_uuids.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// New incomplete non-primary namespace linked to a remote snapshot.
    pub fn non_primary(primary_mirror_uuid: impl Into<String>, primary_snap_id: SnapId) -> Self {
        Self {
            state: MirrorSnapshotState::NonPrimary,
            primary_mirror_uuid: primary_mirror_uuid.into(),
            primary_snap_id,
            ..Default::default()
        }
    }

    /// Turn the namespace into its demoted counterpart.
    pub fn demoted(mut self) -> Self {
        self.state = match self.state {
            MirrorSnapshotState::Primary | MirrorSnapshotState::PrimaryDemoted => {
                MirrorSnapshotState::PrimaryDemoted
            }
            MirrorSnapshotState::NonPrimary | MirrorSnapshotState::NonPrimaryDemoted => {
                MirrorSnapshotState::NonPrimaryDemoted
            }
        };
        self
    }

    /// Mark the namespace as a finalized sync point.
    pub fn completed(mut self) -> Self {
        self.complete = true;
        self
    }

    pub fn is_primary(&self) -> bool {
        self.state.is_primary()
    }

    pub fn is_non_primary(&self) -> bool {
        self.state.is_non_primary()
    }

    pub fn is_demoted(&self) -> bool {
        self.state.is_demoted()
    }
}

impl Default for MirrorSnapshotNamespace {
    fn default() -> Self {
        Self {
            state: MirrorSnapshotState::NonPrimary,
            complete: false,
            primary_mirror_uuid: String::new(),
            primary_snap_id: 0,
            mirror_peer_uuids: BTreeSet::new(),
            snap_seqs: SnapSeqs::new(),
            last_copied_object_number: 0,
        }
    }
}

impl Display for MirrorSnapshotNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} complete={} primary_mirror_uuid={} primary_snap_id={}]",
            self.state, self.complete, self.primary_mirror_uuid, self.primary_snap_id
        )
    }
}

/// Tagged snapshot namespace. Only the `Mirror` kind participates in
/// replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SnapshotNamespace {
    /// Ordinary user-created snapshot.
    User,
    /// Replication sync point.
    Mirror(MirrorSnapshotNamespace),
}

impl SnapshotNamespace {
    pub fn as_mirror(&self) -> Option<&MirrorSnapshotNamespace> {
        match self {
            SnapshotNamespace::Mirror(ns) => Some(ns),
            SnapshotNamespace::User => None,
        }
    }
}

/// Metadata of a single snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapInfo {
    pub name: String,
    pub namespace: SnapshotNamespace,
}

impl SnapInfo {
    pub fn new(name: impl Into<String>, namespace: SnapshotNamespace) -> Self {
        Self {
            name: name.into(),
            namespace,
        }
    }

    pub fn mirror(name: impl Into<String>, ns: MirrorSnapshotNamespace) -> Self {
        Self::new(name, SnapshotNamespace::Mirror(ns))
    }

    pub fn user(name: impl Into<String>) -> Self {
        Self::new(name, SnapshotNamespace::User)
    }
}

/// Opaque image-state blob attached to a mirror snapshot.
///
/// The replayer forwards it verbatim from the remote snapshot into the local
/// non-primary snapshot; only the backend interprets the contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageState(pub Vec<u8>);

impl ImageState {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
