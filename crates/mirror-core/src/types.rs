//! Identifier types shared across the workspace.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Cluster-assigned pool identifier.
pub type PoolId = i64;

/// Cluster-assigned snapshot identifier.
///
/// Snap-ids are allocated monotonically by the owning cluster, so walking a
/// snapshot listing in ascending id order walks it in creation order.
pub type SnapId = u64;

/// Reserved snap-id meaning "head": the current writable image revision.
pub const NO_SNAP: SnapId = SnapId::MAX;

/// Translation table from remote snap-ids to the local snap-ids that were
/// created for them during snapshot-metadata copy.
pub type SnapSeqs = BTreeMap<SnapId, SnapId>;

/// Identifies an image within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSpec {
    /// Pool the image lives in.
    pub pool_id: PoolId,
    /// Cluster-unique image id within the pool.
    pub image_id: String,
}

impl ImageSpec {
    pub fn new(pool_id: PoolId, image_id: impl Into<String>) -> Self {
        Self {
            pool_id,
            image_id: image_id.into(),
        }
    }
}

impl Display for ImageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pool_id, self.image_id)
    }
}
