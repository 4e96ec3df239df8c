use batchctl_common::blob::BlobStore;
use batchctl_common::health::HealthRegistry;
use batchctl_common::store::Store;

use crate::config::Config;

/// Shared state handed to every handler via `axum::extract::State`, following the teacher's
/// `PgQueue`-as-state pattern generalized to the richer Store/BlobStore pair this control plane
/// needs.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub blobs: BlobStore,
    pub config: Config,
    pub liveness: HealthRegistry,
}
