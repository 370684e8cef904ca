//! Blue/green publishing of source versions.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::common::{SourceId, SourceVersionId};
use crate::domains::versions::models::SourceVersion;
use crate::kernel::store::{RecordingTaskStore, VersionStore};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("source version {0} not found")]
    VersionNotFound(SourceVersionId),

    #[error("source {0} not found")]
    SourceNotFound(SourceId),

    #[error("source version {version_id} belongs to source {actual}, not {expected}")]
    SourceMismatch {
        version_id: SourceVersionId,
        expected: SourceId,
        actual: SourceId,
    },

    #[error("source version {0} is archived and cannot be published")]
    Archived(SourceVersionId),

    #[error("source version {version_id} still has {outstanding} pending or running recording tasks")]
    TasksOutstanding {
        version_id: SourceVersionId,
        outstanding: i64,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Makes a finished version the one readers see.
pub struct VersionPublisher<S> {
    store: Arc<S>,
}

impl<S> Clone for VersionPublisher<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S> VersionPublisher<S>
where
    S: VersionStore + RecordingTaskStore + 'static,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Activate `version_id` for `source_id`, archiving the previous active
    /// version in the same transaction.
    ///
    /// Refuses while any recording task of the version is still pending or
    /// running. Republishing the already-active version is a no-op swap.
    pub async fn publish_version(
        &self,
        version_id: SourceVersionId,
        source_id: SourceId,
    ) -> Result<SourceVersion, PublishError> {
        let outstanding = self.store.outstanding_tasks_for_version(version_id).await?;
        if outstanding > 0 {
            warn!(
                version_id = %version_id,
                outstanding,
                "refusing to publish version with unfinished recording tasks"
            );
            return Err(PublishError::TasksOutstanding {
                version_id,
                outstanding,
            });
        }

        let version = self.store.swap_active_version(version_id, source_id).await?;
        info!(
            source_id = %source_id,
            version_id = %version.id,
            version_number = version.version_number,
            "version is now active"
        );
        Ok(version)
    }
}
