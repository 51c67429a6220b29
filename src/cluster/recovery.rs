//! Disaster recovery.
//!
//! Invoked when every member pod is gone. The replica cluster is reborn with
//! a new identity: a fresh seed member whose restore init container seeds the
//! data directory from the latest snapshot before the member process starts.

use tracing::{error, info};

use super::ClusterInner;
use crate::error::{OperatorError, Result};

impl ClusterInner {
    pub(super) async fn disaster_recovery(&mut self) -> Result<()> {
        let Some(bm) = self.bm.as_ref() else {
            error!("cannot recover: no backup policy configured");
            return Err(OperatorError::NoBackupExist);
        };
        let Some(snapshot) = bm.latest_snapshot().await? else {
            error!("cannot recover: no snapshot has been taken");
            return Err(OperatorError::NoBackupExist);
        };

        info!(
            snapshot = %snapshot.name,
            revision = snapshot.revision,
            "recovering cluster from the latest snapshot"
        );
        self.status.append_recovering_condition();

        // Member identities are not preserved across recovery.
        self.members.clear();
        self.restore_seed_member().await?;
        self.status.size = 1;
        Ok(())
    }
}
