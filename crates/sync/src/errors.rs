use forgeshare_storage::StorageError;
use forgeshare_treasury::{AllocationError, AntiBotError, PlanError};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("Chain data unavailable: {0}")]
    Unavailable(String),
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),
}

#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("Read worker died while running the job")]
    WorkerLost,
    #[error("Read queue closed")]
    QueueClosed,
    #[error("Read job failed: {0}")]
    Job(#[from] StorageError),
    #[error("Unexpected reply to {0}")]
    UnexpectedReply(&'static str),
    #[error("Failed to spawn read worker: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("Ledger error: {0}")]
    Storage(#[from] StorageError),
    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),
    #[error("Read pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("Allocation error: {0}")]
    Allocation(#[from] AllocationError),
    #[error("Anti-bot error: {0}")]
    AntiBot(#[from] AntiBotError),
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),
    #[error("Delegate {0} is not registered on chain")]
    DelegateNotFound(String),
    #[error("Rollback target block {0} not found on chain")]
    RollbackTargetMissing(u64),
    #[error("Block {0} was not indexed in time")]
    BlockNotIndexed(u64),
    #[error("Engine stopped")]
    EngineStopped,
}

impl SyncError {
    /// Fatal errors stop the engine; everything else is logged and the
    /// next event is handled.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Plan(_) | SyncError::DelegateNotFound(_) | SyncError::RollbackTargetMissing(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(SyncError::RollbackTargetMissing(10).is_fatal());
        assert!(SyncError::Plan(PlanError::NoPlans).is_fatal());
        assert!(!SyncError::BlockNotIndexed(10).is_fatal());
        assert!(!SyncError::Pool(PoolError::WorkerLost).is_fatal());
        assert!(!SyncError::Oracle(OracleError::Unavailable("down".into())).is_fatal());
    }
}
