use forgeshare_storage::StorageError;

/// Malformed plan declarations. Fatal at boot.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("At least one reward sharing plan is required")]
    NoPlans,
    #[error("First plan must declare a share ratio, even if 0")]
    BaseShareMissing,
    #[error("Base plan must declare a reserve address and share, even if 0")]
    BaseReserveMissing,
    #[error("Plan {index}: share {share} outside 0-100")]
    ShareOutOfRange { index: usize, share: f64 },
    #[error("Plan {index}: unparseable timestamp {value:?}")]
    InvalidTimestamp { index: usize, value: String },
    #[error("Plan {index}: height/timestamp earlier than the previous plan")]
    NotMonotonic { index: usize },
    #[error("Plan {index}: payee {address} listed twice")]
    DuplicatePayee { index: usize, address: String },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("Arithmetic overflow computing {0}")]
    Overflow(&'static str),
}

#[derive(thiserror::Error, Debug)]
pub enum AntiBotError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
}
