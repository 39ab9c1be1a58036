use thiserror::Error;

use crate::backend::BackendError;
use crate::janitor::CleanupError;
use crate::objects::MaintainError;
use crate::repair::RepairError;
use crate::stats::StatsError;
use crate::store::StoreError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Stats(#[from] StatsError),

    #[error(transparent)]
    Repair(#[from] RepairError),

    #[error(transparent)]
    Maintain(#[from] MaintainError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Stats(e) => e.transience(),
            Error::Repair(e) => e.transience(),
            Error::Maintain(e) => e.transience(),
            Error::Backend(e) => e.transience(),
            Error::Cleanup(e) => e.transience(),
            Error::Store(e) => e.transience(),
        }
    }
}
