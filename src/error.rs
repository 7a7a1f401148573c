//! # Error Taxonomy
//!
//! Typed errors for the store. Every fallible operation in the crate returns
//! `eyre::Result`; the variants below are attached as the source of the
//! report so callers can recover the category with
//! `report.downcast_ref::<StoreError>()`.
//!
//! The categories:
//!
//! - **Lifecycle**: `AlreadyClosed` — operating on (or re-closing) a closed
//!   backend or store.
//! - **Capacity**: `CannotAllocate` — the backend could not satisfy a
//!   requested minimum size.
//! - **Policy**: `CannotWrite` (write attempted inside a read transaction)
//!   and `InvalidKey` (empty key, or a user key starting with the reserved
//!   bucket marker byte).
//! - **Corruption**: an offset walked outside the arena, an unknown color or
//!   child-type byte, a truncated record. These indicate a damaged offset
//!   graph; the operation fails instead of the process aborting.

use thiserror::Error;

/// Typed error categories surfaced by the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend or store has already been closed.
    #[error("already closed")]
    AlreadyClosed,

    /// The backend could not grow to the requested minimum size.
    #[error("cannot allocate needed bytes")]
    CannotAllocate,

    /// A write was attempted during a read transaction.
    #[error("cannot write during a read transaction")]
    CannotWrite,

    /// The provided key is not usable at this surface.
    #[error("invalid key: {reason}")]
    InvalidKey {
        /// Why the key was rejected.
        reason: &'static str,
    },

    /// The offset graph or a stored record is damaged.
    #[error("corruption detected: {detail}")]
    Corruption {
        /// Where and how the damage was observed.
        detail: String,
    },
}

impl StoreError {
    pub(crate) fn corruption(detail: impl Into<String>) -> Self {
        StoreError::Corruption {
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::StoreError;

    #[test]
    fn reports_downcast_to_typed_variants() {
        let report: eyre::Report = StoreError::CannotWrite.into();

        assert!(matches!(
            report.downcast_ref::<StoreError>(),
            Some(StoreError::CannotWrite)
        ));
    }

    #[test]
    fn corruption_carries_detail() {
        let err = StoreError::corruption("block offset 96 beyond arena length 64");

        assert_eq!(
            err.to_string(),
            "corruption detected: block offset 96 beyond arena length 64"
        );
    }
}
