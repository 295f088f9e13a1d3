//! Errors produced by the usage tracker.

use std::io;

/// Something went wrong while reading or updating a usage record.
///
/// Read-side variants ([`QuotaError::StorageRead`], [`QuotaError::Corrupt`])
/// are logged and recovered inside the tracker. Running out of quota is not
/// an error at all; see [`super::Admission`].
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    /// The usage record exists but could not be read.
    #[error("could not read usage record at {location}")]
    StorageRead {
        location: String,
        #[source]
        source: io::Error,
    },

    /// The usage record could not be parsed.
    #[error("usage record at {location} is corrupt")]
    Corrupt {
        location: String,
        #[source]
        source: serde_json::Error,
    },

    /// The usage record could not be written.
    #[error("could not write usage record at {location}")]
    StorageWrite {
        location: String,
        #[source]
        source: io::Error,
    },

    /// We could not get exclusive access to the usage record.
    #[error("could not lock usage record at {location}")]
    StorageLock {
        location: String,
        #[source]
        source: io::Error,
    },

    /// The usage record could not be serialized.
    #[error("could not encode usage record")]
    Encode(#[from] serde_json::Error),

    /// Unit counts must be positive.
    #[error("unit count must be positive")]
    InvalidUnits,

    /// Quota limits must be positive.
    #[error("quota limit must be positive")]
    InvalidLimit,
}
