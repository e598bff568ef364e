//! Error taxonomy of the consensus engine.

use thiserror::Error;

use crate::core_encoding::EncodingError;
use crate::core_keyring::KeyRingError;
use crate::core_store::StoreError;

#[derive(Debug, Error)]
pub enum ConsensusError {
    // Validation failures, returned to the submitter and never retried.
    #[error("unable to endorse a spore with expired deadline")]
    DeadlineExpired,
    #[error("the spore is behind the current state for key {0}")]
    BehindRequirement(String),
    #[error("the requested policy is unknown: {0}")]
    UnknownPolicy(String),
    #[error("the requested operation is too large for the policy")]
    OpTooLarge,
    #[error("the requested operation is not allowed by the policy")]
    OpNotAllowed,
    #[error("the requested key is not modifiable according to the policy")]
    OpDisabledKey,
    #[error("the requested key has been reserved for internal use")]
    OpSystemKey,
    #[error("unable to endorse a spore due to policy quota reached")]
    PolicyQuotaExceeded,
    #[error("policy contains an invalid key specification: {0}")]
    InvalidPolicySpec(String),

    // Consensus-transient conditions.
    #[error("unable to endorse a spore due to conflicting promise")]
    ConflictingWithStaging,
    #[error("no spore related to this endorsement")]
    NoRelatedSpore,
    #[error("endorsement already registered for this emitter")]
    DuplicatedEndorsement,
    #[error("emitter is not an allowed endorser for this policy")]
    UnallowedEndorser,

    // Apply-time failures.
    #[error("unable to apply a spore after its grace period")]
    GracePeriodExpired,
    #[error("spore has already been applied")]
    DuplicatedApplication,

    // Propagated subsystem failures.
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    KeyRing(#[from] KeyRingError),
    #[error("serialization failure: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for ConsensusError {
    fn from(err: bincode::Error) -> Self {
        ConsensusError::Serialization(err.to_string())
    }
}
