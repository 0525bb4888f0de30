//! Error taxonomy shared by every protocol operation.
//!
//! A peer declining a proposal and a peer going silent are ordinary outcomes
//! of a negotiation round, not infrastructure faults; they get their own
//! variants so callers can tell them apart from validation failures (local,
//! never retried) and infrastructure faults (retried at the boundary).

use thiserror::Error;

use crate::app::TransitionError;
use crate::types::{Address, U256};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, Clone)]
pub enum Error {
    /// The peer explicitly rejected a proposal. Expected, non-fatal.
    #[error("peer declined the proposal: {reason}")]
    Declined { reason: String },

    /// The peer did not respond within the configured response timeout.
    #[error("peer did not respond in time")]
    Timeout,

    /// A local check failed. Surfaced immediately, never retried.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Transport, ledger or adjudicator unreachable after retries.
    #[error(transparent)]
    Infrastructure(#[from] InfrastructureError),

    /// The caller's deadline or cancellation fired while waiting.
    #[error("operation canceled")]
    Canceled,

    /// The channel (or its task) is gone.
    #[error("channel is closed")]
    ChannelClosed,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("document does not match the requested document")]
    DocumentMismatch,

    #[error("price mismatch: expected {expected}, requested {actual}")]
    PriceMismatch { expected: U256, actual: U256 },

    #[error("invalid signature, recovered signer {0:?}")]
    InvalidSignature(Address),

    #[error("unexpected participant {0:?}")]
    UnexpectedParticipant(Address),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("another channel update is already in progress")]
    UpdateInProgress,

    #[error("credential request was already answered")]
    AlreadyIssued,

    #[error("no credential offer with version {0} is pending")]
    NoPendingOffer(u64),

    #[error("channel is not open")]
    NotOpen,

    #[error("channel is unknown to the adjudicator")]
    UnknownChannel,

    #[error("a dispute is still pending on-chain")]
    DisputePending,

    #[error("channel is not concludable yet")]
    NotConcludable,

    #[error("funds were already withdrawn")]
    AlreadyWithdrawn,
}

#[derive(Debug, Error, Clone)]
pub enum InfrastructureError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("adjudicator unreachable: {0}")]
    Adjudicator(String),
}

impl Error {
    /// Whether retrying the same call may succeed. Only infrastructure
    /// faults qualify; declines and validation failures are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Infrastructure(_))
    }
}
