//! Payment channels carrying the credential exchange.
//!
//! [state] holds the passive data model, [machine] the per-channel actor
//! task that owns a channel's state chain, and [handle] the typed handles
//! through which callers drive it.

pub mod handle;
pub(crate) mod machine;
pub mod state;

pub use handle::{Channel, CredentialOffer, CredentialRequest, PendingCredential};

/// Lifecycle phase of a channel, observable through a watch subscription.
///
/// Phases only ever move forward, except `Disputed`, which falls back to
/// `Open` when a dispute is refuted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Proposal exchanged, waiting for the version-0 co-signature and the
    /// funding of both deposits.
    Proposed,
    /// Funded and co-signed; updates may be negotiated.
    Open,
    /// A dispute is registered on-chain; off-chain progress is suspended.
    Disputed,
    /// A final state exists, cooperatively or by adjudication; the channel
    /// can be settled.
    Concludable,
    /// Settled and withdrawn. Terminal.
    Closed,
}
