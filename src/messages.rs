//! Messages exchanged between channel participants.
//!
//! No bit-exact wire format is fixed here; the transport only has to deliver
//! these values reliably and in order per peer pair.

use crate::channel::state::{Balances, PartIdx, State};
use crate::types::{Address, Hash, Signature, U256};

/// Opening proposal for a new channel. Sent by the proposer (participant 0).
#[derive(Debug, Clone, Copy)]
pub struct ChannelProposal {
    pub proposal_id: Hash,
    /// Challenge duration for on-chain disputes, in seconds.
    pub challenge_duration: u64,
    /// The proposer's share of the channel nonce; the acceptor contributes
    /// the second share so neither side controls the channel id alone.
    pub nonce_share: U256,
    pub proposer: Address,
    /// Initial balances: `[proposer, acceptor]`.
    pub balances: Balances,
}

/// Acceptance of a [ChannelProposal]. Carries the acceptor's nonce share and
/// its signature over the derived initial state (version 0).
#[derive(Debug, Clone, Copy)]
pub struct ProposalAccepted {
    pub proposal_id: Hash,
    pub nonce_share: U256,
    pub participant: Address,
    pub sig: Signature,
}

/// A proposed state update, signed by the proposing participant.
#[derive(Debug, Clone, Copy)]
pub struct UpdateProposal {
    pub channel_id: Hash,
    pub state: State,
    pub actor: PartIdx,
    pub sig: Signature,
}

/// Counter-signature completing an update (or the version-0 state during
/// the opening handshake).
#[derive(Debug, Clone, Copy)]
pub struct UpdateAccepted {
    pub channel_id: Hash,
    pub version: u64,
    pub sig: Signature,
}

/// Explicit decline of a proposed update. The reason is advisory only.
#[derive(Debug, Clone)]
pub struct UpdateRejected {
    pub channel_id: Hash,
    pub version: u64,
    pub reason: String,
}

/// Everything one participant may send another.
#[derive(Debug, Clone)]
pub enum Message {
    ChannelProposal(ChannelProposal),
    ProposalAccepted(ProposalAccepted),
    ProposalRejected { proposal_id: Hash, reason: String },
    Update(UpdateProposal),
    UpdateAccepted(UpdateAccepted),
    UpdateRejected(UpdateRejected),
}
