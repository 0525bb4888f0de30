//! Channel parameters, states and signature collection.

use serde::Serialize;

use crate::app::{AppState, SignerSet};
use crate::encode;
use crate::sig;
use crate::types::{Address, Hash, Signature, U256};

pub const PARTICIPANTS: usize = 2;

/// Index of a participant in the channel. `0` is the channel proposer.
pub type PartIdx = usize;

/// One balance per participant, in a single asset.
pub type Balances = [U256; PARTICIPANTS];

/// Channel configuration, fixed at proposal time. Hashing it yields the
/// channel id, so no two channels with different participants, nonces or
/// challenge durations can ever collide.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct Params {
    /// Challenge duration of on-chain disputes, in seconds.
    pub challenge_duration: u64,
    /// Combined from both participants' nonce shares during the proposal.
    pub nonce: U256,
    pub participants: [Address; PARTICIPANTS],
}

impl Params {
    pub fn channel_id(&self) -> Hash {
        encode::to_hash(self)
    }

    pub fn index_of(&self, addr: Address) -> Option<PartIdx> {
        self.participants.iter().position(|p| *p == addr)
    }

    pub fn other(&self, me: PartIdx) -> PartIdx {
        1 - me
    }
}

/// Complete state of a channel at one version.
///
/// `id` and `version` are private: the only way to advance a version is
/// [State::make_next_state], which makes accidentally skipping or reusing a
/// version a compile-time impossibility rather than a runtime check.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct State {
    id: Hash,
    version: u64,
    pub balances: Balances,
    pub app: AppState,
    pub is_final: bool,
}

impl State {
    pub fn new(params: &Params, balances: Balances) -> Self {
        State {
            id: params.channel_id(),
            version: 0,
            balances,
            app: AppState::Idle,
            is_final: false,
        }
    }

    pub fn channel_id(&self) -> Hash {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Create the successor state: same channel, version incremented, all
    /// other fields copied for the caller to modify.
    pub fn make_next_state(&self) -> Self {
        State {
            id: self.id,
            version: self.version + 1,
            balances: self.balances,
            app: self.app,
            is_final: self.is_final,
        }
    }

    pub fn total(&self) -> U256 {
        self.balances[0] + self.balances[1]
    }

    /// The digest participants sign to endorse this state.
    pub fn hash(&self) -> Hash {
        encode::to_hash(self)
    }
}

/// A state together with the signatures collected for it so far.
#[derive(Debug, Clone, Copy)]
pub struct SignedState {
    pub state: State,
    sigs: [Option<Signature>; PARTICIPANTS],
}

impl SignedState {
    pub fn new(state: State) -> Self {
        SignedState {
            state,
            sigs: [None; PARTICIPANTS],
        }
    }

    pub fn with_sig(state: State, part_idx: PartIdx, sig: Signature) -> Self {
        let mut s = Self::new(state);
        s.put_sig(part_idx, sig);
        s
    }

    pub fn put_sig(&mut self, part_idx: PartIdx, sig: Signature) {
        self.sigs[part_idx] = Some(sig);
    }

    pub fn sig(&self, part_idx: PartIdx) -> Option<Signature> {
        self.sigs[part_idx]
    }

    /// Final off-chain: both participants have endorsed the state.
    pub fn is_cosigned(&self) -> bool {
        self.sigs.iter().all(|s| s.is_some())
    }

    /// Check that every signature required by `signers` is present and
    /// recovers to the matching participant of `params`.
    pub fn satisfies(&self, params: &Params, signers: SignerSet) -> bool {
        let required: Vec<PartIdx> = match signers {
            SignerSet::Both => vec![0, 1],
            SignerSet::Only(idx) => vec![idx],
        };
        let hash = self.state.hash();
        required.into_iter().all(|idx| match self.sigs[idx] {
            Some(sig) => sig::verify(hash, sig, params.participants[idx]),
            None => false,
        })
    }
}
