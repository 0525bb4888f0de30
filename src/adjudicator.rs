//! The on-chain adjudicator boundary.
//!
//! The protocol core talks to the chain exclusively through [Adjudicator]:
//! funding deposits, dispute registration/refutation and final settlement.
//! All calls are idempotent and safe to retry; a failing call means the
//! ledger was unreachable, not that the protocol was violated.
//!
//! [LocalAdjudicator] is the in-process implementation backing tests. It
//! enforces exactly the same rules a deployed contract would, by calling the
//! same [crate::app::valid_transition] the participants use off-chain.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};

use crate::app::{self, SignerSet};
use crate::channel::state::{Balances, Params, PartIdx, SignedState, State, PARTICIPANTS};
use crate::error::{Result, ValidationError};
use crate::types::{Hash, U256};

const EVENT_BUFFER: usize = 64;

/// Evidence registered to open a dispute: the newest co-signed state as the
/// anchor, plus the claimed successor state carrying at least the signatures
/// its transition requires.
#[derive(Debug, Clone, Copy)]
pub struct DisputeProof {
    pub anchor: SignedState,
    pub claim: SignedState,
    /// Participant performing the claimed transition.
    pub actor: PartIdx,
}

/// Chain events observed by channel watchers.
#[derive(Debug, Clone)]
pub enum AdjudicatorEvent {
    /// All deposits for the channel have arrived.
    Funded { channel: Hash },
    /// A dispute was registered; the challenge clock is running.
    Registered { channel: Hash, version: u64 },
    /// A pending dispute was refuted with a newer co-signed state.
    Refuted { channel: Hash, version: u64 },
    /// The channel's final state is settled, cooperatively or by expiry of
    /// the challenge window.
    Concluded { channel: Hash, state: State },
}

impl AdjudicatorEvent {
    pub fn channel(&self) -> Hash {
        match self {
            AdjudicatorEvent::Funded { channel }
            | AdjudicatorEvent::Registered { channel, .. }
            | AdjudicatorEvent::Refuted { channel, .. }
            | AdjudicatorEvent::Concluded { channel, .. } => *channel,
        }
    }
}

#[async_trait]
pub trait Adjudicator: Send + Sync + 'static {
    /// Lock `amount` for `part_idx` in the channel described by `params`,
    /// creating the on-chain channel record on first deposit. Emits
    /// [AdjudicatorEvent::Funded] once every participant's initial balance
    /// is covered.
    async fn deposit(
        &self,
        params: &Params,
        initial: &State,
        part_idx: PartIdx,
        amount: U256,
    ) -> Result<()>;

    /// Open a dispute with the given proof. The claim becomes final once the
    /// challenge duration elapses without refutation.
    async fn register(&self, params: &Params, proof: DisputeProof) -> Result<()>;

    /// Overturn a pending dispute with a newer co-signed state.
    async fn refute(&self, params: &Params, newer: SignedState) -> Result<()>;

    /// Settle a channel cooperatively with a co-signed final state.
    async fn conclude(&self, params: &Params, finals: SignedState) -> Result<()>;

    /// The settled final state, if any.
    async fn query_final(&self, channel: Hash) -> Result<Option<State>>;

    /// Pay out `part_idx`'s share of the settled final balances.
    async fn withdraw(&self, channel: Hash, part_idx: PartIdx) -> Result<U256>;

    /// Subscribe to chain events. Events for all channels are delivered;
    /// filter by [AdjudicatorEvent::channel].
    fn subscribe(&self) -> broadcast::Receiver<AdjudicatorEvent>;
}

/// Retry an idempotent boundary call with exponential backoff. Only
/// infrastructure faults are retried; protocol outcomes pass through.
pub(crate) async fn with_backoff<T, F, Fut>(what: &'static str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    const ATTEMPTS: u32 = 3;
    let mut delay = Duration::from_millis(100);
    for attempt in 1..=ATTEMPTS {
        match call().await {
            Err(e) if e.is_retryable() && attempt < ATTEMPTS => {
                tracing::warn!(error = %e, what, attempt, "boundary call failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            other => return other,
        }
    }
    unreachable!("loop returns on the last attempt")
}

struct Dispute {
    claim: SignedState,
    actor: PartIdx,
}

struct Record {
    params: Params,
    target: Balances,
    deposits: Balances,
    funded: bool,
    dispute: Option<Dispute>,
    /// Bumped whenever a dispute is overturned, so stale challenge timers
    /// cannot finalize a claim that was refuted meanwhile.
    round: u64,
    concluded: Option<State>,
    withdrawn: [bool; PARTICIPANTS],
}

#[derive(Default)]
struct Inner {
    channels: Mutex<HashMap<Hash, Record>>,
}

/// In-process adjudicator with real challenge timers and a conserved ledger.
#[derive(Clone)]
pub struct LocalAdjudicator {
    inner: Arc<Inner>,
    events: broadcast::Sender<AdjudicatorEvent>,
}

impl Default for LocalAdjudicator {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalAdjudicator {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner::default()),
            events,
        }
    }

    fn emit(&self, ev: AdjudicatorEvent) {
        // No receivers is fine; watchers may come and go.
        let _ = self.events.send(ev);
    }

    /// Total amount currently locked across all channels. Test helper for
    /// conservation checks.
    pub async fn total_holdings(&self) -> U256 {
        let channels = self.inner.channels.lock().await;
        channels.values().fold(U256::zero(), |acc, r| {
            let deposited = r.deposits[0] + r.deposits[1];
            let withdrawn = match r.concluded {
                Some(state) => (0..PARTICIPANTS)
                    .filter(|&i| r.withdrawn[i])
                    .fold(U256::zero(), |a, i| a + state.balances[i]),
                None => U256::zero(),
            };
            acc + deposited - withdrawn
        })
    }

    fn spawn_challenge_timer(&self, channel: Hash, round: u64, claim_version: u64, secs: u64) {
        let inner = Arc::clone(&self.inner);
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;

            let mut channels = inner.channels.lock().await;
            let record = match channels.get_mut(&channel) {
                Some(r) => r,
                None => return,
            };
            if record.round != round || record.concluded.is_some() {
                return;
            }
            let dispute = match &record.dispute {
                Some(d) if d.claim.state.version() == claim_version => d,
                _ => return,
            };

            // Unchallenged past the deadline: the claim is now authoritative.
            let state = dispute.claim.state;
            record.concluded = Some(state);
            record.dispute = None;
            tracing::info!(channel = ?channel, version = state.version(), "dispute finalized");
            let _ = events.send(AdjudicatorEvent::Concluded { channel, state });
        });
    }
}

#[async_trait]
impl Adjudicator for LocalAdjudicator {
    async fn deposit(
        &self,
        params: &Params,
        initial: &State,
        part_idx: PartIdx,
        amount: U256,
    ) -> Result<()> {
        let channel = params.channel_id();
        if initial.channel_id() != channel || initial.version() != 0 {
            return Err(ValidationError::UnknownChannel.into());
        }

        let mut channels = self.inner.channels.lock().await;
        let record = channels.entry(channel).or_insert_with(|| Record {
            params: *params,
            target: initial.balances,
            deposits: [U256::zero(); PARTICIPANTS],
            funded: false,
            dispute: None,
            round: 0,
            concluded: None,
            withdrawn: [false; PARTICIPANTS],
        });
        record.deposits[part_idx] = record.deposits[part_idx] + amount;

        if !record.funded
            && (0..PARTICIPANTS).all(|i| record.deposits[i] >= record.target[i])
        {
            record.funded = true;
            drop(channels);
            self.emit(AdjudicatorEvent::Funded { channel });
        }
        Ok(())
    }

    async fn register(&self, params: &Params, proof: DisputeProof) -> Result<()> {
        let channel = params.channel_id();
        let mut channels = self.inner.channels.lock().await;
        let record = channels
            .get_mut(&channel)
            .ok_or(ValidationError::UnknownChannel)?;

        if record.concluded.is_some() {
            return Err(ValidationError::NotConcludable.into());
        }

        // The anchor must be fully endorsed.
        if proof.anchor.state.channel_id() != channel
            || !proof.anchor.satisfies(&record.params, SignerSet::Both)
        {
            return Err(ValidationError::Transition(
                app::TransitionError::NoSuchTransition,
            )
            .into());
        }

        // The claim must be a valid forced progression from the anchor,
        // carrying the signatures its transition demands. This is the same
        // rule set the participants evaluate off-chain.
        let transition = app::valid_transition(
            &record.params,
            &proof.anchor.state,
            &proof.claim.state,
            proof.actor,
        )
        .map_err(ValidationError::Transition)?;
        if !proof.claim.satisfies(&record.params, transition.required_signers) {
            return Err(ValidationError::InvalidSignature(
                record.params.participants[proof.actor],
            )
            .into());
        }

        if let Some(existing) = &record.dispute {
            if existing.claim.state == proof.claim.state {
                return Ok(()); // re-registration of the same claim
            }
            if proof.claim.state.version() <= existing.claim.state.version() {
                return Err(ValidationError::DisputePending.into());
            }
        }

        let version = proof.claim.state.version();
        record.dispute = Some(Dispute {
            claim: proof.claim,
            actor: proof.actor,
        });
        record.round += 1;
        let round = record.round;
        let secs = record.params.challenge_duration;
        drop(channels);

        tracing::info!(channel = ?channel, version, "dispute registered");
        self.emit(AdjudicatorEvent::Registered { channel, version });
        self.spawn_challenge_timer(channel, round, version, secs);
        Ok(())
    }

    async fn refute(&self, params: &Params, newer: SignedState) -> Result<()> {
        let channel = params.channel_id();
        let mut channels = self.inner.channels.lock().await;
        let record = channels
            .get_mut(&channel)
            .ok_or(ValidationError::UnknownChannel)?;

        if record.concluded.is_some() {
            return Err(ValidationError::NotConcludable.into());
        }
        let dispute = record
            .dispute
            .as_ref()
            .ok_or(ValidationError::DisputePending)?;

        if newer.state.channel_id() != channel
            || newer.state.version() <= dispute.claim.state.version()
            || !newer.satisfies(&record.params, SignerSet::Both)
        {
            return Err(ValidationError::Transition(
                app::TransitionError::VersionMismatch {
                    expected: dispute.claim.state.version() + 1,
                    actual: newer.state.version(),
                },
            )
            .into());
        }

        let version = newer.state.version();
        record.dispute = None;
        record.round += 1;
        drop(channels);

        tracing::info!(channel = ?channel, version, "dispute refuted");
        self.emit(AdjudicatorEvent::Refuted { channel, version });
        Ok(())
    }

    async fn conclude(&self, params: &Params, finals: SignedState) -> Result<()> {
        let channel = params.channel_id();
        let mut channels = self.inner.channels.lock().await;
        let record = channels
            .get_mut(&channel)
            .ok_or(ValidationError::UnknownChannel)?;

        if let Some(existing) = record.concluded {
            if existing == finals.state {
                return Ok(()); // idempotent
            }
            return Err(ValidationError::NotConcludable.into());
        }
        if record.dispute.is_some() {
            return Err(ValidationError::DisputePending.into());
        }
        if finals.state.channel_id() != channel
            || !finals.state.is_final
            || !finals.satisfies(&record.params, SignerSet::Both)
        {
            return Err(ValidationError::Transition(
                app::TransitionError::FinalStateNotIdle,
            )
            .into());
        }

        let state = finals.state;
        record.concluded = Some(state);
        record.round += 1;
        drop(channels);

        tracing::info!(channel = ?channel, version = state.version(), "channel concluded");
        self.emit(AdjudicatorEvent::Concluded { channel, state });
        Ok(())
    }

    async fn query_final(&self, channel: Hash) -> Result<Option<State>> {
        let channels = self.inner.channels.lock().await;
        Ok(channels.get(&channel).and_then(|r| r.concluded))
    }

    async fn withdraw(&self, channel: Hash, part_idx: PartIdx) -> Result<U256> {
        let mut channels = self.inner.channels.lock().await;
        let record = channels
            .get_mut(&channel)
            .ok_or(ValidationError::UnknownChannel)?;

        let state = record.concluded.ok_or(ValidationError::NotConcludable)?;
        if record.withdrawn[part_idx] {
            return Err(ValidationError::AlreadyWithdrawn.into());
        }
        record.withdrawn[part_idx] = true;
        Ok(state.balances[part_idx])
    }

    fn subscribe(&self) -> broadcast::Receiver<AdjudicatorEvent> {
        self.events.subscribe()
    }
}
