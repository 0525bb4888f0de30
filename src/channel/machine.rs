//! The per-channel actor task.
//!
//! One task owns each channel's signed-state chain and serializes all
//! negotiation: commands from the local handles, messages from the peer and
//! events from the adjudicator are processed one at a time, so there is at
//! most one pending proposal and no interleaving of partial updates.
//!
//! The task never trusts the peer: every inbound state is checked against
//! [crate::app::valid_transition] and every signature is verified by
//! recovery before anything is committed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::adjudicator::{with_backoff, Adjudicator, AdjudicatorEvent, DisputeProof};
use crate::app::{self, AppState, Transition, TransitionError};
use crate::channel::state::{Params, PartIdx, SignedState, State};
use crate::channel::Phase;
use crate::error::{Error, Result, ValidationError};
use crate::messages::{Message, UpdateAccepted, UpdateProposal, UpdateRejected};
use crate::sig::{self, Signer};
use crate::types::{Address, Hash, Signature, U256};
use crate::wire::Bus;

/// Queued credential requests an issuer has not picked up yet.
const REQUEST_QUEUE: usize = 16;
const COMMAND_BUFFER: usize = 16;
const PEER_BUFFER: usize = 64;

/// Commands the channel handles send to the actor.
pub(crate) enum Command {
    RequestCredential {
        doc_hash: Hash,
        price: U256,
        resp: oneshot::Sender<Result<oneshot::Receiver<Result<Offer>>>>,
    },
    AcceptCredential {
        offer_version: u64,
        resp: oneshot::Sender<Result<()>>,
    },
    RejectCredential {
        offer_version: u64,
        reason: String,
        resp: oneshot::Sender<Result<()>>,
    },
    IssueCredential {
        request_version: u64,
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

/// A credential offer as it leaves the actor: the issuer-signed `Issued`
/// state reduced to what the holder's handle needs.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Offer {
    pub version: u64,
    pub doc_hash: Hash,
    pub price: U256,
    pub cred_sig: Signature,
}

/// An inbound credential request, queued for `next_credential_request`.
#[derive(Debug, Clone, Copy)]
pub struct CredentialRequestInfo {
    pub(crate) version: u64,
    pub(crate) doc_hash: Hash,
    pub(crate) price: U256,
    pub(crate) requester: PartIdx,
}

/// Who gets told how a pending proposal ended.
enum Responder {
    /// Nobody waits; the outcome only moves the state chain.
    None,
    /// A single command caller.
    Done(oneshot::Sender<Result<()>>),
    /// Failure goes to the credential waiter; success keeps it waiting for
    /// the issuer's offer.
    Offer,
    /// Success continues into settlement; failure goes to the close waiters.
    Settle,
}

struct PendingUpdate {
    signed: SignedState,
    kind: Transition,
    responder: Responder,
    deadline: Instant,
    /// Whether an unanswered or rejected proposal escalates to a dispute
    /// instead of surfacing a failure. True exactly for `Issue`.
    escalate: bool,
}

struct StoredOffer {
    signed: SignedState,
    price: U256,
    requester: PartIdx,
}

pub(crate) struct MachineConfig {
    pub params: Params,
    pub me: PartIdx,
    pub signer: Signer,
    pub bus: Arc<dyn Bus>,
    pub adjudicator: Arc<dyn Adjudicator>,
    pub response_timeout: Duration,
    /// Version-0 state with at least our own signature.
    pub initial: SignedState,
}

pub(crate) struct MachineHandles {
    pub commands: mpsc::Sender<Command>,
    pub phase: watch::Receiver<Phase>,
    pub requests: mpsc::Receiver<CredentialRequestInfo>,
    /// Inbox the client router forwards this channel's messages into.
    pub peer_inbox: mpsc::Sender<(Address, Message)>,
}

/// Spawn the actor task for one channel.
pub(crate) fn spawn(cfg: MachineConfig) -> MachineHandles {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (peer_tx, peer_rx) = mpsc::channel(PEER_BUFFER);
    let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE);
    let (phase_tx, phase_rx) = watch::channel(Phase::Proposed);
    let events = cfg.adjudicator.subscribe();

    let machine = Machine {
        channel_id: cfg.params.channel_id(),
        params: cfg.params,
        me: cfg.me,
        signer: cfg.signer,
        bus: cfg.bus,
        adjudicator: cfg.adjudicator,
        response_timeout: cfg.response_timeout,
        current: cfg.initial,
        funded: false,
        phase: phase_tx,
        pending: None,
        offer: None,
        offer_waiter: None,
        claim: None,
        requests: request_tx,
        adjudicated: None,
        close_waiters: Vec::new(),
        settled: false,
    };
    tokio::spawn(machine.run(cmd_rx, peer_rx, events));

    MachineHandles {
        commands: cmd_tx,
        phase: phase_rx,
        requests: request_rx,
        peer_inbox: peer_tx,
    }
}

struct Machine {
    channel_id: Hash,
    params: Params,
    me: PartIdx,
    signer: Signer,
    bus: Arc<dyn Bus>,
    adjudicator: Arc<dyn Adjudicator>,
    response_timeout: Duration,

    /// Newest state endorsed as far as its transition requires. Everything
    /// the actor proposes builds on this.
    current: SignedState,
    funded: bool,
    phase: watch::Sender<Phase>,
    pending: Option<PendingUpdate>,
    /// Inbound issuer-signed `Issued` state awaiting the holder's decision.
    offer: Option<StoredOffer>,
    offer_waiter: Option<oneshot::Sender<Result<Offer>>>,
    /// Our own issuer-signed `Issued` state, kept as dispute evidence until
    /// the holder responds.
    claim: Option<SignedState>,
    requests: mpsc::Sender<CredentialRequestInfo>,
    /// Final state adopted from an adjudicator conclusion.
    adjudicated: Option<State>,
    close_waiters: Vec<oneshot::Sender<Result<()>>>,
    settled: bool,
}

impl Machine {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut peer_rx: mpsc::Receiver<(Address, Message)>,
        mut events: broadcast::Receiver<AdjudicatorEvent>,
    ) {
        let mut cmd_open = true;
        loop {
            let deadline = self.pending.as_ref().map(|p| p.deadline);
            tokio::select! {
                cmd = cmd_rx.recv(), if cmd_open => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => cmd_open = false,
                },
                msg = peer_rx.recv() => match msg {
                    Some((from, msg)) => self.handle_message(from, msg).await,
                    None => break,
                },
                ev = events.recv() => match ev {
                    Ok(ev) => self.handle_event(ev).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(channel = ?self.channel_id, skipped = n, "lagged behind adjudicator events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = expire(deadline) => self.handle_deadline().await,
            }
            if !cmd_open && self.phase() == Phase::Closed {
                break;
            }
        }
        tracing::debug!(channel = ?self.channel_id, "channel task stopped");
    }

    fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase() != phase {
            tracing::info!(channel = ?self.channel_id, ?phase, "phase change");
            self.phase.send_replace(phase);
        }
    }

    fn other(&self) -> PartIdx {
        self.params.other(self.me)
    }

    fn busy(&self) -> bool {
        self.pending.is_some() || self.offer.is_some()
    }

    /// `Proposed -> Open` once both the version-0 co-signature and the
    /// funding confirmation are in, in whichever order they arrive.
    fn maybe_open(&mut self) {
        if self.phase() == Phase::Proposed && self.funded && self.current.is_cosigned() {
            self.set_phase(Phase::Open);
        }
    }

    async fn send(&self, msg: Message) -> Result<()> {
        let peer = self.params.participants[self.other()];
        self.bus.send(peer, msg).await.map_err(Error::from)
    }

    fn commit(&mut self, signed: SignedState) {
        tracing::debug!(
            channel = ?self.channel_id,
            version = signed.state.version(),
            "state committed"
        );
        self.current = signed;
    }

    fn resolve_failure(&mut self, pending: PendingUpdate, err: Error) {
        match pending.responder {
            Responder::None => {}
            Responder::Done(tx) => {
                let _ = tx.send(Err(err));
            }
            Responder::Offer => {
                if let Some(tx) = self.offer_waiter.take() {
                    let _ = tx.send(Err(err));
                }
            }
            Responder::Settle => self.fail_close_waiters(err),
        }
    }

    fn fail_close_waiters(&mut self, err: Error) {
        for tx in self.close_waiters.drain(..) {
            let _ = tx.send(Err(err.clone()));
        }
    }

    // ---- commands ----------------------------------------------------

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::RequestCredential {
                doc_hash,
                price,
                resp,
            } => {
                let _ = resp.send(self.request_credential(doc_hash, price).await);
            }
            Command::AcceptCredential {
                offer_version,
                resp,
            } => {
                if let Err(e) = self.resolve_offer(offer_version, true, resp).await {
                    tracing::debug!(channel = ?self.channel_id, error = %e, "accept failed");
                }
            }
            Command::RejectCredential {
                offer_version,
                reason,
                resp,
            } => {
                tracing::debug!(channel = ?self.channel_id, %reason, "rejecting credential offer");
                if let Err(e) = self.resolve_offer(offer_version, false, resp).await {
                    tracing::debug!(channel = ?self.channel_id, error = %e, "reject failed");
                }
            }
            Command::IssueCredential {
                request_version,
                resp,
            } => {
                let _ = resp.send(self.issue_credential(request_version).await);
            }
            Command::Close { resp } => self.close(resp).await,
        }
    }

    async fn request_credential(
        &mut self,
        doc_hash: Hash,
        price: U256,
    ) -> Result<oneshot::Receiver<Result<Offer>>> {
        if self.phase() != Phase::Open {
            return Err(ValidationError::NotOpen.into());
        }
        if self.busy() || !self.current.state.app.is_idle() {
            return Err(ValidationError::UpdateInProgress.into());
        }

        let mut next = self.current.state.make_next_state();
        next.app = AppState::Requested {
            doc_hash,
            price,
            requester: self.me,
        };
        let (tx, rx) = oneshot::channel();
        self.offer_waiter = Some(tx);
        self.propose(next, Transition::Request, Responder::Offer, false)
            .await?;
        Ok(rx)
    }

    /// Answer a stored offer: accept keeps the issued balances, reject
    /// restores the pre-issue split. Either way the response is a fresh
    /// proposal built on top of the issuer's un-countersigned state.
    async fn resolve_offer(
        &mut self,
        offer_version: u64,
        accept: bool,
        resp: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        let (base, price, requester) = match &self.offer {
            Some(o) if o.signed.state.version() == offer_version => {
                (o.signed.state, o.price, o.requester)
            }
            _ => {
                let _ = resp.send(Err(ValidationError::NoPendingOffer(offer_version).into()));
                return Ok(());
            }
        };
        if self.pending.is_some() {
            let _ = resp.send(Err(ValidationError::UpdateInProgress.into()));
            return Ok(());
        }

        let mut next = base.make_next_state();
        next.app = AppState::Idle;
        let kind = if accept {
            Transition::Accept
        } else {
            let issuer = app::issuer_of(requester);
            next.balances[requester] = next.balances[requester] + price;
            next.balances[issuer] = next.balances[issuer] - price;
            Transition::Reject
        };
        // propose resolves resp itself on transport failure.
        self.propose(next, kind, Responder::Done(resp), false).await
    }

    async fn issue_credential(&mut self, request_version: u64) -> Result<()> {
        if self.phase() != Phase::Open {
            return Err(ValidationError::NotOpen.into());
        }
        if self.busy() {
            return Err(ValidationError::UpdateInProgress.into());
        }
        let (doc_hash, price, requester) = match self.current.state.app {
            AppState::Requested {
                doc_hash,
                price,
                requester,
            } if self.current.state.version() == request_version => (doc_hash, price, requester),
            _ => return Err(ValidationError::AlreadyIssued.into()),
        };
        if requester == self.me {
            return Err(ValidationError::AlreadyIssued.into());
        }

        // Rule 2 lets a requester ask for more than it holds; the transfer
        // only has to be payable now, at issuance.
        let paid = self.current.state.balances[requester]
            .checked_sub(price)
            .ok_or(ValidationError::from(TransitionError::InsufficientFunds))?;

        let cred_sig = self
            .signer
            .sign(app::credential_payload(self.channel_id, doc_hash, price));
        let mut next = self.current.state.make_next_state();
        next.app = AppState::Issued {
            doc_hash,
            price,
            requester,
            cred_sig,
        };
        next.balances[requester] = paid;
        next.balances[self.me] = next.balances[self.me] + price;

        // The proposal is complete with our signature alone; keep it as
        // dispute evidence until the requester responds.
        self.propose(next, Transition::Issue, Responder::None, true)
            .await
    }

    /// Sign `next`, send it to the peer and arm the response deadline. On
    /// transport failure the responder is resolved with the error.
    async fn propose(
        &mut self,
        next: State,
        kind: Transition,
        responder: Responder,
        escalate: bool,
    ) -> Result<()> {
        let sig = self.signer.sign(next.hash());
        let signed = SignedState::with_sig(next, self.me, sig);
        if let Err(e) = self
            .send(Message::Update(UpdateProposal {
                channel_id: self.channel_id,
                state: next,
                actor: self.me,
                sig,
            }))
            .await
        {
            self.resolve_failure(
                PendingUpdate {
                    signed,
                    kind,
                    responder,
                    deadline: Instant::now(),
                    escalate: false,
                },
                e.clone(),
            );
            return Err(e);
        }

        if kind == Transition::Issue {
            self.claim = Some(signed);
        }
        self.pending = Some(PendingUpdate {
            signed,
            kind,
            responder,
            deadline: Instant::now() + self.response_timeout,
            escalate,
        });
        tracing::debug!(
            channel = ?self.channel_id,
            version = next.version(),
            ?kind,
            "update proposed"
        );
        Ok(())
    }

    async fn close(&mut self, resp: oneshot::Sender<Result<()>>) {
        match self.phase() {
            Phase::Closed => {
                let _ = resp.send(Ok(()));
            }
            Phase::Proposed => {
                let _ = resp.send(Err(ValidationError::NotOpen.into()));
            }
            Phase::Disputed => {
                // Settlement resumes when the dispute concludes.
                self.close_waiters.push(resp);
            }
            Phase::Concludable => {
                self.close_waiters.push(resp);
                self.settle().await;
            }
            Phase::Open => {
                if self.current.state.is_final {
                    self.close_waiters.push(resp);
                    self.settle().await;
                    return;
                }
                if self.busy() || !self.current.state.app.is_idle() {
                    let _ = resp.send(Err(ValidationError::UpdateInProgress.into()));
                    return;
                }
                let mut next = self.current.state.make_next_state();
                next.is_final = true;
                self.close_waiters.push(resp);
                if let Err(e) = self
                    .propose(next, Transition::Finalize, Responder::Settle, false)
                    .await
                {
                    self.fail_close_waiters(e);
                }
            }
        }
    }

    // ---- peer messages -----------------------------------------------

    async fn handle_message(&mut self, from: Address, msg: Message) {
        if from != self.params.participants[self.other()] {
            tracing::warn!(channel = ?self.channel_id, ?from, "message from non-participant dropped");
            return;
        }
        match msg {
            Message::Update(update) => self.handle_update(update).await,
            Message::UpdateAccepted(acc) => self.handle_update_accepted(acc).await,
            Message::UpdateRejected(rej) => self.handle_update_rejected(rej).await,
            other => {
                tracing::warn!(channel = ?self.channel_id, ?other, "unexpected message for channel");
            }
        }
    }

    async fn handle_update(&mut self, update: UpdateProposal) {
        let state = update.state;
        let version = state.version();

        // Re-delivery of a state we already endorsed: repeat the ack.
        if state == self.current.state && self.current.is_cosigned() {
            if let Some(sig) = self.current.sig(self.me) {
                let _ = self
                    .send(Message::UpdateAccepted(UpdateAccepted {
                        channel_id: self.channel_id,
                        version,
                        sig,
                    }))
                    .await;
            }
            return;
        }

        if update.actor != self.other()
            || !sig::verify(state.hash(), update.sig, self.params.participants[update.actor])
        {
            self.decline(version, "signature does not verify".into()).await;
            return;
        }

        // A response transition builds on our own pending issuance instead
        // of the last co-signed state; everything else requires us idle.
        let base = match &self.pending {
            Some(p) if p.kind == Transition::Issue && version == p.signed.state.version() + 1 => {
                p.signed.state
            }
            Some(_) => {
                self.decline(version, "another update is in progress".into())
                    .await;
                return;
            }
            None if self.offer.is_some() => {
                self.decline(version, "a credential offer is pending".into())
                    .await;
                return;
            }
            None => self.current.state,
        };

        let transition = match app::valid_transition(&self.params, &base, &state, update.actor) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(channel = ?self.channel_id, version, error = %e, "invalid inbound update");
                self.decline(version, e.to_string()).await;
                return;
            }
        };

        match transition.kind {
            // The peer asks for a credential; co-sign and queue it.
            Transition::Request => {
                let permit = match self.requests.clone().try_reserve_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        self.decline(version, "too many queued requests".into()).await;
                        return;
                    }
                };
                let info = match state.app {
                    AppState::Requested {
                        doc_hash,
                        price,
                        requester,
                    } => CredentialRequestInfo {
                        version,
                        doc_hash,
                        price,
                        requester,
                    },
                    _ => unreachable!("Request transition ends in Requested"),
                };
                self.countersign(state, update.sig).await;
                permit.send(info);
            }

            // The issuer delivers the credential; hold it for the local
            // decision instead of countersigning.
            Transition::Issue => {
                let (doc_hash, price, requester, cred_sig) = match state.app {
                    AppState::Issued {
                        doc_hash,
                        price,
                        requester,
                        cred_sig,
                    } => (doc_hash, price, requester, cred_sig),
                    _ => unreachable!("Issue transition ends in Issued"),
                };
                self.offer = Some(StoredOffer {
                    signed: SignedState::with_sig(state, update.actor, update.sig),
                    price,
                    requester,
                });
                if let Some(tx) = self.offer_waiter.take() {
                    let _ = tx.send(Ok(Offer {
                        version,
                        doc_hash,
                        price,
                        cred_sig,
                    }));
                } else {
                    tracing::warn!(channel = ?self.channel_id, version, "unsolicited credential issuance held");
                }
            }

            // The holder settles our issuance in our favor.
            Transition::Accept => {
                self.countersign(state, update.sig).await;
                self.pending = None;
                self.claim = None;
            }

            // The holder tries to take the credential back. The signature
            // we hold says otherwise; decline and let the chain enforce it.
            Transition::Reject => {
                self.decline(version, "credential was issued; the payment stands".into())
                    .await;
                self.pending = None;
                self.register_dispute().await;
            }

            Transition::Finalize => {
                match self.pending.take() {
                    // Symmetric close: both sides proposed the identical
                    // final state. Merge instead of declining.
                    Some(p) if p.kind == Transition::Finalize && p.signed.state == state => {
                        let mut signed = p.signed;
                        signed.put_sig(update.actor, update.sig);
                        let my_sig = signed.sig(self.me);
                        self.commit(signed);
                        if let Some(sig) = my_sig {
                            let _ = self
                                .send(Message::UpdateAccepted(UpdateAccepted {
                                    channel_id: self.channel_id,
                                    version,
                                    sig,
                                }))
                                .await;
                        }
                        self.set_phase(Phase::Concludable);
                        if !self.close_waiters.is_empty() {
                            self.settle().await;
                        }
                    }
                    Some(p) => {
                        self.pending = Some(p);
                        self.decline(version, "another update is in progress".into())
                            .await;
                    }
                    None => {
                        self.countersign(state, update.sig).await;
                        self.set_phase(Phase::Concludable);
                    }
                }
            }
        }
    }

    /// Endorse an inbound state: commit it with both signatures and ack.
    async fn countersign(&mut self, state: State, peer_sig: Signature) {
        let my_sig = self.signer.sign(state.hash());
        let mut signed = SignedState::with_sig(state, self.other(), peer_sig);
        signed.put_sig(self.me, my_sig);
        self.commit(signed);
        let _ = self
            .send(Message::UpdateAccepted(UpdateAccepted {
                channel_id: self.channel_id,
                version: state.version(),
                sig: my_sig,
            }))
            .await;
    }

    async fn decline(&mut self, version: u64, reason: String) {
        let _ = self
            .send(Message::UpdateRejected(UpdateRejected {
                channel_id: self.channel_id,
                version,
                reason,
            }))
            .await;
    }

    async fn handle_update_accepted(&mut self, acc: UpdateAccepted) {
        // Version-0 countersignature completing the opening handshake.
        if acc.version == 0 && self.phase() == Phase::Proposed && !self.current.is_cosigned() {
            let hash = self.current.state.hash();
            if sig::verify(hash, acc.sig, self.params.participants[self.other()]) {
                self.current.put_sig(self.other(), acc.sig);
                self.maybe_open();
            } else {
                tracing::warn!(channel = ?self.channel_id, "invalid opening countersignature");
            }
            return;
        }

        let awaited = matches!(&self.pending, Some(p) if p.signed.state.version() == acc.version);
        if !awaited {
            tracing::debug!(channel = ?self.channel_id, version = acc.version, "stale acceptance ignored");
            return;
        }
        let pending = self.pending.take().expect("pending checked above");
        if !sig::verify(
            pending.signed.state.hash(),
            acc.sig,
            self.params.participants[self.other()],
        ) {
            tracing::warn!(channel = ?self.channel_id, version = acc.version, "invalid countersignature");
            self.pending = Some(pending);
            return;
        }

        let mut signed = pending.signed;
        signed.put_sig(self.other(), acc.sig);
        self.commit(signed);
        if pending.kind == Transition::Accept || pending.kind == Transition::Reject {
            self.offer = None;
        }

        match pending.responder {
            Responder::None | Responder::Offer => {}
            Responder::Done(tx) => {
                let _ = tx.send(Ok(()));
            }
            Responder::Settle => {
                self.set_phase(Phase::Concludable);
                self.settle().await;
            }
        }
    }

    async fn handle_update_rejected(&mut self, rej: UpdateRejected) {
        let awaited = matches!(&self.pending, Some(p) if p.signed.state.version() == rej.version);
        if !awaited {
            return;
        }
        let pending = self.pending.take().expect("pending checked above");
        tracing::debug!(
            channel = ?self.channel_id,
            version = rej.version,
            reason = %rej.reason,
            "update declined by peer"
        );
        if pending.escalate {
            self.register_dispute().await;
        } else {
            self.resolve_failure(pending, Error::Declined { reason: rej.reason });
        }
    }

    async fn handle_deadline(&mut self) {
        let pending = match self.pending.take() {
            Some(p) => p,
            None => return,
        };
        tracing::warn!(
            channel = ?self.channel_id,
            version = pending.signed.state.version(),
            "peer response timed out"
        );
        if pending.escalate {
            self.register_dispute().await;
        } else {
            self.resolve_failure(pending, Error::Timeout);
        }
    }

    // ---- adjudicator -------------------------------------------------

    async fn handle_event(&mut self, ev: AdjudicatorEvent) {
        if ev.channel() != self.channel_id || self.settled {
            return;
        }
        match ev {
            AdjudicatorEvent::Funded { .. } => {
                self.funded = true;
                self.maybe_open();
            }
            AdjudicatorEvent::Registered { version, .. } => {
                self.set_phase(Phase::Disputed);
                // A stale dispute is overturned with our newer co-signed
                // state; a dispute we cannot beat just runs its clock.
                if self.current.is_cosigned() && self.current.state.version() > version {
                    let params = self.params;
                    let newer = self.current;
                    let adjudicator = Arc::clone(&self.adjudicator);
                    if let Err(e) =
                        with_backoff("refute dispute", || adjudicator.refute(&params, newer)).await
                    {
                        tracing::error!(channel = ?self.channel_id, error = %e, "refutation failed");
                    }
                }
            }
            AdjudicatorEvent::Refuted { .. } => {
                if self.phase() == Phase::Disputed {
                    let phase = if self.current.state.is_final {
                        Phase::Concludable
                    } else {
                        Phase::Open
                    };
                    self.set_phase(phase);
                }
            }
            AdjudicatorEvent::Concluded { state, .. } => {
                self.adjudicated = Some(state);
                if let Some(pending) = self.pending.take() {
                    self.resolve_failure(pending, Error::ChannelClosed);
                }
                if let Some(tx) = self.offer_waiter.take() {
                    let _ = tx.send(Err(Error::ChannelClosed));
                }
                self.offer = None;
                self.set_phase(Phase::Concludable);
                if !self.close_waiters.is_empty() {
                    self.settle().await;
                }
            }
        }
    }

    async fn register_dispute(&mut self) {
        let claim = match self.claim {
            Some(c) => c,
            None => {
                tracing::error!(channel = ?self.channel_id, "no claim to register");
                return;
            }
        };
        let proof = DisputeProof {
            anchor: self.current,
            claim,
            actor: self.me,
        };
        self.set_phase(Phase::Disputed);
        tracing::info!(
            channel = ?self.channel_id,
            version = claim.state.version(),
            "escalating to on-chain dispute"
        );
        let params = self.params;
        let adjudicator = Arc::clone(&self.adjudicator);
        if let Err(e) = with_backoff("register dispute", || adjudicator.register(&params, proof)).await
        {
            tracing::error!(channel = ?self.channel_id, error = %e, "dispute registration failed");
        }
    }

    /// Drive conclude + withdraw and resolve everyone waiting on close.
    async fn settle(&mut self) {
        if self.settled {
            for tx in self.close_waiters.drain(..) {
                let _ = tx.send(Ok(()));
            }
            return;
        }

        let params = self.params;
        let adjudicator = Arc::clone(&self.adjudicator);

        // An adjudicated conclusion already happened on-chain; only a
        // cooperative close still needs the conclude call.
        if self.adjudicated.is_none() {
            let finals = self.current;
            if let Err(e) = with_backoff("conclude", || adjudicator.conclude(&params, finals)).await
            {
                tracing::error!(channel = ?self.channel_id, error = %e, "conclude failed");
                self.fail_close_waiters(e);
                return;
            }
        }

        let me = self.me;
        let channel = self.channel_id;
        let amount = match with_backoff("withdraw", || adjudicator.withdraw(channel, me)).await {
            Ok(a) => a,
            Err(e) => {
                tracing::error!(channel = ?self.channel_id, error = %e, "withdraw failed");
                self.fail_close_waiters(e);
                return;
            }
        };
        tracing::info!(channel = ?self.channel_id, %amount, "withdrawn, channel closed");

        self.settled = true;
        self.set_phase(Phase::Closed);
        for tx in self.close_waiters.drain(..) {
            let _ = tx.send(Ok(()));
        }
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adjudicator::LocalAdjudicator;
    use crate::encode;
    use crate::wire::Network;
    use rand::{rngs::StdRng, SeedableRng};

    struct Side {
        commands: mpsc::Sender<Command>,
        phase: watch::Receiver<Phase>,
        requests: mpsc::Receiver<CredentialRequestInfo>,
    }

    /// Two funded machines wired directly over an in-memory network,
    /// starting from a co-signed version-0 state `[10, 0]`.
    async fn funded_pair() -> (Side, Side) {
        let net = Network::new();
        let adjudicator = Arc::new(LocalAdjudicator::new());
        let mut rng = StdRng::seed_from_u64(21);
        let holder = Signer::new(&mut rng);
        let issuer = Signer::new(&mut rng);
        let params = Params {
            challenge_duration: 60,
            nonce: U256::from(7u64),
            participants: [holder.address(), issuer.address()],
        };
        let balances = [U256::from(10u64), U256::zero()];
        let initial = State::new(&params, balances);
        let mut signed = SignedState::with_sig(initial, 0, holder.sign(initial.hash()));
        signed.put_sig(1, issuer.sign(initial.hash()));

        let mut sides = Vec::new();
        for (idx, signer) in [holder, issuer].into_iter().enumerate() {
            let (bus, mut rx) = net.endpoint(signer.address()).await;
            let handles = spawn(MachineConfig {
                params,
                me: idx,
                signer,
                bus: Arc::new(bus),
                adjudicator: Arc::clone(&adjudicator) as Arc<dyn Adjudicator>,
                response_timeout: Duration::from_secs(10),
                initial: signed,
            });
            let inbox = handles.peer_inbox.clone();
            tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    if inbox.send(msg).await.is_err() {
                        break;
                    }
                }
            });
            sides.push(Side {
                commands: handles.commands,
                phase: handles.phase,
                requests: handles.requests,
            });
        }
        for idx in 0..2 {
            adjudicator
                .deposit(&params, &initial, idx, balances[idx])
                .await
                .unwrap();
        }
        let issuer_side = sides.pop().unwrap();
        (sides.pop().unwrap(), issuer_side)
    }

    async fn issue(commands: &mpsc::Sender<Command>, request_version: u64) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        commands
            .send(Command::IssueCredential {
                request_version,
                resp: tx,
            })
            .await
            .unwrap();
        rx.await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn issuance_succeeds_at_most_once_per_request() {
        let (mut holder, mut issuer) = funded_pair().await;
        holder.phase.wait_for(|p| *p == Phase::Open).await.unwrap();

        let (tx, rx) = oneshot::channel();
        holder
            .commands
            .send(Command::RequestCredential {
                doc_hash: encode::hash_bytes(b"doc"),
                price: U256::from(3u64),
                resp: tx,
            })
            .await
            .unwrap();
        let offer_rx = rx.await.unwrap().unwrap();
        let request = issuer.requests.recv().await.unwrap();

        issue(&issuer.commands, request.version).await.unwrap();
        // The first issuance still awaits the holder's countersignature;
        // there is no room for a second proposal.
        let err = issue(&issuer.commands, request.version).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::UpdateInProgress)
        ));

        let offer = offer_rx.await.unwrap().unwrap();
        let (tx, rx) = oneshot::channel();
        holder
            .commands
            .send(Command::AcceptCredential {
                offer_version: offer.version,
                resp: tx,
            })
            .await
            .unwrap();
        rx.await.unwrap().unwrap();

        // The request is answered and committed; reissuing against its
        // version fails instead of charging the holder twice.
        let err = issue(&issuer.commands, request.version).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::AlreadyIssued)
        ));
    }
}
