//! Client and session layer: channel opening and message routing.
//!
//! A [Client] owns one transport endpoint and one adjudicator connection.
//! Its router task demultiplexes inbound messages: channel proposals go to
//! [Client::next_channel_request], proposal answers to the `open_channel`
//! call that is waiting for them, and everything else to the actor task of
//! the channel it names.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::adjudicator::{with_backoff, Adjudicator};
use crate::channel::machine::{self, MachineConfig};
use crate::channel::state::{Balances, Params, PartIdx, SignedState, State};
use crate::channel::{Channel, Phase};
use crate::encode;
use crate::error::{Error, Result, ValidationError};
use crate::messages::{ChannelProposal, Message, ProposalAccepted, UpdateAccepted};
use crate::sig::{self, Signer};
use crate::types::{Address, Hash, U256};
use crate::wire::Bus;

const PROPOSAL_QUEUE: usize = 16;

/// Client configuration. Explicit everywhere a channel inherits it, so two
/// clients with different settings still agree on every channel they share
/// (the proposal carries the binding values).
#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    /// On-chain challenge duration written into proposed channels.
    pub challenge_duration: Duration,
    /// How long to wait for a peer's answer before timing out (and, for an
    /// issuance, before escalating to a dispute).
    pub response_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            challenge_duration: Duration::from_secs(60),
            response_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Default)]
struct Routes {
    /// Per-channel actor inboxes.
    channels: HashMap<Hash, mpsc::Sender<(Address, Message)>>,
    /// `open_channel` calls waiting for the peer's answer, by proposal id.
    proposals: HashMap<Hash, oneshot::Sender<std::result::Result<ProposalAccepted, String>>>,
}

/// One protocol participant: identity, transport, adjudicator access and
/// all channels opened through it.
pub struct Client {
    config: ClientConfig,
    signer: Signer,
    bus: Arc<dyn Bus>,
    adjudicator: Arc<dyn Adjudicator>,
    routes: Arc<Mutex<Routes>>,
    incoming: Mutex<mpsc::Receiver<(Address, ChannelProposal)>>,
}

impl Client {
    /// Create a client over an attached transport endpoint and spawn its
    /// router task.
    pub fn new(
        config: ClientConfig,
        signer: Signer,
        bus: Arc<dyn Bus>,
        inbox: mpsc::Receiver<(Address, Message)>,
        adjudicator: Arc<dyn Adjudicator>,
    ) -> Self {
        let routes = Arc::new(Mutex::new(Routes::default()));
        let (incoming_tx, incoming_rx) = mpsc::channel(PROPOSAL_QUEUE);
        tokio::spawn(route(inbox, Arc::clone(&routes), incoming_tx));

        Client {
            config,
            signer,
            bus,
            adjudicator,
            routes,
            incoming: Mutex::new(incoming_rx),
        }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Propose a channel to `peer` with the given initial balances
    /// (`[ours, theirs]`) and wait until it is co-signed and funded.
    pub async fn open_channel(&self, peer: Address, balances: Balances) -> Result<Channel> {
        let me = self.signer.address();
        let (proposal_id, nonce_share) = {
            let mut rng = rand::thread_rng();
            (rng.gen::<Hash>(), rng.gen::<U256>())
        };

        let (tx, rx) = oneshot::channel();
        self.routes.lock().await.proposals.insert(proposal_id, tx);

        let proposal = ChannelProposal {
            proposal_id,
            challenge_duration: self.config.challenge_duration.as_secs(),
            nonce_share,
            proposer: me,
            balances,
        };
        tracing::debug!(?peer, ?proposal_id, "proposing channel");
        if let Err(e) = self.bus.send(peer, Message::ChannelProposal(proposal)).await {
            self.routes.lock().await.proposals.remove(&proposal_id);
            return Err(e.into());
        }

        let accepted = match tokio::time::timeout(self.config.response_timeout, rx).await {
            Ok(Ok(Ok(acc))) => acc,
            Ok(Ok(Err(reason))) => return Err(Error::Declined { reason }),
            Ok(Err(_)) => return Err(Error::ChannelClosed),
            Err(_) => {
                self.routes.lock().await.proposals.remove(&proposal_id);
                return Err(Error::Timeout);
            }
        };
        if accepted.participant != peer {
            return Err(ValidationError::UnexpectedParticipant(accepted.participant).into());
        }

        let params = Params {
            challenge_duration: proposal.challenge_duration,
            nonce: combine_nonce(nonce_share, accepted.nonce_share),
            participants: [me, peer],
        };
        let initial = State::new(&params, balances);
        if !sig::verify(initial.hash(), accepted.sig, peer) {
            return Err(ValidationError::InvalidSignature(peer).into());
        }

        let my_sig = self.signer.sign(initial.hash());
        let mut signed = SignedState::with_sig(initial, 0, my_sig);
        signed.put_sig(1, accepted.sig);

        let channel = self.start_channel(params, 0, signed).await;
        self.bus
            .send(
                peer,
                Message::UpdateAccepted(UpdateAccepted {
                    channel_id: params.channel_id(),
                    version: 0,
                    sig: my_sig,
                }),
            )
            .await
            .map_err(Error::from)?;

        self.fund_and_await_open(channel, &params, &initial, 0, balances[0])
            .await
    }

    /// Wait for the next inbound channel proposal.
    pub async fn next_channel_request(&self) -> Result<ChannelRequest<'_>> {
        let mut incoming = self.incoming.lock().await;
        let (from, proposal) = incoming.recv().await.ok_or(Error::ChannelClosed)?;
        Ok(ChannelRequest {
            client: self,
            from,
            proposal,
        })
    }

    /// Spawn the actor for a channel and register its route.
    async fn start_channel(&self, params: Params, me: PartIdx, initial: SignedState) -> Channel {
        let handles = machine::spawn(MachineConfig {
            params,
            me,
            signer: self.signer.clone(),
            bus: Arc::clone(&self.bus),
            adjudicator: Arc::clone(&self.adjudicator),
            response_timeout: self.config.response_timeout,
            initial,
        });
        let channel_id = params.channel_id();
        self.routes
            .lock()
            .await
            .channels
            .insert(channel_id, handles.peer_inbox);

        // The actor drops its phase sender when it terminates; unregister
        // the route then, so finished channels do not pile up in the map.
        let mut phase = handles.phase.clone();
        let routes = Arc::clone(&self.routes);
        tokio::spawn(async move {
            while phase.changed().await.is_ok() {}
            routes.lock().await.channels.remove(&channel_id);
            tracing::debug!(channel = ?channel_id, "channel route removed");
        });

        Channel::new(params, me, handles.commands, handles.phase, handles.requests)
    }

    async fn fund_and_await_open(
        &self,
        channel: Channel,
        params: &Params,
        initial: &State,
        me: PartIdx,
        amount: U256,
    ) -> Result<Channel> {
        let adjudicator = Arc::clone(&self.adjudicator);
        with_backoff("deposit", || {
            adjudicator.deposit(params, initial, me, amount)
        })
        .await?;

        let mut phase = channel.phase_watch();
        phase
            .wait_for(|p| *p == Phase::Open)
            .await
            .map_err(|_| Error::ChannelClosed)?;
        tracing::info!(channel = ?params.channel_id(), part_idx = me, "channel open");
        Ok(channel)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("address", &self.signer.address())
            .finish()
    }
}

/// An inbound channel proposal awaiting a decision.
pub struct ChannelRequest<'a> {
    client: &'a Client,
    from: Address,
    proposal: ChannelProposal,
}

impl ChannelRequest<'_> {
    pub fn peer(&self) -> Address {
        self.from
    }

    /// Initial balances as proposed: `[proposer, us]`.
    pub fn balances(&self) -> Balances {
        self.proposal.balances
    }

    pub fn challenge_duration(&self) -> Duration {
        Duration::from_secs(self.proposal.challenge_duration)
    }

    /// Accept the proposal, fund our side and wait until the channel opens.
    pub async fn accept(self) -> Result<Channel> {
        if self.proposal.proposer != self.from {
            return Err(ValidationError::UnexpectedParticipant(self.proposal.proposer).into());
        }
        let client = self.client;
        let me = client.signer.address();
        let nonce_share: U256 = rand::thread_rng().gen();

        let params = Params {
            challenge_duration: self.proposal.challenge_duration,
            nonce: combine_nonce(self.proposal.nonce_share, nonce_share),
            participants: [self.from, me],
        };
        let initial = State::new(&params, self.proposal.balances);
        let my_sig = client.signer.sign(initial.hash());

        // Route first: the proposer's countersignature may race our answer.
        let channel = client
            .start_channel(params, 1, SignedState::with_sig(initial, 1, my_sig))
            .await;
        client
            .bus
            .send(
                self.from,
                Message::ProposalAccepted(ProposalAccepted {
                    proposal_id: self.proposal.proposal_id,
                    nonce_share,
                    participant: me,
                    sig: my_sig,
                }),
            )
            .await
            .map_err(Error::from)?;

        client
            .fund_and_await_open(channel, &params, &initial, 1, self.proposal.balances[1])
            .await
    }

    /// Turn the proposal down.
    pub async fn reject(self, reason: impl Into<String>) -> Result<()> {
        self.client
            .bus
            .send(
                self.from,
                Message::ProposalRejected {
                    proposal_id: self.proposal.proposal_id,
                    reason: reason.into(),
                },
            )
            .await
            .map_err(Error::from)
    }
}

/// Both participants contribute a share so neither controls the channel
/// nonce (and with it the channel id) alone.
fn combine_nonce(a: U256, b: U256) -> U256 {
    U256::from_big_endian(&encode::to_hash(&(a, b)).0)
}

async fn route(
    mut inbox: mpsc::Receiver<(Address, Message)>,
    routes: Arc<Mutex<Routes>>,
    incoming: mpsc::Sender<(Address, ChannelProposal)>,
) {
    while let Some((from, msg)) = inbox.recv().await {
        match msg {
            Message::ChannelProposal(p) => {
                if incoming.send((from, p)).await.is_err() {
                    tracing::warn!(?from, "channel proposal dropped, client gone");
                }
            }
            Message::ProposalAccepted(acc) => {
                let waiter = routes.lock().await.proposals.remove(&acc.proposal_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(acc));
                    }
                    None => tracing::warn!(?from, "acceptance for unknown proposal"),
                }
            }
            Message::ProposalRejected {
                proposal_id,
                reason,
            } => {
                let waiter = routes.lock().await.proposals.remove(&proposal_id);
                if let Some(tx) = waiter {
                    let _ = tx.send(Err(reason));
                }
            }
            Message::Update(ref u) => forward(&routes, from, u.channel_id, msg.clone()).await,
            Message::UpdateAccepted(ref a) => {
                forward(&routes, from, a.channel_id, msg.clone()).await
            }
            Message::UpdateRejected(ref r) => {
                forward(&routes, from, r.channel_id, msg.clone()).await
            }
        }
    }
    tracing::debug!("router stopped, transport endpoint closed");
}

async fn forward(routes: &Mutex<Routes>, from: Address, channel: Hash, msg: Message) {
    let inbox = routes.lock().await.channels.get(&channel).cloned();
    match inbox {
        Some(tx) => {
            if tx.send((from, msg)).await.is_err() {
                tracing::warn!(?channel, "message for a finished channel dropped");
            }
        }
        None => tracing::warn!(?channel, ?from, "message for unknown channel dropped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adjudicator::LocalAdjudicator;
    use crate::wire::Network;
    use rand::{rngs::StdRng, SeedableRng};

    async fn connected_pair(seed: u64) -> (Client, Client) {
        let net = Network::new();
        let adjudicator: Arc<dyn Adjudicator> = Arc::new(LocalAdjudicator::new());
        let mut rng = StdRng::seed_from_u64(seed);
        let mut clients = Vec::new();
        for _ in 0..2 {
            let signer = Signer::new(&mut rng);
            let (bus, inbox) = net.endpoint(signer.address()).await;
            clients.push(Client::new(
                ClientConfig::default(),
                signer,
                Arc::new(bus),
                inbox,
                Arc::clone(&adjudicator),
            ));
        }
        let b = clients.pop().unwrap();
        (clients.pop().unwrap(), b)
    }

    #[tokio::test(start_paused = true)]
    async fn routes_go_away_with_the_channel_actor() {
        let (a, b) = connected_pair(17).await;
        let peer = b.address();

        let b_task = tokio::spawn(async move {
            let channel = b.next_channel_request().await.unwrap().accept().await.unwrap();
            channel.close().await.unwrap();
            drop(channel);
            b
        });

        let channel = a
            .open_channel(peer, [U256::from(10u64), U256::zero()])
            .await
            .unwrap();
        assert_eq!(a.routes.lock().await.channels.len(), 1);

        channel.close().await.unwrap();
        drop(channel);
        let b = b_task.await.unwrap();

        // Give the actors and their cleanup tasks a chance to run down.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(a.routes.lock().await.channels.is_empty());
        assert!(b.routes.lock().await.channels.is_empty());
    }
}
