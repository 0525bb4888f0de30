//! Typed handles onto a channel's actor task.
//!
//! [Channel] is what a client hands out; [PendingCredential],
//! [CredentialOffer] and [CredentialRequest] are one-shot continuations of
//! the credential exchange, consumed by the operation that resolves them.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex};

use crate::app::Credential;
use crate::channel::machine::{Command, CredentialRequestInfo};
use crate::channel::state::{Params, PartIdx};
use crate::channel::Phase;
use crate::encode;
use crate::error::{Error, Result, ValidationError};
use crate::types::{Hash, U256};

/// A handle onto one open channel.
///
/// All methods take `&self`; the actor task serializes the actual work.
/// Dropping the handle does not close the channel on its own, but once every
/// handle is gone and the channel is settled the actor task ends.
pub struct Channel {
    channel_id: Hash,
    params: Params,
    me: PartIdx,
    commands: mpsc::Sender<Command>,
    phase: watch::Receiver<Phase>,
    requests: Mutex<mpsc::Receiver<CredentialRequestInfo>>,
}

impl Channel {
    pub(crate) fn new(
        params: Params,
        me: PartIdx,
        commands: mpsc::Sender<Command>,
        phase: watch::Receiver<Phase>,
        requests: mpsc::Receiver<CredentialRequestInfo>,
    ) -> Self {
        Channel {
            channel_id: params.channel_id(),
            params,
            me,
            commands,
            phase,
            requests: Mutex::new(requests),
        }
    }

    pub fn id(&self) -> Hash {
        self.channel_id
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Our index among the participants.
    pub fn part_idx(&self) -> PartIdx {
        self.me
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub(crate) fn phase_watch(&self) -> watch::Receiver<Phase> {
        self.phase.clone()
    }

    async fn command<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| Error::ChannelClosed)?;
        rx.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Ask the peer to issue a credential over `document` for `price`.
    ///
    /// Resolves once the request round is underway; the returned
    /// [PendingCredential] waits for the issuer's answer.
    pub async fn request_credential(
        &self,
        document: impl Into<Vec<u8>>,
        price: U256,
    ) -> Result<PendingCredential> {
        let document = document.into();
        let doc_hash = encode::hash_bytes(&document);
        let offer_rx = self
            .command(|resp| Command::RequestCredential {
                doc_hash,
                price,
                resp,
            })
            .await?;
        Ok(PendingCredential {
            channel_id: self.channel_id,
            commands: self.commands.clone(),
            document,
            offer_rx,
        })
    }

    /// Wait for the next inbound credential request. One request per call;
    /// concurrent callers line up.
    pub async fn next_credential_request(&self) -> Result<CredentialRequest> {
        let mut requests = self.requests.lock().await;
        let info = requests.recv().await.ok_or(Error::ChannelClosed)?;
        Ok(CredentialRequest {
            commands: self.commands.clone(),
            info,
        })
    }

    /// Suspend until the channel can be settled (or already is).
    pub async fn wait_concludable(&self) -> Result<()> {
        let mut phase = self.phase.clone();
        phase
            .wait_for(|p| matches!(p, Phase::Concludable | Phase::Closed))
            .await
            .map_err(|_| Error::ChannelClosed)?;
        Ok(())
    }

    /// Settle and withdraw. Finalizes cooperatively first if the channel is
    /// still open; waits out a running dispute. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.command(|resp| Command::Close { resp }).await
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.channel_id)
            .field("part_idx", &self.me)
            .field("phase", &self.phase())
            .finish()
    }
}

/// A credential request in flight, held by the requester.
pub struct PendingCredential {
    channel_id: Hash,
    commands: mpsc::Sender<Command>,
    document: Vec<u8>,
    offer_rx: oneshot::Receiver<Result<crate::channel::machine::Offer>>,
}

impl PendingCredential {
    /// Wait for the issuer's answer.
    ///
    /// `Declined` means the issuer turned the request itself down; other
    /// errors mean the negotiation or the channel died.
    pub async fn wait(self) -> Result<CredentialOffer> {
        let offer = self.offer_rx.await.map_err(|_| Error::ChannelClosed)??;
        Ok(CredentialOffer {
            commands: self.commands,
            version: offer.version,
            credential: Credential {
                document: self.document,
                channel_id: self.channel_id,
                price: offer.price,
                signature: offer.cred_sig,
            },
        })
    }

    /// Like [wait](Self::wait), but give up after `timeout` with
    /// [Error::Canceled].
    ///
    /// Only the waiting is abandoned; the committed request stands, and an
    /// issuer that answers later finds nobody listening.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<CredentialOffer> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| Error::Canceled)?
    }
}

/// An issued credential awaiting the holder's decision.
///
/// Exactly one of [accept](Self::accept) / [reject](Self::reject) resolves
/// it; both consume the offer.
#[derive(Debug)]
pub struct CredentialOffer {
    commands: mpsc::Sender<Command>,
    version: u64,
    credential: Credential,
}

impl CredentialOffer {
    /// The credential as delivered. Verify it before accepting.
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Let the payment stand and take the credential.
    pub async fn accept(self) -> Result<Credential> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::AcceptCredential {
                offer_version: self.version,
                resp: tx,
            })
            .await
            .map_err(|_| Error::ChannelClosed)?;
        rx.await.map_err(|_| Error::ChannelClosed)??;
        Ok(self.credential)
    }

    /// Try to back out of the purchase.
    ///
    /// An issuer holding a valid issuance signature will decline this and
    /// recover the payment on-chain, so against an honest issuer this
    /// resolves to [Error::Declined].
    pub async fn reject(self, reason: impl Into<String>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::RejectCredential {
                offer_version: self.version,
                reason: reason.into(),
                resp: tx,
            })
            .await
            .map_err(|_| Error::ChannelClosed)?;
        rx.await.map_err(|_| Error::ChannelClosed)?
    }
}

/// An inbound credential request, held by the issuer.
pub struct CredentialRequest {
    commands: mpsc::Sender<Command>,
    info: CredentialRequestInfo,
}

impl CredentialRequest {
    pub fn doc_hash(&self) -> Hash {
        self.info.doc_hash
    }

    pub fn price(&self) -> U256 {
        self.info.price
    }

    pub fn requester(&self) -> PartIdx {
        self.info.requester
    }

    /// Check that the request is about the document we are willing to sign.
    pub fn check_doc(&self, document: &[u8]) -> Result<()> {
        if encode::hash_bytes(document) != self.info.doc_hash {
            return Err(ValidationError::DocumentMismatch.into());
        }
        Ok(())
    }

    /// Check that the offered price is the one we quoted.
    pub fn check_price(&self, expected: U256) -> Result<()> {
        if self.info.price != expected {
            return Err(ValidationError::PriceMismatch {
                expected,
                actual: self.info.price,
            }
            .into());
        }
        Ok(())
    }

    /// Sign the credential and propose the paying state update.
    ///
    /// `Ok` means the issuance is on its way to the requester; from here the
    /// payment is guaranteed, cooperatively or through a dispute.
    pub async fn issue(self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::IssueCredential {
                request_version: self.info.version,
                resp: tx,
            })
            .await
            .map_err(|_| Error::ChannelClosed)?;
        rx.await.map_err(|_| Error::ChannelClosed)?
    }
}
