//! Transport abstraction between channel participants.
//!
//! The protocol core only needs reliable, ordered, authenticated delivery of
//! [Message] values to a named peer; everything else (dialing, framing,
//! reconnects) lives behind this trait. [Network] provides the in-memory
//! implementation used by tests and demos.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::InfrastructureError;
use crate::messages::Message;
use crate::types::Address;

/// Buffered messages per endpoint before senders are back-pressured.
const ENDPOINT_BUFFER: usize = 64;

/// Outbound half of a participant's connection.
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Deliver `msg` to `recipient`. Completion means handed to the
    /// transport, not that the peer processed it.
    async fn send(&self, recipient: Address, msg: Message) -> Result<(), InfrastructureError>;
}

/// In-memory network connecting any number of endpoints through channels.
#[derive(Clone, Default)]
pub struct Network {
    endpoints: Arc<Mutex<HashMap<Address, mpsc::Sender<(Address, Message)>>>>,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint for `addr`, returning its outbound bus and the
    /// inbound message stream `(sender, message)`.
    pub async fn endpoint(&self, addr: Address) -> (NetworkBus, mpsc::Receiver<(Address, Message)>) {
        let (tx, rx) = mpsc::channel(ENDPOINT_BUFFER);
        self.endpoints.lock().await.insert(addr, tx);
        (
            NetworkBus {
                local: addr,
                endpoints: Arc::clone(&self.endpoints),
            },
            rx,
        )
    }
}

/// Outbound bus of one in-memory endpoint.
#[derive(Clone)]
pub struct NetworkBus {
    local: Address,
    endpoints: Arc<Mutex<HashMap<Address, mpsc::Sender<(Address, Message)>>>>,
}

#[async_trait]
impl Bus for NetworkBus {
    async fn send(&self, recipient: Address, msg: Message) -> Result<(), InfrastructureError> {
        let tx = {
            let endpoints = self.endpoints.lock().await;
            endpoints
                .get(&recipient)
                .cloned()
                .ok_or_else(|| InfrastructureError::Transport(format!("unknown peer {recipient:?}")))?
        };
        tx.send((self.local, msg))
            .await
            .map_err(|_| InfrastructureError::Transport(format!("peer {recipient:?} hung up")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_order_with_sender_identity() {
        let net = Network::new();
        let alice = Address([1; 20]);
        let bob = Address([2; 20]);

        let (alice_bus, _alice_rx) = net.endpoint(alice).await;
        let (_bob_bus, mut bob_rx) = net.endpoint(bob).await;

        for version in 0..3 {
            alice_bus
                .send(
                    bob,
                    Message::ProposalRejected {
                        proposal_id: crate::types::Hash([version; 32]),
                        reason: "test".into(),
                    },
                )
                .await
                .unwrap();
        }

        for version in 0..3 {
            let (from, msg) = bob_rx.recv().await.unwrap();
            assert_eq!(from, alice);
            match msg {
                Message::ProposalRejected { proposal_id, .. } => {
                    assert_eq!(proposal_id.0[0], version)
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn sending_to_unknown_peer_fails() {
        let net = Network::new();
        let (bus, _rx) = net.endpoint(Address([1; 20])).await;
        let err = bus
            .send(Address([9; 20]), Message::ProposalRejected {
                proposal_id: crate::types::Hash([0; 32]),
                reason: "test".into(),
            })
            .await;
        assert!(err.is_err());
    }
}
