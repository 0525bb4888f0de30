//! Fair exchange of signed credentials for payments over two-party state
//! channels.
//!
//! A credential *holder* buys an issuer-signed credential over an off-chain
//! payment channel. The exchange is fair without trusting the peer: the
//! issuance signature is machine-checkable from the channel state alone, so
//! an issuer whose counterparty stops cooperating after receiving the
//! credential forces the payment through an on-chain dispute instead of
//! losing it.
//!
//! Typical setup:
//!
//! ```ignore
//! let net = Network::new();
//! let adjudicator = Arc::new(LocalAdjudicator::new());
//!
//! let signer = Signer::new(&mut rand::thread_rng());
//! let (bus, inbox) = net.endpoint(signer.address()).await;
//! let client = Client::new(
//!     ClientConfig::default(),
//!     signer,
//!     Arc::new(bus),
//!     inbox,
//!     adjudicator,
//! );
//!
//! let channel = client.open_channel(peer, [deposit, U256::zero()]).await?;
//! let pending = channel.request_credential(document, price).await?;
//! let credential = pending.wait().await?.accept().await?;
//! channel.close().await?;
//! ```

pub mod adjudicator;
pub mod app;
pub mod channel;
pub mod client;
pub mod encode;
pub mod error;
pub mod messages;
pub mod sig;
pub mod types;
pub mod wire;

pub use adjudicator::{Adjudicator, AdjudicatorEvent, LocalAdjudicator};
pub use app::Credential;
pub use channel::state::{Balances, Params, PartIdx, State};
pub use channel::{Channel, CredentialOffer, CredentialRequest, PendingCredential, Phase};
pub use client::{ChannelRequest, Client, ClientConfig};
pub use error::{Error, Result};
pub use sig::Signer;
pub use types::{Address, Hash, Signature, U256};
pub use wire::{Bus, Network};
