//! The credential payment app: pure transition rules for the channel state.
//!
//! `valid_transition` is the single source of truth for whether one channel
//! state may follow another. The in-process negotiation and the adjudicator
//! both call it, which guarantees that a state an honest party would co-sign
//! is exactly a state the adjudicator would enforce in a dispute.

use serde::Serialize;
use thiserror::Error;

use crate::channel::state::{Params, PartIdx, State};
use crate::encode;
use crate::sig;
use crate::types::{Address, Hash, Signature, U256};

/// Application sub-state embedded in every channel state.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub enum AppState {
    /// No credential exchange in flight.
    Idle,
    /// A participant asked for a credential over the document with this
    /// digest, offering `price` for it. Balances are untouched so far.
    Requested {
        doc_hash: Hash,
        price: U256,
        requester: PartIdx,
    },
    /// The issuer answered with the credential signature and moved `price`
    /// from the requester to itself.
    Issued {
        doc_hash: Hash,
        price: U256,
        requester: PartIdx,
        cred_sig: Signature,
    },
}

impl AppState {
    pub fn is_idle(&self) -> bool {
        matches!(self, AppState::Idle)
    }
}

/// Classified state transition, tagged with who must have signed the new
/// state for it to be admissible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `Idle -> Requested`: open a credential request, balances unchanged.
    Request,
    /// `Requested -> Issued`: attach the credential signature and move the
    /// price to the issuer.
    Issue,
    /// `Issued -> Idle`, keeping the issued balances: the requester accepts.
    Accept,
    /// `Issued -> Idle`, restoring the pre-issue balances: the requester
    /// backs out.
    Reject,
    /// `Idle -> Idle` with `is_final` set: cooperative close.
    Finalize,
}

/// Which participants must have signed a state for the transition into it to
/// count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerSet {
    Both,
    Only(PartIdx),
}

/// A transition that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidTransition {
    pub kind: Transition,
    /// Signatures required on the *new* state for it to be admissible. For
    /// everything except `Issue` that is both participants; an `Issue` state
    /// is admissible with the issuer's signature alone, which is what lets
    /// the issuer force the payment through a dispute when the requester
    /// stops cooperating after receiving the credential.
    pub required_signers: SignerSet,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    #[error("channel id changed between states")]
    ChannelIdMismatch,
    #[error("version must increase by one: expected {expected}, got {actual}")]
    VersionMismatch { expected: u64, actual: u64 },
    #[error("current state is final, no further transitions")]
    CurrentStateIsFinal,
    #[error("balance sum is not conserved")]
    BalanceSumMismatch,
    #[error("balances may not change in this transition")]
    BalancesChanged,
    #[error("participant {0} may not perform this transition")]
    WrongActor(PartIdx),
    #[error("request fields changed between Requested and Issued")]
    RequestMismatch,
    #[error("requester cannot afford the price")]
    InsufficientFunds,
    #[error("credential signature does not verify under the issuer's key")]
    InvalidCredentialSignature,
    #[error("a final state must have an idle app state")]
    FinalStateNotIdle,
    #[error("no rule allows this transition")]
    NoSuchTransition,
}

/// Payload the issuer signs when issuing a credential.
///
/// The signature binds the document to the channel that pays for it, so a
/// signature obtained through a defected-on exchange verifies only together
/// with a channel whose final state actually carries the payment.
#[derive(Serialize, Debug, Clone, Copy)]
struct CredentialBinding {
    channel_id: Hash,
    doc_hash: Hash,
    price: U256,
}

/// The digest the issuer signs for a credential over `doc_hash` priced
/// `price` in channel `channel_id`.
pub fn credential_payload(channel_id: Hash, doc_hash: Hash, price: U256) -> Hash {
    encode::to_hash(&CredentialBinding {
        channel_id,
        doc_hash,
        price,
    })
}

/// A credential as held by the requester after a completed exchange.
#[derive(Debug, Clone)]
pub struct Credential {
    pub document: Vec<u8>,
    pub channel_id: Hash,
    pub price: U256,
    pub signature: Signature,
}

impl Credential {
    /// Verify the credential against the issuer's address.
    pub fn verify(&self, issuer: Address) -> bool {
        let payload = credential_payload(
            self.channel_id,
            encode::hash_bytes(&self.document),
            self.price,
        );
        sig::verify(payload, self.signature, issuer)
    }
}

/// The issuer for a request is whoever did not make it.
pub fn issuer_of(requester: PartIdx) -> PartIdx {
    1 - requester
}

/// Check whether `new` may follow `old` when proposed by `actor`.
///
/// Pure: no clocks, no I/O, no signatures on the states themselves (those
/// are the caller's concern, guided by the returned `required_signers`).
pub fn valid_transition(
    params: &Params,
    old: &State,
    new: &State,
    actor: PartIdx,
) -> Result<ValidTransition, TransitionError> {
    if new.channel_id() != old.channel_id() {
        return Err(TransitionError::ChannelIdMismatch);
    }
    if old.is_final {
        return Err(TransitionError::CurrentStateIsFinal);
    }
    if new.version() != old.version() + 1 {
        return Err(TransitionError::VersionMismatch {
            expected: old.version() + 1,
            actual: new.version(),
        });
    }
    if new.total() != old.total() {
        return Err(TransitionError::BalanceSumMismatch);
    }

    match (old.app, new.app) {
        (AppState::Idle, AppState::Requested { requester, .. }) => {
            if new.is_final {
                return Err(TransitionError::FinalStateNotIdle);
            }
            if requester != actor {
                return Err(TransitionError::WrongActor(actor));
            }
            if new.balances != old.balances {
                return Err(TransitionError::BalancesChanged);
            }
            Ok(ValidTransition {
                kind: Transition::Request,
                required_signers: SignerSet::Both,
            })
        }

        (
            AppState::Requested {
                doc_hash,
                price,
                requester,
            },
            AppState::Issued {
                doc_hash: new_doc_hash,
                price: new_price,
                requester: new_requester,
                cred_sig,
            },
        ) => {
            if new.is_final {
                return Err(TransitionError::FinalStateNotIdle);
            }
            if (doc_hash, price, requester) != (new_doc_hash, new_price, new_requester) {
                return Err(TransitionError::RequestMismatch);
            }
            let issuer = issuer_of(requester);
            if actor != issuer {
                return Err(TransitionError::WrongActor(actor));
            }

            // The price moves from the requester to the issuer, exactly.
            let paid = old.balances[requester]
                .checked_sub(price)
                .ok_or(TransitionError::InsufficientFunds)?;
            if new.balances[requester] != paid
                || new.balances[issuer] != old.balances[issuer] + price
            {
                return Err(TransitionError::BalanceSumMismatch);
            }

            // The credential signature is machine-checkable from the state
            // alone, which is what makes the forced progression sound.
            let payload = credential_payload(old.channel_id(), doc_hash, price);
            if !sig::verify(payload, cred_sig, params.participants[issuer]) {
                return Err(TransitionError::InvalidCredentialSignature);
            }

            Ok(ValidTransition {
                kind: Transition::Issue,
                required_signers: SignerSet::Only(issuer),
            })
        }

        (
            AppState::Issued {
                price, requester, ..
            },
            AppState::Idle,
        ) => {
            if new.is_final {
                return Err(TransitionError::FinalStateNotIdle);
            }
            if actor != requester {
                return Err(TransitionError::WrongActor(actor));
            }
            let issuer = issuer_of(requester);

            let kind = if new.balances == old.balances {
                // Payment stands: the requester accepts the credential.
                Transition::Accept
            } else {
                // Revert: the price goes back to the requester.
                let refunded = old.balances[issuer]
                    .checked_sub(price)
                    .ok_or(TransitionError::BalanceSumMismatch)?;
                if new.balances[requester] != old.balances[requester] + price
                    || new.balances[issuer] != refunded
                {
                    return Err(TransitionError::BalanceSumMismatch);
                }
                Transition::Reject
            };

            Ok(ValidTransition {
                kind,
                required_signers: SignerSet::Both,
            })
        }

        (AppState::Idle, AppState::Idle) => {
            if new.balances != old.balances {
                return Err(TransitionError::BalancesChanged);
            }
            if !new.is_final {
                return Err(TransitionError::NoSuchTransition);
            }
            Ok(ValidTransition {
                kind: Transition::Finalize,
                required_signers: SignerSet::Both,
            })
        }

        _ => Err(TransitionError::NoSuchTransition),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::state::Balances;
    use crate::sig::Signer;
    use rand::{rngs::StdRng, SeedableRng};

    struct Fixture {
        params: Params,
        holder: Signer,
        issuer: Signer,
    }

    const HOLDER: PartIdx = 0;
    const ISSUER: PartIdx = 1;

    fn fixture() -> Fixture {
        let mut rng = StdRng::seed_from_u64(7);
        let holder = Signer::new(&mut rng);
        let issuer = Signer::new(&mut rng);
        let params = Params {
            challenge_duration: 60,
            nonce: U256::from(1234u64),
            participants: [holder.address(), issuer.address()],
        };
        Fixture {
            params,
            holder,
            issuer,
        }
    }

    fn initial_state(params: &Params) -> State {
        State::new(params, [U256::from(10u64), U256::from(0u64)])
    }

    fn requested(params: &Params, doc: &[u8], price: U256) -> State {
        let old = initial_state(params);
        let mut new = old.make_next_state();
        new.app = AppState::Requested {
            doc_hash: encode::hash_bytes(doc),
            price,
            requester: HOLDER,
        };
        new
    }

    fn issued(fx: &Fixture, doc: &[u8], price: U256) -> (State, State) {
        let old = requested(&fx.params, doc, price);
        let mut new = old.make_next_state();
        let cred_sig = fx.issuer.sign(credential_payload(
            old.channel_id(),
            encode::hash_bytes(doc),
            price,
        ));
        new.app = AppState::Issued {
            doc_hash: encode::hash_bytes(doc),
            price,
            requester: HOLDER,
            cred_sig,
        };
        new.balances = [old.balances[0] - price, old.balances[1] + price];
        (old, new)
    }

    #[test]
    fn request_keeps_balances() {
        let fx = fixture();
        let old = initial_state(&fx.params);
        let new = requested(&fx.params, b"doc", U256::from(5u64));

        let t = valid_transition(&fx.params, &old, &new, HOLDER).unwrap();
        assert_eq!(t.kind, Transition::Request);
        assert_eq!(t.required_signers, SignerSet::Both);

        // Moving money inside a request is invalid.
        let mut bad = new;
        bad.balances = [U256::from(9u64), U256::from(1u64)];
        assert_eq!(
            valid_transition(&fx.params, &old, &bad, HOLDER),
            Err(TransitionError::BalancesChanged)
        );
    }

    #[test]
    fn request_actor_must_be_requester() {
        let fx = fixture();
        let old = initial_state(&fx.params);
        let new = requested(&fx.params, b"doc", U256::from(5u64));
        assert_eq!(
            valid_transition(&fx.params, &old, &new, ISSUER),
            Err(TransitionError::WrongActor(ISSUER))
        );
    }

    #[test]
    fn issue_moves_exactly_the_price_and_needs_only_the_issuer() {
        let fx = fixture();
        let (old, new) = issued(&fx, b"doc", U256::from(5u64));

        let t = valid_transition(&fx.params, &old, &new, ISSUER).unwrap();
        assert_eq!(t.kind, Transition::Issue);
        assert_eq!(t.required_signers, SignerSet::Only(ISSUER));
    }

    #[test]
    fn issue_with_wrong_credential_signature_is_invalid() {
        let fx = fixture();
        let (old, mut new) = issued(&fx, b"doc", U256::from(5u64));

        // Holder-signed credential must not pass as the issuer's.
        let forged = fx.holder.sign(credential_payload(
            old.channel_id(),
            encode::hash_bytes(b"doc"),
            U256::from(5u64),
        ));
        if let AppState::Issued { cred_sig, .. } = &mut new.app {
            *cred_sig = forged;
        }
        assert_eq!(
            valid_transition(&fx.params, &old, &new, ISSUER),
            Err(TransitionError::InvalidCredentialSignature)
        );
    }

    #[test]
    fn issue_with_wrong_amount_is_invalid() {
        let fx = fixture();
        let (old, mut new) = issued(&fx, b"doc", U256::from(5u64));
        new.balances = [U256::from(4u64), U256::from(6u64)];
        assert_eq!(
            valid_transition(&fx.params, &old, &new, ISSUER),
            Err(TransitionError::BalanceSumMismatch)
        );
    }

    #[test]
    fn issue_fails_when_requester_cannot_pay() {
        let fx = fixture();
        let price = U256::from(11u64); // more than the holder deposited
        let old = requested(&fx.params, b"doc", price);
        let mut new = old.make_next_state();
        let cred_sig = fx.issuer.sign(credential_payload(
            old.channel_id(),
            encode::hash_bytes(b"doc"),
            price,
        ));
        new.app = AppState::Issued {
            doc_hash: encode::hash_bytes(b"doc"),
            price,
            requester: HOLDER,
            cred_sig,
        };
        assert_eq!(
            valid_transition(&fx.params, &old, &new, ISSUER),
            Err(TransitionError::InsufficientFunds)
        );
    }

    #[test]
    fn accept_keeps_issued_balances() {
        let fx = fixture();
        let (_, old) = issued(&fx, b"doc", U256::from(5u64));
        let mut new = old.make_next_state();
        new.app = AppState::Idle;

        let t = valid_transition(&fx.params, &old, &new, HOLDER).unwrap();
        assert_eq!(t.kind, Transition::Accept);
        assert_eq!(t.required_signers, SignerSet::Both);
    }

    #[test]
    fn reject_restores_pre_issue_balances() {
        let fx = fixture();
        let (_, old) = issued(&fx, b"doc", U256::from(5u64));
        let mut new = old.make_next_state();
        new.app = AppState::Idle;
        new.balances = [U256::from(10u64), U256::from(0u64)];

        let t = valid_transition(&fx.params, &old, &new, HOLDER).unwrap();
        assert_eq!(t.kind, Transition::Reject);
    }

    #[test]
    fn resolution_actor_must_be_requester() {
        let fx = fixture();
        let (_, old) = issued(&fx, b"doc", U256::from(5u64));
        let mut new = old.make_next_state();
        new.app = AppState::Idle;
        assert_eq!(
            valid_transition(&fx.params, &old, &new, ISSUER),
            Err(TransitionError::WrongActor(ISSUER))
        );
    }

    #[test]
    fn double_issue_is_invalid() {
        let fx = fixture();
        let (_, old) = issued(&fx, b"doc", U256::from(5u64));
        let mut new = old.make_next_state();
        // Old state is already Issued; there is no Issued -> Issued rule.
        new.balances = old.balances;
        assert_eq!(
            valid_transition(&fx.params, &old, &new, ISSUER),
            Err(TransitionError::NoSuchTransition)
        );
    }

    #[test]
    fn version_must_increment_by_exactly_one() {
        let fx = fixture();
        let old = initial_state(&fx.params);
        let skipped = old.make_next_state().make_next_state();
        assert!(matches!(
            valid_transition(&fx.params, &old, &skipped, HOLDER),
            Err(TransitionError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn no_transition_out_of_a_final_state() {
        let fx = fixture();
        let mut old = initial_state(&fx.params);
        old.is_final = true;
        let new = old.make_next_state();
        assert_eq!(
            valid_transition(&fx.params, &old, &new, HOLDER),
            Err(TransitionError::CurrentStateIsFinal)
        );
    }

    #[test]
    fn finalize_requires_the_final_flag() {
        let fx = fixture();
        let old = initial_state(&fx.params);
        let mut new = old.make_next_state();
        assert_eq!(
            valid_transition(&fx.params, &old, &new, HOLDER),
            Err(TransitionError::NoSuchTransition)
        );

        new.is_final = true;
        let t = valid_transition(&fx.params, &old, &new, HOLDER).unwrap();
        assert_eq!(t.kind, Transition::Finalize);
    }

    #[test]
    fn credential_binds_to_the_channel() {
        let fx = fixture();
        let old = requested(&fx.params, b"doc", U256::from(5u64));
        let cred_sig = fx.issuer.sign(credential_payload(
            old.channel_id(),
            encode::hash_bytes(b"doc"),
            U256::from(5u64),
        ));

        let cred = Credential {
            document: b"doc".to_vec(),
            channel_id: old.channel_id(),
            price: U256::from(5u64),
            signature: cred_sig,
        };
        assert!(cred.verify(fx.issuer.address()));

        // The same signature presented with a different channel id fails.
        let stolen = Credential {
            channel_id: crate::types::Hash([9; 32]),
            ..cred
        };
        assert!(!stolen.verify(fx.issuer.address()));
    }
}
