//! Creation and verification of (Ethereum) signatures.
//!
//! Uses recoverable ECDSA over secp256k1: verification recovers the signer
//! address from the signature and compares it against the expected
//! participant, the same check an on-chain adjudicator performs.

use k256::{
    ecdsa::{
        recoverable,
        signature::{hazmat::PrehashSigner, Signature as k256Signature},
        SigningKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
};
use sha3::{Digest, Keccak256};

use crate::types::{Address, Hash, Signature};

pub use k256::ecdsa::Error;

/// Add the `\x19Ethereum Signed Message\n<length>` prefix to hash.
///
/// This is the format expected by the Solidity contracts.
fn hash_to_eth_signed_msg_hash(hash: Hash) -> Hash {
    // Packed encoding, so we can't go through the canonical serializer.
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(hash.0);
    Hash(hasher.finalize().into())
}

fn address_from_verifying_key(key: &k256::ecdsa::VerifyingKey) -> Address {
    // The first byte of the uncompressed encoding is not part of the public
    // key, it is added by the SEC1 point encoding.
    let pk_bytes: [u8; 65] = key
        .to_encoded_point(false)
        .as_bytes()
        .try_into()
        .expect("uncompressed SEC1 point is always 65 bytes");
    let hash: [u8; 32] = Keccak256::digest(&pk_bytes[1..]).into();

    let mut addr = Address([0; 20]);
    addr.0.copy_from_slice(&hash[32 - 20..]);
    addr
}

/// A signing identity: one secp256k1 key and its derived address.
#[derive(Debug, Clone)]
pub struct Signer {
    key: SigningKey,
    addr: Address,
}

impl Signer {
    pub fn new<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        let key = SigningKey::random(&mut *rng);
        let addr = address_from_verifying_key(&key.verifying_key());
        Self { key, addr }
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    /// Sign a hash in the `\x19Ethereum Signed Message` format.
    pub fn sign(&self, msg: Hash) -> Signature {
        let hash = hash_to_eth_signed_msg_hash(msg);

        let sig: recoverable::Signature = self
            .key
            .sign_prehash(&hash.0)
            .expect("signing a 32-byte prehash with a valid key cannot fail");

        // The recoverable signature already has the 65-byte r || s || v
        // layout, but v has to be offset by 27 to be valid in the EVM.
        let mut sig_bytes: [u8; 65] = sig
            .as_bytes()
            .try_into()
            .expect("recoverable signature is always 65 bytes");
        debug_assert!(sig_bytes[32] & 0x80 == 0);
        sig_bytes[64] += 27;

        Signature(sig_bytes)
    }
}

/// Recover the address that produced `sig` over `msg`.
pub fn recover(msg: Hash, sig: Signature) -> Result<Address, Error> {
    let hash = hash_to_eth_signed_msg_hash(msg);

    // Undo the +27 on v to get back to the raw recovery id.
    let mut sig_bytes: [u8; 65] = sig.0;
    if sig_bytes[64] < 27 {
        return Err(Error::new());
    }
    sig_bytes[64] -= 27;

    let sig = recoverable::Signature::from_bytes(&sig_bytes)?;
    let verifying_key = sig.recover_verifying_key_from_digest_bytes(&hash.0.into())?;
    Ok(address_from_verifying_key(&verifying_key))
}

/// Whether `sig` over `msg` was produced by `signer`.
pub fn verify(msg: Hash, sig: Signature, signer: Address) -> bool {
    matches!(recover(msg, sig), Ok(addr) if addr == signer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn sign_and_recover_roundtrip() {
        let mut rng = StdRng::seed_from_u64(0);
        let signer = Signer::new(&mut rng);

        let msg = Hash([0x11; 32]);
        let sig = signer.sign(msg);

        assert_eq!(recover(msg, sig).unwrap(), signer.address());
        assert!(verify(msg, sig, signer.address()));
    }

    #[test]
    fn verify_rejects_wrong_signer() {
        let mut rng = StdRng::seed_from_u64(1);
        let alice = Signer::new(&mut rng);
        let bob = Signer::new(&mut rng);

        let msg = Hash([0x22; 32]);
        let sig = alice.sign(msg);

        assert!(!verify(msg, sig, bob.address()));
    }

    #[test]
    fn verify_rejects_wrong_message() {
        let mut rng = StdRng::seed_from_u64(2);
        let signer = Signer::new(&mut rng);

        let sig = signer.sign(Hash([0x33; 32]));
        assert!(!verify(Hash([0x44; 32]), sig, signer.address()));
    }

    #[test]
    fn recover_rejects_malformed_v() {
        let mut rng = StdRng::seed_from_u64(3);
        let signer = Signer::new(&mut rng);

        let mut sig = signer.sign(Hash([0x55; 32]));
        sig.0[64] = 0; // below the EVM offset
        assert!(recover(Hash([0x55; 32]), sig).is_err());
    }
}
