//! Core protocol value types: on-chain style addresses, hashes, signatures
//! and 256-bit balances.

use core::fmt::Debug;

use rand::{distributions::Standard, prelude::Distribution};
use serde::Serialize;
use uint::construct_uint;

macro_rules! impl_hex_debug {
    ($T:ident) => {
        impl Debug for $T {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str("0x")?;
                for b in self.0 {
                    f.write_fmt(format_args!("{:02x}", b))?;
                }
                Ok(())
            }
        }
    };
}

/// 32-byte hash value (Keccak-256 output).
#[derive(PartialEq, Eq, Hash, Copy, Clone)]
pub struct Hash(pub [u8; 32]);
impl_hex_debug!(Hash);

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl Distribution<Hash> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Hash {
        Hash(rng.gen())
    }
}

impl Default for Hash {
    fn default() -> Self {
        Self([0; 32])
    }
}

/// 65-byte recoverable ECDSA signature: `r || s || v`, with `v` offset by 27
/// as expected by the EVM.
#[derive(PartialEq, Copy, Clone)]
pub struct Signature(pub [u8; 65]);
impl_hex_debug!(Signature);

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl Default for Signature {
    fn default() -> Self {
        Self([0; 65])
    }
}

/// 20-byte account address, derived from the verifying key the same way
/// Ethereum does it.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Address(pub [u8; 20]);
impl_hex_debug!(Address);

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        // Addresses are right-aligned to 32 bytes, like uints.
        let mut bytes = [0u8; 32];
        bytes[32 - 20..].copy_from_slice(self.0.as_slice());
        serializer.serialize_bytes(&bytes)
    }
}

// We could use primitive_types::U256 or ethereum_types::U256 here, too. Both
// serde-serialize to a hex string, which is not what we want for canonical
// hashing, and neither adds much over construct_uint.
construct_uint! {
    pub struct U256(4);
}

impl Serialize for U256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut bytes = [0u8; 32];
        self.to_big_endian(&mut bytes);
        serializer.serialize_bytes(&bytes)
    }
}

impl Distribution<U256> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> U256 {
        let buf: [u8; 32] = rng.gen();
        U256::from_big_endian(&buf)
    }
}
