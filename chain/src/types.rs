//! Core types shared by every synapse component.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

// ---------------------------------------------------------------------------
// 32-byte newtypes
// ---------------------------------------------------------------------------

/// Shared plumbing for the fixed 32-byte identifiers: raw access, hex
/// round-trip, byte-wise ordering and an abbreviated `Debug`.
macro_rules! bytes32 {
    ($name:ident) => {
        impl $name {
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse 64 hex characters. `None` on bad length or digits.
            pub fn from_hex(text: &str) -> Option<Self> {
                let mut bytes = [0u8; 32];
                hex::decode_to_slice(text, &mut bytes).ok()?;
                Some(Self(bytes))
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.0.cmp(&other.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let text = self.to_hex();
                write!(f, "{}({}..{})", stringify!($name), &text[..8], &text[56..])
            }
        }
    };
}

/// Validator identity: the raw Ed25519 verifying key.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(pub [u8; 32]);

bytes32!(Address);

/// SHA-256 digest. Block ids, Merkle nodes and archive content addresses.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

bytes32!(Hash);

impl Hash {
    /// Parent of genesis and root of an empty Merkle tree.
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    pub fn compute(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// SHA-256 over `parts` as if concatenated, without the copy.
    pub fn compute_parts(parts: &[&[u8]]) -> Self {
        let digest = parts
            .iter()
            .fold(Sha256::new(), |hasher, part| hasher.chain_update(part))
            .finalize();
        Self(digest.into())
    }
}

// ---------------------------------------------------------------------------
// Signatures
// ---------------------------------------------------------------------------

/// Ed25519 signature bytes. Held as a `Vec` so serde can encode it; any
/// length other than 64 simply fails verification.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    /// All-zero placeholder carried by a payload before it is signed.
    pub fn empty() -> Self {
        Self(vec![0u8; 64])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head = &self.0[..self.0.len().min(8)];
        write!(f, "Signature({}..)", hex::encode(head))
    }
}

/// Signing identity of a validator.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut rand::thread_rng()),
        }
    }

    /// Deterministic keypair, for fixtures and reproducible demos.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn address(&self) -> Address {
        Address(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        Signature(self.signing_key.sign(data).to_bytes().to_vec())
    }

    pub fn verify(&self, data: &[u8], signature: &Signature) -> bool {
        verify_signature(&self.address(), data, signature)
    }
}

/// Check `signature` over `data` against the key behind `address`.
pub fn verify_signature(address: &Address, data: &[u8], signature: &Signature) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(address.as_bytes()) else {
        return false;
    };
    ed25519_dalek::Signature::from_slice(signature.as_bytes())
        .is_ok_and(|sig| key.verify(data, &sig).is_ok())
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Epoch number. Consensus rounds and reward distribution happen per epoch.
pub type Epoch = u64;

/// Slot number within the chain. Exactly one validator may propose per slot.
pub type Slot = u64;

/// Identifier of an AI subnet. Each subnet runs its own consensus rounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubnetId(pub u16);

impl fmt::Display for SubnetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subnet-{}", self.0)
    }
}

/// Participant (miner) identifier inside a subnet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uid(pub u32);

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uid-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Ledger events
// ---------------------------------------------------------------------------

/// Recipient of a reward or target of a slash, as seen by the ledger layer.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Beneficiary {
    Validator(Address),
    Miner { subnet: SubnetId, uid: Uid },
    Treasury,
}

/// Why a balance changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaKind {
    BlockReward,
    Slash,
    MinerEmission,
    ValidatorEmission,
    TreasuryEmission,
}

/// A signed balance change handed to the account layer, applied atomically
/// with the commit that produced it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceDelta {
    pub beneficiary: Beneficiary,
    pub delta: i128,
    pub kind: DeltaKind,
}

// ---------------------------------------------------------------------------
// Hashable trait
// ---------------------------------------------------------------------------

/// Anything with a canonical byte encoding that identifies it by digest.
pub trait Hashable {
    /// Canonical bytes. Field order and integer endianness are part of the
    /// consensus format and must not change.
    fn to_hash_bytes(&self) -> Vec<u8>;

    fn hash(&self) -> Hash {
        Hash::compute(&self.to_hash_bytes())
    }
}

// ---------------------------------------------------------------------------
// Utility functions
// ---------------------------------------------------------------------------

/// Wall clock in unix milliseconds; 0 if the clock is before 1970.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
