//! zkML proof verification seam.
//!
//! The consensus core never looks inside a proof. It hands the opaque proof
//! bytes and the canonical public inputs to a [`ProofVerifier`] and acts on
//! the boolean verdict. Two implementations ship with the crate:
//!
//! - [`CommitmentVerifier`]: a keyed SHA-256 commitment scheme. Workers holding
//!   the circuit key produce `SHA-256(domain || key || public_inputs)`; the
//!   verifier recomputes it. It binds a proof to the exact inputs it claims
//!   and is the default backend until a SNARK verifier is plugged in.
//! - [`StaticVerifier`]: a test double with a fixed verdict and a call counter.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use sha2::{Digest, Sha256};

/// Size of a commitment proof in bytes (SHA-256 output).
pub const COMMITMENT_PROOF_SIZE: usize = 32;

const COMMITMENT_DOMAIN: &[u8] = b"SYNAPSE_ZKML_COMMITMENT_V1";

/// Contract every proof backend satisfies.
pub trait ProofVerifier: Send + Sync + std::fmt::Debug {
    /// Verify `proof` against `public_inputs`. Must be side-effect free with
    /// respect to chain state.
    fn verify(&self, proof: &[u8], public_inputs: &[u8]) -> bool;

    /// Return the name of this backend (for logging).
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// CommitmentVerifier
// ---------------------------------------------------------------------------

/// Keyed hash-commitment verifier.
#[derive(Clone, Debug)]
pub struct CommitmentVerifier {
    circuit_key: Vec<u8>,
}

impl CommitmentVerifier {
    pub fn new(circuit_key: impl Into<Vec<u8>>) -> Self {
        Self {
            circuit_key: circuit_key.into(),
        }
    }

    /// Generate a random 32-byte circuit key.
    pub fn generate_key() -> Vec<u8> {
        use rand::RngCore;
        let mut key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    /// Produce the proof a worker holding the circuit key would submit.
    pub fn prove(&self, public_inputs: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(COMMITMENT_DOMAIN);
        hasher.update(&self.circuit_key);
        hasher.update(public_inputs);
        hasher.finalize().to_vec()
    }
}

impl ProofVerifier for CommitmentVerifier {
    fn verify(&self, proof: &[u8], public_inputs: &[u8]) -> bool {
        if proof.len() != COMMITMENT_PROOF_SIZE {
            return false;
        }
        let expected = self.prove(public_inputs);
        proof == expected.as_slice()
    }

    fn name(&self) -> &str {
        "CommitmentVerifier (keyed SHA-256)"
    }
}

// ---------------------------------------------------------------------------
// StaticVerifier: test double
// ---------------------------------------------------------------------------

/// Returns a configurable verdict for every proof and counts invocations.
#[derive(Debug)]
pub struct StaticVerifier {
    verdict: AtomicBool,
    calls: AtomicU64,
}

impl StaticVerifier {
    pub fn accepting() -> Self {
        Self::with_verdict(true)
    }

    pub fn rejecting() -> Self {
        Self::with_verdict(false)
    }

    pub fn with_verdict(verdict: bool) -> Self {
        Self {
            verdict: AtomicBool::new(verdict),
            calls: AtomicU64::new(0),
        }
    }

    pub fn set_verdict(&self, verdict: bool) {
        self.verdict.store(verdict, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ProofVerifier for StaticVerifier {
    fn verify(&self, _proof: &[u8], _public_inputs: &[u8]) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.verdict.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "StaticVerifier"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
