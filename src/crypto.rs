use std::fs;
use std::path::Path;

use bulletproofs::{BulletproofGens, PedersenGens, RangeProof};
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use merlin::Transcript;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::types::Hash;

const RANGE_PROOF_LABEL: &[u8] = b"veil.range";
const RANGE_PROOF_BITS: usize = 64;
const KDF_DOMAIN: &[u8] = b"veil.kdf";
const NONCE_DOMAIN: &[u8] = b"veil.schnorr.nonce";
const CHALLENGE_DOMAIN: &[u8] = b"veil.schnorr.challenge";

pub fn hash_bytes(data: &[u8]) -> Hash {
    blake3::hash(data).into()
}

/// Pedersen and range-proof generator sets, built once and shared.
pub struct Generators {
    pub pc: PedersenGens,
    pub bp: BulletproofGens,
}

impl Generators {
    pub fn new() -> Self {
        Self {
            pc: PedersenGens::default(),
            bp: BulletproofGens::new(RANGE_PROOF_BITS, 1),
        }
    }

    /// `value * B + blinding * B_blinding`.
    pub fn commit(&self, value: u64, blinding: &Scalar) -> RistrettoPoint {
        self.pc.commit(Scalar::from(value), *blinding)
    }

    /// Commitment to zero on the blinding axis: excess points and the
    /// public keys of kernel signatures live here.
    pub fn excess(&self, key: &Scalar) -> RistrettoPoint {
        key * self.pc.B_blinding
    }
}

impl Default for Generators {
    fn default() -> Self {
        Self::new()
    }
}

fn wide_scalar(mut hasher: blake3::Hasher) -> Scalar {
    let mut wide = [0u8; 64];
    hasher.finalize_xof().fill(&mut wide);
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// Prove that `value` lies in `[0, 2^64)` behind a fresh commitment.
/// Returns the commitment together with the serialized proof.
pub fn prove_range(
    gens: &Generators,
    value: u64,
    blinding: &Scalar,
) -> ChainResult<(CompressedRistretto, Vec<u8>)> {
    let mut transcript = Transcript::new(RANGE_PROOF_LABEL);
    let (proof, commitment) = RangeProof::prove_single(
        &gens.bp,
        &gens.pc,
        &mut transcript,
        value,
        blinding,
        RANGE_PROOF_BITS,
    )
    .map_err(|err| ChainError::Crypto(format!("range proof generation failed: {err}")))?;
    Ok((commitment, proof.to_bytes()))
}

/// Verify a serialized range proof against its commitment.
pub fn verify_range(gens: &Generators, commitment: &CompressedRistretto, proof: &[u8]) -> bool {
    let Ok(proof) = RangeProof::from_bytes(proof) else {
        return false;
    };
    let mut transcript = Transcript::new(RANGE_PROOF_LABEL);
    proof
        .verify_single(
            &gens.bp,
            &gens.pc,
            &mut transcript,
            commitment,
            RANGE_PROOF_BITS,
        )
        .is_ok()
}

/// Schnorr signature over the blinding generator, proving knowledge of the
/// scalar behind an excess point.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchnorrSignature {
    pub nonce_point: CompressedRistretto,
    pub s: Scalar,
}

fn challenge(nonce_point: &CompressedRistretto, public: &CompressedRistretto, msg: &Hash) -> Scalar {
    let mut hasher = blake3::Hasher::new();
    hasher.update(CHALLENGE_DOMAIN);
    hasher.update(nonce_point.as_bytes());
    hasher.update(public.as_bytes());
    hasher.update(msg);
    wide_scalar(hasher)
}

/// Sign `msg` with the excess key. The nonce is derived deterministically
/// from the key and message, so signing never consumes entropy.
pub fn sign_excess(gens: &Generators, key: &Scalar, msg: &Hash) -> SchnorrSignature {
    let mut hasher = blake3::Hasher::new();
    hasher.update(NONCE_DOMAIN);
    hasher.update(key.as_bytes());
    hasher.update(msg);
    let nonce = wide_scalar(hasher);
    let nonce_point = (nonce * gens.pc.B_blinding).compress();
    let public = gens.excess(key).compress();
    let e = challenge(&nonce_point, &public, msg);
    SchnorrSignature {
        nonce_point,
        s: nonce + e * key,
    }
}

pub fn verify_excess(
    gens: &Generators,
    public: &CompressedRistretto,
    msg: &Hash,
    signature: &SchnorrSignature,
) -> bool {
    let Some(public_point) = public.decompress() else {
        return false;
    };
    let Some(nonce_point) = signature.nonce_point.decompress() else {
        return false;
    };
    let e = challenge(&signature.nonce_point, public, msg);
    signature.s * gens.pc.B_blinding == nonce_point + e * public_point
}

/// Typed uses of the master derivation function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyUsage {
    Commission,
    Coinbase,
    Kernel,
}

impl KeyUsage {
    fn tag(self) -> u8 {
        match self {
            KeyUsage::Commission => 0,
            KeyUsage::Coinbase => 1,
            KeyUsage::Kernel => 2,
        }
    }
}

/// Master key-derivation function. One secret seed deterministically yields
/// every blinding and kernel key the node ever uses.
#[derive(Clone)]
pub struct Kdf {
    seed: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSeed {
    seed: String,
}

impl Kdf {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self { seed }
    }

    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self { seed }
    }

    pub fn load_or_generate(path: &Path) -> ChainResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let kdf = Self::generate();
            kdf.save(path)?;
            Ok(kdf)
        }
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let stored = StoredSeed {
            seed: hex::encode(self.seed),
        };
        let encoded = toml::to_string_pretty(&stored)
            .map_err(|err| ChainError::Config(format!("failed to encode seed: {err}")))?;
        fs::create_dir_all(path.parent().unwrap_or_else(|| Path::new(".")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn load(path: &Path) -> ChainResult<Self> {
        let raw = fs::read_to_string(path)?;
        let stored: StoredSeed = toml::from_str(&raw)
            .map_err(|err| ChainError::Config(format!("failed to decode seed: {err}")))?;
        let bytes = hex::decode(stored.seed)
            .map_err(|err| ChainError::Config(format!("invalid seed encoding: {err}")))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ChainError::Config("seed must be 32 bytes".into()))?;
        Ok(Self { seed })
    }

    /// Public identifier of the seed, safe to persist alongside chain state.
    pub fn seed_id(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(KDF_DOMAIN);
        hasher.update(&self.seed);
        hasher.finalize().into()
    }

    pub fn derive(&self, height: u64, usage: KeyUsage, idx: u32) -> Scalar {
        let mut hasher = blake3::Hasher::new_keyed(&self.seed);
        hasher.update(KDF_DOMAIN);
        hasher.update(&height.to_be_bytes());
        hasher.update(&[usage.tag()]);
        hasher.update(&idx.to_be_bytes());
        wide_scalar(hasher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn schnorr_round_trip() {
        let gens = Generators::new();
        let kdf = Kdf::from_seed([7u8; 32]);
        let key = kdf.derive(3, KeyUsage::Kernel, 0);
        let msg = hash_bytes(b"kernel message");
        let sig = sign_excess(&gens, &key, &msg);
        let public = gens.excess(&key).compress();
        assert!(verify_excess(&gens, &public, &msg, &sig));

        let other = hash_bytes(b"another message");
        assert!(!verify_excess(&gens, &public, &other, &sig));
        let wrong_key = kdf.derive(4, KeyUsage::Kernel, 0);
        let wrong_public = gens.excess(&wrong_key).compress();
        assert!(!verify_excess(&gens, &wrong_public, &msg, &sig));
    }

    #[test]
    fn range_proof_round_trip() {
        let gens = Generators::new();
        let blinding = Kdf::from_seed([1u8; 32]).derive(0, KeyUsage::Coinbase, 0);
        let (commitment, proof) = prove_range(&gens, 1_000, &blinding).expect("prove");
        assert!(verify_range(&gens, &commitment, &proof));

        let other = gens.commit(1_001, &blinding).compress();
        assert!(!verify_range(&gens, &other, &proof));
        assert!(!verify_range(&gens, &commitment, b"garbage"));
    }

    #[test]
    fn derivation_is_deterministic_and_typed() {
        let kdf = Kdf::from_seed([9u8; 32]);
        assert_eq!(
            kdf.derive(10, KeyUsage::Coinbase, 0),
            kdf.derive(10, KeyUsage::Coinbase, 0)
        );
        assert_ne!(
            kdf.derive(10, KeyUsage::Coinbase, 0),
            kdf.derive(10, KeyUsage::Kernel, 0)
        );
        assert_ne!(
            kdf.derive(10, KeyUsage::Coinbase, 0),
            kdf.derive(11, KeyUsage::Coinbase, 0)
        );
    }

    #[test]
    fn seed_file_round_trip() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("keys/seed.toml");
        let kdf = Kdf::load_or_generate(&path).expect("generate");
        let reloaded = Kdf::load_or_generate(&path).expect("reload");
        assert_eq!(kdf.seed_id(), reloaded.seed_id());
    }
}
