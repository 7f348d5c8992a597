//! Cryptographic primitives for CoValues.
//!
//! Wraps Ed25519 signing, X25519 sealing, ChaCha20-Poly1305 symmetric
//! encryption and Blake3 hashing with strong types.
//!
//! Encryption never takes a raw nonce. Callers pass *nonce material*, any
//! serializable context (typically the CoValue id and transaction id), and
//! the 12-byte nonce is derived from its JSON encoding. The same material
//! must be supplied to decrypt.

use std::fmt;
use std::str::FromStr;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::Serialize;
use x25519_dalek::{PublicKey as DalekSealerKey, StaticSecret};

use crate::encoding::{decode_prefixed, prefixed_hex, string_serde};
use crate::error::{CoreError, Result};

const SEAL_CONTEXT: &str = "covalent 2024 sealed key exchange v0";

/// A 32-byte Blake3 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(pub [u8; 32]);

prefixed_hex!(Hash, "hash_", 32);

impl Hash {
    /// Compute the Blake3 hash of the given data.
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Incremental Blake3 hasher over a session's transactions.
///
/// Cloning is cheap and lets callers compute a prospective hash without
/// disturbing the committed state.
#[derive(Clone, Debug, Default)]
pub struct StreamingHash(blake3::Hasher);

impl StreamingHash {
    /// Create an empty streaming hash.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the hash.
    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    /// Current digest. Does not consume or reset the state.
    pub fn digest(&self) -> Hash {
        Hash(*self.0.finalize().as_bytes())
    }
}

/// A 64-byte Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

prefixed_hex!(Signature, "signature_", 64);

/// An Ed25519 public key identifying who signed a session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignerId(pub [u8; 32]);

prefixed_hex!(SignerId, "signer_", 32);

impl SignerId {
    /// Verify a signature over a hash.
    pub fn verify(&self, hash: &Hash, signature: &Signature) -> Result<()> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CoreError::InvalidPublicKey)?;
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        verifying_key
            .verify(hash.as_bytes(), &sig)
            .map_err(|_| CoreError::InvalidSignature)
    }
}

/// An X25519 public key used to seal secrets to an agent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SealerId(pub [u8; 32]);

prefixed_hex!(SealerId, "sealer_", 32);

/// Identifier of a symmetric key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(pub [u8; 12]);

prefixed_hex!(KeyId, "key_", 12);

/// A 256-bit ChaCha20-Poly1305 key.
#[derive(Clone, PartialEq, Eq)]
pub struct KeySecret(pub [u8; 32]);

prefixed_hex!(KeySecret, "keySecret_", 32, secret);

/// Symmetrically encrypted bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Encrypted(pub Vec<u8>);

prefixed_hex!(Encrypted, "encrypted_", vec);

/// Bytes sealed from one agent to another.
#[derive(Clone, PartialEq, Eq)]
pub struct Sealed(pub Vec<u8>);

prefixed_hex!(Sealed, "sealed_", vec);

impl Encrypted {
    /// Length of the encoded string form, used for piece sizing.
    pub fn encoded_len(&self) -> usize {
        "encrypted_".len() + self.0.len() * 2
    }
}

impl KeySecret {
    /// Generate a new random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encrypt `plaintext`, deriving the nonce from `nonce_material`.
    pub fn encrypt<N: Serialize + ?Sized>(&self, plaintext: &[u8], nonce_material: &N) -> Result<Encrypted> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CoreError::Encryption(e.to_string()))?;
        let nonce = nonce_from_material(nonce_material)?;
        cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map(Encrypted)
            .map_err(|e| CoreError::Encryption(e.to_string()))
    }

    /// Decrypt data produced by [`KeySecret::encrypt`] with the same material.
    pub fn decrypt<N: Serialize + ?Sized>(&self, encrypted: &Encrypted, nonce_material: &N) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CoreError::Decryption(e.to_string()))?;
        let nonce = nonce_from_material(nonce_material)?;
        cipher
            .decrypt(Nonce::from_slice(&nonce), encrypted.0.as_slice())
            .map_err(|e| CoreError::Decryption(e.to_string()))
    }
}

/// Generate a fresh symmetric key together with its random id.
pub fn new_random_key() -> (KeyId, KeySecret) {
    let mut id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut id);
    (KeyId(id), KeySecret::generate())
}

/// Public identity of an agent: who signs and who can be sealed to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId {
    pub signer: SignerId,
    pub sealer: SealerId,
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent_{}_{}", hex::encode(self.signer.0), hex::encode(self.sealer.0))
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Agent({})", &hex::encode(self.signer.0)[..16])
    }
}

impl FromStr for AgentId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let body = s
            .strip_prefix("agent_")
            .ok_or_else(|| CoreError::InvalidEncoding(format!("not an agent id: {s:?}")))?;
        let (signer, sealer) = body
            .split_once('_')
            .ok_or_else(|| CoreError::InvalidEncoding(format!("malformed agent id: {s:?}")))?;
        Ok(Self {
            signer: format!("signer_{signer}").parse()?,
            sealer: format!("sealer_{sealer}").parse()?,
        })
    }
}

string_serde!(AgentId);

/// Secret material of an agent: an Ed25519 signing key and an X25519 sealing key.
#[derive(Clone)]
pub struct AgentSecret {
    signer: SigningKey,
    sealer: StaticSecret,
}

impl AgentSecret {
    /// Generate a new random agent.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let signer = SigningKey::generate(&mut rng);
        let mut sealer = [0u8; 32];
        rng.fill_bytes(&mut sealer);
        Self {
            signer,
            sealer: StaticSecret::from(sealer),
        }
    }

    /// Create from two 32-byte seeds.
    pub fn from_seeds(signer_seed: [u8; 32], sealer_seed: [u8; 32]) -> Self {
        Self {
            signer: SigningKey::from_bytes(&signer_seed),
            sealer: StaticSecret::from(sealer_seed),
        }
    }

    /// The agent's public identity.
    pub fn id(&self) -> AgentId {
        AgentId {
            signer: SignerId(self.signer.verifying_key().to_bytes()),
            sealer: SealerId(DalekSealerKey::from(&self.sealer).to_bytes()),
        }
    }

    /// Sign a hash.
    pub fn sign(&self, hash: &Hash) -> Signature {
        Signature(self.signer.sign(hash.as_bytes()).to_bytes())
    }

    /// Seal `message` so that only the holder of `to`'s secret can open it,
    /// and they can verify it came from this agent.
    pub fn seal<N: Serialize + ?Sized>(&self, message: &[u8], to: &SealerId, nonce_material: &N) -> Result<Sealed> {
        let key = self.shared_key(to);
        key.encrypt(message, nonce_material).map(|e| Sealed(e.0))
    }

    /// Open a message sealed to this agent by the holder of `from`.
    pub fn open<N: Serialize + ?Sized>(&self, sealed: &Sealed, from: &SealerId, nonce_material: &N) -> Result<Vec<u8>> {
        let key = self.shared_key(from);
        key.decrypt(&Encrypted(sealed.0.clone()), nonce_material)
    }

    fn shared_key(&self, other: &SealerId) -> KeySecret {
        let shared = self.sealer.diffie_hellman(&DalekSealerKey::from(other.0));
        KeySecret(blake3::derive_key(SEAL_CONTEXT, shared.as_bytes()))
    }
}

impl fmt::Display for AgentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "agentSecret_{}{}",
            hex::encode(self.signer.to_bytes()),
            hex::encode(self.sealer.to_bytes())
        )
    }
}

impl fmt::Debug for AgentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentSecret({:?})", self.id())
    }
}

impl FromStr for AgentSecret {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = decode_prefixed(s, "agentSecret_")?;
        if bytes.len() != 64 {
            return Err(CoreError::InvalidEncoding("agent secret must encode 64 bytes".into()));
        }
        let mut signer = [0u8; 32];
        let mut sealer = [0u8; 32];
        signer.copy_from_slice(&bytes[..32]);
        sealer.copy_from_slice(&bytes[32..]);
        Ok(Self::from_seeds(signer, sealer))
    }
}

/// Generate a new random agent secret.
pub fn new_random_agent_secret() -> AgentSecret {
    AgentSecret::generate()
}

/// Verify `signature` over `hash` by `signer`.
pub fn verify(signature: &Signature, hash: &Hash, signer: &SignerId) -> bool {
    signer.verify(hash, signature).is_ok()
}

fn nonce_from_material<N: Serialize + ?Sized>(material: &N) -> Result<[u8; 12]> {
    let bytes = serde_json::to_vec(material)?;
    let digest = blake3::hash(&bytes);
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&digest.as_bytes()[..12]);
    Ok(nonce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sign_verify() {
        let agent = AgentSecret::generate();
        let hash = Hash::of(b"hello");
        let sig = agent.sign(&hash);

        assert!(verify(&sig, &hash, &agent.id().signer));
        assert!(!verify(&sig, &Hash::of(b"other"), &agent.id().signer));

        let other = AgentSecret::generate();
        assert!(!verify(&sig, &hash, &other.id().signer));
    }

    #[test]
    fn test_streaming_hash_matches_clone() {
        let mut a = StreamingHash::new();
        a.update(b"one");
        let mut b = a.clone();
        b.update(b"two");

        assert_ne!(a.digest(), b.digest());
        a.update(b"two");
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_encrypt_decrypt() {
        let (_, key) = new_random_key();
        let material = json!({"in": "co_abc", "tx": 1});
        let encrypted = key.encrypt(b"secret", &material).unwrap();

        assert_eq!(key.decrypt(&encrypted, &material).unwrap(), b"secret");
        assert!(key.decrypt(&encrypted, &json!({"in": "co_abc", "tx": 2})).is_err());
        assert!(KeySecret::generate().decrypt(&encrypted, &material).is_err());
    }

    #[test]
    fn test_seal_open() {
        let alice = AgentSecret::generate();
        let bob = AgentSecret::generate();
        let eve = AgentSecret::generate();
        let material = json!({"in": "co_group"});

        let sealed = alice.seal(b"key", &bob.id().sealer, &material).unwrap();
        assert_eq!(bob.open(&sealed, &alice.id().sealer, &material).unwrap(), b"key");
        assert!(eve.open(&sealed, &alice.id().sealer, &material).is_err());
    }

    #[test]
    fn test_string_roundtrips() {
        let agent = AgentSecret::generate();
        let id = agent.id();
        let parsed: AgentId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        let secret: AgentSecret = agent.to_string().parse().unwrap();
        assert_eq!(secret.id(), id);

        let (key_id, _) = new_random_key();
        assert_eq!(key_id.to_string().parse::<KeyId>().unwrap(), key_id);
        assert!(key_id.to_string().starts_with("key_"));

        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(serde_json::from_str::<AgentId>(&json).unwrap(), id);
    }

    #[test]
    fn test_key_secret_debug_is_redacted() {
        let key = KeySecret([7u8; 32]);
        assert_eq!(format!("{key:?}"), "KeySecret(<redacted>)");
    }
}
