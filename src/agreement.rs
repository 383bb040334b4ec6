//! Anonymous X25519 key agreement backing the key-pair lock variants.
//!
//! Creation runs an ephemeral agreement against the key pair's public
//! half and yields a "client hello" (the ephemeral public key) plus a
//! peppered [`KeySetProvider`]. Unlocking replays the stored hello
//! against the private half to recover the same provider. A wrong key
//! pair produces a different pepper and surfaces later as
//! `DecryptionFailure`; nothing here confirms or denies key ownership.

use crate::error::{CofferError, Result};
use crate::keyset::KeySetProvider;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

/// Size of an X25519 public key / client hello in bytes
pub const HELLO_SIZE: usize = 32;

/// Domain separation for the single key-pair flavor
const AGREEMENT_INFO: &[u8] = b"coffer-agreement-v1";

/// Domain separation for the key-pair-set flavor
const AGREEMENT_SET_INFO: &[u8] = b"coffer-agreement-set-v1";

/// A static X25519 key pair used as a second unlock factor.
pub struct AgreementKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl AgreementKeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Reconstruct from stored secret bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Secret key bytes, for backup storage only
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Public key bytes
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    fn diffie_hellman(&self, their_public: &PublicKey) -> [u8; 32] {
        self.secret.diffie_hellman(their_public).to_bytes()
    }
}

impl std::fmt::Debug for AgreementKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgreementKeyPair")
            .field("public", &hex::encode(self.public.to_bytes()))
            .finish_non_exhaustive()
    }
}

/// A set of two agreement key pairs unlocked together.
///
/// The hello runs one ephemeral against both public halves; both shared
/// secrets feed the derivation, so both private halves are required to
/// unlock.
pub struct KeyPairSet {
    primary: AgreementKeyPair,
    secondary: AgreementKeyPair,
}

impl KeyPairSet {
    /// Generate a set of two fresh key pairs
    pub fn generate() -> Self {
        Self {
            primary: AgreementKeyPair::generate(),
            secondary: AgreementKeyPair::generate(),
        }
    }

    /// Assemble from existing key pairs
    pub fn new(primary: AgreementKeyPair, secondary: AgreementKeyPair) -> Self {
        Self { primary, secondary }
    }

    pub fn primary(&self) -> &AgreementKeyPair {
        &self.primary
    }

    pub fn secondary(&self) -> &AgreementKeyPair {
        &self.secondary
    }
}

fn provider_from_agreement(ikm: &[u8], hello: &[u8], info: &[u8]) -> Result<KeySetProvider> {
    let hk = Hkdf::<Sha256>::new(Some(hello), ikm);
    let mut secret = [0u8; 32];
    hk.expand(info, &mut secret)
        .map_err(|_| CofferError::KeyDerivation("agreement expansion failed".into()))?;
    KeySetProvider::with_pepper(&secret)
}

fn parse_hello(hello: &[u8]) -> Result<PublicKey> {
    let bytes: [u8; HELLO_SIZE] = hello.try_into().map_err(|_| {
        CofferError::MalformedEncoding(format!("agreement hello must be {} bytes", HELLO_SIZE))
    })?;
    Ok(PublicKey::from(bytes))
}

/// Run a fresh agreement against `key_pair`, returning the hello bytes
/// to embed in the lock encoding and the derived provider.
pub fn create_client_hello(key_pair: &AgreementKeyPair) -> Result<(Vec<u8>, KeySetProvider)> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let hello = PublicKey::from(&ephemeral).to_bytes().to_vec();
    let shared = ephemeral.diffie_hellman(&key_pair.public).to_bytes();
    let provider = provider_from_agreement(&shared, &hello, AGREEMENT_INFO)?;
    Ok((hello, provider))
}

/// Replay a stored hello against `key_pair` to recover the provider.
pub fn accept_client_hello(key_pair: &AgreementKeyPair, hello: &[u8]) -> Result<KeySetProvider> {
    let ephemeral_public = parse_hello(hello)?;
    let shared = key_pair.diffie_hellman(&ephemeral_public);
    provider_from_agreement(&shared, hello, AGREEMENT_INFO)
}

/// Run a fresh agreement against both pairs of `set`.
pub fn create_set_hello(set: &KeyPairSet) -> Result<(Vec<u8>, KeySetProvider)> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let hello = PublicKey::from(&ephemeral).to_bytes().to_vec();
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(&ephemeral.diffie_hellman(&set.primary.public).to_bytes());
    ikm[32..].copy_from_slice(&ephemeral.diffie_hellman(&set.secondary.public).to_bytes());
    let provider = provider_from_agreement(&ikm, &hello, AGREEMENT_SET_INFO)?;
    Ok((hello, provider))
}

/// Replay a stored set hello against `set` to recover the provider.
pub fn accept_set_hello(set: &KeyPairSet, hello: &[u8]) -> Result<KeySetProvider> {
    let ephemeral_public = parse_hello(hello)?;
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(&set.primary.diffie_hellman(&ephemeral_public));
    ikm[32..].copy_from_slice(&set.secondary.diffie_hellman(&ephemeral_public));
    provider_from_agreement(&ikm, hello, AGREEMENT_SET_INFO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyset::KeySetSpec;

    fn test_spec() -> KeySetSpec {
        KeySetSpec {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_hello_replay_recovers_provider() {
        let pair = AgreementKeyPair::generate();
        let (hello, creator) = create_client_hello(&pair).unwrap();
        let (hash, _) = creator.generate(&test_spec(), "pw").unwrap();

        let acceptor = accept_client_hello(&pair, &hello).unwrap();
        assert!(acceptor.derive(&hash, "pw").is_ok());
    }

    #[test]
    fn test_wrong_key_pair_cannot_derive() {
        let pair = AgreementKeyPair::generate();
        let other = AgreementKeyPair::generate();
        let (hello, creator) = create_client_hello(&pair).unwrap();
        let (hash, _) = creator.generate(&test_spec(), "pw").unwrap();

        let acceptor = accept_client_hello(&other, &hello).unwrap();
        assert!(matches!(
            acceptor.derive(&hash, "pw"),
            Err(crate::CofferError::DecryptionFailure)
        ));
    }

    #[test]
    fn test_set_hello_requires_both_pairs() {
        let set = KeyPairSet::generate();
        let (hello, creator) = create_set_hello(&set).unwrap();
        let (hash, _) = creator.generate(&test_spec(), "pw").unwrap();

        let acceptor = accept_set_hello(&set, &hello).unwrap();
        assert!(acceptor.derive(&hash, "pw").is_ok());

        // Replacing either pair breaks the derivation
        let swapped = KeyPairSet::new(
            AgreementKeyPair::from_bytes(set.primary().secret_bytes()),
            AgreementKeyPair::generate(),
        );
        let wrong = accept_set_hello(&swapped, &hello).unwrap();
        assert!(wrong.derive(&hash, "pw").is_err());
    }

    #[test]
    fn test_malformed_hello_rejected() {
        let pair = AgreementKeyPair::generate();
        assert!(matches!(
            accept_client_hello(&pair, b"short"),
            Err(crate::CofferError::MalformedEncoding(_))
        ));
    }

    #[test]
    fn test_key_pair_from_bytes_roundtrip() {
        let pair = AgreementKeyPair::generate();
        let restored = AgreementKeyPair::from_bytes(pair.secret_bytes());
        assert_eq!(pair.public_bytes(), restored.public_bytes());
    }
}
