use crate::agreement::{
    accept_client_hello, accept_set_hello, create_client_hello, create_set_hello,
    AgreementKeyPair, KeyPairSet,
};
use crate::error::{CofferError, Result};
use crate::keyset::{KeySet, KeySetHash, KeySetProvider, KeySetSpec};
use rand::rngs::OsRng;
use rand::RngCore;

/// Size of the random key embedded by the keyed-password variant
const RAW_KEY_SIZE: usize = 32;

/// Sanity bound on encoded section lengths
const MAX_SECTION: usize = 4096;

const ENCODING_VERSION: u8 = 1;

const TAG_ABSENT: u8 = 0;
const TAG_RAW_KEY: u8 = 1;
const TAG_AGREEMENT_HELLO: u8 = 2;
const TAG_SET_AGREEMENT_HELLO: u8 = 3;

/// The closed set of authentication methods a lock can bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockVariant {
    /// Password only
    Password,
    /// Password plus an embedded random key as second factor
    KeyedPassword,
    /// Password plus an X25519 key-pair agreement
    KeyPairPassword,
    /// Password plus a key-pair-set agreement
    KeyPairSetPassword,
}

impl std::fmt::Display for LockVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Password => "password",
            Self::KeyedPassword => "keyed-password",
            Self::KeyPairPassword => "key-pair-password",
            Self::KeyPairSetPassword => "key-pair-set-password",
        };
        f.write_str(name)
    }
}

/// Variant-specific payload of a lock encoding.
///
/// The payload kind determines the variant; the two cannot disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockPayload {
    Absent,
    RawKey(Vec<u8>),
    AgreementHello(Vec<u8>),
    KeyPairSetAgreementHello(Vec<u8>),
}

impl LockPayload {
    pub fn variant(&self) -> LockVariant {
        match self {
            Self::Absent => LockVariant::Password,
            Self::RawKey(_) => LockVariant::KeyedPassword,
            Self::AgreementHello(_) => LockVariant::KeyPairPassword,
            Self::KeyPairSetAgreementHello(_) => LockVariant::KeyPairSetPassword,
        }
    }
}

/// Self-describing binary form of a lock: the serialized key-set-hash
/// followed by one explicitly tagged payload.
///
/// Layout: `[version: 1][hash_len: 4][hash][tag: 1]` and, for any tag
/// other than `absent`, `[payload_len: 4][payload]`. Decoding rejects
/// unknown tags outright rather than defaulting to the plain-password
/// interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEncoding {
    pub key_set_hash: Vec<u8>,
    pub payload: LockPayload,
}

impl LockEncoding {
    pub fn variant(&self) -> LockVariant {
        self.payload.variant()
    }

    /// Serialize to the canonical binary form
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(10 + self.key_set_hash.len());
        buf.push(ENCODING_VERSION);
        buf.extend_from_slice(&(self.key_set_hash.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.key_set_hash);
        let (tag, payload) = match &self.payload {
            LockPayload::Absent => (TAG_ABSENT, None),
            LockPayload::RawKey(bytes) => (TAG_RAW_KEY, Some(bytes)),
            LockPayload::AgreementHello(bytes) => (TAG_AGREEMENT_HELLO, Some(bytes)),
            LockPayload::KeyPairSetAgreementHello(bytes) => {
                (TAG_SET_AGREEMENT_HELLO, Some(bytes))
            }
        };
        buf.push(tag);
        if let Some(payload) = payload {
            buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            buf.extend_from_slice(payload);
        }
        buf
    }

    /// Deserialize from the canonical binary form.
    ///
    /// Fails on bad version, unknown tag, truncation, oversized
    /// sections, or trailing bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let version = cursor.take_u8()?;
        if version != ENCODING_VERSION {
            return Err(CofferError::MalformedEncoding(format!(
                "unsupported lock encoding version {}",
                version
            )));
        }
        let hash_len = cursor.take_u32()? as usize;
        if hash_len > MAX_SECTION {
            return Err(CofferError::MalformedEncoding(
                "key-set-hash section too large".into(),
            ));
        }
        let key_set_hash = cursor.take_bytes(hash_len)?.to_vec();
        let tag = cursor.take_u8()?;
        let payload = match tag {
            TAG_ABSENT => LockPayload::Absent,
            TAG_RAW_KEY | TAG_AGREEMENT_HELLO | TAG_SET_AGREEMENT_HELLO => {
                let payload_len = cursor.take_u32()? as usize;
                if payload_len > MAX_SECTION {
                    return Err(CofferError::MalformedEncoding(
                        "payload section too large".into(),
                    ));
                }
                let bytes = cursor.take_bytes(payload_len)?.to_vec();
                match tag {
                    TAG_RAW_KEY => LockPayload::RawKey(bytes),
                    TAG_AGREEMENT_HELLO => LockPayload::AgreementHello(bytes),
                    _ => LockPayload::KeyPairSetAgreementHello(bytes),
                }
            }
            other => {
                return Err(CofferError::MalformedEncoding(format!(
                    "unknown lock payload tag {}",
                    other
                )))
            }
        };
        cursor.expect_end()?;
        Ok(Self {
            key_set_hash,
            payload,
        })
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|&e| e <= self.data.len());
        match end {
            Some(end) => {
                let bytes = &self.data[self.pos..end];
                self.pos = end;
                Ok(bytes)
            }
            None => Err(CofferError::MalformedEncoding(
                "unexpected end of lock encoding".into(),
            )),
        }
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take_bytes(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32> {
        let bytes = self.take_bytes(4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        Ok(u32::from_le_bytes(buf))
    }

    fn expect_end(&self) -> Result<()> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(CofferError::MalformedEncoding(
                "trailing bytes after lock encoding".into(),
            ))
        }
    }
}

/// Mediates between a caller-supplied credential and the derived
/// [`KeySet`].
///
/// A lock created for writing starts unlocked with its key-set known
/// and `fresh` set; a lock decoded from an archive header starts locked
/// and must be driven through one of the `unlock` operations. Once
/// unlocked it never re-locks.
pub struct Lock {
    encoding: LockEncoding,
    key_set: Option<KeySet>,
    fresh: bool,
}

impl Lock {
    /// New plain-password lock, unlocked and fresh.
    pub fn generate_password(password: &str, spec: &KeySetSpec) -> Result<Self> {
        let provider = KeySetProvider::new();
        let (hash, key_set) = provider.generate(spec, password)?;
        Ok(Self::new_fresh(hash, LockPayload::Absent, key_set))
    }

    /// New keyed-password lock: a random key is generated, embedded in
    /// the encoding, and folded into the derivation as a second factor.
    pub fn generate_keyed_password(password: &str, spec: &KeySetSpec) -> Result<Self> {
        let mut raw_key = [0u8; RAW_KEY_SIZE];
        OsRng.fill_bytes(&mut raw_key);
        let provider = KeySetProvider::with_pepper(&raw_key)?;
        let (hash, key_set) = provider.generate(spec, password)?;
        Ok(Self::new_fresh(
            hash,
            LockPayload::RawKey(raw_key.to_vec()),
            key_set,
        ))
    }

    /// New key-pair lock: runs an anonymous agreement against the key
    /// pair and stores the hello for replay at unlock time.
    pub fn generate_key_pair(
        key_pair: &AgreementKeyPair,
        password: &str,
        spec: &KeySetSpec,
    ) -> Result<Self> {
        let (hello, provider) = create_client_hello(key_pair)?;
        let (hash, key_set) = provider.generate(spec, password)?;
        Ok(Self::new_fresh(
            hash,
            LockPayload::AgreementHello(hello),
            key_set,
        ))
    }

    /// New key-pair-set lock.
    pub fn generate_key_pair_set(
        set: &KeyPairSet,
        password: &str,
        spec: &KeySetSpec,
    ) -> Result<Self> {
        let (hello, provider) = create_set_hello(set)?;
        let (hash, key_set) = provider.generate(spec, password)?;
        Ok(Self::new_fresh(
            hash,
            LockPayload::KeyPairSetAgreementHello(hello),
            key_set,
        ))
    }

    fn new_fresh(hash: KeySetHash, payload: LockPayload, key_set: KeySet) -> Self {
        Self {
            encoding: LockEncoding {
                key_set_hash: hash.to_bytes(),
                payload,
            },
            key_set: Some(key_set),
            fresh: true,
        }
    }

    /// Locked lock over an existing encoding (reader side).
    pub fn from_encoding(encoding: LockEncoding) -> Self {
        Self {
            encoding,
            key_set: None,
            fresh: false,
        }
    }

    /// Locked lock decoded from raw header bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(Self::from_encoding(LockEncoding::from_bytes(data)?))
    }

    pub fn variant(&self) -> LockVariant {
        self.encoding.variant()
    }

    pub fn is_locked(&self) -> bool {
        self.key_set.is_none()
    }

    /// True only for a freshly generated lock never yet bound to an
    /// archive.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn encoding(&self) -> &LockEncoding {
        &self.encoding
    }

    /// The derived key-set, available once unlocked.
    pub fn key_set(&self) -> Option<&KeySet> {
        self.key_set.as_ref()
    }

    /// Bind this lock to an archive; called exactly once by a writer.
    pub(crate) fn mark_used(&mut self) {
        self.fresh = false;
    }

    fn ensure_locked(&self) -> Result<()> {
        if self.key_set.is_some() {
            return Err(CofferError::AlreadyUnlocked);
        }
        Ok(())
    }

    /// Unlock with a password. Valid for the password and
    /// keyed-password variants; the embedded raw key is applied
    /// automatically for the latter.
    ///
    /// A wrong password reports `DecryptionFailure` and leaves the lock
    /// locked and retryable.
    pub fn unlock(&mut self, password: &str) -> Result<()> {
        self.ensure_locked()?;
        let provider = match &self.encoding.payload {
            LockPayload::Absent => KeySetProvider::new(),
            LockPayload::RawKey(raw_key) => KeySetProvider::with_pepper(raw_key)?,
            LockPayload::AgreementHello(_) | LockPayload::KeyPairSetAgreementHello(_) => {
                return Err(CofferError::WrongLockType(format!(
                    "{} locks require a key pair",
                    self.variant()
                )))
            }
        };
        self.finish_unlock(&provider, password)
    }

    /// Unlock a key-pair lock by replaying the stored hello against the
    /// supplied key pair. A wrong key pair and a wrong password are
    /// indistinguishable: both report `DecryptionFailure`.
    pub fn unlock_with_key_pair(
        &mut self,
        key_pair: &AgreementKeyPair,
        password: &str,
    ) -> Result<()> {
        self.ensure_locked()?;
        let provider = match &self.encoding.payload {
            LockPayload::AgreementHello(hello) => accept_client_hello(key_pair, hello)?,
            _ => {
                return Err(CofferError::WrongLockType(format!(
                    "cannot unlock a {} lock with a key pair",
                    self.variant()
                )))
            }
        };
        self.finish_unlock(&provider, password)
    }

    /// Unlock a key-pair-set lock.
    pub fn unlock_with_key_pair_set(&mut self, set: &KeyPairSet, password: &str) -> Result<()> {
        self.ensure_locked()?;
        let provider = match &self.encoding.payload {
            LockPayload::KeyPairSetAgreementHello(hello) => accept_set_hello(set, hello)?,
            _ => {
                return Err(CofferError::WrongLockType(format!(
                    "cannot unlock a {} lock with a key-pair set",
                    self.variant()
                )))
            }
        };
        self.finish_unlock(&provider, password)
    }

    fn finish_unlock(&mut self, provider: &KeySetProvider, password: &str) -> Result<()> {
        let hash = KeySetHash::from_bytes(&self.encoding.key_set_hash)?;
        let key_set = provider.derive(&hash, password)?;
        self.key_set = Some(key_set);
        tracing::debug!(variant = %self.variant(), "lock unlocked");
        Ok(())
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("variant", &self.variant())
            .field("locked", &self.is_locked())
            .field("fresh", &self.fresh)
            .finish()
    }
}
