use crate::error::{CofferError, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce as AesNonce};
use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::io::{self, BufReader, Read, Write};
use zeroize::ZeroizeOnDrop;

/// Salt size for the password KDF in bytes
pub const SALT_SIZE: usize = 16;

/// AES-GCM nonce size in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Symmetric key size in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Plaintext chunk size for streaming transforms
const CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound accepted when reading back transform metadata
const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// zstd level used for compressed entry streams
const COMPRESSION_LEVEL: i32 = 3;

/// Frame flag marking the final chunk of a stream
const FLAG_LAST: u8 = 0x01;

/// Domain separation strings for key derivation and AEAD binding
mod domain {
    /// Folds an out-of-band secret into the password material
    pub const PEPPER: &[u8] = b"coffer-pepper-v1";

    /// Peppered-password expansion
    pub const PEPPERED_PASSWORD: &[u8] = b"coffer-peppered-password-v1";

    /// AAD for one-shot blob encryption
    pub const BLOB: &[u8] = b"coffer-blob-v1";

    /// AAD for wrapping the master key inside a key-set-hash
    pub const KEY_WRAP: &[u8] = b"coffer-key-wrap-v1";
}

/// Argon2id cost parameters for generating a new key-set-hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySetSpec {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl Default for KeySetSpec {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// A password-derived, salted, wrapped-key structure.
///
/// Holds everything needed to recover the key-set given the correct
/// password: the Argon2id cost parameters, the salt, and the random
/// master key wrapped with the password-derived KEK.
///
/// Layout: `[version: 1][memory: 4][iterations: 4][parallelism: 4]`
/// `[salt: 16][nonce: 12][wrapped_len: 4][wrapped key...]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySetHash {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
    pub salt: [u8; SALT_SIZE],
    pub nonce: [u8; NONCE_SIZE],
    pub wrapped_key: Vec<u8>,
}

impl KeySetHash {
    const VERSION: u8 = 1;

    /// Fixed-size prefix before the wrapped key blob
    const PREFIX_SIZE: usize = 1 + 4 + 4 + 4 + SALT_SIZE + NONCE_SIZE + 4;

    pub fn spec(&self) -> KeySetSpec {
        KeySetSpec {
            memory_kib: self.memory_kib,
            iterations: self.iterations,
            parallelism: self.parallelism,
        }
    }

    /// Serialize to the canonical binary form
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::PREFIX_SIZE + self.wrapped_key.len());
        buf.push(Self::VERSION);
        buf.extend_from_slice(&self.memory_kib.to_le_bytes());
        buf.extend_from_slice(&self.iterations.to_le_bytes());
        buf.extend_from_slice(&self.parallelism.to_le_bytes());
        buf.extend_from_slice(&self.salt);
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&(self.wrapped_key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.wrapped_key);
        buf
    }

    /// Deserialize from the canonical binary form, rejecting trailing data
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::PREFIX_SIZE {
            return Err(CofferError::MalformedEncoding(
                "key-set-hash too short".into(),
            ));
        }
        if data[0] != Self::VERSION {
            return Err(CofferError::MalformedEncoding(format!(
                "unsupported key-set-hash version {}",
                data[0]
            )));
        }
        let memory_kib = read_u32(&data[1..5]);
        let iterations = read_u32(&data[5..9]);
        let parallelism = read_u32(&data[9..13]);
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&data[13..13 + SALT_SIZE]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&data[13 + SALT_SIZE..13 + SALT_SIZE + NONCE_SIZE]);
        let wrapped_len = read_u32(&data[Self::PREFIX_SIZE - 4..Self::PREFIX_SIZE]) as usize;
        if wrapped_len > 1024 {
            return Err(CofferError::MalformedEncoding(
                "wrapped key unreasonably large".into(),
            ));
        }
        if data.len() != Self::PREFIX_SIZE + wrapped_len {
            return Err(CofferError::MalformedEncoding(
                "key-set-hash length mismatch".into(),
            ));
        }
        Ok(Self {
            memory_kib,
            iterations,
            parallelism,
            salt,
            nonce,
            wrapped_key: data[Self::PREFIX_SIZE..].to_vec(),
        })
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

/// Per-entry streaming transform parameters, recorded in the archive
/// directory so the entry can be opened again later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamTransform {
    /// Random nonce seed; chunk nonces are derived from it by counter
    pub seed: [u8; NONCE_SIZE],
    /// Plaintext chunk size used while sealing
    pub chunk_size: u32,
    /// Whether the plaintext was zstd-compressed before sealing
    pub compressed: bool,
}

/// Opaque symmetric key bundle recovered from a key-set-hash.
///
/// Encrypts/decrypts one-shot blobs and builds streaming transforms for
/// archive entries. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct KeySet {
    master: [u8; KEY_SIZE],
}

impl KeySet {
    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.master)
            .map_err(|e| CofferError::KeyDerivation(format!("invalid key: {}", e)))
    }

    /// Encrypt a blob in one shot; the random nonce is prepended.
    pub fn encrypt_bytes(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher()?;
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(
                AesNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: domain::BLOB,
                },
            )
            .map_err(|_| CofferError::EncryptionFailure)?;
        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a blob produced by `encrypt_bytes`.
    ///
    /// A wrong key and corrupted ciphertext are indistinguishable: both
    /// report `DecryptionFailure`.
    pub fn decrypt_bytes(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CofferError::DecryptionFailure);
        }
        let cipher = self.cipher()?;
        cipher
            .decrypt(
                AesNonce::from_slice(&data[..NONCE_SIZE]),
                Payload {
                    msg: &data[NONCE_SIZE..],
                    aad: domain::BLOB,
                },
            )
            .map_err(|_| CofferError::DecryptionFailure)
    }

    /// Build the sealing transform for one entry stream.
    ///
    /// Plaintext flows through optional zstd compression into chunked
    /// AEAD framing. `finish()` on the returned writer yields the inner
    /// writer back together with the transform metadata the directory
    /// must record.
    pub fn sealing_writer<W: Write>(&self, inner: W, compress: bool) -> Result<SealingWriter<W>> {
        let mut seed = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut seed);
        let meta = StreamTransform {
            seed,
            chunk_size: CHUNK_SIZE as u32,
            compressed: compress,
        };
        let sealer = ChunkSealer {
            inner,
            cipher: self.cipher()?,
            seed,
            counter: 0,
            buf: Vec::new(),
            chunk_size: CHUNK_SIZE,
        };
        let sink = if compress {
            SealSink::Zstd(zstd::stream::Encoder::new(sealer, COMPRESSION_LEVEL)?)
        } else {
            SealSink::Plain(sealer)
        };
        Ok(SealingWriter { sink, meta })
    }

    /// Build the opening transform for one entry stream, using the
    /// metadata recorded when it was sealed.
    pub fn opening_reader<R: Read>(
        &self,
        meta: &StreamTransform,
        inner: R,
    ) -> Result<OpeningReader<R>> {
        let chunk_size = meta.chunk_size as usize;
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(CofferError::CorruptArchive(format!(
                "implausible chunk size {}",
                meta.chunk_size
            )));
        }
        let opener = ChunkOpener {
            inner,
            cipher: self.cipher()?,
            seed: meta.seed,
            counter: 0,
            chunk_size,
            pending: Vec::new(),
            pos: 0,
            done: false,
        };
        let src = if meta.compressed {
            OpenSource::Zstd(zstd::stream::Decoder::new(opener)?)
        } else {
            OpenSource::Plain(opener)
        };
        Ok(OpeningReader { src })
    }
}

/// Nonce for chunk `counter`: the entry seed with the counter XORed into
/// the trailing 8 bytes. Unique per chunk within an entry; entries get
/// independent random seeds.
fn chunk_nonce(seed: &[u8; NONCE_SIZE], counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = *seed;
    let ctr = counter.to_le_bytes();
    for (n, c) in nonce[NONCE_SIZE - 8..].iter_mut().zip(ctr) {
        *n ^= c;
    }
    nonce
}

fn chunk_aad(counter: u64, flags: u8) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&counter.to_le_bytes());
    aad[8] = flags;
    aad
}

/// Writer half of the streaming transform: buffers plaintext into fixed
/// chunks and seals each as `[len: 4][flags: 1][ciphertext]`. The final
/// chunk (possibly empty) is flagged, so truncation is detectable.
struct ChunkSealer<W: Write> {
    inner: W,
    cipher: Aes256Gcm,
    seed: [u8; NONCE_SIZE],
    counter: u64,
    buf: Vec<u8>,
    chunk_size: usize,
}

impl<W: Write> ChunkSealer<W> {
    fn seal_chunk(&mut self, chunk: &[u8], last: bool) -> io::Result<()> {
        let flags = if last { FLAG_LAST } else { 0 };
        let nonce = chunk_nonce(&self.seed, self.counter);
        let aad = chunk_aad(self.counter, flags);
        let ciphertext = self
            .cipher
            .encrypt(
                AesNonce::from_slice(&nonce),
                Payload {
                    msg: chunk,
                    aad: &aad,
                },
            )
            .map_err(|_| CofferError::EncryptionFailure.into_io())?;
        self.inner
            .write_all(&(ciphertext.len() as u32).to_le_bytes())?;
        self.inner.write_all(&[flags])?;
        self.inner.write_all(&ciphertext)?;
        self.counter += 1;
        Ok(())
    }

    fn finish(mut self) -> Result<W> {
        let chunk = std::mem::take(&mut self.buf);
        self.seal_chunk(&chunk, true)
            .map_err(CofferError::from_io)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for ChunkSealer<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        while self.buf.len() >= self.chunk_size {
            let rest = self.buf.split_off(self.chunk_size);
            let chunk = std::mem::replace(&mut self.buf, rest);
            self.seal_chunk(&chunk, false)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Partial chunks are held back; only the sink is flushed.
        self.inner.flush()
    }
}

enum SealSink<W: Write> {
    Plain(ChunkSealer<W>),
    Zstd(zstd::stream::Encoder<'static, ChunkSealer<W>>),
}

/// Output stream returned by [`KeySet::sealing_writer`].
pub struct SealingWriter<W: Write> {
    sink: SealSink<W>,
    meta: StreamTransform,
}

impl<W: Write> SealingWriter<W> {
    /// Seal the final chunk and return the inner writer with the
    /// transform metadata to record.
    pub fn finish(self) -> Result<(W, StreamTransform)> {
        let sealer = match self.sink {
            SealSink::Plain(sealer) => sealer,
            SealSink::Zstd(encoder) => encoder.finish().map_err(CofferError::from_io)?,
        };
        let inner = sealer.finish()?;
        Ok((inner, self.meta))
    }
}

impl<W: Write> Write for SealingWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match &mut self.sink {
            SealSink::Plain(sealer) => sealer.write(data),
            SealSink::Zstd(encoder) => encoder.write(data),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.sink {
            SealSink::Plain(sealer) => sealer.flush(),
            SealSink::Zstd(encoder) => encoder.flush(),
        }
    }
}

/// Reader half of the streaming transform.
struct ChunkOpener<R: Read> {
    inner: R,
    cipher: Aes256Gcm,
    seed: [u8; NONCE_SIZE],
    counter: u64,
    chunk_size: usize,
    pending: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<R: Read> ChunkOpener<R> {
    fn next_chunk(&mut self) -> io::Result<()> {
        let mut len_bytes = [0u8; 4];
        self.inner.read_exact(&mut len_bytes).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                // Stream ended before the flagged final chunk
                CofferError::DecryptionFailure.into_io()
            } else {
                e
            }
        })?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len < TAG_SIZE || len > self.chunk_size + TAG_SIZE {
            return Err(CofferError::DecryptionFailure.into_io());
        }
        let mut flags = [0u8; 1];
        self.inner.read_exact(&mut flags)?;
        if flags[0] & !FLAG_LAST != 0 {
            return Err(CofferError::DecryptionFailure.into_io());
        }
        let mut ciphertext = vec![0u8; len];
        self.inner.read_exact(&mut ciphertext)?;

        let nonce = chunk_nonce(&self.seed, self.counter);
        let aad = chunk_aad(self.counter, flags[0]);
        let plaintext = self
            .cipher
            .decrypt(
                AesNonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| CofferError::DecryptionFailure.into_io())?;
        self.counter += 1;
        if flags[0] & FLAG_LAST != 0 {
            self.done = true;
        }
        self.pending = plaintext;
        self.pos = 0;
        Ok(())
    }
}

impl<R: Read> Read for ChunkOpener<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.pending.len() {
                let n = out.len().min(self.pending.len() - self.pos);
                out[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.done {
                return Ok(0);
            }
            self.next_chunk()?;
        }
    }
}

enum OpenSource<R: Read> {
    Plain(ChunkOpener<R>),
    Zstd(zstd::stream::Decoder<'static, BufReader<ChunkOpener<R>>>),
}

/// Input stream returned by [`KeySet::opening_reader`].
pub struct OpeningReader<R: Read> {
    src: OpenSource<R>,
}

impl<R: Read> Read for OpeningReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        match &mut self.src {
            OpenSource::Plain(opener) => opener.read(out),
            OpenSource::Zstd(decoder) => decoder.read(out),
        }
    }
}

/// Derives and verifies key-set-hashes.
///
/// The optional pepper folds an out-of-band secret (an embedded raw key
/// or an agreement-derived secret) into the password material before the
/// Argon2id stretch.
#[derive(ZeroizeOnDrop)]
pub struct KeySetProvider {
    pepper: Option<[u8; KEY_SIZE]>,
}

impl Default for KeySetProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl KeySetProvider {
    /// Provider for plain password locks
    pub fn new() -> Self {
        Self { pepper: None }
    }

    /// Provider peppered with an out-of-band secret
    pub(crate) fn with_pepper(secret: &[u8]) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(None, secret);
        let mut pepper = [0u8; KEY_SIZE];
        hk.expand(domain::PEPPER, &mut pepper)
            .map_err(|_| CofferError::KeyDerivation("pepper expansion failed".into()))?;
        Ok(Self {
            pepper: Some(pepper),
        })
    }

    fn password_material(&self, password: &[u8]) -> Result<Vec<u8>> {
        match &self.pepper {
            None => Ok(password.to_vec()),
            Some(pepper) => {
                let hk = Hkdf::<Sha256>::new(Some(pepper.as_slice()), password);
                let mut material = vec![0u8; KEY_SIZE];
                hk.expand(domain::PEPPERED_PASSWORD, &mut material)
                    .map_err(|_| {
                        CofferError::KeyDerivation("password expansion failed".into())
                    })?;
                Ok(material)
            }
        }
    }

    fn stretch(
        &self,
        password: &str,
        salt: &[u8; SALT_SIZE],
        spec: &KeySetSpec,
    ) -> Result<[u8; KEY_SIZE]> {
        let material = self.password_material(password.as_bytes())?;
        let params = Params::new(
            spec.memory_kib,
            spec.iterations,
            spec.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| CofferError::KeyDerivation(e.to_string()))?;
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut kek = [0u8; KEY_SIZE];
        argon
            .hash_password_into(&material, salt, &mut kek)
            .map_err(|e| CofferError::KeyDerivation(e.to_string()))?;
        Ok(kek)
    }

    /// Generate a fresh key-set-hash and its key-set: random master key,
    /// wrapped under the password-derived KEK.
    pub fn generate(&self, spec: &KeySetSpec, password: &str) -> Result<(KeySetHash, KeySet)> {
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let mut master = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut master);

        let kek = self.stretch(password, &salt, spec)?;
        let wrap_cipher = Aes256Gcm::new_from_slice(&kek)
            .map_err(|e| CofferError::KeyDerivation(format!("invalid key: {}", e)))?;
        let wrapped_key = wrap_cipher
            .encrypt(
                AesNonce::from_slice(&nonce),
                Payload {
                    msg: &master,
                    aad: domain::KEY_WRAP,
                },
            )
            .map_err(|_| CofferError::EncryptionFailure)?;

        let hash = KeySetHash {
            memory_kib: spec.memory_kib,
            iterations: spec.iterations,
            parallelism: spec.parallelism,
            salt,
            nonce,
            wrapped_key,
        };
        Ok((hash, KeySet { master }))
    }

    /// Recover the key-set from an existing key-set-hash.
    ///
    /// A wrong password fails the unwrap and reports `DecryptionFailure`,
    /// indistinguishable from corrupted hash bytes.
    pub fn derive(&self, hash: &KeySetHash, password: &str) -> Result<KeySet> {
        let kek = self.stretch(password, &hash.salt, &hash.spec())?;
        let wrap_cipher = Aes256Gcm::new_from_slice(&kek)
            .map_err(|e| CofferError::KeyDerivation(format!("invalid key: {}", e)))?;
        let master_bytes = wrap_cipher
            .decrypt(
                AesNonce::from_slice(&hash.nonce),
                Payload {
                    msg: hash.wrapped_key.as_slice(),
                    aad: domain::KEY_WRAP,
                },
            )
            .map_err(|_| CofferError::DecryptionFailure)?;
        let master: [u8; KEY_SIZE] = master_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CofferError::DecryptionFailure)?;
        Ok(KeySet { master })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spec() -> KeySetSpec {
        KeySetSpec {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_generate_derive_roundtrip() {
        let provider = KeySetProvider::new();
        let (hash, key_set) = provider.generate(&test_spec(), "hunter2").unwrap();

        let sealed = key_set.encrypt_bytes(b"payload").unwrap();
        let derived = provider.derive(&hash, "hunter2").unwrap();
        assert_eq!(derived.decrypt_bytes(&sealed).unwrap(), b"payload");
    }

    #[test]
    fn test_wrong_password_fails() {
        let provider = KeySetProvider::new();
        let (hash, _) = provider.generate(&test_spec(), "hunter2").unwrap();

        let result = provider.derive(&hash, "hunter3");
        assert!(matches!(result, Err(CofferError::DecryptionFailure)));
    }

    #[test]
    fn test_pepper_changes_derivation() {
        let plain = KeySetProvider::new();
        let peppered = KeySetProvider::with_pepper(b"second factor").unwrap();
        let (hash, _) = peppered.generate(&test_spec(), "hunter2").unwrap();

        // Same password without the pepper must not unwrap the key
        assert!(matches!(
            plain.derive(&hash, "hunter2"),
            Err(CofferError::DecryptionFailure)
        ));
        assert!(peppered.derive(&hash, "hunter2").is_ok());
    }

    #[test]
    fn test_hash_serialization_roundtrip() {
        let provider = KeySetProvider::new();
        let (hash, _) = provider.generate(&test_spec(), "pw").unwrap();

        let bytes = hash.to_bytes();
        let restored = KeySetHash::from_bytes(&bytes).unwrap();
        assert_eq!(hash, restored);
    }

    #[test]
    fn test_hash_rejects_malformed() {
        let provider = KeySetProvider::new();
        let (hash, _) = provider.generate(&test_spec(), "pw").unwrap();
        let mut bytes = hash.to_bytes();

        // Trailing byte
        bytes.push(0);
        assert!(KeySetHash::from_bytes(&bytes).is_err());
        bytes.pop();

        // Truncated
        assert!(KeySetHash::from_bytes(&bytes[..10]).is_err());

        // Bad version
        bytes[0] = 9;
        assert!(KeySetHash::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_blob_tamper_detected() {
        let provider = KeySetProvider::new();
        let (_, key_set) = provider.generate(&test_spec(), "pw").unwrap();

        let mut sealed = key_set.encrypt_bytes(b"blob").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(matches!(
            key_set.decrypt_bytes(&sealed),
            Err(CofferError::DecryptionFailure)
        ));
    }

    fn stream_roundtrip(data: &[u8], compress: bool) -> Vec<u8> {
        let provider = KeySetProvider::new();
        let (_, key_set) = provider.generate(&test_spec(), "pw").unwrap();

        let mut writer = key_set.sealing_writer(Vec::new(), compress).unwrap();
        writer.write_all(data).unwrap();
        let (sealed, meta) = writer.finish().unwrap();
        assert_eq!(meta.compressed, compress);

        let mut reader = key_set.opening_reader(&meta, sealed.as_slice()).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_stream_roundtrip_plain() {
        let data = b"streaming seal and open";
        assert_eq!(stream_roundtrip(data, false), data);
    }

    #[test]
    fn test_stream_roundtrip_compressed() {
        let data: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
        assert_eq!(stream_roundtrip(&data, true), data);
    }

    #[test]
    fn test_stream_roundtrip_empty() {
        assert_eq!(stream_roundtrip(b"", false), b"");
    }

    #[test]
    fn test_stream_multi_chunk() {
        // Forces several 64 KiB chunks plus a partial final one
        let data: Vec<u8> = (0..150_000).map(|i| (i % 256) as u8).collect();
        assert_eq!(stream_roundtrip(&data, false), data);
    }

    #[test]
    fn test_stream_truncation_detected() {
        let provider = KeySetProvider::new();
        let (_, key_set) = provider.generate(&test_spec(), "pw").unwrap();

        let mut writer = key_set.sealing_writer(Vec::new(), false).unwrap();
        writer.write_all(&vec![7u8; 100_000]).unwrap();
        let (sealed, meta) = writer.finish().unwrap();

        // Drop the final chunk's frame
        let cut = &sealed[..sealed.len() / 2];
        let mut reader = key_set.opening_reader(&meta, cut).unwrap();
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).is_err());
    }

    #[test]
    fn test_stream_tamper_detected() {
        let provider = KeySetProvider::new();
        let (_, key_set) = provider.generate(&test_spec(), "pw").unwrap();

        let mut writer = key_set.sealing_writer(Vec::new(), false).unwrap();
        writer.write_all(b"chunked payload").unwrap();
        let (mut sealed, meta) = writer.finish().unwrap();

        let mid = sealed.len() / 2;
        sealed[mid] ^= 0x01;
        let mut reader = key_set.opening_reader(&meta, sealed.as_slice()).unwrap();
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).is_err());
    }

    #[test]
    fn test_wrong_key_cannot_open_stream() {
        let provider = KeySetProvider::new();
        let (_, key_set) = provider.generate(&test_spec(), "pw").unwrap();
        let (_, other) = provider.generate(&test_spec(), "pw").unwrap();

        let mut writer = key_set.sealing_writer(Vec::new(), false).unwrap();
        writer.write_all(b"sealed for one key only").unwrap();
        let (sealed, meta) = writer.finish().unwrap();

        let mut reader = other.opening_reader(&meta, sealed.as_slice()).unwrap();
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).is_err());
    }
}
