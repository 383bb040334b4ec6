//! Coffer - Lock-Secured Streaming Archive Container
//!
//! A container format where member entries stream through a symmetric
//! transform derived from a [`Lock`]: an object binding one of several
//! authentication methods (password; password plus an embedded key;
//! password plus an X25519 key-pair agreement, single or set flavor) to
//! a derived key-set.
//!
//! ## Write path
//!
//! ```text
//! Entry bytes → [zstd] → chunked AEAD → container entry "1".."N"
//! close() → header entry "N+1": lock encoding (side channel)
//!                              + key-set-encrypted directory (content)
//! ```
//!
//! Entry names never appear in a secured container before unlock: each
//! member is stored under a sequence number, and the real names live in
//! the encrypted trailing directory.
//!
//! ## Read path
//!
//! The reader loads the container, finds the header (the first entry
//! with side-channel bytes), and exposes a locked [`Lock`]. Once the
//! caller unlocks it with the right credential, the directory is
//! decrypted and any member can be opened by name.
//!
//! ## Example
//!
//! ```no_run
//! use coffer::{ArchiveReader, ArchiveWriter, KeySetSpec, Lock};
//! use std::io::Write;
//!
//! let lock = Lock::generate_password("hunter2", &KeySetSpec::default()).unwrap();
//! let mut buf = Vec::new();
//! let mut writer = ArchiveWriter::with_lock(&mut buf, lock).unwrap();
//! let mut entry = writer.create_entry("a.txt", true).unwrap();
//! entry.write_all(b"hello").unwrap();
//! entry.close().unwrap();
//! writer.close().unwrap();
//! drop(writer);
//!
//! let mut reader = ArchiveReader::open(buf.as_slice()).unwrap();
//! reader.unlock("hunter2").unwrap();
//! assert_eq!(reader.read_entry("a.txt").unwrap(), b"hello");
//! ```

pub mod agreement;
pub mod container;
pub mod directory;
pub mod error;
pub mod keyset;
pub mod lock;
pub mod reader;
pub mod writer;

pub use agreement::{AgreementKeyPair, KeyPairSet};
pub use directory::{ArchiveDirectory, EntryDescriptor, HeaderDescriptor};
pub use error::{CofferError, Result};
pub use keyset::{KeySet, KeySetHash, KeySetProvider, KeySetSpec, StreamTransform};
pub use lock::{Lock, LockEncoding, LockPayload, LockVariant};
pub use reader::{ArchiveReader, EntryReader};
pub use writer::{ArchiveWriter, EntryWriter};
