use crate::error::Result;
use crate::keyset::StreamTransform;
use serde::{Deserialize, Serialize};

/// Describes one member entry of an archive.
///
/// `storage_name` equals `display_name` in an unsecured archive; in a
/// secured archive it is a 1-based sequence number, so plaintext names
/// never appear in the raw container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDescriptor {
    pub display_name: String,
    pub storage_name: String,
    /// Streaming transform parameters; `None` for unsecured entries
    pub transform: Option<StreamTransform>,
}

/// Describes the hidden trailing header entry of a secured archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderDescriptor {
    pub storage_name: String,
    /// Raw lock encoding bytes, as written to the entry's side channel
    pub lock_bytes: Vec<u8>,
}

/// The in-archive manifest: ordered member descriptors plus the
/// optional header descriptor. Built incrementally while writing; built
/// in one shot (by decryption) while reading.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveDirectory {
    pub entries: Vec<EntryDescriptor>,
    pub header: Option<HeaderDescriptor>,
}

impl ArchiveDirectory {
    pub fn push(&mut self, descriptor: EntryDescriptor) {
        self.entries.push(descriptor);
    }

    /// Look up a member by its display name
    pub fn entry(&self, display_name: &str) -> Option<&EntryDescriptor> {
        self.entries.iter().find(|e| e.display_name == display_name)
    }

    pub fn contains(&self, descriptor: &EntryDescriptor) -> bool {
        self.entries.iter().any(|e| e == descriptor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}
