use crate::agreement::{AgreementKeyPair, KeyPairSet};
use crate::container::{self, ContainerEntry};
use crate::directory::{ArchiveDirectory, EntryDescriptor};
use crate::error::{CofferError, Result};
use crate::keyset::OpeningReader;
use crate::lock::Lock;
use std::io::{self, Read};

/// Reads a container image back: locates the hidden header, exposes the
/// locked lock, and serves member entry streams once unlocked.
///
/// The whole container is held in memory; each `open_entry_stream` is
/// an independent linear scan, so repeated reads need no shared cursor.
pub struct ArchiveReader {
    entries: Vec<ContainerEntry>,
    member_count: usize,
    lock: Option<Lock>,
    header_cipher: Option<Vec<u8>>,
    directory: ArchiveDirectory,
}

impl ArchiveReader {
    /// Read the container fully and scan for the header: the first
    /// entry carrying non-empty side-channel bytes, assumed to sit
    /// after all members. Without one the archive is unsecured and the
    /// directory is the literal entry list.
    pub fn open<R: Read>(mut input: R) -> Result<Self> {
        let mut image = Vec::new();
        input.read_to_end(&mut image)?;
        let entries = container::parse(&image)?;

        let header_index = entries.iter().position(|e| !e.extra.is_empty());
        let member_count = header_index.unwrap_or(entries.len());

        let mut directory = ArchiveDirectory::default();
        for entry in &entries[..member_count] {
            directory.push(EntryDescriptor {
                display_name: entry.name.clone(),
                storage_name: entry.name.clone(),
                transform: None,
            });
        }

        let (lock, header_cipher) = match header_index {
            Some(index) => {
                let header = &entries[index];
                (
                    Some(Lock::from_bytes(&header.extra)?),
                    Some(header.data.clone()),
                )
            }
            None => (None, None),
        };

        tracing::debug!(
            members = member_count,
            secured = lock.is_some(),
            "archive opened"
        );
        Ok(Self {
            entries,
            member_count,
            lock,
            header_cipher,
            directory,
        })
    }

    pub fn is_secured(&self) -> bool {
        self.lock.is_some()
    }

    /// True for a secured archive whose lock has not been unlocked yet
    pub fn is_locked(&self) -> bool {
        self.lock.as_ref().is_some_and(Lock::is_locked)
    }

    /// The lock decoded from the header, if the archive is secured
    pub fn lock(&self) -> Option<&Lock> {
        self.lock.as_ref()
    }

    /// The current directory: provisional (storage names only) until a
    /// secured archive is unlocked, authoritative afterwards.
    pub fn directory(&self) -> &ArchiveDirectory {
        &self.directory
    }

    /// Unlock with a password and decrypt the directory.
    pub fn unlock(&mut self, password: &str) -> Result<()> {
        self.unlock_with(|lock| lock.unlock(password))
    }

    /// Unlock a key-pair secured archive.
    pub fn unlock_with_key_pair(
        &mut self,
        key_pair: &AgreementKeyPair,
        password: &str,
    ) -> Result<()> {
        self.unlock_with(|lock| lock.unlock_with_key_pair(key_pair, password))
    }

    /// Unlock a key-pair-set secured archive.
    pub fn unlock_with_key_pair_set(&mut self, set: &KeyPairSet, password: &str) -> Result<()> {
        self.unlock_with(|lock| lock.unlock_with_key_pair_set(set, password))
    }

    fn unlock_with(&mut self, drive: impl FnOnce(&mut Lock) -> Result<()>) -> Result<()> {
        let lock = self
            .lock
            .as_mut()
            .ok_or_else(|| CofferError::WrongLockType("archive is not secured".into()))?;
        drive(lock)?;

        let key_set = lock
            .key_set()
            .ok_or_else(|| CofferError::CorruptArchive("unlock yielded no key set".into()))?;
        let cipher = self
            .header_cipher
            .as_ref()
            .ok_or_else(|| CofferError::CorruptArchive("missing header content".into()))?;
        let plain = key_set.decrypt_bytes(cipher)?;
        let directory = ArchiveDirectory::from_bytes(&plain)
            .map_err(|_| CofferError::CorruptArchive("unreadable directory".into()))?;

        // The decrypted directory must agree with the member entries
        // actually present, in order.
        if directory.len() != self.member_count {
            return Err(CofferError::CorruptArchive(format!(
                "directory lists {} entries, container holds {}",
                directory.len(),
                self.member_count
            )));
        }
        for (descriptor, entry) in directory.entries.iter().zip(&self.entries) {
            if descriptor.storage_name != entry.name {
                return Err(CofferError::CorruptArchive(format!(
                    "directory entry {} does not match stored entry {}",
                    descriptor.storage_name, entry.name
                )));
            }
        }
        self.directory = directory;
        tracing::debug!(members = self.member_count, "directory decrypted");
        Ok(())
    }

    /// Open one member entry as a stream.
    ///
    /// The descriptor must come from this reader's directory
    /// (`EntryNotOwned` otherwise). The in-memory entries are scanned
    /// linearly for the storage name; secured entries are wrapped
    /// through the key-set's opening transform.
    pub fn open_entry_stream(&self, descriptor: &EntryDescriptor) -> Result<EntryReader<'_>> {
        if !self.directory.contains(descriptor) {
            return Err(CofferError::EntryNotOwned);
        }
        let entry = self
            .entries
            .iter()
            .find(|e| e.name == descriptor.storage_name)
            .ok_or_else(|| CofferError::EntryNotFound(descriptor.display_name.clone()))?;
        let source = match &descriptor.transform {
            Some(meta) => {
                let key_set = self
                    .lock
                    .as_ref()
                    .and_then(Lock::key_set)
                    .ok_or_else(|| {
                        CofferError::CorruptArchive("sealed entry without key set".into())
                    })?;
                EntrySource::Sealed(key_set.opening_reader(meta, entry.data.as_slice())?)
            }
            None => EntrySource::Raw(entry.data.as_slice()),
        };
        Ok(EntryReader { source })
    }

    /// Convenience: look an entry up by display name and read it fully.
    pub fn read_entry(&self, display_name: &str) -> Result<Vec<u8>> {
        let descriptor = self
            .directory
            .entry(display_name)
            .ok_or_else(|| CofferError::EntryNotFound(display_name.to_string()))?;
        let mut stream = self.open_entry_stream(descriptor)?;
        let mut out = Vec::new();
        stream.read_to_end(&mut out).map_err(CofferError::from_io)?;
        Ok(out)
    }
}

enum EntrySource<'a> {
    Raw(&'a [u8]),
    Sealed(OpeningReader<&'a [u8]>),
}

/// Readable stream over one member entry.
pub struct EntryReader<'a> {
    source: EntrySource<'a>,
}

impl Read for EntryReader<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        match &mut self.source {
            EntrySource::Raw(slice) => slice.read(out),
            EntrySource::Sealed(reader) => reader.read(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerWriter;
    use crate::keyset::KeySetSpec;
    use crate::writer::ArchiveWriter;
    use std::io::Write;

    fn test_spec() -> KeySetSpec {
        KeySetSpec {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn secured_archive(names_bodies: &[(&str, &[u8])]) -> Vec<u8> {
        let lock = Lock::generate_password("pw", &test_spec()).unwrap();
        let mut buf = Vec::new();
        let mut writer = ArchiveWriter::with_lock(&mut buf, lock).unwrap();
        for (name, body) in names_bodies {
            let mut entry = writer.create_entry(name, false).unwrap();
            entry.write_all(body).unwrap();
            entry.close().unwrap();
        }
        writer.close().unwrap();
        drop(writer);
        buf
    }

    #[test]
    fn test_unsecured_archive_reads_directly() {
        let mut buf = Vec::new();
        let mut writer = ArchiveWriter::new(&mut buf).unwrap();
        let mut entry = writer.create_entry("plain.txt", false).unwrap();
        entry.write_all(b"visible").unwrap();
        entry.close().unwrap();
        writer.close().unwrap();
        drop(writer);

        let reader = ArchiveReader::open(buf.as_slice()).unwrap();
        assert!(!reader.is_secured());
        assert!(!reader.is_locked());
        assert!(reader.lock().is_none());
        assert_eq!(reader.read_entry("plain.txt").unwrap(), b"visible");
    }

    #[test]
    fn test_unlock_then_read() {
        let buf = secured_archive(&[("a.txt", b"alpha"), ("b.txt", b"beta")]);
        let mut reader = ArchiveReader::open(buf.as_slice()).unwrap();
        assert!(reader.is_secured());
        assert!(reader.is_locked());

        reader.unlock("pw").unwrap();
        assert!(!reader.is_locked());
        assert_eq!(reader.read_entry("a.txt").unwrap(), b"alpha");
        assert_eq!(reader.read_entry("b.txt").unwrap(), b"beta");
    }

    #[test]
    fn test_wrong_password_keeps_lock_retryable() {
        let buf = secured_archive(&[("a.txt", b"alpha")]);
        let mut reader = ArchiveReader::open(buf.as_slice()).unwrap();

        assert!(matches!(
            reader.unlock("nope"),
            Err(CofferError::DecryptionFailure)
        ));
        assert!(reader.is_locked());
        reader.unlock("pw").unwrap();
    }

    #[test]
    fn test_second_unlock_rejected() {
        let buf = secured_archive(&[("a.txt", b"alpha")]);
        let mut reader = ArchiveReader::open(buf.as_slice()).unwrap();
        reader.unlock("pw").unwrap();
        assert!(matches!(
            reader.unlock("pw"),
            Err(CofferError::AlreadyUnlocked)
        ));
    }

    #[test]
    fn test_unlock_unsecured_rejected() {
        let mut buf = Vec::new();
        let mut writer = ArchiveWriter::new(&mut buf).unwrap();
        writer.close().unwrap();
        drop(writer);

        let mut reader = ArchiveReader::open(buf.as_slice()).unwrap();
        assert!(matches!(
            reader.unlock("pw"),
            Err(CofferError::WrongLockType(_))
        ));
    }

    #[test]
    fn test_foreign_descriptor_not_owned() {
        let buf = secured_archive(&[("a.txt", b"alpha")]);
        let mut reader = ArchiveReader::open(buf.as_slice()).unwrap();
        reader.unlock("pw").unwrap();

        let forged = EntryDescriptor {
            display_name: "a.txt".into(),
            storage_name: "42".into(),
            transform: None,
        };
        assert!(matches!(
            reader.open_entry_stream(&forged),
            Err(CofferError::EntryNotOwned)
        ));
    }

    #[test]
    fn test_missing_entry_not_found() {
        let buf = secured_archive(&[("a.txt", b"alpha")]);
        let mut reader = ArchiveReader::open(buf.as_slice()).unwrap();
        reader.unlock("pw").unwrap();
        assert!(matches!(
            reader.read_entry("zzz.txt"),
            Err(CofferError::EntryNotFound(_))
        ));
    }

    #[test]
    fn test_reordered_members_detected() {
        let buf = secured_archive(&[("a.txt", b"alpha"), ("b.txt", b"beta")]);
        let entries = container::parse(&buf).unwrap();

        // Rebuild the container with the member entries swapped
        let mut forged = Vec::new();
        let mut writer = ContainerWriter::new(&mut forged).unwrap();
        writer
            .write_entry(&entries[1].name, &entries[1].extra, &entries[1].data)
            .unwrap();
        writer
            .write_entry(&entries[0].name, &entries[0].extra, &entries[0].data)
            .unwrap();
        writer
            .write_entry(&entries[2].name, &entries[2].extra, &entries[2].data)
            .unwrap();
        writer.finish().unwrap();

        let mut reader = ArchiveReader::open(forged.as_slice()).unwrap();
        assert!(matches!(
            reader.unlock("pw"),
            Err(CofferError::CorruptArchive(_))
        ));
    }

    #[test]
    fn test_dropped_member_detected() {
        let buf = secured_archive(&[("a.txt", b"alpha"), ("b.txt", b"beta")]);
        let entries = container::parse(&buf).unwrap();

        let mut forged = Vec::new();
        let mut writer = ContainerWriter::new(&mut forged).unwrap();
        writer
            .write_entry(&entries[0].name, &entries[0].extra, &entries[0].data)
            .unwrap();
        writer
            .write_entry(&entries[2].name, &entries[2].extra, &entries[2].data)
            .unwrap();
        writer.finish().unwrap();

        let mut reader = ArchiveReader::open(forged.as_slice()).unwrap();
        assert!(matches!(
            reader.unlock("pw"),
            Err(CofferError::CorruptArchive(_))
        ));
    }

    #[test]
    fn test_malformed_header_extra_rejected() {
        let mut buf = Vec::new();
        let mut writer = ContainerWriter::new(&mut buf).unwrap();
        writer.write_entry("1", b"\xFFgarbage", b"data").unwrap();
        writer.finish().unwrap();

        assert!(matches!(
            ArchiveReader::open(buf.as_slice()),
            Err(CofferError::MalformedEncoding(_))
        ));
    }

    #[test]
    fn test_repeated_independent_streams() {
        let buf = secured_archive(&[("a.txt", b"alpha")]);
        let mut reader = ArchiveReader::open(buf.as_slice()).unwrap();
        reader.unlock("pw").unwrap();

        // Each open is a self-contained scan
        for _ in 0..3 {
            assert_eq!(reader.read_entry("a.txt").unwrap(), b"alpha");
        }
    }
}
