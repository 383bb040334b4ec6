use crate::container::ContainerWriter;
use crate::directory::{ArchiveDirectory, EntryDescriptor, HeaderDescriptor};
use crate::error::{CofferError, Result};
use crate::keyset::SealingWriter;
use crate::lock::Lock;
use std::io::{self, Write};

enum EntrySink {
    Sealed(SealingWriter<Vec<u8>>),
    Plain(Vec<u8>),
}

struct OpenEntry {
    display_name: String,
    storage_name: String,
    sink: EntrySink,
}

/// Streams member entries into a container, encrypting and
/// name-obfuscating them when a lock is attached.
///
/// One entry stream may be open at a time. `close` appends the hidden
/// header entry (lock encoding in the side channel, encrypted directory
/// as content) after all members, then flushes the container. A failed
/// close leaves the container incomplete; there is no rollback.
pub struct ArchiveWriter<W: Write> {
    container: ContainerWriter<W>,
    lock: Option<Lock>,
    directory: ArchiveDirectory,
    open: Option<OpenEntry>,
    closed: bool,
    sequence: u32,
}

impl<W: Write> ArchiveWriter<W> {
    /// Unsecured writer: entries are stored verbatim under their real
    /// names and no header entry is appended.
    pub fn new(out: W) -> Result<Self> {
        Self::build(out, None)
    }

    /// Secured writer. The lock must be freshly generated: a lock that
    /// was already bound to an archive (or decoded from one) is
    /// rejected with `LockNotFresh`.
    pub fn with_lock(out: W, mut lock: Lock) -> Result<Self> {
        if !lock.is_fresh() || lock.key_set().is_none() {
            return Err(CofferError::LockNotFresh);
        }
        lock.mark_used();
        Self::build(out, Some(lock))
    }

    fn build(out: W, lock: Option<Lock>) -> Result<Self> {
        Ok(Self {
            container: ContainerWriter::new(out)?,
            lock,
            directory: ArchiveDirectory::default(),
            open: None,
            closed: false,
            sequence: 0,
        })
    }

    pub fn is_secured(&self) -> bool {
        self.lock.is_some()
    }

    /// Directory accumulated so far
    pub fn directory(&self) -> &ArchiveDirectory {
        &self.directory
    }

    /// Open the next member entry stream.
    ///
    /// Secured entries get a 1-based sequence number as storage name and
    /// stream through the key-set's sealing transform; unsecured entries
    /// keep their display name and pass through unchanged (the compress
    /// flag only applies to the sealing transform). Fails with
    /// `StreamAlreadyOpen` while a previous entry stream is unclosed and
    /// `ArchiveClosed` after `close`.
    pub fn create_entry(&mut self, name: &str, compress: bool) -> Result<EntryWriter<'_, W>> {
        if self.closed {
            return Err(CofferError::ArchiveClosed);
        }
        if self.open.is_some() {
            return Err(CofferError::StreamAlreadyOpen);
        }
        let (storage_name, sink) = match &self.lock {
            Some(lock) => {
                let key_set = lock.key_set().ok_or(CofferError::LockNotFresh)?;
                self.sequence += 1;
                (
                    self.sequence.to_string(),
                    EntrySink::Sealed(key_set.sealing_writer(Vec::new(), compress)?),
                )
            }
            None => (name.to_string(), EntrySink::Plain(Vec::new())),
        };
        self.open = Some(OpenEntry {
            display_name: name.to_string(),
            storage_name,
            sink,
        });
        Ok(EntryWriter { archive: self })
    }

    fn finish_open_entry(&mut self) -> Result<()> {
        let Some(entry) = self.open.take() else {
            return Ok(());
        };
        let (data, transform) = match entry.sink {
            EntrySink::Sealed(writer) => {
                let (buf, meta) = writer.finish()?;
                (buf, Some(meta))
            }
            EntrySink::Plain(buf) => (buf, None),
        };
        self.container
            .write_entry(&entry.storage_name, &[], &data)?;
        self.directory.push(EntryDescriptor {
            display_name: entry.display_name,
            storage_name: entry.storage_name,
            transform,
        });
        Ok(())
    }

    /// Finish the archive: closes any open entry stream, appends the
    /// header entry for a secured archive with at least one member, and
    /// flushes the container. Any failure is fatal for this container.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(CofferError::ArchiveClosed);
        }
        self.closed = true;
        self.finish_open_entry()?;
        if let Some(lock) = &self.lock {
            if !self.directory.is_empty() {
                let lock_bytes = lock.encoding().to_bytes();
                let storage_name = (self.sequence + 1).to_string();
                self.directory.header = Some(HeaderDescriptor {
                    storage_name: storage_name.clone(),
                    lock_bytes: lock_bytes.clone(),
                });
                // The directory is sealed directly with the key-set: no
                // per-entry transform metadata exists to describe its
                // own decryption.
                let payload = self.directory.to_bytes()?;
                let key_set = lock.key_set().ok_or(CofferError::LockNotFresh)?;
                let sealed = key_set.encrypt_bytes(&payload)?;
                self.container
                    .write_entry(&storage_name, &lock_bytes, &sealed)?;
            }
        }
        self.container.finish()?;
        tracing::debug!(
            entries = self.directory.len(),
            secured = self.is_secured(),
            "archive closed"
        );
        Ok(())
    }
}

/// Output stream for one member entry.
///
/// Writes feed the entry's transform; `close` records the transform
/// metadata in the directory and returns the writer to idle. Dropping
/// without `close` leaves the entry stream open: the next
/// `create_entry` reports `StreamAlreadyOpen` and the archive's `close`
/// finishes the entry.
pub struct EntryWriter<'a, W: Write> {
    archive: &'a mut ArchiveWriter<W>,
}

impl<W: Write> EntryWriter<'_, W> {
    /// Close this entry stream and record its descriptor.
    pub fn close(self) -> Result<()> {
        self.archive.finish_open_entry()
    }
}

impl<W: Write> Write for EntryWriter<'_, W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match &mut self.archive.open {
            Some(entry) => match &mut entry.sink {
                EntrySink::Sealed(writer) => writer.write(data),
                EntrySink::Plain(buf) => {
                    buf.extend_from_slice(data);
                    Ok(data.len())
                }
            },
            None => Err(CofferError::ArchiveClosed.into_io()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.archive.open {
            Some(entry) => match &mut entry.sink {
                EntrySink::Sealed(writer) => writer.flush(),
                EntrySink::Plain(_) => Ok(()),
            },
            None => Ok(()),
        }
    }
}
