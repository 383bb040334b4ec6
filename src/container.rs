//! Minimal sequential-entry container transport.
//!
//! Named entries are written in order, each carrying an out-of-band
//! "extra" side channel next to its content. Any archive format with
//! ordered entries plus a per-entry metadata slot would do; this one
//! keeps the framing trivial so the interesting logic stays in the
//! archive layer.

use crate::error::{CofferError, Result};
use std::io::Write;

/// Magic bytes identifying a container file
const CONTAINER_MAGIC: &[u8; 4] = b"CFR\x01";

/// Bounds on frame sections, to fail fast on garbage input
const MAX_NAME: usize = 4096;
const MAX_EXTRA: usize = 64 * 1024;

/// One parsed container entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEntry {
    pub name: String,
    /// Side-channel metadata; empty for ordinary entries
    pub extra: Vec<u8>,
    pub data: Vec<u8>,
}

/// Writes entries sequentially to an underlying sink.
///
/// Entry layout: `[name_len: 2][name][extra_len: 4][extra]`
/// `[data_len: 8][data]`, after the leading magic.
pub struct ContainerWriter<W: Write> {
    out: W,
    finished: bool,
}

impl<W: Write> ContainerWriter<W> {
    pub fn new(mut out: W) -> Result<Self> {
        out.write_all(CONTAINER_MAGIC)?;
        Ok(Self {
            out,
            finished: false,
        })
    }

    /// Frame one complete entry.
    pub fn write_entry(&mut self, name: &str, extra: &[u8], data: &[u8]) -> Result<()> {
        if self.finished {
            return Err(CofferError::ArchiveClosed);
        }
        if name.len() > MAX_NAME {
            return Err(CofferError::InvalidFormat("entry name too long".into()));
        }
        if extra.len() > MAX_EXTRA {
            return Err(CofferError::InvalidFormat("entry extra too large".into()));
        }
        self.out.write_all(&(name.len() as u16).to_le_bytes())?;
        self.out.write_all(name.as_bytes())?;
        self.out.write_all(&(extra.len() as u32).to_le_bytes())?;
        self.out.write_all(extra)?;
        self.out.write_all(&(data.len() as u64).to_le_bytes())?;
        self.out.write_all(data)?;
        Ok(())
    }

    /// Flush the sink; no further entries may be written.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Err(CofferError::ArchiveClosed);
        }
        self.out.flush()?;
        self.finished = true;
        Ok(())
    }
}

/// Parse a whole container image into its entry list, in file order.
pub fn parse(data: &[u8]) -> Result<Vec<ContainerEntry>> {
    if data.len() < CONTAINER_MAGIC.len() || &data[..CONTAINER_MAGIC.len()] != CONTAINER_MAGIC {
        return Err(CofferError::InvalidFormat(
            "missing container magic".into(),
        ));
    }
    let mut entries = Vec::new();
    let mut pos = CONTAINER_MAGIC.len();
    while pos < data.len() {
        let name_len = read_int(data, &mut pos, 2)? as usize;
        if name_len > MAX_NAME {
            return Err(CofferError::InvalidFormat("entry name too long".into()));
        }
        let name_bytes = read_slice(data, &mut pos, name_len)?;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| CofferError::InvalidFormat("entry name is not UTF-8".into()))?
            .to_string();
        let extra_len = read_int(data, &mut pos, 4)? as usize;
        if extra_len > MAX_EXTRA {
            return Err(CofferError::InvalidFormat("entry extra too large".into()));
        }
        let extra = read_slice(data, &mut pos, extra_len)?.to_vec();
        let data_len = read_int(data, &mut pos, 8)? as usize;
        let content = read_slice(data, &mut pos, data_len)?.to_vec();
        entries.push(ContainerEntry {
            name,
            extra,
            data: content,
        });
    }
    Ok(entries)
}

fn read_slice<'a>(data: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = pos.checked_add(len).filter(|&e| e <= data.len());
    match end {
        Some(end) => {
            let slice = &data[*pos..end];
            *pos = end;
            Ok(slice)
        }
        None => Err(CofferError::InvalidFormat(
            "truncated container entry".into(),
        )),
    }
}

fn read_int(data: &[u8], pos: &mut usize, width: usize) -> Result<u64> {
    let bytes = read_slice(data, pos, width)?;
    let mut buf = [0u8; 8];
    buf[..width].copy_from_slice(bytes);
    Ok(u64::from_le_bytes(buf))
}
