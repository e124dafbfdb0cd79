//! Snapshot stream codec.
//!
//! Layout: `b"CROFTSNP" | version:u32 | (klen:u32 key vlen:u32 value)* |
//! end marker (klen = u32::MAX)`. All integers little-endian. The writer
//! checks its cancellation token between records so an aborted leader
//! transfer stops promptly instead of draining the whole image.

use std::io::{Read, Write};

use tokio_util::sync::CancellationToken;

use crate::error::{Result, StoreError};

pub const SNAPSHOT_MAGIC: &[u8; 8] = b"CROFTSNP";
pub const SNAPSHOT_VERSION: u32 = 1;

const END_MARKER: u32 = u32::MAX;

/// A point-in-time capture of a store's entries, taken without blocking
/// writers. Obtained from [`crate::LogStore::prepare_snapshot`].
#[derive(Debug, Clone)]
pub struct SnapshotToken {
    pub(crate) entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl SnapshotToken {
    pub fn record_count(&self) -> usize {
        self.entries.len()
    }
}

/// Streams a captured snapshot to `writer`.
pub fn write_snapshot<W: Write + ?Sized>(
    token: &SnapshotToken,
    writer: &mut W,
    cancel: &CancellationToken,
) -> Result<()> {
    writer.write_all(SNAPSHOT_MAGIC)?;
    writer.write_all(&SNAPSHOT_VERSION.to_le_bytes())?;
    for (key, value) in &token.entries {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        writer.write_all(&(key.len() as u32).to_le_bytes())?;
        writer.write_all(key)?;
        writer.write_all(&(value.len() as u32).to_le_bytes())?;
        writer.write_all(value)?;
    }
    writer.write_all(&END_MARKER.to_le_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Reads a full snapshot stream back into its entries.
pub fn read_snapshot<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != SNAPSHOT_MAGIC {
        return Err(StoreError::Snapshot("bad magic".into()));
    }
    let version = read_u32(reader)?;
    if version != SNAPSHOT_VERSION {
        return Err(StoreError::Snapshot(format!("unsupported version {version}")));
    }
    let mut entries = Vec::new();
    loop {
        let klen = read_u32(reader)?;
        if klen == END_MARKER {
            return Ok(entries);
        }
        let mut key = vec![0u8; klen as usize];
        reader.read_exact(&mut key)?;
        let vlen = read_u32(reader)?;
        if vlen == END_MARKER {
            return Err(StoreError::Snapshot("end marker inside record".into()));
        }
        let mut value = vec![0u8; vlen as usize];
        reader.read_exact(&mut value)?;
        entries.push((key, value));
    }
}

fn read_u32<R: Read + ?Sized>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(entries: Vec<(&[u8], &[u8])>) -> SnapshotToken {
        SnapshotToken {
            entries: entries.into_iter().map(|(k, v)| (k.to_vec(), v.to_vec())).collect(),
        }
    }

    #[test]
    fn stream_round_trips() {
        let t = token(vec![(b"a", b"1"), (b"bb", b""), (b"ccc", b"333")]);
        let mut buf = Vec::new();
        write_snapshot(&t, &mut buf, &CancellationToken::new()).unwrap();
        let back = read_snapshot(&mut buf.as_slice()).unwrap();
        assert_eq!(back, t.entries);
    }

    #[test]
    fn cancellation_stops_the_stream() {
        let t = token(vec![(b"a", b"1")]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut buf = Vec::new();
        assert!(matches!(
            write_snapshot(&t, &mut buf, &cancel),
            Err(StoreError::Cancelled)
        ));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = b"NOTASNAP".to_vec();
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&END_MARKER.to_le_bytes());
        assert!(matches!(
            read_snapshot(&mut buf.as_slice()),
            Err(StoreError::Snapshot(_))
        ));
    }

    #[test]
    fn truncated_stream_is_an_io_error() {
        let t = token(vec![(b"key", b"value")]);
        let mut buf = Vec::new();
        write_snapshot(&t, &mut buf, &CancellationToken::new()).unwrap();
        buf.truncate(buf.len() - 6);
        assert!(matches!(read_snapshot(&mut buf.as_slice()), Err(StoreError::Io(_))));
    }
}
