//! The log-structured store.
//!
//! One `LogStore` owns one directory. All state lives in a single append-only
//! `store.log` of CRC-framed batch records; an in-memory ordered image is
//! rebuilt from the log on open. Writes go log-first (frame, fsync, then
//! publish to the image), so a batch is either fully durable or, after a
//! crash, fully absent.
//!
//! Frame layout: `crc32:u32 | len:u32 | bincode(BatchRecord)`, integers
//! little-endian. A short or checksum-failing tail frame is an interrupted
//! write: recovery truncates the log to the last good frame and carries on.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use croft_commons::keys::APPLIED_INDEX_KEY;

use crate::batch::{BatchRecord, Op, WriteBatch};
use crate::error::{Result, StoreError};
use crate::snapshot::{self, SnapshotToken};

const LOG_FILE: &str = "store.log";
const TMP_FILE: &str = "store.log.tmp";

/// Frames larger than this are treated as corruption rather than allocated.
const MAX_FRAME_LEN: u32 = 1 << 30;

/// Rewrite the log on open when it is this many times larger than the
/// estimated live data.
const COMPACT_FACTOR: u64 = 4;

/// Skip compaction entirely below this log size.
const COMPACT_MIN_BYTES: u64 = 1 << 20;

// One directory, one writer. Opening the same directory twice in a process
// is a bug in the caller; cross-process exclusion is out of scope.
static OPEN_DIRS: Mutex<BTreeSet<PathBuf>> = Mutex::new(BTreeSet::new());

struct Inner {
    image: BTreeMap<Vec<u8>, Vec<u8>>,
    log: File,
    log_bytes: u64,
}

/// A durable single-writer key-value store.
pub struct LogStore {
    dir: PathBuf,
    inner: RwLock<Inner>,
}

impl LogStore {
    /// Opens (or creates) the store in `dir`, replaying the log and
    /// truncating any interrupted tail write.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        let dir = dir.as_ref().canonicalize()?;
        {
            let mut open_dirs = OPEN_DIRS.lock();
            if !open_dirs.insert(dir.clone()) {
                return Err(StoreError::Locked(dir));
            }
        }
        match Self::open_locked(&dir) {
            Ok(store) => Ok(store),
            Err(e) => {
                OPEN_DIRS.lock().remove(&dir);
                Err(e)
            }
        }
    }

    fn open_locked(dir: &Path) -> Result<LogStore> {
        let path = dir.join(LOG_FILE);
        let mut log = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        let (image, good_offset) = replay(&mut log)?;

        let file_len = log.metadata()?.len();
        if good_offset < file_len {
            log::warn!(
                "truncating interrupted tail of {}: {} -> {} bytes",
                path.display(),
                file_len,
                good_offset
            );
            log.set_len(good_offset)?;
            log.sync_data()?;
        }
        log.seek(SeekFrom::Start(good_offset))?;

        let mut store = LogStore {
            dir: dir.to_path_buf(),
            inner: RwLock::new(Inner { image, log, log_bytes: good_offset }),
        };
        store.maybe_compact()?;
        Ok(store)
    }

    /// Path of the directory this store owns.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Point lookup against the committed image.
    pub fn lookup(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.read().image.get(key).cloned()
    }

    /// Batched lookup under a single read lock, so all results come from
    /// one committed view.
    pub fn lookup_batch(&self, keys: &[Vec<u8>]) -> Vec<Option<Vec<u8>>> {
        let inner = self.inner.read();
        keys.iter().map(|k| inner.image.get(k).cloned()).collect()
    }

    /// Forward iterator over a point-in-time copy of the image. Never
    /// blocks writers; entries written after this call are not observed.
    pub fn iter(&self) -> SnapshotIter {
        let entries: Vec<_> =
            self.inner.read().image.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        SnapshotIter { entries: entries.into_iter() }
    }

    /// All entries whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let inner = self.inner.read();
        let upper = prefix_upper_bound(prefix);
        let range: Box<dyn Iterator<Item = (&Vec<u8>, &Vec<u8>)>> = match &upper {
            Some(end) => Box::new(inner.image.range::<[u8], _>((
                Bound::Included(prefix),
                Bound::Excluded(end.as_slice()),
            ))),
            None => Box::new(inner.image.range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))),
        };
        range.map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Number of live entries, the sentinel included when present.
    pub fn len(&self) -> usize {
        self.inner.read().image.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().image.is_empty()
    }

    /// Current size of the log file in bytes.
    pub fn log_bytes(&self) -> u64 {
        self.inner.read().log_bytes
    }

    /// Commits a batch: frame, fsync, publish.
    pub fn apply(&self, batch: WriteBatch) -> Result<()> {
        self.apply_record(BatchRecord { ops: batch.ops })
    }

    /// Commits a batch together with the `applied_index` sentinel in the
    /// same frame, so the data and the replay watermark can never diverge.
    pub fn apply_indexed(&self, batch: WriteBatch, applied_index: u64) -> Result<()> {
        let mut ops = batch.ops;
        ops.push(Op::Put {
            key: APPLIED_INDEX_KEY.to_vec(),
            value: applied_index.to_le_bytes().to_vec(),
        });
        self.apply_record(BatchRecord { ops })
    }

    /// The raft log index of the last applied batch, if any batch has been
    /// applied through [`LogStore::apply_indexed`].
    pub fn applied_index(&self) -> Result<Option<u64>> {
        match self.lookup(APPLIED_INDEX_KEY) {
            None => Ok(None),
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| StoreError::Corrupt {
                    offset: 0,
                    reason: format!("applied_index value has {} bytes", bytes.len()),
                })?;
                Ok(Some(u64::from_le_bytes(raw)))
            }
        }
    }

    fn apply_record(&self, record: BatchRecord) -> Result<()> {
        if record.ops.is_empty() {
            return Ok(());
        }
        let frame = encode_frame(&record)?;
        let mut inner = self.inner.write();
        inner.log.write_all(&frame)?;
        inner.log.sync_data()?;
        inner.log_bytes += frame.len() as u64;
        for op in record.ops {
            match op {
                Op::Put { key, value } => {
                    inner.image.insert(key, value);
                }
                Op::Delete { key } => {
                    inner.image.remove(&key);
                }
            }
        }
        Ok(())
    }

    /// Flushes the log to stable storage. Individual batches already sync;
    /// this exists for explicit durability barriers.
    pub fn sync(&self) -> Result<()> {
        self.inner.read().log.sync_data()?;
        Ok(())
    }

    /// Captures the entire image (sentinel included) without blocking
    /// subsequent writers.
    pub fn prepare_snapshot(&self) -> SnapshotToken {
        let entries =
            self.inner.read().image.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        SnapshotToken { entries }
    }

    /// Streams a captured snapshot; see [`snapshot::write_snapshot`].
    pub fn save_snapshot<W: Write + ?Sized>(
        &self,
        token: &SnapshotToken,
        writer: &mut W,
        cancel: &CancellationToken,
    ) -> Result<()> {
        snapshot::write_snapshot(token, writer, cancel)
    }

    /// Replaces the store's contents with a snapshot stream. The new image
    /// is staged in a temporary log and renamed over the live one, so a
    /// failure mid-recovery leaves the previous contents intact.
    pub fn recover_from_snapshot<R: Read + ?Sized>(&self, reader: &mut R) -> Result<()> {
        let entries = snapshot::read_snapshot(reader)?;
        let mut inner = self.inner.write();
        let image: BTreeMap<Vec<u8>, Vec<u8>> = entries.into_iter().collect();
        let (log, log_bytes) = self.rewrite_log(&image)?;
        inner.image = image;
        inner.log = log;
        inner.log_bytes = log_bytes;
        Ok(())
    }

    /// Flushes and closes the store, releasing the directory.
    pub fn close(self) -> Result<()> {
        self.sync()
        // Drop releases the open-directory registration.
    }

    fn maybe_compact(&mut self) -> Result<()> {
        let image = {
            let inner = self.inner.get_mut();
            if inner.log_bytes < COMPACT_MIN_BYTES {
                return Ok(());
            }
            let live: u64 =
                inner.image.iter().map(|(k, v)| 16 + k.len() as u64 + v.len() as u64).sum();
            if inner.log_bytes <= COMPACT_FACTOR * live.max(1) {
                return Ok(());
            }
            log::info!("compacting {} log bytes (~{live} live)", inner.log_bytes);
            std::mem::take(&mut inner.image)
        };
        let (log, log_bytes) = self.rewrite_log(&image)?;
        let inner = self.inner.get_mut();
        inner.image = image;
        inner.log = log;
        inner.log_bytes = log_bytes;
        Ok(())
    }

    /// Writes `image` as a single frame into a fresh log and atomically
    /// swaps it in. Returns the new write handle and its length.
    fn rewrite_log(&self, image: &BTreeMap<Vec<u8>, Vec<u8>>) -> Result<(File, u64)> {
        let tmp_path = self.dir.join(TMP_FILE);
        let live_path = self.dir.join(LOG_FILE);
        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut log_bytes = 0u64;
        if !image.is_empty() {
            let record = BatchRecord {
                ops: image
                    .iter()
                    .map(|(k, v)| Op::Put { key: k.clone(), value: v.clone() })
                    .collect(),
            };
            let frame = encode_frame(&record)?;
            tmp.write_all(&frame)?;
            log_bytes = frame.len() as u64;
        }
        tmp.sync_all()?;
        fs::rename(&tmp_path, &live_path)?;
        let mut log = OpenOptions::new().read(true).write(true).open(&live_path)?;
        log.seek(SeekFrom::End(0))?;
        Ok((log, log_bytes))
    }
}

impl Drop for LogStore {
    fn drop(&mut self) {
        OPEN_DIRS.lock().remove(&self.dir);
    }
}

/// Iterator over a point-in-time copy of the image.
pub struct SnapshotIter {
    entries: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
}

impl Iterator for SnapshotIter {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

impl DoubleEndedIterator for SnapshotIter {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.entries.next_back()
    }
}

impl ExactSizeIterator for SnapshotIter {}

fn encode_frame(record: &BatchRecord) -> Result<Vec<u8>> {
    let body = bincode::serde::encode_to_vec(record, bincode::config::standard())?;
    let mut frame = Vec::with_capacity(8 + body.len());
    frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Replays the log from the start, returning the rebuilt image and the
/// offset just past the last intact frame.
fn replay(log: &mut File) -> Result<(BTreeMap<Vec<u8>, Vec<u8>>, u64)> {
    log.seek(SeekFrom::Start(0))?;
    let mut reader = std::io::BufReader::new(&mut *log);
    let mut image = BTreeMap::new();
    let mut offset = 0u64;
    loop {
        let mut header = [0u8; 8];
        match read_exact_or_eof(&mut reader, &mut header) {
            ReadOutcome::Full => {}
            ReadOutcome::Partial | ReadOutcome::Eof => break,
        }
        let crc = u32::from_le_bytes(header[0..4].try_into().unwrap_or_default());
        let len = u32::from_le_bytes(header[4..8].try_into().unwrap_or_default());
        if len > MAX_FRAME_LEN {
            log::warn!("frame at offset {offset} claims {len} bytes, treating as torn write");
            break;
        }
        let mut body = vec![0u8; len as usize];
        match read_exact_or_eof(&mut reader, &mut body) {
            ReadOutcome::Full => {}
            ReadOutcome::Partial | ReadOutcome::Eof => break,
        }
        if crc32fast::hash(&body) != crc {
            log::warn!("checksum mismatch at offset {offset}, treating as torn write");
            break;
        }
        let record: BatchRecord =
            match bincode::serde::decode_from_slice(&body, bincode::config::standard()) {
                Ok((record, _)) => record,
                Err(e) => {
                    log::warn!("undecodable frame at offset {offset}: {e}");
                    break;
                }
            };
        for op in record.ops {
            match op {
                Op::Put { key, value } => {
                    image.insert(key, value);
                }
                Op::Delete { key } => {
                    image.remove(&key);
                }
            }
        }
        offset += 8 + len as u64;
    }
    Ok((image, offset))
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> ReadOutcome {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return if filled == 0 { ReadOutcome::Eof } else { ReadOutcome::Partial },
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => return ReadOutcome::Partial,
        }
    }
    ReadOutcome::Full
}

fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}
