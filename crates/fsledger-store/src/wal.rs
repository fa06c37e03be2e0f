//! Ledger Write-Ahead Log
//!
//! Append-only log shared by every kind's table with:
//! - Sequential LSN assignment
//! - CRC32C checksums per record
//! - Replay from any LSN
//! - Truncation after checkpoint
//!
//! Record format:
//! ```text
//! +--------+------+--------+------+--------+
//! | Magic  | LSN  | Length | Data | CRC32C |
//! | 4B     | 8B   | 4B     | var  | 4B     |
//! +--------+------+--------+------+--------+
//! ```

use crate::types::LedgerWalOp;
use fsledger_common::{Error, Result, WalConfig};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Log sequence number; also the end location handed back to writers
pub type Lsn = u64;

/// WAL record magic number
const WAL_MAGIC: u32 = 0x4C57_414C; // "LWAL"

/// Record header size (magic + lsn + length)
const RECORD_HEADER_SIZE: usize = 16;

/// Trailing CRC size
const RECORD_TRAILER_SIZE: usize = 4;

/// Durability requested by a single ledger write
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FlushMode {
    /// Flush before the write returns
    #[default]
    Sync,
    /// Leave the record for the next `flush_wal()` or checkpoint
    Deferred,
}

/// Append-only, durably flushable log of opaque records
pub trait WalSink: Send + Sync {
    /// Append a payload and return its LSN
    fn append(&self, payload: &[u8]) -> Result<Lsn>;

    /// Make every record up to and including `upto` durable
    fn flush(&self, upto: Lsn) -> Result<()>;

    /// Last LSN assigned
    fn current_lsn(&self) -> Lsn;

    /// Last LSN known durable
    fn flushed_lsn(&self) -> Lsn;

    /// Bytes currently held by the log
    fn size_bytes(&self) -> u64;

    /// Call `callback` for every record with LSN >= `from_lsn`, returning the last LSN seen
    fn replay(&self, from_lsn: Lsn, callback: &mut dyn FnMut(Lsn, &[u8]) -> Result<()>)
    -> Result<Lsn>;

    /// Drop every record with LSN < `lsn`
    fn truncate_before(&self, lsn: Lsn) -> Result<()>;

    /// Assign LSNs above `lsn` from now on
    ///
    /// Records up to `lsn` are covered by a checkpoint and count as durable.
    /// A log emptied by truncation restarts numbering at 1 on open, so the
    /// caller raises it past every checkpoint before writing.
    fn advance_to(&self, lsn: Lsn);
}

/// A single WAL record
#[derive(Debug)]
pub struct WalRecord {
    /// Log Sequence Number
    pub lsn: Lsn,
    /// Serialized operation
    pub data: Vec<u8>,
}

impl WalRecord {
    /// Serialize record to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let data_len = u32::try_from(self.data.len())
            .map_err(|_| Error::wal(format!("WAL record too large: {} bytes", self.data.len())))?;
        let total_size = RECORD_HEADER_SIZE + self.data.len() + RECORD_TRAILER_SIZE;
        let mut buf = Vec::with_capacity(total_size);

        buf.extend_from_slice(&WAL_MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.extend_from_slice(&data_len.to_le_bytes());
        buf.extend_from_slice(&self.data);

        // CRC over everything except the CRC itself
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        Ok(buf)
    }

    /// Parse record from bytes, returning it with its encoded size
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < RECORD_HEADER_SIZE + RECORD_TRAILER_SIZE {
            return Err(Error::wal("WAL record too small"));
        }

        if le_u32(&data[0..4]) != WAL_MAGIC {
            return Err(Error::wal("invalid WAL magic"));
        }

        let lsn = le_u64(&data[4..12]);
        let data_len = le_u32(&data[12..16]) as usize;

        let total_size = RECORD_HEADER_SIZE + data_len + RECORD_TRAILER_SIZE;
        if data.len() < total_size {
            return Err(Error::wal("WAL record truncated"));
        }

        let body_end = RECORD_HEADER_SIZE + data_len;
        let stored_crc = le_u32(&data[body_end..total_size]);
        if crc32c::crc32c(&data[..body_end]) != stored_crc {
            return Err(Error::wal("WAL record CRC mismatch"));
        }

        Ok((
            Self {
                lsn,
                data: data[RECORD_HEADER_SIZE..body_end].to_vec(),
            },
            total_size,
        ))
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// Parse every valid record of a WAL image, stopping at the first torn or corrupt one
///
/// Returns the records and the byte length of the valid prefix.
fn parse_records(data: &[u8]) -> (Vec<WalRecord>, usize) {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset + RECORD_HEADER_SIZE + RECORD_TRAILER_SIZE <= data.len() {
        match WalRecord::from_bytes(&data[offset..]) {
            Ok((record, size)) => {
                records.push(record);
                offset += size;
            }
            Err(_) => break,
        }
    }
    (records, offset)
}

/// File-backed ledger WAL
pub struct FileWal {
    /// WAL file path
    path: PathBuf,
    /// File handle for writing
    writer: Mutex<BufWriter<File>>,
    /// Current file size
    size: AtomicU64,
    /// Next LSN to assign
    next_lsn: AtomicU64,
    /// Highest LSN known to be on stable storage
    flushed_lsn: AtomicU64,
    /// Configuration
    config: WalConfig,
}

impl FileWal {
    /// Create a new, empty WAL file
    pub fn create(path: impl AsRef<Path>, config: WalConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::wal(format!("failed to create WAL: {e}")))?;

        let writer = BufWriter::with_capacity(config.write_buffer_size, file);

        Ok(Self {
            path,
            writer: Mutex::new(writer),
            size: AtomicU64::new(0),
            next_lsn: AtomicU64::new(1),
            flushed_lsn: AtomicU64::new(0),
            config,
        })
    }

    /// Open an existing WAL file, creating it when absent
    ///
    /// A torn tail left by a crash mid-append is cut off so new records
    /// land directly after the last valid one.
    pub fn open(path: impl AsRef<Path>, config: WalConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let (last_lsn, valid_len) = Self::scan_wal(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::wal(format!("failed to open WAL: {e}")))?;

        let file_len = file.metadata()?.len();
        if file_len > valid_len {
            warn!(
                "Discarding {} bytes of torn WAL tail in {:?}",
                file_len - valid_len,
                path
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        let writer = BufWriter::with_capacity(config.write_buffer_size, file);

        Ok(Self {
            path,
            writer: Mutex::new(writer),
            size: AtomicU64::new(valid_len),
            next_lsn: AtomicU64::new(last_lsn + 1),
            flushed_lsn: AtomicU64::new(last_lsn),
            config,
        })
    }

    /// Scan WAL to find last LSN and the length of its valid prefix
    fn scan_wal(path: &Path) -> Result<(Lsn, u64)> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
            Err(e) => return Err(Error::wal(format!("failed to read WAL: {e}"))),
        };

        let (records, valid_len) = parse_records(&data);
        let last_lsn = records.last().map_or(0, |r| r.lsn);
        Ok((last_lsn, valid_len as u64))
    }

    /// Read every valid record currently in the file
    fn read_all(&self) -> Result<Vec<WalRecord>> {
        // Buffered bytes must reach the file before it is read back
        self.writer
            .lock()
            .flush()
            .map_err(|e| Error::wal(format!("WAL flush failed: {e}")))?;

        let data = std::fs::read(&self.path)
            .map_err(|e| Error::wal(format!("failed to open WAL for replay: {e}")))?;
        Ok(parse_records(&data).0)
    }

    /// Sync WAL to disk
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer
            .flush()
            .map_err(|e| Error::wal(format!("WAL flush failed: {e}")))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| Error::wal(format!("WAL sync failed: {e}")))?;
        self.flushed_lsn
            .store(self.current_lsn(), Ordering::SeqCst);
        Ok(())
    }

    /// Get the path of the WAL file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl WalSink for FileWal {
    fn append(&self, payload: &[u8]) -> Result<Lsn> {
        // LSNs are assigned under the writer lock so file order matches LSN order
        let mut writer = self.writer.lock();
        let lsn = self.next_lsn.load(Ordering::SeqCst);
        let bytes = WalRecord {
            lsn,
            data: payload.to_vec(),
        }
        .to_bytes()?;

        writer
            .write_all(&bytes)
            .map_err(|e| Error::wal(format!("WAL write failed: {e}")))?;
        self.next_lsn.store(lsn + 1, Ordering::SeqCst);
        self.size.fetch_add(bytes.len() as u64, Ordering::Relaxed);

        if self.config.sync_on_write {
            writer
                .flush()
                .map_err(|e| Error::wal(format!("WAL flush failed: {e}")))?;
            writer
                .get_ref()
                .sync_data()
                .map_err(|e| Error::wal(format!("WAL sync failed: {e}")))?;
            self.flushed_lsn.store(lsn, Ordering::SeqCst);
        }

        Ok(lsn)
    }

    fn flush(&self, upto: Lsn) -> Result<()> {
        if upto <= self.flushed_lsn.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut writer = self.writer.lock();
        writer
            .flush()
            .map_err(|e| Error::wal(format!("WAL flush failed: {e}")))?;
        writer
            .get_ref()
            .sync_data()
            .map_err(|e| Error::wal(format!("WAL sync failed: {e}")))?;

        let durable = self.next_lsn.load(Ordering::SeqCst).saturating_sub(1);
        self.flushed_lsn.fetch_max(durable, Ordering::SeqCst);
        Ok(())
    }

    fn current_lsn(&self) -> Lsn {
        self.next_lsn.load(Ordering::SeqCst).saturating_sub(1)
    }

    fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn.load(Ordering::SeqCst)
    }

    fn size_bytes(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    fn replay(
        &self,
        from_lsn: Lsn,
        callback: &mut dyn FnMut(Lsn, &[u8]) -> Result<()>,
    ) -> Result<Lsn> {
        let mut last_lsn = from_lsn.saturating_sub(1);
        for record in self.read_all()? {
            if record.lsn >= from_lsn {
                callback(record.lsn, &record.data)?;
            }
            last_lsn = record.lsn;
        }
        Ok(last_lsn)
    }

    /// Rewrite the WAL keeping only records >= `lsn`
    ///
    /// LSNs are preserved so checkpoint LSNs stay meaningful.
    fn truncate_before(&self, lsn: Lsn) -> Result<()> {
        let new_path = self.path.with_extension("wal.new");

        let mut writer = self.writer.lock();
        writer
            .flush()
            .map_err(|e| Error::wal(format!("WAL flush failed: {e}")))?;
        let data = std::fs::read(&self.path)
            .map_err(|e| Error::wal(format!("failed to read WAL: {e}")))?;
        let records = parse_records(&data).0;

        let mut kept = 0usize;
        {
            let mut file = File::create(&new_path)
                .map_err(|e| Error::wal(format!("failed to create WAL: {e}")))?;
            for record in records.iter().filter(|r| r.lsn >= lsn) {
                file.write_all(&record.to_bytes()?)?;
                kept += 1;
            }
            file.sync_all()?;
        }

        // Atomic rename
        std::fs::rename(&new_path, &self.path)
            .map_err(|e| Error::wal(format!("WAL rename failed: {e}")))?;

        // Reopen writer to new file
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::wal(format!("failed to reopen WAL: {e}")))?;
        let new_size = file.metadata()?.len();
        *writer = BufWriter::with_capacity(self.config.write_buffer_size, file);
        self.size.store(new_size, Ordering::Relaxed);

        debug!(
            "Truncated WAL before LSN {}: kept {} of {} records",
            lsn,
            kept,
            records.len()
        );
        Ok(())
    }

    fn advance_to(&self, lsn: Lsn) {
        let _writer = self.writer.lock();
        let previous = self.next_lsn.fetch_max(lsn + 1, Ordering::SeqCst);
        self.flushed_lsn.fetch_max(lsn, Ordering::SeqCst);
        if previous <= lsn {
            debug!("WAL LSNs advanced from {} to {}", previous, lsn + 1);
        }
    }
}

/// In-memory WAL
///
/// Keeps unflushed records apart from durable ones so a crash can be
/// simulated with [`MemoryWal::crash`].
#[derive(Default)]
pub struct MemoryWal {
    state: Mutex<MemoryWalState>,
}

#[derive(Default)]
struct MemoryWalState {
    records: Vec<(Lsn, Vec<u8>)>,
    last_lsn: Lsn,
    flushed_lsn: Lsn,
    flush_calls: u64,
}

impl MemoryWal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of flushes that had something to make durable
    pub fn flush_calls(&self) -> u64 {
        self.state.lock().flush_calls
    }

    /// Number of records appended and not yet truncated
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// What a restarted process would find: only the durable records
    pub fn crash(&self) -> Self {
        let state = self.state.lock();
        let records: Vec<_> = state
            .records
            .iter()
            .filter(|(lsn, _)| *lsn <= state.flushed_lsn)
            .cloned()
            .collect();
        Self {
            state: Mutex::new(MemoryWalState {
                records,
                last_lsn: state.flushed_lsn,
                flushed_lsn: state.flushed_lsn,
                flush_calls: 0,
            }),
        }
    }
}

impl WalSink for MemoryWal {
    fn append(&self, payload: &[u8]) -> Result<Lsn> {
        let mut state = self.state.lock();
        state.last_lsn += 1;
        let lsn = state.last_lsn;
        state.records.push((lsn, payload.to_vec()));
        Ok(lsn)
    }

    fn flush(&self, upto: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        if upto > state.flushed_lsn {
            state.flushed_lsn = state.last_lsn;
            state.flush_calls += 1;
        }
        Ok(())
    }

    fn current_lsn(&self) -> Lsn {
        self.state.lock().last_lsn
    }

    fn flushed_lsn(&self) -> Lsn {
        self.state.lock().flushed_lsn
    }

    fn size_bytes(&self) -> u64 {
        self.state
            .lock()
            .records
            .iter()
            .map(|(_, data)| (RECORD_HEADER_SIZE + data.len() + RECORD_TRAILER_SIZE) as u64)
            .sum()
    }

    fn replay(
        &self,
        from_lsn: Lsn,
        callback: &mut dyn FnMut(Lsn, &[u8]) -> Result<()>,
    ) -> Result<Lsn> {
        let records = self.state.lock().records.clone();
        let mut last_lsn = from_lsn.saturating_sub(1);
        for (lsn, data) in records {
            if lsn >= from_lsn {
                callback(lsn, &data)?;
            }
            last_lsn = lsn;
        }
        Ok(last_lsn)
    }

    fn truncate_before(&self, lsn: Lsn) -> Result<()> {
        self.state.lock().records.retain(|(l, _)| *l >= lsn);
        Ok(())
    }

    fn advance_to(&self, lsn: Lsn) {
        let mut state = self.state.lock();
        state.last_lsn = state.last_lsn.max(lsn);
        state.flushed_lsn = state.flushed_lsn.max(lsn);
    }
}

/// Ledger-side view of the WAL
///
/// Encodes ledger operations and tracks the highest LSN written with a
/// deferred flush, so `flush_pending` can make a batch durable at once.
pub struct WalWriter {
    sink: Arc<dyn WalSink>,
    pending: AtomicU64,
}

impl WalWriter {
    pub fn new(sink: Arc<dyn WalSink>) -> Self {
        Self {
            sink,
            pending: AtomicU64::new(0),
        }
    }

    pub fn sink(&self) -> &Arc<dyn WalSink> {
        &self.sink
    }

    /// Append one ledger operation with the requested durability
    pub fn log(&self, op: &LedgerWalOp, flush: FlushMode) -> Result<Lsn> {
        let lsn = self.sink.append(&op.to_bytes()?)?;
        match flush {
            FlushMode::Sync => self.sink.flush(lsn)?,
            FlushMode::Deferred => {
                self.pending.fetch_max(lsn, Ordering::SeqCst);
            }
        }
        Ok(lsn)
    }

    /// Make every deferred write durable
    pub fn flush_pending(&self) -> Result<()> {
        let pending = self.pending.swap(0, Ordering::SeqCst);
        if pending == 0 {
            return Ok(());
        }
        if let Err(e) = self.sink.flush(pending) {
            self.pending.fetch_max(pending, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    /// Highest LSN written with a deferred flush and not yet flushed
    pub fn pending_lsn(&self) -> Option<Lsn> {
        match self.pending.load(Ordering::SeqCst) {
            0 => None,
            lsn => Some(lsn),
        }
    }

    /// Make everything appended so far durable
    pub fn flush_all(&self) -> Result<()> {
        self.pending.store(0, Ordering::SeqCst);
        self.sink.flush(self.sink.current_lsn())
    }

    pub fn current_lsn(&self) -> Lsn {
        self.sink.current_lsn()
    }

    /// Replay decoded ledger operations with LSN >= `from_lsn`
    pub fn replay<F>(&self, from_lsn: Lsn, mut callback: F) -> Result<Lsn>
    where
        F: FnMut(Lsn, LedgerWalOp) -> Result<()>,
    {
        self.sink.replay(from_lsn, &mut |lsn, data| {
            callback(lsn, LedgerWalOp::from_bytes(data)?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsledger_common::{ItemLocator, ObjectKindTag};
    use tempfile::tempdir;

    fn test_config() -> WalConfig {
        WalConfig {
            sync_on_write: false,
            max_size_bytes: 1024 * 1024,
            write_buffer_size: 4096,
        }
    }

    fn free_op(index: u32) -> LedgerWalOp {
        LedgerWalOp::Free {
            kind: ObjectKindTag::DatabaseDir,
            locator: ItemLocator::new(index, 1),
        }
    }

    #[test]
    fn test_wal_create_and_append() {
        let dir = tempdir().unwrap();
        let wal = FileWal::create(dir.path().join("test.wal"), test_config()).unwrap();

        assert_eq!(wal.append(b"first").unwrap(), 1);
        assert_eq!(wal.append(b"second").unwrap(), 2);
        assert_eq!(wal.current_lsn(), 2);
        assert_eq!(wal.flushed_lsn(), 0);

        wal.flush(1).unwrap();
        assert_eq!(wal.flushed_lsn(), 2);
    }

    #[test]
    fn test_wal_replay_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        {
            let wal = FileWal::create(&path, test_config()).unwrap();
            for i in 0..3u8 {
                wal.append(&[i; 10]).unwrap();
            }
            wal.sync().unwrap();
        }

        let wal = FileWal::open(&path, test_config()).unwrap();
        assert_eq!(wal.current_lsn(), 3);

        let mut seen = vec![];
        let last = wal
            .replay(2, &mut |lsn, data| {
                seen.push((lsn, data[0]));
                Ok(())
            })
            .unwrap();
        assert_eq!(last, 3);
        assert_eq!(seen, vec![(2, 1), (3, 2)]);

        assert_eq!(wal.append(b"next").unwrap(), 4);
    }

    #[test]
    fn test_wal_torn_tail_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        {
            let wal = FileWal::create(&path, test_config()).unwrap();
            wal.append(b"complete").unwrap();
            wal.sync().unwrap();
        }

        // Half a record from a crash mid-append
        let partial = WalRecord {
            lsn: 2,
            data: b"partial".to_vec(),
        }
        .to_bytes()
        .unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&partial[..partial.len() / 2]).unwrap();
        drop(file);

        let wal = FileWal::open(&path, test_config()).unwrap();
        assert_eq!(wal.current_lsn(), 1);
        assert_eq!(wal.append(b"after").unwrap(), 2);
        wal.sync().unwrap();

        let mut count = 0;
        wal.replay(1, &mut |_, _| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_wal_truncate_keeps_lsns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let wal = FileWal::create(&path, test_config()).unwrap();
        for i in 0..5u8 {
            wal.append(&[i]).unwrap();
        }

        wal.truncate_before(4).unwrap();

        let mut lsns = vec![];
        wal.replay(0, &mut |lsn, _| {
            lsns.push(lsn);
            Ok(())
        })
        .unwrap();
        assert_eq!(lsns, vec![4, 5]);
        assert_eq!(wal.append(b"x").unwrap(), 6);
    }

    #[test]
    fn test_emptied_wal_reopens_below_checkpoint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        {
            let wal = FileWal::create(&path, test_config()).unwrap();
            for i in 0..3u8 {
                wal.append(&[i]).unwrap();
            }
            wal.truncate_before(4).unwrap();
        }

        // Nothing left to scan: numbering restarts until raised
        let wal = FileWal::open(&path, test_config()).unwrap();
        assert_eq!(wal.current_lsn(), 0);
        wal.advance_to(3);
        assert_eq!(wal.current_lsn(), 3);
        assert_eq!(wal.flushed_lsn(), 3);
        assert_eq!(wal.append(b"x").unwrap(), 4);

        // Never lowers
        wal.advance_to(1);
        assert_eq!(wal.append(b"y").unwrap(), 5);

        let memory = MemoryWal::new();
        memory.advance_to(7);
        assert_eq!(memory.append(b"z").unwrap(), 8);
        assert!(memory.crash().is_empty());
    }

    #[test]
    fn test_record_rejects_bad_crc() {
        let mut bytes = WalRecord {
            lsn: 42,
            data: b"payload".to_vec(),
        }
        .to_bytes()
        .unwrap();
        let (parsed, size) = WalRecord::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.lsn, 42);
        assert_eq!(size, bytes.len());

        bytes[RECORD_HEADER_SIZE] ^= 0xFF;
        assert!(WalRecord::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_writer_deferred_flush() {
        let sink = Arc::new(MemoryWal::new());
        let writer = WalWriter::new(sink.clone());

        writer.log(&free_op(1), FlushMode::Deferred).unwrap();
        writer.log(&free_op(2), FlushMode::Deferred).unwrap();
        assert_eq!(writer.pending_lsn(), Some(2));
        assert_eq!(sink.flushed_lsn(), 0);
        assert_eq!(sink.crash().len(), 0);

        writer.flush_pending().unwrap();
        assert_eq!(writer.pending_lsn(), None);
        assert_eq!(sink.flushed_lsn(), 2);
        assert_eq!(sink.flush_calls(), 1);

        // Nothing pending: no extra flush
        writer.flush_pending().unwrap();
        assert_eq!(sink.flush_calls(), 1);

        writer.log(&free_op(3), FlushMode::Sync).unwrap();
        assert_eq!(sink.crash().len(), 3);
    }

    #[test]
    fn test_writer_replay_decodes_ops() {
        let sink = Arc::new(MemoryWal::new());
        let writer = WalWriter::new(sink);
        writer.log(&free_op(7), FlushMode::Sync).unwrap();

        let mut ops = vec![];
        writer
            .replay(1, |lsn, op| {
                ops.push((lsn, op));
                Ok(())
            })
            .unwrap();
        assert_eq!(ops, vec![(1, free_op(7))]);
    }
}
