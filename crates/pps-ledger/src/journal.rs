use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use fs2::FileExt;
use pps_types::LedgerEntry;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{LedgerError, LedgerResult};

/// When journal writes are forced to stable storage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fsync` after every record. A write acknowledged to the caller
    /// survives power loss.
    #[default]
    EveryWrite,
    /// Flush to the OS only.
    OsDefault,
}

/// Record header: 4 bytes length + 4 bytes CRC32, both little-endian.
const HEADER_SIZE: usize = 8;

/// Upper bound on a single record, to reject garbage lengths early.
const MAX_RECORD_SIZE: u32 = 16 * 1024 * 1024;

struct JournalWriter {
    writer: BufWriter<File>,
    offset: u64,
}

/// Append-only file of ledger entry snapshots.
///
/// On-disk format, repeated:
/// ```text
/// [4 bytes: payload length (LE u32)]
/// [4 bytes: CRC32 of payload (LE u32)]
/// [N bytes: bincode-encoded LedgerEntry]
/// ```
///
/// Every accepted ledger write appends the full new entry, so replay is a
/// matter of keeping the last record per dataset. A torn tail from a crash
/// ends recovery; a record failing its CRC is skipped.
///
/// An open journal holds an exclusive lock on `<path>.lock` until dropped,
/// so a second opener fails with [`LedgerError::Locked`].
pub struct Journal {
    path: PathBuf,
    writer: Mutex<JournalWriter>,
    sync_mode: SyncMode,
    _lock: File,
}

/// What a recovery pass found.
#[derive(Debug, Default)]
pub struct Recovery {
    pub entries: Vec<LedgerEntry>,
    pub skipped: usize,
    /// Bytes of torn data after the last complete record.
    pub torn_bytes: u64,
}

impl Journal {
    /// Open (or create) the journal at `path`.
    pub fn open(path: &Path, sync_mode: SyncMode) -> LedgerResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let lock = acquire_lock(path)?;
        let (writer, offset) = open_writer(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(JournalWriter { writer, offset }),
            sync_mode,
            _lock: lock,
        })
    }

    /// Append one entry snapshot. Returns the byte offset of the record.
    ///
    /// A failed append leaves no trace: buffered bytes are discarded and the
    /// file is cut back to the end of the last good record.
    pub fn append(&self, entry: &LedgerEntry) -> LedgerResult<u64> {
        let payload = encode(entry)?;
        let mut w = self.lock()?;
        let record_offset = w.offset;
        if let Err(e) = write_durably(&mut w.writer, &payload, self.sync_mode) {
            warn!(offset = record_offset, error = %e, "journal append failed; rolling back");
            self.roll_back(&mut w)?;
            return Err(e.into());
        }
        w.offset += (HEADER_SIZE + payload.len()) as u64;
        debug!(offset = record_offset, len = payload.len(), "journal append");
        Ok(record_offset)
    }

    /// Drop whatever the writer holds past `offset`, in its buffer or on disk.
    fn roll_back(&self, w: &mut JournalWriter) -> LedgerResult<()> {
        let (fresh, _) = open_writer(&self.path)?;
        let (_, _unwritten) = std::mem::replace(&mut w.writer, fresh).into_parts();
        w.writer.get_ref().set_len(w.offset)?;
        Ok(())
    }

    /// Read every intact record, front to back.
    pub fn recover(&self) -> LedgerResult<Recovery> {
        let _guard = self.lock()?;
        read_records(&self.path)
    }

    /// Replace the journal's contents with exactly `entries`, one record
    /// each. The new file is written beside the old one and renamed over
    /// it, so a crash leaves either the old or the new journal intact.
    pub fn rewrite<'a>(&self, entries: impl IntoIterator<Item = &'a LedgerEntry>) -> LedgerResult<u64> {
        let mut w = self.lock()?;
        let tmp = self.path.with_extension("compacting");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for entry in entries {
                write_record(&mut out, &encode(entry)?)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        if let Some(parent) = self.path.parent() {
            // Persist the rename itself; not every platform allows opening a directory.
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        let (writer, offset) = open_writer(&self.path)?;
        w.writer = writer;
        w.offset = offset;
        debug!(bytes = offset, "journal rewritten");
        Ok(offset)
    }

    /// Current size of the journal in bytes.
    pub fn offset(&self) -> LedgerResult<u64> {
        Ok(self.lock()?.offset)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> LedgerResult<MutexGuard<'_, JournalWriter>> {
        self.writer
            .lock()
            .map_err(|_| LedgerError::Unavailable("journal mutex poisoned".into()))
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

fn acquire_lock(path: &Path) -> LedgerResult<File> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path(path))?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
            Err(LedgerError::Locked(path.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

fn write_durably(writer: &mut BufWriter<File>, payload: &[u8], sync_mode: SyncMode) -> io::Result<()> {
    write_record(writer, payload)?;
    writer.flush()?;
    if sync_mode == SyncMode::EveryWrite {
        writer.get_ref().sync_data()?;
    }
    Ok(())
}

fn open_writer(path: &Path) -> LedgerResult<(BufWriter<File>, u64)> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let offset = file.metadata()?.len();
    Ok((BufWriter::new(file), offset))
}

fn encode(entry: &LedgerEntry) -> LedgerResult<Vec<u8>> {
    bincode::serialize(entry).map_err(|e| LedgerError::Serialization(e.to_string()))
}

fn write_record(out: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    let length = payload.len() as u32;
    let crc = crc32fast::hash(payload);
    out.write_all(&length.to_le_bytes())?;
    out.write_all(&crc.to_le_bytes())?;
    out.write_all(payload)
}

fn read_records(path: &Path) -> LedgerResult<Recovery> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut recovery = Recovery::default();
    let mut offset: u64 = 0;

    while offset < file_len {
        if offset + HEADER_SIZE as u64 > file_len {
            recovery.torn_bytes = file_len - offset;
            warn!(offset, "torn journal header; stopping recovery");
            break;
        }
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header)?;
        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let end = offset + HEADER_SIZE as u64 + u64::from(length);
        if length == 0 || length > MAX_RECORD_SIZE || end > file_len {
            recovery.torn_bytes = file_len - offset;
            warn!(offset, length, file_len, "invalid journal record; stopping recovery");
            break;
        }

        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload)?;
        offset = end;

        let actual_crc = crc32fast::hash(&payload);
        if actual_crc != expected_crc {
            warn!(offset, expected = expected_crc, actual = actual_crc, "CRC mismatch; skipping record");
            recovery.skipped += 1;
            continue;
        }
        match bincode::deserialize::<LedgerEntry>(&payload) {
            Ok(entry) => recovery.entries.push(entry),
            Err(e) => {
                warn!(offset, error = %e, "undecodable journal record; skipping");
                recovery.skipped += 1;
            }
        }
    }

    debug!(
        recovered = recovery.entries.len(),
        skipped = recovery.skipped,
        "journal recovery complete"
    );
    Ok(recovery)
}
