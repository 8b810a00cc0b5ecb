use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

const LEN_BYTES: usize = 4;
const CRC_BYTES: usize = 4;

fn encode(event: &Event) -> io::Result<Vec<u8>> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large for WAL record"))?;

    let mut record = Vec::with_capacity(LEN_BYTES + payload.len() + CRC_BYTES);
    record.extend_from_slice(&len.to_le_bytes());
    record.extend_from_slice(&payload);
    record.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(record)
}

/// Why reading stopped before the end of the log.
#[derive(Debug, PartialEq, Eq)]
enum Stop {
    End,
    Torn,
    BadChecksum,
    Undecodable(String),
}

/// Fill `buf`, or report how far short the file fell.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<Option<usize>> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(Some(filled)),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

/// Next record of a log: `[u32 len][bincode payload][u32 crc32]`, little endian.
fn next_event(reader: &mut impl Read) -> io::Result<Result<Event, Stop>> {
    let mut word = [0u8; LEN_BYTES];
    match fill(reader, &mut word)? {
        Some(0) => return Ok(Err(Stop::End)),
        Some(_) => return Ok(Err(Stop::Torn)),
        None => {}
    }
    let mut payload = vec![0u8; u32::from_le_bytes(word) as usize];
    if fill(reader, &mut payload)?.is_some() {
        return Ok(Err(Stop::Torn));
    }
    let mut crc = [0u8; CRC_BYTES];
    if fill(reader, &mut crc)?.is_some() {
        return Ok(Err(Stop::Torn));
    }
    if u32::from_le_bytes(crc) != crc32fast::hash(&payload) {
        return Ok(Err(Stop::BadChecksum));
    }
    Ok(bincode::deserialize(&payload).map_err(|e| Stop::Undecodable(e.to_string())))
}

/// Append-only event log backing the durable store.
///
/// Records are staged into a buffer and made durable together by `sync`.
/// A batch that fails to stage or sync is cut back off the file with
/// `rollback`, so the log only ever holds acknowledged records. On replay,
/// a torn final record (crash mid-write) or one failing its checksum ends
/// the log; everything before it is kept.
pub struct Wal {
    out: BufWriter<File>,
    path: PathBuf,
    since_snapshot: u64,
    /// File length after the last successful sync.
    durable_len: u64,
    staged_bytes: u64,
    staged_records: u64,
    /// Set when a rollback could not restore `durable_len`.
    poisoned: bool,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = Self::open_append(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            out: BufWriter::new(file),
            path: path.to_path_buf(),
            since_snapshot: 0,
            durable_len,
            staged_bytes: 0,
            staged_records: 0,
            poisoned: false,
        })
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn snapshot_path(path: &Path) -> PathBuf {
        path.with_extension("wal.snapshot")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Buffer one record. Not durable until the next `sync`.
    pub fn stage(&mut self, event: &Event) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL is unusable after a failed rollback"));
        }
        let record = encode(event)?;
        self.out.write_all(&record)?;
        self.staged_bytes += record.len() as u64;
        self.staged_records += 1;
        self.since_snapshot += 1;
        Ok(())
    }

    pub fn sync(&mut self) -> io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        self.durable_len += self.staged_bytes;
        self.staged_bytes = 0;
        self.staged_records = 0;
        Ok(())
    }

    /// Drop everything staged since the last successful `sync`, including
    /// bytes that already reached the file. On failure the log refuses
    /// further records.
    pub fn rollback(&mut self) -> io::Result<()> {
        let result = self.truncate_to_durable();
        self.since_snapshot = self.since_snapshot.saturating_sub(self.staged_records);
        self.staged_bytes = 0;
        self.staged_records = 0;
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn truncate_to_durable(&mut self) -> io::Result<()> {
        let fresh = BufWriter::new(Self::open_append(&self.path)?);
        // into_parts hands back the unflushed buffer instead of writing it
        let (_, _unwritten) = std::mem::replace(&mut self.out, fresh).into_parts();
        let file = self.out.get_ref();
        file.set_len(self.durable_len)?;
        file.sync_all()
    }

    /// Records appended since the log was last replaced by a snapshot.
    pub fn records_since_snapshot(&self) -> u64 {
        self.since_snapshot
    }

    /// Write `events` to a sibling file and fsync it. The live log is not touched.
    pub fn write_snapshot(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(Self::snapshot_path(path))?);
        for event in events {
            out.write_all(&encode(event)?)?;
        }
        out.flush()?;
        out.get_ref().sync_all()
    }

    /// Atomically replace the live log with the last written snapshot.
    pub fn install_snapshot(&mut self) -> io::Result<()> {
        self.sync()?;
        fs::rename(Self::snapshot_path(&self.path), &self.path)?;
        let file = Self::open_append(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.out = BufWriter::new(file);
        self.since_snapshot = 0;
        Ok(())
    }

    /// Every intact event, oldest first. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let stop = loop {
            match next_event(&mut reader)? {
                Ok(event) => events.push(event),
                Err(stop) => break stop,
            }
        };
        match stop {
            Stop::End => {}
            Stop::Torn => warn!("{}: discarding torn record at end of log", path.display()),
            Stop::BadChecksum => {
                warn!("{}: checksum mismatch after {} records", path.display(), events.len())
            }
            Stop::Undecodable(e) => {
                warn!("{}: undecodable record after {} records: {e}", path.display(), events.len())
            }
        }
        Ok(events)
    }
}
