use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Bytes of framing around each payload: u32 length prefix + u32 crc.
const FRAME_OVERHEAD: u64 = 8;

/// Longest payload replay will accept. A larger length prefix is garbage.
const MAX_RECORD_LEN: usize = 16 << 20;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Result of scanning a WAL file.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte length of the intact prefix. Anything after it is a torn or corrupt tail.
    pub valid_len: u64,
}

/// Append-only Write-Ahead Log of inventory events.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn last entry (crash mid-write) is discarded on replay and cut off
///   on open, so new appends never land behind garbage.
/// - Buffered entries reach the file only as a whole batch. A batch that
///   fails to write or sync is cut back off the file.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// Encoded entries not yet written.
    pending: Vec<u8>,
    pending_appends: u64,
    /// File length after the last successful `flush_sync`.
    durable_len: u64,
    /// Set when a failed batch could not be cut off. No further writes.
    broken: bool,
    appends_since_compact: u64,
}

impl Wal {
    /// Replay the WAL at `path`, truncate any corrupt tail, and open it for appending.
    pub fn open_and_replay(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let replay = Self::replay(path)?;
        if let Ok(meta) = fs::metadata(path)
            && meta.len() > replay.valid_len
        {
            warn!(
                "wal {}: discarding {} corrupt trailing bytes",
                path.display(),
                meta.len() - replay.valid_len
            );
            OpenOptions::new().write(true).open(path)?.set_len(replay.valid_len)?;
        }
        let wal = Self::open(path)?;
        Ok((wal, replay.events))
    }

    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            pending: Vec::new(),
            pending_appends: 0,
            durable_len,
            broken: false,
            appends_since_compact: 0,
        })
    }

    /// Append a single event and fsync. Tests only; the engine goes through
    /// `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer a single event without writing or syncing.
    /// Call `flush_sync()` after the batch to durably commit all buffered events.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.broken {
            return Err(io::Error::other("wal is unusable after a failed rollback"));
        }
        encode_event(&mut self.pending, event)?;
        self.pending_appends += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Drop every buffered event. The file is untouched.
    pub fn discard_pending(&mut self) {
        self.pending.clear();
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.pending_appends);
        self.pending_appends = 0;
    }

    /// Write the buffered batch and fsync. On failure the file is cut back to
    /// its length before the batch, so none of the batch survives a restart.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return self.file.sync_all();
        }
        let written = self.file.write_all(&self.pending).and_then(|()| self.file.sync_all());
        match written {
            Ok(()) => {
                self.durable_len += self.pending.len() as u64;
                self.pending.clear();
                self.pending_appends = 0;
                Ok(())
            }
            Err(e) => {
                self.discard_pending();
                if let Err(cut) = self.file.set_len(self.durable_len).and_then(|()| self.file.sync_all()) {
                    warn!("wal {}: could not cut off failed batch: {cut}", self.path.display());
                    self.broken = true;
                }
                Err(e)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted events to a temp file and fsync.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename the temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.file = file;
        self.pending.clear();
        self.pending_appends = 0;
        self.broken = false;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Both compaction phases in one call. Tests only.
    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Scan the WAL from disk, returning all intact events.
    /// Scanning stops at the first truncated or corrupt entry.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_RECORD_LEN {
                break;
            }

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // torn
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // torn
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => replay.events.push(event),
                Err(_) => break,
            }
            replay.valid_len += len as u64 + FRAME_OVERHEAD;
        }

        Ok(replay)
    }
}
