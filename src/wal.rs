use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Bytes of framing around each payload: u32 length prefix + u32 crc32 suffix.
const FRAME_OVERHEAD: u64 = 8;

/// Encode a single event to [len][bincode][crc32] format. Returns the frame size.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large for WAL frame"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(u64::from(len) + FRAME_OVERHEAD)
}

/// Read the next frame. `Ok(None)` means a clean end, a torn frame, or a corrupt frame;
/// in all three cases nothing past this point is trusted. `remaining` is the number of
/// unread bytes in the file and caps the payload allocation.
fn decode_frame(reader: &mut impl Read, remaining: u64) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len as u64 + FRAME_OVERHEAD > remaining {
        return Ok(None);
    }

    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Some((event, len as u64 + FRAME_OVERHEAD))),
        Err(_) => Ok(None),
    }
}

/// `read_exact` that reports EOF as `false` instead of an error.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Result of scanning a WAL file from the start.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte offset just past the last valid frame.
    pub valid_len: u64,
    /// Bytes after `valid_len` that were discarded as torn or corrupt.
    pub discarded: u64,
}

/// Append-only Write-Ahead Log of reservation events.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn or corrupt tail is cut off by [`Wal::recover`] before new appends land,
///   so entries written after a crash stay reachable on the next replay.
/// - A batch that fails to become durable is cut off by [`Wal::rollback`], so the
///   file only ever holds events whose callers were told they committed.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length covered by the last successful `flush_sync`.
    durable_len: u64,
    pending_bytes: u64,
    pending_events: u64,
    /// Set when a rollback could not restore `durable_len`. No appends after that.
    failed: bool,
}

impl Wal {
    /// Replay the log at `path`, truncate any bad tail, and open it for appending.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let replay = Self::replay(path)?;
        if replay.discarded > 0 {
            warn!(
                "WAL {}: discarding {} trailing bytes after offset {}",
                path.display(),
                replay.discarded,
                replay.valid_len
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }
        let wal = Self::open(path)?;
        Ok((wal, replay.events))
    }

    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            durable_len,
            pending_bytes: 0,
            pending_events: 0,
            failed: false,
        })
    }

    /// Append and fsync one event. Production code batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event without flushing. Not durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.failed {
            return Err(io::Error::other(
                "WAL is in a failed state after an unrecoverable write error",
            ));
        }
        // Counted before encoding: a partial frame may already sit in the buffer.
        self.pending_events += 1;
        self.appends_since_compact += 1;
        self.pending_bytes += encode_event(&mut self.writer, event)?;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.durable_len += self.pending_bytes;
        self.pending_bytes = 0;
        self.pending_events = 0;
        Ok(())
    }

    /// Throw away everything appended since the last successful `flush_sync`:
    /// bytes still buffered are dropped unwritten and bytes already on disk are
    /// truncated. If that fails the WAL refuses further appends.
    pub fn rollback(&mut self) -> io::Result<()> {
        let result = self.discard_pending();
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn discard_pending(&mut self) -> io::Result<()> {
        let fresh = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(fresh));
        // `into_parts` hands back the buffer instead of flushing it on drop.
        let (_file, _unwritten) = stale.into_parts();

        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(self.durable_len)?;
        file.sync_all()?;

        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.pending_events);
        self.pending_bytes = 0;
        self.pending_events = 0;
        Ok(())
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write a compacted event set to a temp file next to `path` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let file = File::create(Self::compact_tmp_path(path))?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the log and reopen for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.pending_bytes = 0;
        self.pending_events = 0;
        Ok(())
    }

    /// Both compaction phases in one call.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Scan the log from disk. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let total = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();

        while let Some((event, frame_len)) = decode_frame(&mut reader, total - replay.valid_len)? {
            replay.events.push(event);
            replay.valid_len += frame_len;
        }
        replay.discarded = total.saturating_sub(replay.valid_len);
        Ok(replay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    use crate::model::{BookingStatus, DateRange};

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("vacancy_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn property(name: &str) -> Event {
        Event::PropertyCreated {
            id: Ulid::new(),
            name: name.into(),
            kind: "house".into(),
        }
    }

    fn booking(property_id: Ulid) -> Event {
        let start = NaiveDate::from_ymd_opt(2027, 1, 10).unwrap();
        let end = NaiveDate::from_ymd_opt(2027, 1, 14).unwrap();
        Event::BookingCreated {
            id: Ulid::new(),
            property_id,
            guest_id: Ulid::new(),
            range: DateRange::new(start, end),
            status: BookingStatus::Active,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let pid = Ulid::new();
        let events = vec![property("Lake House"), booking(pid)];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, events);
        assert_eq!(replay.discarded, 0);
        assert_eq!(replay.valid_len, fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert_eq!(replay.valid_len, 0);
    }

    #[test]
    fn replay_stops_at_torn_tail() {
        let path = tmp_path("torn.wal");
        let event = property("Cabin");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8; 6]).unwrap(); // partial length + some bytes
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![event]);
        assert_eq!(replay.discarded, 6);
    }

    #[test]
    fn replay_rejects_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let event = Event::GuestDeleted { id: Ulid::new() };
        {
            let payload = bincode::serialize(&event).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert!(replay.discarded > 0);
    }

    #[test]
    fn recover_truncates_tail_so_new_appends_survive() {
        let path = tmp_path("recover_truncate.wal");
        let first = property("A");
        let second = property("B");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0xFFu8; 11]).unwrap();
        }

        {
            let (mut wal, events) = Wal::recover(&path).unwrap();
            assert_eq!(events, vec![first.clone()]);
            wal.append(&second).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![first, second]);
        assert_eq!(replay.discarded, 0);
    }

    #[test]
    fn compact_reduces_wal() {
        let path = tmp_path("compact_reduce.wal");
        let pid = Ulid::new();
        let created = Event::PropertyCreated {
            id: pid,
            name: "Loft".into(),
            kind: "apartment".into(),
        };

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&created).unwrap();
            for _ in 0..10 {
                let bk = booking(pid);
                let id = match &bk {
                    Event::BookingCreated { id, .. } => *id,
                    other => panic!("unexpected event {other:?}"),
                };
                wal.append(&bk).unwrap();
                wal.append(&Event::BookingDeleted { id, property_id: pid }).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 21);
        }
        let before = fs::metadata(&path).unwrap().len();

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(std::slice::from_ref(&created)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap().events, vec![created]);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let created = property("Barn");
        let pid = created.property_id().unwrap();
        let next = booking(pid);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&created).unwrap();
            wal.compact(std::slice::from_ref(&created)).unwrap();
            wal.append(&next).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap().events, vec![created, next]);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let events: Vec<Event> = (0..5).map(|i| property(&format!("P{i}"))).collect();

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap().events, events);
    }

    #[test]
    fn rollback_discards_buffered_batch() {
        let path = tmp_path("rollback_buffered.wal");
        let kept = property("Kept");
        let dropped = property("Dropped");
        let next = property("Next");

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&kept).unwrap();
            wal.append_buffered(&dropped).unwrap();
            wal.rollback().unwrap();
            assert_eq!(wal.appends_since_compact(), 1);
            wal.append(&next).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap().events, vec![kept, next]);
    }

    #[test]
    fn rollback_truncates_bytes_already_on_disk() {
        let path = tmp_path("rollback_on_disk.wal");
        let kept = property("Kept");
        // Larger than the BufWriter capacity, so it goes straight to the file.
        let oversized = Event::PropertyCreated {
            id: Ulid::new(),
            name: "x".repeat(64 * 1024),
            kind: "house".into(),
        };

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();
        let durable = fs::metadata(&path).unwrap().len();
        wal.append_buffered(&oversized).unwrap();
        assert!(fs::metadata(&path).unwrap().len() > durable);

        wal.rollback().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), durable);
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap().events, vec![kept]);
    }

    #[test]
    fn failed_rollback_refuses_appends() {
        let path = tmp_path("rollback_failed.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.append_buffered(&property("Lost")).unwrap();
        fs::remove_file(&path).unwrap();

        assert!(wal.rollback().is_err());
        assert!(wal.is_failed());
        assert!(wal.append_buffered(&property("Refused")).is_err());
    }

    #[test]
    fn oversized_length_prefix_is_torn_tail() {
        let path = tmp_path("oversized_prefix.wal");
        let event = property("Cabin");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[0u8; 10]).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![event]);
        assert_eq!(replay.discarded, 14);
    }
}
