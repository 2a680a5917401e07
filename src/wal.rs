use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use crate::model::Event;

/// File magic + format version, written once at the start of every log.
const MAGIC: &[u8; 6] = b"SLWAL\x01";

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Result of reading a log from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte offset just past the last intact record.
    pub valid_len: u64,
    /// Bytes after `valid_len` that did not form an intact record.
    pub discarded: u64,
}

/// Append-only write-ahead log of ledger events.
///
/// Layout: `MAGIC` followed by records `[u32: len][bincode: Event][u32: crc32]`.
/// A torn or corrupt tail is cut off when the log is opened, so new records
/// never land behind unreadable bytes.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// End of the last durable record. A failed write is cut back to here.
    len: u64,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the log at `path`, returning it with its replayed events.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let replay = Self::replay(path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        if replay.discarded > 0 {
            warn!(
                path = %path.display(),
                discarded = replay.discarded,
                "truncating torn WAL tail"
            );
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }

        let len = if replay.valid_len == 0 {
            file.set_len(0)?;
            file.write_all(MAGIC)?;
            file.sync_all()?;
            MAGIC.len() as u64
        } else {
            file.seek(SeekFrom::Start(replay.valid_len))?;
            replay.valid_len
        };

        Ok((
            Self {
                file,
                path: path.to_path_buf(),
                len,
                appends_since_compact: 0,
            },
            replay.events,
        ))
    }

    /// Append and fsync a single event. Production code goes through
    /// `append_batch`.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_batch([event]).map(|_| ())
    }

    /// Write `events` as one contiguous run and fsync once.
    ///
    /// All or nothing: the batch is encoded in memory first, and if the
    /// write or the sync fails the file is cut back to its previous length.
    /// Returns the number of events written.
    pub fn append_batch<'a>(
        &mut self,
        events: impl IntoIterator<Item = &'a Event>,
    ) -> io::Result<usize> {
        let mut buf = Vec::new();
        let mut count = 0;
        for event in events {
            encode_event(&mut buf, event)?;
            count += 1;
        }
        let written = self
            .file
            .write_all(&buf)
            .and_then(|()| self.file.sync_data());
        if let Err(e) = written {
            if let Err(cut) = self.rewind() {
                error!("could not cut WAL back to {} bytes: {cut}", self.len);
            }
            return Err(e);
        }
        self.len += buf.len() as u64;
        self.appends_since_compact += count as u64;
        Ok(count)
    }

    /// Drop anything past the last durable record.
    fn rewind(&mut self) -> io::Result<()> {
        self.file.set_len(self.len)?;
        self.file.seek(SeekFrom::Start(self.len))?;
        self.file.sync_data()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.compact")
    }

    /// Write a self-contained log holding only `events` next to `path`.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let file = File::create(Self::compact_tmp_path(path))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the live log and continue appending to it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.len = file.seek(SeekFrom::End(0))?;
        self.file = file;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Read every intact record. Stops at the first truncated or corrupt one.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let total_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; MAGIC.len()];
        match reader.read_exact(&mut magic) {
            Ok(()) if &magic == MAGIC => {}
            Ok(()) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "not a ledger WAL (bad magic)",
                ));
            }
            // Shorter than the header: a crash during creation.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(Replay {
                    events: Vec::new(),
                    valid_len: 0,
                    discarded: total_len,
                });
            }
            Err(e) => return Err(e),
        }

        let mut events = Vec::new();
        let mut offset = MAGIC.len() as u64;

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as u64;
            if offset + 8 + len > total_len {
                break; // truncated payload or CRC
            }

            let mut payload = vec![0u8; len as usize];
            reader.read_exact(&mut payload)?;
            let mut crc_buf = [0u8; 4];
            reader.read_exact(&mut crc_buf)?;

            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
            offset += 8 + len;
        }

        Ok(Replay {
            events,
            valid_len: offset,
            discarded: total_len - offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::{date, reservation, usd};
    use crate::model::{Channel, EntryKey, EntrySpec};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("stayledger_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn opened(key: EntryKey) -> Event {
        Event::EntryOpened {
            key,
            spec: EntrySpec::new(3, usd(10_000)),
        }
    }

    fn key() -> EntryKey {
        EntryKey::new(Ulid::new(), Ulid::new(), date("2025-11-15"))
    }

    #[test]
    fn append_and_reopen() {
        let path = tmp_path("append_and_reopen.wal");
        let k = key();
        let events = vec![
            opened(k),
            Event::Reserved {
                key: k,
                reservation: reservation(Channel::Airbnb),
            },
        ];

        {
            let (mut wal, replayed) = Wal::open(&path).unwrap();
            assert!(replayed.is_empty());
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        let (_, replayed) = Wal::open(&path).unwrap();
        assert_eq!(replayed, events);
    }

    #[test]
    fn new_log_starts_with_magic() {
        let path = tmp_path("magic.wal");
        let _ = Wal::open(&path).unwrap();
        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[..], MAGIC);
    }

    #[test]
    fn foreign_file_rejected() {
        let path = tmp_path("foreign.wal");
        fs::write(&path, b"PGDMP-not-ours").unwrap();
        let err = Wal::replay(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn torn_tail_is_truncated_and_appends_survive() {
        let path = tmp_path("torn_tail.wal");
        let k = key();
        let first = opened(k);
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        // Half-written record from a crash.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[42u8, 0, 0, 0, 1, 2, 3]).unwrap();
        }
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![first.clone()]);
        assert_eq!(replay.discarded, 7);

        let second = Event::Released {
            key: k,
            reservation_id: Ulid::new(),
        };
        {
            let (mut wal, replayed) = Wal::open(&path).unwrap();
            assert_eq!(replayed, vec![first.clone()]);
            wal.append(&second).unwrap();
        }
        let (_, replayed) = Wal::open(&path).unwrap();
        assert_eq!(replayed, vec![first, second]);
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let event = Event::EntryPruned { key: key() };
        {
            let payload = bincode::serialize(&event).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(MAGIC).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert_eq!(replay.valid_len, MAGIC.len() as u64);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert_eq!(replay.discarded, 0);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_then_append.wal");
        let k = key();
        let snapshot = vec![opened(k)];
        let after = Event::BlockedSet { key: k, blocked_units: 1 };
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append(&snapshot[0]).unwrap();
            for _ in 0..20 {
                let r = reservation(Channel::Direct);
                let id = r.reservation_id;
                wal.append(&Event::Reserved { key: k, reservation: r }).unwrap();
                wal.append(&Event::Released { key: k, reservation_id: id }).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(&snapshot).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            assert!(fs::metadata(&path).unwrap().len() < before);
            wal.append(&after).unwrap();
        }
        let (_, replayed) = Wal::open(&path).unwrap();
        assert_eq!(replayed, vec![snapshot[0].clone(), after]);
    }

    #[test]
    fn batch_appends_count_every_event() {
        let path = tmp_path("batch.wal");
        let events: Vec<Event> = (0..5).map(|_| opened(key())).collect();
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            assert_eq!(wal.append_batch(&events).unwrap(), 5);
            assert_eq!(wal.appends_since_compact(), 5);
        }
        assert_eq!(Wal::replay(&path).unwrap().events, events);
    }

    #[test]
    fn failed_write_is_cut_back_before_next_batch() {
        let path = tmp_path("cut_back.wal");
        let first: Vec<Event> = (0..3).map(|_| opened(key())).collect();
        let second: Vec<Event> = (0..2).map(|_| opened(key())).collect();
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append_batch(&first).unwrap();
            // What a write that died half way leaves behind.
            wal.file.write_all(&[200u8, 0, 0, 0, 9, 9]).unwrap();
            wal.rewind().unwrap();
            assert_eq!(fs::metadata(&path).unwrap().len(), wal.len);
            wal.append_batch(&second).unwrap();
        }
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.discarded, 0);
        assert_eq!(replay.events, [first, second].concat());
    }

    #[test]
    fn appends_after_compaction_extend_the_new_log() {
        let path = tmp_path("len_after_compact.wal");
        let k = key();
        let (mut wal, _) = Wal::open(&path).unwrap();
        wal.append(&opened(k)).unwrap();
        wal.compact(&[opened(k)]).unwrap();
        assert_eq!(wal.len, fs::metadata(&path).unwrap().len());
        wal.append(&Event::EntryPruned { key: k }).unwrap();
        assert_eq!(wal.len, fs::metadata(&path).unwrap().len());
    }
}
