//! Segmented on-disk journal
//!
//! Entries live in segment files named after their first sequence id
//! (`00000000000000000001.seg`). Only the newest segment is written; it
//! rolls once it grows past `segment_size_bytes`. Truncation deletes whole
//! segments, so it never rewrites live data.
//!
//! On open every segment is scanned. A record cut short by a crash at the
//! tail of the newest segment is trimmed; it was never acknowledged. A
//! damaged record with intact records behind it is not a tail and fails the
//! open. Complete records with a bad checksum are kept in place and
//! reported as a consistency violation when read.
//!
//! The fencing epoch is stored in a small `FENCE` file, replaced atomically.

use super::record::{
    MIN_RECORD_SIZE, RecordError, SEGMENT_HEADER_SIZE, SegmentHeader, decode_record,
    encode_batch, encoded_len, read_record,
};
use super::{JournalEntry, JournalStore, check_contiguous, check_payload_limit};
use crate::metric_definitions::{
    JOURNAL_APPEND_FAILURES, JOURNAL_APPENDED_BYTES, JOURNAL_APPENDED_ENTRIES,
    JOURNAL_FIRST_SEQUENCE, JOURNAL_LAST_SEQUENCE,
};
use meridian_common::checksum::{compute_crc32c, verify_crc32c};
use meridian_common::config::JournalConfig;
use meridian_common::{ConsistencyKind, Epoch, Error, Result, SequenceId};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

const SEGMENT_EXTENSION: &str = "seg";
const FENCE_FILE: &str = "FENCE";
const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Clone, Debug)]
struct Segment {
    first_sequence: SequenceId,
    path: PathBuf,
}

struct Inner {
    /// Sorted by first sequence; the last one is being written
    segments: Vec<Segment>,
    writer: BufWriter<File>,
    active_size: u64,
    /// Set after a failed write; the file tail is unknown until reopened
    failed: Option<String>,
}

/// Journal stored in segment files under one directory
pub struct FileJournal {
    dir: PathBuf,
    config: JournalConfig,
    inner: Mutex<Inner>,
    first_sequence: AtomicU64,
    last_sequence: AtomicU64,
    fence: AtomicU64,
}

impl FileJournal {
    /// Open the journal in `dir`, creating it if needed
    pub fn open(dir: impl AsRef<Path>, config: JournalConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let fence = read_fence(&dir)?;
        let mut segments = list_segments(&dir)?;
        if segments.is_empty() {
            let path = create_segment(&dir, 1)?;
            segments.push(Segment {
                first_sequence: 1,
                path,
            });
        }

        let mut last = segments[0].first_sequence - 1;
        let count = segments.len();
        let mut active_size = SEGMENT_HEADER_SIZE as u64;
        for (i, segment) in segments.iter().enumerate() {
            if i > 0 && segment.first_sequence != last + 1 {
                return Err(Error::consistency(
                    segment.first_sequence,
                    ConsistencyKind::SequenceGap {
                        expected: last + 1,
                        found: segment.first_sequence,
                    },
                ));
            }
            let scan = scan_segment(segment)?;
            if let Some(reason) = scan.torn {
                if i + 1 < count {
                    return Err(Error::consistency(
                        scan.last_sequence + 1,
                        ConsistencyKind::Malformed(format!(
                            "{} in sealed segment {}",
                            reason,
                            segment.path.display()
                        )),
                    ));
                }
                warn!(
                    "Trimming torn journal tail in {} at offset {} ({})",
                    segment.path.display(),
                    scan.valid_len,
                    reason
                );
                let file = OpenOptions::new().write(true).open(&segment.path)?;
                file.set_len(scan.valid_len)?;
                file.sync_all()?;
            }
            last = scan.last_sequence;
            active_size = scan.valid_len;
        }

        let active = segments
            .last()
            .ok_or_else(|| Error::internal("journal has no segments"))?;
        let file = OpenOptions::new().append(true).open(&active.path)?;
        let writer = BufWriter::with_capacity(config.write_buffer_size, file);
        let first = segments[0].first_sequence;

        info!(
            "Opened journal at {:?}: sequences {}..={}, {} segment(s), fence {}",
            dir, first, last, count, fence
        );

        Ok(Self {
            dir,
            config,
            inner: Mutex::new(Inner {
                segments,
                writer,
                active_size,
                failed: None,
            }),
            first_sequence: AtomicU64::new(first),
            last_sequence: AtomicU64::new(last),
            fence: AtomicU64::new(fence),
        })
    }

    /// Journal directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of segment files
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.inner.lock().segments.len()
    }

    fn roll(&self, inner: &mut Inner, first_sequence: SequenceId) -> io::Result<()> {
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()?;

        let path = create_segment(&self.dir, first_sequence).map_err(io::Error::other)?;
        let file = OpenOptions::new().append(true).open(&path)?;
        debug!("Rolled journal to segment {}", path.display());

        inner.writer = BufWriter::with_capacity(self.config.write_buffer_size, file);
        inner.active_size = SEGMENT_HEADER_SIZE as u64;
        inner.segments.push(Segment {
            first_sequence,
            path,
        });
        Ok(())
    }

    fn write_batch(&self, inner: &mut Inner, buf: &[u8]) -> io::Result<()> {
        inner.writer.write_all(buf)?;
        inner.writer.flush()?;
        if self.config.sync_on_append {
            inner.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    fn raise_fence(&self, epoch: Epoch) -> Result<()> {
        write_fence(&self.dir, epoch)
            .map_err(|e| Error::durability(self.last_sequence() + 1, e))?;
        self.fence.store(epoch, Ordering::SeqCst);
        info!("Journal fence raised to epoch {}", epoch);
        Ok(())
    }
}

impl JournalStore for FileJournal {
    fn append(&self, epoch: Epoch, entries: &[JournalEntry]) -> Result<()> {
        let mut inner = self.inner.lock();

        let fence = self.fence();
        if epoch < fence {
            return Err(Error::Fenced { epoch, fence });
        }
        if let Some(reason) = &inner.failed {
            return Err(Error::durability(
                self.last_sequence() + 1,
                format!("journal unusable after earlier failure: {reason}"),
            ));
        }
        check_payload_limit(entries)?;
        check_contiguous(self.last_sequence(), entries)?;
        if epoch > fence {
            self.raise_fence(epoch)?;
        }
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Ok(());
        };
        let (first, last) = (first.sequence_id, last.sequence_id);

        let buf = encode_batch(entries);
        let result = if inner.active_size > SEGMENT_HEADER_SIZE as u64
            && inner.active_size + buf.len() as u64 > self.config.segment_size_bytes
        {
            self.roll(&mut inner, first)
        } else {
            Ok(())
        }
        .and_then(|()| self.write_batch(&mut inner, &buf));

        if let Err(e) = result {
            error!("Journal append of {}..={} failed: {}", first, last, e);
            counter!(JOURNAL_APPEND_FAILURES).increment(1);
            inner.failed = Some(e.to_string());
            return Err(Error::durability(first, e));
        }

        inner.active_size += buf.len() as u64;
        self.last_sequence.store(last, Ordering::SeqCst);

        counter!(JOURNAL_APPENDED_ENTRIES).increment(entries.len() as u64);
        counter!(JOURNAL_APPENDED_BYTES).increment(buf.len() as u64);
        #[allow(clippy::cast_precision_loss)]
        gauge!(JOURNAL_LAST_SEQUENCE).set(last as f64);
        Ok(())
    }

    fn scan(
        &self,
        from: SequenceId,
        to: SequenceId,
        visit: &mut dyn FnMut(JournalEntry) -> Result<()>,
    ) -> Result<()> {
        let segments = self.inner.lock().segments.clone();
        let first = self.first_sequence();
        let to = to.min(self.last_sequence());

        if from < first {
            return Err(Error::JournalTruncated {
                first_available: first,
            });
        }
        if from > to {
            return Ok(());
        }

        let start = segments
            .partition_point(|s| s.first_sequence <= from)
            .saturating_sub(1);
        let mut expected = segments[start].first_sequence;
        let mut buf = Vec::new();

        for segment in &segments[start..] {
            if segment.first_sequence > to {
                break;
            }
            if segment.first_sequence != expected {
                return Err(Error::consistency(
                    segment.first_sequence,
                    ConsistencyKind::SequenceGap {
                        expected,
                        found: segment.first_sequence,
                    },
                ));
            }

            let file = match File::open(&segment.path) {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(Error::JournalTruncated {
                        first_available: self.first_sequence(),
                    });
                }
                Err(e) => return Err(e.into()),
            };
            let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);
            read_segment_header(&mut reader, segment)?;

            while expected <= to {
                let Some(record) = read_record(&mut reader, &mut buf, from)? else {
                    break;
                };
                let entry = record.map_err(|e| e.into_error(expected))?;
                if entry.sequence_id != expected {
                    return Err(Error::consistency(
                        expected,
                        ConsistencyKind::SequenceGap {
                            expected,
                            found: entry.sequence_id,
                        },
                    ));
                }
                if expected >= from {
                    visit(entry)?;
                }
                expected += 1;
            }
            if expected > to {
                return Ok(());
            }
        }

        if expected <= to {
            return Err(Error::consistency(
                expected,
                ConsistencyKind::Malformed(format!("journal ends before sequence {to}")),
            ));
        }
        Ok(())
    }

    fn truncate_before(&self, sequence: SequenceId) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut removed = 0;
        while inner.segments.len() > 1 && inner.segments[1].first_sequence <= sequence {
            let segment = inner.segments.remove(0);
            match fs::remove_file(&segment.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    inner.segments.insert(0, segment);
                    return Err(e.into());
                }
            }
            removed += 1;
        }

        let first = inner.segments[0].first_sequence;
        self.first_sequence.store(first, Ordering::SeqCst);
        if removed > 0 {
            sync_dir(&self.dir);
            info!(
                "Truncated journal before {}: removed {} segment(s), first sequence now {}",
                sequence, removed, first
            );
            #[allow(clippy::cast_precision_loss)]
            gauge!(JOURNAL_FIRST_SEQUENCE).set(first as f64);
        }
        Ok(())
    }

    fn reset_to(&self, sequence: SequenceId) -> Result<()> {
        let mut inner = self.inner.lock();

        let _ = inner.writer.flush();
        for segment in inner.segments.drain(..) {
            match fs::remove_file(&segment.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let first = sequence + 1;
        let path = create_segment(&self.dir, first)?;
        let file = OpenOptions::new().append(true).open(&path)?;
        inner.writer = BufWriter::with_capacity(self.config.write_buffer_size, file);
        inner.active_size = SEGMENT_HEADER_SIZE as u64;
        inner.failed = None;
        inner.segments = vec![Segment {
            first_sequence: first,
            path,
        }];
        self.first_sequence.store(first, Ordering::SeqCst);
        self.last_sequence.store(sequence, Ordering::SeqCst);

        warn!("Journal reset: history discarded, continuing after {}", sequence);
        Ok(())
    }

    fn first_sequence(&self) -> SequenceId {
        self.first_sequence.load(Ordering::SeqCst)
    }

    fn last_sequence(&self) -> SequenceId {
        self.last_sequence.load(Ordering::SeqCst)
    }

    fn fence(&self) -> Epoch {
        self.fence.load(Ordering::SeqCst)
    }

    fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()?;
        Ok(())
    }
}

fn segment_path(dir: &Path, first_sequence: SequenceId) -> PathBuf {
    dir.join(format!("{first_sequence:020}.{SEGMENT_EXTENSION}"))
}

fn list_segments(dir: &Path) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    for dirent in fs::read_dir(dir)? {
        let path = dirent?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXTENSION) {
            continue;
        }
        let Some(first_sequence) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<SequenceId>().ok())
        else {
            warn!("Ignoring unrecognized file {} in journal", path.display());
            continue;
        };
        segments.push(Segment {
            first_sequence,
            path,
        });
    }
    segments.sort_by_key(|s| s.first_sequence);
    Ok(segments)
}

fn create_segment(dir: &Path, first_sequence: SequenceId) -> Result<PathBuf> {
    let path = segment_path(dir, first_sequence);
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)?;
    file.write_all(&SegmentHeader::new(first_sequence).to_bytes())?;
    file.sync_all()?;
    sync_dir(dir);
    Ok(path)
}

fn read_segment_header<R: Read>(reader: &mut R, segment: &Segment) -> Result<()> {
    let mut bytes = [0u8; SEGMENT_HEADER_SIZE];
    reader.read_exact(&mut bytes).map_err(|e| {
        Error::consistency(
            segment.first_sequence,
            ConsistencyKind::Malformed(format!(
                "unreadable header in {}: {e}",
                segment.path.display()
            )),
        )
    })?;
    let header = SegmentHeader::from_bytes(&bytes)?;
    if header.first_sequence != segment.first_sequence {
        return Err(Error::consistency(
            segment.first_sequence,
            ConsistencyKind::Malformed(format!(
                "segment {} starts at {}",
                segment.path.display(),
                header.first_sequence
            )),
        ));
    }
    Ok(())
}

struct SegmentScan {
    last_sequence: SequenceId,
    valid_len: u64,
    torn: Option<String>,
}

/// Walk a segment to find its last record and the end of its valid data
fn scan_segment(segment: &Segment) -> Result<SegmentScan> {
    let file = File::open(&segment.path)?;
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);
    read_segment_header(&mut reader, segment)?;

    let mut scan = SegmentScan {
        last_sequence: segment.first_sequence - 1,
        valid_len: SEGMENT_HEADER_SIZE as u64,
        torn: None,
    };
    let mut buf = Vec::new();
    loop {
        let expected = scan.last_sequence + 1;
        let len = match read_record(&mut reader, &mut buf, 0)? {
            None => break,
            Some(Ok(entry)) => {
                if entry.sequence_id != expected {
                    return Err(Error::consistency(
                        expected,
                        ConsistencyKind::SequenceGap {
                            expected,
                            found: entry.sequence_id,
                        },
                    ));
                }
                encoded_len(&entry)
            }
            Some(Err(RecordError::Corrupt { len, .. })) => {
                warn!(
                    "Journal record {} in {} fails its checksum",
                    expected,
                    segment.path.display()
                );
                len
            }
            Some(Err(RecordError::Incomplete)) => {
                check_torn_tail(segment, &scan, RecordError::Incomplete)?;
                scan.torn = Some("incomplete record".to_string());
                break;
            }
            Some(Err(RecordError::Malformed(msg))) => {
                check_torn_tail(segment, &scan, RecordError::Malformed(msg.clone()))?;
                scan.torn = Some(msg);
                break;
            }
        };
        scan.last_sequence = expected;
        scan.valid_len += len as u64;
    }
    Ok(scan)
}

/// Fail unless the undecodable bytes after `scan.valid_len` are a torn
/// tail. Bytes holding an intact record for a later sequence are not.
fn check_torn_tail(segment: &Segment, scan: &SegmentScan, damage: RecordError) -> Result<()> {
    let expected = scan.last_sequence + 1;
    let mut file = File::open(&segment.path)?;
    file.seek(SeekFrom::Start(scan.valid_len))?;
    let mut tail = Vec::new();
    file.read_to_end(&mut tail)?;

    if tail.iter().all(|b| *b == 0) {
        return Ok(());
    }
    let max_following = (tail.len() / MIN_RECORD_SIZE) as u64;
    let intact_follows = (1..tail.len()).any(|at| {
        let rest = &tail[at..];
        let plausible = rest
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_be_bytes)
            .is_some_and(|seq| seq > expected && seq <= expected + max_following);
        plausible && decode_record(rest).is_ok()
    });
    if intact_follows {
        error!(
            "Journal record {} in {} at offset {} is damaged and intact records follow it",
            expected,
            segment.path.display(),
            scan.valid_len
        );
        return Err(damage.into_error(expected));
    }
    Ok(())
}

fn read_fence(dir: &Path) -> Result<Epoch> {
    let bytes = match fs::read(dir.join(FENCE_FILE)) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let stored = bytes
        .get(8..12)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes);
    if bytes.len() != 12 || !stored.is_some_and(|crc| verify_crc32c(&bytes[..8], crc)) {
        return Err(Error::consistency(
            0,
            ConsistencyKind::Malformed("corrupt journal fence file".into()),
        ));
    }
    let mut epoch = [0u8; 8];
    epoch.copy_from_slice(&bytes[..8]);
    Ok(u64::from_be_bytes(epoch))
}

fn write_fence(dir: &Path, epoch: Epoch) -> io::Result<()> {
    let mut bytes = Vec::with_capacity(12);
    bytes.extend_from_slice(&epoch.to_be_bytes());
    bytes.extend_from_slice(&compute_crc32c(&bytes).to_be_bytes());

    let tmp = dir.join(format!("{FENCE_FILE}.tmp"));
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join(FENCE_FILE))?;
    sync_dir(dir);
    Ok(())
}

/// Persist directory entries (new, renamed or removed files)
fn sync_dir(dir: &Path) {
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::record::MAX_BODY_SIZE;
    use crate::state::{OpCode, Operation};
    use bytes::Bytes;
    use tempfile::tempdir;

    fn entry(seq: u64) -> JournalEntry {
        JournalEntry::new(seq, &Operation::create_table(1, format!("t{seq}")), seq).unwrap()
    }

    fn entries(range: std::ops::RangeInclusive<u64>) -> Vec<JournalEntry> {
        range.map(entry).collect()
    }

    fn small_segments() -> JournalConfig {
        JournalConfig {
            segment_size_bytes: 512,
            ..JournalConfig::default()
        }
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempdir().unwrap();
        let journal = FileJournal::open(dir.path(), JournalConfig::default()).unwrap();
        assert_eq!(journal.first_sequence(), 1);
        assert_eq!(journal.last_sequence(), 0);

        journal.append(1, &entries(1..=5)).unwrap();
        assert_eq!(journal.last_sequence(), 5);

        let read = journal.read(2, 4).unwrap();
        assert_eq!(read, entries(2..=4));
        // clamped to the tail
        assert_eq!(journal.read(4, 100).unwrap().len(), 2);
        assert!(journal.read(6, 10).unwrap().is_empty());
    }

    #[test]
    fn test_append_rejects_gap() {
        let dir = tempdir().unwrap();
        let journal = FileJournal::open(dir.path(), JournalConfig::default()).unwrap();
        journal.append(1, &entries(1..=2)).unwrap();

        let err = journal.append(1, &entries(4..=4)).unwrap_err();
        assert!(matches!(
            err,
            Error::Consistency {
                kind: ConsistencyKind::SequenceGap { expected: 3, .. },
                ..
            }
        ));
        assert_eq!(journal.last_sequence(), 2);
    }

    #[test]
    fn test_reopen_and_fence() {
        let dir = tempdir().unwrap();
        {
            let journal = FileJournal::open(dir.path(), JournalConfig::default()).unwrap();
            journal.append(3, &entries(1..=10)).unwrap();
            assert!(matches!(
                journal.append(2, &entries(11..=11)),
                Err(Error::Fenced { epoch: 2, fence: 3 })
            ));
        }

        let journal = FileJournal::open(dir.path(), JournalConfig::default()).unwrap();
        assert_eq!(journal.last_sequence(), 10);
        assert_eq!(journal.fence(), 3);
        assert_eq!(journal.read(1, 10).unwrap(), entries(1..=10));
        journal.append(4, &entries(11..=11)).unwrap();
    }

    #[test]
    fn test_segments_roll_and_truncate() {
        let dir = tempdir().unwrap();
        let journal = FileJournal::open(dir.path(), small_segments()).unwrap();
        for seq in 1..=40 {
            journal.append(1, &[entry(seq)]).unwrap();
        }
        assert!(journal.segment_count() > 2);
        assert_eq!(journal.read(1, 40).unwrap(), entries(1..=40));

        journal.truncate_before(30).unwrap();
        let first = journal.first_sequence();
        assert!(first > 1 && first <= 30);
        assert!(matches!(
            journal.read(1, 5),
            Err(Error::JournalTruncated { first_available }) if first_available == first
        ));
        assert_eq!(journal.read(30, 40).unwrap(), entries(30..=40));

        drop(journal);
        let journal = FileJournal::open(dir.path(), small_segments()).unwrap();
        assert_eq!(journal.first_sequence(), first);
        assert_eq!(journal.last_sequence(), 40);
    }

    #[test]
    fn test_torn_tail_trimmed() {
        let dir = tempdir().unwrap();
        {
            let journal = FileJournal::open(dir.path(), JournalConfig::default()).unwrap();
            journal.append(1, &entries(1..=3)).unwrap();
        }
        let path = segment_path(dir.path(), 1);
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 5).unwrap();
        drop(file);

        let journal = FileJournal::open(dir.path(), JournalConfig::default()).unwrap();
        assert_eq!(journal.last_sequence(), 2);
        journal.append(1, &entries(3..=3)).unwrap();
        assert_eq!(journal.read(1, 3).unwrap(), entries(1..=3));
    }

    #[test]
    fn test_damaged_length_mid_segment_fails_open() {
        let dir = tempdir().unwrap();
        {
            let journal = FileJournal::open(dir.path(), JournalConfig::default()).unwrap();
            journal.append(1, &entries(1..=5)).unwrap();
        }
        // flip a bit in the length field of record 3
        let path = segment_path(dir.path(), 1);
        let mut bytes = fs::read(&path).unwrap();
        let original_len = bytes.len();
        let offset = SEGMENT_HEADER_SIZE + 2 * encoded_len(&entry(1)) + 12;
        bytes[offset] ^= 0x40;
        fs::write(&path, &bytes).unwrap();

        let err = FileJournal::open(dir.path(), JournalConfig::default())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::Consistency {
                sequence: 3,
                kind: ConsistencyKind::Malformed(_)
            }
        ));
        // acknowledged entries were not trimmed away
        assert_eq!(fs::metadata(&path).unwrap().len() as usize, original_len);

        // a length pointing past the end of the file is no tail either
        bytes[offset] ^= 0x40;
        bytes[offset + 1] ^= 0x01;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            FileJournal::open(dir.path(), JournalConfig::default()),
            Err(Error::Consistency { sequence: 3, .. })
        ));
    }

    #[test]
    fn test_zeroed_tail_trimmed() {
        let dir = tempdir().unwrap();
        {
            let journal = FileJournal::open(dir.path(), JournalConfig::default()).unwrap();
            journal.append(1, &entries(1..=2)).unwrap();
        }
        let path = segment_path(dir.path(), 1);
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len + 4096).unwrap();
        drop(file);

        let journal = FileJournal::open(dir.path(), JournalConfig::default()).unwrap();
        assert_eq!(journal.last_sequence(), 2);
        assert_eq!(fs::metadata(&path).unwrap().len(), len);
        journal.append(1, &entries(3..=3)).unwrap();
        assert_eq!(journal.read(1, 3).unwrap(), entries(1..=3));
    }

    #[test]
    fn test_append_rejects_oversize_payload() {
        let dir = tempdir().unwrap();
        let journal = FileJournal::open(dir.path(), JournalConfig::default()).unwrap();
        journal.append(1, &entries(1..=1)).unwrap();

        let oversize = JournalEntry {
            sequence_id: 2,
            op_code: OpCode::PutResource.as_u32(),
            created_at: 2,
            payload: Bytes::from(vec![0u8; MAX_BODY_SIZE + 1]),
        };
        let err = journal.append(1, &[oversize]).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert_eq!(journal.last_sequence(), 1);

        drop(journal);
        let journal = FileJournal::open(dir.path(), JournalConfig::default()).unwrap();
        assert_eq!(journal.read(1, 10).unwrap(), entries(1..=1));
    }

    #[test]
    fn test_corrupt_record_reported() {
        let dir = tempdir().unwrap();
        {
            let journal = FileJournal::open(dir.path(), JournalConfig::default()).unwrap();
            journal.append(1, &entries(1..=5)).unwrap();
        }
        // flip a payload byte of record 3
        let path = segment_path(dir.path(), 1);
        let mut bytes = fs::read(&path).unwrap();
        let offset = SEGMENT_HEADER_SIZE + 2 * encoded_len(&entry(1)) + 30;
        bytes[offset] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let journal = FileJournal::open(dir.path(), JournalConfig::default()).unwrap();
        assert_eq!(journal.last_sequence(), 5);

        let mut seen = Vec::new();
        let err = journal
            .scan(1, 5, &mut |e| {
                seen.push(e.sequence_id);
                Ok(())
            })
            .unwrap_err();
        assert_eq!(seen, vec![1, 2]);
        assert!(matches!(
            err,
            Error::Consistency {
                sequence: 3,
                kind: ConsistencyKind::ChecksumMismatch
            }
        ));
        // entries past the corruption are still readable directly
        assert_eq!(journal.read(4, 5).unwrap(), entries(4..=5));
    }

    #[test]
    fn test_reset_to() {
        let dir = tempdir().unwrap();
        let journal = FileJournal::open(dir.path(), JournalConfig::default()).unwrap();
        journal.append(1, &entries(1..=3)).unwrap();

        journal.reset_to(100).unwrap();
        assert_eq!(journal.first_sequence(), 101);
        assert_eq!(journal.last_sequence(), 100);
        journal.append(1, &entries(101..=102)).unwrap();

        drop(journal);
        let journal = FileJournal::open(dir.path(), JournalConfig::default()).unwrap();
        assert_eq!(journal.read(101, 102).unwrap(), entries(101..=102));
    }
}
