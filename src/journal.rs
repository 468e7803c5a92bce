//! Append-only merge journal.
//!
//! The journal is written at every merge boundary and consumed once at
//! startup: recovery replays it to resume or roll back a mid-flight merge.
//! Format: `[magic u32]` then entries, each `[tag u8][len u32][payload][crc32]`
//! with the CRC computed over the payload. A corrupt or torn trailing entry
//! makes recovery treat the merge as mid-flight.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32;

use crate::error::MergeError;
use crate::types::SeriesPath;

/// Journal file name of an inplace merge, per storage-group system directory.
pub const MERGE_LOG_NAME: &str = "merge.log";
/// Journal file name of a squeeze merge.
pub const SQUEEZE_LOG_NAME: &str = "merge.squeeze.log";

const JOURNAL_MAGIC: u32 = 0x314A_4D53; // "SMJ1"

const TAG_FILES: u8 = 1;
const TAG_MERGE_START: u8 = 2;
const TAG_TS_START: u8 = 3;
const TAG_TS_END: u8 = 4;
const TAG_FILE_POSITION: u8 = 5;
const TAG_FILE_MERGE_START: u8 = 6;
const TAG_FILE_MERGE_END: u8 = 7;
const TAG_NEW_FILE: u8 = 8;
const TAG_CANCEL: u8 = 9;
const TAG_MERGE_END: u8 = 10;

/// Which way an inplace commit moves data for one sequence file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Truncate the old file and append the merged chunks to it.
    MoveMergedToOld,
    /// Append the unmerged chunks to the temp file and swap it in.
    MoveUnmergedToNew,
}

impl CommitMode {
    fn tag(self) -> u8 {
        match self {
            CommitMode::MoveMergedToOld => 0,
            CommitMode::MoveUnmergedToNew => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, MergeError> {
        match tag {
            0 => Ok(CommitMode::MoveMergedToOld),
            1 => Ok(CommitMode::MoveUnmergedToNew),
            other => Err(MergeError::CorruptJournal(format!(
                "unknown commit mode tag {}",
                other
            ))),
        }
    }
}

/// One journal record.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalEntry {
    /// The working set chosen for this merge.
    Files { seq: Vec<PathBuf>, unseq: Vec<PathBuf> },
    /// All inputs are reserved; chunk merging is about to begin.
    MergeStart,
    /// A series batch starts merging.
    TsStart { series: Vec<SeriesPath> },
    /// The current series batch finished.
    TsEnd,
    /// Durable byte position of a temp output after a batch.
    FilePosition { file: PathBuf, offset: u64 },
    /// Commit of one file begins; `truncate_pos` is 0 for move-unmerged-to-new.
    FileMergeStart { file: PathBuf, truncate_pos: u64, mode: CommitMode },
    /// Commit of the current file completed (file sealed).
    FileMergeEnd,
    /// A squeeze output is complete under its final name.
    NewFile { path: PathBuf },
    /// The task observed cancellation and is about to clean up.
    Cancel,
    /// The whole merge committed; inputs may now be retired.
    MergeEnd,
}

/// Append handle over one journal file. Every entry is synced before the
/// corresponding file mutation happens.
#[derive(Debug)]
pub struct MergeJournal {
    path: PathBuf,
    file: BufWriter<File>,
}

impl MergeJournal {
    /// Creates (or truncates) the journal for a new merge in the
    /// storage-group system directory.
    pub fn create(sys_dir: &Path, squeeze: bool) -> Result<Self, MergeError> {
        std::fs::create_dir_all(sys_dir)?;
        let path = journal_path(sys_dir, squeeze);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut w = BufWriter::new(file);
        w.write_all(&JOURNAL_MAGIC.to_le_bytes())?;
        w.flush()?;
        w.get_ref().sync_data()?;
        Ok(Self { path, file: w })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one entry durably.
    pub fn log(&mut self, entry: &JournalEntry) -> Result<(), MergeError> {
        let (tag, payload) = encode_entry(entry)?;
        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        self.file.write_all(&[tag])?;
        self.file.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.file.write_all(&payload)?;
        self.file.write_all(&crc.to_le_bytes())?;
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }

    pub fn close(self) -> Result<(), MergeError> {
        let mut file = self.file;
        file.flush()?;
        file.get_ref().sync_data()?;
        Ok(())
    }

    /// Closes and removes the journal (the merge fully committed or was
    /// cleanly aborted before any mutation).
    pub fn close_and_delete(self) -> Result<(), MergeError> {
        let path = self.path.clone();
        self.close()?;
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

pub fn journal_path(sys_dir: &Path, squeeze: bool) -> PathBuf {
    sys_dir.join(if squeeze { SQUEEZE_LOG_NAME } else { MERGE_LOG_NAME })
}

/// Result of scanning a journal at startup.
#[derive(Debug)]
pub struct JournalScan {
    pub entries: Vec<JournalEntry>,
    /// True when the scan stopped at a corrupt or torn trailing entry; the
    /// merge is then treated as mid-flight regardless of what was read.
    pub truncated: bool,
}

impl JournalScan {
    pub fn contains_merge_end(&self) -> bool {
        !self.truncated && self.entries.iter().any(|e| matches!(e, JournalEntry::MergeEnd))
    }

    pub fn file_set(&self) -> Option<(&[PathBuf], &[PathBuf])> {
        self.entries.iter().find_map(|e| match e {
            JournalEntry::Files { seq, unseq } => Some((seq.as_slice(), unseq.as_slice())),
            _ => None,
        })
    }

    /// The last `FileMergeStart`, and whether a matching `FileMergeEnd`
    /// followed it.
    pub fn last_file_merge(&self) -> Option<(&PathBuf, u64, CommitMode, bool)> {
        let mut result = None;
        for entry in &self.entries {
            match entry {
                JournalEntry::FileMergeStart { file, truncate_pos, mode } => {
                    result = Some((file, *truncate_pos, *mode, false));
                }
                JournalEntry::FileMergeEnd => {
                    if let Some((f, t, m, _)) = result.take() {
                        result = Some((f, t, m, true));
                    }
                }
                _ => {}
            }
        }
        result
    }

    pub fn new_file(&self) -> Option<&PathBuf> {
        self.entries.iter().find_map(|e| match e {
            JournalEntry::NewFile { path } => Some(path),
            _ => None,
        })
    }
}

/// Scans a journal file, stopping at the first corruption.
pub fn read_journal(path: &Path) -> Result<JournalScan, MergeError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    match reader.read_exact(&mut magic) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Ok(JournalScan { entries: Vec::new(), truncated: true })
        }
        Err(e) => return Err(MergeError::Io(e)),
    }
    if u32::from_le_bytes(magic) != JOURNAL_MAGIC {
        return Ok(JournalScan { entries: Vec::new(), truncated: true });
    }

    let mut entries = Vec::new();
    let mut truncated = false;
    loop {
        let mut tag = [0u8; 1];
        match reader.read_exact(&mut tag) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(MergeError::Io(e)),
        }
        let mut len_bytes = [0u8; 4];
        if reader.read_exact(&mut len_bytes).is_err() {
            truncated = true;
            break;
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut payload = vec![0u8; len];
        if reader.read_exact(&mut payload).is_err() {
            truncated = true;
            break;
        }
        let mut crc_bytes = [0u8; 4];
        if reader.read_exact(&mut crc_bytes).is_err() {
            truncated = true;
            break;
        }
        let mut hasher = Crc32::new();
        hasher.update(&payload);
        if hasher.finalize() != u32::from_le_bytes(crc_bytes) {
            truncated = true;
            break;
        }
        match decode_entry(tag[0], &payload) {
            Ok(entry) => entries.push(entry),
            Err(_) => {
                truncated = true;
                break;
            }
        }
    }
    Ok(JournalScan { entries, truncated })
}

fn encode_entry(entry: &JournalEntry) -> Result<(u8, Vec<u8>), MergeError> {
    let mut buf = Vec::new();
    let tag = match entry {
        JournalEntry::Files { seq, unseq } => {
            write_path_list(&mut buf, seq);
            write_path_list(&mut buf, unseq);
            TAG_FILES
        }
        JournalEntry::MergeStart => TAG_MERGE_START,
        JournalEntry::TsStart { series } => {
            buf.extend_from_slice(&(series.len() as u32).to_le_bytes());
            for s in series {
                write_string(&mut buf, &s.to_string());
            }
            TAG_TS_START
        }
        JournalEntry::TsEnd => TAG_TS_END,
        JournalEntry::FilePosition { file, offset } => {
            write_string(&mut buf, &file.to_string_lossy());
            buf.extend_from_slice(&offset.to_le_bytes());
            TAG_FILE_POSITION
        }
        JournalEntry::FileMergeStart { file, truncate_pos, mode } => {
            write_string(&mut buf, &file.to_string_lossy());
            buf.extend_from_slice(&truncate_pos.to_le_bytes());
            buf.push(mode.tag());
            TAG_FILE_MERGE_START
        }
        JournalEntry::FileMergeEnd => TAG_FILE_MERGE_END,
        JournalEntry::NewFile { path } => {
            write_string(&mut buf, &path.to_string_lossy());
            TAG_NEW_FILE
        }
        JournalEntry::Cancel => TAG_CANCEL,
        JournalEntry::MergeEnd => TAG_MERGE_END,
    };
    Ok((tag, buf))
}

fn decode_entry(tag: u8, payload: &[u8]) -> Result<JournalEntry, MergeError> {
    let mut cur = io::Cursor::new(payload);
    let entry = match tag {
        TAG_FILES => {
            let seq = read_path_list(&mut cur)?;
            let unseq = read_path_list(&mut cur)?;
            JournalEntry::Files { seq, unseq }
        }
        TAG_MERGE_START => JournalEntry::MergeStart,
        TAG_TS_START => {
            let count = read_u32(&mut cur)? as usize;
            let mut series = Vec::with_capacity(count);
            for _ in 0..count {
                let s = read_string(&mut cur)?;
                series.push(SeriesPath::parse(&s).map_err(|e| {
                    MergeError::CorruptJournal(format!("bad series path in TsStart: {}", e))
                })?);
            }
            JournalEntry::TsStart { series }
        }
        TAG_TS_END => JournalEntry::TsEnd,
        TAG_FILE_POSITION => {
            let file = PathBuf::from(read_string(&mut cur)?);
            let offset = read_u64(&mut cur)?;
            JournalEntry::FilePosition { file, offset }
        }
        TAG_FILE_MERGE_START => {
            let file = PathBuf::from(read_string(&mut cur)?);
            let truncate_pos = read_u64(&mut cur)?;
            let mut mode = [0u8; 1];
            cur.read_exact(&mut mode)?;
            JournalEntry::FileMergeStart {
                file,
                truncate_pos,
                mode: CommitMode::from_tag(mode[0])?,
            }
        }
        TAG_FILE_MERGE_END => JournalEntry::FileMergeEnd,
        TAG_NEW_FILE => JournalEntry::NewFile { path: PathBuf::from(read_string(&mut cur)?) },
        TAG_CANCEL => JournalEntry::Cancel,
        TAG_MERGE_END => JournalEntry::MergeEnd,
        other => {
            return Err(MergeError::CorruptJournal(format!(
                "unknown journal entry tag {}",
                other
            )))
        }
    };
    Ok(entry)
}

fn write_path_list(buf: &mut Vec<u8>, paths: &[PathBuf]) {
    buf.extend_from_slice(&(paths.len() as u32).to_le_bytes());
    for p in paths {
        write_string(buf, &p.to_string_lossy());
    }
}

fn read_path_list<R: Read>(r: &mut R) -> Result<Vec<PathBuf>, MergeError> {
    let count = read_u32(r)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(PathBuf::from(read_string(r)?));
    }
    Ok(out)
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, MergeError> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64, MergeError> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

fn read_string<R: Read>(r: &mut R) -> Result<String, MergeError> {
    let len = read_u32(r)? as usize;
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|e| MergeError::CorruptJournal(format!("invalid UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_entries() -> Vec<JournalEntry> {
        vec![
            JournalEntry::Files {
                seq: vec![PathBuf::from("/sg/0/1-1-0.seg"), PathBuf::from("/sg/0/2-2-0.seg")],
                unseq: vec![PathBuf::from("/sg/0/3-3-0.seg")],
            },
            JournalEntry::MergeStart,
            JournalEntry::TsStart {
                series: vec![SeriesPath::new("root.sg.d1", "s0")],
            },
            JournalEntry::FilePosition { file: PathBuf::from("/sg/0/1-1-0.seg.merge.inplace"), offset: 420 },
            JournalEntry::TsEnd,
            JournalEntry::FileMergeStart {
                file: PathBuf::from("/sg/0/1-1-0.seg"),
                truncate_pos: 1234,
                mode: CommitMode::MoveMergedToOld,
            },
            JournalEntry::FileMergeEnd,
            JournalEntry::NewFile { path: PathBuf::from("/sg/0/9-1-1.seg") },
            JournalEntry::Cancel,
            JournalEntry::MergeEnd,
        ]
    }

    #[test]
    fn test_journal_roundtrip() {
        let dir = tempdir().unwrap();
        let mut journal = MergeJournal::create(dir.path(), false).unwrap();
        for entry in sample_entries() {
            journal.log(&entry).unwrap();
        }
        let path = journal.path().to_path_buf();
        journal.close().unwrap();

        let scan = read_journal(&path).unwrap();
        assert!(!scan.truncated);
        assert_eq!(scan.entries, sample_entries());
        assert!(scan.contains_merge_end());
        assert_eq!(scan.new_file().unwrap(), &PathBuf::from("/sg/0/9-1-1.seg"));
    }

    #[test]
    fn test_corrupt_trailing_entry_marks_truncated() {
        let dir = tempdir().unwrap();
        let mut journal = MergeJournal::create(dir.path(), false).unwrap();
        journal.log(&JournalEntry::MergeStart).unwrap();
        journal.log(&JournalEntry::MergeEnd).unwrap();
        let path = journal.path().to_path_buf();
        journal.close().unwrap();

        // Append half an entry.
        {
            use std::io::Write as _;
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[TAG_TS_START, 50, 0]).unwrap();
        }

        let scan = read_journal(&path).unwrap();
        assert!(scan.truncated);
        assert_eq!(scan.entries.len(), 2);
        // Truncation downgrades even a visible MergeEnd to mid-flight.
        assert!(!scan.contains_merge_end());
    }

    #[test]
    fn test_bad_crc_marks_truncated() {
        let dir = tempdir().unwrap();
        let mut journal = MergeJournal::create(dir.path(), true).unwrap();
        assert!(journal.path().ends_with(SQUEEZE_LOG_NAME));
        journal
            .log(&JournalEntry::NewFile { path: PathBuf::from("/x/1-1-1.seg") })
            .unwrap();
        let path = journal.path().to_path_buf();
        journal.close().unwrap();

        // Flip a payload byte, leaving the stored CRC stale.
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut f = OpenOptions::new().write(true).open(&path).unwrap();
            f.seek(SeekFrom::Start(4 + 1 + 4 + 2)).unwrap();
            f.write_all(&[0xAA]).unwrap();
        }

        let scan = read_journal(&path).unwrap();
        assert!(scan.truncated);
        assert!(scan.entries.is_empty());
    }

    #[test]
    fn test_last_file_merge_tracks_matching_end() {
        let dir = tempdir().unwrap();
        let mut journal = MergeJournal::create(dir.path(), false).unwrap();
        journal
            .log(&JournalEntry::FileMergeStart {
                file: PathBuf::from("a.seg"),
                truncate_pos: 10,
                mode: CommitMode::MoveMergedToOld,
            })
            .unwrap();
        journal.log(&JournalEntry::FileMergeEnd).unwrap();
        journal
            .log(&JournalEntry::FileMergeStart {
                file: PathBuf::from("b.seg"),
                truncate_pos: 0,
                mode: CommitMode::MoveUnmergedToNew,
            })
            .unwrap();
        let path = journal.path().to_path_buf();
        journal.close().unwrap();

        let scan = read_journal(&path).unwrap();
        let (file, pos, mode, ended) = scan.last_file_merge().unwrap();
        assert_eq!(file, &PathBuf::from("b.seg"));
        assert_eq!(pos, 0);
        assert_eq!(mode, CommitMode::MoveUnmergedToNew);
        assert!(!ended);
    }
}
