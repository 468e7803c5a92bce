use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use crate::error::MergeError;
use crate::types::{SeriesPath, Timestamp};

/// Extension of sealed segment files.
pub const SEGMENT_EXT: &str = "seg";
/// Sidecar carrying per-device time ranges and the ancestor-generation set.
pub const RESOURCE_SUFFIX: &str = ".resource";
/// Sidecar carrying deletion tombstones.
pub const MODS_SUFFIX: &str = ".mods";
/// Suffix of temp outputs while an inplace merge is writing.
pub const INPLACE_MERGE_SUFFIX: &str = ".merge.inplace";
/// Suffix of the temp output while a squeeze merge is writing.
pub const SQUEEZE_MERGE_SUFFIX: &str = ".merge.squeeze";

const FILE_NAME_SEPARATOR: char = '-';

static NEXT_SEGMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity embedded in a segment file name:
/// `{generation}-{version}-{mergeGeneration}[.{level}].seg`.
///
/// Sorting precedence is `(generation, version, merge_count)`; the optional
/// explicit level only affects tier placement, never ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentName {
    pub generation: i64,
    pub version: i64,
    pub merge_count: u32,
    pub level: Option<u32>,
}

impl SegmentName {
    pub fn new(generation: i64, version: i64, merge_count: u32) -> Self {
        Self { generation, version, merge_count, level: None }
    }

    pub fn parse(file_name: &str) -> Result<Self, MergeError> {
        let bad = || MergeError::InvalidFileName(file_name.to_string());
        let stem = file_name
            .strip_suffix(&format!(".{}", SEGMENT_EXT))
            .ok_or_else(bad)?;
        let mut parts = stem.splitn(3, FILE_NAME_SEPARATOR);
        let generation = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
        let version = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
        let tail = parts.next().ok_or_else(bad)?;
        let (merge_count, level) = match tail.split_once('.') {
            Some((m, l)) => (
                m.parse().map_err(|_| bad())?,
                Some(l.parse().map_err(|_| bad())?),
            ),
            None => (tail.parse().map_err(|_| bad())?, None),
        };
        Ok(Self { generation, version, merge_count, level })
    }

    pub fn file_name(&self) -> String {
        match self.level {
            Some(level) => format!(
                "{}{sep}{}{sep}{}.{}.{}",
                self.generation,
                self.version,
                self.merge_count,
                level,
                SEGMENT_EXT,
                sep = FILE_NAME_SEPARATOR
            ),
            None => format!(
                "{}{sep}{}{sep}{}.{}",
                self.generation,
                self.version,
                self.merge_count,
                SEGMENT_EXT,
                sep = FILE_NAME_SEPARATOR
            ),
        }
    }

    /// The tier this file belongs to: the explicit level field when present,
    /// otherwise the merge generation (freshly sealed files have both at 0).
    pub fn tier(&self) -> u32 {
        self.level.unwrap_or(self.merge_count)
    }

    /// The name a file takes when an inplace commit rewrites it.
    pub fn next_merge(&self) -> Self {
        Self { merge_count: self.merge_count + 1, ..*self }
    }

    /// The name a level promotion gives its output file.
    pub fn promoted(&self, level: u32) -> Self {
        Self {
            generation: self.generation,
            version: self.version,
            merge_count: level,
            level: self.level.map(|_| level),
        }
    }
}

/// Per-device time ranges and the ancestor-generation set of a segment,
/// persisted in the `.resource` sidecar as little-endian length-prefixed
/// tuples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceDescriptor {
    pub device_ranges: BTreeMap<String, (Timestamp, Timestamp)>,
    pub ancestors: BTreeSet<i64>,
}

impl ResourceDescriptor {
    pub fn device_range(&self, device: &str) -> Option<(Timestamp, Timestamp)> {
        self.device_ranges.get(device).copied()
    }

    /// Lowers the recorded min time of a device (never raises it).
    pub fn pull_down_start_time(&mut self, device: &str, min_time: Timestamp) {
        if let Some((min, _)) = self.device_ranges.get_mut(device) {
            if min_time < *min {
                *min = min_time;
            }
        }
    }

    pub fn expand(&mut self, device: &str, min_time: Timestamp, max_time: Timestamp) {
        let entry = self
            .device_ranges
            .entry(device.to_string())
            .or_insert((min_time, max_time));
        entry.0 = entry.0.min(min_time);
        entry.1 = entry.1.max(max_time);
    }

    /// Newest timestamp across all devices; `None` when the segment is empty.
    pub fn max_end_time(&self) -> Option<Timestamp> {
        self.device_ranges.values().map(|(_, max)| *max).max()
    }

    /// Whether any device interval overlaps `other`'s interval for the same device.
    pub fn overlaps(&self, other: &ResourceDescriptor) -> bool {
        self.device_ranges.iter().any(|(device, (min, max))| {
            other
                .device_range(device)
                .map(|(omin, omax)| *min <= omax && omin <= *max)
                .unwrap_or(false)
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), MergeError> {
        w.write_all(&(self.device_ranges.len() as u32).to_le_bytes())?;
        for (device, (min, max)) in &self.device_ranges {
            let bytes = device.as_bytes();
            w.write_all(&(bytes.len() as u32).to_le_bytes())?;
            w.write_all(bytes)?;
            w.write_all(&min.to_le_bytes())?;
            w.write_all(&max.to_le_bytes())?;
        }
        w.write_all(&(self.ancestors.len() as u32).to_le_bytes())?;
        for gen in &self.ancestors {
            w.write_all(&gen.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, MergeError> {
        let device_count = read_u32(r)? as usize;
        let mut device_ranges = BTreeMap::new();
        for _ in 0..device_count {
            let device = read_string(r)?;
            let min = read_i64(r)?;
            let max = read_i64(r)?;
            device_ranges.insert(device, (min, max));
        }
        let ancestor_count = read_u32(r)? as usize;
        let mut ancestors = BTreeSet::new();
        for _ in 0..ancestor_count {
            ancestors.insert(read_i64(r)?);
        }
        Ok(Self { device_ranges, ancestors })
    }
}

/// A deletion tombstone: points of `path` at or before `end_time` were deleted
/// at `version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tombstone {
    pub path: SeriesPath,
    pub end_time: Timestamp,
    pub version: i64,
}

impl Tombstone {
    pub fn new(path: SeriesPath, end_time: Timestamp, version: i64) -> Self {
        Self { path, end_time, version }
    }
}

/// Handle to one sealed segment file and its sidecars.
///
/// The handle is shared (`Arc`) between the level index and any merge task
/// working on it; the `merging` flag is the exclusive reservation described in
/// the segment lifecycle. Interior mutability covers the two commit-time
/// mutations: the rename to the successor name and descriptor updates.
#[derive(Debug)]
pub struct Segment {
    id: u64,
    partition: u64,
    path: RwLock<PathBuf>,
    name: RwLock<SegmentName>,
    descriptor: RwLock<ResourceDescriptor>,
    sealed: bool,
    merging: AtomicBool,
    deleted: AtomicBool,
}

impl Segment {
    /// Opens a segment handle from a sealed file on disk. The `.resource`
    /// sidecar is loaded if present, otherwise rebuilt from the file index and
    /// written back.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MergeError> {
        let path = path.as_ref().to_path_buf();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| MergeError::InvalidFileName(path.display().to_string()))?;
        let name = SegmentName::parse(&file_name)?;
        let partition = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_string_lossy().parse().ok())
            .unwrap_or(0);

        let sealed = crate::format::is_sealed(&path)?;

        let resource_path = sidecar_path(&path, RESOURCE_SUFFIX);
        let descriptor = if resource_path.exists() {
            read_descriptor(&resource_path)?
        } else {
            let mut descriptor = crate::format::SegmentReader::open(&path)?.build_descriptor();
            descriptor.ancestors.insert(name.generation);
            write_descriptor_atomic(&resource_path, &descriptor)?;
            descriptor
        };

        Ok(Self {
            id: NEXT_SEGMENT_ID.fetch_add(1, Ordering::Relaxed),
            partition,
            path: RwLock::new(path),
            name: RwLock::new(name),
            descriptor: RwLock::new(descriptor),
            sealed,
            merging: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
        })
    }

    /// Process-unique identity, stable across renames.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn partition(&self) -> u64 {
        self.partition
    }

    pub fn path(&self) -> PathBuf {
        self.path.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn name(&self) -> SegmentName {
        *self.name.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn descriptor(&self) -> ResourceDescriptor {
        self.descriptor
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    /// Tries to take the exclusive merging reservation; false if already held.
    pub fn try_reserve(&self) -> bool {
        self.merging
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release_reservation(&self) {
        self.merging.store(false, Ordering::Release);
    }

    pub fn is_merging(&self) -> bool {
        self.merging.load(Ordering::Acquire)
    }

    pub fn max_end_time(&self) -> Option<Timestamp> {
        self.descriptor
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .max_end_time()
    }

    pub fn device_range(&self, device: &str) -> Option<(Timestamp, Timestamp)> {
        self.descriptor
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .device_range(device)
    }

    /// Applies an in-memory descriptor mutation; call `save_descriptor` to persist.
    pub fn update_descriptor<F: FnOnce(&mut ResourceDescriptor)>(&self, f: F) {
        let mut guard = self.descriptor.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }

    pub fn save_descriptor(&self) -> Result<(), MergeError> {
        let descriptor = self.descriptor();
        write_descriptor_atomic(&sidecar_path(&self.path(), RESOURCE_SUFFIX), &descriptor)
    }

    pub fn resource_path(&self) -> PathBuf {
        sidecar_path(&self.path(), RESOURCE_SUFFIX)
    }

    pub fn mods_path(&self) -> PathBuf {
        sidecar_path(&self.path(), MODS_SUFFIX)
    }

    /// Reads all tombstones from the `.mods` sidecar, oldest first.
    pub fn read_tombstones(&self) -> Result<Vec<Tombstone>, MergeError> {
        read_tombstones(&self.mods_path())
    }

    /// Appends a tombstone to the `.mods` sidecar.
    pub fn append_tombstone(&self, tombstone: &Tombstone) -> Result<(), MergeError> {
        append_tombstone(&self.mods_path(), tombstone)
    }

    /// Renames the segment (and its `.resource` sidecar) to `next` after a
    /// commit. Tombstones were applied during the merge, so the `.mods`
    /// sidecar does not follow the rename.
    pub fn rename_to(&self, next: SegmentName) -> Result<(), MergeError> {
        let old_path = self.path();
        let new_path = old_path.with_file_name(next.file_name());
        fs::rename(&old_path, &new_path)?;

        let old_resource = sidecar_path(&old_path, RESOURCE_SUFFIX);
        if old_resource.exists() {
            fs::rename(&old_resource, sidecar_path(&new_path, RESOURCE_SUFFIX))?;
        }
        let old_mods = sidecar_path(&old_path, MODS_SUFFIX);
        if old_mods.exists() {
            fs::remove_file(&old_mods)?;
        }
        if let Some(dir) = new_path.parent() {
            sync_dir(dir)?;
        }

        *self.path.write().unwrap_or_else(|e| e.into_inner()) = new_path;
        *self.name.write().unwrap_or_else(|e| e.into_inner()) = next;
        self.save_descriptor()
    }

    /// Re-points the handle at a replacement file (the sealed temp of a
    /// move-unmerged-to-new commit): drops the old sidecars, adopts the new
    /// path and name, and persists the current descriptor there.
    pub(crate) fn adopt_replacement(
        &self,
        new_path: PathBuf,
        new_name: SegmentName,
    ) -> Result<(), MergeError> {
        let old_path = self.path();
        let old_resource = sidecar_path(&old_path, RESOURCE_SUFFIX);
        if old_resource.exists() {
            fs::remove_file(&old_resource)?;
        }
        let old_mods = sidecar_path(&old_path, MODS_SUFFIX);
        if old_mods.exists() {
            fs::remove_file(&old_mods)?;
        }
        *self.path.write().unwrap_or_else(|e| e.into_inner()) = new_path;
        *self.name.write().unwrap_or_else(|e| e.into_inner()) = new_name;
        self.save_descriptor()
    }

    /// Removes the segment file and all sidecars from disk.
    pub fn delete_from_disk(&self) -> Result<(), MergeError> {
        self.mark_deleted();
        let path = self.path();
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let resource = sidecar_path(&path, RESOURCE_SUFFIX);
        if resource.exists() {
            fs::remove_file(&resource)?;
        }
        let mods = sidecar_path(&path, MODS_SUFFIX);
        if mods.exists() {
            fs::remove_file(&mods)?;
        }
        Ok(())
    }
}

/// Derives a sidecar/temp path by appending `suffix` to a file name.
pub fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

pub(crate) fn sync_dir(dir: &Path) -> Result<(), MergeError> {
    let d = File::open(dir).map_err(MergeError::Io)?;
    d.sync_data().map_err(MergeError::Io)?;
    Ok(())
}

fn read_descriptor(path: &Path) -> Result<ResourceDescriptor, MergeError> {
    let mut reader = BufReader::new(File::open(path)?);
    ResourceDescriptor::read_from(&mut reader)
}

pub(crate) fn write_descriptor_atomic(
    path: &Path,
    descriptor: &ResourceDescriptor,
) -> Result<(), MergeError> {
    let tmp = path.with_extension("resource.tmp");
    {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        let mut w = BufWriter::new(file);
        descriptor.write_to(&mut w)?;
        w.flush()?;
        w.get_ref().sync_data()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(dir) = path.parent() {
        sync_dir(dir)?;
    }
    Ok(())
}

/// Reads the append-only tombstone records of a `.mods` file. A torn trailing
/// record (crash mid-append) is ignored.
pub fn read_tombstones(path: &Path) -> Result<Vec<Tombstone>, MergeError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    loop {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(MergeError::Io(e)),
        }
        let path_len = u32::from_le_bytes(len_bytes) as usize;
        let mut path_bytes = vec![0u8; path_len];
        if reader.read_exact(&mut path_bytes).is_err() {
            break;
        }
        let Ok(full_path) = String::from_utf8(path_bytes) else { break };
        let mut b8 = [0u8; 8];
        if reader.read_exact(&mut b8).is_err() {
            break;
        }
        let end_time = i64::from_le_bytes(b8);
        if reader.read_exact(&mut b8).is_err() {
            break;
        }
        let version = i64::from_le_bytes(b8);
        let Ok(series) = SeriesPath::parse(&full_path) else { break };
        out.push(Tombstone::new(series, end_time, version));
    }
    Ok(out)
}

/// Appends one tombstone record to a `.mods` file, creating it if needed.
pub fn append_tombstone(path: &Path, tombstone: &Tombstone) -> Result<(), MergeError> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut w = BufWriter::new(file);
    let full = tombstone.path.to_string();
    let bytes = full.as_bytes();
    w.write_all(&(bytes.len() as u32).to_le_bytes())?;
    w.write_all(bytes)?;
    w.write_all(&tombstone.end_time.to_le_bytes())?;
    w.write_all(&tombstone.version.to_le_bytes())?;
    w.flush()?;
    w.get_ref().sync_data()?;
    Ok(())
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, MergeError> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_i64<R: Read>(r: &mut R) -> Result<i64, MergeError> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(i64::from_le_bytes(b))
}

fn read_string<R: Read>(r: &mut R) -> Result<String, MergeError> {
    let len = read_u32(r)? as usize;
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| MergeError::Corruption {
        details: format!("Invalid UTF-8 in descriptor: {}", e),
        series: None,
        timestamp: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_parse_and_format() {
        let n = SegmentName::parse("1593500000-7-0.seg").unwrap();
        assert_eq!(n, SegmentName::new(1593500000, 7, 0));
        assert_eq!(n.file_name(), "1593500000-7-0.seg");
        assert_eq!(n.tier(), 0);

        let leveled = SegmentName::parse("5-2-1.3.seg").unwrap();
        assert_eq!(leveled.level, Some(3));
        assert_eq!(leveled.tier(), 3);
        assert_eq!(leveled.file_name(), "5-2-1.3.seg");
    }

    #[test]
    fn test_name_rejects_garbage() {
        assert!(SegmentName::parse("nope").is_err());
        assert!(SegmentName::parse("1-2.seg").is_err());
        assert!(SegmentName::parse("a-b-c.seg").is_err());
        assert!(SegmentName::parse("1-2-3.tsfile").is_err());
    }

    #[test]
    fn test_name_ordering() {
        let mut names = vec![
            SegmentName::new(2, 0, 0),
            SegmentName::new(1, 5, 1),
            SegmentName::new(1, 5, 0),
            SegmentName::new(1, 2, 9),
        ];
        names.sort();
        assert_eq!(
            names,
            vec![
                SegmentName::new(1, 2, 9),
                SegmentName::new(1, 5, 0),
                SegmentName::new(1, 5, 1),
                SegmentName::new(2, 0, 0),
            ]
        );
    }

    #[test]
    fn test_next_merge_bumps_only_merge_count() {
        let n = SegmentName::new(10, 3, 1).next_merge();
        assert_eq!(n, SegmentName::new(10, 3, 2));
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let mut d = ResourceDescriptor::default();
        d.expand("root.sg.d1", 5, 100);
        d.expand("root.sg.d2", -3, 42);
        d.ancestors.insert(7);
        d.ancestors.insert(1593500000);

        let mut buf = Vec::new();
        d.write_to(&mut buf).unwrap();
        let back = ResourceDescriptor::read_from(&mut &buf[..]).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn test_descriptor_pull_down_never_raises() {
        let mut d = ResourceDescriptor::default();
        d.expand("d", 10, 20);
        d.pull_down_start_time("d", 5);
        assert_eq!(d.device_range("d"), Some((5, 20)));
        d.pull_down_start_time("d", 8);
        assert_eq!(d.device_range("d"), Some((5, 20)));
    }

    #[test]
    fn test_tombstone_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mods = dir.path().join("0-0-0.seg.mods");
        let t1 = Tombstone::new(SeriesPath::new("root.sg.d1", "s0"), 49, 10_000);
        let t2 = Tombstone::new(SeriesPath::new("root.sg.d1", "s1"), 120, 10_001);
        append_tombstone(&mods, &t1).unwrap();
        append_tombstone(&mods, &t2).unwrap();
        assert_eq!(read_tombstones(&mods).unwrap(), vec![t1.clone(), t2]);

        // A torn trailing record is ignored, complete records survive.
        {
            use std::io::Write as _;
            let mut f = OpenOptions::new().append(true).open(&mods).unwrap();
            f.write_all(&[9, 0, 0, 0, b'x']).unwrap();
        }
        let back = read_tombstones(&mods).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0], t1);
    }
}
