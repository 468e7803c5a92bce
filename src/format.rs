//! Concrete segment file codec.
//!
//! A segment file is `[magic][version]` followed by self-describing chunk
//! records, an index section, and a fixed-size footer pointing at the index.
//! Chunks being self-describing is what makes crash recovery cheap: a writer
//! opened on a truncated file rebuilds its index by a sequential scan.
//!
//! Record layout (little-endian throughout):
//! `[device][measurement]` as length-prefixed strings, `data_type u8`,
//! `version i64`, `point_count u32`, `start_time i64`, `end_time i64`,
//! `payload_len u32`, payload (timestamps then values), `crc32` of the payload.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use crc32fast::Hasher as Crc32;

use crate::error::MergeError;
use crate::segment::ResourceDescriptor;
use crate::types::{DataType, FieldValue, SeriesPath, TimeValuePair, Timestamp, NO_DELETION};

const SEG_MAGIC: &[u8; 8] = b"SMRSEG01";
const SEG_FOOTER_MAGIC: &[u8; 8] = b"SMRSEGF1";
const SEG_VERSION: u32 = 1;

const HEADER_LEN: u64 = 8 + 4;
// index_off + index_len + index crc32 + footer magic
const FOOTER_LEN: u64 = 8 + 8 + 4 + 8;

/// Metadata of one chunk as recorded in the segment index.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMetadata {
    pub series: SeriesPath,
    pub data_type: DataType,
    /// Offset of the chunk record within the file.
    pub offset: u64,
    /// On-disk size of the whole record in bytes.
    pub size: u32,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub point_count: u32,
    /// Write version of the chunk; newer versions win at tie timestamps.
    pub version: i64,
    /// Merge-time tombstone annotation; `NO_DELETION` when the chunk is live.
    /// Never persisted.
    pub deleted_at: Timestamp,
}

impl ChunkMetadata {
    pub fn is_tombstoned(&self) -> bool {
        self.deleted_at > NO_DELETION
    }
}

/// One fetched chunk: its metadata plus the raw on-disk record. Cloning is
/// cheap (`Bytes`), which lets the shared chunk provider hand the same fetch
/// to several sub-workers.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub meta: ChunkMetadata,
    pub raw: Bytes,
}

impl Chunk {
    /// Decodes the payload into points, eliding points covered by the chunk's
    /// tombstone annotation.
    pub fn decode(&self) -> Result<Vec<TimeValuePair>, MergeError> {
        let payload = self.payload()?;
        let mut points = decode_payload(payload, self.meta.data_type, self.meta.point_count)?;
        if self.meta.is_tombstoned() {
            points.retain(|p| p.timestamp > self.meta.deleted_at);
        }
        Ok(points)
    }

    fn payload(&self) -> Result<&[u8], MergeError> {
        let header_len = record_header_len(&self.meta.series);
        let payload_len = (self.meta.size as usize)
            .checked_sub(header_len + 4)
            .ok_or_else(|| self.corruption("record shorter than its header"))?;
        self.raw
            .get(header_len..header_len + payload_len)
            .ok_or_else(|| self.corruption("record truncated"))
    }

    fn corruption(&self, what: &str) -> MergeError {
        MergeError::Corruption {
            details: format!("Chunk at offset {}: {}", self.meta.offset, what),
            series: Some(self.meta.series.to_string()),
            timestamp: Some(self.meta.start_time),
        }
    }
}

fn record_header_len(series: &SeriesPath) -> usize {
    4 + series.device.len() + 4 + series.measurement.len() + 1 + 8 + 4 + 8 + 8 + 4
}

/// Checks whether a file carries a valid footer (i.e. was sealed).
pub fn is_sealed(path: &Path) -> Result<bool, MergeError> {
    let Ok(mut file) = File::open(path) else {
        return Ok(false);
    };
    let len = file.metadata()?.len();
    if len < HEADER_LEN + FOOTER_LEN {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
    let mut footer = [0u8; FOOTER_LEN as usize];
    file.read_exact(&mut footer)?;
    Ok(&footer[20..28] == SEG_FOOTER_MAGIC)
}

/// Read handle over one sealed segment file. Shared-read: chunk fetches lock
/// the underlying file handle only for the duration of one positioned read.
#[derive(Debug)]
pub struct SegmentReader {
    path: PathBuf,
    file: Mutex<File>,
    index: BTreeMap<SeriesPath, Vec<ChunkMetadata>>,
    index_offset: u64,
    index_len: u64,
    file_size: u64,
}

impl SegmentReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MergeError> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_size = file.metadata()?.len();
        if file_size < HEADER_LEN + FOOTER_LEN {
            return Err(corruption(&path, "file too short for header and footer"));
        }

        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if &magic != SEG_MAGIC {
            return Err(corruption(&path, "bad segment magic"));
        }

        file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
        let mut footer = [0u8; FOOTER_LEN as usize];
        file.read_exact(&mut footer)?;
        if &footer[20..28] != SEG_FOOTER_MAGIC {
            return Err(corruption(&path, "bad footer magic (file not sealed)"));
        }
        let index_offset = u64::from_le_bytes(footer[0..8].try_into().unwrap_or_default());
        let index_len = u64::from_le_bytes(footer[8..16].try_into().unwrap_or_default());
        let expected_crc = u32::from_le_bytes(footer[16..20].try_into().unwrap_or_default());

        if index_offset < HEADER_LEN || index_offset + index_len + FOOTER_LEN != file_size {
            return Err(corruption(&path, "footer index range out of bounds"));
        }

        file.seek(SeekFrom::Start(index_offset))?;
        let mut index_bytes = vec![0u8; index_len as usize];
        file.read_exact(&mut index_bytes)?;

        let mut hasher = Crc32::new();
        hasher.update(&index_bytes);
        if hasher.finalize() != expected_crc {
            return Err(corruption(&path, "index CRC mismatch"));
        }

        let index = decode_index(&index_bytes).map_err(|e| match e {
            MergeError::Corruption { details, series, timestamp } => MergeError::Corruption {
                details: format!("{}: {}", path.display(), details),
                series,
                timestamp,
            },
            other => other,
        })?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            index,
            index_offset,
            index_len,
            file_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Chunk metadata of one series, ordered by start time. Not cached by the
    /// reader; callers fetch once per series per merge.
    pub fn chunk_metadata(&self, series: &SeriesPath) -> Vec<ChunkMetadata> {
        self.index.get(series).cloned().unwrap_or_default()
    }

    pub fn all_series(&self) -> Vec<SeriesPath> {
        self.index.keys().cloned().collect()
    }

    pub fn devices(&self) -> BTreeSet<String> {
        self.index.keys().map(|s| s.device.clone()).collect()
    }

    /// Size of the index section; the loose memory-cost estimate of reading
    /// this file during a merge.
    pub fn metadata_size(&self) -> u64 {
        self.index_len
    }

    /// Byte offset where chunk data ends and the index begins. This is the
    /// truncation point an inplace commit records before force-appending.
    pub fn data_end_offset(&self) -> u64 {
        self.index_offset
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Largest single chunk record in the file (tight-bound read cost).
    pub fn max_chunk_size(&self) -> u64 {
        self.index
            .values()
            .flat_map(|metas| metas.iter().map(|m| m.size as u64))
            .max()
            .unwrap_or(0)
    }

    /// Total index bytes attributable to one series (tight-bound estimate).
    pub fn series_metadata_size(&self, series: &SeriesPath) -> u64 {
        self.index
            .get(series)
            .map(|metas| metas.iter().map(|m| index_entry_len(&m.series) as u64).sum())
            .unwrap_or(0)
    }

    /// Fetches one chunk record and verifies its payload checksum.
    pub fn read_chunk(&self, meta: &ChunkMetadata) -> Result<Chunk, MergeError> {
        let mut buf = vec![0u8; meta.size as usize];
        {
            let mut file = self.file.lock()?;
            file.seek(SeekFrom::Start(meta.offset))?;
            file.read_exact(&mut buf)?;
        }

        let header_len = record_header_len(&meta.series);
        let payload_end = (meta.size as usize).saturating_sub(4);
        if payload_end <= header_len {
            return Err(corruption(&self.path, "chunk record shorter than its header"));
        }
        let mut hasher = Crc32::new();
        hasher.update(&buf[header_len..payload_end]);
        let expected =
            u32::from_le_bytes(buf[payload_end..].try_into().unwrap_or_default());
        if hasher.finalize() != expected {
            return Err(MergeError::Corruption {
                details: format!(
                    "Chunk payload CRC mismatch in {} at offset {}",
                    self.path.display(),
                    meta.offset
                ),
                series: Some(meta.series.to_string()),
                timestamp: Some(meta.start_time),
            });
        }

        Ok(Chunk { meta: meta.clone(), raw: Bytes::from(buf) })
    }

    /// Derives a resource descriptor from the index (used when a sidecar is
    /// missing).
    pub fn build_descriptor(&self) -> ResourceDescriptor {
        let mut descriptor = ResourceDescriptor::default();
        for metas in self.index.values() {
            for meta in metas {
                descriptor.expand(&meta.series.device, meta.start_time, meta.end_time);
            }
        }
        descriptor
    }
}

/// Write handle building or rewriting one segment file.
#[derive(Debug)]
pub struct SegmentWriter {
    path: PathBuf,
    file: BufWriter<File>,
    pos: u64,
    index: BTreeMap<SeriesPath, Vec<ChunkMetadata>>,
}

impl SegmentWriter {
    /// Creates a fresh file, truncating anything already at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, MergeError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .read(true)
            .open(&path)?;
        let mut w = BufWriter::new(file);
        w.write_all(SEG_MAGIC)?;
        w.write_all(&SEG_VERSION.to_le_bytes())?;
        Ok(Self {
            path,
            file: w,
            pos: HEADER_LEN,
            index: BTreeMap::new(),
        })
    }

    /// Opens an unsealed (crashed or truncated) file for appending. Scans the
    /// chunk records sequentially, truncates off any torn tail, and rebuilds
    /// the index from what survived.
    pub fn restore(path: impl AsRef<Path>) -> Result<Self, MergeError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if &magic != SEG_MAGIC {
            return Err(corruption(&path, "bad segment magic"));
        }
        file.seek(SeekFrom::Start(HEADER_LEN))?;

        let mut index: BTreeMap<SeriesPath, Vec<ChunkMetadata>> = BTreeMap::new();
        let mut pos = HEADER_LEN;
        loop {
            match scan_record(&mut file, pos) {
                Ok(Some(meta)) => {
                    pos = meta.offset + meta.size as u64;
                    index.entry(meta.series.clone()).or_default().push(meta);
                }
                Ok(None) | Err(_) => break,
            }
        }

        file.set_len(pos)?;
        file.seek(SeekFrom::Start(pos))?;
        Ok(Self {
            path,
            file: BufWriter::new(file),
            pos,
            index,
        })
    }

    /// Opens a **sealed** file for in-place appending: truncates off the index
    /// and footer, keeping the existing chunk index in memory so merged chunks
    /// can later be filtered out of it. Returns the writer and the truncation
    /// position (== the old data end).
    pub fn force_append(path: impl AsRef<Path>) -> Result<(Self, u64), MergeError> {
        let path = path.as_ref().to_path_buf();
        let reader = SegmentReader::open(&path)?;
        let truncate_pos = reader.data_end_offset();
        let index = reader.index.clone();
        drop(reader);

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.set_len(truncate_pos)?;
        file.seek(SeekFrom::Start(truncate_pos))?;

        Ok((
            Self {
                path,
                file: BufWriter::new(file),
                pos: truncate_pos,
                index,
            },
            truncate_pos,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current append position (journaled as the file position marker).
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Drops chunks from the in-memory index unless their `(series, start
    /// time)` is listed in `keep`. Chunk bytes stay in the file as dead space;
    /// only the index decides visibility.
    pub fn retain_chunks(&mut self, keep: &HashMap<SeriesPath, Vec<Timestamp>>) {
        for (series, metas) in self.index.iter_mut() {
            let keep_times = keep.get(series);
            metas.retain(|m| {
                keep_times
                    .map(|times| times.contains(&m.start_time))
                    .unwrap_or(false)
            });
        }
        self.index.retain(|_, metas| !metas.is_empty());
    }

    /// Serializes points as a new chunk. Returns `None` for an empty batch.
    pub fn append_points(
        &mut self,
        series: &SeriesPath,
        data_type: DataType,
        version: i64,
        points: &[TimeValuePair],
    ) -> Result<Option<ChunkMetadata>, MergeError> {
        if points.is_empty() {
            return Ok(None);
        }
        let payload = encode_payload(points, data_type)?;

        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let start_time = points[0].timestamp;
        let end_time = points[points.len() - 1].timestamp;
        let header_len = record_header_len(series);
        let size = (header_len + payload.len() + 4) as u32;

        write_string(&mut self.file, &series.device)?;
        write_string(&mut self.file, &series.measurement)?;
        self.file.write_all(&[data_type.tag()])?;
        self.file.write_all(&version.to_le_bytes())?;
        self.file.write_all(&(points.len() as u32).to_le_bytes())?;
        self.file.write_all(&start_time.to_le_bytes())?;
        self.file.write_all(&end_time.to_le_bytes())?;
        self.file.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.file.write_all(&payload)?;
        self.file.write_all(&crc.to_le_bytes())?;

        let meta = ChunkMetadata {
            series: series.clone(),
            data_type,
            offset: self.pos,
            size,
            start_time,
            end_time,
            point_count: points.len() as u32,
            version,
            deleted_at: NO_DELETION,
        };
        self.pos += size as u64;
        self.index.entry(series.clone()).or_default().push(meta.clone());
        Ok(Some(meta))
    }

    /// Appends a fetched chunk verbatim, without decoding its payload.
    pub fn append_raw(&mut self, chunk: &Chunk) -> Result<ChunkMetadata, MergeError> {
        self.file.write_all(&chunk.raw)?;
        let meta = ChunkMetadata {
            offset: self.pos,
            deleted_at: NO_DELETION,
            ..chunk.meta.clone()
        };
        self.pos += chunk.meta.size as u64;
        self.index
            .entry(meta.series.clone())
            .or_default()
            .push(meta.clone());
        Ok(meta)
    }

    /// Devices present in the chunks written so far, with their time ranges.
    pub fn build_descriptor(&self) -> ResourceDescriptor {
        let mut descriptor = ResourceDescriptor::default();
        for metas in self.index.values() {
            for meta in metas {
                descriptor.expand(&meta.series.device, meta.start_time, meta.end_time);
            }
        }
        descriptor
    }

    /// Series currently visible in the writer's index, with their chunk lists
    /// ordered by start time.
    pub fn indexed_chunks(&self) -> &BTreeMap<SeriesPath, Vec<ChunkMetadata>> {
        &self.index
    }

    /// Writes the index and footer, making the file a sealed segment. Returns
    /// the descriptor derived from the final index.
    pub fn seal(mut self) -> Result<ResourceDescriptor, MergeError> {
        // Chunks within a series must be indexed in start-time order even when
        // appends interleaved (sub-workers write under a shared lock).
        for metas in self.index.values_mut() {
            metas.sort_by_key(|m| (m.start_time, m.version));
        }

        let index_bytes = encode_index(&self.index)?;
        let mut hasher = Crc32::new();
        hasher.update(&index_bytes);
        let crc = hasher.finalize();

        let index_offset = self.pos;
        self.file.write_all(&index_bytes)?;
        self.file.write_all(&index_offset.to_le_bytes())?;
        self.file.write_all(&(index_bytes.len() as u64).to_le_bytes())?;
        self.file.write_all(&crc.to_le_bytes())?;
        self.file.write_all(SEG_FOOTER_MAGIC)?;
        self.file.flush()?;
        self.file.get_ref().sync_data()?;

        let descriptor = self.build_descriptor();
        Ok(descriptor)
    }

    /// Flushes buffered bytes without sealing (crash-consistency point for the
    /// journal's file-position markers).
    pub fn sync(&mut self) -> Result<(), MergeError> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }

    /// Abandons the file, deleting it from disk.
    pub fn abort(self) -> Result<(), MergeError> {
        let path = self.path.clone();
        drop(self);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

/// Reads the index offset of a sealed file without mutating it; journaled as
/// the truncation position before a force-append begins.
pub fn sealed_data_end(path: &Path) -> Result<u64, MergeError> {
    let reader = SegmentReader::open(path)?;
    Ok(reader.data_end_offset())
}

fn corruption(path: &Path, what: &str) -> MergeError {
    MergeError::Corruption {
        details: format!("{}: {}", path.display(), what),
        series: None,
        timestamp: None,
    }
}

fn scan_record(file: &mut File, offset: u64) -> Result<Option<ChunkMetadata>, MergeError> {
    let mut u32buf = [0u8; 4];
    match file.read_exact(&mut u32buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(MergeError::Io(e)),
    }
    let device_len = u32::from_le_bytes(u32buf) as usize;
    if device_len > 1 << 20 {
        return Ok(None);
    }
    let mut device = vec![0u8; device_len];
    if file.read_exact(&mut device).is_err() {
        return Ok(None);
    }
    if file.read_exact(&mut u32buf).is_err() {
        return Ok(None);
    }
    let measurement_len = u32::from_le_bytes(u32buf) as usize;
    if measurement_len > 1 << 20 {
        return Ok(None);
    }
    let mut measurement = vec![0u8; measurement_len];
    if file.read_exact(&mut measurement).is_err() {
        return Ok(None);
    }

    let mut tag = [0u8; 1];
    if file.read_exact(&mut tag).is_err() {
        return Ok(None);
    }
    let Ok(data_type) = DataType::from_tag(tag[0]) else {
        return Ok(None);
    };

    let mut i64buf = [0u8; 8];
    if file.read_exact(&mut i64buf).is_err() {
        return Ok(None);
    }
    let version = i64::from_le_bytes(i64buf);
    if file.read_exact(&mut u32buf).is_err() {
        return Ok(None);
    }
    let point_count = u32::from_le_bytes(u32buf);
    if file.read_exact(&mut i64buf).is_err() {
        return Ok(None);
    }
    let start_time = i64::from_le_bytes(i64buf);
    if file.read_exact(&mut i64buf).is_err() {
        return Ok(None);
    }
    let end_time = i64::from_le_bytes(i64buf);
    if file.read_exact(&mut u32buf).is_err() {
        return Ok(None);
    }
    let payload_len = u32::from_le_bytes(u32buf) as usize;

    let mut payload = vec![0u8; payload_len];
    if file.read_exact(&mut payload).is_err() {
        return Ok(None);
    }
    if file.read_exact(&mut u32buf).is_err() {
        return Ok(None);
    }
    let expected_crc = u32::from_le_bytes(u32buf);
    let mut hasher = Crc32::new();
    hasher.update(&payload);
    if hasher.finalize() != expected_crc {
        return Ok(None);
    }

    let device = String::from_utf8(device).map_err(|_| {
        MergeError::Corruption {
            details: "Invalid UTF-8 in device name".to_string(),
            series: None,
            timestamp: None,
        }
    })?;
    let measurement = String::from_utf8(measurement).map_err(|_| {
        MergeError::Corruption {
            details: "Invalid UTF-8 in measurement name".to_string(),
            series: None,
            timestamp: None,
        }
    })?;
    let series = SeriesPath::new(device, measurement);
    let size = (record_header_len(&series) + payload_len + 4) as u32;

    Ok(Some(ChunkMetadata {
        series,
        data_type,
        offset,
        size,
        start_time,
        end_time,
        point_count,
        version,
        deleted_at: NO_DELETION,
    }))
}

fn index_entry_len(series: &SeriesPath) -> usize {
    4 + series.device.len() + 4 + series.measurement.len() + 8 + 4 + 1 + 8 + 4 + 8 + 8
}

fn encode_index(
    index: &BTreeMap<SeriesPath, Vec<ChunkMetadata>>,
) -> Result<Vec<u8>, MergeError> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(index.len() as u32).to_le_bytes());
    for (series, metas) in index {
        write_string(&mut buf, &series.device)?;
        write_string(&mut buf, &series.measurement)?;
        buf.extend_from_slice(&(metas.len() as u32).to_le_bytes());
        for meta in metas {
            buf.extend_from_slice(&meta.offset.to_le_bytes());
            buf.extend_from_slice(&meta.size.to_le_bytes());
            buf.push(meta.data_type.tag());
            buf.extend_from_slice(&meta.version.to_le_bytes());
            buf.extend_from_slice(&meta.point_count.to_le_bytes());
            buf.extend_from_slice(&meta.start_time.to_le_bytes());
            buf.extend_from_slice(&meta.end_time.to_le_bytes());
        }
    }
    Ok(buf)
}

fn decode_index(
    bytes: &[u8],
) -> Result<BTreeMap<SeriesPath, Vec<ChunkMetadata>>, MergeError> {
    let mut cur = io::Cursor::new(bytes);
    let series_count = read_u32(&mut cur)? as usize;
    let mut index = BTreeMap::new();
    for _ in 0..series_count {
        let device = read_string(&mut cur)?;
        let measurement = read_string(&mut cur)?;
        let series = SeriesPath::new(device, measurement);
        let chunk_count = read_u32(&mut cur)? as usize;
        let mut metas = Vec::with_capacity(chunk_count);
        for _ in 0..chunk_count {
            let offset = read_u64(&mut cur)?;
            let size = read_u32(&mut cur)?;
            let mut tag = [0u8; 1];
            cur.read_exact(&mut tag)?;
            let data_type = DataType::from_tag(tag[0])?;
            let version = read_i64(&mut cur)?;
            let point_count = read_u32(&mut cur)?;
            let start_time = read_i64(&mut cur)?;
            let end_time = read_i64(&mut cur)?;
            metas.push(ChunkMetadata {
                series: series.clone(),
                data_type,
                offset,
                size,
                start_time,
                end_time,
                point_count,
                version,
                deleted_at: NO_DELETION,
            });
        }
        index.insert(series, metas);
    }
    Ok(index)
}

fn encode_payload(
    points: &[TimeValuePair],
    data_type: DataType,
) -> Result<Vec<u8>, MergeError> {
    let mut buf = Vec::with_capacity(points.len() * 16);
    for p in points {
        buf.extend_from_slice(&p.timestamp.to_le_bytes());
    }
    for p in points {
        match (data_type, &p.value) {
            (DataType::Bool, FieldValue::Bool(v)) => buf.push(*v as u8),
            (DataType::Int32, FieldValue::Int32(v)) => buf.extend_from_slice(&v.to_le_bytes()),
            (DataType::Int64, FieldValue::Int64(v)) => buf.extend_from_slice(&v.to_le_bytes()),
            (DataType::Float32, FieldValue::Float32(v)) => {
                buf.extend_from_slice(&v.to_le_bytes())
            }
            (DataType::Float64, FieldValue::Float64(v)) => {
                buf.extend_from_slice(&v.to_le_bytes())
            }
            (DataType::Text, FieldValue::Text(v)) => {
                buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
                buf.extend_from_slice(v.as_bytes());
            }
            (expected, got) => {
                return Err(MergeError::Internal(format!(
                    "Point value {:?} does not match chunk data type {:?}",
                    got, expected
                )))
            }
        }
    }
    Ok(buf)
}

fn decode_payload(
    payload: &[u8],
    data_type: DataType,
    point_count: u32,
) -> Result<Vec<TimeValuePair>, MergeError> {
    let n = point_count as usize;
    let mut cur = io::Cursor::new(payload);
    let mut timestamps = Vec::with_capacity(n);
    for _ in 0..n {
        timestamps.push(read_i64(&mut cur)?);
    }
    let mut points = Vec::with_capacity(n);
    for ts in timestamps {
        let value = match data_type {
            DataType::Bool => {
                let mut b = [0u8; 1];
                cur.read_exact(&mut b)?;
                FieldValue::Bool(b[0] != 0)
            }
            DataType::Int32 => {
                let mut b = [0u8; 4];
                cur.read_exact(&mut b)?;
                FieldValue::Int32(i32::from_le_bytes(b))
            }
            DataType::Int64 => FieldValue::Int64(read_i64(&mut cur)?),
            DataType::Float32 => {
                let mut b = [0u8; 4];
                cur.read_exact(&mut b)?;
                FieldValue::Float32(f32::from_le_bytes(b))
            }
            DataType::Float64 => {
                let mut b = [0u8; 8];
                cur.read_exact(&mut b)?;
                FieldValue::Float64(f64::from_le_bytes(b))
            }
            DataType::Text => FieldValue::Text(read_string(&mut cur)?),
        };
        points.push(TimeValuePair::new(ts, value));
    }
    Ok(points)
}

fn write_string<W: Write>(w: &mut W, s: &str) -> Result<(), MergeError> {
    w.write_all(&(s.len() as u32).to_le_bytes())?;
    w.write_all(s.as_bytes())?;
    Ok(())
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
        details: format!("Invalid UTF-8 in segment index: {}", e),
        series: None,
        timestamp: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn f64_points(range: std::ops::Range<i64>, offset: f64) -> Vec<TimeValuePair> {
        range
            .map(|t| TimeValuePair::new(t, FieldValue::Float64(t as f64 + offset)))
            .collect()
    }

    #[test]
    fn test_write_seal_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("1-1-0.seg");
        let series = SeriesPath::new("root.sg.d1", "s0");

        let mut writer = SegmentWriter::create(&path).unwrap();
        writer
            .append_points(&series, DataType::Float64, 1, &f64_points(0..100, 0.0))
            .unwrap();
        writer
            .append_points(&series, DataType::Float64, 1, &f64_points(100..150, 0.0))
            .unwrap();
        writer.seal().unwrap();

        assert!(is_sealed(&path).unwrap());
        let reader = SegmentReader::open(&path).unwrap();
        let metas = reader.chunk_metadata(&series);
        assert_eq!(metas.len(), 2);
        assert_eq!(metas[0].start_time, 0);
        assert_eq!(metas[0].end_time, 99);
        assert_eq!(metas[0].point_count, 100);
        assert_eq!(metas[1].start_time, 100);

        let chunk = reader.read_chunk(&metas[0]).unwrap();
        let points = chunk.decode().unwrap();
        assert_eq!(points.len(), 100);
        assert_eq!(points[7], TimeValuePair::new(7, FieldValue::Float64(7.0)));
    }

    #[test]
    fn test_decode_honours_deleted_at() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("1-1-0.seg");
        let series = SeriesPath::new("root.sg.d1", "s0");

        let mut writer = SegmentWriter::create(&path).unwrap();
        writer
            .append_points(&series, DataType::Float64, 1, &f64_points(0..100, 0.0))
            .unwrap();
        writer.seal().unwrap();

        let reader = SegmentReader::open(&path).unwrap();
        let mut meta = reader.chunk_metadata(&series).remove(0);
        meta.deleted_at = 49;
        let points = reader.read_chunk(&meta).unwrap().decode().unwrap();
        assert_eq!(points.len(), 50);
        assert_eq!(points[0].timestamp, 50);
    }

    #[test]
    fn test_corrupt_payload_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("1-1-0.seg");
        let series = SeriesPath::new("root.sg.d1", "s0");

        let mut writer = SegmentWriter::create(&path).unwrap();
        let meta = writer
            .append_points(&series, DataType::Int64, 1, &[
                TimeValuePair::new(1, FieldValue::Int64(10)),
                TimeValuePair::new(2, FieldValue::Int64(20)),
            ])
            .unwrap()
            .unwrap();
        writer.seal().unwrap();

        // Flip one payload byte on disk.
        {
            let mut f = OpenOptions::new().write(true).open(&path).unwrap();
            let payload_off = meta.offset + record_header_len(&series) as u64 + 3;
            f.seek(SeekFrom::Start(payload_off)).unwrap();
            f.write_all(&[0xFF]).unwrap();
        }

        let reader = SegmentReader::open(&path).unwrap();
        let metas = reader.chunk_metadata(&series);
        match reader.read_chunk(&metas[0]) {
            Err(MergeError::Corruption { .. }) => {}
            other => panic!("expected corruption, got {:?}", other),
        }
    }

    #[test]
    fn test_restore_drops_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("1-1-0.seg");
        let series = SeriesPath::new("root.sg.d1", "s0");

        let mut writer = SegmentWriter::create(&path).unwrap();
        writer
            .append_points(&series, DataType::Float64, 1, &f64_points(0..10, 0.0))
            .unwrap();
        writer
            .append_points(&series, DataType::Float64, 1, &f64_points(10..20, 0.0))
            .unwrap();
        writer.sync().unwrap();
        let end = writer.position();
        drop(writer);

        // Simulate a crash mid-append: half a record of garbage at the end.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[3, 0, 0, 0, b'x', b'y']).unwrap();
        }

        let restored = SegmentWriter::restore(&path).unwrap();
        assert_eq!(restored.position(), end);
        assert_eq!(restored.indexed_chunks().get(&series).unwrap().len(), 2);

        let descriptor = restored.seal().unwrap();
        assert_eq!(descriptor.device_range("root.sg.d1"), Some((0, 19)));
        assert!(SegmentReader::open(&path).is_ok());
    }

    #[test]
    fn test_force_append_and_retain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("1-1-0.seg");
        let series = SeriesPath::new("root.sg.d1", "s0");

        let mut writer = SegmentWriter::create(&path).unwrap();
        writer
            .append_points(&series, DataType::Float64, 1, &f64_points(0..10, 0.0))
            .unwrap();
        writer
            .append_points(&series, DataType::Float64, 1, &f64_points(10..20, 0.0))
            .unwrap();
        writer.seal().unwrap();
        let data_end = sealed_data_end(&path).unwrap();

        let (mut writer, truncate_pos) = SegmentWriter::force_append(&path).unwrap();
        assert_eq!(truncate_pos, data_end);

        // Keep only the first original chunk, then append a replacement for the rest.
        let mut keep = HashMap::new();
        keep.insert(series.clone(), vec![0]);
        writer.retain_chunks(&keep);
        writer
            .append_points(&series, DataType::Float64, 2, &f64_points(10..30, 100.0))
            .unwrap();
        writer.seal().unwrap();

        let reader = SegmentReader::open(&path).unwrap();
        let metas = reader.chunk_metadata(&series);
        assert_eq!(metas.len(), 2);
        assert_eq!(metas[0].start_time, 0);
        assert_eq!(metas[1].start_time, 10);
        assert_eq!(metas[1].version, 2);
        let points = reader.read_chunk(&metas[1]).unwrap().decode().unwrap();
        assert_eq!(points[0], TimeValuePair::new(10, FieldValue::Float64(110.0)));
    }

    #[test]
    fn test_append_raw_copies_verbatim() {
        let dir = tempdir().unwrap();
        let src_path = dir.path().join("1-1-0.seg");
        let dst_path = dir.path().join("2-1-0.seg");
        let series = SeriesPath::new("root.sg.d1", "s0");

        let mut writer = SegmentWriter::create(&src_path).unwrap();
        writer
            .append_points(&series, DataType::Text, 3, &[
                TimeValuePair::new(5, FieldValue::Text("hello".into())),
                TimeValuePair::new(6, FieldValue::Text("world".into())),
            ])
            .unwrap();
        writer.seal().unwrap();

        let reader = SegmentReader::open(&src_path).unwrap();
        let chunk = reader
            .read_chunk(&reader.chunk_metadata(&series)[0])
            .unwrap();

        let mut dst = SegmentWriter::create(&dst_path).unwrap();
        dst.append_raw(&chunk).unwrap();
        dst.seal().unwrap();

        let back = SegmentReader::open(&dst_path).unwrap();
        let metas = back.chunk_metadata(&series);
        assert_eq!(metas[0].version, 3);
        let points = back.read_chunk(&metas[0]).unwrap().decode().unwrap();
        assert_eq!(points[1], TimeValuePair::new(6, FieldValue::Text("world".into())));
    }
}
