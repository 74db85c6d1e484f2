//! Chunked binary record files.
//!
//! Each chunk file holds up to `chunk_size` records:
//!
//! ```text
//! magic "TTRC" | version u8 | mode u8 | count u32
//! per record: channels u32 | rows u32 | cols u32 | samples u16 * (channels*rows*cols)
//!             training:   label u32
//!             prediction: row_offset u32 | col_offset u32
//! ```
//!
//! All integers are little endian. Files are named `{basename}_{index:05}.tilerec`;
//! [`list_chunks`] orders them by the numeric index, which reproduces write
//! order past five digits too.

use crate::config::RecordConfig;
use crate::error::{Result, TreeTileError};
use crate::tiling::Window;
use log::{debug, info};
use ndarray::Array3;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"TTRC";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: u64 = 10;
pub const CHUNK_EXTENSION: &str = "tilerec";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMode {
    Training,
    Prediction,
}

impl RecordMode {
    fn to_byte(self) -> u8 {
        match self {
            RecordMode::Training => 0,
            RecordMode::Prediction => 1,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(RecordMode::Training),
            1 => Some(RecordMode::Prediction),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordTarget {
    Label(u16),
    Offset { row_offset: usize, col_offset: usize },
}

/// One serialized window with either its training label or its raster offset.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub pixels: Array3<u16>,
    pub target: RecordTarget,
}

impl Record {
    pub fn training(window: Window, label: u16) -> Self {
        Self {
            pixels: window.pixels,
            target: RecordTarget::Label(label),
        }
    }

    pub fn prediction(window: Window) -> Self {
        Self {
            target: RecordTarget::Offset {
                row_offset: window.row_offset,
                col_offset: window.col_offset,
            },
            pixels: window.pixels,
        }
    }

    pub fn mode(&self) -> RecordMode {
        match self.target {
            RecordTarget::Label(_) => RecordMode::Training,
            RecordTarget::Offset { .. } => RecordMode::Prediction,
        }
    }

    pub fn label(&self) -> Option<u16> {
        match self.target {
            RecordTarget::Label(label) => Some(label),
            RecordTarget::Offset { .. } => None,
        }
    }

    pub fn offset(&self) -> Option<(usize, usize)> {
        match self.target {
            RecordTarget::Offset {
                row_offset,
                col_offset,
            } => Some((row_offset, col_offset)),
            RecordTarget::Label(_) => None,
        }
    }
}

pub fn chunk_path(dest: &Path, basename: &str, index: usize) -> PathBuf {
    dest.join(format!("{}_{:05}.{}", basename, index, CHUNK_EXTENSION))
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| TreeTileError::InvalidRecord(format!("{} {} does not fit in u32", what, value)))
}

fn encode_record(writer: &mut impl Write, record: &Record) -> Result<()> {
    let (channels, rows, cols) = record.pixels.dim();
    writer.write_all(&to_u32(channels, "channel count")?.to_le_bytes())?;
    writer.write_all(&to_u32(rows, "row count")?.to_le_bytes())?;
    writer.write_all(&to_u32(cols, "column count")?.to_le_bytes())?;

    let mut samples = Vec::with_capacity(record.pixels.len() * 2);
    for value in record.pixels.iter() {
        samples.extend_from_slice(&value.to_le_bytes());
    }
    writer.write_all(&samples)?;

    match record.target {
        RecordTarget::Label(label) => {
            writer.write_all(&u32::from(label).to_le_bytes())?;
        }
        RecordTarget::Offset {
            row_offset,
            col_offset,
        } => {
            writer.write_all(&to_u32(row_offset, "row offset")?.to_le_bytes())?;
            writer.write_all(&to_u32(col_offset, "column offset")?.to_le_bytes())?;
        }
    }
    Ok(())
}

fn write_chunk(path: &Path, records: &[Record]) -> Result<()> {
    let mode = records
        .first()
        .map(Record::mode)
        .ok_or_else(|| TreeTileError::InvalidRecord("refusing to write an empty chunk".to_string()))?;
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(MAGIC)?;
    writer.write_all(&[FORMAT_VERSION, mode.to_byte()])?;
    writer.write_all(&to_u32(records.len(), "record count")?.to_le_bytes())?;
    for record in records {
        encode_record(&mut writer, record)?;
    }
    writer.flush()?;
    debug!("Wrote {} records to {}", records.len(), path.display());
    Ok(())
}

/// Stream records into chunk files of `config.chunk_size` (the last chunk may
/// be shorter). All records must share one mode. Returns paths in write order.
pub fn write_records<I>(records: I, config: &RecordConfig, dest: &Path) -> Result<Vec<PathBuf>>
where
    I: IntoIterator<Item = Record>,
{
    fs::create_dir_all(dest)?;

    let mut paths = Vec::new();
    let mut buffer: Vec<Record> = Vec::with_capacity(config.chunk_size);
    let mut mode: Option<RecordMode> = None;
    let mut total = 0usize;

    for record in records {
        match mode {
            None => mode = Some(record.mode()),
            Some(m) if m != record.mode() => {
                return Err(TreeTileError::ShapeMismatch(format!(
                    "cannot mix {:?} and {:?} records in one dataset",
                    m,
                    record.mode()
                )));
            }
            Some(_) => {}
        }
        buffer.push(record);
        if buffer.len() == config.chunk_size {
            let path = chunk_path(dest, &config.basename, paths.len());
            write_chunk(&path, &buffer)?;
            total += buffer.len();
            buffer.clear();
            paths.push(path);
        }
    }

    if !buffer.is_empty() {
        let path = chunk_path(dest, &config.basename, paths.len());
        write_chunk(&path, &buffer)?;
        total += buffer.len();
        paths.push(path);
    }

    info!(
        "Wrote {} records in {} chunk files to {}",
        total,
        paths.len(),
        dest.display()
    );
    Ok(paths)
}

/// Training chunks: `labels` must be parallel to `windows`.
pub fn write_training<I>(
    windows: I,
    labels: &[u16],
    config: &RecordConfig,
    dest: &Path,
) -> Result<Vec<PathBuf>>
where
    I: IntoIterator<Item = Window>,
    I::IntoIter: ExactSizeIterator,
{
    let windows = windows.into_iter();
    if windows.len() != labels.len() {
        return Err(TreeTileError::ShapeMismatch(format!(
            "{} windows but {} labels",
            windows.len(),
            labels.len()
        )));
    }
    let records = windows
        .zip(labels.iter())
        .map(|(window, &label)| Record::training(window, label));
    write_records(records, config, dest)
}

/// Prediction chunks: each record carries its window offset.
pub fn write_prediction<I>(windows: I, config: &RecordConfig, dest: &Path) -> Result<Vec<PathBuf>>
where
    I: IntoIterator<Item = Window>,
{
    write_records(windows.into_iter().map(Record::prediction), config, dest)
}

/// Chunk index encoded in a `{basename}_{index}.tilerec` file name.
fn chunk_index(path: &Path, basename: &str) -> Option<usize> {
    let name = path.file_name()?.to_str()?;
    let digits = name
        .strip_prefix(basename)?
        .strip_prefix('_')?
        .strip_suffix(CHUNK_EXTENSION)?
        .strip_suffix('.')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Chunk files named `{basename}_{index}.tilerec` in `dir`, in index order.
pub fn list_chunks(dir: &Path, basename: &str) -> Result<Vec<PathBuf>> {
    let mut indexed: Vec<(usize, PathBuf)> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter_map(|path| chunk_index(&path, basename).map(|index| (index, path)))
        .collect();
    indexed.sort();
    let paths: Vec<PathBuf> = indexed.into_iter().map(|(_, path)| path).collect();
    debug!("Found {} chunk files for {} in {}", paths.len(), basename, dir.display());
    Ok(paths)
}

struct ChunkCursor {
    path: PathBuf,
    reader: BufReader<File>,
    remaining: u32,
    /// Bytes left in the file after everything decoded so far.
    unread: u64,
}

/// Lazily yields records from a list of chunk files, in file order and then
/// within-file order. Stops after the first error.
pub struct RecordReader {
    pending: VecDeque<PathBuf>,
    current: Option<ChunkCursor>,
    mode: Option<RecordMode>,
    failed: bool,
}

impl RecordReader {
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Self {
        Self {
            pending: paths.iter().map(|p| p.as_ref().to_path_buf()).collect(),
            current: None,
            mode: None,
            failed: false,
        }
    }

    /// Mode of the chunks read so far.
    pub fn mode(&self) -> Option<RecordMode> {
        self.mode
    }

    fn open_next(&mut self) -> Result<bool> {
        let Some(path) = self.pending.pop_front() else {
            return Ok(false);
        };
        let file = File::open(&path)?;
        let unread = file.metadata()?.len().saturating_sub(HEADER_LEN);
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        read_exact(&mut reader, &mut magic, &path)?;
        if &magic != MAGIC {
            return Err(TreeTileError::InvalidRecord(format!(
                "{} is not a tile record file",
                path.display()
            )));
        }

        let mut header = [0u8; 2];
        read_exact(&mut reader, &mut header, &path)?;
        if header[0] != FORMAT_VERSION {
            return Err(TreeTileError::InvalidRecord(format!(
                "{} has unsupported format version {}",
                path.display(),
                header[0]
            )));
        }
        let mode = RecordMode::from_byte(header[1]).ok_or_else(|| {
            TreeTileError::InvalidRecord(format!("{} has unknown mode {}", path.display(), header[1]))
        })?;
        match self.mode {
            None => self.mode = Some(mode),
            Some(m) if m != mode => {
                return Err(TreeTileError::InvalidRecord(format!(
                    "{} holds {:?} records but earlier chunks hold {:?}",
                    path.display(),
                    mode,
                    m
                )));
            }
            Some(_) => {}
        }

        let remaining = read_u32(&mut reader, &path)?;
        debug!("Reading {} records from {}", remaining, path.display());
        self.current = Some(ChunkCursor {
            path,
            reader,
            remaining,
            unread,
        });
        Ok(true)
    }

    fn read_next(&mut self) -> Result<Option<Record>> {
        loop {
            if let Some(cursor) = self.current.as_mut() {
                if cursor.remaining > 0 {
                    cursor.remaining -= 1;
                    let mode = self.mode.unwrap_or(RecordMode::Training);
                    let record = decode_record(&mut cursor.reader, &cursor.path, mode, &mut cursor.unread)?;
                    return Ok(Some(record));
                }
                let mut extra = [0u8; 1];
                if cursor.reader.read(&mut extra)? != 0 {
                    return Err(TreeTileError::InvalidRecord(format!(
                        "{} has trailing bytes after its last record",
                        cursor.path.display()
                    )));
                }
                self.current = None;
            }
            if !self.open_next()? {
                return Ok(None);
            }
        }
    }
}

impl Iterator for RecordReader {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.read_next() {
            Ok(record) => record.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Read every record from `paths` into memory.
pub fn read_records<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<Record>> {
    RecordReader::open(paths).collect()
}

fn read_exact(reader: &mut impl Read, buf: &mut [u8], path: &Path) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            TreeTileError::InvalidRecord(format!("{} is truncated", path.display()))
        } else {
            TreeTileError::Io(e)
        }
    })
}

fn read_u32(reader: &mut impl Read, path: &Path) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf, path)?;
    Ok(u32::from_le_bytes(buf))
}

/// Account for `len` more bytes of the current file, failing if the file is
/// shorter than that.
fn consume(unread: &mut u64, len: u64, path: &Path) -> Result<()> {
    *unread = unread
        .checked_sub(len)
        .ok_or_else(|| TreeTileError::InvalidRecord(format!("{} is truncated", path.display())))?;
    Ok(())
}

fn decode_record(reader: &mut impl Read, path: &Path, mode: RecordMode, unread: &mut u64) -> Result<Record> {
    consume(unread, 12, path)?;
    let channels = read_u32(reader, path)? as usize;
    let rows = read_u32(reader, path)? as usize;
    let cols = read_u32(reader, path)? as usize;

    let sample_count = channels
        .checked_mul(rows)
        .and_then(|n| n.checked_mul(cols))
        .filter(|&n| n > 0 && n <= (u32::MAX as usize))
        .ok_or_else(|| {
            TreeTileError::InvalidRecord(format!(
                "{} declares an invalid window shape {}x{}x{}",
                path.display(),
                channels,
                rows,
                cols
            ))
        })?;

    // Checked before allocating so a corrupt shape cannot request more
    // memory than the file could hold.
    consume(unread, sample_count as u64 * 2, path)?;
    let mut bytes = vec![0u8; sample_count * 2];
    read_exact(reader, &mut bytes, path)?;
    let samples: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let pixels = Array3::from_shape_vec((channels, rows, cols), samples)?;

    let target = match mode {
        RecordMode::Training => {
            consume(unread, 4, path)?;
            let label = read_u32(reader, path)?;
            let label = u16::try_from(label).map_err(|_| {
                TreeTileError::InvalidRecord(format!("{} has label {} out of range", path.display(), label))
            })?;
            RecordTarget::Label(label)
        }
        RecordMode::Prediction => {
            consume(unread, 8, path)?;
            RecordTarget::Offset {
                row_offset: read_u32(reader, path)? as usize,
                col_offset: read_u32(reader, path)? as usize,
            }
        }
    };

    Ok(Record { pixels, target })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn window(row_offset: usize, col_offset: usize, fill: u16) -> Window {
        Window {
            row_offset,
            col_offset,
            pixels: Array3::from_shape_fn((2, 3, 3), |(c, r, k)| fill + (c * 9 + r * 3 + k) as u16),
        }
    }

    #[test]
    fn test_chunk_names_sort_in_write_order() {
        let dir = Path::new("/tmp");
        let a = chunk_path(dir, "tiles", 9);
        let b = chunk_path(dir, "tiles", 10);
        assert!(a < b);
        assert!(a.ends_with("tiles_00009.tilerec"));
    }

    #[test]
    fn test_chunking_counts() {
        let dir = tempdir().unwrap();
        let config = RecordConfig::new(4, "tiles").unwrap();
        let windows: Vec<Window> = (0..10).map(|i| window(i, 0, i as u16)).collect();
        let paths = write_prediction(windows, &config, dir.path()).unwrap();
        assert_eq!(paths.len(), 3);

        let per_file: Vec<usize> = paths
            .iter()
            .map(|p| read_records(&[p]).unwrap().len())
            .collect();
        assert_eq!(per_file, vec![4, 4, 2]);
    }

    #[test]
    fn test_training_label_mismatch() {
        let dir = tempdir().unwrap();
        let config = RecordConfig::new(4, "tiles").unwrap();
        let windows = vec![window(0, 0, 0), window(0, 3, 0)];
        let result = write_training(windows, &[1], &config, dir.path());
        assert!(matches!(result, Err(TreeTileError::ShapeMismatch(_))));
    }

    #[test]
    fn test_training_records_carry_labels() {
        let dir = tempdir().unwrap();
        let config = RecordConfig::new(2, "train").unwrap();
        let windows = vec![window(0, 0, 1), window(0, 3, 2), window(3, 0, 3)];
        let paths = write_training(windows.clone(), &[7, 8, 9], &config, dir.path()).unwrap();

        let records = read_records(&paths).unwrap();
        let labels: Vec<_> = records.iter().map(|r| r.label()).collect();
        assert_eq!(labels, vec![Some(7), Some(8), Some(9)]);
        assert_eq!(records[2].pixels, windows[2].pixels);
        assert!(records.iter().all(|r| r.offset().is_none()));
    }

    #[test]
    fn test_empty_input_writes_nothing() {
        let dir = tempdir().unwrap();
        let config = RecordConfig::new(2, "empty").unwrap();
        let paths = write_prediction(Vec::new(), &config, dir.path()).unwrap();
        assert!(paths.is_empty());
        assert!(read_records::<PathBuf>(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_list_chunks_filters_and_sorts() {
        let dir = tempdir().unwrap();
        let config = RecordConfig::new(1, "pred").unwrap();
        let windows: Vec<Window> = (0..3).map(|i| window(i, i, 0)).collect();
        let written = write_prediction(windows, &config, dir.path()).unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        fs::write(dir.path().join("other_00000.tilerec"), "x").unwrap();

        fs::write(dir.path().join("pred_extra_00000.tilerec"), "x").unwrap();

        let listed = list_chunks(dir.path(), "pred").unwrap();
        assert_eq!(listed, written);
    }

    #[test]
    fn test_list_chunks_orders_past_five_digits() {
        let dir = tempdir().unwrap();
        let indices = [100_000, 3, 99_999, 1_000_001, 10];
        for &index in &indices {
            fs::write(chunk_path(dir.path(), "pred", index), b"").unwrap();
        }

        let listed = list_chunks(dir.path(), "pred").unwrap();
        let expected: Vec<PathBuf> = [3, 10, 99_999, 100_000, 1_000_001]
            .iter()
            .map(|&i| chunk_path(dir.path(), "pred", i))
            .collect();
        assert_eq!(listed, expected);
        assert!(listed[3].ends_with("pred_100000.tilerec"));
    }

    #[test]
    fn test_corrupt_shape_rejected_before_reading_samples() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("huge_00000.tilerec");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&[FORMAT_VERSION, RecordMode::Prediction.to_byte()]);
        bytes.extend_from_slice(&1u32.to_le_bytes());
        // 65535 x 65535 x 1 samples is about 8 GiB of payload
        for dim in [1u32, 65_535, 65_535] {
            bytes.extend_from_slice(&dim.to_le_bytes());
        }
        bytes.extend_from_slice(&[0u8; 16]);
        fs::write(&path, &bytes).unwrap();

        let mut reader = RecordReader::open(&[&path]);
        match reader.next() {
            Some(Err(TreeTileError::InvalidRecord(msg))) => assert!(msg.contains("truncated"), "{}", msg),
            other => panic!("expected a truncated-record error, got {:?}", other),
        }
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bogus.tilerec");
        fs::write(&path, b"NOPE\x01\x00\x00\x00\x00\x00").unwrap();
        let result = read_records(&[&path]);
        assert!(matches!(result, Err(TreeTileError::InvalidRecord(_))));
    }

    #[test]
    fn test_truncated_chunk() {
        let dir = tempdir().unwrap();
        let config = RecordConfig::new(5, "trunc").unwrap();
        let paths = write_prediction(vec![window(0, 0, 0)], &config, dir.path()).unwrap();
        let bytes = fs::read(&paths[0]).unwrap();
        fs::write(&paths[0], &bytes[..bytes.len() - 3]).unwrap();

        let mut reader = RecordReader::open(&paths);
        assert!(matches!(reader.next(), Some(Err(TreeTileError::InvalidRecord(_)))));
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_mixed_modes_rejected_on_read() {
        let dir = tempdir().unwrap();
        let train = write_training(
            vec![window(0, 0, 0)],
            &[1],
            &RecordConfig::new(5, "a").unwrap(),
            dir.path(),
        )
        .unwrap();
        let pred = write_prediction(
            vec![window(0, 0, 0)],
            &RecordConfig::new(5, "b").unwrap(),
            dir.path(),
        )
        .unwrap();
        let paths: Vec<PathBuf> = train.into_iter().chain(pred).collect();
        assert!(read_records(&paths).is_err());
    }

    #[test]
    fn test_mixed_modes_rejected_on_write() {
        let dir = tempdir().unwrap();
        let records = vec![
            Record::training(window(0, 0, 0), 1),
            Record::prediction(window(0, 3, 0)),
        ];
        let result = write_records(records, &RecordConfig::new(5, "mix").unwrap(), dir.path());
        assert!(matches!(result, Err(TreeTileError::ShapeMismatch(_))));
    }
}
