// Log Segment
//
// One bounded, append-only slice of a partition: a log file of framed
// records plus its offset index. Only the partition's last segment is
// ever written to.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::LogConfig;
use crate::error::{Result, StorageError};
use crate::record::{self, Offset, Record, LENGTH_PREFIX_SIZE, MAX_PAYLOAD_LEN};

pub mod index;

use index::OffsetIndex;

const FILE_PREFIX: &str = "segment-";
const LOG_SUFFIX: &str = ".log";
const INDEX_SUFFIX: &str = ".idx";

pub fn log_file_name(base_offset: Offset) -> String {
    format!("{FILE_PREFIX}{base_offset:020}{LOG_SUFFIX}")
}

pub fn index_file_name(base_offset: Offset) -> String {
    format!("{FILE_PREFIX}{base_offset:020}{INDEX_SUFFIX}")
}

/// Base offset embedded in a segment log file name, if it is one.
pub fn parse_base_offset(file_name: &str) -> Option<Offset> {
    let digits = file_name
        .strip_prefix(FILE_PREFIX)?
        .strip_suffix(LOG_SUFFIX)?;

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Summary of a segment for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentInfo {
    pub base_offset: Offset,
    pub last_offset: Option<Offset>,
    pub records: usize,
    pub size_bytes: u64,
}

#[derive(Debug)]
pub struct Segment {
    base_offset: Offset,
    log_path: PathBuf,
    log: File,
    index: OffsetIndex,
    /// Byte length of the log file.
    size: u64,
    sync_on_append: bool,
    /// Next log write keeps only this many bytes and then fails.
    #[cfg(test)]
    torn_write: Option<usize>,
}

impl Segment {
    /// Open the segment starting at `base_offset` in `dir`, creating its
    /// files if they do not exist.
    pub fn open(dir: &Path, base_offset: Offset, config: &LogConfig) -> Result<Self> {
        fs::create_dir_all(dir).map_err(StorageError::io("creating directory", dir))?;

        let log_path = dir.join(log_file_name(base_offset));
        let log = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&log_path)
            .map_err(StorageError::io("opening log", &log_path))?;

        let size = log
            .metadata()
            .map_err(StorageError::io("reading metadata of", &log_path))?
            .len();

        let index = OffsetIndex::open(dir.join(index_file_name(base_offset)), base_offset)?;

        debug!(
            base_offset,
            size,
            records = index.len(),
            "Opened segment"
        );

        Ok(Self {
            base_offset,
            log_path,
            log,
            index,
            size,
            sync_on_append: config.sync_on_append,
            #[cfg(test)]
            torn_write: None,
        })
    }

    /// Append one record, returning the byte position of its frame.
    ///
    /// The frame goes to the log first, then the index line.
    pub fn append(&mut self, offset: Offset, payload: &[u8]) -> Result<u64> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(StorageError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }

        let last_offset = self.last_offset();
        if offset < self.base_offset || last_offset.is_some_and(|last| offset <= last) {
            return Err(StorageError::OffsetOutOfOrder {
                offset,
                base_offset: self.base_offset,
                last_offset,
            });
        }

        let frame = record::encode_frame(offset, payload);
        let position = self.size;

        if let Err(e) = self.write_frame(&frame) {
            self.rollback_log(position);
            return Err(StorageError::io("appending to log", &self.log_path)(e));
        }
        self.size += frame.len() as u64;

        let indexed = self.sync_log().and_then(|()| self.index.append(offset, position));
        if let Err(e) = indexed {
            // an unindexed frame must not stay in front of the next one
            self.rollback_log(position);
            return Err(e);
        }
        if self.sync_on_append {
            self.index.sync()?;
        }

        Ok(position)
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        if let Some(keep) = self.torn_write.take() {
            self.log.write_all(&frame[..keep.min(frame.len())])?;
            return Err(io::Error::new(io::ErrorKind::Other, "torn log write"));
        }

        self.log.write_all(frame)
    }

    fn sync_log(&self) -> Result<()> {
        if !self.sync_on_append {
            return Ok(());
        }
        self.log
            .sync_data()
            .map_err(StorageError::io("syncing log", &self.log_path))
    }

    /// Cut the log back to `position` after a failed append.
    fn rollback_log(&mut self, position: u64) {
        match self.log.set_len(position) {
            Ok(()) => self.size = position,
            Err(e) => {
                warn!(
                    base_offset = self.base_offset,
                    position,
                    error = %e,
                    "Could not cut back failed log append"
                );
                // a partial write still moved the end of file
                if let Ok(metadata) = self.log.metadata() {
                    self.size = metadata.len();
                }
            }
        }
    }

    /// Read records with `offset >= start_offset` until at least
    /// `max_bytes` framed bytes have been collected.
    ///
    /// The record that crosses `max_bytes` is included. An incomplete or
    /// malformed frame ends the read.
    pub fn read_from(&self, start_offset: Offset, max_bytes: u64) -> Result<Vec<Record>> {
        let entries = self.index.entries_from(start_offset);
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut file =
            File::open(&self.log_path).map_err(StorageError::io("opening log", &self.log_path))?;

        let mut records = Vec::new();
        let mut bytes_read = 0u64;

        for entry in entries {
            file.seek(SeekFrom::Start(entry.position))
                .map_err(StorageError::io("seeking log", &self.log_path))?;

            let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
            if !self.read_full(&mut file, &mut prefix)? {
                break;
            }

            let total_len = u32::from_be_bytes(prefix) as u64;
            let frame_len = LENGTH_PREFIX_SIZE as u64 + total_len;
            if entry.position + frame_len > self.size {
                debug!(
                    base_offset = self.base_offset,
                    offset = entry.offset,
                    "Frame extends past end of segment"
                );
                break;
            }

            let mut body = vec![0u8; total_len as usize];
            if !self.read_full(&mut file, &mut body)? {
                break;
            }

            let record = match record::decode_body(Bytes::from(body)) {
                Some(record) if record.offset == entry.offset => record,
                Some(record) => {
                    warn!(
                        base_offset = self.base_offset,
                        expected = entry.offset,
                        found = record.offset,
                        "Frame offset does not match index"
                    );
                    break;
                }
                None => {
                    warn!(
                        base_offset = self.base_offset,
                        offset = entry.offset,
                        "Malformed frame"
                    );
                    break;
                }
            };

            records.push(record);
            bytes_read += frame_len;
            if bytes_read >= max_bytes {
                break;
            }
        }

        Ok(records)
    }

    /// Fill `buf`, returning false if the file ends first.
    fn read_full(&self, file: &mut File, buf: &mut [u8]) -> Result<bool> {
        match file.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(StorageError::io("reading log", &self.log_path)(e)),
        }
    }

    /// Cut any log bytes past the end of the last indexed frame.
    ///
    /// Such bytes belong to a frame whose index line was never written.
    /// Returns the number of bytes removed.
    pub fn truncate_to_index(&mut self) -> Result<u64> {
        let end = match self.index.last() {
            None => 0,
            Some(last) => {
                let mut file = File::open(&self.log_path)
                    .map_err(StorageError::io("opening log", &self.log_path))?;
                file.seek(SeekFrom::Start(last.position))
                    .map_err(StorageError::io("seeking log", &self.log_path))?;

                let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
                if !self.read_full(&mut file, &mut prefix)? {
                    return Ok(0);
                }
                last.position + LENGTH_PREFIX_SIZE as u64 + u32::from_be_bytes(prefix) as u64
            }
        };

        if end >= self.size {
            return Ok(0);
        }

        let removed = self.size - end;
        self.log
            .set_len(end)
            .map_err(StorageError::io("truncating log", &self.log_path))?;
        self.size = end;

        Ok(removed)
    }

    /// Byte length of the log file.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn base_offset(&self) -> Offset {
        self.base_offset
    }

    pub fn last_offset(&self) -> Option<Offset> {
        self.index.last().map(|entry| entry.offset)
    }

    /// Number of indexed records.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn index_path(&self) -> &Path {
        self.index.path()
    }

    pub fn info(&self) -> SegmentInfo {
        SegmentInfo {
            base_offset: self.base_offset,
            last_offset: self.last_offset(),
            records: self.len(),
            size_bytes: self.size,
        }
    }

    /// Flush both files and release their handles.
    pub fn close(self) -> Result<()> {
        self.log
            .sync_all()
            .map_err(StorageError::io("syncing log", &self.log_path))?;
        self.index.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path, base_offset: Offset) -> Segment {
        Segment::open(dir, base_offset, &LogConfig::default()).unwrap()
    }

    #[test]
    fn file_names_are_zero_padded() {
        assert_eq!(log_file_name(0), "segment-00000000000000000000.log");
        assert_eq!(index_file_name(42), "segment-00000000000000000042.idx");
    }

    #[test]
    fn base_offset_parses_from_log_names_only() {
        assert_eq!(parse_base_offset("segment-00000000000000000042.log"), Some(42));
        assert_eq!(parse_base_offset("segment-00000000000000000042.idx"), None);
        assert_eq!(parse_base_offset("segment-.log"), None);
        assert_eq!(parse_base_offset("segment-12ab.log"), None);
        assert_eq!(parse_base_offset("other.log"), None);
    }

    #[test]
    fn append_returns_frame_positions() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = open(dir.path(), 0);

        assert_eq!(segment.append(0, b"a").unwrap(), 0);
        assert_eq!(segment.append(1, b"bb").unwrap(), 17);
        assert_eq!(segment.append(2, b"ccc").unwrap(), 35);
        assert_eq!(segment.size(), 54);
        assert_eq!(segment.last_offset(), Some(2));

        let index = fs::read_to_string(segment.index_path()).unwrap();
        assert_eq!(index, "0,0\n1,17\n2,35\n");
        assert_eq!(fs::metadata(segment.log_path()).unwrap().len(), 54);
    }

    #[test]
    fn read_from_filters_by_start_offset() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = open(dir.path(), 10);
        segment.append(10, b"x").unwrap();
        segment.append(11, b"y").unwrap();
        segment.append(12, b"z").unwrap();

        let records = segment.read_from(11, 1024).unwrap();
        assert_eq!(
            records,
            vec![Record::new(11, &b"y"[..]), Record::new(12, &b"z"[..])]
        );

        assert_eq!(segment.read_from(0, 1024).unwrap().len(), 3);
        assert!(segment.read_from(13, 1024).unwrap().is_empty());
    }

    #[test]
    fn budget_includes_crossing_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = open(dir.path(), 0);
        for offset in 0..5 {
            // 16 + 4 = 20 framed bytes each
            segment.append(offset, b"abcd").unwrap();
        }

        assert_eq!(segment.read_from(0, 20).unwrap().len(), 1);
        assert_eq!(segment.read_from(0, 21).unwrap().len(), 2);
        assert_eq!(segment.read_from(0, 40).unwrap().len(), 2);
        assert_eq!(segment.read_from(0, 0).unwrap().len(), 1);
        assert_eq!(segment.read_from(0, 10_000).unwrap().len(), 5);
    }

    #[test]
    fn short_frame_ends_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = open(dir.path(), 0);
        segment.append(0, b"first").unwrap();
        segment.append(1, b"second").unwrap();
        let log_path = segment.log_path().to_path_buf();
        drop(segment);

        // chop the last frame in half
        let len = fs::metadata(&log_path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&log_path)
            .unwrap()
            .set_len(len - 3)
            .unwrap();

        let segment = open(dir.path(), 0);
        let records = segment.read_from(0, 1024).unwrap();
        assert_eq!(records, vec![Record::new(0, &b"first"[..])]);
    }

    #[test]
    fn mismatched_frame_offset_ends_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = open(dir.path(), 0);
        segment.append(0, b"ok").unwrap();
        drop(segment);

        // index claims offset 1 at a position holding offset 7
        let log_path = dir.path().join(log_file_name(0));
        let mut log = OpenOptions::new().append(true).open(&log_path).unwrap();
        log.write_all(&record::encode_frame(7, b"bad")).unwrap();
        let index_path = dir.path().join(index_file_name(0));
        let mut index = OpenOptions::new().append(true).open(&index_path).unwrap();
        index.write_all(b"1,18\n").unwrap();

        let segment = open(dir.path(), 0);
        assert_eq!(segment.read_from(0, 1024).unwrap().len(), 1);
    }

    #[test]
    fn out_of_order_offsets_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = open(dir.path(), 5);

        assert!(matches!(
            segment.append(4, b"x"),
            Err(StorageError::OffsetOutOfOrder { offset: 4, .. })
        ));

        segment.append(5, b"x").unwrap();
        assert!(matches!(
            segment.append(5, b"x"),
            Err(StorageError::OffsetOutOfOrder {
                last_offset: Some(5),
                ..
            })
        ));
        assert_eq!(segment.len(), 1);
    }

    #[test]
    fn torn_log_write_is_cut_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = open(dir.path(), 0);
        segment.append(0, b"first").unwrap();
        let size = segment.size();

        segment.torn_write = Some(7);
        assert!(segment.append(1, b"second").is_err());
        assert_eq!(segment.size(), size);
        assert_eq!(fs::metadata(segment.log_path()).unwrap().len(), size);
        assert_eq!(segment.last_offset(), Some(0));

        assert_eq!(segment.append(1, b"second").unwrap(), size);
        drop(segment);

        let segment = open(dir.path(), 0);
        assert_eq!(
            segment.read_from(0, 1024).unwrap(),
            vec![Record::new(0, &b"first"[..]), Record::new(1, &b"second"[..])]
        );
    }

    #[test]
    fn torn_index_write_drops_the_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = open(dir.path(), 0);
        segment.append(0, b"first").unwrap();
        let size = segment.size();

        segment.index.torn_write = Some(3);
        assert!(segment.append(1, b"second").is_err());
        assert_eq!(segment.size(), size);
        assert_eq!(fs::metadata(segment.log_path()).unwrap().len(), size);
        assert_eq!(fs::read_to_string(segment.index_path()).unwrap(), "0,0\n");

        assert_eq!(segment.append(1, b"again").unwrap(), size);
        assert_eq!(
            fs::read_to_string(segment.index_path()).unwrap(),
            format!("0,0\n1,{size}\n")
        );
        drop(segment);

        let mut segment = open(dir.path(), 0);
        assert_eq!(segment.truncate_to_index().unwrap(), 0);
        assert_eq!(segment.read_from(1, 1024).unwrap(), vec![Record::new(1, &b"again"[..])]);
    }

    #[test]
    fn reopen_keeps_records_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = open(dir.path(), 0);
        segment.append(0, b"persisted").unwrap();
        let size = segment.size();
        segment.close().unwrap();

        let mut segment = open(dir.path(), 0);
        assert_eq!(segment.size(), size);
        assert_eq!(segment.append(1, b"more").unwrap(), size);
        assert_eq!(segment.read_from(0, 1024).unwrap().len(), 2);
    }

    #[test]
    fn unindexed_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = open(dir.path(), 0);
        segment.append(0, b"kept").unwrap();
        let good_size = segment.size();
        drop(segment);

        let log_path = dir.path().join(log_file_name(0));
        let mut log = OpenOptions::new().append(true).open(&log_path).unwrap();
        log.write_all(&record::encode_frame(1, b"lost")).unwrap();

        let mut segment = open(dir.path(), 0);
        assert_eq!(segment.truncate_to_index().unwrap(), 20);
        assert_eq!(segment.size(), good_size);
        assert_eq!(fs::metadata(&log_path).unwrap().len(), good_size);
        assert_eq!(segment.truncate_to_index().unwrap(), 0);

        assert_eq!(segment.append(1, b"new").unwrap(), good_size);
    }

    #[test]
    fn info_summarizes_segment() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = open(dir.path(), 3);
        assert_eq!(
            segment.info(),
            SegmentInfo {
                base_offset: 3,
                last_offset: None,
                records: 0,
                size_bytes: 0,
            }
        );

        segment.append(3, b"abc").unwrap();
        let info = segment.info();
        assert_eq!(info.last_offset, Some(3));
        assert_eq!(info.records, 1);
        assert_eq!(info.size_bytes, 19);
    }
}
