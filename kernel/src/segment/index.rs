// Segment Offset Index
//
// Plain-text companion to a segment's log file, one line per record:
//
//   <offset>,<byte_position>\n
//
// The whole index is loaded once at open and kept in memory; appends go
// to both the file and the in-memory entries.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{Result, StorageError};
use crate::record::Offset;

/// Where a record's frame starts in the log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: Offset,
    pub position: u64,
}

#[derive(Debug)]
pub struct OffsetIndex {
    base_offset: Offset,
    path: PathBuf,
    file: File,
    /// Strictly increasing by offset, same order as the log file.
    entries: Vec<IndexEntry>,
    /// Bytes of complete lines on disk.
    committed_len: u64,
    /// Next write keeps only this many bytes and then fails.
    #[cfg(test)]
    pub(super) torn_write: Option<usize>,
}

impl OffsetIndex {
    /// Open or create the index file at `path` and load its entries.
    ///
    /// A trailing line without a newline is a torn write and is cut off.
    pub fn open(path: impl Into<PathBuf>, base_offset: Offset) -> Result<Self> {
        let path = path.into();

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(StorageError::io("opening index", &path))?;

        let raw = fs::read(&path).map_err(StorageError::io("reading index", &path))?;
        let contents = String::from_utf8(raw).map_err(|_| StorageError::CorruptIndex {
            path: path.clone(),
            line: "<invalid utf-8>".into(),
        })?;

        let (entries, valid_len) = parse_index(&path, base_offset, &contents)?;

        if valid_len < contents.len() {
            warn!(
                path = %path.display(),
                dropped_bytes = contents.len() - valid_len,
                "Dropping torn index tail"
            );
            file.set_len(valid_len as u64)
                .map_err(StorageError::io("truncating index", &path))?;
        }

        Ok(Self {
            base_offset,
            path,
            file,
            entries,
            committed_len: valid_len as u64,
            #[cfg(test)]
            torn_write: None,
        })
    }

    /// Append one entry and write its line to disk.
    ///
    /// A failed write is cut back to the last complete line, so a later
    /// append cannot glue its line onto a fragment.
    pub fn append(&mut self, offset: Offset, position: u64) -> Result<()> {
        debug_assert!(offset >= self.base_offset);
        debug_assert!(self.last().map_or(true, |last| offset > last.offset));

        let line = format!("{offset},{position}\n");
        if let Err(e) = self.write_line(line.as_bytes()) {
            self.rollback();
            return Err(StorageError::io("appending to index", &self.path)(e));
        }

        self.committed_len += line.len() as u64;
        self.entries.push(IndexEntry { offset, position });
        Ok(())
    }

    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        if let Some(keep) = self.torn_write.take() {
            self.file.write_all(&line[..keep.min(line.len())])?;
            return Err(io::Error::new(io::ErrorKind::Other, "torn index write"));
        }

        self.file.write_all(line)
    }

    /// Drop whatever a failed write left past the last complete line.
    fn rollback(&mut self) {
        if let Err(e) = self.file.set_len(self.committed_len) {
            // open() still drops an unterminated tail on restart
            warn!(
                path = %self.path.display(),
                error = %e,
                "Could not cut back torn index write"
            );
        }
    }

    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(StorageError::io("syncing index", &self.path))
    }

    /// Entries with `offset >= start`, in file order.
    pub fn entries_from(&self, start: Offset) -> &[IndexEntry] {
        let first = self.entries.partition_point(|entry| entry.offset < start);
        &self.entries[first..]
    }

    pub fn last(&self) -> Option<&IndexEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse index contents, returning the entries and the byte length of the
/// complete lines they came from.
fn parse_index(
    path: &Path,
    base_offset: Offset,
    contents: &str,
) -> Result<(Vec<IndexEntry>, usize)> {
    let mut entries: Vec<IndexEntry> = Vec::new();
    let mut valid_len = 0;

    for chunk in contents.split_inclusive('\n') {
        // last line never got its newline
        if !chunk.ends_with('\n') {
            break;
        }
        valid_len += chunk.len();

        let line = chunk.trim();
        if line.is_empty() {
            continue;
        }

        let corrupt = || StorageError::CorruptIndex {
            path: path.to_path_buf(),
            line: line.to_string(),
        };

        let (offset, position) = line.split_once(',').ok_or_else(corrupt)?;
        let offset: Offset = offset.trim().parse().map_err(|_| corrupt())?;
        let position: u64 = position.trim().parse().map_err(|_| corrupt())?;

        let in_order = match entries.last() {
            Some(last) => offset > last.offset && position > last.position,
            None => offset >= base_offset,
        };
        if !in_order {
            return Err(corrupt());
        }

        entries.push(IndexEntry { offset, position });
    }

    Ok((entries, valid_len))
}
