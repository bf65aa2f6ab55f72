// Partition Log
//
// The durable commit log of one partition: an ordered run of segments
// that together cover offsets 0..next_offset with no gaps or overlaps.
// Appends go to the last segment; reads walk segments in order.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::LogConfig;
use crate::error::{Result, StorageError};
use crate::record::{Offset, Record};
use crate::segment::{self, Segment, SegmentInfo};

#[derive(Debug)]
struct LogState {
    /// Ascending by base offset. Never empty while open.
    segments: Vec<Segment>,
    next_offset: Offset,
    closed: bool,
}

impl LogState {
    fn active_mut(&mut self) -> Result<&mut Segment> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        self.segments.last_mut().ok_or(StorageError::Closed)
    }
}

/// Single-writer, offset-assigning log over a directory of segments.
///
/// Appends serialize on an internal write lock; reads share a read lock.
#[derive(Debug)]
pub struct PartitionLog {
    dir: PathBuf,
    config: LogConfig,
    state: RwLock<LogState>,
}

impl PartitionLog {
    /// Open the log stored in `dir`, creating it if empty.
    ///
    /// `next_offset` is recovered from the last segment's index.
    pub fn open(dir: impl Into<PathBuf>, config: LogConfig) -> Result<Self> {
        config.validate()?;
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(StorageError::io("creating directory", &dir))?;

        let mut segments = discover_base_offsets(&dir)?
            .into_iter()
            .map(|base_offset| Segment::open(&dir, base_offset, &config))
            .collect::<Result<Vec<_>>>()?;

        let mut active = match segments.pop() {
            Some(segment) => segment,
            None => Segment::open(&dir, 0, &config)?,
        };

        let removed = active.truncate_to_index()?;
        if removed > 0 {
            info!(
                dir = %dir.display(),
                base_offset = active.base_offset(),
                removed_bytes = removed,
                "Truncated unindexed log tail"
            );
        }

        let next_offset = active
            .last_offset()
            .map_or(active.base_offset(), |last| last + 1);
        segments.push(active);

        info!(
            dir = %dir.display(),
            segments = segments.len(),
            next_offset,
            "Opened partition log"
        );

        Ok(Self {
            dir,
            config,
            state: RwLock::new(LogState {
                segments,
                next_offset,
                closed: false,
            }),
        })
    }

    /// Append a payload and return the offset assigned to it.
    pub fn append(&self, payload: &[u8]) -> Result<Offset> {
        let mut guard = self.state.write();
        let state = &mut *guard;

        // a rotation that failed after the previous append is retried here
        if state.active_mut()?.size() >= self.config.segment_max_bytes {
            self.rotate(state)?;
        }

        let offset = state.next_offset;
        let active = state.active_mut()?;
        active.append(offset, payload)?;
        let full = active.size() >= self.config.segment_max_bytes;
        state.next_offset = offset + 1;

        if full {
            if let Err(e) = self.rotate(state) {
                warn!(
                    dir = %self.dir.display(),
                    offset,
                    error = %e,
                    "Segment rotation failed, retrying on next append"
                );
            }
        }

        Ok(offset)
    }

    /// Start a new active segment at `next_offset`.
    fn rotate(&self, state: &mut LogState) -> Result<()> {
        let base_offset = state.next_offset;
        let segment = Segment::open(&self.dir, base_offset, &self.config)?;

        if let Some(previous) = state.segments.last() {
            info!(
                dir = %self.dir.display(),
                sealed_base_offset = previous.base_offset(),
                sealed_size = previous.size(),
                base_offset,
                "Rotated segment"
            );
        }

        state.segments.push(segment);
        Ok(())
    }

    /// Read records from `start_offset` onward until at least `max_bytes`
    /// framed bytes are collected or the log ends.
    pub fn read(&self, start_offset: Offset, max_bytes: u64) -> Result<Vec<Record>> {
        let state = self.state.read();
        if state.closed {
            return Err(StorageError::Closed);
        }

        let mut records = Vec::new();
        if start_offset >= state.next_offset {
            return Ok(records);
        }

        let mut start = start_offset;
        let mut remaining = max_bytes;
        let segments = &state.segments;

        for (i, segment) in segments.iter().enumerate() {
            // everything from `start` on lives in a later segment
            if let Some(next) = segments.get(i + 1) {
                if start >= next.base_offset() {
                    continue;
                }
            }

            let chunk = segment.read_from(start, remaining)?;
            if let Some(last) = chunk.last() {
                start = last.offset + 1;
            }

            let consumed: u64 = chunk.iter().map(|r| r.framed_len() as u64).sum();
            remaining = remaining.saturating_sub(consumed);
            records.extend(chunk);

            if remaining == 0 {
                break;
            }
        }

        Ok(records)
    }

    /// Offset the next append will receive.
    pub fn next_offset(&self) -> Offset {
        self.state.read().next_offset
    }

    pub fn segment_count(&self) -> usize {
        self.state.read().segments.len()
    }

    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.state.read().segments.iter().map(Segment::info).collect()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Close every segment. Later appends and reads fail with `Closed`.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        let mut first_err = None;
        for segment in state.segments.drain(..) {
            if let Err(e) = segment.close() {
                first_err.get_or_insert(e);
            }
        }

        debug!(dir = %self.dir.display(), "Closed partition log");
        first_err.map_or(Ok(()), Err)
    }
}

/// Base offsets of the segment log files in `dir`, ascending.
fn discover_base_offsets(dir: &Path) -> Result<Vec<Offset>> {
    let mut offsets = Vec::new();

    for entry in fs::read_dir(dir).map_err(StorageError::io("listing", dir))? {
        let entry = entry.map_err(StorageError::io("listing", dir))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };

        match segment::parse_base_offset(name) {
            Some(base_offset) => offsets.push(base_offset),
            None if name.ends_with(".log") => {
                debug!(dir = %dir.display(), file = name, "Ignoring unrecognized log file");
            }
            None => {}
        }
    }

    offsets.sort_unstable();
    Ok(offsets)
}
