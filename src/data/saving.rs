//! Ring store that mirrors every put to append-only segment files.
//!
//! # On-disk layout
//!
//! ```text
//! <root>/
//!   0000/                 one segment per header put
//!     header.bin          byte-order marker + header definition
//!     samples_000.bin     raw samples; sample i at i * sample_bytes
//!     events_000.bin      event definitions in arrival order
//!     events_000.idx      u64 LE offset of event i at 8 * i
//!   0001/
//!     ...
//! ```
//!
//! The generation suffix is bumped by a data or event flush so flushed
//! history stays on disk. Each put reaches the OS as one write per file
//! before the in-memory window may evict anything, and a put that fails
//! partway is cut back off the files. Reads of evicted indices open the
//! files independently so they never contend with the writers.

use crate::data::codec::{decode_event, encode_event, encode_header, Decoder, Encoder};
use crate::data::store::{BufferStore, Journal};
use crate::data::types::{BufferCounts, ByteOrder, Event, Header};
use crate::error::{AppResult, BufferError};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

/// Bounded store backed by segment files.
pub type SavingStore = BufferStore<DiskJournal>;

impl BufferStore<DiskJournal> {
    /// Opens a saving store rooted at `path`, creating the directory if needed.
    pub fn create(path: impl AsRef<Path>, samples: u64, events: usize) -> AppResult<Self> {
        if samples == 0 || events == 0 {
            return Err(BufferError::Config(format!(
                "ring capacities must be positive (samples={samples}, events={events})"
            )));
        }
        let journal = DiskJournal::open(path.as_ref())?;
        Ok(Self::with_journal(
            Some(samples),
            Some(events),
            journal,
            "saving",
        ))
    }
}

fn persist_err(context: impl std::fmt::Display) -> impl FnOnce(io::Error) -> BufferError {
    move |err| BufferError::Persistence(format!("{context}: {err}"))
}

/// Journal that writes segments under a root directory.
#[derive(Debug)]
pub struct DiskJournal {
    root: PathBuf,
    next_segment: u32,
    segment: Option<Segment>,
}

impl DiskJournal {
    pub fn open(root: &Path) -> AppResult<Self> {
        fs::create_dir_all(root).map_err(persist_err(root.display()))?;
        let next_segment = fs::read_dir(root)
            .map_err(persist_err(root.display()))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .max()
            .map_or(0, |n| n + 1);
        tracing::info!(path = %root.display(), next_segment, "saving buffer to disk");
        Ok(Self {
            root: root.to_path_buf(),
            next_segment,
            segment: None,
        })
    }

    /// Directory of the segment currently being written, if any.
    pub fn segment_dir(&self) -> Option<&Path> {
        self.segment.as_ref().map(|s| s.dir.as_path())
    }

    fn segment(&mut self) -> AppResult<&mut Segment> {
        self.segment
            .as_mut()
            .ok_or_else(|| BufferError::Persistence("no open segment".into()))
    }
}

impl Journal for DiskJournal {
    const BLOCKING_IO: bool = true;

    /// Opens the next segment. The current one stays open until that succeeds.
    fn header(&mut self, header: &Header) -> AppResult<()> {
        if let Some(current) = self.segment.as_mut() {
            current.flush()?;
        }
        let dir = self.root.join(format!("{:04}", self.next_segment));
        // Segment numbers are never reused, even after a failed create.
        self.next_segment += 1;
        let segment = Segment::create(dir, header)?;
        if let Some(previous) = self.segment.replace(segment) {
            tracing::debug!(dir = %previous.dir.display(), "closed buffer segment");
        }
        Ok(())
    }

    fn samples(&mut self, _first: u64, data: &[u8]) -> AppResult<()> {
        self.segment()?.append_samples(data)
    }

    fn events(&mut self, _first: u64, events: &[Event]) -> AppResult<()> {
        let segment = self.segment()?;
        let mut records = Vec::new();
        let mut index = Vec::with_capacity(events.len() * 8);
        for event in events {
            let offset = segment.events.len + records.len() as u64;
            index.extend_from_slice(&offset.to_le_bytes());
            let mut enc = Encoder::new(segment.order);
            encode_event(&mut enc, event);
            records.extend_from_slice(&enc.finish());
        }
        segment.append_events(&records, &index)
    }

    fn flush_header(&mut self) -> AppResult<()> {
        if let Some(mut segment) = self.segment.take() {
            segment.flush()?;
        }
        Ok(())
    }

    fn flush_samples(&mut self) -> AppResult<()> {
        match self.segment.as_mut() {
            Some(segment) => segment.next_sample_generation(),
            None => Ok(()),
        }
    }

    fn flush_events(&mut self) -> AppResult<()> {
        match self.segment.as_mut() {
            Some(segment) => segment.next_event_generation(),
            None => Ok(()),
        }
    }

    fn read_samples(&self, range: Range<u64>) -> Option<AppResult<Vec<u8>>> {
        self.segment.as_ref().map(|s| s.read_samples(range))
    }

    fn read_events(&self, range: Range<u64>) -> Option<AppResult<Vec<Event>>> {
        self.segment.as_ref().map(|s| s.read_events(range))
    }

    fn close(&mut self) {
        if let Some(mut segment) = self.segment.take() {
            if let Err(e) = segment.flush() {
                tracing::error!(error = %e, "failed to flush segment on close");
            }
            tracing::info!(dir = %segment.dir.display(), "closed buffer segment");
        }
    }
}

/// Append-only file that remembers how much of it is committed.
#[derive(Debug)]
struct SegmentFile {
    path: PathBuf,
    file: File,
    len: u64,
}

impl SegmentFile {
    fn create(path: PathBuf) -> AppResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(persist_err(path.display()))?;
        Ok(Self { path, file, len: 0 })
    }

    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)?;
        self.len += bytes.len() as u64;
        Ok(())
    }

    /// Cuts the file back to `len` bytes.
    fn rewind(&mut self, len: u64) -> io::Result<()> {
        if self.file.metadata()?.len() != len {
            self.file.set_len(len)?;
        }
        self.file.seek(SeekFrom::Start(len))?;
        self.len = len;
        Ok(())
    }

    fn sync(&self) -> AppResult<()> {
        self.file
            .sync_data()
            .map_err(persist_err(self.path.display()))
    }
}

#[derive(Debug)]
struct Segment {
    dir: PathBuf,
    order: ByteOrder,
    sample_bytes: u64,
    sample_gen: u32,
    event_gen: u32,
    samples: SegmentFile,
    events: SegmentFile,
    event_index: SegmentFile,
    /// Set when a failed write could not be undone; the files no longer
    /// match the in-memory indices.
    broken: Option<String>,
}

impl Segment {
    fn create(dir: PathBuf, header: &Header) -> AppResult<Self> {
        fs::create_dir_all(&dir).map_err(persist_err(dir.display()))?;

        let mut enc = Encoder::new(header.byte_order);
        enc.bytes(&[header.byte_order.marker()]);
        encode_header(&mut enc, header, BufferCounts::default());
        let header_path = dir.join("header.bin");
        fs::write(&header_path, enc.finish()).map_err(persist_err(header_path.display()))?;

        let samples = SegmentFile::create(dir.join(samples_name(0)))?;
        let events = SegmentFile::create(dir.join(events_name(0)))?;
        let event_index = SegmentFile::create(dir.join(index_name(0)))?;
        tracing::debug!(dir = %dir.display(), "opened buffer segment");

        Ok(Self {
            dir,
            order: header.byte_order,
            sample_bytes: header.sample_bytes() as u64,
            sample_gen: 0,
            event_gen: 0,
            samples,
            events,
            event_index,
            broken: None,
        })
    }

    fn usable(&self) -> AppResult<()> {
        match &self.broken {
            Some(reason) => Err(BufferError::Persistence(format!(
                "segment {} is unusable: {reason}",
                self.dir.display()
            ))),
            None => Ok(()),
        }
    }

    fn append_samples(&mut self, data: &[u8]) -> AppResult<()> {
        self.usable()?;
        let mark = self.samples.len;
        match self.samples.append(data) {
            Ok(()) => Ok(()),
            Err(e) => {
                let undone = self.samples.rewind(mark);
                Err(self.failed("writing samples", e, undone))
            }
        }
    }

    /// Appends event records and their index entries; both land or neither does.
    fn append_events(&mut self, records: &[u8], index: &[u8]) -> AppResult<()> {
        self.usable()?;
        let (records_mark, index_mark) = (self.events.len, self.event_index.len);
        let written = self
            .events
            .append(records)
            .and_then(|_| self.event_index.append(index));
        match written {
            Ok(()) => Ok(()),
            Err(e) => {
                let undone = self
                    .events
                    .rewind(records_mark)
                    .and_then(|_| self.event_index.rewind(index_mark));
                Err(self.failed("writing events", e, undone))
            }
        }
    }

    fn failed(&mut self, what: &str, err: io::Error, undone: io::Result<()>) -> BufferError {
        if let Err(undo) = undone {
            tracing::error!(
                dir = %self.dir.display(),
                error = %undo,
                "could not roll back partial write"
            );
            self.broken = Some(format!("{what} failed and was not rolled back: {undo}"));
        }
        BufferError::Persistence(format!("{what}: {err}"))
    }

    fn flush(&mut self) -> AppResult<()> {
        self.samples.sync()?;
        self.events.sync()?;
        self.event_index.sync()
    }

    fn next_sample_generation(&mut self) -> AppResult<()> {
        self.samples.sync()?;
        let next = SegmentFile::create(self.dir.join(samples_name(self.sample_gen + 1)))?;
        self.sample_gen += 1;
        self.samples = next;
        Ok(())
    }

    fn next_event_generation(&mut self) -> AppResult<()> {
        self.events.sync()?;
        self.event_index.sync()?;
        let events = SegmentFile::create(self.dir.join(events_name(self.event_gen + 1)))?;
        let event_index = SegmentFile::create(self.dir.join(index_name(self.event_gen + 1)))?;
        self.event_gen += 1;
        self.events = events;
        self.event_index = event_index;
        Ok(())
    }

    fn read_samples(&self, range: Range<u64>) -> AppResult<Vec<u8>> {
        self.usable()?;
        let start = range.start.checked_mul(self.sample_bytes);
        let len = (range.end - range.start)
            .checked_mul(self.sample_bytes)
            .and_then(|len| usize::try_from(len).ok());
        let (Some(start), Some(len)) = (start, len) else {
            return Err(BufferError::Persistence(format!(
                "samples {}..{} exceed the addressable file size",
                range.start, range.end
            )));
        };

        let path = &self.samples.path;
        let mut file = File::open(path).map_err(persist_err(path.display()))?;
        let mut data = vec![0u8; len];
        file.seek(SeekFrom::Start(start))
            .and_then(|_| file.read_exact(&mut data))
            .map_err(persist_err(path.display()))?;
        Ok(data)
    }

    fn read_events(&self, range: Range<u64>) -> AppResult<Vec<Event>> {
        self.usable()?;
        if range.start >= range.end {
            return Ok(Vec::new());
        }
        let index_path = &self.event_index.path;
        let events_path = &self.events.path;

        let mut index = File::open(index_path).map_err(persist_err(index_path.display()))?;
        let start = read_offset(&mut index, range.start).map_err(persist_err(index_path.display()))?;
        let end = if range.end < self.event_index.len / 8 {
            read_offset(&mut index, range.end).map_err(persist_err(index_path.display()))?
        } else {
            self.events.len
        };

        let mut file = File::open(events_path).map_err(persist_err(events_path.display()))?;
        let mut bytes = vec![0u8; (end - start) as usize];
        file.seek(SeekFrom::Start(start))
            .and_then(|_| file.read_exact(&mut bytes))
            .map_err(persist_err(events_path.display()))?;

        let mut dec = Decoder::new(&bytes, self.order);
        (range.start..range.end)
            .map(|_| decode_event(&mut dec))
            .collect()
    }
}

fn read_offset(index: &mut File, event: u64) -> io::Result<u64> {
    let mut raw = [0u8; 8];
    index.seek(SeekFrom::Start(event * 8))?;
    index.read_exact(&mut raw)?;
    Ok(u64::from_le_bytes(raw))
}

fn samples_name(generation: u32) -> String {
    format!("samples_{generation:03}.bin")
}

fn events_name(generation: u32) -> String {
    format!("events_{generation:03}.bin")
}

fn index_name(generation: u32) -> String {
    format!("events_{generation:03}.idx")
}
