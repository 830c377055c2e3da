use crate::{Error, Message, Offset, Result};
use bytes::{BufMut, BytesMut};
use crc32fast::Hasher;
use memmap2::Mmap;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

const LOG_SUFFIX: &str = "log";
const FRAME_HEADER_SIZE: usize = 8; // 4 bytes crc, 4 bytes length

/// Path of a segment file inside a topic directory
pub fn segment_path(dir: &Path, segment_id: i64) -> PathBuf {
    dir.join(format!("{:020}.{}", segment_id, LOG_SUFFIX))
}

/// Ids of the segment files in a topic directory, ascending. A missing
/// directory holds none.
pub fn list_segment_ids(dir: &Path) -> Result<Vec<i64>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut ids = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(LOG_SUFFIX) {
            continue;
        }
        match path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<i64>().ok())
        {
            Some(segment_id) => ids.push(segment_id),
            None => warn!("Ignoring unexpected file {}", path.display()),
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// One append-only segment file: a sequence of `[crc][len][payload]` frames
/// where entry `n` is the `n`-th frame.
///
/// All methods block on file I/O and are meant to run on the execution pool.
#[derive(Debug)]
pub struct Segment {
    topic: String,
    segment_id: i64,
    path: PathBuf,
    inner: Mutex<SegmentInner>,
    sealed: AtomicBool,
}

#[derive(Debug)]
struct SegmentInner {
    /// `None` once the segment is sealed or an append left it unusable
    writer: Option<File>,
    size: u64,
    /// Entry id -> byte position of its frame
    positions: Vec<u64>,
}

enum Frame<'a> {
    Complete { payload: &'a [u8], next: usize },
    Truncated,
    CrcMismatch,
}

fn decode_frame(buf: &[u8], pos: usize) -> Frame<'_> {
    if pos + FRAME_HEADER_SIZE > buf.len() {
        return Frame::Truncated;
    }
    let stored_crc = u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
    let len = u32::from_be_bytes([buf[pos + 4], buf[pos + 5], buf[pos + 6], buf[pos + 7]]) as usize;

    let start = pos + FRAME_HEADER_SIZE;
    if start + len > buf.len() {
        return Frame::Truncated;
    }

    let payload = &buf[start..start + len];
    let mut hasher = Hasher::new();
    hasher.update(payload);
    if hasher.finalize() != stored_crc {
        return Frame::CrcMismatch;
    }

    Frame::Complete {
        payload,
        next: start + len,
    }
}

/// Byte sink an append writes its frame into
trait AppendTarget: Write + Seek {
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl AppendTarget for File {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Write `frame` at `position`. On failure the target is cut back to
/// `position` so the next frame lands where this one started.
fn write_frame<T: AppendTarget>(
    target: &mut T,
    frame: &[u8],
    position: u64,
    segment_id: i64,
    sync: bool,
) -> Result<()> {
    let written = target
        .write_all(frame)
        .and_then(|_| if sync { target.sync() } else { Ok(()) });
    let Err(e) = written else {
        return Ok(());
    };

    let rollback = target
        .truncate_to(position)
        .and_then(|_| target.seek(SeekFrom::Start(position)).map(|_| ()));
    match rollback {
        Ok(()) => Err(e.into()),
        Err(rollback_err) => Err(Error::Corrupted {
            segment_id,
            position,
            reason: format!("append failed ({}) and rollback failed ({})", e, rollback_err),
        }),
    }
}

fn encode_frame(payload: &[u8]) -> BytesMut {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let crc = hasher.finalize();

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.put_u32(crc);
    frame.put_u32(payload.len() as u32);
    frame.put_slice(payload);
    frame
}

impl Segment {
    /// Create an empty writable segment.
    ///
    /// An empty leftover file is reused. A file that already holds data is
    /// never overwritten: that fails with [`Error::SegmentExists`].
    pub fn create(dir: &Path, topic: &str, segment_id: i64) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = segment_path(dir, segment_id);
        let writer = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let file = OpenOptions::new().read(true).write(true).open(&path)?;
                if file.metadata()?.len() > 0 {
                    return Err(Error::SegmentExists {
                        topic: topic.to_string(),
                        segment_id,
                    });
                }
                file
            }
            Err(e) => return Err(e.into()),
        };

        debug!("Created segment {} for topic {}", segment_id, topic);

        Ok(Self {
            topic: topic.to_string(),
            segment_id,
            path,
            inner: Mutex::new(SegmentInner {
                writer: Some(writer),
                size: 0,
                positions: Vec::new(),
            }),
            sealed: AtomicBool::new(false),
        })
    }

    /// Open an existing segment and rebuild its position index.
    ///
    /// A torn or corrupt tail of a writable segment is truncated; a sealed
    /// segment only indexes its valid prefix.
    pub fn open(dir: &Path, topic: &str, segment_id: i64, sealed: bool) -> Result<Self> {
        let path = segment_path(dir, segment_id);
        let mut file = OpenOptions::new().read(true).write(!sealed).open(&path)?;
        let len = file.metadata()?.len();

        let mut positions = Vec::new();
        let mut valid_len = 0usize;
        if len > 0 {
            // SAFETY: the file stays open for the lifetime of the map and all
            // slice accesses are bounds checked in decode_frame.
            let mmap = unsafe { Mmap::map(&file)? };
            let mut pos = 0usize;
            while pos < mmap.len() {
                match decode_frame(&mmap, pos) {
                    Frame::Complete { next, .. } => {
                        positions.push(pos as u64);
                        pos = next;
                    }
                    Frame::Truncated | Frame::CrcMismatch => break,
                }
            }
            valid_len = pos;
        }

        if (valid_len as u64) < len {
            if sealed {
                warn!(
                    "Sealed segment {} of {} has {} invalid trailing bytes",
                    segment_id,
                    topic,
                    len - valid_len as u64
                );
            } else {
                warn!(
                    "Truncating segment {} of {} from {} to {} bytes",
                    segment_id, topic, len, valid_len
                );
                file.set_len(valid_len as u64)?;
                file.sync_all()?;
            }
        }

        let writer = if sealed {
            None
        } else {
            file.seek(SeekFrom::Start(valid_len as u64))?;
            Some(file)
        };

        debug!(
            "Opened segment {} of {} with {} entries",
            segment_id,
            topic,
            positions.len()
        );

        Ok(Self {
            topic: topic.to_string(),
            segment_id,
            path,
            inner: Mutex::new(SegmentInner {
                writer,
                size: valid_len as u64,
                positions,
            }),
            sealed: AtomicBool::new(sealed),
        })
    }

    /// Append a message and return its entry id
    pub fn append(&self, message: &Message, sync: bool) -> Result<i64> {
        let frame = encode_frame(&message.to_bytes()?);

        let mut inner = self.inner.lock();
        let position = inner.size;
        let entry_id = inner.positions.len() as i64;
        let writer = inner.writer.as_mut().ok_or_else(|| {
            Error::Other(format!(
                "Segment {} of {} is not writable",
                self.segment_id, self.topic
            ))
        })?;

        if let Err(e) = write_frame(writer, &frame, position, self.segment_id, sync) {
            if matches!(e, Error::Corrupted { .. }) {
                // The file end is unknown, stop appending here
                inner.writer = None;
            }
            return Err(e);
        }

        inner.size += frame.len() as u64;
        inner.positions.push(position);
        Ok(entry_id)
    }

    /// Read up to `max` entries starting at `entry_id`
    pub fn read(&self, entry_id: i64, max: usize) -> Result<Vec<(Offset, Message)>> {
        let (start, end, first_position, size) = {
            let inner = self.inner.lock();
            let count = inner.positions.len();
            let start = usize::try_from(entry_id).unwrap_or(usize::MAX);
            if start >= count || max == 0 {
                return Ok(Vec::new());
            }
            (
                start,
                count.min(start.saturating_add(max)),
                inner.positions[start],
                inner.size,
            )
        };

        let file = File::open(&self.path)?;
        // SAFETY: the file stays open for the lifetime of the map; reads stay
        // below `size`, which only covers fully written frames.
        let mmap = unsafe { Mmap::map(&file)? };
        let data = &mmap[..(size as usize).min(mmap.len())];

        let mut entries = Vec::with_capacity(end - start);
        let mut pos = first_position as usize;
        for entry in start..end {
            match decode_frame(data, pos) {
                Frame::Complete { payload, next } => {
                    let message = Message::from_bytes(payload)?;
                    entries.push((Offset::new(self.segment_id, entry as i64), message));
                    pos = next;
                }
                Frame::Truncated => {
                    return Err(Error::Corrupted {
                        segment_id: self.segment_id,
                        position: pos as u64,
                        reason: "truncated frame".into(),
                    })
                }
                Frame::CrcMismatch => {
                    return Err(Error::Corrupted {
                        segment_id: self.segment_id,
                        position: pos as u64,
                        reason: "crc mismatch".into(),
                    })
                }
            }
        }

        Ok(entries)
    }

    /// Flush written data to disk
    pub fn sync(&self) -> Result<()> {
        if let Some(writer) = self.inner.lock().writer.as_ref() {
            writer.sync_all()?;
        }
        Ok(())
    }

    /// Fsync and release the writer. Further appends fail.
    pub fn seal(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(writer) = inner.writer.take() {
            writer.sync_all()?;
        }
        self.sealed.store(true, Ordering::Release);
        Ok(())
    }

    /// Whether the segment reached either rollover limit
    pub fn is_full(&self, max_size: u64, max_entries: u64) -> bool {
        let inner = self.inner.lock();
        inner.size >= max_size || inner.positions.len() as u64 >= max_entries
    }

    pub fn segment_id(&self) -> i64 {
        self.segment_id
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.lock().positions.len() as u64
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
