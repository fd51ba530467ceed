#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lighthouse-store-segmented** – Segmented append-only log driver.
//!
//! Frames are written as `u32` big-endian length prefixes followed by the
//! signed event bytes. One active segment (`events_<start>_open.log`)
//! receives appends and is renamed to `events_<start>_<end>.log` when it
//! reaches the rotation bound; rolled segments are immutable. On open the
//! driver scans every segment, rebuilds the sequence index, and truncates
//! any torn trailing record in the active segment so the store resumes from
//! the highest intact sequence.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use lighthouse_event_core::{EventBackend, FsyncPolicy, SealedFrame};

/// Default segment rotation bound (64 MiB).
pub const DEFAULT_ROTATE_BYTES: u64 = 64 * 1024 * 1024;

const FRAME_HEADER_LEN: u64 = 4;

/// Hard cap on a single frame; anything larger is treated as corruption.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

//─────────────────────────────
//  Segment bookkeeping
//─────────────────────────────

#[derive(Debug, Clone)]
struct FrameLocation {
    segment: PathBuf,
    offset: u64,
    len: u32,
}

#[derive(Debug)]
struct ActiveSegment {
    path: PathBuf,
    file: File,
    start_sequence: u64,
    bytes: u64,
}

#[derive(Debug)]
struct Inner {
    active: ActiveSegment,
    sealed: Vec<PathBuf>,
    index: BTreeMap<u64, FrameLocation>,
    tail: u64,
}

/// Append-only segmented log backend.
#[derive(Debug)]
pub struct SegmentedLogBackend {
    dir: PathBuf,
    rotate_bytes: u64,
    fsync_policy: FsyncPolicy,
    inner: Mutex<Inner>,
}

impl SegmentedLogBackend {
    /// Open (or create) a log under `dir` with default rotation.
    pub fn open(dir: impl AsRef<Path>, fsync_policy: FsyncPolicy) -> Result<Self> {
        Self::open_with_rotation(dir, fsync_policy, DEFAULT_ROTATE_BYTES)
    }

    /// Open (or create) a log with an explicit rotation bound.
    pub fn open_with_rotation(
        dir: impl AsRef<Path>,
        fsync_policy: FsyncPolicy,
        rotate_bytes: u64,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating log directory {}", dir.display()))?;

        let mut segments = discover_segments(&dir)?;
        segments.sort_by_key(|s| s.start);

        let mut index = BTreeMap::new();
        let mut sealed = Vec::new();
        let mut tail = 0u64;
        let mut active_meta = None;

        for segment in segments {
            let recovered = scan_segment(&segment.path, segment.start, segment.open, &mut index)?;
            tail = tail.max(recovered.last_sequence);
            if segment.open {
                active_meta = Some((segment.path.clone(), segment.start, recovered.bytes));
            } else {
                sealed.push(segment.path);
            }
        }

        let (path, start_sequence, bytes) = match active_meta {
            Some(meta) => meta,
            None => {
                let start = tail + 1;
                let path = dir.join(format!("events_{start}_open.log"));
                File::create(&path)
                    .with_context(|| format!("creating segment {}", path.display()))?;
                (path, start, 0)
            }
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("opening active segment {}", path.display()))?;

        info!(
            dir = %dir.display(),
            tail,
            sealed = sealed.len(),
            "segmented log opened"
        );

        Ok(Self {
            dir,
            rotate_bytes,
            fsync_policy,
            inner: Mutex::new(Inner {
                active: ActiveSegment {
                    path,
                    file,
                    start_sequence,
                    bytes,
                },
                sealed,
                index,
                tail,
            }),
        })
    }

    fn write_frame(inner: &mut Inner, sequence: u64, frame: &[u8]) -> Result<()> {
        if sequence != inner.tail + 1 {
            bail!(
                "non-contiguous append: expected sequence {}, got {sequence}",
                inner.tail + 1
            );
        }
        if frame.len() as u32 > MAX_FRAME_LEN {
            bail!("frame of {} bytes exceeds segment frame cap", frame.len());
        }

        let offset = inner.active.bytes;
        let len = frame.len() as u32;
        inner.active.file.seek(SeekFrom::Start(offset))?;
        inner.active.file.write_all(&len.to_be_bytes())?;
        inner.active.file.write_all(frame)?;

        inner.active.bytes += FRAME_HEADER_LEN + u64::from(len);
        inner.index.insert(
            sequence,
            FrameLocation {
                segment: inner.active.path.clone(),
                offset,
                len,
            },
        );
        inner.tail = sequence;
        Ok(())
    }

    fn rotate_if_needed(&self, inner: &mut Inner) -> Result<()> {
        if inner.active.bytes < self.rotate_bytes || inner.tail < inner.active.start_sequence {
            return Ok(());
        }
        let start = inner.active.start_sequence;
        let end = inner.tail;
        let sealed_path = self.dir.join(format!("events_{start}_{end}.log"));
        inner.active.file.sync_data()?;
        std::fs::rename(&inner.active.path, &sealed_path)?;
        debug!(segment = %sealed_path.display(), "segment rolled");

        // Index entries for the rolled range now live at the sealed path.
        for location in inner.index.range_mut(start..=end).map(|(_, l)| l) {
            location.segment = sealed_path.clone();
        }
        inner.sealed.push(sealed_path);

        let next_start = end + 1;
        let path = self.dir.join(format!("events_{next_start}_open.log"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        inner.active = ActiveSegment {
            path,
            file,
            start_sequence: next_start,
            bytes: 0,
        };
        Ok(())
    }

    fn truncate_active(inner: &mut Inner, to_bytes: u64) {
        // Roll back a failed multi-frame write so no partial batch is visible.
        if let Err(e) = inner.active.file.set_len(to_bytes) {
            warn!(error = %e, "failed to roll back active segment after write error");
        }
        inner.active.bytes = to_bytes;
    }

    fn read_location(location: &FrameLocation) -> Result<Vec<u8>> {
        let mut file = File::open(&location.segment)
            .with_context(|| format!("opening segment {}", location.segment.display()))?;
        file.seek(SeekFrom::Start(location.offset + FRAME_HEADER_LEN))?;
        let mut frame = vec![0u8; location.len as usize];
        file.read_exact(&mut frame)?;
        Ok(frame)
    }
}

#[async_trait]
impl EventBackend for SegmentedLogBackend {
    async fn append(&self, sequence: u64, frame: &SealedFrame) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let checkpoint = inner.active.bytes;
        if let Err(e) = Self::write_frame(&mut inner, sequence, &frame.bytes) {
            Self::truncate_active(&mut inner, checkpoint);
            inner.index.remove(&sequence);
            inner.tail = inner.tail.min(sequence.saturating_sub(1));
            return Err(e);
        }
        if matches!(self.fsync_policy, FsyncPolicy::PerWrite) {
            if let Err(e) = inner.active.file.sync_data() {
                Self::truncate_active(&mut inner, checkpoint);
                inner.index.remove(&sequence);
                inner.tail = sequence - 1;
                return Err(e).context("fsync failed, append rolled back");
            }
        }
        self.rotate_if_needed(&mut inner)
    }

    async fn append_batch(&self, first_sequence: u64, frames: &[SealedFrame]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let checkpoint = inner.active.bytes;
        let tail_checkpoint = inner.tail;

        let mut undo = |inner: &mut Inner| {
            Self::truncate_active(inner, checkpoint);
            for offset in 0..frames.len() as u64 {
                inner.index.remove(&(first_sequence + offset));
            }
            inner.tail = tail_checkpoint;
        };

        for (offset, frame) in frames.iter().enumerate() {
            if let Err(e) =
                Self::write_frame(&mut inner, first_sequence + offset as u64, &frame.bytes)
            {
                undo(&mut inner);
                return Err(e);
            }
        }
        if matches!(
            self.fsync_policy,
            FsyncPolicy::PerWrite | FsyncPolicy::PerBatch
        ) {
            if let Err(e) = inner.active.file.sync_data() {
                undo(&mut inner);
                return Err(e).context("fsync failed, batch rolled back");
            }
        }
        self.rotate_if_needed(&mut inner)
    }

    async fn read(&self, sequence: u64) -> Result<Option<Vec<u8>>> {
        let location = {
            let inner = self.inner.lock().await;
            inner.index.get(&sequence).cloned()
        };
        match location {
            Some(location) => Ok(Some(Self::read_location(&location)?)),
            None => Ok(None),
        }
    }

    async fn scan(&self, from_sequence: u64, limit: usize) -> Result<Vec<Vec<u8>>> {
        let locations: Vec<FrameLocation> = {
            let inner = self.inner.lock().await;
            inner
                .index
                .range(from_sequence..)
                .take(limit)
                .map(|(_, l)| l.clone())
                .collect()
        };
        locations.iter().map(Self::read_location).collect()
    }

    async fn tail_sequence(&self) -> Result<u64> {
        Ok(self.inner.lock().await.tail)
    }

    async fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.active.file.sync_data()?;
        Ok(())
    }

    async fn disk_usage(&self) -> Result<u64> {
        let inner = self.inner.lock().await;
        let mut total = inner.active.bytes;
        for path in &inner.sealed {
            total += std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        }
        Ok(total)
    }

    async fn segment_count(&self) -> Result<usize> {
        let inner = self.inner.lock().await;
        Ok(inner.sealed.len() + 1)
    }
}

//─────────────────────────────
//  Segment discovery & recovery
//─────────────────────────────

#[derive(Debug)]
struct SegmentMeta {
    path: PathBuf,
    start: u64,
    open: bool,
}

fn discover_segments(dir: &Path) -> Result<Vec<SegmentMeta>> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(|n| n.to_string()) else {
            continue;
        };
        let Some(stem) = name.strip_prefix("events_").and_then(|n| n.strip_suffix(".log"))
        else {
            continue;
        };
        let mut parts = stem.splitn(2, '_');
        let (Some(start), Some(rest)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(start) = start.parse::<u64>() else {
            warn!(file = name, "ignoring segment with unparsable name");
            continue;
        };
        let open = rest == "open";
        segments.push(SegmentMeta {
            path,
            start,
            open,
        });
    }
    Ok(segments)
}

#[derive(Debug)]
struct ScanOutcome {
    last_sequence: u64,
    bytes: u64,
}

/// Scan one segment, filling `index` with frame locations. Sequences are
/// positional: the nth frame of a segment starting at `start` holds
/// sequence `start + n`. A torn trailing record in the active segment is
/// truncated away; in a sealed segment it is an error.
fn scan_segment(
    path: &Path,
    start: u64,
    active: bool,
    index: &mut BTreeMap<u64, FrameLocation>,
) -> Result<ScanOutcome> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut offset = 0u64;
    let mut sequence = start;
    let mut header = [0u8; 4];

    while offset + FRAME_HEADER_LEN <= file_len {
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut header)?;
        let len = u32::from_be_bytes(header);
        let end = offset + FRAME_HEADER_LEN + u64::from(len);
        if len > MAX_FRAME_LEN || end > file_len {
            break;
        }
        index.insert(
            sequence,
            FrameLocation {
                segment: path.to_path_buf(),
                offset,
                len,
            },
        );
        sequence += 1;
        offset = end;
    }

    if offset < file_len {
        if active {
            warn!(
                segment = %path.display(),
                torn_bytes = file_len - offset,
                "truncating torn trailing record"
            );
            OpenOptions::new().write(true).open(path)?.set_len(offset)?;
        } else {
            bail!(
                "sealed segment {} has {} trailing bytes of corruption",
                path.display(),
                file_len - offset
            );
        }
    }

    Ok(ScanOutcome {
        last_sequence: sequence.saturating_sub(1),
        bytes: offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn frame(n: u64) -> SealedFrame {
        SealedFrame {
            bytes: format!("frame-{n}-payload").into_bytes(),
            aggregate_id: format!("agent:{n}"),
            event_type: "command_received".to_string(),
            timestamp_ns: n * 1_000,
        }
    }

    fn bytes(n: u64) -> Vec<u8> {
        frame(n).bytes
    }

    #[tokio::test]
    async fn append_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SegmentedLogBackend::open(dir.path(), FsyncPolicy::PerWrite).unwrap();

        for n in 1..=5 {
            backend.append(n, &frame(n)).await.unwrap();
        }
        assert_eq!(backend.tail_sequence().await.unwrap(), 5);
        assert_eq!(backend.read(3).await.unwrap().unwrap(), bytes(3));
        assert!(backend.read(6).await.unwrap().is_none());

        let scanned = backend.scan(2, 2).await.unwrap();
        assert_eq!(scanned, vec![bytes(2), bytes(3)]);
    }

    #[tokio::test]
    async fn rejects_non_contiguous_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SegmentedLogBackend::open(dir.path(), FsyncPolicy::PerWrite).unwrap();
        backend.append(1, &frame(1)).await.unwrap();
        assert!(backend.append(3, &frame(3)).await.is_err());
        assert_eq!(backend.tail_sequence().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SegmentedLogBackend::open(dir.path(), FsyncPolicy::PerBatch).unwrap();
        backend
            .append_batch(1, &[frame(1), frame(2), frame(3)])
            .await
            .unwrap();
        assert_eq!(backend.tail_sequence().await.unwrap(), 3);

        // Wrong starting sequence leaves the log untouched.
        assert!(backend.append_batch(7, &[frame(7)]).await.is_err());
        assert_eq!(backend.tail_sequence().await.unwrap(), 3);
        assert!(backend.read(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reopen_recovers_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = SegmentedLogBackend::open(dir.path(), FsyncPolicy::PerWrite).unwrap();
            for n in 1..=10 {
                backend.append(n, &frame(n)).await.unwrap();
            }
        }
        let backend = SegmentedLogBackend::open(dir.path(), FsyncPolicy::PerWrite).unwrap();
        assert_eq!(backend.tail_sequence().await.unwrap(), 10);
        assert_eq!(backend.read(10).await.unwrap().unwrap(), bytes(10));
    }

    #[tokio::test]
    async fn torn_trailing_record_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = SegmentedLogBackend::open(dir.path(), FsyncPolicy::PerWrite).unwrap();
            for n in 1..=4 {
                backend.append(n, &frame(n)).await.unwrap();
            }
        }

        // Simulate a crash mid-write: a length prefix promising more bytes
        // than were flushed.
        let active = dir.path().join("events_1_open.log");
        let mut file = OpenOptions::new().append(true).open(&active).unwrap();
        file.write_all(&100u32.to_be_bytes()).unwrap();
        file.write_all(b"partial").unwrap();
        drop(file);

        let backend = SegmentedLogBackend::open(dir.path(), FsyncPolicy::PerWrite).unwrap();
        assert_eq!(backend.tail_sequence().await.unwrap(), 4);

        // The next append lands at the sequence after the intact tail.
        backend.append(5, &frame(5)).await.unwrap();
        assert_eq!(backend.read(5).await.unwrap().unwrap(), bytes(5));
        assert_eq!(backend.read(4).await.unwrap().unwrap(), bytes(4));
    }

    #[tokio::test]
    async fn rotation_seals_segments_and_keeps_reads_working() {
        let dir = tempfile::tempdir().unwrap();
        let backend =
            SegmentedLogBackend::open_with_rotation(dir.path(), FsyncPolicy::PerWrite, 64)
                .unwrap();
        for n in 1..=6 {
            backend.append(n, &frame(n)).await.unwrap();
        }
        assert!(backend.segment_count().await.unwrap() > 1);
        for n in 1..=6 {
            assert_eq!(backend.read(n).await.unwrap().unwrap(), bytes(n));
        }

        // Sealed segments survive reopen.
        drop(backend);
        let backend = SegmentedLogBackend::open(dir.path(), FsyncPolicy::PerWrite).unwrap();
        assert_eq!(backend.tail_sequence().await.unwrap(), 6);
        assert_eq!(backend.read(1).await.unwrap().unwrap(), bytes(1));
    }

    #[tokio::test]
    async fn disk_usage_grows_with_appends() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SegmentedLogBackend::open(dir.path(), FsyncPolicy::PerWrite).unwrap();
        let before = backend.disk_usage().await.unwrap();
        backend.append(1, &frame(1)).await.unwrap();
        assert!(backend.disk_usage().await.unwrap() > before);
    }
}
