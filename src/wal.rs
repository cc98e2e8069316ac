//! Newline-delimited JSON write-ahead buffer
//!
//! The buffer sits between the freshness cache and storage. One writer appends
//! a line per accepted sample; the drain periodically moves the file content
//! into storage and then removes what it committed.
//!
//! ```text
//!  writer ── append ──▶ [ line 1 | line 2 | ... | line n ][ appended mid-drain ]
//!                        └──────── snapshot ─────────────┘
//!  drain  ── read snapshot, commit, compact ──▶ [ appended mid-drain ]
//! ```
//!
//! Appends, snapshots and compaction all take the same lock, so a snapshot
//! always ends on a line boundary and the drain never removes bytes it has
//! not read.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, Take};
use tokio::sync::Mutex;
use tracing::{debug, instrument, trace, warn};

use crate::BufferedRecord;

/// Shared handle to the buffer file
#[derive(Debug)]
pub struct WriteAheadBuffer {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl WriteAheadBuffer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open (or create) the file for appending
    ///
    /// Opening an already open buffer is a no-op.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn open(&self) -> io::Result<()> {
        let mut guard = self.file.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        // a staging file left by an interrupted compaction was never swapped
        // in, so the buffer itself is intact
        match tokio::fs::remove_file(self.staging_path()).await {
            Ok(()) => warn!("removed leftover compaction file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let file = open_append(&self.path).await?;

        debug!("opened write-ahead buffer");
        *guard = Some(file);
        Ok(())
    }

    /// Append one record as a single JSON line and flush it
    pub async fn append(&self, record: &BufferedRecord) -> io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "buffer is not open"))?;

        file.write_all(&line).await?;
        file.flush().await?;

        trace!(vmid = record.vmid, time = record.sample.time, "appended record");
        Ok(())
    }

    /// Flush and release the append handle
    pub async fn close(&self) -> io::Result<()> {
        if let Some(mut file) = self.file.lock().await.take() {
            file.flush().await?;
            file.sync_all().await?;
            debug!("closed write-ahead buffer");
        }
        Ok(())
    }

    /// Current length of the file; a missing file has length 0
    pub async fn snapshot(&self) -> io::Result<u64> {
        let _guard = self.file.lock().await;
        file_len(&self.path).await
    }

    /// Reader over the first `len` bytes of the file
    ///
    /// Reading does not hold the lock; appends only ever touch bytes past
    /// `len`.
    pub async fn reader(&self, len: u64) -> io::Result<SnapshotReader> {
        let inner = match File::open(&self.path).await {
            Ok(file) => Some(BufReader::new(file.take(len))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };
        Ok(SnapshotReader { inner })
    }

    /// Remove the first `snapshot` bytes, keeping anything appended after them
    ///
    /// The kept tail is written to a sibling file which then replaces the
    /// buffer, so the buffer on disk is always either the old or the new
    /// content. Returns the number of bytes left in the file.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn compact(&self, snapshot: u64) -> io::Result<u64> {
        let mut guard = self.file.lock().await;

        let len = file_len(&self.path).await?;
        if len <= snapshot {
            if len > 0 {
                let file = OpenOptions::new().write(true).open(&self.path).await?;
                file.set_len(0).await?;
                file.sync_all().await?;
                debug!("truncated buffer");
            }
            return Ok(0);
        }

        let mut tail = Vec::with_capacity((len - snapshot) as usize);
        let mut source = File::open(&self.path).await?;
        source.seek(io::SeekFrom::Start(snapshot)).await?;
        source.read_to_end(&mut tail).await?;

        let staging = self.staging_path();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&staging)
            .await?;
        file.write_all(&tail).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&staging, &self.path).await?;

        // the old handle still points at the replaced file
        if guard.is_some() {
            *guard = Some(open_append(&self.path).await?);
        }

        debug!(kept = tail.len(), "compacted buffer, kept records appended during drain");
        Ok(tail.len() as u64)
    }

    /// Where `compact` stages the kept tail before swapping it in
    fn staging_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".compact");
        PathBuf::from(name)
    }
}

async fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

async fn file_len(path: &Path) -> io::Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

/// Line reader bounded to a snapshot of the buffer
pub struct SnapshotReader {
    inner: Option<BufReader<Take<File>>>,
}

impl SnapshotReader {
    /// Next raw line without its trailing newline, `None` at the snapshot end
    pub async fn next_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        let Some(reader) = self.inner.as_mut() else {
            return Ok(None);
        };

        let mut line = Vec::new();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(None);
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        Ok(Some(line))
    }
}
