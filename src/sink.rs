//! Output Sink (C7): mirrors the child's raw stdout/stderr into a single
//! append-only `output.log`, byte-for-byte, in arrival order.
//!
//! Decoupling disk from the child's pipes prevents backpressure-induced loss
//! under heavy output, gives the Native Output Parser (C6) a stable file to
//! tail, and preserves a debuggable artifact. Two reader tasks (one per pipe)
//! funnel chunks through a single mpsc channel so one writer task owns the
//! file and arrival order is preserved regardless of which pipe produced a
//! chunk first.

use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to open output log at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A chunk of raw bytes read from the child, tagged with its origin only for
/// diagnostics; `output.log` itself is origin-agnostic.
pub struct OutputChunk {
    pub bytes: Vec<u8>,
}

/// Spawns a reader task that copies bytes from `reader` into `tx` until EOF.
/// Used for both the child's stdout and stderr handles.
pub fn spawn_reader<R>(mut reader: R, tx: mpsc::Sender<OutputChunk>) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(OutputChunk { bytes: buf[..n].to_vec() }).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })
}

/// Owns `output.log` for the duration of the run. Receives chunks from the
/// reader tasks and appends them in the order received.
pub struct OutputSink {
    file: File,
}

impl OutputSink {
    pub async fn create(path: &Path) -> Result<Self, SinkError> {
        let file = File::create(path).await.map_err(|source| SinkError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self { file })
    }

    /// Drains `rx` until all senders are dropped, appending every chunk.
    /// Returns the total bytes written, useful for diagnostics.
    pub async fn drain(&mut self, mut rx: mpsc::Receiver<OutputChunk>) -> std::io::Result<u64> {
        let mut total = 0u64;
        while let Some(chunk) = rx.recv().await {
            self.file.write_all(&chunk.bytes).await?;
            total += chunk.bytes.len() as u64;
        }
        Ok(total)
    }

    /// Flushes and syncs the file to disk for cross-platform durability,
    /// then drops the handle.
    pub async fn close(mut self) -> std::io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }
}

/// Reads the tail of `output.log`, for surfacing execution errors per
/// spec.md §7 category 2 ("echo the tail of output.log to the console").
pub async fn read_tail(path: &Path, max_bytes: u64) -> std::io::Result<String> {
    use tokio::io::{AsyncSeekExt, SeekFrom};

    let mut file = File::open(path).await?;
    let len = file.metadata().await?.len();
    let start = len.saturating_sub(max_bytes);
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_writes_chunks_in_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.log");
        let mut sink = OutputSink::create(&path).await.unwrap();

        let (tx, rx) = mpsc::channel(16);
        tx.send(OutputChunk { bytes: b"hello ".to_vec() }).await.unwrap();
        tx.send(OutputChunk { bytes: b"world".to_vec() }).await.unwrap();
        drop(tx);

        let written = sink.drain(rx).await.unwrap();
        assert_eq!(written, 11);
        sink.close().await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "hello world");
    }

    #[tokio::test]
    async fn reader_task_forwards_bytes_until_eof() {
        let data = b"line one\nline two\n".to_vec();
        let reader = std::io::Cursor::new(data.clone());
        let (tx, mut rx) = mpsc::channel(16);
        spawn_reader(reader, tx).await.unwrap();

        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            collected.extend(chunk.bytes);
        }
        assert_eq!(collected, data);
    }

    #[tokio::test]
    async fn read_tail_returns_only_the_requested_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.log");
        tokio::fs::write(&path, "0123456789").await.unwrap();
        let tail = read_tail(&path, 4).await.unwrap();
        assert_eq!(tail, "6789");
    }
}
