//! IPC Tailer (C5): follows the append-only IPC file an injected reporter
//! writes to and turns new lines into normalized events.
//!
//! No OS file-change-notification crate is part of this implementation's
//! dependency stack (see DESIGN.md). spec.md §4.5 explicitly sanctions a
//! polling fallback when the watcher is unavailable ("if the watcher itself
//! fails, the tailer falls back to a periodic read loop") and §5 fixes that
//! fallback's interval at 100 ms; this tailer implements that polling loop
//! as its permanent strategy rather than a fallback-only path.

use std::path::PathBuf;

use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

use crate::event::{Event, LineCodec};

/// Runs the tailer until `shutdown` fires. Creates the IPC file if it does
/// not exist yet (the adapter may not have started writing), then polls for
/// growth at `poll_interval`, decoding and forwarding every complete line.
///
/// File truncation (new size smaller than the cursor) is not expected in
/// normal operation; if it happens the cursor resets to zero and a warning
/// is logged, per spec.md §4.5.
pub async fn run(
    path: PathBuf,
    poll_interval: Duration,
    events: mpsc::Sender<Event>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    // Touch the file so it exists even if the child never writes to it.
    let _ = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await;

    let mut cursor: u64 = 0;
    let mut codec = LineCodec::new();
    let mut ticker = interval(poll_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                cursor = poll_once(&path, cursor, &mut codec, &events).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    // One last pass to pick up anything written just before shutdown.
                    poll_once(&path, cursor, &mut codec, &events).await;
                    break;
                }
            }
        }
    }
}

async fn poll_once(
    path: &std::path::Path,
    cursor: u64,
    codec: &mut LineCodec,
    events: &mpsc::Sender<Event>,
) -> u64 {
    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return cursor;
    };
    let Ok(metadata) = file.metadata().await else {
        return cursor;
    };
    let len = metadata.len();

    let cursor = if len < cursor {
        tracing::warn!(path = %path.display(), "IPC file shrank, resetting tail cursor");
        0
    } else {
        cursor
    };

    if len == cursor {
        return cursor;
    }

    if file.seek(SeekFrom::Start(cursor)).await.is_err() {
        return cursor;
    }

    let mut buf = Vec::with_capacity((len - cursor) as usize);
    if file.read_to_end(&mut buf).await.is_err() {
        return cursor;
    }

    let new_cursor = cursor + buf.len() as u64;
    for event in codec.feed(&buf) {
        if events.send(event).await.is_err() {
            break;
        }
    }

    new_cursor
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[tokio::test]
    async fn tails_lines_appended_after_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipc.jsonl");
        std::fs::write(&path, "").unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        let handle = tokio::spawn(run(path.clone(), Duration::from_millis(5), tx, shutdown_rx));

        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(f, r#"{{"eventType":"collectionStart","payload":{{}}}}"#).unwrap();
        }

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed");
        assert!(matches!(event, Event::CollectionStart));

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }

    #[tokio::test]
    async fn resets_cursor_on_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipc.jsonl");
        tokio::fs::write(&path, "0123456789").await.unwrap();

        let mut codec = LineCodec::new();
        let (tx, _rx) = mpsc::channel(16);
        let cursor = poll_once(&path, 10, &mut codec, &tx).await;
        assert_eq!(cursor, 10);

        tokio::fs::write(&path, "abc").await.unwrap();
        let cursor = poll_once(&path, cursor, &mut codec, &tx).await;
        assert_eq!(cursor, 3);
    }
}
