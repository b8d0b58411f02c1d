//! Bounded-memory artifact streaming.

use crate::digest::DigestEntry;
use crate::error::{StorageError, StorageResult};
use bytes::Bytes;
use futures::Stream;
use std::path::Path;
use std::pin::Pin;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// A boxed stream of byte chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Open `path` for streaming if it still matches `entry`.
///
/// The check runs against the opened descriptor, so the returned handle
/// reads exactly the content the digest describes even if the path is
/// replaced afterwards. Returns `Ok(None)` when the file changed since
/// it was hashed.
pub async fn open_matching(path: &Path, entry: &DigestEntry) -> StorageResult<Option<File>> {
    let what = path.display().to_string();
    let file = File::open(path)
        .await
        .map_err(|e| StorageError::from_io(e, &what))?;
    let meta = file.metadata().await?;
    if entry.matches(&meta) {
        Ok(Some(file))
    } else {
        Ok(None)
    }
}

/// Stream exactly `len` bytes of `file` in chunks of at most `chunk_size`.
///
/// Only one chunk buffer is held at a time. Dropping the stream closes the
/// file, which is how a client disconnect releases the descriptor. A file
/// that ends early yields an error instead of a short body.
pub fn chunked_stream(file: File, len: u64, chunk_size: usize) -> ByteStream {
    let chunk_size = chunk_size.max(1);
    Box::pin(async_stream::try_stream! {
        let mut file = file;
        let mut buf = vec![0u8; chunk_size];
        let mut remaining = len;
        while remaining > 0 {
            let want = usize::try_from(remaining).map_or(chunk_size, |r| r.min(chunk_size));
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                Err(StorageError::Unstable(format!(
                    "file ended {remaining} bytes early"
                )))?;
            }
            remaining -= n as u64;
            yield Bytes::copy_from_slice(&buf[..n]);
        }
    })
}
