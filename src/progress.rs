// src/progress.rs

use std::io::ErrorKind;
use std::path::Path;

/// Callback invoked with `(bytes_done, total_bytes)` after each confirmed chunk.
pub type ProgressCallback = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Returns the byte length already on disk at `path`, or 0 if it does not exist.
///
/// The file length is the only resumption checkpoint: nothing else records
/// how far a download got.
pub async fn local_size(path: &Path) -> std::io::Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}
