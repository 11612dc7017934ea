use md5::{Digest, Md5};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("cannot hash {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Compute the lowercase hex MD5 of a file asynchronously.
///
/// The gateway uses this digest to recognize repeated attempts at the same file.
pub async fn md5_hex(path: &Path) -> Result<String, IntegrityError> {
    let io = |source: std::io::Error| IntegrityError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).await.map_err(io)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer).await.map_err(io)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
