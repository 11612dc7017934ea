pub mod downloader;
pub mod integrity;
pub mod models;
pub mod probe;
pub mod progress;
pub mod range;
pub mod retry;
pub mod stream;
pub mod token;
pub mod transport;
pub mod upload;
pub mod uploader;

#[cfg(test)]
mod fake;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::downloader::{download_file, DownloadError, DownloadReport, Downloader};
    pub use crate::models::{ChunkRange, TransferConfig, TransferDefaults};
    pub use crate::progress::ProgressCallback;
    pub use crate::stream::{open_stream, DownloadStream, StreamError};
    pub use crate::token::{create_token, TokenError, TokenRequest};
    pub use crate::transport::{HttpTransport, Transport, TransportError};
    pub use crate::uploader::{upload_file, UploadReport, Uploader};
    pub use crate::upload::UploadError;
}
