//! Moving bytes between the API, the working folder and the CDN.

pub mod cdn;
pub mod download;
pub mod hashing;
pub mod ledger;
pub mod pool;
pub mod retry;
pub mod upload;

pub use cdn::{B2Client, CdnStore};
pub use download::{AssetFetcher, BatchResult, DownloadCoordinator, DownloadRequest, HttpFetcher};
pub use ledger::{LedgerError, TransferStateStore};
pub use pool::TransferPool;
pub use retry::RetryPolicy;
pub use upload::{build_remote_path, UploadCoordinator};
