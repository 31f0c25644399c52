//! Evidence blob storage and the paced HTTP client used for registry fetches.

mod blob;
mod http;

pub use blob::{BlobStore, StoredBlob};
pub use http::{
    is_retryable_status, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher,
    RequestPacer, RetryPolicy,
};

pub const CRATE_NAME: &str = "pipewatch-storage";
