//! SQLite state store, HTTP fetch utilities and call pacing for RSM.

mod http;
mod pacing;
mod store;

pub use http::{
    classify_reqwest_error, classify_status, FetchError, FetchedResponse, HttpClientConfig,
    HttpFetcher, RetryDisposition,
};
pub use pacing::{BackoffPolicy, Clock, ManualClock, SystemClock, TokenBucket, TokenBucketConfig};
pub use store::{
    ScoreCandidate, StatusCounts, Store, StoreError, StoreTx, DEFAULT_BUSY_TIMEOUT,
};

pub const CRATE_NAME: &str = "rsm-storage";
