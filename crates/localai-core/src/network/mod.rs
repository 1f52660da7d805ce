//! HTTP plumbing shared by the downloader, the gallery and the P2P gossip.

mod client;
mod retry;

pub use client::HttpClient;
pub use retry::{retry_async, RetryConfig, RetryStats};
