pub mod client;
pub mod sse;

pub use client::UpstreamClient;
