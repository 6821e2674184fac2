//! Request/response snapshots and the network seam used by the agent.

mod client;
mod types;

pub use client::{Fetcher, HttpFetcher};
pub use types::{Request, Response};

#[cfg(test)]
pub use types::ResponseType;
