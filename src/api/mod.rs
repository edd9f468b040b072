//! Wire types and the typed HTTP client.

pub mod client;
pub mod types;

pub use client::ApiClient;
