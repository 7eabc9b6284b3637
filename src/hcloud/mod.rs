/// Hetzner Cloud API client implementation
pub mod client;
pub mod models;

pub use client::{api_error, HcloudClient, HcloudError};
