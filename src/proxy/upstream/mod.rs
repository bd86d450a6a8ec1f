// Upstream module - forwarding engine and connectivity checker

pub mod client;

pub use client::{ConnectivityReport, ForwardPayload, UpstreamClient};
