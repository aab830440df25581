//! Inbound HTTP surface of the gateway.

pub mod admin;
pub mod http;

pub use http::{app, serve};
