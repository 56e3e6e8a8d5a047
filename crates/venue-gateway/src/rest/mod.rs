//! REST 전송 경계.

pub mod client;

pub use client::RestClient;
