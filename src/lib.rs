//! A minimal TCP request/response pipeline.
//!
//! The listener accepts one connection at a time, reads the request until the
//! peer half-closes, answers with a canned payload and closes. The client
//! connects, sends a short token, half-closes and drains the response. Every
//! phase is sequenced through a [`CompletionGate`](gate::CompletionGate).

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod gate;
pub mod listener;
pub mod payload;

pub use error::{Error, Result};
