//! # Authenticated MJPEG streaming server
//!
//! Accepts TLS viewer connections, gates them behind HTTP Basic credentials and
//! per-address rate limiting, and fans a single live JPEG feed out to every
//! admitted client as a `multipart/x-mixed-replace` stream.
//!
//! The entry point for embedders is [`server::StreamServer`]: start it, hand it
//! frames, stop it.

pub mod config;
pub mod server;
pub mod utils;
