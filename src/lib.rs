#![forbid(unsafe_code)]

//! Shared library for the CNVRTR backend: yt-dlp invocation, playlist
//! metadata resolution, and the batch download orchestrator that streams
//! progress back to the browser.

pub mod config;
pub mod download;
pub mod extractor;
pub mod limiter;
pub mod playlist;
pub mod security;
