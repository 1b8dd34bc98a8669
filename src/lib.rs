//! Background agent that samples which application is in the foreground, captures periodic
//! screenshots, and relays both to a time-tracking server: activities as change-log batches,
//! screenshots to a separate sink. Everything queued survives failed uploads and is retried.

pub mod api;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod fs;
pub mod sink;
pub mod source;
pub mod utils;
