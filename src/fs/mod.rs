//! File helpers shared by the screenshot queue, the status file and credentials.

pub mod operations;
