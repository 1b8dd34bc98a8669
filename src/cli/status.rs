use std::{fmt::Write, path::Path};

use ansi_term::Colour::{Green, Red, Yellow};
use anyhow::Result;
use chrono::{DateTime, Local, Utc};

use crate::daemon::status::SyncStatus;

use super::process::{daemon_binary, is_daemon_running};

fn local(time: DateTime<Utc>) -> String {
    time.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// Human readable summary of a [SyncStatus].
pub fn render_status(status: &SyncStatus, running: bool) -> String {
    let mut out = String::new();
    let daemon = if running {
        Green.paint("running")
    } else {
        Red.paint("not running")
    };
    let _ = writeln!(out, "Daemon: {daemon}");
    match &status.timeline_key {
        Some(key) => {
            let _ = writeln!(out, "Timeline: {key}");
        }
        None => {
            let _ = writeln!(out, "Timeline: {}", Yellow.paint("not resolved"));
        }
    }
    let _ = writeln!(out, "{} activities pending", status.pending_activities);
    let _ = writeln!(out, "{} screenshots pending", status.pending_screenshots);
    if let Some(time) = status.last_attempt {
        let _ = writeln!(out, "Last attempt: {}", local(time));
    }
    match status.last_success {
        Some(time) => {
            let _ = writeln!(out, "Last successful sync: {}", local(time));
        }
        None => {
            let _ = writeln!(out, "No successful sync yet");
        }
    }
    if let Some(error) = &status.last_error {
        let _ = writeln!(out, "{} {error}", Red.paint("Last sync failed:"));
    }
    out
}

pub async fn print_status(dir: &Path) -> Result<()> {
    let running = is_daemon_running(&daemon_binary()?)?;
    let status = SyncStatus::load(dir).await.unwrap_or_default();
    print!("{}", render_status(&status, running));
    Ok(())
}
