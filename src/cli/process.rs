use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use anyhow::{anyhow, Result};
use sysinfo::{get_current_pid, Pid, Process, Signal, System};
use tracing::info;

use super::daemon_path::to_daemon_path;

fn current_pid() -> Result<Pid> {
    get_current_pid().map_err(|e| anyhow!("Can't determine own pid: {e}"))
}

fn daemon_processes<'a>(
    system: &'a System,
    name: &'a Path,
    current: Pid,
) -> impl Iterator<Item = &'a Process> + 'a {
    system.processes().iter().filter_map(move |(pid, process)| {
        if *pid == current || matches!(process.parent(), Some(p) if p == current) {
            return None;
        }
        process
            .exe()
            .filter(|v| v.exists() && name == *v)
            .map(|_| process)
    })
}

pub fn daemon_binary() -> Result<PathBuf> {
    Ok(to_daemon_path(std::env::current_exe()?))
}

/// Whether a daemon started from `name` is running.
pub fn is_daemon_running(name: &Path) -> Result<bool> {
    let system = System::new_all();
    let running = daemon_processes(&system, name, current_pid()?)
        .next()
        .is_some();
    Ok(running)
}

/// Stops every daemon started from `name`. Returns how many were stopped.
pub fn kill_previous_servers(name: &Path) -> Result<usize> {
    let system = System::new_all();
    let mut stopped = 0;
    for process in daemon_processes(&system, name, current_pid()?) {
        // This will forcefully terminate the process on Windows. The daemon handles SIGTERM on
        // unix by finishing its session.
        if process.kill_with(Signal::Term).is_none() {
            process.kill();
        }
        process.wait();
        info!("Stopped daemon {}", process.pid());
        stopped += 1;
    }
    Ok(stopped)
}

/// Stops any running daemon and starts a fresh one. The daemon binary detaches by itself.
pub fn restart_server(dir: Option<&Path>) -> Result<()> {
    let daemon = daemon_binary()?;
    kill_previous_servers(&daemon)?;

    let mut command = std::process::Command::new(&daemon);
    if let Some(dir) = dir {
        command.arg("--dir").arg(dir);
    }
    command.stdin(Stdio::null());
    command.stdout(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    info!("Spawning {daemon:?}");
    let status = command.status()?;
    if !status.success() {
        return Err(anyhow!("Daemon failed to start: {status}"));
    }
    println!("Daemon started");
    Ok(())
}
