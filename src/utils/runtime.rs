use anyhow::Result;

/// The daemon runs every task of a session on one thread; the tasks only ever wait on I/O.
pub fn single_thread_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}
