use std::{
    ffi::OsString,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use tokio::{
    fs::{self, File},
    io::{self, AsyncWriteExt},
};

/// Suffix of a file that is still being written. Readers must ignore such files.
pub const PARTIAL_SUFFIX: &str = "tmp";

/// Path of the temporary sibling used while `path` is being written.
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    path.with_file_name(name)
}

/// Writes `contents` next to `path`, flushes it to disk and renames it into place. A reader
/// either sees the complete file or no file at all, even if the process dies midway.
pub async fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), io::Error> {
    let partial = partial_path(path);
    let mut file = File::create(&partial).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&partial, path).await
}

/// Removes a file, treating an already missing file as success.
pub async fn remove_if_exists(path: &Path) -> Result<bool, io::Error> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

pub async fn file_exists(path: &Path) -> Result<bool, io::Error> {
    fs::try_exists(path).await
}
