//! Filesystem operations behind the receiver's write-then-rename commit.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::is_temp_name;
use crate::error::Result;

const HASH_BUFFER: usize = 1024 * 1024;

/// Write `data` to the temp file. `truncate` starts it over, otherwise append.
/// Returns the temp file's length afterwards.
pub async fn write_chunk(temp: &Path, data: &[u8], truncate: bool) -> Result<u64> {
    if let Some(parent) = temp.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut options = fs::OpenOptions::new();
    options.create(true);
    if truncate {
        options.write(true).truncate(true);
    } else {
        options.append(true);
    }
    let mut file = options.open(temp).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_data().await?;

    Ok(file.metadata().await?.len())
}

/// Length of `path`, or `None` if it does not exist.
pub async fn file_len(path: &Path) -> Result<Option<u64>> {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Size and lowercase hex SHA-256 of a file.
pub async fn sha256_file(path: &Path) -> Result<(u64, String)> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((total, hex::encode(hasher.finalize())))
}

pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Atomically move the finished temp file into place, replacing any existing file.
pub async fn commit(temp: &Path, final_path: &Path) -> Result<()> {
    if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::rename(temp, final_path).await?;
    Ok(())
}

/// Remove a file; a missing file is not an error.
pub async fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Delete `*.part` files under `root` not modified for `ttl`.
pub async fn sweep_part_files(root: &Path, ttl: Duration, now: SystemTime) -> Result<u64> {
    let mut removed = 0u64;
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let path = entry.path();
            if file_type.is_dir() {
                stack.push(path);
                continue;
            }
            if !file_type.is_file() || !is_temp_name(&path) {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age >= ttl && remove_if_exists(&path).await? {
                tracing::info!(path = %path.display(), age_secs = age.as_secs(), "Swept orphaned temp file");
                removed += 1;
            }
        }
    }

    Ok(removed)
}
