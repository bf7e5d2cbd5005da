//! Storage layout for incoming transfers.
//!
//! Peers address a write by `(path_id, tier, relative_path)`. This module turns
//! that triple into an absolute path and refuses anything that would land
//! outside the configured tier directory.

pub mod filesystem;

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use crate::config::StoragePathConfig;
use crate::error::{AppError, Result};
use crate::models::file_record::StorageTier;

/// Suffix of in-flight temp files.
pub const PART_SUFFIX: &str = ".part";

#[derive(Debug, Clone)]
pub struct StorageLayout {
    paths: Vec<StoragePathConfig>,
}

/// Where an absolute local path sits in the layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedPath {
    pub path_id: i64,
    pub tier: StorageTier,
    pub relative_path: String,
}

impl StorageLayout {
    pub fn new(paths: Vec<StoragePathConfig>) -> Self {
        Self { paths }
    }

    pub fn tier_dir(&self, path_id: i64, tier: StorageTier) -> Result<&Path> {
        let cfg = self
            .paths
            .iter()
            .find(|p| p.id == path_id)
            .ok_or_else(|| AppError::Validation(format!("Unknown storage path id {}", path_id)))?;
        Ok(match tier {
            StorageTier::Hot => cfg.hot_path.as_path(),
            StorageTier::Cold => cfg.cold_path.as_path(),
        })
    }

    /// Every tier directory, for sweeping.
    pub fn tier_dirs(&self) -> impl Iterator<Item = &Path> {
        self.paths
            .iter()
            .flat_map(|p| [p.hot_path.as_path(), p.cold_path.as_path()])
    }

    /// Resolve a peer-supplied location to an absolute path inside its tier.
    pub async fn resolve(&self, path_id: i64, tier: StorageTier, relative: &str) -> Result<PathBuf> {
        let relative = validate_relative(relative)?;
        let base = self.tier_dir(path_id, tier)?;
        tokio::fs::create_dir_all(base).await?;
        let candidate = base.join(relative);
        ensure_within(base, &candidate).await?;
        Ok(candidate)
    }

    /// Map an absolute local path back to `(path_id, tier, relative)`.
    pub fn locate(&self, absolute: &Path) -> Option<LocatedPath> {
        for cfg in &self.paths {
            for (tier, base) in [
                (StorageTier::Hot, &cfg.hot_path),
                (StorageTier::Cold, &cfg.cold_path),
            ] {
                if let Ok(rest) = absolute.strip_prefix(base) {
                    let relative = rest
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/");
                    if !relative.is_empty() {
                        return Some(LocatedPath {
                            path_id: cfg.id,
                            tier,
                            relative_path: relative,
                        });
                    }
                }
            }
        }
        None
    }
}

/// Lexical check of a peer-supplied relative path.
pub fn validate_relative(relative: &str) -> Result<PathBuf> {
    if relative.trim().is_empty() {
        return Err(AppError::Validation("relative_path is empty".into()));
    }
    if relative.contains('\0') {
        return Err(AppError::Security("relative_path contains a NUL byte".into()));
    }
    if relative.split(['/', '\\']).any(|seg| seg == "..") {
        return Err(AppError::Security(format!(
            "Path traversal rejected: {}",
            relative
        )));
    }

    let mut clean = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(AppError::Security(format!(
                    "Path traversal rejected: {}",
                    relative
                )));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(AppError::Validation("relative_path names no file".into()));
    }
    if is_temp_name(&clean) {
        return Err(AppError::Validation(format!(
            "relative_path may not end in {}: {}",
            PART_SUFFIX, relative
        )));
    }
    Ok(clean)
}

/// Check `candidate` resolves under `base` once symlinks are followed.
///
/// The candidate may not exist yet, so its nearest existing ancestor is
/// canonicalized instead.
pub async fn ensure_within(base: &Path, candidate: &Path) -> Result<()> {
    let base = tokio::fs::canonicalize(base).await?;
    let mut probe = candidate.to_path_buf();
    loop {
        match tokio::fs::canonicalize(&probe).await {
            Ok(real) => {
                if real.starts_with(&base) {
                    return Ok(());
                }
                return Err(AppError::Security(format!(
                    "Path escapes storage directory: {}",
                    candidate.display()
                )));
            }
            Err(_) => {
                if !probe.pop() {
                    return Err(AppError::Security(format!(
                        "Path has no existing ancestor: {}",
                        candidate.display()
                    )));
                }
            }
        }
    }
}

/// Whether the file name carries the temp suffix, in any case.
pub fn is_temp_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| {
            n.len() >= PART_SUFFIX.len()
                && n.is_char_boundary(n.len() - PART_SUFFIX.len())
                && n[n.len() - PART_SUFFIX.len()..].eq_ignore_ascii_case(PART_SUFFIX)
        })
        .unwrap_or(false)
}

/// `dir/name.ext` -> `dir/name.ext.part`
pub fn temp_path(final_path: &Path) -> PathBuf {
    let mut name: OsString = final_path.file_name().map(OsString::from).unwrap_or_default();
    name.push(PART_SUFFIX);
    final_path.with_file_name(name)
}

/// `name.ext` -> `name (n).ext`, keeping the directory part.
pub fn numbered_variant(relative: &str, n: u32) -> String {
    let (dir, file) = match relative.rfind('/') {
        Some(i) => (&relative[..=i], &relative[i + 1..]),
        None => ("", relative),
    };
    match file.rfind('.') {
        Some(dot) if dot > 0 => format!("{}{} ({}){}", dir, &file[..dot], n, &file[dot..]),
        _ => format!("{}{} ({})", dir, file, n),
    }
}
