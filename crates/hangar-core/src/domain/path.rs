//! Path rules - Artifact Path の解決と封じ込め
//!
//! 2 段階で検証します。
//!
//! 1. [`resolve_path`]: 純粋に字句的な解決。`..` や絶対パスで job
//!    ディレクトリの外に出るものはここで拒否され、ファイルシステムには一切触れません。
//! 2. [`confine`]: シンボリックリンク対策。解決済みパスのうち実在する最も深い祖先を
//!    canonicalize し、それが job ディレクトリ（未作成なら root）の内側かを確認します。

use std::io;
use std::path::{Component, Path, PathBuf};

use tokio::fs;

use super::errors::StoreError;
use super::ids::JobId;

/// `ResolvePath`: join `root`, `job`, and `segments` without touching the
/// filesystem.
///
/// Each segment may itself contain `/`. `.` is dropped and `..` pops one
/// level; popping past the job directory, an absolute segment, or a NUL byte
/// fails with [`StoreError::PathEscape`]. An empty segment list resolves to
/// the job directory itself.
pub fn resolve_path<S: AsRef<str>>(
    root: &Path,
    job: &JobId,
    segments: &[S],
) -> Result<PathBuf, StoreError> {
    let escape = || StoreError::PathEscape {
        job: job.to_string(),
        path: segments
            .iter()
            .map(|s| s.as_ref())
            .collect::<Vec<_>>()
            .join("/"),
    };

    let mut resolved = root.join(job.as_str());
    let mut depth = 0usize;

    for segment in segments {
        let segment = segment.as_ref();
        if segment.contains('\0') {
            return Err(escape());
        }
        for component in Path::new(segment).components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(escape());
                    }
                    resolved.pop();
                    depth -= 1;
                }
                Component::RootDir | Component::Prefix(_) => return Err(escape()),
            }
        }
    }

    Ok(resolved)
}

/// Reject a lexically resolved path that reaches outside the job directory
/// through a symlink.
///
/// Only call this with the output of [`resolve_path`] for the same `root`
/// and `job`.
pub async fn confine(root: &Path, job: &JobId, resolved: &Path) -> Result<(), StoreError> {
    let escape = || StoreError::PathEscape {
        job: job.to_string(),
        path: resolved.display().to_string(),
    };

    // root が無ければ何も存在しないので、逃げ道もない
    let Some(real_root) = canonical(root).await? else {
        return Ok(());
    };
    let boundary = match canonical(&root.join(job.as_str())).await? {
        Some(real_job) if real_job.starts_with(&real_root) => real_job,
        Some(_) => return Err(escape()),
        None => real_root,
    };

    let mut probe = resolved;
    loop {
        if let Some(real) = canonical(probe).await? {
            return if real.starts_with(&boundary) {
                Ok(())
            } else {
                Err(escape())
            };
        }
        match probe.parent() {
            Some(parent) => probe = parent,
            None => return Ok(()),
        }
    }
}

async fn canonical(path: &Path) -> Result<Option<PathBuf>, StoreError> {
    match fs::canonicalize(path).await {
        Ok(real) => Ok(Some(real)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::io("canonicalize", path)(err)),
    }
}
