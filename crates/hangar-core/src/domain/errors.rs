//! Errors - エラー型と分類
//!
//! `StoreError` はエンジンが呼び出し側に返すすべての失敗を表します。
//! 各バリアントはログに必要な文脈（path, job, バイト数）を持ちます。
//! エンジン内部でのリトライは行いません。

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// ErrorKind は呼び出し側（HTTP 層など）がステータスに変換するための分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 入力が不正（job id, path, バイト数不一致）
    Client,
    /// 対象が存在しない
    NotFound,
    /// 対象の種類が操作と合わない、または操作が無効化されている
    Conflict,
    /// ストレージ障害（disk full, permission denied, ...）
    Storage,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid job id: {0:?}")]
    InvalidJob(String),

    #[error("path {path:?} escapes the directory of job {job}")]
    PathEscape { job: String, path: String },

    #[error("invalid artifact path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("is a directory: {}", .0.display())]
    IsDirectory(PathBuf),

    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("incomplete upload to {}: wrote {actual} of {expected} bytes", .path.display())]
    IncompleteUpload {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("deletion is disabled")]
    DeletionDisabled,

    #[error("{op} failed for {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidJob(_)
            | Self::PathEscape { .. }
            | Self::InvalidPath { .. }
            | Self::IncompleteUpload { .. } => ErrorKind::Client,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::IsDirectory(_) | Self::NotADirectory(_) | Self::DeletionDisabled => {
                ErrorKind::Conflict
            }
            Self::Io { .. } => ErrorKind::Storage,
        }
    }

    /// `map_err` 用: I/O エラーを操作名とパス付きで包む
    pub(crate) fn io(op: &'static str, path: &Path) -> impl FnOnce(io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| Self::Io { op, path, source }
    }

    /// Like [`StoreError::io`], but an `io::ErrorKind::NotFound` becomes
    /// [`StoreError::NotFound`].
    pub(crate) fn lookup(op: &'static str, path: &Path) -> impl FnOnce(io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| {
            if source.kind() == io::ErrorKind::NotFound {
                Self::NotFound(path)
            } else {
                Self::Io { op, path, source }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_maps_missing_files_to_not_found() {
        let err = StoreError::lookup("open", Path::new("/srv/a.txt"))(io::Error::from(
            io::ErrorKind::NotFound,
        ));
        assert!(matches!(&err, StoreError::NotFound(p) if p == Path::new("/srv/a.txt")));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = StoreError::lookup("open", Path::new("/srv/a.txt"))(io::Error::from(
            io::ErrorKind::PermissionDenied,
        ));
        assert!(matches!(err, StoreError::Io { op: "open", .. }));
        assert_eq!(err.kind(), ErrorKind::Storage);
    }

    #[test]
    fn incomplete_upload_message_carries_counts() {
        let err = StoreError::IncompleteUpload {
            path: PathBuf::from("/srv/job/out.bin"),
            expected: 10,
            actual: 4,
        };
        assert_eq!(
            err.to_string(),
            "incomplete upload to /srv/job/out.bin: wrote 4 of 10 bytes"
        );
        assert_eq!(err.kind(), ErrorKind::Client);
    }
}
