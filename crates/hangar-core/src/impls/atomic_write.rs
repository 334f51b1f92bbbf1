//! Atomic writer - アップロードのステージングと公開
//!
//! # フロー
//! 1. `root/tmp` に一意な一時ファイル（`put_*`）を作成
//! 2. body をコピーしながら SHA-256 を計算
//! 3. 期待長と一致しなければ `IncompleteUpload`
//! 4. パーミッション設定 + fsync
//! 5. 親ディレクトリを作成し、rename で最終パスに公開
//! 6. rename が filesystem をまたげない場合は、公開先ディレクトリ内の
//!    兄弟一時ファイルへコピー・検証してから rename
//!
//! 一時ファイルは `TempPath` が握っているので、どの経路で抜けても削除されます。
//! 最終パスに見えるのは「無い」「以前の完全な内容」「新しい完全な内容」のいずれかだけです。

use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use tempfile::{NamedTempFile, PathPersistError, TempPath};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task;
use tracing::{debug, warn};

use crate::domain::{StoreError, WriteReceipt};

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Stage `body` under `staging_dir` and atomically publish it at `final_path`.
pub async fn write_atomic<R>(
    staging_dir: &Path,
    final_path: &Path,
    body: &mut R,
    expected_len: Option<u64>,
    file_mode: u32,
) -> Result<WriteReceipt, StoreError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    fs::create_dir_all(staging_dir)
        .await
        .map_err(StoreError::io("create staging dir", staging_dir))?;

    let (file, staged) = staging_file(staging_dir, "put_")
        .await
        .map_err(StoreError::io("create staging file", staging_dir))?
        .into_parts();
    let mut file = File::from_std(file);
    debug!(staged = %staged.display(), dest = %final_path.display(), "staging upload");

    let (bytes_written, sha256) = copy_hashed(body, &mut file)
        .await
        .map_err(StoreError::io("stage upload", &staged))?;

    if let Some(expected) = expected_len
        && expected != bytes_written
    {
        return Err(StoreError::IncompleteUpload {
            path: final_path.to_path_buf(),
            expected,
            actual: bytes_written,
        });
    }

    seal(&mut file, file_mode)
        .await
        .map_err(StoreError::io("sync staging file", &staged))?;
    drop(file);

    if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(StoreError::io("create parent dirs", parent))?;
    }

    match publish(staged, final_path).await {
        Ok(()) => {}
        Err((error, Some(staged))) if error.kind() == io::ErrorKind::CrossesDevices => {
            warn!(dest = %final_path.display(), "staging dir is on another filesystem; copying");
            publish_by_copy(staged, final_path, bytes_written, &sha256, file_mode).await?;
        }
        Err((error, _)) => return Err(StoreError::io("publish", final_path)(error)),
    }

    Ok(WriteReceipt {
        path: final_path.to_path_buf(),
        bytes_written,
        sha256,
    })
}

/// Fallback when rename can't cross filesystems: copy into a sibling temp
/// file next to `final_path`, verify it, then rename that in place.
async fn publish_by_copy(
    staged: TempPath,
    final_path: &Path,
    expected_len: u64,
    expected_sha256: &str,
    file_mode: u32,
) -> Result<(), StoreError> {
    let dir = final_path.parent().unwrap_or(Path::new("."));
    let (file, sibling) = staging_file(dir, ".hangar-")
        .await
        .map_err(StoreError::io("create sibling file", dir))?
        .into_parts();
    let mut copy = File::from_std(file);

    let mut source = File::open(&staged)
        .await
        .map_err(StoreError::io("open staging file", &staged))?;
    let (copied, digest) = copy_hashed(&mut source, &mut copy)
        .await
        .map_err(StoreError::io("copy staging file", &sibling))?;
    drop(source);

    if copied != expected_len || digest != expected_sha256 {
        return Err(StoreError::io("verify copy", final_path)(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "copied {copied} bytes (sha256 {digest}), staged {expected_len} bytes (sha256 {expected_sha256})"
            ),
        )));
    }

    seal(&mut copy, file_mode)
        .await
        .map_err(StoreError::io("sync sibling file", &sibling))?;
    drop(copy);

    publish(sibling, final_path)
        .await
        .map_err(|(error, _)| StoreError::io("publish", final_path)(error))?;

    // staged は drop で削除される
    drop(staged);
    Ok(())
}

/// Create a uniquely named temp file in `dir` on the blocking pool.
pub(crate) async fn staging_file(
    dir: &Path,
    prefix: &'static str,
) -> io::Result<NamedTempFile> {
    let dir = dir.to_path_buf();
    task::spawn_blocking(move || tempfile::Builder::new().prefix(prefix).tempfile_in(&dir))
        .await
        .map_err(io::Error::other)?
}

/// Rename `temp` onto `target`, replacing whatever is there. On failure the
/// guard comes back with the error (unless the blocking task died with it),
/// so the caller still owns cleanup.
async fn publish(temp: TempPath, target: &Path) -> Result<(), (io::Error, Option<TempPath>)> {
    let target = target.to_path_buf();
    match task::spawn_blocking(move || temp.persist(&target)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(PathPersistError { error, path })) => Err((error, Some(path))),
        Err(join) => Err((io::Error::other(join), None)),
    }
}

async fn seal(file: &mut File, file_mode: u32) -> io::Result<()> {
    set_mode(file, file_mode).await?;
    file.sync_all().await
}

#[cfg(unix)]
async fn set_mode(file: &File, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(mode))
        .await
}

#[cfg(not(unix))]
async fn set_mode(_file: &File, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Copy `reader` into `writer` until EOF, returning the byte count and the
/// lowercase hex SHA-256 of what passed through.
pub(crate) async fn copy_hashed<R, W>(reader: &mut R, writer: &mut W) -> io::Result<(u64, String)>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    writer.flush().await?;

    Ok((total, hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// 途中で接続が切れたクライアントを模倣
    struct Disconnect;

    impl AsyncRead for Disconnect {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "client went away",
            )))
        }
    }

    fn staging_is_empty(staging: &Path) -> bool {
        std::fs::read_dir(staging).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn publishes_and_reports_digest() {
        let root = tempfile::tempdir().unwrap();
        let staging = root.path().join("tmp");
        let target = root.path().join("job/nested/dir/out.txt");

        let receipt = write_atomic(&staging, &target, &mut &b"hello"[..], Some(5), 0o666)
            .await
            .unwrap();

        assert_eq!(receipt.bytes_written, 5);
        assert_eq!(receipt.path, target);
        assert_eq!(
            receipt.sha256,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(std::fs::read(&target).unwrap(), b"hello");
        assert!(staging_is_empty(&staging));
    }

    #[tokio::test]
    async fn unknown_length_accepts_any_body() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("out.bin");
        let body = vec![7u8; COPY_BUF_SIZE * 3 + 11];

        let receipt = write_atomic(&root.path().join("tmp"), &target, &mut &body[..], None, 0o666)
            .await
            .unwrap();

        assert_eq!(receipt.bytes_written, body.len() as u64);
        assert_eq!(std::fs::read(&target).unwrap(), body);
    }

    #[tokio::test]
    async fn short_body_leaves_previous_content() {
        let root = tempfile::tempdir().unwrap();
        let staging = root.path().join("tmp");
        let target = root.path().join("out.txt");
        std::fs::write(&target, b"previous").unwrap();

        let err = write_atomic(&staging, &target, &mut &b"new"[..], Some(10), 0o666)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StoreError::IncompleteUpload { expected: 10, actual: 3, .. }
        ));
        assert_eq!(std::fs::read(&target).unwrap(), b"previous");
        assert!(staging_is_empty(&staging));
    }

    #[tokio::test]
    async fn interrupted_body_publishes_nothing() {
        let root = tempfile::tempdir().unwrap();
        let staging = root.path().join("tmp");
        let target = root.path().join("out.txt");
        let mut body = (&b"partial"[..]).chain(Disconnect);

        let err = write_atomic(&staging, &target, &mut body, Some(100), 0o666)
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Io { op: "stage upload", .. }));
        assert!(!target.exists());
        assert!(staging_is_empty(&staging));
    }

    #[tokio::test]
    async fn long_body_is_rejected_too() {
        let root = tempfile::tempdir().unwrap();
        let staging = root.path().join("tmp");
        let target = root.path().join("out.txt");

        let err = write_atomic(&staging, &target, &mut &b"0123456789"[..], Some(4), 0o666)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StoreError::IncompleteUpload { expected: 4, actual: 10, .. }
        ));
        assert!(!target.exists());
        assert!(staging_is_empty(&staging));
    }

    #[tokio::test]
    async fn failed_publish_cleans_staging() {
        let root = tempfile::tempdir().unwrap();
        let staging = root.path().join("tmp");
        // 公開先の親がファイルなので create_dir_all が失敗する
        std::fs::write(root.path().join("blocker"), b"x").unwrap();
        let target = root.path().join("blocker/out.txt");

        let err = write_atomic(&staging, &target, &mut &b"data"[..], Some(4), 0o666)
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Io { .. }));
        assert!(staging_is_empty(&staging));
    }

    #[tokio::test]
    async fn later_write_wins() {
        let root = tempfile::tempdir().unwrap();
        let staging = root.path().join("tmp");
        let target = root.path().join("out.txt");

        write_atomic(&staging, &target, &mut &b"first"[..], Some(5), 0o666)
            .await
            .unwrap();
        write_atomic(&staging, &target, &mut &b"second"[..], Some(6), 0o666)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"second");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn applies_fixed_mode() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("out.txt");

        write_atomic(&root.path().join("tmp"), &target, &mut &b"x"[..], Some(1), 0o640)
            .await
            .unwrap();

        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[tokio::test]
    async fn copy_fallback_publishes_verified_copy() {
        let root = tempfile::tempdir().unwrap();
        let staging = root.path().join("tmp");
        std::fs::create_dir_all(&staging).unwrap();
        let staged_file = staging.join("put_manual");
        std::fs::write(&staged_file, b"payload").unwrap();
        let target = root.path().join("out.txt");
        std::fs::write(&target, b"old").unwrap();

        let sha = hex::encode(Sha256::digest(b"payload"));
        let staged = TempPath::try_from_path(&staged_file).unwrap();
        publish_by_copy(staged, &target, 7, &sha, 0o666)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"payload");
        assert!(!staged_file.exists());
        // 兄弟一時ファイルも残らない
        let leftovers: Vec<_> = std::fs::read_dir(root.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(".hangar-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn copy_fallback_refuses_mismatched_copy() {
        let root = tempfile::tempdir().unwrap();
        let staging = root.path().join("tmp");
        std::fs::create_dir_all(&staging).unwrap();
        let staged_file = staging.join("put_manual");
        std::fs::write(&staged_file, b"payload").unwrap();
        let target = root.path().join("out.txt");
        std::fs::write(&target, b"old").unwrap();

        let staged = TempPath::try_from_path(&staged_file).unwrap();
        let err = publish_by_copy(staged, &target, 7, "deadbeef", 0o666)
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Io { op: "verify copy", .. }));
        assert_eq!(std::fs::read(&target).unwrap(), b"old");
        assert!(!staged_file.exists());
    }

    #[tokio::test]
    async fn staging_file_is_prefixed_and_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();

        let file = staging_file(dir.path(), "put_").await.unwrap();
        let path = file.path().to_path_buf();
        assert_eq!(path.parent(), Some(dir.path()));
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("put_"));

        drop(file);
        assert!(!path.exists());
    }
}
