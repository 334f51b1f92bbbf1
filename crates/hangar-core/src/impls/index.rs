//! Job directory index - storage root 直下の job ディレクトリ一覧
//!
//! UUID として解釈できる名前のディレクトリだけが Job です。
//! ファイル、シンボリックリンク、`tmp`、UUID でない名前は黙って除外します（エラーではない）。

use std::io;
use std::path::Path;

use tokio::fs;
use tracing::debug;

use crate::domain::artifact::modified;
use crate::domain::{DirEntry, EntryKind, JobId, StoreError};

/// `ListJobs`: job directories directly under `root`, sorted by name.
///
/// A root that doesn't exist yet holds no jobs.
pub async fn list_jobs(root: &Path) -> Result<Vec<JobId>, StoreError> {
    let mut dir = match fs::read_dir(root).await {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StoreError::io("read root dir", root)(err)),
    };

    let mut jobs = Vec::new();
    while let Some(entry) = dir
        .next_entry()
        .await
        .map_err(StoreError::io("read root dir", root))?
    {
        let file_type = entry
            .file_type()
            .await
            .map_err(StoreError::io("stat root entry", &entry.path()))?;
        if !file_type.is_dir() {
            continue;
        }
        let name = entry.file_name();
        match name.to_str().map(JobId::parse) {
            Some(Ok(job)) => jobs.push(job),
            _ => debug!(name = %name.to_string_lossy(), "skipping non-job directory"),
        }
    }

    jobs.sort();
    Ok(jobs)
}

/// Immediate children of `dir`, sorted by name. Symlinks are reported as
/// such, not followed.
pub async fn list_entries(dir: &Path) -> Result<Vec<DirEntry>, StoreError> {
    let meta = fs::metadata(dir)
        .await
        .map_err(StoreError::lookup("stat dir", dir))?;
    if !meta.is_dir() {
        return Err(StoreError::NotADirectory(dir.to_path_buf()));
    }

    let mut read = fs::read_dir(dir)
        .await
        .map_err(StoreError::lookup("read dir", dir))?;
    let mut entries = Vec::new();
    while let Some(entry) = read
        .next_entry()
        .await
        .map_err(StoreError::io("read dir", dir))?
    {
        let meta = match fs::symlink_metadata(entry.path()).await {
            Ok(meta) => meta,
            // 列挙中に消えたものは無視
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(StoreError::io("stat entry", &entry.path())(err)),
        };
        let kind = EntryKind::of(&meta);
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            kind,
            size: if kind == EntryKind::File { meta.len() } else { 0 },
            modified: modified(&meta),
        });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOB_1: &str = "67e55044-10b1-426f-9247-bb680e5fe0c8";
    const JOB_2: &str = "0f8fad5b-d9cb-469f-a165-70867728950e";

    #[tokio::test]
    async fn lists_only_uuid_directories() {
        let root = tempfile::tempdir().unwrap();
        for dir in [JOB_1, "scratch", JOB_2, "tmp"] {
            std::fs::create_dir(root.path().join(dir)).unwrap();
        }
        // UUID 名でもファイルは Job ではない
        std::fs::write(root.path().join("3b241101-e2bb-4255-8caf-4136c566a962"), b"x").unwrap();

        let jobs: Vec<String> = list_jobs(root.path())
            .await
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();

        assert_eq!(jobs, vec![JOB_2.to_string(), JOB_1.to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_job_dirs_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(elsewhere.path(), root.path().join(JOB_1)).unwrap();

        assert!(list_jobs(root.path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_root_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let jobs = list_jobs(&root.path().join("nope")).await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn entries_describe_children() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"12345").unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();

        let entries = list_entries(dir.path()).await.unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a");
        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert_eq!(entries[1].name, "b.txt");
        assert_eq!(entries[1].kind, EntryKind::File);
        assert_eq!(entries[1].size, 5);
        assert!(entries[1].modified.is_some());
    }

    #[tokio::test]
    async fn entries_of_file_or_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"").unwrap();

        assert!(matches!(
            list_entries(&file).await,
            Err(StoreError::NotADirectory(_))
        ));
        assert!(matches!(
            list_entries(&dir.path().join("missing")).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
