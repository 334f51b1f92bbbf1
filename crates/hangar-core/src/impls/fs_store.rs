//! FsArtifactStore - ローカルファイルシステム上の ArtifactStore 実装
//!
//! レイアウト:
//! - `root/<uuid>/...` : job の artifact
//! - `root/tmp/`       : アップロードとアーカイブのステージング（このストア専有）
//!
//! すべての操作は「job id 検証 → 字句的なパス解決 → symlink 封じ込め」を通ってから
//! ファイルシステムに触れます。

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use super::{archive, atomic_write, index};
use crate::config::StoreConfig;
use crate::domain::artifact::modified;
use crate::domain::{
    ArchiveSummary, ArtifactMeta, ArtifactReader, DeleteOutcome, DirEntry, EntryKind, JobId,
    StoreError, WriteReceipt, confine, resolve_path,
};
use crate::ports::ArtifactStore;

#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    config: StoreConfig,
}

impl FsArtifactStore {
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    /// Create the root and staging directories, then build the store.
    pub async fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let staging = config.staging_dir();
        fs::create_dir_all(&staging)
            .await
            .map_err(StoreError::io("create staging dir", &staging))?;
        info!(root = %config.root.display(), deletion = config.allow_deletion, "opened artifact store");
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Validate `job`, resolve `path` inside it and check it against symlink
    /// escapes.
    async fn locate(&self, job: &str, path: &str) -> Result<(JobId, PathBuf), StoreError> {
        let job = JobId::parse(job)?;
        let resolved = resolve_path(&self.config.root, &job, &[path])?;
        confine(&self.config.root, &job, &resolved).await?;
        Ok((job, resolved))
    }

    fn job_dir(&self, job: &JobId) -> PathBuf {
        self.config.root.join(job.as_str())
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn list_jobs(&self) -> Result<Vec<JobId>, StoreError> {
        index::list_jobs(&self.config.root).await
    }

    async fn stat(&self, job: &str, path: &str) -> Result<ArtifactMeta, StoreError> {
        let (_, target) = self.locate(job, path).await?;
        let meta = fs::symlink_metadata(&target)
            .await
            .map_err(StoreError::lookup("stat", &target))?;
        let kind = EntryKind::of(&meta);
        Ok(ArtifactMeta {
            size: if kind == EntryKind::File { meta.len() } else { 0 },
            modified: modified(&meta),
            kind,
            path: target,
        })
    }

    async fn entries(&self, job: &str, path: &str) -> Result<Vec<DirEntry>, StoreError> {
        let (_, target) = self.locate(job, path).await?;
        index::list_entries(&target).await
    }

    async fn read(&self, job: &str, path: &str) -> Result<ArtifactReader, StoreError> {
        let (job, target) = self.locate(job, path).await?;
        let file = fs::File::open(&target)
            .await
            .map_err(StoreError::lookup("open", &target))?;
        let meta = file
            .metadata()
            .await
            .map_err(StoreError::io("stat", &target))?;
        if meta.is_dir() {
            return Err(StoreError::IsDirectory(target));
        }
        debug!(job = %job, path = %target.display(), len = meta.len(), "serving artifact");
        Ok(ArtifactReader::new(target, meta.len(), file))
    }

    async fn write(
        &self,
        job: &str,
        path: &str,
        body: &mut (dyn AsyncRead + Unpin + Send),
        expected_len: Option<u64>,
    ) -> Result<WriteReceipt, StoreError> {
        let (job, target) = self.locate(job, path).await?;
        if target == self.job_dir(&job) {
            return Err(StoreError::InvalidPath {
                path: path.to_string(),
                reason: "artifact path is empty",
            });
        }

        let receipt = atomic_write::write_atomic(
            &self.config.staging_dir(),
            &target,
            body,
            expected_len,
            self.config.file_mode,
        )
        .await?;
        info!(
            job = %job,
            path = %target.display(),
            bytes = receipt.bytes_written,
            sha256 = %receipt.sha256,
            "uploaded artifact"
        );
        Ok(receipt)
    }

    async fn delete(&self, job: &str, path: &str) -> Result<DeleteOutcome, StoreError> {
        if !self.config.allow_deletion {
            return Err(StoreError::DeletionDisabled);
        }
        let (job, target) = self.locate(job, path).await?;

        let meta = match fs::symlink_metadata(&target).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(job = %job, path = %target.display(), "nothing to delete");
                return Ok(DeleteOutcome::Absent);
            }
            Err(err) => return Err(StoreError::io("stat", &target)(err)),
        };

        let removed = if meta.is_dir() {
            fs::remove_dir_all(&target).await
        } else {
            fs::remove_file(&target).await
        };
        match removed {
            Ok(()) => {
                info!(job = %job, path = %target.display(), "deleted");
                Ok(DeleteOutcome::Removed)
            }
            // 並行する delete に先を越された
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(DeleteOutcome::Absent),
            Err(err) => Err(StoreError::io("delete", &target)(err)),
        }
    }

    async fn archive(
        &self,
        job: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<ArchiveSummary, StoreError> {
        let (job, job_dir) = self.locate(job, "").await?;
        let summary = archive::stream_archive(
            &job_dir,
            &self.config.staging_dir(),
            sink,
            self.config.archive_mode,
        )
        .await?;
        info!(job = %job, entries = summary.entries, bytes = summary.bytes, "archived job");
        Ok(summary)
    }
}
