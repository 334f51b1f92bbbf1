//! ArtifactStore port - リクエスト処理層から呼ばれる操作セット
//!
//! ルーティングや HTTP ステータスへの変換は呼び出し側の責務です。
//! エラーの分類には [`StoreError::kind`] を使ってください。
//!
//! # 並行性
//! - 実装はグローバルロックを持たず、`Arc` 越しに複数タスクから同時に呼べる
//! - 同じパスへの同時書き込みはファイルシステムの rename で決着（最後の rename が勝つ）

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::domain::{
    ArchiveSummary, ArtifactMeta, ArtifactReader, DeleteOutcome, DirEntry, JobId, StoreError,
    WriteReceipt,
};

/// The operations a request handler invokes.
///
/// `job` is the raw identifier from the request and `path` the artifact path
/// relative to the job directory (`/`-separated, may be empty where noted).
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Jobs under the storage root, sorted by name.
    async fn list_jobs(&self) -> Result<Vec<JobId>, StoreError>;

    async fn stat(&self, job: &str, path: &str) -> Result<ArtifactMeta, StoreError>;

    /// Children of a directory inside a job; an empty `path` lists the job
    /// directory.
    async fn entries(&self, job: &str, path: &str) -> Result<Vec<DirEntry>, StoreError>;

    /// Open an artifact for streaming.
    async fn read(&self, job: &str, path: &str) -> Result<ArtifactReader, StoreError>;

    /// Stage `body` and publish it atomically at `path`.
    ///
    /// With `expected_len` set, a body of any other length is rejected with
    /// [`StoreError::IncompleteUpload`] and nothing is published.
    async fn write(
        &self,
        job: &str,
        path: &str,
        body: &mut (dyn AsyncRead + Unpin + Send),
        expected_len: Option<u64>,
    ) -> Result<WriteReceipt, StoreError>;

    /// Remove `path` recursively; an empty `path` removes the whole job.
    /// Removing something absent succeeds with [`DeleteOutcome::Absent`].
    async fn delete(&self, job: &str, path: &str) -> Result<DeleteOutcome, StoreError>;

    /// Write a ZIP of the job directory to `sink`.
    ///
    /// In streaming mode an error after the first byte leaves a truncated
    /// archive in `sink`; the error is still returned. Buffered mode only
    /// writes complete archives.
    async fn archive(
        &self,
        job: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<ArchiveSummary, StoreError>;
}
