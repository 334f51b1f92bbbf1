//! hangar-core
//!
//! Job artifact の保存・取得エンジン。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（JobId, パス解決, 操作結果, エラー）
//! - **ports**: 抽象化レイヤー（ArtifactStore trait）
//! - **impls**: 実装（FsArtifactStore, atomic writer, archive streamer, job index）
//! - **config**: StoreConfig（storage root の注入、TOML 読み込み）
//!
//! ストレージ上のレイアウトは `root/<uuid>/...`（artifact）と `root/tmp/`（ステージング）のみです。

pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

pub use config::{ArchiveMode, ConfigError, StoreConfig};
pub use domain::{
    ArchiveSummary, ArtifactMeta, ArtifactReader, DeleteOutcome, DirEntry, EntryKind, ErrorKind,
    JobId, StoreError, WriteReceipt, is_valid_job_id,
};
pub use impls::FsArtifactStore;
pub use ports::ArtifactStore;
