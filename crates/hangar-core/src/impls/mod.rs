//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **FsArtifactStore**: ローカルファイルシステム上の Facade
//! - **atomic_write**: ステージング + rename による公開
//! - **archive**: job ディレクトリの ZIP ストリーミング
//! - **index**: job ディレクトリとディレクトリ内容の一覧

pub mod archive;
pub mod atomic_write;
pub mod fs_store;
pub mod index;

// 主要な型を再エクスポート
pub use self::archive::stream_archive;
pub use self::atomic_write::write_atomic;
pub use self::fs_store::FsArtifactStore;
pub use self::index::{list_entries, list_jobs};
