//! Ports - 抽象化レイヤー
//!
//! エンジンの外側（HTTP ルーティング、CLI など）が依存するのはこの trait だけです。
//! ファイルシステム実装は `impls` にあります。

pub mod artifact_store;

pub use self::artifact_store::ArtifactStore;
