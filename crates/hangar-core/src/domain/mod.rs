//! Domain model (job ids, artifact paths, results, errors).

pub mod artifact;
pub mod errors;
pub mod ids;
pub mod path;

pub use artifact::{
    ArchiveSummary, ArtifactMeta, ArtifactReader, DeleteOutcome, DirEntry, EntryKind,
    WriteReceipt,
};
pub use errors::{ErrorKind, StoreError};
pub use ids::{JobId, STAGING_DIR, is_valid_job_id};
pub use path::{confine, resolve_path};
