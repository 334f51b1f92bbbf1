//! Job identifiers.
//!
//! Job は UUID で識別され、storage root 直下の同名ディレクトリとして保存されます。
//!
//! ## 表記の扱い
//! `uuid::Uuid::try_parse` が受け付ける表記はすべて有効です
//! （hyphenated / simple / braced / urn、大文字小文字は問わない）。
//! ディレクトリ名は「渡された文字列そのもの」なので、`JobId` は
//! パース結果の `Uuid` と元の文字列の両方を保持します。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::errors::StoreError;

/// Name of the staging directory under the storage root.
///
/// Never a valid job id, so it can't collide with a job directory.
pub const STAGING_DIR: &str = "tmp";

/// A validated job identifier.
///
/// Ordering and equality follow the textual form, which is also the
/// on-disk directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId {
    name: String,
    uuid: Uuid,
}

impl JobId {
    /// Parse a job id, keeping the textual form as given.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        let uuid = Uuid::try_parse(s).map_err(|_| StoreError::InvalidJob(s.to_string()))?;
        Ok(Self {
            name: s.to_string(),
            uuid,
        })
    }

    /// The directory name of this job.
    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

/// `ValidateJobID`: true iff `s` is a UUID in any accepted textual form.
pub fn is_valid_job_id(s: &str) -> bool {
    Uuid::try_parse(s).is_ok()
}

impl FromStr for JobId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for JobId {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<JobId> for String {
    fn from(job: JobId) -> Self {
        job.name
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
