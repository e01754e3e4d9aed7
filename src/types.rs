use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which data source the scraper is pointed at.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GrabMode {
    /// Two or more sites, merged into one combined channel list.
    Combined { sites: Vec<String> },
    /// Exactly one site, handed to the scraper with `--site`.
    Single { site: String },
    /// No sites configured; curated list or every site.
    Fallback { all_sites: bool },
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FragmentFile {
    pub path: PathBuf,

    /// mtime in milliseconds since the unix epoch
    pub mtime_ms: i64,
}

impl FragmentFile {
    /// Key used for ordering and for the cache metadata.
    pub fn key(&self) -> String {
        self.path.to_string_lossy().to_string()
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CollectedFragments {
    /// Sorted by path string.
    pub files: Vec<FragmentFile>,

    /// 0 when no fragment was found.
    pub max_mtime_ms: i64,
}

impl CollectedFragments {
    pub fn keys(&self) -> Vec<String> {
        self.files.iter().map(FragmentFile::key).collect()
    }
}

/// Sidecar record written next to the combined document.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub version: u32,
    pub built_at_ms: i64,

    /// sorted, de-duplicated
    pub sites: Vec<String>,

    /// sorted path strings
    pub files: Vec<String>,

    pub max_mtime_ms: i64,

    /// blake3 hex of the combined document bytes
    pub document_hash: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Restart on exit, waiting `backoff_ms` (grown by the supervisor).
    Always { backoff_ms: u64 },
    /// Run once; a zero exit stops the unit for good.
    Once,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub restart: RestartPolicy,
    pub cwd: PathBuf,

    /// cron expression for scheduled units
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub mode: GrabMode,
    pub processes: Vec<ProcessDescriptor>,
}
