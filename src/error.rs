use std::path::PathBuf;

/// Failures that abort a combine run.
///
/// Everything else the combiner meets (missing site dirs, bad fragments,
/// a metadata write) is logged and recovered from.
#[derive(Debug, thiserror::Error)]
pub enum CombineError {
    #[error("cannot create cache dir {path:?}: {source}")]
    CacheDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot write combined document {path:?}: {source}")]
    WriteDocument {
        path: PathBuf,
        source: std::io::Error,
    },
}
