use crate::error::CombineError;
use crate::fs_scan::collect_fragments;
use crate::merge::merge_fragments;
use crate::types::{CacheMeta, CollectedFragments};
use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub const CACHE_VERSION: u32 = 1;

/// Where the combined document and its metadata live.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CachePaths {
    pub dir: PathBuf,
    pub document: PathBuf,
    pub metadata: PathBuf,
}

impl CachePaths {
    /// `<dir>/combined.channels.xml` + `<dir>/combined.meta.json`
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            document: dir.join("combined.channels.xml"),
            metadata: dir.join("combined.meta.json"),
            dir,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CombineOutcome {
    pub document: PathBuf,

    /// false when the previous document was reused as-is
    pub rebuilt: bool,

    pub fragments: usize,
}

pub fn load_meta(path: &Path) -> Option<CacheMeta> {
    let s = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&s) {
        Ok(meta) => Some(meta),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "ignoring unusable cache metadata");
            None
        }
    }
}

pub fn save_meta(path: &Path, meta: &CacheMeta) -> Result<()> {
    let s = serde_json::to_string_pretty(meta)?;
    write_atomic(path, s.as_bytes()).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Write to a temp file in the target dir, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn hash_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

fn hash_file(path: &Path) -> Option<String> {
    std::fs::read(path).ok().map(|b| hash_bytes(&b))
}

/// Whether `prev` still describes what a rebuild from `current` would give.
///
/// The document hash is checked last since it is the only step that reads
/// the document back.
pub fn is_reusable(
    prev: &CacheMeta,
    sites: &[String],
    current: &CollectedFragments,
    document: &Path,
) -> bool {
    let same = prev.version == CACHE_VERSION
        && prev.sites == sites
        && prev.files == current.keys()
        && prev.max_mtime_ms >= current.max_mtime_ms;

    same && hash_file(document).as_deref() == Some(prev.document_hash.as_str())
}

fn now_unix_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Make sure `paths.document` holds the merged channel list for `sites`,
/// rebuilding it only when the fragments changed since the last build.
pub fn ensure_combined_document(
    sites: &[String],
    sites_dir: &Path,
    paths: &CachePaths,
) -> std::result::Result<CombineOutcome, CombineError> {
    let mut sites = sites.to_vec();
    sites.sort();
    sites.dedup();

    let current = collect_fragments(&sites, sites_dir);

    if let Some(prev) = load_meta(&paths.metadata) {
        if is_reusable(&prev, &sites, &current, &paths.document) {
            info!(
                document = %paths.document.display(),
                fragments = current.files.len(),
                "combined document up to date, reusing"
            );
            return Ok(CombineOutcome {
                document: paths.document.clone(),
                rebuilt: false,
                fragments: current.files.len(),
            });
        }
    }

    info!(
        sites = sites.len(),
        fragments = current.files.len(),
        "rebuilding combined document"
    );
    let doc = merge_fragments(&current.files);

    std::fs::create_dir_all(&paths.dir).map_err(|source| CombineError::CacheDir {
        path: paths.dir.clone(),
        source,
    })?;
    write_atomic(&paths.document, doc.as_bytes()).map_err(|source| {
        CombineError::WriteDocument {
            path: paths.document.clone(),
            source,
        }
    })?;

    let meta = CacheMeta {
        version: CACHE_VERSION,
        built_at_ms: now_unix_ms(),
        sites,
        files: current.keys(),
        max_mtime_ms: current.max_mtime_ms,
        document_hash: hash_bytes(doc.as_bytes()),
    };
    if let Err(e) = save_meta(&paths.metadata, &meta) {
        warn!(error = %format!("{e:#}"), "cannot write cache metadata, next run will rebuild");
    }

    Ok(CombineOutcome {
        document: paths.document.clone(),
        rebuilt: true,
        fragments: current.files.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_scan::tests::{bump_mtime, write_file};
    use std::fs;
    use tempfile::TempDir;

    const TWO_CHANNELS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<channels>
  <channel site="alpha" lang="en" xmltv_id="A1.us" site_id="1">A1</channel>
  <channel site="alpha" lang="en" xmltv_id="A2.us" site_id="2">A2</channel>
</channels>
"#;

    const ONE_CHANNEL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<channels>
  <channel site="beta" lang="en" xmltv_id="B1.us" site_id="1">B1</channel>
</channels>
"#;

    struct Fixture {
        _tmp: TempDir,
        sites_dir: PathBuf,
        paths: CachePaths,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let sites_dir = tmp.path().join("sites");
        write_file(&sites_dir, "alpha/alpha.com.channels.xml", TWO_CHANNELS);
        write_file(&sites_dir, "beta/beta.com.channels.xml", ONE_CHANNEL);
        let paths = CachePaths::in_dir(tmp.path().join("cache"));
        Fixture {
            _tmp: tmp,
            sites_dir,
            paths,
        }
    }

    fn sites(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn read_doc(paths: &CachePaths) -> String {
        fs::read_to_string(&paths.document).unwrap()
    }

    #[test]
    fn merges_two_sites_in_path_order() {
        let fx = fixture();
        let out = ensure_combined_document(&sites(&["beta", "alpha"]), &fx.sites_dir, &fx.paths)
            .unwrap();
        assert!(out.rebuilt);
        assert_eq!(out.fragments, 2);

        let doc = read_doc(&fx.paths);
        assert_eq!(doc.matches("<?xml").count(), 1);
        assert_eq!(doc.matches("<channels>").count(), 1);
        assert_eq!(doc.matches("<channel ").count(), 3);

        let a1 = doc.find("A1.us").unwrap();
        let a2 = doc.find("A2.us").unwrap();
        let b1 = doc.find("B1.us").unwrap();
        assert!(a1 < a2 && a2 < b1);

        let meta = load_meta(&fx.paths.metadata).unwrap();
        assert_eq!(meta.version, CACHE_VERSION);
        assert_eq!(meta.sites, sites(&["alpha", "beta"]));
        assert_eq!(meta.files.len(), 2);
        assert!(meta.built_at_ms > 0);
    }

    #[test]
    fn wrapperless_fragment_merges_with_wrapped_one() {
        let fx = fixture();
        write_file(
            &fx.sites_dir,
            "gamma/gamma.com.channels.xml",
            "<?xml version=\"1.0\"?>\n<channel site=\"gamma\" xmltv_id=\"G1.us\">G1</channel>\n<channel site=\"gamma\" xmltv_id=\"G2.us\">G2</channel>\n",
        );

        let out = ensure_combined_document(&sites(&["gamma", "alpha"]), &fx.sites_dir, &fx.paths)
            .unwrap();
        assert_eq!(out.fragments, 2);

        let doc = read_doc(&fx.paths);
        assert_eq!(doc.matches("<?xml").count(), 1);
        assert_eq!(doc.matches("<channel ").count(), 4);
        let order: Vec<usize> = ["A1.us", "A2.us", "G1.us", "G2.us"]
            .iter()
            .map(|id| doc.find(id).unwrap())
            .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn second_run_reuses_document() {
        let fx = fixture();
        let list = sites(&["alpha", "beta"]);
        ensure_combined_document(&list, &fx.sites_dir, &fx.paths).unwrap();
        let first = read_doc(&fx.paths);
        let first_mtime = fs::metadata(&fx.paths.document).unwrap().modified().unwrap();

        let out = ensure_combined_document(&list, &fx.sites_dir, &fx.paths).unwrap();
        assert!(!out.rebuilt);
        assert_eq!(read_doc(&fx.paths), first);
        assert_eq!(
            fs::metadata(&fx.paths.document).unwrap().modified().unwrap(),
            first_mtime
        );
    }

    #[test]
    fn site_order_and_duplicates_do_not_matter() {
        let fx = fixture();
        ensure_combined_document(&sites(&["alpha", "beta"]), &fx.sites_dir, &fx.paths).unwrap();
        let out = ensure_combined_document(&sites(&["beta", "alpha", "beta"]), &fx.sites_dir, &fx.paths)
            .unwrap();
        assert!(!out.rebuilt);
    }

    #[test]
    fn touching_a_fragment_forces_rebuild() {
        let fx = fixture();
        let list = sites(&["alpha", "beta"]);
        ensure_combined_document(&list, &fx.sites_dir, &fx.paths).unwrap();

        bump_mtime(&fx.sites_dir.join("beta/beta.com.channels.xml"), 120);
        let out = ensure_combined_document(&list, &fx.sites_dir, &fx.paths).unwrap();
        assert!(out.rebuilt);
    }

    #[test]
    fn new_fragment_forces_rebuild() {
        let fx = fixture();
        let list = sites(&["alpha", "beta"]);
        ensure_combined_document(&list, &fx.sites_dir, &fx.paths).unwrap();

        write_file(
            &fx.sites_dir,
            "beta/extra/more.channels.xml",
            "<channels><channel xmltv_id=\"B2.us\">B2</channel></channels>",
        );
        let out = ensure_combined_document(&list, &fx.sites_dir, &fx.paths).unwrap();
        assert!(out.rebuilt);
        assert_eq!(out.fragments, 3);
        assert!(read_doc(&fx.paths).contains("B2.us"));
    }

    #[test]
    fn removed_site_is_left_out() {
        let fx = fixture();
        ensure_combined_document(&sites(&["alpha", "beta"]), &fx.sites_dir, &fx.paths).unwrap();

        let out = ensure_combined_document(&sites(&["alpha", "gamma"]), &fx.sites_dir, &fx.paths)
            .unwrap();
        assert!(out.rebuilt);
        let doc = read_doc(&fx.paths);
        assert!(doc.contains("A1.us"));
        assert!(!doc.contains("B1.us"));
    }

    #[test]
    fn output_does_not_depend_on_creation_order() {
        let a = TempDir::new().unwrap();
        write_file(a.path(), "s1/x.channels.xml", "<channels><channel>x</channel></channels>");
        write_file(a.path(), "s1/y.channels.xml", "<channels><channel>y</channel></channels>");
        write_file(a.path(), "s2/z.channels.xml", "<channel>z</channel>");

        let b = TempDir::new().unwrap();
        write_file(b.path(), "s2/z.channels.xml", "<channel>z</channel>");
        write_file(b.path(), "s1/y.channels.xml", "<channels><channel>y</channel></channels>");
        let tmp_name = write_file(b.path(), "s1/tmp.channels.xml", "<channels><channel>x</channel></channels>");
        fs::rename(tmp_name, b.path().join("s1/x.channels.xml")).unwrap();

        let list = sites(&["s1", "s2"]);
        let pa = CachePaths::in_dir(a.path().join("cache"));
        let pb = CachePaths::in_dir(b.path().join("cache"));
        ensure_combined_document(&list, a.path(), &pa).unwrap();
        ensure_combined_document(&list, b.path(), &pb).unwrap();

        assert_eq!(read_doc(&pa), read_doc(&pb));
        assert!(read_doc(&pa).contains("<channel>x</channel>\n<channel>y</channel>\n<channel>z</channel>"));
    }

    #[test]
    fn bad_fragment_contributes_nothing() {
        let fx = fixture();
        write_file(&fx.sites_dir, "alpha/broken.channels.xml", "<channels><channel>");
        write_file(&fx.sites_dir, "alpha/other.channels.xml", "<tv></tv>");

        let out = ensure_combined_document(&sites(&["alpha"]), &fx.sites_dir, &fx.paths).unwrap();
        assert_eq!(out.fragments, 3);
        assert_eq!(read_doc(&fx.paths).matches("<channel ").count(), 2);
    }

    #[test]
    fn corrupt_or_partial_metadata_forces_rebuild() {
        let fx = fixture();
        let list = sites(&["alpha"]);
        ensure_combined_document(&list, &fx.sites_dir, &fx.paths).unwrap();

        fs::write(&fx.paths.metadata, "{ not json").unwrap();
        assert!(ensure_combined_document(&list, &fx.sites_dir, &fx.paths).unwrap().rebuilt);

        fs::write(&fx.paths.metadata, r#"{"version": 1, "sites": ["alpha"]}"#).unwrap();
        assert!(ensure_combined_document(&list, &fx.sites_dir, &fx.paths).unwrap().rebuilt);
    }

    #[test]
    fn tampered_document_forces_rebuild() {
        let fx = fixture();
        let list = sites(&["alpha"]);
        ensure_combined_document(&list, &fx.sites_dir, &fx.paths).unwrap();

        fs::write(&fx.paths.document, "<channels/>").unwrap();
        let out = ensure_combined_document(&list, &fx.sites_dir, &fx.paths).unwrap();
        assert!(out.rebuilt);
        assert!(read_doc(&fx.paths).contains("A1.us"));

        fs::remove_file(&fx.paths.document).unwrap();
        assert!(ensure_combined_document(&list, &fx.sites_dir, &fx.paths).unwrap().rebuilt);
    }

    #[test]
    fn metadata_write_failure_is_not_fatal() {
        let fx = fixture();
        fs::create_dir_all(&fx.paths.metadata).unwrap();
        let list = sites(&["alpha"]);

        let out = ensure_combined_document(&list, &fx.sites_dir, &fx.paths).unwrap();
        assert!(out.rebuilt);
        assert!(read_doc(&fx.paths).contains("A1.us"));

        // no usable metadata, so every run rebuilds
        assert!(ensure_combined_document(&list, &fx.sites_dir, &fx.paths).unwrap().rebuilt);
    }

    #[test]
    fn document_write_failure_is_fatal() {
        let fx = fixture();
        fs::create_dir_all(&fx.paths.document).unwrap();

        let err = ensure_combined_document(&sites(&["alpha"]), &fx.sites_dir, &fx.paths)
            .unwrap_err();
        assert!(matches!(err, CombineError::WriteDocument { .. }));
    }
}
