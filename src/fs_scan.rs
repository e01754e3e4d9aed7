use crate::types::{CollectedFragments, FragmentFile};
use anyhow::Result;
use regex::Regex;
use std::{
    fs,
    path::{Component, Path},
    sync::LazyLock,
    time::SystemTime,
};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// `<anything>.channels.xml`, any case
static FRAGMENT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^.+\.channels\.xml$").expect("fragment name regex"));

fn is_fragment_file(p: &Path) -> bool {
    p.file_name()
        .and_then(|s| s.to_str())
        .map(|name| FRAGMENT_NAME.is_match(name))
        .unwrap_or(false)
}

/// Milliseconds since the unix epoch, negative before it.
fn system_time_ms(t: SystemTime) -> i64 {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

/// mtime unix (milliseconds)
fn mtime_unix_ms(meta: &fs::Metadata) -> Result<i64> {
    Ok(system_time_ms(meta.modified()?))
}

/// A site id names a directory strictly below the sites dir.
fn is_plain_site_id(site: &str) -> bool {
    let mut parts = Path::new(site).components().peekable();
    parts.peek().is_some() && parts.all(|c| matches!(c, Component::Normal(_)))
}

/// Every fragment below `<sites_dir>/<site>` for each site, sorted by path.
///
/// A missing site dir or an unreadable subdirectory only costs that part of
/// the tree; the scan itself never fails.
pub fn collect_fragments(sites: &[String], sites_dir: &Path) -> CollectedFragments {
    let mut files = Vec::new();

    for site in sites {
        if !is_plain_site_id(site) {
            warn!(site = %site, "site id is not a plain relative path, skipping");
            continue;
        }
        let root = sites_dir.join(site);
        if !root.is_dir() {
            warn!(site = %site, path = %root.display(), "site directory not found, skipping");
            continue;
        }

        let before = files.len();
        for entry in WalkDir::new(&root).follow_links(true) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(site = %site, error = %e, "cannot read entry, skipping");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_fragment_file(entry.path()) {
                continue;
            }

            let stat = entry
                .metadata()
                .map_err(anyhow::Error::from)
                .and_then(|m| mtime_unix_ms(&m));
            let mtime_ms = match stat {
                Ok(ms) => ms,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "cannot stat fragment, skipping");
                    continue;
                }
            };

            files.push(FragmentFile {
                path: entry.into_path(),
                mtime_ms,
            });
        }
        debug!(site = %site, fragments = files.len() - before, "scanned site");
    }

    files.sort_by_cached_key(FragmentFile::key);
    let max_mtime_ms = files.iter().map(|f| f.mtime_ms).max().unwrap_or(0);

    CollectedFragments {
        files,
        max_mtime_ms,
    }
}
