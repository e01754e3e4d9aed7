//! Deployment configuration.
//!
//! Every knob comes from a captured environment map, resolved once in `main`
//! into an immutable [`Configuration`]. Nothing below this module reads the
//! process environment.

use crate::cache::CachePaths;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tracing::debug;

pub const DEFAULT_SCHEDULE: &str = "0 0 * * *";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 1;
/// Cache directory name; `main` places it under the system temp dir.
pub const CACHE_DIR_NAME: &str = "grab-topology";

const SLUG_MAX_LEN: usize = 80;

const FALSY: [&str; 7] = ["", "0", "false", "no", "off", "null", "undefined"];

/// Filesystem layout the descriptors and the combiner work against.
#[derive(Clone, Debug)]
pub struct Layout {
    /// cwd of every emitted process
    pub workdir: PathBuf,
    pub sites_dir: PathBuf,
    pub public_dir: PathBuf,
    pub guide_output: PathBuf,
    pub curated_channels: PathBuf,
    pub all_channels: PathBuf,
    pub cache: CachePaths,

    /// Binary providing the `combine-run` subcommand.
    pub combiner_bin: PathBuf,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("."),
            sites_dir: PathBuf::from("sites"),
            public_dir: PathBuf::from("public"),
            guide_output: PathBuf::from("public/guide.xml"),
            curated_channels: PathBuf::from("channels.xml"),
            all_channels: PathBuf::from("all.channels.xml"),
            cache: CachePaths::in_dir(CACHE_DIR_NAME),
            combiner_bin: PathBuf::from(env!("CARGO_PKG_NAME")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Configuration {
    pub schedule: String,
    pub port: u16,
    pub max_connections: u32,
    pub gzip: bool,
    pub curl: bool,
    pub run_at_startup: bool,
    pub timeout: Option<u64>,
    pub delay: Option<u64>,
    pub days: Option<u64>,
    pub proxy: Option<String>,
    pub sites: Vec<String>,
    pub langs: Vec<String>,
    pub all_sites: bool,
    pub grab_command: Vec<String>,
    pub serve_command: Vec<String>,
    pub layout: Layout,
}

impl Configuration {
    pub fn resolve(env: &HashMap<String, String>, layout: Layout) -> Self {
        let var = |key: &str| env.get(key).map(String::as_str);

        let schedule = var("CRON_SCHEDULE")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SCHEDULE)
            .to_string();

        let port = resolve_int(var("PORT"))
            .filter(|n| *n > 0)
            .and_then(|n| u16::try_from(n).ok())
            .unwrap_or(DEFAULT_PORT);

        let max_connections = resolve_int(var("MAX_CONNECTIONS"))
            .filter(|n| *n > 0)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);

        let site_raw = var("SITE")
            .filter(|s| !s.trim().is_empty())
            .or(var("SITES"));

        let proxy = var("PROXY")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let mut grab_command = resolve_list(var("GRAB_COMMAND"));
        if grab_command.is_empty() {
            grab_command = ["npm", "run", "grab", "--"].map(String::from).to_vec();
        }
        let mut serve_command = resolve_list(var("SERVE_COMMAND"));
        if serve_command.is_empty() {
            serve_command = ["npx", "serve"].map(String::from).to_vec();
        }

        Self {
            schedule,
            port,
            max_connections,
            gzip: resolve_bool(var("GZIP"), false),
            curl: resolve_bool(var("CURL"), false),
            run_at_startup: resolve_bool(var("RUN_AT_STARTUP"), true),
            timeout: resolve_non_negative(var("TIMEOUT")),
            delay: resolve_non_negative(var("DELAY")),
            days: resolve_non_negative(var("DAYS")),
            proxy,
            sites: dedup_keep_order(resolve_list(site_raw)),
            langs: dedup_keep_order(resolve_list(var("GRAB_LANG"))),
            all_sites: resolve_bool(var("ALL_SITES"), false),
            grab_command,
            serve_command,
            layout,
        }
    }
}

/// Absent → `default`; otherwise false only for the usual "off" spellings.
pub fn resolve_bool(raw: Option<&str>, default: bool) -> bool {
    match raw {
        None => default,
        Some(s) => {
            let s = s.trim().to_lowercase();
            !FALSY.contains(&s.as_str())
        }
    }
}

/// Numeric parse that never fails: anything unusable is `None`.
/// Finite fractional values are truncated toward zero.
pub fn resolve_int(raw: Option<&str>) -> Option<i64> {
    let s = raw?.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(n) = s.parse::<i64>() {
        return Some(n);
    }
    let f: f64 = s.parse().ok()?;
    if !f.is_finite() {
        debug!(value = s, "ignoring non-finite number");
        return None;
    }
    Some(f.trunc() as i64)
}

fn resolve_non_negative(raw: Option<&str>) -> Option<u64> {
    resolve_int(raw).and_then(|n| u64::try_from(n).ok())
}

/// JSON array of strings, or a string split on newlines, commas,
/// semicolons and whitespace. A broken JSON array falls back to splitting.
pub fn resolve_list(raw: Option<&str>) -> Vec<String> {
    let Some(s) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Vec::new();
    };

    if s.starts_with('[') {
        match serde_json::from_str::<Vec<Value>>(s) {
            Ok(items) => {
                return items
                    .into_iter()
                    .filter_map(|v| match v {
                        Value::Null => None,
                        Value::String(s) => Some(s.trim().to_string()),
                        other => Some(other.to_string()),
                    })
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            Err(e) => debug!(error = %e, "list is not a JSON array, splitting on delimiters"),
        }
    }

    s.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Process-name safe form of a site id.
pub fn slugify(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_run = false;

    for ch in text.to_lowercase().chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '.' | '_' | '-') {
            out.push(ch);
            in_run = false;
        } else if !in_run {
            out.push('-');
            in_run = true;
        }
    }

    // ascii only at this point
    out.truncate(SLUG_MAX_LEN);
    out
}

pub fn dedup_keep_order(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|s| seen.insert(s.clone()))
        .collect()
}
