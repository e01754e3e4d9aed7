use crate::args::build_scraper_args;
use crate::cache::{ensure_combined_document, CombineOutcome};
use crate::config::{resolve_list, Configuration};
use crate::topology::{build_topology, Pm2Ecosystem};
use crate::types::GrabMode;

use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use std::process::{Command, ExitStatus};
use tracing::{error, info, warn};

/// Local failure (combine could not write its document, bad output path, ...).
pub const EXIT_LOCAL_FAILURE: u8 = 125;
/// The scraper could not be started at all.
pub const EXIT_SPAWN_FAILURE: u8 = 127;

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Json,
    Yaml,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum Flavor {
    /// The topology as built, mode included.
    Native,
    /// A pm2 ecosystem file.
    Pm2,
}

fn render<T: Serialize>(value: &T, format: OutputFormat) -> Result<String> {
    let s = match format {
        OutputFormat::Json => serde_json::to_string_pretty(value)?,
        OutputFormat::Yaml => serde_yaml::to_string(value)?,
    };
    Ok(s)
}

/* =========================
   topology / args
   ========================= */

pub fn render_topology(cfg: &Configuration, format: OutputFormat, flavor: Flavor) -> Result<String> {
    let topology = build_topology(cfg);
    info!(
        mode = ?topology.mode,
        processes = topology.processes.len(),
        "built process topology"
    );

    match flavor {
        Flavor::Native => render(&topology, format),
        Flavor::Pm2 => render(&Pm2Ecosystem::from(&topology), format),
    }
}

pub fn topology(
    cfg: &Configuration,
    format: OutputFormat,
    flavor: Flavor,
    output: Option<&Path>,
) -> Result<()> {
    let rendered = render_topology(cfg, format, flavor)?;

    match output {
        Some(p) => {
            if let Some(parent) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(p, rendered).with_context(|| format!("write {}", p.display()))?;
            info!(path = %p.display(), "wrote topology");
        }
        None => println!("{}", rendered.trim_end()),
    }
    Ok(())
}

/// Print the scraper argv for the configured mode, one per line.
pub fn print_args(cfg: &Configuration) -> Result<()> {
    let mode = GrabMode::select(cfg);
    for a in cfg.grab_command.iter().chain(build_scraper_args(cfg, &mode).iter()) {
        println!("{a}");
    }
    Ok(())
}

/* =========================
   combine / combine-run
   ========================= */

/// Refresh the combined document for a raw site list.
fn refresh(cfg: &Configuration, sites: &str) -> Result<CombineOutcome> {
    let sites = resolve_list(Some(sites));
    if sites.is_empty() {
        warn!("no sites given, the combined document will be empty");
    }

    let outcome = ensure_combined_document(&sites, &cfg.layout.sites_dir, &cfg.layout.cache)?;
    info!(
        rebuilt = outcome.rebuilt,
        fragments = outcome.fragments,
        "combined channel list ready"
    );
    Ok(outcome)
}

/// Refresh the combined document and write its path to `out`.
pub fn combine(cfg: &Configuration, sites: &str, out: &mut impl Write) -> Result<()> {
    let outcome = refresh(cfg, sites)?;
    writeln!(out, "{}", outcome.document.display())?;
    Ok(())
}

/// Refresh the combined document, then run `command` and hand back its exit
/// code. Only a failed document write is an `Err`. Stdout belongs to the
/// scraper.
pub fn combine_run(cfg: &Configuration, sites: &str, command: &[String]) -> Result<u8> {
    refresh(cfg, sites)?;

    let Some((program, args)) = command.split_first() else {
        error!("no scraper command given after `--`");
        return Ok(EXIT_SPAWN_FAILURE);
    };

    info!(program = %program, args = args.len(), "starting scraper");
    let status = match Command::new(program).args(args).status() {
        Ok(s) => s,
        Err(e) => {
            error!(program = %program, error = %e, "cannot start scraper");
            return Ok(EXIT_SPAWN_FAILURE);
        }
    };

    let code = exit_code(status);
    if code == 0 {
        info!("scraper finished");
    } else {
        warn!(code, "scraper exited with failure");
    }
    Ok(code)
}

/// Exit status as a shell would report it.
fn exit_code(status: ExitStatus) -> u8 {
    if let Some(code) = status.code() {
        return (code & 0xff) as u8;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return ((128 + sig) & 0xff) as u8;
        }
    }

    1
}
