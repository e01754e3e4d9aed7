//! Process topology handed to the supervisor.

use crate::args::build_scraper_args;
use crate::config::{slugify, Configuration};
use crate::types::{GrabMode, ProcessDescriptor, RestartPolicy, Topology};
use serde::Serialize;

/// Initial restart delay for long-running units; the supervisor grows it.
pub const RESTART_BACKOFF_MS: u64 = 100;

impl GrabMode {
    /// Explicit sites always win; `all_sites` only matters without any.
    pub fn select(cfg: &Configuration) -> Self {
        match cfg.sites.as_slice() {
            [] => GrabMode::Fallback {
                all_sites: cfg.all_sites,
            },
            [site] => GrabMode::Single { site: site.clone() },
            sites => GrabMode::Combined {
                sites: sites.to_vec(),
            },
        }
    }
}

fn always() -> RestartPolicy {
    RestartPolicy::Always {
        backoff_ms: RESTART_BACKOFF_MS,
    }
}

/// `(scheduled name, startup name)` for `mode`.
fn job_names(mode: &GrabMode) -> (String, String) {
    match mode {
        GrabMode::Combined { .. } => ("grab-sites".into(), "grab-sites-at-startup".into()),
        GrabMode::Single { site } => {
            let slug = slugify(site);
            (format!("grab-{slug}"), format!("grab-at-startup-{slug}"))
        }
        GrabMode::Fallback { .. } => ("grab".into(), "grab-at-startup".into()),
    }
}

/// `(program, args)` from a command line.
fn split_command(cmd: &[String]) -> (String, Vec<String>) {
    match cmd.split_first() {
        Some((program, rest)) => (program.clone(), rest.to_vec()),
        None => (String::new(), Vec::new()),
    }
}

/// `(command, args)` running one grab for `mode`.
///
/// Combined mode goes through this binary's `combine-run` so the channel
/// list is refreshed right before every scrape.
fn job_command(cfg: &Configuration, mode: &GrabMode) -> (String, Vec<String>) {
    let mut scraper = cfg.grab_command.clone();
    scraper.extend(build_scraper_args(cfg, mode));

    match mode {
        GrabMode::Combined { sites } => {
            let layout = &cfg.layout;
            // JSON keeps ids with delimiters in them intact
            let site_list = serde_json::to_string(sites).unwrap_or_else(|_| sites.join(","));
            let mut args = vec![
                "--sites-dir".to_string(),
                layout.sites_dir.display().to_string(),
                "--cache-dir".to_string(),
                layout.cache.dir.display().to_string(),
                "combine-run".to_string(),
                "--sites".to_string(),
                site_list,
                "--".to_string(),
            ];
            args.extend(scraper);
            (layout.combiner_bin.display().to_string(), args)
        }
        _ => split_command(&scraper),
    }
}

pub fn build_topology(cfg: &Configuration) -> Topology {
    let layout = &cfg.layout;
    let mode = GrabMode::select(cfg);
    let mut processes = Vec::new();

    let (serve_program, mut serve) = split_command(&cfg.serve_command);
    serve.extend([
        "--listen".to_string(),
        cfg.port.to_string(),
        layout.public_dir.display().to_string(),
    ]);
    processes.push(ProcessDescriptor {
        name: "serve".into(),
        command: serve_program,
        args: serve,
        restart: always(),
        cwd: layout.workdir.clone(),
        schedule: None,
    });

    let (scheduled_name, startup_name) = job_names(&mode);
    let (command, args) = job_command(cfg, &mode);

    processes.push(ProcessDescriptor {
        name: scheduled_name,
        command: command.clone(),
        args: args.clone(),
        restart: always(),
        cwd: layout.workdir.clone(),
        schedule: Some(cfg.schedule.clone()),
    });

    if cfg.run_at_startup {
        processes.push(ProcessDescriptor {
            name: startup_name,
            command,
            args,
            restart: RestartPolicy::Once,
            cwd: layout.workdir.clone(),
            schedule: None,
        });
    }

    Topology { mode, processes }
}

/// pm2 ecosystem file.
#[derive(Debug, Serialize)]
pub struct Pm2Ecosystem {
    pub apps: Vec<Pm2App>,
}

#[derive(Debug, Serialize)]
pub struct Pm2App {
    pub name: String,
    pub script: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub interpreter: String,
    pub autorestart: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp_backoff_restart_delay: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron_restart: Option<String>,

    /// A clean scheduled run waits for the next trigger instead of looping.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop_exit_codes: Vec<i32>,
}

impl From<&ProcessDescriptor> for Pm2App {
    fn from(p: &ProcessDescriptor) -> Self {
        let (autorestart, backoff) = match p.restart {
            RestartPolicy::Always { backoff_ms } => (true, Some(backoff_ms)),
            RestartPolicy::Once => (false, None),
        };
        let stop_exit_codes = if p.schedule.is_some() && autorestart {
            vec![0]
        } else {
            Vec::new()
        };

        Pm2App {
            name: p.name.clone(),
            script: p.command.clone(),
            args: p.args.clone(),
            cwd: p.cwd.display().to_string(),
            interpreter: "none".into(),
            autorestart,
            exp_backoff_restart_delay: backoff,
            cron_restart: p.schedule.clone(),
            stop_exit_codes,
        }
    }
}

impl From<&Topology> for Pm2Ecosystem {
    fn from(t: &Topology) -> Self {
        Pm2Ecosystem {
            apps: t.processes.iter().map(Pm2App::from).collect(),
        }
    }
}
