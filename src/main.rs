mod app;
mod args;
mod cache;
mod config;
mod error;
mod fs_scan;
mod merge;
mod topology;
mod types;

use app::{Flavor, OutputFormat};
use cache::CachePaths;
use clap::{Parser, Subcommand};
use config::{Configuration, Layout, CACHE_DIR_NAME};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Builds the grabber's process topology and its combined channel list"
)]
struct Cli {
    /// Working directory of every emitted process.
    #[arg(long, global = true, env = "GRAB_WORKDIR", default_value = ".")]
    workdir: PathBuf,

    /// One subdirectory per site, holding `*.channels.xml` fragments.
    #[arg(long, global = true, env = "GRAB_SITES_DIR", default_value = "sites")]
    sites_dir: PathBuf,

    #[arg(long, global = true, env = "GRAB_PUBLIC_DIR", default_value = "public")]
    public_dir: PathBuf,

    #[arg(long, global = true, env = "GRAB_OUTPUT", default_value = "public/guide.xml")]
    guide_output: PathBuf,

    #[arg(long, global = true, env = "GRAB_CHANNELS", default_value = "channels.xml")]
    curated_channels: PathBuf,

    #[arg(long, global = true, env = "GRAB_ALL_CHANNELS", default_value = "all.channels.xml")]
    all_channels: PathBuf,

    /// Scratch dir for the combined document (default: <tmp>/grab-topology).
    #[arg(long, global = true, env = "GRAB_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Binary emitted for combine-run jobs (default: this executable).
    #[arg(long, global = true, env = "GRAB_COMBINER_BIN")]
    combiner_bin: Option<PathBuf>,

    #[arg(long, global = true, default_value = "text")]
    log_format: LogFormat,

    /// -v debug, -vv trace
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    cmd: Option<Commands>,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print (or write) the process topology. The default command.
    Topology {
        #[arg(long, default_value = "json")]
        format: OutputFormat,
        #[arg(long, default_value = "native")]
        flavor: Flavor,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the scraper argv for the configured mode.
    Args,
    /// Refresh the combined channel list and print its path.
    Combine {
        #[arg(long)]
        sites: String,
    },
    /// Refresh the combined channel list, then run the scraper after `--`.
    CombineRun {
        #[arg(long)]
        sites: String,
        #[arg(last = true)]
        command: Vec<String>,
    },
}

fn init_tracing(format: LogFormat, verbose: u8) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = match verbose {
        0 => "grab_topology=info",
        1 => "grab_topology=debug",
        _ => "grab_topology=trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    // stdout carries command output only
    match format {
        LogFormat::Text => fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

fn layout_from(cli: &Cli) -> Layout {
    let defaults = Layout::default();
    Layout {
        workdir: cli.workdir.clone(),
        sites_dir: cli.sites_dir.clone(),
        public_dir: cli.public_dir.clone(),
        guide_output: cli.guide_output.clone(),
        curated_channels: cli.curated_channels.clone(),
        all_channels: cli.all_channels.clone(),
        cache: CachePaths::in_dir(
            cli.cache_dir
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join(CACHE_DIR_NAME)),
        ),
        combiner_bin: cli
            .combiner_bin
            .clone()
            .or_else(|| std::env::current_exe().ok())
            .unwrap_or(defaults.combiner_bin),
    }
}

/// The only place the process environment is read.
fn capture_env() -> HashMap<String, String> {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format, cli.verbose);

    let cfg = Configuration::resolve(&capture_env(), layout_from(&cli));

    let cmd = cli.cmd.unwrap_or(Commands::Topology {
        format: OutputFormat::Json,
        flavor: Flavor::Native,
        output: None,
    });

    let result = match cmd {
        Commands::Topology {
            format,
            flavor,
            output,
        } => app::topology(&cfg, format, flavor, output.as_deref()).map(|_| 0),
        Commands::Args => app::print_args(&cfg).map(|_| 0),
        Commands::Combine { sites } => {
            app::combine(&cfg, &sites, &mut std::io::stdout().lock()).map(|_| 0)
        }
        Commands::CombineRun { sites, command } => app::combine_run(&cfg, &sites, &command),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(app::EXIT_LOCAL_FAILURE)
        }
    }
}
