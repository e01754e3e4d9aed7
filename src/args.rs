use crate::config::Configuration;
use crate::types::GrabMode;

/// Scraper flags for `mode`. The order is fixed.
pub fn build_scraper_args(cfg: &Configuration, mode: &GrabMode) -> Vec<String> {
    let layout = &cfg.layout;
    let mut args: Vec<String> = Vec::new();

    match mode {
        GrabMode::Combined { .. } => {
            args.push("--channels".into());
            args.push(layout.cache.document.display().to_string());
        }
        GrabMode::Single { site } => {
            args.push("--site".into());
            args.push(site.clone());
        }
        GrabMode::Fallback { all_sites } => {
            let channels = if *all_sites {
                &layout.all_channels
            } else {
                &layout.curated_channels
            };
            args.push("--channels".into());
            args.push(channels.display().to_string());
        }
    }

    args.push("--output".into());
    args.push(layout.guide_output.display().to_string());
    args.push("--maxConnections".into());
    args.push(cfg.max_connections.to_string());

    if let Some(days) = cfg.days {
        args.push("--days".into());
        args.push(days.to_string());
    }
    if let Some(timeout) = cfg.timeout {
        args.push("--timeout".into());
        args.push(timeout.to_string());
    }
    if let Some(delay) = cfg.delay {
        args.push("--delay".into());
        args.push(delay.to_string());
    }
    if let Some(proxy) = &cfg.proxy {
        args.push("--proxy".into());
        args.push(proxy.clone());
    }
    if !cfg.langs.is_empty() {
        args.push("--lang".into());
        args.push(cfg.langs.join(","));
    }
    if cfg.gzip {
        args.push("--gzip".into());
    }
    if cfg.curl {
        args.push("--curl".into());
    }

    args
}
