use std::sync::{atomic::AtomicBool, Arc};

use anyhow::Context;
use clap::Parser;
use log::{debug, info};
use marketpulse::{
    extractor::{ExtractorOptionsBuilder, ListingExtractor},
    utils::{FEED_URL, HEADLESS, MARKETPLACE_URL, SHOW_RAW},
    watcher::{Watcher, WatcherOptionsBuilder},
};
use signal_hook::consts::{SIGINT, SIGTERM};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Marketplace Pulse feed watcher", long_about = None)]
struct Args {
    /// Feed page to open, defaults to PULSE_FEED_URL
    #[arg(long)]
    url: Option<String>,
    /// Run Chrome without a window (also PULSE_HEADLESS)
    #[arg(long)]
    headless: bool,
    /// Print decoded field trees and hex for frames (also PULSE_SHOW_RAW)
    #[arg(long)]
    show_raw: bool,
    /// Timeout in seconds for each background listing fetch
    #[arg(long, default_value_t = 30)]
    fetch_timeout: u64,
    /// Number of listing fetches allowed to run at once
    #[arg(long, default_value_t = 2)]
    fetch_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();

    if let Ok(env) = std::env::var("RUST_LOG") {
        if env == "debug" {
            println!("{number:/>width$}", number = "", width = 20);
            println!("Debug mode enabled");
            println!("{number:/>width$}", number = "", width = 20);
            println!();
        }
    }

    let should_terminate = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGTERM, Arc::clone(&should_terminate))?;
    signal_hook::flag::register(SIGINT, Arc::clone(&should_terminate))?;

    let extractor_options = ExtractorOptionsBuilder::default_builder()
        .base_url(MARKETPLACE_URL.as_str())
        .timeout_secs(args.fetch_timeout)
        .build()?;
    let extractor =
        ListingExtractor::live(extractor_options).context("could not build the http client")?;

    let watcher_options = WatcherOptionsBuilder::default_builder()
        .feed_url(args.url.clone().unwrap_or_else(|| FEED_URL.to_string()))
        .base_url(MARKETPLACE_URL.as_str())
        .headless(args.headless || *HEADLESS)
        .show_raw(args.show_raw || *SHOW_RAW)
        .fetch_workers(args.fetch_workers)
        .build()?;
    debug!("Starting watcher with {:#?}", watcher_options);

    let watcher = Watcher::new(watcher_options, Arc::new(extractor));
    watcher.watch(should_terminate).await?;

    info!("watcher stopped");
    println!("Terminating...");
    Ok(())
}
