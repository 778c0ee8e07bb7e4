use anyhow::Context;
use clap::Parser;
use log::debug;
use marketpulse::{
    extractor::{ExtractorOptionsBuilder, ListingExtractor},
    utils::{env_flag, MARKETPLACE_URL},
};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Marketplace listing scraper", long_about = None)]
struct Args {
    /// Listing URL, `whop.com/<path>`, `/<path>` or bare slug
    target: String,
    /// Timeout in seconds for page loads and HTTP requests
    #[arg(short = 't', long, default_value_t = 30)]
    timeout: u64,
    /// Only print name, description, features, FAQs and pricing
    #[arg(long)]
    features_only: bool,
    /// Skip the Chrome render and parse the served HTML only
    #[arg(long)]
    no_render: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    debug!("Starting listing scraper with {:#?}", args);

    let options = ExtractorOptionsBuilder::default_builder()
        .base_url(MARKETPLACE_URL.as_str())
        .timeout_secs(args.timeout)
        .headless(env_flag("PULSE_HEADLESS", true))
        .render(!args.no_render)
        .build()?;
    let extractor = ListingExtractor::live(options).context("could not build the http client")?;

    let snapshot = extractor
        .snapshot(&args.target)
        .await
        .context(format!("could not extract {}", args.target))?;

    let out = if args.features_only {
        serde_json::to_string_pretty(&snapshot.features_only())?
    } else {
        serde_json::to_string_pretty(&snapshot)?
    };
    println!("{}", out);
    Ok(())
}
