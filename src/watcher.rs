use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    browser_controller::BrowserController,
    decoder::{FrameDecoder, FrameOutcome},
    dispatcher::{print_report, ListingDispatcher, SnapshotFetcher},
    types::{Direction, Frame},
    utils::{FEED_URL, HEADLESS, MARKETPLACE_URL, SHOW_RAW},
};

#[derive(Builder, Debug, Clone)]
#[builder(setter(into))]
pub struct WatcherOptions {
    #[builder(default = "FEED_URL.to_string()")]
    feed_url: String,
    #[builder(default = "MARKETPLACE_URL.to_string()")]
    base_url: String,
    #[builder(default = "*HEADLESS")]
    headless: bool,
    #[builder(default = "*SHOW_RAW")]
    show_raw: bool,
    #[builder(default = "2")]
    fetch_workers: usize,
    #[builder(default = "45")]
    browser_timeout_secs: u64,
    #[builder(default = "5")]
    liveness_interval_secs: u64,
}

impl WatcherOptionsBuilder {
    pub fn default_builder() -> WatcherOptionsBuilder {
        WatcherOptionsBuilder::default()
    }
}

/// Lines to print for one frame and the URLs it queued for fetching.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    pub lines: Vec<String>,
    pub dispatched: Vec<String>,
}

pub struct Watcher {
    options: WatcherOptions,
    decoder: FrameDecoder,
    dispatcher: ListingDispatcher,
}

impl Watcher {
    /// Must be called inside a tokio runtime; the fetch workers start here.
    pub fn new<F>(options: WatcherOptions, fetcher: Arc<F>) -> Self
    where
        F: SnapshotFetcher + ?Sized + 'static,
    {
        let dispatcher = ListingDispatcher::spawn(fetcher, options.fetch_workers, print_report);
        Watcher::with_dispatcher(options, dispatcher)
    }

    pub fn with_dispatcher(options: WatcherOptions, dispatcher: ListingDispatcher) -> Self {
        Watcher {
            decoder: FrameDecoder::new(&options.base_url),
            options,
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> &ListingDispatcher {
        &self.dispatcher
    }

    /// Decodes one frame, queues a fetch for every new priced listing and
    /// returns what should be printed. Never fails.
    pub fn handle_frame(&self, frame: &Frame) -> FrameReport {
        let mut report = FrameReport::default();
        let arrow = match frame.direction {
            Direction::Inbound => "<-",
            Direction::Outbound => "->",
        };

        match self.decoder.decode(frame) {
            FrameOutcome::Listings { events, message } => {
                for event in events.iter() {
                    report.lines.push(event.summary_line());
                    if event.is_priced() && self.dispatcher.dispatch(&event.url) {
                        report.dispatched.push(event.url.clone());
                    }
                }
                if self.options.show_raw {
                    report.lines.push(format!("[RAW] {} {}", arrow, message.to_json()));
                }
            }
            FrameOutcome::Query(query) => report.lines.push(format!("[QUERY] {}", query)),
            FrameOutcome::Control => {}
            FrameOutcome::Unrecognized(msg) => {
                if self.options.show_raw {
                    report.lines.push(format!("[RAW] {} {}", arrow, msg.to_json()));
                }
            }
            FrameOutcome::Undecoded(hex) => {
                debug!("undecoded {} byte frame", frame.payload.len());
                if self.options.show_raw {
                    report.lines.push(format!("[RAW] {} {}", arrow, hex));
                }
            }
            FrameOutcome::Text(text) => {
                if self.options.show_raw {
                    report.lines.push(format!("[TEXT] {} {}", arrow, text));
                }
            }
        }
        report
    }

    /// Opens the feed page and processes frames until `should_terminate` is
    /// set or the browser goes away. Fetches still running are abandoned.
    pub async fn watch(&self, should_terminate: Arc<AtomicBool>) -> anyhow::Result<()> {
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Frame>();
        let feed_url = self.options.feed_url.clone();
        let headless = self.options.headless;
        let timeout = Duration::from_secs(self.options.browser_timeout_secs);

        let (browser, tab) = tokio::task::spawn_blocking(move || {
            let browser = BrowserController::new(headless, timeout)?;
            let tab = browser.watch_websockets(&feed_url, frames_tx)?;
            Ok::<_, anyhow::Error>((browser, tab))
        })
        .await
        .context("browser worker panicked")?
        .context(format!("could not open feed {}", self.options.feed_url))?;
        let browser = Arc::new(browser);

        let browser_gone = Arc::new(AtomicBool::new(false));
        let monitor = {
            let browser = browser.clone();
            spawn_liveness_monitor(
                move || browser.is_alive(),
                Duration::from_secs(self.options.liveness_interval_secs),
                browser_gone.clone(),
            )
        };
        let mut ticker = tokio::time::interval(Duration::from_millis(250));

        loop {
            tokio::select! {
                frame = frames_rx.recv() => match frame {
                    Some(frame) => {
                        for line in self.handle_frame(&frame).lines {
                            println!("{}", line);
                        }
                    }
                    None => {
                        warn!("frame listener went away");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if should_terminate.load(Ordering::Relaxed) {
                        info!("termination requested");
                        break;
                    }
                    if browser_gone.load(Ordering::Relaxed) {
                        warn!("browser session closed");
                        break;
                    }
                }
            }
        }

        monitor.abort();
        info!(
            "stopping watcher, {} listings dispatched this run",
            self.dispatcher.seen().len()
        );
        drop(tab);
        tokio::task::spawn_blocking(move || drop(browser))
            .await
            .context("could not shut the browser down")?;
        Ok(())
    }
}

/// Polls `is_alive` off the runtime every `every` and sets `gone` once it
/// reports false. Frame handling never waits on the check.
pub fn spawn_liveness_monitor<F>(is_alive: F, every: Duration, gone: Arc<AtomicBool>) -> JoinHandle<()>
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let is_alive = Arc::new(is_alive);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every.max(Duration::from_millis(10)));
        // first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            let check = is_alive.clone();
            let alive = tokio::task::spawn_blocking(move || check())
                .await
                .unwrap_or(false);
            if !alive {
                gone.store(true, Ordering::Relaxed);
                break;
            }
        }
    })
}
