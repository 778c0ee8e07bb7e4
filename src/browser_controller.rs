use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use headless_chrome::protocol::cdp::types::Event;
use headless_chrome::protocol::cdp::Network;
use headless_chrome::{browser::default_executable, Browser, LaunchOptions, Tab};
use sysinfo::{Pid, PidExt, ProcessExt, System, SystemExt};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    types::{Direction, Frame},
    utils::{jitter, ACCEPT_LANGUAGE, IN_DOCKER, USER_AGENT},
};

const OPCODE_TEXT: f64 = 1.0;
const OPCODE_BINARY: f64 = 2.0;

/// HTML after client-side scripts ran, and the URL the tab ended on.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPage {
    pub final_url: String,
    pub html: String,
}

/// Owns one Chrome process. Every call blocks, so async callers go through
/// `spawn_blocking`.
pub struct BrowserController {
    browser: Browser,
    timeout: Duration,
}

impl BrowserController {
    pub fn new(headless: bool, timeout: Duration) -> Result<Self> {
        let executable = default_executable().map_err(|e| anyhow!("no Chrome binary: {}", e))?;
        let options = LaunchOptions::default_builder()
            .path(Some(executable))
            .window_size(Some((1440, 900)))
            .headless(headless)
            .idle_browser_timeout(Duration::from_secs(60 * 60 * 24))
            // warning only do this if in docker env
            .sandbox(!*IN_DOCKER)
            .build()
            .map_err(|e| anyhow!("invalid launch options: {}", e))?;
        let browser = Browser::new(options).context("browser launching error")?;

        Ok(BrowserController { browser, timeout })
    }

    fn open_tab(&self) -> Result<Arc<Tab>> {
        let tab = self.browser.new_tab().context("could not create new tab")?;
        tab.set_default_timeout(self.timeout);
        tab.set_user_agent(USER_AGENT, Some(ACCEPT_LANGUAGE), None)
            .context("could not set user agent")?;
        Ok(tab)
    }

    /// Loads `url`, lets pricing widgets settle, and returns the live DOM.
    pub fn render(&self, url: &str, settle: (u64, u64)) -> Result<RenderedPage> {
        let tab = self.open_tab()?;

        tab.navigate_to(url)
            .context(format!("could not navigate to {}", url))?
            .wait_until_navigated()
            .context(format!("{} did not finish loading", url))?;

        let wait = jitter(settle.0, settle.1);
        debug!("letting {} settle for {:?}", url, wait);
        std::thread::sleep(wait);

        let html = tab
            .get_content()
            .context(format!("could not read rendered html for {}", url))?;
        let page = RenderedPage {
            final_url: tab.get_url(),
            html,
        };
        if let Err(e) = tab.close(true) {
            debug!("could not close tab for {}: {}", url, e);
        }
        Ok(page)
    }

    /// Opens `url` with network events on and forwards every WebSocket frame
    /// the page exchanges into `frames`. The returned tab must be kept alive
    /// for as long as frames are wanted.
    pub fn watch_websockets(&self, url: &str, frames: UnboundedSender<Frame>) -> Result<Arc<Tab>> {
        let tab = self.open_tab()?;
        tab.call_method(Network::Enable {
            max_total_buffer_size: None,
            max_resource_buffer_size: None,
            max_post_data_size: None,
            report_direct_socket_traffic: None,
            enable_durable_messages: None,
        })
        .context("could not enable network events")?;

        let listener = Arc::new(move |event: &Event| {
            let frame = match event {
                Event::NetworkWebSocketCreated(ev) => {
                    info!("websocket opened: {}", ev.params.url);
                    None
                }
                Event::NetworkWebSocketClosed(_) => {
                    warn!("websocket closed");
                    None
                }
                Event::NetworkWebSocketFrameReceived(ev) => to_frame(
                    Direction::Inbound,
                    ev.params.response.opcode,
                    &ev.params.response.payload_data,
                ),
                Event::NetworkWebSocketFrameSent(ev) => to_frame(
                    Direction::Outbound,
                    ev.params.response.opcode,
                    &ev.params.response.payload_data,
                ),
                _ => None,
            };
            if let Some(frame) = frame {
                // receiver gone means the watcher is shutting down
                let _ = frames.send(frame);
            }
        });
        tab.add_event_listener(listener)
            .context("could not install websocket listener")?;

        tab.navigate_to(url)
            .context(format!("could not navigate to {}", url))?
            .wait_until_navigated()
            .context(format!("{} did not finish loading", url))?;
        info!("watching websocket traffic on {}", tab.get_url());

        Ok(tab)
    }

    /// The DevTools connection still answers.
    pub fn is_alive(&self) -> bool {
        self.browser.get_version().is_ok()
    }

    pub fn kill(&self) -> bool {
        let pid = match self.browser.get_process_id() {
            Some(pid) => pid,
            None => return false,
        };
        let mut s = System::new();
        let pid = Pid::from_u32(pid);
        if !s.refresh_process(pid) {
            return false;
        }
        if let Some(process) = s.process(pid) {
            debug!("killing process with id {}", pid);
            return process.kill();
        }
        false
    }
}

impl Drop for BrowserController {
    fn drop(&mut self) {
        debug!("killing browser process...");
        self.kill();
    }
}

fn to_frame(direction: Direction, opcode: f64, payload: &str) -> Option<Frame> {
    if opcode == OPCODE_TEXT {
        return Some(Frame::text(direction, payload));
    }
    if opcode != OPCODE_BINARY {
        return None;
    }
    match general_purpose::STANDARD.decode(payload) {
        Ok(bytes) => Some(Frame::binary(direction, bytes)),
        Err(e) => {
            debug!("binary frame is not valid base64: {}", e);
            None
        }
    }
}
