use anyhow::{anyhow, Context, Result};
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams,
    DispatchMouseEventType, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::network::{EventRequestWillBeSent, EventResponseReceived};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::js_protocol::runtime::EventConsoleApiCalled;
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::agent::LoadState;

#[derive(Clone, Debug)]
pub struct BrowserConfig {
    pub headless: bool,
    pub width: u32,
    pub height: u32,
    pub user_agent: Option<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self { headless: true, width: 1024, height: 768, user_agent: None }
    }
}

pub struct Browser {
    page: Page,
    browser: Mutex<OxideBrowser>,
    handler: JoinHandle<()>,
    listeners: Vec<JoinHandle<()>>,
    profile_dir: PathBuf,
    cfg: BrowserConfig,
}

impl Browser {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Use a unique user data dir per run to avoid ProcessSingleton profile lock conflicts
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("screenpilot-profile-{}-{}", std::process::id(), ts));
        let _ = std::fs::create_dir_all(&profile_dir);
        builder = builder
            .user_data_dir(profile_dir.clone())
            .window_size(cfg.width, cfg.height)
            .arg(format!("--window-size={},{}", cfg.width, cfg.height))
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg)
            .await
            .context("failed to launch chromium")?;
        let handler = tokio::spawn(async move {
            while let Some(_ev) = handler.next().await {}
        });
        let page = browser.new_page("about:blank").await?;
        if let Some(ua) = &cfg.user_agent {
            page.set_user_agent(ua.clone()).await?;
        }
        let mut this = Self {
            page,
            browser: Mutex::new(browser),
            handler,
            listeners: Vec::new(),
            profile_dir,
            cfg,
        };
        this.apply_viewport().await?;
        this.attach_event_logging().await?;
        Ok(this)
    }

    async fn apply_viewport(&self) -> Result<()> {
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(self.cfg.width as i64)
            .height(self.cfg.height as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(metrics).await?;
        Ok(())
    }

    /// Mirrors page console output and network traffic into the log.
    async fn attach_event_logging(&mut self) -> Result<()> {
        let mut console = self.page.event_listener::<EventConsoleApiCalled>().await?;
        self.listeners.push(tokio::spawn(async move {
            while let Some(ev) = console.next().await {
                let text = ev
                    .args
                    .iter()
                    .map(|a| {
                        a.value
                            .as_ref()
                            .map(|v| v.to_string())
                            .or_else(|| a.description.clone())
                            .unwrap_or_default()
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                info!(target: "browser", "[console] {:?}: {}", ev.r#type, text);
            }
        }));

        let mut requests = self.page.event_listener::<EventRequestWillBeSent>().await?;
        self.listeners.push(tokio::spawn(async move {
            while let Some(ev) = requests.next().await {
                info!(target: "browser", "[request] {} {}", ev.request.method, ev.request.url);
            }
        }));

        let mut responses = self.page.event_listener::<EventResponseReceived>().await?;
        self.listeners.push(tokio::spawn(async move {
            while let Some(ev) = responses.next().await {
                info!(target: "browser", "[response] {} {}", ev.response.status, ev.response.url);
            }
        }));
        Ok(())
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    pub async fn url(&self) -> Result<Option<String>> {
        Ok(self.page.url().await?)
    }

    pub async fn content(&self) -> Result<String> {
        Ok(self.page.content().await?)
    }

    pub async fn click(&self, x: i64, y: i64) -> Result<()> {
        let point = Point { x: x as f64, y: y as f64 };
        let cmd = DispatchMouseEventParams::builder()
            .x(point.x)
            .y(point.y)
            .button(MouseButton::Left)
            .click_count(1);
        let pressed = cmd
            .clone()
            .r#type(DispatchMouseEventType::MousePressed)
            .build()
            .map_err(|e| anyhow!(e))?;
        let released = cmd
            .r#type(DispatchMouseEventType::MouseReleased)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.move_mouse(point).await?.execute(pressed).await?;
        self.page.execute(released).await?;
        Ok(())
    }

    /// One key event per character, `delay` apart.
    pub async fn type_text(&self, text: &str, delay: Duration) -> Result<()> {
        for key in keystrokes(text) {
            let ev = DispatchKeyEventParams::builder()
                .r#type(DispatchKeyEventType::Char)
                .text(key)
                .build()
                .map_err(|e| anyhow!(e))?;
            self.page.execute(ev).await?;
            sleep(delay).await;
        }
        Ok(())
    }

    /// `Ok(false)` when the page did not get there within `limit`.
    pub async fn wait_for_load_state(&self, state: LoadState, limit: Duration) -> Result<bool> {
        Ok(poll_ready_state(state, limit, SETTLE_POLL, || async {
            self.page
                .evaluate("document.readyState")
                .await?
                .into_value::<String>()
                .context("readyState was not a string")
        })
        .await)
    }

    pub async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>> {
        let take = || async {
            self.page
                .screenshot(
                    ScreenshotParams::builder()
                        .format(CaptureScreenshotFormat::Png)
                        .full_page(full_page)
                        .build(),
                )
                .await
        };
        match take().await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                let msg = format!("{}", e);
                if msg.contains("0 width") || msg.contains("0 height") {
                    // Force viewport and retry once
                    self.apply_viewport().await?;
                    sleep(Duration::from_millis(50)).await;
                    return Ok(take().await?);
                }
                Err(anyhow!(e))
            }
        }
    }

    pub async fn close(&self) -> Result<()> {
        for l in &self.listeners {
            l.abort();
        }
        let closed = {
            let mut browser = self.browser.lock().await;
            match browser.close().await {
                Ok(_) => {
                    let _ = browser.wait().await;
                    Ok(())
                }
                Err(e) => {
                    let _ = browser.kill().await;
                    Err(e)
                }
            }
        };
        self.handler.abort();
        remove_profile(&self.profile_dir).await;
        closed.context("failed to close chromium")?;
        info!("browser closed");
        Ok(())
    }
}

const SETTLE_POLL: Duration = Duration::from_millis(50);

/// Polls `ready_state` until it reports `state` or `limit` runs out.
///
/// Errors count as "not yet": a click that navigates tears down the execution
/// context, and evaluation fails until the new document exists.
pub async fn poll_ready_state<F, Fut>(state: LoadState, limit: Duration, every: Duration, mut ready_state: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String>>,
{
    let poll = async {
        loop {
            match ready_state().await {
                Ok(ready) if state.reached(&ready) => return,
                Ok(ready) => debug!(%ready, "waiting for {}", state),
                Err(e) => debug!("readyState unavailable, retrying: {:#}", e),
            }
            sleep(every).await;
        }
    };
    timeout(limit, poll).await.is_ok()
}

/// Removes the per-launch Chromium profile. Failures are logged only.
async fn remove_profile(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(path = %dir.display(), "profile removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %dir.display(), "failed to remove profile: {}", e),
    }
}

/// Text for each `Char` key event. Newlines go out as carriage returns, which pages read as Enter.
pub fn keystrokes(text: &str) -> impl Iterator<Item = String> + '_ {
    text.chars().map(|c| match c {
        '\n' => "\r".to_string(),
        other => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn settle_poll_rides_through_context_teardown() {
        let mut calls = 0;
        let reached = poll_ready_state(LoadState::DomContentLoaded, Duration::from_secs(3), SETTLE_POLL, || {
            calls += 1;
            let n = calls;
            async move {
                match n {
                    1 => Err(anyhow!("Execution context was destroyed")),
                    2 => Err(anyhow!("Cannot find context with specified id")),
                    3 => Ok("loading".to_string()),
                    _ => Ok("interactive".to_string()),
                }
            }
        })
        .await;
        assert!(reached);
        assert_eq!(calls, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn settle_poll_times_out_when_errors_never_stop() {
        let started = tokio::time::Instant::now();
        let reached = poll_ready_state(LoadState::DomContentLoaded, Duration::from_secs(3), SETTLE_POLL, || async {
            Err::<String, _>(anyhow!("Execution context was destroyed"))
        })
        .await;
        assert!(!reached);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn profile_removal_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let profile = dir.path().join("profile");
        std::fs::create_dir_all(profile.join("Default")).unwrap();
        std::fs::write(profile.join("Default").join("Preferences"), b"{}").unwrap();

        remove_profile(&profile).await;
        assert!(!profile.exists());
        remove_profile(&profile).await;
    }

    #[test]
    fn one_keystroke_per_char_in_order() {
        let keys: Vec<_> = keystrokes("hello").collect();
        assert_eq!(keys, ["h", "e", "l", "l", "o"]);
    }

    #[test]
    fn multibyte_and_newline() {
        let keys: Vec<_> = keystrokes("é\n").collect();
        assert_eq!(keys, ["é", "\r"]);
    }
}
