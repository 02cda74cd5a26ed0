use std::path::{Path, PathBuf};
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use leadhound_core::error::AppError;
use leadhound_core::models::SessionCookie;
use leadhound_core::relay::RelayCandidate;
use leadhound_core::traits::{PageSession, SessionFactory};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Launches one headless Chromium per session.
///
/// Chromium applies `--proxy-server` to the whole process, so each session
/// gets its own browser and profile directory; the two sessions of a job
/// never share state.
#[derive(Debug, Clone)]
pub struct BrowserSessionFactory {
    executable: Option<PathBuf>,
    headless: bool,
    launch_timeout: Duration,
    /// Page loaded right after launch through a relay, to surface dead
    /// tunnels at open time instead of on the first real navigation.
    warmup_url: Option<String>,
}

impl Default for BrowserSessionFactory {
    fn default() -> Self {
        Self {
            executable: None,
            headless: true,
            launch_timeout: Duration::from_secs(30),
            warmup_url: None,
        }
    }
}

impl BrowserSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    /// Show the browser window. Handy when an operator has to log in.
    pub fn headful(mut self) -> Self {
        self.headless = false;
        self
    }

    pub fn with_launch_timeout(mut self, timeout: Duration) -> Self {
        self.launch_timeout = timeout;
        self
    }

    pub fn with_warmup_url(mut self, url: impl Into<String>) -> Self {
        self.warmup_url = Some(url.into());
        self
    }

    /// Tries to locate the real Chrome/Chromium binary.
    ///
    /// The snap wrapper at `/snap/bin/chromium` strips unknown CLI flags, so
    /// the binary inside the snap is preferred. `None` leaves the lookup to
    /// `chromiumoxide`.
    fn find_chrome_binary(&self) -> Option<PathBuf> {
        if let Some(path) = &self.executable {
            return Some(path.clone());
        }
        if let Ok(p) = std::env::var("CHROME_BIN") {
            let path = PathBuf::from(&p);
            if path.exists() {
                return Some(path);
            }
        }

        [
            "/snap/chromium/current/usr/lib/chromium-browser/chrome",
            "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
        ]
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
    }

    fn launch_config(
        &self,
        relay: Option<&RelayCandidate>,
        profile_dir: &Path,
    ) -> Result<BrowserConfig, AppError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .disable_default_args()
            .user_data_dir(profile_dir);
        if !self.headless {
            builder = builder.with_head();
        }
        if let Some(bin) = self.find_chrome_binary() {
            tracing::debug!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }
        if self.headless {
            builder = builder.arg("--headless=new");
        }
        if let Some(relay) = relay {
            builder = builder.arg(format!("--proxy-server={}", relay.proxy_url()));
        }

        builder
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--disable-translate")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::ConfigError(format!("Browser config error: {e}")))
    }
}

impl SessionFactory for BrowserSessionFactory {
    type Session = BrowserSession;

    async fn open(&self, relay: Option<&RelayCandidate>) -> Result<BrowserSession, AppError> {
        let profile_dir = std::env::temp_dir().join(format!("leadhound-{}", Uuid::new_v4()));
        let config = self.launch_config(relay, &profile_dir)?;

        let (browser, mut handler) = tokio::time::timeout(self.launch_timeout, Browser::launch(config))
            .await
            .map_err(|_| AppError::Timeout(format!("browser launch exceeded {:?}", self.launch_timeout)))?
            .map_err(|e| AppError::Generic(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to work.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::debug!("Browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                let mut browser = browser;
                shutdown_browser(&mut browser, &handler_task, &profile_dir).await;
                return Err(AppError::Generic(format!("Failed to open tab: {e}")));
            }
        };
        let session = BrowserSession {
            browser,
            page,
            handler: handler_task,
            profile_dir,
        };

        if let (Some(relay), Some(warmup)) = (relay, &self.warmup_url)
            && let Err(e) = session.navigate(warmup, self.launch_timeout).await
        {
            tracing::debug!(relay = %relay.address, error = %e, "Relay warmup failed");
            session.close().await;
            return Err(e);
        }

        tracing::debug!(relay = ?relay.map(|r| r.address.as_str()), "Browser session opened");
        Ok(session)
    }
}

/// A Chromium process with one tab.
pub struct BrowserSession {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
    profile_dir: PathBuf,
}

async fn shutdown_browser(browser: &mut Browser, handler: &JoinHandle<()>, profile_dir: &Path) {
    if let Err(e) = browser.close().await {
        tracing::debug!("Browser close failed: {e}");
    }
    let _ = browser.wait().await;
    handler.abort();
    let _ = tokio::fs::remove_dir_all(profile_dir).await;
}

fn cdp_error(context: &str, e: impl std::fmt::Display) -> AppError {
    AppError::from_transport(format!("{context}: {e}"))
}

impl PageSession for BrowserSession {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), AppError> {
        match tokio::time::timeout(timeout, self.page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(cdp_error(&format!("Failed to navigate to {url}"), e)),
            Err(_) => Err(AppError::Timeout(format!(
                "navigation to {url} exceeded {timeout:?}"
            ))),
        }
    }

    async fn current_url(&self) -> Result<String, AppError> {
        self.page
            .url()
            .await
            .map_err(|e| cdp_error("Failed to read page URL", e))?
            .ok_or_else(|| AppError::Navigation("No page loaded".into()))
    }

    async fn content(&self) -> Result<String, AppError> {
        self.page
            .content()
            .await
            .map_err(|e| cdp_error("Failed to read page content", e))
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, AppError> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| AppError::Extraction(format!("Script failed: {e}")))?;
        Ok(result
            .into_value::<serde_json::Value>()
            .unwrap_or(serde_json::Value::Null))
    }

    async fn screenshot(&self) -> Option<Vec<u8>> {
        match self.page.screenshot(ScreenshotParams::builder().build()).await {
            Ok(png) => Some(png),
            Err(e) => {
                tracing::debug!("Screenshot failed: {e}");
                None
            }
        }
    }

    async fn set_cookies(&self, cookies: &[SessionCookie]) -> Result<(), AppError> {
        let fallback_url = self.current_url().await.ok();
        let mut params = Vec::with_capacity(cookies.len());
        for cookie in cookies {
            let mut builder = CookieParam::builder()
                .name(cookie.name.clone())
                .value(cookie.value.clone());
            match (&cookie.domain, &fallback_url) {
                (Some(domain), _) => builder = builder.domain(domain.clone()),
                (None, Some(url)) => builder = builder.url(url.clone()),
                (None, None) => {
                    return Err(AppError::Generic(format!(
                        "Cookie {} has no domain and no page is loaded",
                        cookie.name
                    )));
                }
            }
            if let Some(path) = &cookie.path {
                builder = builder.path(path.clone());
            }
            params.push(
                builder
                    .build()
                    .map_err(|e| AppError::Generic(format!("Invalid cookie {}: {e}", cookie.name)))?,
            );
        }

        self.page
            .set_cookies(params)
            .await
            .map_err(|e| cdp_error("Failed to set cookies", e))?;
        Ok(())
    }

    async fn close(self) {
        let BrowserSession {
            mut browser,
            page,
            handler,
            profile_dir,
        } = self;
        if let Err(e) = page.close().await {
            tracing::debug!("Tab close failed: {e}");
        }
        shutdown_browser(&mut browser, &handler, &profile_dir).await;
    }
}
