use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use leadhound_core::error::AppError;
use leadhound_core::models::SessionCookie;
use leadhound_core::relay::RelayCandidate;
use leadhound_core::traits::{PageSession, SessionFactory};
use leadhound_core::util::host_matches;
use reqwest::{Client, Proxy, StatusCode};
use url::Url;

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Opens plain HTTP sessions with reqwest.
///
/// No JavaScript runs, so [`PageSession::evaluate`] is unsupported and
/// screenshots are never available. Useful for static sites and for running
/// without a Chromium install.
#[derive(Debug, Clone)]
pub struct HttpSessionFactory {
    user_agent: String,
    connect_timeout: Duration,
}

impl Default for HttpSessionFactory {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl HttpSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl SessionFactory for HttpSessionFactory {
    type Session = HttpSession;

    async fn open(&self, relay: Option<&RelayCandidate>) -> Result<HttpSession, AppError> {
        let mut builder = Client::builder()
            .user_agent(&self.user_agent)
            .connect_timeout(self.connect_timeout);
        if let Some(relay) = relay {
            let proxy = Proxy::all(relay.proxy_url())
                .map_err(|e| AppError::ConfigError(format!("Invalid relay {}: {e}", relay)))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| AppError::Generic(format!("HTTP client error: {e}")))?;

        tracing::debug!(relay = ?relay.map(|r| r.address.as_str()), "HTTP session opened");
        Ok(HttpSession {
            client,
            state: Arc::new(Mutex::new(HttpState::default())),
        })
    }
}

#[derive(Debug, Default)]
struct HttpState {
    url: Option<String>,
    body: String,
    cookies: Vec<SessionCookie>,
}

/// One reqwest client plus the last fetched document.
#[derive(Debug, Clone)]
pub struct HttpSession {
    client: Client,
    state: Arc<Mutex<HttpState>>,
}

impl HttpSession {
    fn lock_state(&self) -> MutexGuard<'_, HttpState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("HTTP session recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    fn cookie_header(&self, url: &Url) -> Option<String> {
        let host = url.host_str()?.to_lowercase();
        let path = url.path();
        let state = self.lock_state();
        let pairs: Vec<String> = state
            .cookies
            .iter()
            .filter(|c| {
                c.domain
                    .as_deref()
                    .is_none_or(|d| host_matches(&host, d.trim_start_matches('.')))
            })
            .filter(|c| c.path.as_deref().is_none_or(|p| path.starts_with(p)))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();
        (!pairs.is_empty()).then(|| pairs.join("; "))
    }
}

/// Map a reqwest failure into the engine's error taxonomy.
pub(crate) fn request_error(url: &str, e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(format!("request to {url} timed out"))
    } else if e.is_connect() {
        AppError::Connectivity(format!("Connection failed for {url}: {e}"))
    } else {
        AppError::from_transport(format!("Request to {url} failed: {e}"))
    }
}

impl PageSession for HttpSession {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), AppError> {
        let parsed = Url::parse(url)
            .map_err(|e| AppError::Navigation(format!("Invalid URL {url}: {e}")))?;
        let mut request = self.client.get(parsed.clone()).timeout(timeout);
        if let Some(cookies) = self.cookie_header(&parsed) {
            request = request.header(reqwest::header::COOKIE, cookies);
        }

        let response = request.send().await.map_err(|e| request_error(url, e))?;
        let status = response.status();
        match status {
            StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
                return Err(AppError::Connectivity(format!(
                    "HTTP 407 from relay for {url}"
                )));
            }
            StatusCode::UNAUTHORIZED => {
                return Err(AppError::AuthRequired(format!("HTTP 401 for {url}")));
            }
            s if !s.is_success() => {
                return Err(AppError::Navigation(format!(
                    "HTTP {} for {}",
                    s.as_u16(),
                    url
                )));
            }
            _ => {}
        }

        let final_url = response.url().to_string();
        let body = response
            .text()
            .await
            .map_err(|e| request_error(url, e))?;

        let mut state = self.lock_state();
        state.url = Some(final_url);
        state.body = body;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, AppError> {
        self.lock_state()
            .url
            .clone()
            .ok_or_else(|| AppError::Navigation("No page loaded".into()))
    }

    async fn content(&self) -> Result<String, AppError> {
        let state = self.lock_state();
        match state.url {
            Some(_) => Ok(state.body.clone()),
            None => Err(AppError::Navigation("No page loaded".into())),
        }
    }

    async fn evaluate(&self, _script: &str) -> Result<serde_json::Value, AppError> {
        Err(AppError::Extraction(
            "Script evaluation needs a browser session".into(),
        ))
    }

    async fn screenshot(&self) -> Option<Vec<u8>> {
        None
    }

    async fn set_cookies(&self, cookies: &[SessionCookie]) -> Result<(), AppError> {
        let mut state = self.lock_state();
        for cookie in cookies {
            state
                .cookies
                .retain(|c| !(c.name == cookie.name && c.domain == cookie.domain));
            state.cookies.push(cookie.clone());
        }
        Ok(())
    }

    async fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie(name: &str, domain: Option<&str>, path: Option<&str>) -> SessionCookie {
        SessionCookie {
            name: name.into(),
            value: "v".into(),
            domain: domain.map(Into::into),
            path: path.map(Into::into),
        }
    }

    #[tokio::test]
    async fn cookies_are_scoped_by_domain_and_path() {
        let session = HttpSessionFactory::new().open(None).await.unwrap();
        session
            .set_cookies(&[
                cookie("a", Some(".biz.example"), None),
                cookie("b", Some("other.example"), None),
                cookie("c", None, Some("/admin")),
            ])
            .await
            .unwrap();

        let url = Url::parse("https://shop.biz.example/contato").unwrap();
        assert_eq!(session.cookie_header(&url).as_deref(), Some("a=v"));

        let admin = Url::parse("https://biz.example/admin/users").unwrap();
        assert_eq!(session.cookie_header(&admin).as_deref(), Some("a=v; c=v"));
    }

    #[tokio::test]
    async fn replacing_a_cookie_keeps_one_copy() {
        let session = HttpSessionFactory::new().open(None).await.unwrap();
        session.set_cookies(&[cookie("a", None, None)]).await.unwrap();
        session.set_cookies(&[cookie("a", None, None)]).await.unwrap();
        let url = Url::parse("https://biz.example/").unwrap();
        assert_eq!(session.cookie_header(&url).as_deref(), Some("a=v"));
    }

    #[tokio::test]
    async fn fresh_session_has_no_page() {
        let session = HttpSessionFactory::new().open(None).await.unwrap();
        assert!(session.current_url().await.is_err());
        assert!(session.content().await.is_err());
        assert!(session.screenshot().await.is_none());
        assert!(session.evaluate("1").await.is_err());
    }

    #[tokio::test]
    async fn invalid_url_is_a_navigation_error() {
        let session = HttpSessionFactory::new().open(None).await.unwrap();
        let err = session
            .navigate("not a url", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Navigation(_)));
    }
}
