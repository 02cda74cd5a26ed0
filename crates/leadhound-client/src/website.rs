//! General-purpose collectors and a website contact extractor.
//!
//! Site-specific collectors plug into the same traits; these cover the
//! common cases of a fixed seed list and a paginated listing page.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use leadhound_core::error::AppError;
use leadhound_core::investigate::CrawlInvestigator;
use leadhound_core::job::SearchParams;
use leadhound_core::models::{FieldSet, Lead, LeadField, WorkUnit};
use leadhound_core::page::scan_html;
use leadhound_core::patterns::{is_blocked, is_non_web};
use leadhound_core::traits::{Collector, Extractor, PageSession};
use leadhound_core::util::{host_matches, host_of};
use serde_json::{Map, Value, json};

/// Collector over a fixed list of URLs. Never navigates.
///
/// Every pass returns the whole list; the orchestrator's dedup and per-pass
/// cap turn that into successive slices, and a pass with nothing new ends
/// collection.
#[derive(Debug, Clone, Default)]
pub struct SeedListCollector {
    seeds: Arc<Vec<WorkUnit>>,
}

impl SeedListCollector {
    pub fn new<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let seeds = urls
            .into_iter()
            .map(|u| u.as_ref().trim().to_string())
            .filter(|u| !u.is_empty() && !u.starts_with('#'))
            .map(|u| WorkUnit::from_url(&u))
            .collect();
        Self {
            seeds: Arc::new(seeds),
        }
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }
}

impl Collector for SeedListCollector {
    async fn collect<S: PageSession>(
        &self,
        _session: &S,
        _params: &SearchParams,
        pass: u32,
        wanted: usize,
    ) -> Result<Vec<WorkUnit>, AppError> {
        tracing::debug!(pass, wanted, seeds = self.seeds.len(), "Serving seed list");
        Ok(self.seeds.as_ref().clone())
    }
}

/// Collector that opens a listing/search page and harvests the outbound
/// links found there.
///
/// The URL template may use `{query}`, `{location}`, `{page}` (1-based pass
/// number) and any key of [`SearchParams::extra`] in braces. Values are
/// URL-encoded.
#[derive(Debug, Clone)]
pub struct ListingCollector {
    template: String,
    navigation_timeout: Duration,
}

impl ListingCollector {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            navigation_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_navigation_timeout(mut self, timeout: Duration) -> Self {
        self.navigation_timeout = timeout;
        self
    }

    pub fn listing_url(&self, params: &SearchParams, pass: u32) -> String {
        let encode = |s: &str| url::form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>();
        let mut url = self
            .template
            .replace("{query}", &encode(&params.query))
            .replace("{location}", &encode(params.location.as_deref().unwrap_or("")))
            .replace("{page}", &(pass + 1).to_string());
        for (key, value) in &params.extra {
            url = url.replace(&format!("{{{key}}}"), &encode(value));
        }
        url
    }
}

/// Off-site web links of a listing page, in document order, one per page.
fn harvest_links(links: &[String], listing_host: Option<&str>) -> Vec<WorkUnit> {
    let mut seen = HashSet::new();
    links
        .iter()
        .filter(|link| !is_non_web(link) && !is_blocked(link))
        .filter(|link| match (host_of(link), listing_host) {
            (Some(host), Some(listing)) => !host_matches(&host, listing),
            (Some(_), None) => true,
            (None, _) => false,
        })
        .map(|link| WorkUnit::from_url(link))
        .filter(|unit| seen.insert(unit.dedup_key.clone()))
        .collect()
}

impl Collector for ListingCollector {
    async fn collect<S: PageSession>(
        &self,
        session: &S,
        params: &SearchParams,
        pass: u32,
        wanted: usize,
    ) -> Result<Vec<WorkUnit>, AppError> {
        let url = self.listing_url(params, pass);
        session.navigate(&url, self.navigation_timeout).await?;
        let base = session.current_url().await.unwrap_or_else(|_| url.clone());
        let html = session.content().await?;

        let scan = scan_html(&html, &base);
        let listing_host = host_of(&base);
        let units = harvest_links(&scan.links, listing_host.as_deref());
        tracing::debug!(%url, pass, wanted, found = units.len(), "Listing page harvested");
        Ok(units)
    }
}

/// Extractor that investigates a website for contact fields and returns
/// them as a lead object keyed by field name.
#[derive(Debug, Clone)]
pub struct WebsiteLeadExtractor {
    investigator: CrawlInvestigator,
    fields: FieldSet,
}

impl WebsiteLeadExtractor {
    pub fn new(investigator: CrawlInvestigator, fields: FieldSet) -> Self {
        Self {
            investigator,
            fields,
        }
    }

    /// Looks for every known field.
    pub fn all_fields(investigator: CrawlInvestigator) -> Self {
        Self::new(investigator, LeadField::ALL.into_iter().collect())
    }
}

impl Extractor for WebsiteLeadExtractor {
    async fn extract<S: PageSession>(&self, session: &S, unit: &WorkUnit) -> Result<Lead, AppError> {
        let found = self
            .investigator
            .investigate(session, &unit.target, &self.fields)
            .await?;

        let mut lead = Map::new();
        lead.insert("website".into(), json!(unit.target));
        for field in LeadField::ALL {
            if let Some(value) = found.get(field) {
                lead.insert(field.as_str().into(), json!(value));
            }
        }
        if found.phones.len() > 1 {
            lead.insert("phones".into(), json!(found.phones));
        }
        if !found.links.is_empty() {
            lead.insert("links".into(), json!(found.links));
        }
        Ok(Value::Object(lead))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use leadhound_core::models::{SessionCookie, lead_has_field};
    use leadhound_core::util::normalize_url;

    use super::*;

    #[derive(Default)]
    struct StubSession {
        pages: HashMap<String, String>,
        current: Mutex<Option<String>>,
    }

    impl StubSession {
        fn with_page(mut self, url: &str, html: &str) -> Self {
            self.pages
                .insert(normalize_url(url).unwrap(), html.to_string());
            self
        }
    }

    impl PageSession for StubSession {
        async fn navigate(&self, url: &str, _timeout: Duration) -> Result<(), AppError> {
            let key = normalize_url(url).unwrap_or_default();
            if !self.pages.contains_key(&key) {
                return Err(AppError::Navigation(format!("HTTP 404 for {url}")));
            }
            *self.current.lock().unwrap() = Some(url.to_string());
            Ok(())
        }

        async fn current_url(&self) -> Result<String, AppError> {
            self.current
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| AppError::Navigation("No page loaded".into()))
        }

        async fn content(&self) -> Result<String, AppError> {
            let url = self.current_url().await?;
            Ok(self.pages[&normalize_url(&url).unwrap()].clone())
        }

        async fn evaluate(&self, _script: &str) -> Result<Value, AppError> {
            Ok(Value::Null)
        }

        async fn screenshot(&self) -> Option<Vec<u8>> {
            None
        }

        async fn set_cookies(&self, _cookies: &[SessionCookie]) -> Result<(), AppError> {
            Ok(())
        }

        async fn close(self) {}
    }

    #[tokio::test]
    async fn seed_list_returns_every_seed() {
        let collector = SeedListCollector::new(["https://a.example/", "", "# note", "b.example"]);
        let units = collector
            .collect(&StubSession::default(), &SearchParams::new("x"), 3, 1)
            .await
            .unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[1].target, "b.example");
    }

    #[test]
    fn listing_url_encodes_params() {
        let collector = ListingCollector::new(
            "https://dir.example/search?q={query}&near={location}&p={page}&cat={category}",
        );
        let params = SearchParams::new("dentistas 24h")
            .with_location("São Paulo")
            .with_extra("category", "saúde");
        assert_eq!(
            collector.listing_url(&params, 1),
            "https://dir.example/search?q=dentistas+24h&near=S%C3%A3o+Paulo&p=2&cat=sa%C3%BAde"
        );
    }

    #[tokio::test]
    async fn listing_collector_keeps_offsite_links_only() {
        let listing = r#"
            <a href="/search?p=2">Next</a>
            <a href="https://biz-a.example/">A</a>
            <a href="https://www.biz-a.example/?utm_source=dir">A again</a>
            <a href="https://www.google.com/maps?q=pizza">Map</a>
            <a href="tel:+558133334444">Call</a>
            <a href="https://biz-b.example/contato">B</a>
        "#;
        let session = StubSession::default().with_page("https://dir.example/search?q=pizza&p=1", listing);
        let collector = ListingCollector::new("https://dir.example/search?q={query}&p={page}");

        let units = collector
            .collect(&session, &SearchParams::new("pizza"), 0, 10)
            .await
            .unwrap();

        let targets: Vec<_> = units.iter().map(|u| u.target.as_str()).collect();
        assert_eq!(targets, vec!["https://biz-a.example/", "https://biz-b.example/contato"]);
    }

    #[tokio::test]
    async fn website_extractor_builds_lead_from_investigation() {
        let home = r#"<p>Fale com a gente: contato@biz.example</p>
                      <a href="tel:+55-81-3333-4444">Ligue</a>"#;
        let session = StubSession::default().with_page("https://biz.example/", home);
        let extractor = WebsiteLeadExtractor::new(
            CrawlInvestigator::default(),
            [LeadField::Email, LeadField::Phone].into_iter().collect(),
        );

        let lead = extractor
            .extract(&session, &WorkUnit::from_url("https://biz.example/"))
            .await
            .unwrap();

        assert_eq!(lead["website"], "https://biz.example/");
        assert_eq!(lead["email"], "contato@biz.example");
        assert!(lead_has_field(&lead, "phone"));
        assert!(!lead_has_field(&lead, "registry_id"));
    }

    #[tokio::test]
    async fn website_extractor_propagates_seed_failure() {
        let extractor = WebsiteLeadExtractor::all_fields(CrawlInvestigator::default());
        let err = extractor
            .extract(&StubSession::default(), &WorkUnit::from_url("https://gone.example/"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Navigation(_)));
    }
}
