//! Depth-bounded recursive site investigation.
//!
//! Given a seed URL and the contact fields still missing from a lead, the
//! investigator walks the site and the profiles it links to until every
//! field is filled or the limits are hit:
//!
//! ```text
//! visit(url, depth)
//!   ├─ normalize; stop if depth >= max_depth or already visited
//!   ├─ resolve mailto:/tel:/deep-links/handles from the URL itself
//!   ├─ skip blocked links (bio aggregators exempt)
//!   ├─ navigate; profile or aggregator page -> profile scan (static markup
//!   │    plus rendered script result) and outbound-only link policy
//!   ├─ scan text + unblocked anchors for the missing fields
//!   └─ rank outbound links by the fields they may fill,
//!      recurse into the top K (K by depth), stop once nothing is missing
//! ```
//!
//! One [`Traversal`] is shared by reference across the whole call tree so
//! sibling branches never navigate the same page twice.

use std::collections::HashSet;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};

use crate::error::AppError;
use crate::models::{FieldSet, InvestigationResult, LeadField};
use crate::page::{
    PROFILE_SCRIPT, PageScan, ProfileKind, RenderedProfile, scan_html, scan_profile,
};
use crate::patterns::{
    ABOUT_HINTS, CONTACT_HINTS, extract_from_url, find_emails, find_phones, find_registry_ids,
    is_bio_aggregator_host, is_blocked, is_non_web, is_rich_profile_host, is_social_host,
    path_has_hint,
};
use crate::traits::PageSession;
use crate::util::{host_matches, host_of, normalize_url};

/// Limits of one investigation.
#[derive(Debug, Clone)]
pub struct InvestigatorConfig {
    /// Depth at which recursion stops. The seed is depth 0.
    pub max_depth: usize,
    /// Links followed per page, indexed by depth. The last entry applies to
    /// deeper levels.
    pub fanout: Vec<usize>,
    pub navigation_timeout: Duration,
    /// Total navigations allowed across the call tree.
    pub max_navigations: usize,
}

impl Default for InvestigatorConfig {
    fn default() -> Self {
        Self {
            max_depth: 5,
            fanout: vec![5, 3, 2],
            navigation_timeout: Duration::from_secs(20),
            max_navigations: 25,
        }
    }
}

impl InvestigatorConfig {
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_fanout(mut self, fanout: Vec<usize>) -> Self {
        self.fanout = fanout;
        self
    }

    pub fn with_navigation_timeout(mut self, timeout: Duration) -> Self {
        self.navigation_timeout = timeout;
        self
    }

    pub fn with_max_navigations(mut self, max_navigations: usize) -> Self {
        self.max_navigations = max_navigations;
        self
    }

    pub fn fanout_at(&self, depth: usize) -> usize {
        self.fanout
            .get(depth)
            .or(self.fanout.last())
            .copied()
            .unwrap_or(0)
    }
}

/// Visited set and navigation count shared across one call tree.
#[derive(Debug, Default)]
pub struct Traversal {
    visited: HashSet<String>,
    navigations: usize,
}

impl Traversal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_visited(&self, url: &str) -> bool {
        normalize_url(url).is_some_and(|key| self.visited.contains(&key))
    }

    /// Mark `url` visited. Returns false if it already was.
    fn mark_visited(&mut self, url: &str) -> bool {
        match normalize_url(url) {
            Some(key) => self.visited.insert(key),
            None => false,
        }
    }

    pub fn visited_count(&self) -> usize {
        self.visited.len()
    }

    pub fn navigations(&self) -> usize {
        self.navigations
    }
}

/// Link-following policy of a loaded page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageMode {
    /// A business's own site: same-site pages and known profiles.
    Site,
    /// A social profile or bio-link page: only links leaving it.
    Profile(ProfileKind),
}

impl PageMode {
    fn classify(requested: &str, final_url: &str) -> Self {
        let Some(kind) = ProfileKind::of(final_url) else {
            return PageMode::Site;
        };
        if host_of(requested) != host_of(final_url) {
            tracing::debug!(
                from = %requested,
                to = %final_url,
                ?kind,
                "Redirected into a profile page"
            );
        }
        PageMode::Profile(kind)
    }

    fn is_profile(self) -> bool {
        matches!(self, PageMode::Profile(_))
    }
}

/// Fills in missing contact fields by crawling from a seed URL.
#[derive(Debug, Clone, Default)]
pub struct CrawlInvestigator {
    config: InvestigatorConfig,
}

impl CrawlInvestigator {
    pub fn new(config: InvestigatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &InvestigatorConfig {
        &self.config
    }

    /// Investigate `url` for the fields in `missing`.
    ///
    /// Connectivity and cancellation errors propagate from any depth. Other
    /// failures of the seed navigation propagate too; deeper ones are logged
    /// and the branch is abandoned.
    pub async fn investigate<S: PageSession>(
        &self,
        session: &S,
        url: &str,
        missing: &FieldSet,
    ) -> Result<InvestigationResult, AppError> {
        let mut traversal = Traversal::new();
        self.investigate_with(session, url, missing, &mut traversal)
            .await
    }

    /// Like [`investigate`](Self::investigate) with a caller-owned traversal,
    /// so several seeds of one lead share a visited set and budget.
    pub async fn investigate_with<S: PageSession>(
        &self,
        session: &S,
        url: &str,
        missing: &FieldSet,
        traversal: &mut Traversal,
    ) -> Result<InvestigationResult, AppError> {
        let result = self
            .visit(session, url.to_string(), missing.clone(), 0, traversal)
            .await?;
        tracing::debug!(
            %url,
            navigations = traversal.navigations(),
            visited = traversal.visited_count(),
            still_missing = result.missing(missing).len(),
            "Investigation finished"
        );
        Ok(result)
    }

    fn visit<'a, S: PageSession>(
        &'a self,
        session: &'a S,
        url: String,
        wanted: FieldSet,
        depth: usize,
        traversal: &'a mut Traversal,
    ) -> BoxFuture<'a, Result<InvestigationResult, AppError>> {
        async move {
            let mut result = InvestigationResult::default();
            if wanted.is_empty() || depth >= self.config.max_depth {
                return Ok(result);
            }
            if !traversal.mark_visited(&url) {
                return Ok(result);
            }

            if !is_non_web(&url) && is_blocked(&url) {
                tracing::debug!(%url, "Skipping blocked link");
                return Ok(result);
            }
            apply_url_findings(&mut result, &url, &wanted);
            if is_non_web(&url) || result.missing(&wanted).is_empty() {
                return Ok(result);
            }
            if traversal.navigations >= self.config.max_navigations {
                tracing::debug!(%url, "Navigation budget exhausted");
                return Ok(result);
            }

            traversal.navigations += 1;
            let (final_url, html) = match self.load(session, &url).await {
                Ok(page) => page,
                Err(e) if depth == 0 || e.is_connectivity() || e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::debug!(%url, error = %e, "Abandoning branch after failed navigation");
                    return Ok(result);
                }
            };
            traversal.mark_visited(&final_url);
            apply_url_findings(&mut result, &final_url, &wanted);

            let mode = PageMode::classify(&url, &final_url);
            let scan = match mode {
                PageMode::Site => scan_html(&html, &final_url),
                PageMode::Profile(kind) => {
                    self.scan_profile_page(session, kind, &html, &final_url)
                        .await?
                }
            };
            apply_text_findings(&mut result, &scan.searchable_text(), &wanted);
            for link in &scan.links {
                if is_non_web(link) {
                    apply_url_findings(&mut result, link, &wanted);
                    traversal.mark_visited(link);
                } else if !is_blocked(link) {
                    apply_url_findings(&mut result, link, &wanted);
                }
            }

            let mut remaining = result.missing(&wanted);
            if remaining.is_empty() {
                return Ok(result);
            }

            let candidates = rank_links(&scan.links, &final_url, mode, &remaining, traversal);
            let mut followed = 0;
            for link in candidates {
                if remaining.is_empty() || followed >= self.config.fanout_at(depth) {
                    break;
                }
                if traversal.is_visited(&link) {
                    continue;
                }
                followed += 1;
                let child = self
                    .visit(session, link, remaining.clone(), depth + 1, traversal)
                    .await?;
                result.merge(child);
                remaining = result.missing(&wanted);
            }

            Ok(result)
        }
        .boxed()
    }

    /// Static profile scan topped up with the rendered page, when the
    /// session can run scripts.
    async fn scan_profile_page<S: PageSession>(
        &self,
        session: &S,
        kind: ProfileKind,
        html: &str,
        final_url: &str,
    ) -> Result<PageScan, AppError> {
        let mut scan = scan_profile(html, final_url, kind);
        match session.evaluate(PROFILE_SCRIPT).await {
            Ok(serde_json::Value::Null) => {}
            Ok(value) => match serde_json::from_value::<RenderedProfile>(value) {
                Ok(rendered) => rendered.merge_into(&mut scan, final_url),
                Err(e) => tracing::debug!(url = %final_url, error = %e, "Unexpected profile script result"),
            },
            Err(e) if e.is_connectivity() || e.is_cancelled() => return Err(e),
            Err(e) => tracing::debug!(
                url = %final_url,
                error = %e,
                "Profile script unavailable, using markup only"
            ),
        }
        Ok(scan)
    }

    async fn load<S: PageSession>(
        &self,
        session: &S,
        url: &str,
    ) -> Result<(String, String), AppError> {
        session.navigate(url, self.config.navigation_timeout).await?;
        let final_url = session
            .current_url()
            .await
            .unwrap_or_else(|_| url.to_string());
        let html = session.content().await?;
        Ok((final_url, html))
    }
}

fn apply_url_findings(result: &mut InvestigationResult, url: &str, wanted: &FieldSet) {
    for finding in extract_from_url(url) {
        if !wanted.contains(&finding.field) {
            continue;
        }
        match finding.field {
            LeadField::Phone => result.add_phone(finding.value),
            field => {
                result.set_if_empty(field, finding.value);
            }
        }
    }
    if let Some(host) = host_of(url)
        && is_social_host(&host)
        && let Some(link) = normalize_url(url)
    {
        result.add_link(link);
    }
}

fn apply_text_findings(result: &mut InvestigationResult, text: &str, wanted: &FieldSet) {
    if wanted.contains(&LeadField::Email)
        && let Some(email) = find_emails(text).into_iter().next()
    {
        result.set_if_empty(LeadField::Email, email);
    }
    if wanted.contains(&LeadField::Phone) {
        for phone in find_phones(text) {
            result.add_phone(phone);
        }
    }
    if wanted.contains(&LeadField::RegistryId)
        && let Some(id) = find_registry_ids(text).into_iter().next()
    {
        result.set_if_empty(LeadField::RegistryId, id);
    }
}

/// Followable links ordered by descending score, document order on ties.
fn rank_links(
    links: &[String],
    page_url: &str,
    mode: PageMode,
    remaining: &FieldSet,
    traversal: &Traversal,
) -> Vec<String> {
    let page_host = host_of(page_url);
    let mut scored: Vec<(u32, &String)> = links
        .iter()
        .filter(|link| !is_non_web(link) && !is_blocked(link) && !traversal.is_visited(link))
        .map(|link| (score_link(link, page_host.as_deref(), mode, remaining), link))
        .filter(|(score, _)| *score > 0)
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().map(|(_, link)| link.clone()).collect()
}

/// How likely a link is to fill one of the remaining fields. Zero means
/// never follow.
fn score_link(link: &str, page_host: Option<&str>, mode: PageMode, remaining: &FieldSet) -> u32 {
    let Some(host) = host_of(link) else {
        return 0;
    };
    let same_site =
        page_host.is_some_and(|page| host_matches(&host, page) || host_matches(page, &host));
    let aggregator = is_bio_aggregator_host(&host);
    let rich = is_rich_profile_host(&host);

    let mut score = match (mode, same_site) {
        (PageMode::Profile(_), true) => return 0,
        (PageMode::Profile(_), false) => 2,
        (PageMode::Site, true) => 1,
        (PageMode::Site, false) => 0,
    };

    let local = same_site || mode.is_profile();
    let contact = local && path_has_hint(link, CONTACT_HINTS);
    let about = local && path_has_hint(link, ABOUT_HINTS);

    for field in remaining {
        score += match field {
            LeadField::Email | LeadField::Phone => {
                if contact || aggregator {
                    4
                } else if about || rich {
                    2
                } else {
                    0
                }
            }
            LeadField::Handle => {
                if host_matches(&host, "instagram.com") {
                    5
                } else if aggregator {
                    2
                } else {
                    0
                }
            }
            LeadField::RegistryId => {
                if about {
                    3
                } else if contact {
                    1
                } else {
                    0
                }
            }
        };
    }
    score
}
