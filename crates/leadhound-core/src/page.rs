//! HTML scanning for the site investigator.
//!
//! [`scan_html`] reads any page generically. Link-in-bio pages and social
//! profiles get [`scan_profile`] instead, which keeps only the listed
//! destinations, button labels and bio, and can be topped up with what
//! [`PROFILE_SCRIPT`] reports from a rendered browser tab.

use std::collections::HashSet;
use std::sync::LazyLock;

use scraper::{ElementRef, Html, Node, Selector};
use serde::Deserialize;
use url::Url;

use crate::patterns::{is_bio_aggregator_host, is_rich_profile_host};
use crate::util::host_of;

static BODY: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("body").expect("body selector should parse"));
static ANCHORS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("anchor selector should parse"));
static TITLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("title selector should parse"));
static DESCRIPTION: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"meta[name="description"], meta[property="og:description"]"#)
        .expect("description selector should parse")
});

static BUTTONS: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"button, [role="button"]"#).expect("button selector should parse")
});
static DATA_LINKS: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("[data-href], [data-url]").expect("data link selector should parse")
});
static PROFILE_BIO: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"[data-testid="UserDescription"], [data-e2e="user-bio"], header section, .bio"#)
        .expect("bio selector should parse")
});

const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "template", "svg"];

/// Visible text and outbound links of one document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageScan {
    pub title: Option<String>,
    /// Meta/OpenGraph description. Profile pages often carry the bio here.
    pub description: Option<String>,
    /// Whitespace-collapsed visible text of the body.
    pub text: String,
    /// Absolute link targets in document order, deduplicated. Non-web
    /// schemes such as `mailto:` and `tel:` are kept verbatim.
    pub links: Vec<String>,
}

impl PageScan {
    /// Text and description joined, for pattern matching.
    pub fn searchable_text(&self) -> String {
        match &self.description {
            Some(desc) => format!("{} {}", desc, self.text),
            None => self.text.clone(),
        }
    }
}

pub fn scan_html(html: &str, base_url: &str) -> PageScan {
    let document = Html::parse_document(html);
    let base = Url::parse(base_url).ok();

    let title = title_of(&document);
    let description = description_of(&document);

    let mut text = String::new();
    if let Some(body) = document.select(&BODY).next() {
        for node in body.descendants() {
            let Node::Text(chunk) = node.value() else {
                continue;
            };
            let skipped = node.ancestors().any(|a| {
                a.value()
                    .as_element()
                    .is_some_and(|e| SKIPPED_ELEMENTS.contains(&e.name()))
            });
            if !skipped {
                text.push_str(chunk);
                text.push(' ');
            }
        }
    }

    let mut seen = HashSet::new();
    let links = document
        .select(&ANCHORS)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| resolve_link(base.as_ref(), href))
        .filter(|link| seen.insert(link.clone()))
        .collect();

    PageScan {
        title,
        description,
        text: collapse_whitespace(&text),
        links,
    }
}

fn title_of(document: &Html) -> Option<String> {
    document
        .select(&TITLE)
        .next()
        .map(element_text)
        .filter(|t| !t.is_empty())
}

fn description_of(document: &Html) -> Option<String> {
    document
        .select(&DESCRIPTION)
        .filter_map(|m| m.value().attr("content"))
        .map(collapse_whitespace)
        .find(|d| !d.is_empty())
}

fn element_text(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<String>())
}

/// Destinations that get their own extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileKind {
    /// Link-in-bio service: the page is a list of buttons.
    Aggregator,
    /// Social network profile: bio, contact buttons, an external link.
    Social,
}

impl ProfileKind {
    pub fn of(url: &str) -> Option<Self> {
        let host = host_of(url)?;
        if is_bio_aggregator_host(&host) {
            Some(ProfileKind::Aggregator)
        } else if is_rich_profile_host(&host) {
            Some(ProfileKind::Social)
        } else {
            None
        }
    }
}

/// Evaluated in browser sessions on profile pages. Both families render
/// most of their content client-side, so the static markup is often empty.
pub const PROFILE_SCRIPT: &str = r#"(() => {
  const text = (el) => ((el && el.innerText) || '').trim();
  const meta = document.querySelector('meta[name="description"], meta[property="og:description"]');
  const bio = text(document.querySelector(
    '[data-testid="UserDescription"], [data-e2e="user-bio"], header section, .bio'
  )) || (meta ? meta.content : '');
  const anchors = Array.from(document.querySelectorAll('a[href]'));
  const buttons = Array.from(document.querySelectorAll('button, [role="button"]'));
  return {
    bio,
    links: anchors.map((a) => a.href),
    labels: anchors.concat(buttons).map(text).filter(Boolean),
  };
})()"#;

/// What [`PROFILE_SCRIPT`] reports from a rendered page.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RenderedProfile {
    pub bio: Option<String>,
    pub links: Vec<String>,
    pub labels: Vec<String>,
}

impl RenderedProfile {
    /// Add what the static markup missed: bio, labels and link targets.
    pub fn merge_into(self, scan: &mut PageScan, base_url: &str) {
        let base = Url::parse(base_url).ok();
        let bio = self
            .bio
            .map(|b| collapse_whitespace(&b))
            .filter(|b| !b.is_empty());
        let mut extra: Vec<String> = Vec::new();
        match bio {
            Some(bio) if scan.description.is_none() => scan.description = Some(bio),
            Some(bio) => extra.push(bio),
            None => {}
        }
        extra.extend(
            self.labels
                .iter()
                .map(|l| collapse_whitespace(l))
                .filter(|l| !l.is_empty()),
        );
        for chunk in extra {
            if !scan.text.is_empty() {
                scan.text.push(' ');
            }
            scan.text.push_str(&chunk);
        }
        for href in &self.links {
            if let Some(link) = resolve_link(base.as_ref(), href)
                && !scan.links.contains(&link)
            {
                scan.links.push(link);
            }
        }
    }
}

/// Scan of a profile page.
///
/// Text is the bio plus the labels of listed buttons, and links are the
/// destinations the page lists. On social profiles only links leaving the
/// network count; the network's own navigation is noise.
pub fn scan_profile(html: &str, base_url: &str, kind: ProfileKind) -> PageScan {
    let document = Html::parse_document(html);
    let base = Url::parse(base_url).ok();
    let page_host = host_of(base_url);

    let mut labels: Vec<String> = Vec::new();
    if kind == ProfileKind::Social
        && let Some(bio) = document
            .select(&PROFILE_BIO)
            .map(element_text)
            .find(|b| !b.is_empty())
    {
        labels.push(bio);
    }

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for anchor in document.select(&ANCHORS) {
        let Some(link) = anchor
            .value()
            .attr("href")
            .and_then(|href| resolve_link(base.as_ref(), href))
        else {
            continue;
        };
        if kind == ProfileKind::Social && host_of(&link) == page_host {
            continue;
        }
        labels.extend(anchor_labels(anchor));
        if seen.insert(link.clone()) {
            links.push(link);
        }
    }

    // Buttons wired up by script instead of an href.
    for element in document.select(&DATA_LINKS) {
        let targets = ["data-href", "data-url"]
            .iter()
            .filter_map(|attr| element.value().attr(attr))
            .filter_map(|href| resolve_link(base.as_ref(), href));
        for link in targets {
            if seen.insert(link.clone()) {
                links.push(link);
            }
        }
    }
    labels.extend(
        document
            .select(&BUTTONS)
            .map(element_text)
            .filter(|l| !l.is_empty()),
    );

    PageScan {
        title: title_of(&document),
        description: description_of(&document),
        text: labels.join(" "),
        links,
    }
}

/// Visible text of an anchor plus its `aria-label` and `title`.
fn anchor_labels(anchor: ElementRef<'_>) -> Vec<String> {
    let mut labels = vec![element_text(anchor)];
    labels.extend(
        ["aria-label", "title"]
            .iter()
            .filter_map(|attr| anchor.value().attr(attr))
            .map(collapse_whitespace),
    );
    labels.retain(|l| !l.is_empty());
    labels.dedup();
    labels
}

fn resolve_link(base: Option<&Url>, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let lower = href.to_lowercase();
    if lower.starts_with("javascript:") || lower.starts_with("data:") {
        return None;
    }
    if let Ok(absolute) = Url::parse(href) {
        return Some(absolute.to_string());
    }
    let mut joined = base?.join(href).ok()?;
    joined.set_fragment(None);
    Some(joined.to_string())
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r##"
        <html>
          <head>
            <title> Clínica Sorriso </title>
            <meta name="description" content="Odontologia em Recife. contato@sorriso.com.br">
            <style>.x { color: red }</style>
          </head>
          <body>
            <h1>Bem-vindo</h1>
            <p>Ligue   (81) 3333-4444</p>
            <script>var secret = "hidden@script.js";</script>
            <a href="/contato">Contato</a>
            <a href="https://instagram.com/sorriso">Instagram</a>
            <a href="mailto:contato@sorriso.com.br">Email</a>
            <a href="#top">Topo</a>
            <a href="javascript:void(0)">Nada</a>
            <a href="/contato">Contato de novo</a>
          </body>
        </html>
    "##;

    #[test]
    fn test_scan_collects_visible_text_only() {
        let scan = scan_html(PAGE, "https://sorriso.com.br/");
        assert!(scan.text.contains("Bem-vindo"));
        assert!(scan.text.contains("Ligue (81) 3333-4444"));
        assert!(!scan.text.contains("hidden@script.js"));
        assert!(!scan.text.contains("color: red"));
        assert_eq!(scan.title.as_deref(), Some("Clínica Sorriso"));
        assert!(scan.searchable_text().contains("contato@sorriso.com.br"));
    }

    #[test]
    fn test_scan_resolves_and_dedups_links() {
        let scan = scan_html(PAGE, "https://sorriso.com.br/");
        assert_eq!(
            scan.links,
            vec![
                "https://sorriso.com.br/contato",
                "https://instagram.com/sorriso",
                "mailto:contato@sorriso.com.br",
            ]
        );
    }

    const AGGREGATOR: &str = r#"
        <html><head><title>Biz | Linktree</title></head><body>
          <a href="https://biz.example/" aria-label="Site oficial">Site</a>
          <a href="https://wa.me/5581999998888">WhatsApp</a>
          <div role="button" data-href="mailto:oi@biz.example">Fale com a gente</div>
          <p>Join Linktree today</p>
        </body></html>
    "#;

    #[test]
    fn test_aggregator_scan_keeps_buttons_and_targets() {
        let scan = scan_profile(AGGREGATOR, "https://linktr.ee/biz", ProfileKind::Aggregator);
        assert_eq!(
            scan.links,
            vec![
                "https://biz.example/",
                "https://wa.me/5581999998888",
                "mailto:oi@biz.example",
            ]
        );
        assert!(scan.text.contains("Site oficial"));
        assert!(scan.text.contains("Fale com a gente"));
        assert!(!scan.text.contains("Join Linktree"));
    }

    #[test]
    fn test_social_scan_drops_network_navigation() {
        let html = r#"
            <header><section>Padaria artesanal. Pedidos (81) 3333-4444</section></header>
            <a href="/explore/">Explore</a>
            <a href="https://www.instagram.com/biz/reels/">Reels</a>
            <a href="https://l.instagram.com/?u=https%3A%2F%2Fbiz.example%2F">biz.example</a>
        "#;
        let scan = scan_profile(html, "https://www.instagram.com/biz/", ProfileKind::Social);
        assert_eq!(
            scan.links,
            vec!["https://l.instagram.com/?u=https%3A%2F%2Fbiz.example%2F"]
        );
        assert!(scan.text.starts_with("Padaria artesanal"));
        assert!(!scan.text.contains("Explore"));
    }

    #[test]
    fn test_rendered_profile_fills_gaps() {
        let mut scan = scan_profile("<div id=\"root\"></div>", "https://beacons.ai/biz", ProfileKind::Aggregator);
        assert!(scan.links.is_empty());

        let rendered: RenderedProfile = serde_json::from_value(serde_json::json!({
            "bio": "  Doces   finos ",
            "links": ["/biz/contact", "mailto:oi@biz.example"],
            "labels": ["Encomendas (81) 99999-8888"]
        }))
        .unwrap();
        rendered.merge_into(&mut scan, "https://beacons.ai/biz");

        assert_eq!(scan.description.as_deref(), Some("Doces finos"));
        assert_eq!(
            scan.links,
            vec!["https://beacons.ai/biz/contact", "mailto:oi@biz.example"]
        );
        assert!(scan.searchable_text().contains("(81) 99999-8888"));
    }

    #[test]
    fn test_profile_kind_by_host() {
        assert_eq!(ProfileKind::of("https://linktr.ee/biz"), Some(ProfileKind::Aggregator));
        assert_eq!(ProfileKind::of("https://www.instagram.com/biz/"), Some(ProfileKind::Social));
        assert_eq!(ProfileKind::of("https://biz.example/"), None);
    }

    #[test]
    fn test_relative_links_without_base_are_dropped() {
        let scan = scan_html(r#"<a href="/x">x</a><a href="https://a.example/">a</a>"#, "not a url");
        assert_eq!(scan.links, vec!["https://a.example/"]);
    }
}
