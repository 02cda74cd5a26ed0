//! Contact patterns and host tables used by the site investigator.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::models::LeadField;
use crate::util::host_matches;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[a-z0-9][a-z0-9._%+-]*@[a-z0-9-]+(?:\.[a-z0-9-]+)*\.[a-z]{2,24}\b")
        .expect("email regex should compile")
});

static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+\d{1,3}[\s.-]?)?(?:\(\d{2,3}\)|\d{2,3})[\s.-]?9?\d{4}[\s.-]?\d{4}\b")
        .expect("phone regex should compile")
});

static REGISTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{2}\.?\d{3}\.?\d{3}/?\d{4}-?\d{2}\b").expect("registry regex should compile")
});

/// File suffixes that look like email domains in asset names (`logo@2x.png`).
const EMAIL_FALSE_SUFFIXES: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg", ".js", ".css",
];

/// Generic domains that never carry a business's own contact data.
pub const BLOCKED_DOMAINS: &[&str] = &[
    "google.com",
    "gstatic.com",
    "googleapis.com",
    "googletagmanager.com",
    "doubleclick.net",
    "youtube.com",
    "youtu.be",
    "apple.com",
    "microsoft.com",
    "wikipedia.org",
    "w3.org",
    "schema.org",
    "cloudflare.com",
    "wordpress.org",
    "wordpress.com",
    "wix.com",
    "godaddy.com",
    "maps.app.goo.gl",
    "goo.gl",
    "bit.ly",
    "waze.com",
    "pinterest.com",
    "spotify.com",
    "t.me",
];

/// Path segments of pages that never carry contact data. A segment matches
/// exactly or as a prefix followed by `-`, `_` or `.` (`privacy-policy`).
pub const BLOCKED_PATH_SEGMENTS: &[&str] = &[
    "privacy",
    "privacidade",
    "terms",
    "termos",
    "cookies",
    "login",
    "signin",
    "signup",
    "cadastro",
    "cart",
    "carrinho",
    "checkout",
    "wp-admin",
    "wp-login.php",
    "wp-json",
    "feed",
];

/// Non-HTML resources.
pub const BLOCKED_EXTENSIONS: &[&str] = &[
    ".pdf", ".jpg", ".jpeg", ".png", ".gif", ".webp", ".svg", ".zip", ".rar", ".mp4", ".mp3",
    ".css", ".js", ".xml", ".ico",
];

/// Link-in-bio services. Exempt from the blocklist; every link on them is a
/// candidate.
pub const BIO_AGGREGATORS: &[&str] = &[
    "linktr.ee",
    "beacons.ai",
    "lnk.bio",
    "bio.link",
    "bio.site",
    "taplink.cc",
    "taplink.at",
    "campsite.bio",
    "linkin.bio",
    "solo.to",
    "msha.ke",
    "hoo.be",
    "allmylinks.com",
    "linkbio.co",
    "carrd.co",
];

/// Social networks whose profile pages expose a bio, contact buttons and an
/// external link.
pub const RICH_PROFILE_HOSTS: &[&str] = &[
    "instagram.com",
    "facebook.com",
    "tiktok.com",
    "linkedin.com",
];

/// Social networks whose links are recorded on the result.
pub const SOCIAL_HOSTS: &[&str] = &[
    "instagram.com",
    "facebook.com",
    "fb.com",
    "tiktok.com",
    "linkedin.com",
    "x.com",
    "twitter.com",
    "youtube.com",
];

/// Path fragments hinting at a contact or about page.
pub const CONTACT_HINTS: &[&str] = &[
    "contact",
    "contato",
    "fale-conosco",
    "faleconosco",
    "atendimento",
    "impressum",
];

/// Path fragments hinting at company details (registry id, address).
pub const ABOUT_HINTS: &[&str] = &["about", "sobre", "quem-somos", "empresa", "institucional"];

/// Instagram first path segments that are not profiles.
const INSTAGRAM_RESERVED: &[&str] = &[
    "p", "reel", "reels", "explore", "accounts", "stories", "tv", "direct", "about", "legal",
    "developer", "web",
];

/// Messaging deep-link hosts that carry a phone number.
const MESSAGING_HOSTS: &[&str] = &["wa.me", "api.whatsapp.com", "web.whatsapp.com"];

/// Schemes that resolve entirely from the URL and are never navigated.
const NON_WEB_SCHEMES: &[&str] = &["mailto", "tel", "sms", "whatsapp", "callto"];

/// One field value resolved directly from a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlFinding {
    pub field: LeadField,
    pub value: String,
}

impl UrlFinding {
    fn new(field: LeadField, value: impl Into<String>) -> Self {
        Self {
            field,
            value: value.into(),
        }
    }
}

pub fn find_emails(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for m in EMAIL_RE.find_iter(text) {
        let email = m.as_str().trim_end_matches('.').to_lowercase();
        if EMAIL_FALSE_SUFFIXES.iter().any(|s| email.ends_with(s)) {
            continue;
        }
        if !found.contains(&email) {
            found.push(email);
        }
    }
    found
}

pub fn find_phones(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for m in PHONE_RE.find_iter(text) {
        if let Some(phone) = normalize_phone(m.as_str())
            && !found.contains(&phone)
        {
            found.push(phone);
        }
    }
    found
}

pub fn find_registry_ids(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for m in REGISTRY_RE.find_iter(text) {
        let digits: String = m.as_str().chars().filter(char::is_ascii_digit).collect();
        if digits.len() != 14 || digits.chars().all(|c| c == '0') {
            continue;
        }
        let formatted = format!(
            "{}.{}.{}/{}-{}",
            &digits[0..2],
            &digits[2..5],
            &digits[5..8],
            &digits[8..12],
            &digits[12..14]
        );
        if !found.contains(&formatted) {
            found.push(formatted);
        }
    }
    found
}

/// Digits-only phone, `+` kept when present. Rejects implausible lengths.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if !(10..=15).contains(&digits.len()) {
        return None;
    }
    if trimmed.starts_with('+') {
        Some(format!("+{}", digits))
    } else {
        Some(digits)
    }
}

/// Extract every field a URL resolves without navigation: `mailto:`,
/// `tel:`, messaging deep-links with a number and Instagram profile handles.
pub fn extract_from_url(url: &str) -> Vec<UrlFinding> {
    let mut findings = Vec::new();
    let Ok(parsed) = Url::parse(url.trim()) else {
        return findings;
    };

    match parsed.scheme() {
        "mailto" => {
            let address = parsed.path().split(',').next().unwrap_or_default();
            if let Some(email) = find_emails(&percent_decode(address)).into_iter().next() {
                findings.push(UrlFinding::new(LeadField::Email, email));
            }
        }
        "tel" | "callto" | "sms" => {
            if let Some(phone) = normalize_phone(&percent_decode(parsed.path())) {
                findings.push(UrlFinding::new(LeadField::Phone, phone));
            }
        }
        "whatsapp" => {
            if let Some(phone) = query_phone(&parsed) {
                findings.push(UrlFinding::new(LeadField::Phone, phone));
            }
        }
        "http" | "https" => {
            let Some(host) = parsed.host_str().map(str::to_lowercase) else {
                return findings;
            };
            if host_matches(&host, "wa.me") {
                let number = parsed.path().trim_matches('/');
                if let Some(phone) = normalize_phone(number) {
                    findings.push(UrlFinding::new(LeadField::Phone, phone));
                }
            } else if MESSAGING_HOSTS.iter().any(|h| host_matches(&host, h)) {
                if let Some(phone) = query_phone(&parsed) {
                    findings.push(UrlFinding::new(LeadField::Phone, phone));
                }
            } else if host_matches(&host, "instagram.com")
                && let Some(handle) = instagram_handle(&parsed)
            {
                findings.push(UrlFinding::new(LeadField::Handle, handle));
            }
        }
        _ => {}
    }
    findings
}

/// True if the URL never needs navigation: non-web schemes and messaging
/// deep-links.
pub fn is_non_web(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url.trim()) else {
        return false;
    };
    if NON_WEB_SCHEMES.contains(&parsed.scheme()) {
        return true;
    }
    parsed
        .host_str()
        .is_some_and(|h| MESSAGING_HOSTS.iter().any(|m| host_matches(&h.to_lowercase(), m)))
}

/// True if the link should never be followed. Bio aggregators are exempt.
pub fn is_blocked(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url.trim()) else {
        return true;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return true;
    }
    let Some(host) = parsed.host_str().map(str::to_lowercase) else {
        return true;
    };
    if is_bio_aggregator_host(&host) {
        return false;
    }
    if BLOCKED_DOMAINS.iter().any(|d| host_matches(&host, d)) {
        return true;
    }
    let path = parsed.path().to_lowercase();
    let blocked_segment = path
        .split('/')
        .any(|segment| BLOCKED_PATH_SEGMENTS.iter().any(|b| segment_matches(segment, b)));
    blocked_segment || BLOCKED_EXTENSIONS.iter().any(|e| path.ends_with(e))
}

fn segment_matches(segment: &str, blocked: &str) -> bool {
    segment == blocked
        || segment
            .strip_prefix(blocked)
            .is_some_and(|rest| rest.starts_with(['-', '_', '.']))
}

pub fn is_bio_aggregator_host(host: &str) -> bool {
    BIO_AGGREGATORS.iter().any(|d| host_matches(host, d))
}

pub fn is_rich_profile_host(host: &str) -> bool {
    RICH_PROFILE_HOSTS.iter().any(|d| host_matches(host, d))
}

pub fn is_social_host(host: &str) -> bool {
    SOCIAL_HOSTS.iter().any(|d| host_matches(host, d))
}

/// True if the path carries any of the hint fragments.
pub fn path_has_hint(url: &str, hints: &[&str]) -> bool {
    Url::parse(url)
        .map(|u| {
            let path = u.path().to_lowercase();
            hints.iter().any(|h| path.contains(h))
        })
        .unwrap_or(false)
}

fn instagram_handle(url: &Url) -> Option<String> {
    let first = url.path_segments()?.find(|s| !s.is_empty())?;
    let handle = first.trim_start_matches('@').to_lowercase();
    if INSTAGRAM_RESERVED.contains(&handle.as_str()) {
        return None;
    }
    let valid = !handle.is_empty()
        && handle.len() <= 30
        && handle
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_');
    valid.then(|| format!("@{}", handle))
}

fn query_phone(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == "phone")
        .and_then(|(_, v)| normalize_phone(&v))
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && let Some(b) = bytes
                .get(i + 1..i + 3)
                .and_then(|hex| std::str::from_utf8(hex).ok())
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
        {
            out.push(b);
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
