use url::Url;

/// Query parameters dropped during normalization.
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "fbclid",
    "gclid",
    "igshid",
    "mc_eid",
];

/// Normalizes a URL for visited-set and dedup comparisons.
///
/// Web URLs are parsed and canonicalized: scheme-less input gets `https://`,
/// the host is lowercased with any `www.` prefix removed, the fragment and
/// tracking parameters are dropped, and a trailing slash on a non-root path
/// is removed. Non-web schemes (`mailto:`, `tel:`, ...) are only trimmed.
///
/// Returns `None` for input that cannot be parsed at all.
pub fn normalize_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let parsed = match Url::parse(raw) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(&format!("https://{raw}")).ok()?,
        Err(_) => return None,
    };

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Some(raw.to_string());
    }

    let mut url = parsed;
    let host = url.host_str()?.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    url.set_host(Some(&host)).ok()?;
    url.set_fragment(None);

    if url.query().is_some() {
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| !TRACKING_PARAMS.contains(&k.as_ref()))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(kept);
        }
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    let mut out = url.to_string();
    // `Url` always renders the root path as "/", drop it for bare hosts.
    if url.path() == "/" && url.query().is_none() && out.ends_with('/') {
        out.pop();
    }
    Some(out)
}

/// Lowercased host without a leading `www.`.
pub fn host_of(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    let host = url.host_str()?.to_lowercase();
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

/// Returns true if `host` is `domain` or one of its subdomains.
pub fn host_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_cosmetics() {
        assert_eq!(
            normalize_url("HTTPS://WWW.Biz.Example/Contact/#form").as_deref(),
            Some("https://biz.example/Contact")
        );
        assert_eq!(
            normalize_url("https://biz.example/").as_deref(),
            Some("https://biz.example")
        );
        assert_eq!(
            normalize_url("https://biz.example").as_deref(),
            Some("https://biz.example")
        );
    }

    #[test]
    fn test_normalize_drops_tracking_params_only() {
        assert_eq!(
            normalize_url("https://biz.example/p?utm_source=x&id=7&fbclid=abc").as_deref(),
            Some("https://biz.example/p?id=7")
        );
        assert_eq!(
            normalize_url("https://biz.example/p?utm_medium=social").as_deref(),
            Some("https://biz.example/p")
        );
    }

    #[test]
    fn test_normalize_adds_scheme_and_keeps_other_schemes() {
        assert_eq!(
            normalize_url("biz.example/about").as_deref(),
            Some("https://biz.example/about")
        );
        assert_eq!(
            normalize_url(" mailto:hello@biz.example ").as_deref(),
            Some("mailto:hello@biz.example")
        );
        assert_eq!(normalize_url("   "), None);
    }

    #[test]
    fn test_host_helpers() {
        assert_eq!(
            host_of("https://www.Instagram.com/biz").as_deref(),
            Some("instagram.com")
        );
        assert!(host_matches("m.facebook.com", "facebook.com"));
        assert!(host_matches("facebook.com", "facebook.com"));
        assert!(!host_matches("notfacebook.com", "facebook.com"));
        assert_eq!(host_of("not a url"), None);
    }
}
