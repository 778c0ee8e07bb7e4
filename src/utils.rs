use std::time::Duration;

use rand::Rng;
use url::Url;

use crate::types::ExtractError;

pub const DEFAULT_MARKETPLACE_URL: &str = "https://whop.com";
pub const DEFAULT_FEED_URL: &str = "https://whop.com/pulse/";
pub const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 13_5) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36";
pub const ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
pub const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// Top level routes that are never seller profiles.
pub const RESERVED_ROUTES: &[&str] = &[
    "marketplace",
    "discover",
    "pulse",
    "checkout",
    "login",
    "signup",
    "hub",
    "dashboard",
    "orgs",
    "apps",
    "blog",
    "_next",
];

lazy_static! {
    pub static ref MARKETPLACE_URL: String = {
        dotenvy::dotenv().ok();
        std::env::var("PULSE_MARKETPLACE_URL")
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|_| DEFAULT_MARKETPLACE_URL.into())
    };
    pub static ref FEED_URL: String = {
        dotenvy::dotenv().ok();
        std::env::var("PULSE_FEED_URL").unwrap_or_else(|_| DEFAULT_FEED_URL.into())
    };
    pub static ref HEADLESS: bool = env_flag("PULSE_HEADLESS", false);
    pub static ref SHOW_RAW: bool = env_flag("PULSE_SHOW_RAW", false);
    pub static ref IN_DOCKER: bool = std::env::var("IN_DOCKER").is_ok();
}

/// Reads a boolean flag from the environment, unknown words keep the default.
pub fn env_flag(name: &str, default: bool) -> bool {
    dotenvy::dotenv().ok();
    match std::env::var(name) {
        Ok(raw) => parse_flag(&raw).unwrap_or(default),
        Err(_) => default,
    }
}

pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "f" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

pub fn canonical_listing_url(base: &str, slug: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        slug.trim_start_matches('/')
    )
}

/// Resolves a URL, `whop.com/<path>`, `/<path>` or bare slug against the
/// marketplace base.
pub fn normalize_target(base: &str, target: &str) -> Result<Url, ExtractError> {
    let candidate = target.trim();
    if candidate.is_empty() {
        return Err(ExtractError::InvalidTarget(
            "target URL or slug cannot be empty".into(),
        ));
    }
    let candidate = if candidate.contains("://") {
        candidate.to_string()
    } else {
        let mut path = candidate.trim_start_matches('/');
        let host = Url::parse(base)
            .ok()
            .and_then(|u| u.host_str().map(|h| format!("{}/", h)));
        if let Some(host) = host {
            if path
                .get(..host.len())
                .map_or(false, |p| p.eq_ignore_ascii_case(&host))
            {
                path = &path[host.len()..];
            }
        }
        canonical_listing_url(base, path)
    };
    let url = Url::parse(&candidate)
        .map_err(|e| ExtractError::InvalidTarget(format!("{}: {}", candidate, e)))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ExtractError::UnsupportedScheme(candidate));
    }
    Ok(url)
}

pub fn path_segments(url: &Url) -> Vec<String> {
    url.path()
        .split('/')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

pub fn origin(url: &Url) -> String {
    match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), url.host_str().unwrap_or(""), port),
        None => format!("{}://{}", url.scheme(), url.host_str().unwrap_or("")),
    }
}

/// Single path segment outside the reserved routes.
pub fn is_seller_candidate(url: &Url) -> bool {
    let segments = path_segments(url);
    segments.len() == 1 && !RESERVED_ROUTES.contains(&segments[0].to_lowercase().as_str())
}

/// `<origin>/_next/data/<build_id>/<path or index>.json`, query string kept.
pub fn next_data_url(final_url: &Url, build_id: &str) -> Option<Url> {
    if final_url.host_str().is_none() {
        return None;
    }
    let path = final_url.path().trim_matches('/');
    let suffix = if path.is_empty() { "index" } else { path };
    let mut url = Url::parse(&format!(
        "{}/_next/data/{}/{}.json",
        origin(final_url),
        build_id,
        suffix
    ))
    .ok()?;
    url.set_query(final_url.query());
    Some(url)
}

/// Resolves `href` against `base`, dropping fragments.
pub fn normalize_url(base: &Url, href: &str) -> Option<Url> {
    let mut url = base.join(href).ok()?;
    url.set_fragment(None);
    Some(url)
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn jitter(min_secs: u64, max_secs: u64) -> Duration {
    if max_secs <= min_secs {
        return Duration::from_secs(min_secs);
    }
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(min_secs * 1000..max_secs * 1000))
}
