//! Listing extraction: one marketplace URL in, one [`ListingSnapshot`] out.
//!
//! Each page is looked at three ways: rendered in Chrome (pricing widgets,
//! DOM headings, product anchors), fetched over plain HTTP (metadata and
//! JSON-LD as served), and through the framework's `_next/data` payload
//! (hero, feature sections, body copy). Seller pages fan out one level into
//! their product pages.

use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use itertools::Itertools;
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde_json::Value;
use url::Url;

use crate::{
    browser_controller::{BrowserController, RenderedPage},
    dispatcher::SnapshotFetcher,
    html::{Page, FAQ_ENTRY_LIMIT},
    jsonld,
    payload::{self, flatten_features, merge_faqs},
    types::{
        Content, ContentSource, ExtractError, FailedProduct, FaqEntry, FeatureItem,
        FeatureSection, ListingSnapshot, PageKind, SellerProfile,
    },
    utils::{
        is_seller_candidate, next_data_url, normalize_target, path_segments, ACCEPT,
        ACCEPT_LANGUAGE, MARKETPLACE_URL, USER_AGENT,
    },
};

#[derive(Builder, Debug, Clone)]
#[builder(setter(into))]
pub struct ExtractorOptions {
    #[builder(default = "MARKETPLACE_URL.to_string()")]
    pub base_url: String,
    #[builder(default = "30")]
    pub timeout_secs: u64,
    #[builder(default = "true")]
    pub headless: bool,
    /// Skip Chrome and treat the served HTML as the rendered page.
    #[builder(default = "true")]
    pub render: bool,
    #[builder(default = "8")]
    pub max_products: usize,
    #[builder(default = "3")]
    pub concurrent_products: usize,
    #[builder(default = "2")]
    pub min_settle_secs: u64,
    #[builder(default = "4")]
    pub max_settle_secs: u64,
}

impl ExtractorOptionsBuilder {
    pub fn default_builder() -> ExtractorOptionsBuilder {
        ExtractorOptionsBuilder::default()
    }
}

/// Plain HTTP response, whatever its status.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpPage {
    pub status: u16,
    pub final_url: String,
    pub body: String,
}

impl HttpPage {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Where pages come from: a browser render and a plain GET.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn render(&self, url: &str) -> Result<RenderedPage, ExtractError>;
    async fn fetch(&self, url: &str) -> anyhow::Result<HttpPage>;
}

/// Chrome for renders, reqwest for everything else.
pub struct LiveSource {
    client: reqwest::Client,
    headless: bool,
    timeout: Duration,
    settle: (u64, u64),
}

impl LiveSource {
    pub fn new(options: &ExtractorOptions) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static(ACCEPT));
        headers.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static(ACCEPT_LANGUAGE));
        let timeout = Duration::from_secs(options.timeout_secs);
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(LiveSource {
            client,
            headless: options.headless,
            timeout,
            settle: (options.min_settle_secs, options.max_settle_secs),
        })
    }
}

#[async_trait]
impl PageSource for LiveSource {
    async fn render(&self, url: &str) -> Result<RenderedPage, ExtractError> {
        let url = url.to_string();
        let (headless, timeout, settle) = (self.headless, self.timeout, self.settle);
        tokio::task::spawn_blocking(move || {
            let browser = BrowserController::new(headless, timeout)?;
            browser.render(&url, settle)
        })
        .await
        .map_err(|e| ExtractError::Worker(e.to_string()))?
        .map_err(|e| ExtractError::Render(format!("{:#}", e)))
    }

    async fn fetch(&self, url: &str) -> anyhow::Result<HttpPage> {
        let res = self.client.get(url).send().await?;
        let status = res.status().as_u16();
        let final_url = res.url().to_string();
        let body = res.text().await?;
        Ok(HttpPage {
            status,
            final_url,
            body,
        })
    }
}

// One page's worth of extraction, before any seller fan-out.
struct PageResult {
    snapshot: ListingSnapshot,
    product_links: Vec<String>,
}

pub struct ListingExtractor<S: PageSource> {
    source: S,
    options: ExtractorOptions,
}

impl ListingExtractor<LiveSource> {
    pub fn live(options: ExtractorOptions) -> anyhow::Result<Self> {
        let source = LiveSource::new(&options)?;
        Ok(ListingExtractor { source, options })
    }
}

impl<S: PageSource> ListingExtractor<S> {
    pub fn new(source: S, options: ExtractorOptions) -> Self {
        ListingExtractor { source, options }
    }

    pub fn options(&self) -> &ExtractorOptions {
        &self.options
    }

    /// Extracts `target` (URL, `whop.com/..`, `/path` or slug). Seller pages
    /// come back with their product pages nested, never deeper than one level.
    pub async fn snapshot(&self, target: &str) -> Result<ListingSnapshot, ExtractError> {
        let url = normalize_target(&self.options.base_url, target)?;
        let PageResult {
            mut snapshot,
            product_links,
        } = self.extract_page(&url).await?;

        if product_links.is_empty() {
            return Ok(snapshot);
        }
        if snapshot.primary_product().is_some() {
            warn!(
                "{} links to products but carries a Product record itself",
                snapshot.final_url
            );
            snapshot.needs_review = true;
        }

        let username = Url::parse(&snapshot.final_url)
            .ok()
            .and_then(|u| path_segments(&u).into_iter().next())
            .unwrap_or_default();
        let capped = product_links
            .iter()
            .take(self.options.max_products)
            .cloned()
            .collect::<Vec<_>>();
        info!(
            "{} is a seller page, fetching {} of {} products",
            snapshot.final_url,
            capped.len(),
            product_links.len()
        );

        let results = stream::iter(capped.iter().cloned().map(|link| self.product_snapshot(link)))
            .buffered(self.options.concurrent_products.max(1))
            .collect::<Vec<_>>()
            .await;

        for (link, res) in results {
            match res {
                Ok(product) => snapshot.products.push(product),
                Err(e) => {
                    warn!("product {} of seller {} failed: {}", link, username, e);
                    snapshot.failed_products.push(FailedProduct {
                        url: link,
                        error: e.to_string(),
                    });
                }
            }
        }
        snapshot.kind = PageKind::Seller;
        snapshot.profile = Some(SellerProfile {
            username,
            product_count: product_links.len(),
            product_urls: capped,
        });
        Ok(snapshot)
    }

    async fn product_snapshot(&self, link: String) -> (String, Result<ListingSnapshot, ExtractError>) {
        let res = match Url::parse(&link) {
            Ok(u) => self.extract_page(&u).await.map(|p| p.snapshot),
            Err(e) => Err(ExtractError::InvalidTarget(format!("{}: {}", link, e))),
        };
        (link, res)
    }

    async fn extract_page(&self, url: &Url) -> Result<PageResult, ExtractError> {
        let rendered = if self.options.render {
            Some(self.source.render(url.as_str()).await?)
        } else {
            None
        };

        let mut fetch_errors = vec![];
        let served = match self.source.fetch(url.as_str()).await {
            Ok(page) => Some(page),
            Err(e) => {
                warn!("could not fetch {}: {:#}", url, e);
                fetch_errors.push(format!("html: {:#}", e));
                None
            }
        };
        if let Some(page) = served.as_ref().filter(|p| !p.is_success()) {
            warn!("{} answered with status {}", page.final_url, page.status);
        }

        let rendered = match (rendered, &served) {
            (Some(r), _) => r,
            (None, Some(s)) => RenderedPage {
                final_url: s.final_url.clone(),
                html: s.body.clone(),
            },
            (None, None) => {
                return Err(ExtractError::Fetch(fetch_errors.join("; ")));
            }
        };
        let final_url = served
            .as_ref()
            .and_then(|s| Url::parse(&s.final_url).ok())
            .or_else(|| Url::parse(&rendered.final_url).ok())
            .unwrap_or_else(|| url.clone());
        // error and challenge pages only contribute their status
        let served_html = served
            .as_ref()
            .filter(|s| s.is_success())
            .map(|s| s.body.as_str())
            .unwrap_or("");

        let next_data = embedded_next_data(served_html)
            .or_else(|| embedded_next_data(&rendered.html));
        let payload = match &next_data {
            Some(data) => self.data_payload(data, &final_url, &mut fetch_errors).await,
            None => None,
        };

        let (snapshot, product_links) = assemble(
            url,
            &final_url,
            served.as_ref().map(|s| s.status),
            served_html,
            &rendered.html,
            payload.as_ref(),
            fetch_errors,
        );
        Ok(PageResult {
            snapshot,
            product_links,
        })
    }

    /// `pageProps` of the `_next/data` payload, falling back to the copy
    /// embedded in `__NEXT_DATA__`.
    async fn data_payload(
        &self,
        next_data: &Value,
        final_url: &Url,
        fetch_errors: &mut Vec<String>,
    ) -> Option<Value> {
        let embedded = next_data.pointer("/props/pageProps").cloned();
        let data_url = match next_data
            .get("buildId")
            .and_then(Value::as_str)
            .and_then(|id| next_data_url(final_url, id))
        {
            Some(u) => u,
            None => return embedded,
        };

        let fetched = match self.source.fetch(data_url.as_str()).await {
            Ok(page) if page.is_success() => serde_json::from_str::<Value>(&page.body)
                .map_err(|e| format!("next data: invalid json from {}: {}", data_url, e)),
            Ok(page) => Err(format!("next data: status {} from {}", page.status, data_url)),
            Err(e) => Err(format!("next data: {:#}", e)),
        };
        match fetched {
            Ok(mut value) => {
                let props = value.get_mut("pageProps").map(Value::take);
                Some(props.unwrap_or(value))
            }
            Err(e) => {
                debug!("{}", e);
                fetch_errors.push(e);
                embedded
            }
        }
    }
}

#[async_trait]
impl<S: PageSource + 'static> SnapshotFetcher for ListingExtractor<S> {
    async fn fetch(&self, url: &str) -> anyhow::Result<ListingSnapshot> {
        Ok(self.snapshot(url).await?)
    }
}

fn embedded_next_data(html: &str) -> Option<Value> {
    if html.is_empty() {
        return None;
    }
    let raw = Page::parse(html).next_data()?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(v) => Some(v),
        Err(e) => {
            debug!("__NEXT_DATA__ is not valid json: {}", e);
            None
        }
    }
}

// Parsed documents stay inside this function so the async callers never hold
// them across an await.
fn assemble(
    requested: &Url,
    final_url: &Url,
    status: Option<u16>,
    served_html: &str,
    rendered_html: &str,
    payload: Option<&Value>,
    fetch_errors: Vec<String>,
) -> (ListingSnapshot, Vec<String>) {
    let rendered = Page::parse(rendered_html);
    let served = if served_html.is_empty() {
        None
    } else {
        Some(Page::parse(served_html))
    };
    let primary = served.as_ref().unwrap_or(&rendered);

    let mut meta = primary.page_meta();
    if meta.title.is_none() {
        meta = rendered.page_meta();
    }
    let mut json_ld = jsonld::parse_blocks(&primary.json_ld_blocks());
    if json_ld.is_empty() && served.is_some() {
        json_ld = jsonld::parse_blocks(&rendered.json_ld_blocks());
    }

    let mut scripts = rendered.inline_scripts();
    if let Some(page) = &served {
        scripts.extend(page.inline_scripts());
    }

    let content = build_content(&rendered, payload, &scripts);
    let product_links = if is_seller_candidate(final_url) {
        rendered.seller_product_links(final_url)
    } else {
        vec![]
    };

    let snapshot = ListingSnapshot {
        requested_url: requested.to_string(),
        final_url: final_url.to_string(),
        status,
        kind: PageKind::Product,
        needs_review: false,
        meta,
        json_ld,
        content,
        reviews: rendered.reviews(),
        pricing: rendered.pricing_options(),
        fetch_errors,
        profile: None,
        products: vec![],
        failed_products: vec![],
    };
    (snapshot, product_links)
}

fn build_content(rendered: &Page, payload: Option<&Value>, scripts: &[String]) -> Content {
    let summary = payload.map(payload::summarize).unwrap_or_default();
    let html_sections = rendered.feature_sections();
    let mut content = Content::default();

    if summary.has_content() {
        content.source = ContentSource::Payload;
        content.hero = summary.hero;
        content.feature_sections = summary.feature_sections;
        content.descriptions = summary.descriptions;
        content.features = flatten_features(&content.feature_sections);
    } else if !html_sections.is_empty() {
        content.source = ContentSource::Html;
        content.feature_sections = html_sections
            .iter()
            .map(|s| FeatureSection {
                heading: s.heading.clone(),
                items: s
                    .items
                    .iter()
                    .map(|i| FeatureItem {
                        title: Some(i.clone()),
                        description: None,
                    })
                    .collect(),
            })
            .collect();
    }
    if content.features.is_empty() {
        content.features = html_sections
            .iter()
            .flat_map(|s| s.items.iter().cloned())
            .unique()
            .collect();
    }

    content.faqs = if !summary.faqs.is_empty() {
        summary.faqs.into_iter().take(FAQ_ENTRY_LIMIT).collect()
    } else {
        let dom = rendered
            .faq_sections()
            .into_iter()
            .flat_map(|s| s.entries)
            .collect::<Vec<FaqEntry>>();
        let flight = payload::flight_faq_entries(scripts);
        dedupe_faqs(merge_faqs(dom, &flight, FAQ_ENTRY_LIMIT))
    };
    if content.source == ContentSource::None && !content.faqs.is_empty() {
        content.source = ContentSource::Html;
    }
    content
}

fn dedupe_faqs(entries: Vec<FaqEntry>) -> Vec<FaqEntry> {
    let mut out: Vec<FaqEntry> = vec![];
    for entry in entries {
        let key = entry.question.to_lowercase();
        match out.iter().position(|e| e.question.to_lowercase() == key) {
            Some(i) if out[i].answer.is_none() => out[i].answer = entry.answer,
            Some(_) => {}
            None => out.push(entry),
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct StaticSource {
        rendered: HashMap<String, String>,
        served: HashMap<String, (u16, String)>,
        fetched: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PageSource for StaticSource {
        async fn render(&self, url: &str) -> Result<RenderedPage, ExtractError> {
            match self.rendered.get(url) {
                Some(html) => Ok(RenderedPage {
                    final_url: url.to_string(),
                    html: html.clone(),
                }),
                None => Err(ExtractError::Render(format!("net::ERR_NAME_NOT_RESOLVED {}", url))),
            }
        }

        async fn fetch(&self, url: &str) -> anyhow::Result<HttpPage> {
            self.fetched.lock().unwrap().push(url.to_string());
            match self.served.get(url) {
                Some((status, body)) => Ok(HttpPage {
                    status: *status,
                    final_url: url.to_string(),
                    body: body.clone(),
                }),
                None => anyhow::bail!("connection refused"),
            }
        }
    }

    fn options() -> ExtractorOptions {
        ExtractorOptionsBuilder::default_builder()
            .base_url("https://whop.com")
            .build()
            .unwrap()
    }

    const NEXT_DATA: &str = r#"<script id="__NEXT_DATA__" type="application/json">{"buildId":"abc123","props":{"pageProps":{}}}</script>"#;

    #[tokio::test]
    async fn payload_content_wins_over_headings() {
        let url = "https://whop.com/iris-out-5c";
        let html = format!(
            "<html><head><title>Iris Out</title>{}</head><body><h2>Features</h2><ul><li>From HTML</li></ul></body></html>",
            NEXT_DATA
        );
        let data = r#"{"pageProps":{"hero":{"title":"Iris Out","subtitle":"Transitions"},"perks":["From payload"]}}"#;
        let source = StaticSource {
            rendered: HashMap::from([(url.to_string(), html.clone())]),
            served: HashMap::from([
                (url.to_string(), (200, html)),
                (
                    "https://whop.com/_next/data/abc123/iris-out-5c.json".to_string(),
                    (200, data.to_string()),
                ),
            ]),
            ..Default::default()
        };
        let snapshot = ListingExtractor::new(source, options())
            .snapshot("iris-out-5c")
            .await
            .unwrap();
        assert_eq!(snapshot.content.source, ContentSource::Payload);
        assert_eq!(snapshot.content.hero.unwrap().title, "Iris Out");
        assert_eq!(snapshot.content.features, vec!["From payload"]);
        assert!(snapshot.fetch_errors.is_empty());
    }

    #[tokio::test]
    async fn failed_data_fetch_is_recorded_not_fatal() {
        let url = "https://whop.com/iris-out-5c";
        let html = format!("<html><head>{}</head><body></body></html>", NEXT_DATA);
        let source = StaticSource {
            rendered: HashMap::from([(url.to_string(), html.clone())]),
            served: HashMap::from([(url.to_string(), (200, html))]),
            ..Default::default()
        };
        let snapshot = ListingExtractor::new(source, options())
            .snapshot(url)
            .await
            .unwrap();
        assert_eq!(snapshot.status, Some(200));
        assert_eq!(snapshot.fetch_errors.len(), 1);
        assert!(snapshot.fetch_errors[0].starts_with("next data"));
    }

    #[tokio::test]
    async fn non_success_status_is_recorded() {
        let url = "https://whop.com/gone";
        let source = StaticSource {
            rendered: HashMap::from([(url.to_string(), "<html></html>".to_string())]),
            served: HashMap::from([(url.to_string(), (404, "not found".to_string()))]),
            ..Default::default()
        };
        let snapshot = ListingExtractor::new(source, options())
            .snapshot(url)
            .await
            .unwrap();
        assert_eq!(snapshot.status, Some(404));
        assert_eq!(snapshot.final_url, url);
    }

    #[tokio::test]
    async fn render_failure_is_fatal() {
        let source = StaticSource::default();
        let err = ListingExtractor::new(source, options())
            .snapshot("https://whop.com/iris-out-5c")
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Render(_)));
    }

    #[tokio::test]
    async fn bad_targets_are_rejected_before_fetching() {
        let extractor = ListingExtractor::new(StaticSource::default(), options());
        assert!(matches!(
            extractor.snapshot("  ").await,
            Err(ExtractError::InvalidTarget(_))
        ));
        assert!(matches!(
            extractor.snapshot("ftp://whop.com/x").await,
            Err(ExtractError::UnsupportedScheme(_))
        ));
        assert!(extractor.source.fetched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_render_uses_served_html() {
        let url = "https://whop.com/iris-out-5c";
        let source = StaticSource {
            served: HashMap::from([(
                url.to_string(),
                (200, "<h2>Features</h2><ul><li>Alerts</li></ul>".to_string()),
            )]),
            ..Default::default()
        };
        let opts = ExtractorOptionsBuilder::default_builder()
            .base_url("https://whop.com")
            .render(false)
            .build()
            .unwrap();
        let snapshot = ListingExtractor::new(source, opts).snapshot(url).await.unwrap();
        assert_eq!(snapshot.content.source, ContentSource::Html);
        assert_eq!(snapshot.content.features, vec!["Alerts"]);
    }

    #[test]
    fn flight_answers_fill_dom_questions() {
        let inner = r#"{"faq":[{"question":"Refunds?","answer":"Within 7 days."}]}"#;
        let script = format!(
            "self.__next_f.push([1,{}])",
            serde_json::to_string(inner).unwrap()
        );
        let html = format!(
            "<h2>FAQs</h2><ul><li>Refunds?</li></ul><script>{}</script>",
            script
        );
        let page = Page::parse(&html);
        let content = build_content(&page, None, &page.inline_scripts());
        assert_eq!(
            content.faqs,
            vec![FaqEntry {
                question: "Refunds?".into(),
                answer: Some("Within 7 days.".into()),
            }]
        );
    }
}
