//! Heuristics over served and rendered marketplace HTML.

use std::collections::HashSet;

use itertools::Itertools;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::{
    types::{FaqEntry, ReviewSummary, StarBucket},
    utils::{collapse_whitespace, normalize_url, origin, path_segments},
};

const FAQ_QUESTION_TAGS: &[&str] = &["h3", "h4", "summary", "button", "dt"];
const FAQ_ANSWER_TAGS: &[&str] = &[
    "p", "div", "span", "li", "dd", "ul", "ol", "section", "article", "blockquote",
];
const FAQ_ANSWER_FALLBACK_MIN_LEN: usize = 24;
pub const FAQ_ENTRY_LIMIT: usize = 12;
const FEATURE_ITEM_LIMIT: usize = 12;
const FEATURE_SECTION_LIMIT: usize = 4;
const FAQ_SECTION_LIMIT: usize = 3;

lazy_static! {
    static ref TOTAL_REVIEWS: Regex = Regex::new(r"(?i)(\d[\d,]*)\s+total reviews?").unwrap();
    static ref OUT_OF: Regex =
        Regex::new(r"(?i)(\d[\d,]*(?:\.\d+)?)\s+out of\s+(\d[\d,]*(?:\.\d+)?)").unwrap();
    static ref STAR_LABEL: Regex = Regex::new(r"(?i)^([1-5])\s+star").unwrap();
    static ref WIDTH: Regex = Regex::new(r"width:\s*([0-9]+(?:\.[0-9]+)?)%").unwrap();
    static ref NUMBER: Regex = Regex::new(r"(\d[\d,]*(?:\.\d+)?)").unwrap();
}

/// Heading-delimited list block, e.g. everything under `<h2>Features</h2>`.
#[derive(Debug, Clone, PartialEq)]
pub struct ListSection {
    pub heading: String,
    pub items: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaqSection {
    pub heading: String,
    pub entries: Vec<FaqEntry>,
}

/// Parsed page plus the selectors the heuristics share.
pub struct Page {
    doc: Html,
}

fn selector(css: &str) -> Selector {
    // selectors are literals in this module
    Selector::parse(css).unwrap_or_else(|_| panic!("invalid selector {}", css))
}

lazy_static! {
    static ref TITLE: Selector = selector("title");
    static ref META: Selector = selector("meta[content]");
    static ref SCRIPT: Selector = selector("script");
    static ref H2: Selector = selector("h2");
    static ref ANCHOR: Selector = selector("a[href]");
    static ref RADIO: Selector = selector("div[role]");
}

pub fn element_text(el: &ElementRef) -> String {
    collapse_whitespace(&el.text().collect::<Vec<_>>().join(" "))
}

impl Page {
    pub fn parse(html: &str) -> Self {
        Page {
            doc: Html::parse_document(html),
        }
    }

    pub fn title(&self) -> Option<String> {
        self.doc
            .select(&TITLE)
            .map(|t| element_text(&t))
            .find(|t| !t.is_empty())
    }

    /// Looks up `<meta name=..>` or `<meta property=..>` content.
    pub fn meta(&self, key: &str) -> Option<String> {
        self.doc.select(&META).find_map(|m| {
            let el = m.value();
            let matches = ["name", "property"]
                .iter()
                .filter_map(|a| el.attr(a))
                .any(|v| v.eq_ignore_ascii_case(key));
            if !matches {
                return None;
            }
            el.attr("content")
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
        })
    }

    pub fn page_meta(&self) -> crate::types::PageMeta {
        crate::types::PageMeta {
            title: self.title(),
            description: self.meta("description"),
            og_title: self.meta("og:title"),
            og_description: self.meta("og:description"),
            og_url: self.meta("og:url"),
        }
    }

    fn script_bodies<'a>(&'a self, pred: impl Fn(&ElementRef) -> bool + 'a) -> Vec<String> {
        self.doc
            .select(&SCRIPT)
            .filter(|s| pred(s))
            .map(|s| s.text().collect::<String>().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Raw bodies of every `application/ld+json` script.
    pub fn json_ld_blocks(&self) -> Vec<String> {
        self.script_bodies(|s| {
            s.value()
                .attr("type")
                .map_or(false, |t| t.trim().eq_ignore_ascii_case("application/ld+json"))
        })
    }

    /// Body of the framework's `__NEXT_DATA__` script.
    pub fn next_data(&self) -> Option<String> {
        self.script_bodies(|s| {
            s.value()
                .attr("id")
                .map_or(false, |id| id.eq_ignore_ascii_case("__next_data__"))
        })
        .into_iter()
        .next()
    }

    /// Inline scripts, where the streamed flight chunks live.
    pub fn inline_scripts(&self) -> Vec<String> {
        self.script_bodies(|s| s.value().attr("src").is_none())
    }

    /// Elements after `heading` in document order, up to the next h1/h2.
    fn section_after<'a>(&'a self, heading: &ElementRef<'a>) -> Vec<ElementRef<'a>> {
        let inside_heading = heading
            .descendants()
            .map(|n| n.id())
            .collect::<HashSet<_>>();
        self.doc
            .root_element()
            .descendants()
            .filter_map(ElementRef::wrap)
            .skip_while(|el| el.id() != heading.id())
            .skip(1)
            .filter(|el| !inside_heading.contains(&el.id()))
            .take_while(|el| !matches!(el.value().name(), "h1" | "h2"))
            .collect()
    }

    fn headings_matching<'a>(&'a self, needles: &'a [&'a str]) -> impl Iterator<Item = (ElementRef<'a>, String)> + 'a {
        self.doc.select(&H2).filter_map(move |h| {
            let text = element_text(&h);
            let lower = text.to_lowercase();
            if !text.is_empty() && needles.iter().any(|n| lower.contains(n)) {
                Some((h, text))
            } else {
                None
            }
        })
    }

    /// List items under each "Features" `<h2>`.
    pub fn feature_sections(&self) -> Vec<ListSection> {
        let mut seen = HashSet::new();
        self.headings_matching(&["feature"])
            .filter_map(|(h, heading)| {
                let items = self
                    .section_after(&h)
                    .iter()
                    .filter(|el| el.value().name() == "li")
                    .map(element_text)
                    .filter(|t| !t.is_empty())
                    .unique()
                    .take(FEATURE_ITEM_LIMIT)
                    .collect::<Vec<_>>();
                if items.is_empty() || !seen.insert(items.join("|")) {
                    return None;
                }
                Some(ListSection { heading, items })
            })
            .take(FEATURE_SECTION_LIMIT)
            .collect()
    }

    /// Question/answer pairs under each "FAQs" `<h2>`. Sections without
    /// question elements fall back to their list items as questions.
    pub fn faq_sections(&self) -> Vec<FaqSection> {
        let mut seen = HashSet::new();
        self.headings_matching(&["faq", "frequently asked"])
            .filter_map(|(h, heading)| {
                let section = self.section_after(&h);
                let mut entries = faq_entries(&section);
                if entries.is_empty() {
                    entries = section
                        .iter()
                        .filter(|el| el.value().name() == "li")
                        .map(element_text)
                        .filter(|t| !t.is_empty())
                        .unique()
                        .take(FAQ_ENTRY_LIMIT)
                        .map(|question| FaqEntry {
                            question,
                            answer: None,
                        })
                        .collect();
                }
                let fingerprint = entries
                    .iter()
                    .map(|e| format!("{}::{}", e.question, e.answer.as_deref().unwrap_or("")))
                    .join("|");
                if entries.is_empty() || !seen.insert(fingerprint) {
                    return None;
                }
                Some(FaqSection { heading, entries })
            })
            .take(FAQ_SECTION_LIMIT)
            .collect()
    }

    /// Rating summary under a "Reviews" `<h2>`.
    pub fn reviews(&self) -> Option<ReviewSummary> {
        self.headings_matching(&["review"]).find_map(|(h, heading)| {
            let section = self.section_after(&h);
            let mut average_rating = None;
            let mut rating_scale = None;
            let mut total_reviews = None;

            for el in section
                .iter()
                .filter(|el| matches!(el.value().name(), "span" | "div" | "p"))
            {
                let text = element_text(el);
                if text.is_empty() {
                    continue;
                }
                let lower = text.to_lowercase();
                if total_reviews.is_none() && lower.contains("total review") {
                    total_reviews = TOTAL_REVIEWS
                        .captures(&text)
                        .and_then(|c| parse_number(&c[1]))
                        .or_else(|| {
                            NUMBER
                                .captures(&text)
                                .and_then(|c| parse_number(&c[1]))
                        })
                        .map(|n| n.round() as u64);
                }
                if average_rating.is_none() && lower.contains("out of") {
                    if let Some(c) = OUT_OF.captures(&text) {
                        if let (Some(avg), Some(scale)) = (parse_number(&c[1]), parse_number(&c[2])) {
                            average_rating = Some(avg);
                            rating_scale = Some(scale);
                        }
                    }
                }
            }

            let mut buckets: Vec<Option<f64>> = vec![None; 6];
            let mut seen_star = [false; 6];
            for span in section.iter().filter(|el| el.value().name() == "span") {
                let label = element_text(span);
                let stars = match STAR_LABEL
                    .captures(label.trim())
                    .and_then(|c| c[1].parse::<usize>().ok())
                {
                    Some(s) => s,
                    None => continue,
                };
                seen_star[stars] = true;
                buckets[stars] = star_percentage(span);
            }

            if total_reviews.is_none()
                && average_rating.is_none()
                && !seen_star.iter().any(|s| *s)
            {
                return None;
            }

            let distribution = (1..=5)
                .rev()
                .map(|stars| {
                    let percent = buckets[stars];
                    StarBucket {
                        stars: stars as u8,
                        percent,
                        count: match (percent, total_reviews) {
                            (Some(p), Some(total)) => Some((total as f64 * p / 100.0).round() as u64),
                            _ => None,
                        },
                    }
                })
                .collect();

            Some(ReviewSummary {
                heading,
                average_rating,
                rating_scale,
                total_reviews,
                distribution,
            })
        })
    }

    /// Text of rendered `div[role=radio]` plan pickers.
    pub fn pricing_options(&self) -> Vec<String> {
        self.doc
            .select(&RADIO)
            .filter(|d| {
                d.value()
                    .attr("role")
                    .map_or(false, |r| r.eq_ignore_ascii_case("radio"))
            })
            .map(|d| element_text(&d))
            .filter(|t| !t.is_empty())
            .unique()
            .collect()
    }

    /// Product links on a seller page: same host, `/<seller>/<product>` or
    /// `/marketplace/<seller>/<product>`, deduplicated in page order.
    pub fn seller_product_links(&self, page_url: &Url) -> Vec<String> {
        let segments = path_segments(page_url);
        let username = match segments.first() {
            Some(u) => u.to_lowercase(),
            None => return vec![],
        };
        let base = origin(page_url);
        let host = page_url.host_str().unwrap_or("").to_lowercase();

        self.doc
            .select(&ANCHOR)
            .filter_map(|a| a.value().attr("href"))
            .filter_map(|href| normalize_url(page_url, href))
            .filter(|u| u.host_str().map_or(false, |h| h.eq_ignore_ascii_case(&host)))
            .filter_map(|u| {
                let segs = path_segments(&u);
                match segs.as_slice() {
                    [m, seller, product, ..]
                        if m.eq_ignore_ascii_case("marketplace")
                            && seller.to_lowercase() == username =>
                    {
                        Some(format!("{}/{}/{}/{}", base, m, seller, product))
                    }
                    [seller, product, ..] if seller.to_lowercase() == username => {
                        Some(format!("{}/{}/{}", base, seller, product))
                    }
                    _ => None,
                }
            })
            .unique()
            .collect()
    }
}

fn is_innermost_answer(el: &ElementRef) -> bool {
    !el.descendants().skip(1).filter_map(ElementRef::wrap).any(|d| {
        let name = d.value().name();
        FAQ_QUESTION_TAGS.contains(&name) || FAQ_ANSWER_TAGS.contains(&name)
    })
}

fn faq_entries(section: &[ElementRef]) -> Vec<FaqEntry> {
    let question_pool = section
        .iter()
        .filter(|el| FAQ_QUESTION_TAGS.contains(&el.value().name()))
        .map(element_text)
        .filter(|t| !t.is_empty())
        .collect::<HashSet<_>>();

    let mut entries: Vec<FaqEntry> = vec![];
    let mut fingerprints = HashSet::new();
    let mut current: Option<(String, Vec<String>)> = None;

    let mut flush = |current: &mut Option<(String, Vec<String>)>, entries: &mut Vec<FaqEntry>| {
        if let Some((question, answers)) = current.take() {
            let answer = answers.join("\n\n").trim().to_string();
            if fingerprints.insert((question.clone(), answer.clone())) {
                entries.push(FaqEntry {
                    question,
                    answer: if answer.is_empty() { None } else { Some(answer) },
                });
            }
        }
    };

    for el in section {
        if entries.len() >= FAQ_ENTRY_LIMIT {
            break;
        }
        let name = el.value().name();
        if FAQ_QUESTION_TAGS.contains(&name) {
            let text = element_text(el);
            if text.is_empty() {
                continue;
            }
            flush(&mut current, &mut entries);
            current = Some((text, vec![]));
            continue;
        }
        let (question, answers) = match current.as_mut() {
            Some(c) => c,
            None => continue,
        };
        // wrappers repeat their children's text
        if !is_innermost_answer(el) {
            continue;
        }
        let mut text = element_text(el);
        if text.is_empty() || text == *question || question_pool.contains(&text) {
            continue;
        }
        if !FAQ_ANSWER_TAGS.contains(&name) && text.len() < FAQ_ANSWER_FALLBACK_MIN_LEN {
            continue;
        }
        if text.to_lowercase().starts_with(&question.to_lowercase()) {
            let trimmed = text
                .get(question.len()..)
                .unwrap_or("")
                .trim_start_matches(|c: char| " :.-\n\t".contains(c))
                .to_string();
            if !trimmed.is_empty() {
                text = trimmed;
            }
        }
        if !answers.contains(&text) {
            answers.push(text);
        }
    }
    if entries.len() < FAQ_ENTRY_LIMIT {
        flush(&mut current, &mut entries);
    }
    entries
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.replace(',', "").parse::<f64>().ok()
}

fn width_percentage(el: &ElementRef) -> Option<f64> {
    el.descendants()
        .filter_map(ElementRef::wrap)
        .filter_map(|d| d.value().attr("style"))
        .find_map(|style| WIDTH.captures(style).and_then(|c| c[1].parse::<f64>().ok()))
}

// bar width of a "N star" label lives in a sibling element
fn star_percentage(span: &ElementRef) -> Option<f64> {
    let parent = span.parent().and_then(ElementRef::wrap)?;
    parent
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|sib| sib.id() != span.id())
        .find_map(|sib| width_percentage(&sib))
        .or_else(|| width_percentage(&parent))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reads_page_meta() {
        let page = Page::parse(
            r#"<html><head><title> Iris Out </title>
            <meta name="description" content="Edit faster">
            <meta property="og:title" content="Iris Out | Whop">
            <meta property="og:url" content="https://whop.com/iris-out-5c">
            </head><body></body></html>"#,
        );
        let meta = page.page_meta();
        assert_eq!(meta.title.as_deref(), Some("Iris Out"));
        assert_eq!(meta.description.as_deref(), Some("Edit faster"));
        assert_eq!(meta.og_title.as_deref(), Some("Iris Out | Whop"));
        assert_eq!(meta.og_url.as_deref(), Some("https://whop.com/iris-out-5c"));
        assert_eq!(meta.og_description, None);
    }

    #[test]
    fn finds_json_ld_and_next_data_scripts() {
        let page = Page::parse(
            r#"<html><head>
            <script type="application/ld+json">{"@type":"Product"}</script>
            <script type="APPLICATION/LD+JSON">{"@type":"Organization"}</script>
            <script id="__NEXT_DATA__" type="application/json">{"buildId":"b1"}</script>
            <script src="/app.js"></script>
            </head></html>"#,
        );
        assert_eq!(page.json_ld_blocks().len(), 2);
        assert_eq!(page.next_data().as_deref(), Some(r#"{"buildId":"b1"}"#));
        assert_eq!(page.inline_scripts().len(), 3);
    }

    #[test]
    fn feature_items_stop_at_next_heading() {
        let page = Page::parse(
            r#"<body>
            <h2>Features</h2>
            <ul><li>Daily signals</li><li> Private   chat </li><li>Daily signals</li></ul>
            <h3>Sub heading</h3><ul><li>Weekly calls</li></ul>
            <h2>Pricing</h2>
            <ul><li>Not a feature</li></ul>
            </body>"#,
        );
        let sections = page.feature_sections();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].heading, "Features");
        assert_eq!(
            sections[0].items,
            vec!["Daily signals", "Private chat", "Weekly calls"]
        );
    }

    #[test]
    fn faq_questions_pair_with_answers() {
        let page = Page::parse(
            r#"<body>
            <h2>FAQs</h2>
            <div><h3>How do I join?</h3><p>Buy a plan and open the app.</p></div>
            <div><h3>Refunds?</h3><div><p>Within 7 days.</p></div></div>
            <h2>Reviews</h2>
            </body>"#,
        );
        let sections = page.faq_sections();
        assert_eq!(sections.len(), 1);
        assert_eq!(
            sections[0].entries,
            vec![
                FaqEntry {
                    question: "How do I join?".into(),
                    answer: Some("Buy a plan and open the app.".into()),
                },
                FaqEntry {
                    question: "Refunds?".into(),
                    answer: Some("Within 7 days.".into()),
                },
            ]
        );
    }

    #[test]
    fn faq_list_items_become_questions() {
        let page = Page::parse(
            "<body><h2>faqs</h2><ul><li>Is there a trial?</li><li>Can I cancel?</li></ul></body>",
        );
        let entries = &page.faq_sections()[0].entries;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].question, "Is there a trial?");
        assert_eq!(entries[0].answer, None);
    }

    #[test]
    fn parses_review_summary() {
        let page = Page::parse(
            r#"<body><section><h2>Reviews</h2>
            <p>4.8 out of 5</p>
            <span>120 total reviews</span>
            <div><span>5 star</span><div><div style="width: 90%"></div></div></div>
            <div><span>1 star</span><div><div style="width:10%"></div></div></div>
            </section></body>"#,
        );
        let reviews = page.reviews().unwrap();
        assert_eq!(reviews.average_rating, Some(4.8));
        assert_eq!(reviews.rating_scale, Some(5.0));
        assert_eq!(reviews.total_reviews, Some(120));
        assert_eq!(reviews.distribution.len(), 5);
        assert_eq!(reviews.distribution[0].stars, 5);
        assert_eq!(reviews.distribution[0].percent, Some(90.0));
        assert_eq!(reviews.distribution[0].count, Some(108));
        assert_eq!(reviews.distribution[4].count, Some(12));
        assert_eq!(reviews.distribution[2].percent, None);
    }

    #[test]
    fn pricing_radios() {
        let page = Page::parse(
            r#"<div role="radio"> $49 / month </div><div role="radio">$399 / year</div><div role="group">x</div>"#,
        );
        assert_eq!(page.pricing_options(), vec!["$49 / month", "$399 / year"]);
    }

    #[test]
    fn seller_links_are_scoped_and_deduplicated() {
        let page = Page::parse(
            r#"<body>
            <a href="/acme/course">a</a>
            <a href="https://whop.com/acme/course#reviews">dup</a>
            <a href="/ACME/signals/extra">b</a>
            <a href="/marketplace/acme/bot">c</a>
            <a href="/other/thing">foreign seller</a>
            <a href="https://evil.com/acme/x">foreign host</a>
            <a href="/acme">self</a>
            </body>"#,
        );
        let base = Url::parse("https://whop.com/acme").unwrap();
        assert_eq!(
            page.seller_product_links(&base),
            vec![
                "https://whop.com/acme/course",
                "https://whop.com/ACME/signals",
                "https://whop.com/marketplace/acme/bot",
            ]
        );
    }
}
