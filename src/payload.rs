//! Framework data payload (`/_next/data/..json`) and streamed flight chunks.
//!
//! Neither has a stable schema, so everything here walks the JSON looking for
//! keys that usually carry hero copy, CTAs, feature lists and FAQ entries.

use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::{
    jsonld::iter_nodes,
    types::{Cta, FaqEntry, FeatureItem, FeatureSection, Hero, TextChunk},
    utils::collapse_whitespace,
};

const TITLE_KEYS: &[&str] = &["title", "heading", "headline", "name", "label"];
const DESC_KEYS: &[&str] = &[
    "subtitle", "description", "body", "summary", "text", "copy", "details", "tagline",
];
const CTA_KEYS: &[&str] = &[
    "cta", "ctaText", "ctaLabel", "ctaButton", "primaryCta", "ctaPrimary", "action",
];
const FEATURE_KEYS: &[&str] = &[
    "features",
    "featurelist",
    "items",
    "perks",
    "benefits",
    "bullets",
    "sellingpoints",
    "highlights",
    "points",
    "listitems",
];
const CHUNK_KEYS: &[&str] = &[
    "description", "body", "summary", "text", "copy", "details", "content",
];
const CHUNK_MIN_LEN: usize = 40;
const CHUNK_LIMIT: usize = 8;
const SECTION_ITEM_LIMIT: usize = 10;
const SECTION_LIMIT: usize = 6;
const FLIGHT_NEEDLE: &str = "self.__next_f.push([";

/// Everything the payload yielded, empty when it had nothing recognisable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayloadSummary {
    pub hero: Option<Hero>,
    pub feature_sections: Vec<FeatureSection>,
    pub descriptions: Vec<TextChunk>,
    pub faqs: Vec<FaqEntry>,
}

impl PayloadSummary {
    /// The payload has the shape the content block is built from.
    pub fn has_content(&self) -> bool {
        self.hero.is_some() || !self.feature_sections.is_empty()
    }
}

pub fn summarize(payload: &Value) -> PayloadSummary {
    if !payload.is_object() && !payload.is_array() {
        return PayloadSummary::default();
    }
    let nodes = iter_nodes(payload);
    PayloadSummary {
        hero: nodes.iter().find_map(|n| hero(n)),
        feature_sections: feature_sections(&nodes),
        descriptions: text_chunks(&nodes),
        faqs: faq_entries_in(payload),
    }
}

/// Text view of a scalar or of a `{text|label|title|name|value}` object.
fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => ["text", "label", "title", "name", "value"]
            .iter()
            .filter_map(|k| map.get(*k).and_then(Value::as_str))
            .map(str::trim)
            .find(|s| !s.is_empty())
            .map(String::from),
        _ => None,
    }
}

fn first_text(node: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| node.get(*k).and_then(as_text))
}

fn cta(node: &Map<String, Value>) -> Option<Cta> {
    CTA_KEYS.iter().find_map(|k| match node.get(*k)? {
        Value::Object(map) => {
            let text = as_text(&Value::Object(map.clone()));
            let href = ["href", "url", "link"]
                .iter()
                .find_map(|h| map.get(*h).and_then(Value::as_str))
                .map(String::from);
            if text.is_some() || href.is_some() {
                Some(Cta { text, href })
            } else {
                None
            }
        }
        Value::String(s) if !s.trim().is_empty() => Some(Cta {
            text: Some(s.trim().to_string()),
            href: None,
        }),
        _ => None,
    })
}

fn hero(node: &Map<String, Value>) -> Option<Hero> {
    let title = first_text(node, TITLE_KEYS)?;
    let subtitle = first_text(node, DESC_KEYS);
    let cta = cta(node);
    if subtitle.is_none() && cta.is_none() {
        return None;
    }
    let badge = node
        .get("badge")
        .or_else(|| node.get("tag"))
        .and_then(as_text);
    let rating = ["rating", "ratingValue", "ratingText"]
        .iter()
        .find_map(|k| node.get(*k).filter(|v| !v.is_null()))
        .and_then(as_text);
    Some(Hero {
        title,
        subtitle,
        badge,
        rating,
        cta,
    })
}

fn feature_sections(nodes: &[&Map<String, Value>]) -> Vec<FeatureSection> {
    let mut sections = vec![];
    let mut seen = HashSet::new();
    for node in nodes {
        for (key, value) in node.iter() {
            if !FEATURE_KEYS.contains(&key.to_lowercase().as_str()) {
                continue;
            }
            let entries = match value {
                Value::Array(entries) => entries,
                _ => continue,
            };
            let items = entries
                .iter()
                .filter_map(|entry| match entry {
                    Value::Object(map) => {
                        let title = first_text(map, TITLE_KEYS);
                        let description = first_text(map, DESC_KEYS);
                        if title.is_none() && description.is_none() {
                            None
                        } else {
                            Some(FeatureItem { title, description })
                        }
                    }
                    Value::String(s) if !s.trim().is_empty() => Some(FeatureItem {
                        title: Some(s.trim().to_string()),
                        description: None,
                    }),
                    _ => None,
                })
                .collect::<Vec<_>>();
            if items.is_empty() {
                continue;
            }
            let heading = first_text(node, TITLE_KEYS).unwrap_or_else(|| key.clone());
            let fingerprint = format!("{}::{:?}", heading, items);
            if !seen.insert(fingerprint) {
                continue;
            }
            sections.push(FeatureSection {
                heading,
                items: items.into_iter().take(SECTION_ITEM_LIMIT).collect(),
            });
        }
    }
    sections.truncate(SECTION_LIMIT);
    sections
}

fn text_chunks(nodes: &[&Map<String, Value>]) -> Vec<TextChunk> {
    let mut chunks = vec![];
    let mut seen = HashSet::new();
    for node in nodes {
        for key in CHUNK_KEYS {
            let text = match node.get(*key).and_then(Value::as_str) {
                Some(t) => collapse_whitespace(t),
                None => continue,
            };
            if text.len() < CHUNK_MIN_LEN || !seen.insert(text.clone()) {
                continue;
            }
            chunks.push(TextChunk {
                source: key.to_string(),
                text,
            });
            if chunks.len() >= CHUNK_LIMIT {
                return chunks;
            }
        }
    }
    chunks
}

fn normalize_question(q: &str) -> String {
    collapse_whitespace(q).to_lowercase()
}

/// `{question, answer}` objects inside any `faq`/`faqs` array.
pub fn faq_entries_in(value: &Value) -> Vec<FaqEntry> {
    let mut entries = vec![];
    let mut seen = HashSet::new();
    for node in iter_nodes(value) {
        for (key, v) in node.iter() {
            if !matches!(key.to_lowercase().as_str(), "faq" | "faqs") {
                continue;
            }
            if let Value::Array(items) = v {
                collect_faqs(items, &mut seen, &mut entries);
            }
        }
    }
    entries
}

fn collect_faqs(items: &[Value], seen: &mut HashSet<String>, out: &mut Vec<FaqEntry>) {
    for item in items.iter().filter_map(Value::as_object) {
        let (question, answer) = match (
            item.get("question").and_then(Value::as_str),
            item.get("answer").and_then(Value::as_str),
        ) {
            (Some(q), Some(a)) => (q, a),
            _ => continue,
        };
        let key = normalize_question(question);
        if key.is_empty() || !seen.insert(key) {
            continue;
        }
        out.push(FaqEntry {
            question: question.trim().to_string(),
            answer: Some(answer.trim().to_string()).filter(|a| !a.is_empty()),
        });
    }
}

// index of the closing quote of the JS string literal opening at `start`
fn skip_js_string(source: &[u8], start: usize) -> usize {
    let mut i = start + 1;
    while i < source.len() {
        match source[i] {
            b'\\' => i += 2,
            b'"' => return i,
            _ => i += 1,
        }
    }
    source.len().saturating_sub(1)
}

/// String literals pushed through `self.__next_f.push([...])`.
pub fn flight_payloads(html: &str) -> Vec<String> {
    let bytes = html.as_bytes();
    let mut out = vec![];
    let mut pos = 0;
    while let Some(found) = html[pos..].find(FLIGHT_NEEDLE) {
        let start = pos + found;
        let mut i = start + FLIGHT_NEEDLE.len();
        let mut depth = 1;
        while i < bytes.len() && depth > 0 {
            match bytes[i] {
                b'"' => i = skip_js_string(bytes, i),
                b'[' => depth += 1,
                b']' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
            i += 1;
        }
        if depth != 0 {
            break;
        }
        let mut j = start + FLIGHT_NEEDLE.len() - 1;
        while j <= i {
            if bytes[j] == b'"' {
                let end = skip_js_string(bytes, j);
                if let Some(literal) = html.get(j..=end) {
                    if let Ok(Value::String(decoded)) = serde_json::from_str::<Value>(literal) {
                        out.push(decoded);
                    }
                }
                j = end;
            }
            j += 1;
        }
        pos = i + 1;
        if pos >= html.len() {
            break;
        }
    }
    out
}

/// Balanced JSON arrays that follow each occurrence of `key` in `payload`.
fn arrays_after_key<'a>(payload: &'a str, key: &str) -> Vec<&'a str> {
    let bytes = payload.as_bytes();
    let mut out = vec![];
    let mut idx = 0;
    while let Some(found) = payload[idx..].find(key) {
        let after = idx + found + key.len();
        let start = match payload[after..].find('[') {
            Some(s) => after + s,
            None => break,
        };
        let mut depth = 0;
        let mut in_string = false;
        let mut escaped = false;
        let mut i = start;
        while i < bytes.len() {
            let c = bytes[i];
            if in_string {
                if escaped {
                    escaped = false;
                } else if c == b'\\' {
                    escaped = true;
                } else if c == b'"' {
                    in_string = false;
                }
            } else if c == b'"' {
                in_string = true;
            } else if c == b'[' {
                depth += 1;
            } else if c == b']' {
                depth -= 1;
                if depth == 0 {
                    if let Some(slice) = payload.get(start..=i) {
                        out.push(slice);
                    }
                    break;
                }
            }
            i += 1;
        }
        idx = i + 1;
        if idx >= payload.len() {
            break;
        }
    }
    out
}

/// FAQ entries recovered from streamed flight chunks across inline scripts.
pub fn flight_faq_entries(scripts: &[String]) -> Vec<FaqEntry> {
    let mut entries = vec![];
    let mut seen = HashSet::new();
    for script in scripts {
        for chunk in flight_payloads(script) {
            if !chunk.contains("\"faq\":") {
                continue;
            }
            for array in arrays_after_key(&chunk, "\"faq\":") {
                if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(array) {
                    collect_faqs(&items, &mut seen, &mut entries);
                }
            }
        }
    }
    entries
}

/// Fills unanswered entries from `fallback`; with no entries at all the
/// fallback becomes the list.
pub fn merge_faqs(primary: Vec<FaqEntry>, fallback: &[FaqEntry], limit: usize) -> Vec<FaqEntry> {
    if primary.is_empty() {
        return fallback.iter().take(limit).cloned().collect();
    }
    primary
        .into_iter()
        .map(|mut entry| {
            if entry.answer.is_none() {
                let key = normalize_question(&entry.question);
                entry.answer = fallback
                    .iter()
                    .find(|f| normalize_question(&f.question) == key)
                    .and_then(|f| f.answer.clone());
            }
            entry
        })
        .collect()
}

/// Deduplicated, whitespace-normalised feature strings across sections.
pub fn flatten_features(sections: &[FeatureSection]) -> Vec<String> {
    let mut seen = HashSet::new();
    sections
        .iter()
        .flat_map(|s| s.items.iter())
        .filter_map(|item| item.title.as_ref().or(item.description.as_ref()))
        .map(|t| collapse_whitespace(t))
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn summarizes_hero_features_and_copy() {
        let payload = json!({
            "pageProps": {
                "hero": {
                    "title": "Iris Out",
                    "subtitle": "Cinematic transitions for editors",
                    "cta": {"label": "Join now", "href": "/checkout/iris"},
                    "rating": 4.9
                },
                "sections": [
                    {"heading": "What you get", "features": [
                        {"title": "50 presets"},
                        "Lifetime updates",
                        {"description": "Works in Premiere and Resolve"}
                    ]}
                ],
                "about": {"body": "A pack of transitions built by working editors over five years."}
            }
        });
        let s = summarize(&payload);
        let hero = s.hero.unwrap();
        assert_eq!(hero.title, "Iris Out");
        assert_eq!(hero.subtitle.as_deref(), Some("Cinematic transitions for editors"));
        assert_eq!(hero.rating.as_deref(), Some("4.9"));
        let cta = hero.cta.unwrap();
        assert_eq!(cta.text.as_deref(), Some("Join now"));
        assert_eq!(cta.href.as_deref(), Some("/checkout/iris"));

        assert_eq!(s.feature_sections.len(), 1);
        assert_eq!(s.feature_sections[0].heading, "What you get");
        assert_eq!(
            flatten_features(&s.feature_sections),
            vec!["50 presets", "Lifetime updates", "Works in Premiere and Resolve"]
        );
        assert!(s.descriptions.iter().any(|c| c.source == "body"));
    }

    #[test]
    fn scalars_have_no_content() {
        assert!(!summarize(&json!("nope")).has_content());
        assert!(!summarize(&json!({"unrelated": 1})).has_content());
    }

    #[test]
    fn recovers_faqs_from_flight_chunks() {
        let inner = r#"1:{"faq":[{"question":"Is there a trial?","answer":"Yes, 3 days."},{"question":"is there a  trial?","answer":"dup"}]}"#;
        let literal = serde_json::to_string(inner).unwrap();
        let script = format!("self.__next_f.push([1,{}])", literal);
        let entries = flight_faq_entries(&[script]);
        assert_eq!(
            entries,
            vec![FaqEntry {
                question: "Is there a trial?".into(),
                answer: Some("Yes, 3 days.".into()),
            }]
        );
    }

    #[test]
    fn flight_payloads_skip_non_string_elements() {
        let html = r#"<script>self.__next_f.push([1,"a[b]"])</script><script>self.__next_f.push([2,"c"])</script>"#;
        assert_eq!(flight_payloads(html), vec!["a[b]", "c"]);
    }

    #[test]
    fn merge_fills_missing_answers() {
        let dom = vec![FaqEntry {
            question: "Refunds?".into(),
            answer: None,
        }];
        let flight = vec![FaqEntry {
            question: "refunds?".into(),
            answer: Some("Within 7 days.".into()),
        }];
        let merged = merge_faqs(dom, &flight, 12);
        assert_eq!(merged[0].answer.as_deref(), Some("Within 7 days."));
        assert_eq!(merge_faqs(vec![], &flight, 12).len(), 1);
    }
}
