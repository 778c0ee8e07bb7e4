use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("malformed: {0}")]
    Malformed(String),
    #[error("truncated value for field {0}")]
    Truncated(u32),
    #[error("unexpected end group for field {0}")]
    UnexpectedEndGroup(u32),
    #[error("unterminated group for field {0}")]
    UnterminatedGroup(u32),
    #[error("nesting too deep")]
    TooDeep,
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("invalid_target: {0}")]
    InvalidTarget(String),
    #[error("unsupported_scheme: {0}")]
    UnsupportedScheme(String),
    #[error("render: {0}")]
    Render(String),
    #[error("fetch: {0}")]
    Fetch(String),
    #[error("worker: {0}")]
    Worker(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Text,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// One WebSocket message observed on the feed page.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn binary(direction: Direction, payload: Vec<u8>) -> Self {
        Frame {
            kind: FrameKind::Binary,
            direction,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn text(direction: Direction, payload: impl Into<String>) -> Self {
        Frame {
            kind: FrameKind::Text,
            direction,
            timestamp: Utc::now(),
            payload: payload.into().into_bytes(),
        }
    }
}

/// Listing record pulled out of a binary frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedEvent {
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub slug: String,
    pub name: Option<String>,
    pub vendor: Option<String>,
    pub url: String,
    pub details: ListingDetails,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ListingDetails {
    pub product_id: Option<String>,
    pub vendor_handle: Option<String>,
    pub title: Option<String>,
    pub store_name: Option<String>,
}

impl DecodedEvent {
    pub fn is_priced(&self) -> bool {
        self.price.is_some()
    }

    pub fn summary_line(&self) -> String {
        let price = match (self.price, &self.currency) {
            (Some(p), Some(c)) => format!("{} {}", format_price(p), c.to_uppercase()),
            (Some(p), None) => format_price(p),
            (None, _) => "unpriced".to_string(),
        };
        let title = self
            .details
            .title
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or(&self.slug);
        format!(
            "[PULSE] {} | {} ({}) | {} | {}",
            price,
            title,
            self.slug,
            self.vendor.as_deref().unwrap_or("unknown vendor"),
            self.url
        )
    }
}

fn format_price(p: f64) -> String {
    if p.fract() == 0.0 {
        format!("{:.0}", p)
    } else {
        format!("{:.2}", p)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageKind {
    Product,
    Seller,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageMeta {
    pub title: Option<String>,
    pub description: Option<String>,
    pub og_title: Option<String>,
    pub og_description: Option<String>,
    pub og_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "@type")]
pub enum JsonLdRecord {
    Product(ProductSummary),
    Organization(OrganizationSummary),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductSummary {
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<Value>,
    pub brand: Option<String>,
    pub seller: Option<String>,
    pub sku: Option<Value>,
    pub url: Option<String>,
    pub includes: Vec<PropertySummary>,
    pub offers: Vec<OfferSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OfferSummary {
    pub name: Option<String>,
    pub price: Option<Value>,
    pub currency: Option<String>,
    pub availability: Option<String>,
    pub url: Option<String>,
    pub billing_interval: Option<Value>,
    pub billing_duration: Option<Value>,
    pub price_valid_until: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertySummary {
    pub name: Option<Value>,
    pub value: Option<Value>,
    pub description: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrganizationSummary {
    pub name: Option<String>,
    pub url: Option<String>,
    #[serde(rename = "sameAs")]
    pub same_as: Vec<String>,
    #[serde(rename = "contactPoint")]
    pub contact_point: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentSource {
    Payload,
    Html,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub source: ContentSource,
    pub hero: Option<Hero>,
    pub feature_sections: Vec<FeatureSection>,
    pub features: Vec<String>,
    pub faqs: Vec<FaqEntry>,
    pub descriptions: Vec<TextChunk>,
}

impl Default for Content {
    fn default() -> Self {
        Content {
            source: ContentSource::None,
            hero: None,
            feature_sections: vec![],
            features: vec![],
            faqs: vec![],
            descriptions: vec![],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hero {
    pub title: String,
    pub subtitle: Option<String>,
    pub badge: Option<String>,
    pub rating: Option<String>,
    pub cta: Option<Cta>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cta {
    pub text: Option<String>,
    pub href: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSection {
    pub heading: String,
    pub items: Vec<FeatureItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureItem {
    pub title: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextChunk {
    pub source: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaqEntry {
    pub question: String,
    pub answer: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewSummary {
    pub heading: String,
    pub average_rating: Option<f64>,
    pub rating_scale: Option<f64>,
    pub total_reviews: Option<u64>,
    pub distribution: Vec<StarBucket>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StarBucket {
    pub stars: u8,
    pub percent: Option<f64>,
    pub count: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SellerProfile {
    pub username: String,
    pub product_count: usize,
    pub product_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedProduct {
    pub url: String,
    pub error: String,
}

/// Structured extraction result for one marketplace page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingSnapshot {
    pub requested_url: String,
    pub final_url: String,
    pub status: Option<u16>,
    pub kind: PageKind,
    pub needs_review: bool,
    pub meta: PageMeta,
    pub json_ld: Vec<JsonLdRecord>,
    pub content: Content,
    pub reviews: Option<ReviewSummary>,
    pub pricing: Vec<String>,
    pub fetch_errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<SellerProfile>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub products: Vec<ListingSnapshot>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub failed_products: Vec<FailedProduct>,
}

impl ListingSnapshot {
    pub fn primary_product(&self) -> Option<&ProductSummary> {
        self.json_ld.iter().find_map(|r| match r {
            JsonLdRecord::Product(p) => Some(p),
            _ => None,
        })
    }

    /// Reduced document for `--features-only`: product identity, features,
    /// FAQs and pricing.
    pub fn features_only(&self) -> Value {
        let product = self.primary_product();
        serde_json::json!({
            "final_url": self.final_url,
            "name": product.and_then(|p| p.name.clone()),
            "description": product.and_then(|p| p.description.clone()),
            "brand": product.and_then(|p| p.brand.clone()),
            "sku": product.and_then(|p| p.sku.clone()),
            "features": self.content.features,
            "faqs": self.content.faqs,
            "pricing": self.pricing,
        })
    }
}
