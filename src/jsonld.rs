use serde_json::Value;

use crate::types::{
    JsonLdRecord, OfferSummary, OrganizationSummary, ProductSummary, PropertySummary,
};

/// Parses every JSON-LD script body, skipping the ones that are not valid JSON.
pub fn parse_blocks(blocks: &[String]) -> Vec<JsonLdRecord> {
    let mut records = vec![];
    for (i, block) in blocks.iter().enumerate() {
        let parsed = match serde_json::from_str::<Value>(block) {
            Ok(v) => v,
            Err(e) => {
                debug!("skipping malformed JSON-LD block {}: {}", i, e);
                continue;
            }
        };
        for node in iter_nodes(&parsed) {
            if type_matches(node.get("@type"), "Product") {
                records.push(JsonLdRecord::Product(summarize_product(node)));
            } else if type_matches(node.get("@type"), "Organization") {
                records.push(JsonLdRecord::Organization(summarize_org(node)));
            }
        }
    }
    records
}

/// Pre-order walk over every JSON object in `value`.
pub fn iter_nodes(value: &Value) -> Vec<&serde_json::Map<String, Value>> {
    let mut out = vec![];
    let mut stack = vec![value];
    while let Some(current) = stack.pop() {
        match current {
            Value::Object(map) => {
                out.push(map);
                stack.extend(map.values().rev());
            }
            Value::Array(items) => stack.extend(items.iter().rev()),
            _ => {}
        }
    }
    out
}

fn type_matches(value: Option<&Value>, expected: &str) -> bool {
    match value {
        Some(Value::String(s)) => s.eq_ignore_ascii_case(expected),
        Some(Value::Array(items)) => items.iter().any(|i| type_matches(Some(i), expected)),
        _ => false,
    }
}

fn as_list(value: Option<&Value>) -> Vec<&Value> {
    match value {
        None | Some(Value::Null) => vec![],
        Some(Value::Array(items)) => items.iter().collect(),
        Some(v) => vec![v],
    }
}

fn string(node: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    node.get(key).and_then(Value::as_str).map(String::from)
}

fn non_null(node: &serde_json::Map<String, Value>, key: &str) -> Option<Value> {
    node.get(key).filter(|v| !v.is_null()).cloned()
}

// brand/seller come either as a string or as `{ "name": .. }`
fn name_of(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Object(map)) => map.get("name").and_then(Value::as_str).map(String::from),
        _ => None,
    }
}

fn summarize_offer(node: &serde_json::Map<String, Value>) -> OfferSummary {
    let price_spec = node.get("priceSpecification").and_then(Value::as_object);
    let pick = |keys: [&str; 2]| {
        price_spec.and_then(|s| keys.iter().find_map(|k| s.get(*k).filter(|v| !v.is_null())))
            .cloned()
    };
    OfferSummary {
        name: string(node, "name"),
        price: non_null(node, "price"),
        currency: string(node, "priceCurrency"),
        availability: string(node, "availability"),
        url: string(node, "url"),
        billing_interval: pick(["billingInterval", "billingPeriod"]),
        billing_duration: pick(["billingDuration", "billingFrequency"]),
        price_valid_until: string(node, "priceValidUntil"),
    }
}

fn summarize_product(node: &serde_json::Map<String, Value>) -> ProductSummary {
    let offers = node
        .get("offers")
        .map(|o| {
            iter_nodes(o)
                .into_iter()
                .filter(|n| type_matches(n.get("@type"), "Offer"))
                .map(summarize_offer)
                .collect()
        })
        .unwrap_or_default();
    let includes = as_list(node.get("additionalProperty"))
        .into_iter()
        .filter_map(Value::as_object)
        .map(|p| PropertySummary {
            name: non_null(p, "name"),
            value: non_null(p, "value"),
            description: non_null(p, "description"),
        })
        .collect();

    ProductSummary {
        name: string(node, "name"),
        description: string(node, "description"),
        category: non_null(node, "category"),
        brand: name_of(node.get("brand")),
        seller: name_of(node.get("seller")),
        sku: non_null(node, "sku"),
        url: string(node, "url"),
        includes,
        offers,
    }
}

fn summarize_org(node: &serde_json::Map<String, Value>) -> OrganizationSummary {
    OrganizationSummary {
        name: string(node, "name"),
        url: string(node, "url"),
        same_as: as_list(node.get("sameAs"))
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        contact_point: non_null(node, "contactPoint"),
    }
}
