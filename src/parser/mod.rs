pub mod fields;
pub mod phones;
pub mod rules;

use scraper::Html;
use thiserror::Error;

use crate::db::{ListingRow, RawCapture};
use crate::identity;
use fields::or_empty;
use rules::ExtractionRules;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("capture returned HTTP {0}")]
    Status(u16),
    #[error("capture payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Decode a stored capture blob and extract it.
pub fn process_payload(payload: &str, rules: &ExtractionRules) -> Result<ListingRow, ExtractError> {
    let capture: RawCapture = serde_json::from_str(payload)?;
    process_capture(&capture, rules)
}

/// Only successful fetches are extracted.
pub fn process_capture(capture: &RawCapture, rules: &ExtractionRules) -> Result<ListingRow, ExtractError> {
    if capture.http_status != 200 {
        return Err(ExtractError::Status(capture.http_status));
    }
    let doc = Html::parse_document(&capture.raw_body);
    Ok(extract(&doc, &capture.source_url, &capture.capture_timestamp, rules))
}

/// Build a listing from one document. A field that cannot be read is left
/// empty; the record itself always comes back.
pub fn extract(doc: &Html, url: &str, capture_timestamp: &str, rules: &ExtractionRules) -> ListingRow {
    let post_timestamp = or_empty("post_timestamp", fields::post_timestamp(doc, rules));
    let ad_id = or_empty("ad_id", fields::ad_id(url, rules));
    let locale = or_empty("locale", fields::locale(url, rules));
    let category = or_empty("category", fields::category(url, rules));
    let body_text = or_empty("body_text", fields::body_text(doc, rules));

    ListingRow {
        unique_key: identity::assign_key(&post_timestamp, &ad_id, &locale, &category),
        source_url: url.to_string(),
        post_timestamp: Some(post_timestamp).filter(|t| !t.is_empty()),
        title: or_empty("title", fields::title(doc, rules)),
        poster_age: or_empty("poster_age", fields::poster_age(doc, rules)),
        locations: or_empty("locations", fields::locations(doc, rules)),
        related_ad_links: or_empty("related_ad_links", fields::related_ad_links(doc, rules)),
        phones: phones::phone_field(&body_text, rules.no_match),
        body_text,
        capture_timestamp: capture_timestamp.to_string(),
        ad_id,
        locale,
        category,
        city: None,
        state: None,
        region: None,
        division: None,
    }
}
