use scraper::Html;

use crate::parser::fields::{self, or_empty};
use crate::parser::rules::ExtractionRules;

/// Stable key for one physical ad: `post_timestamp-ad_id-locale-category`.
pub fn assign_key(post_timestamp: &str, ad_id: &str, locale: &str, category: &str) -> String {
    format!("{}-{}-{}-{}", post_timestamp, ad_id, locale, category)
}

/// Key a fetched document. The crawler and the loader both go through here,
/// so the raw and clean stores agree on identity.
pub fn key_for_document(doc: &Html, url: &str, rules: &ExtractionRules) -> String {
    assign_key(
        &or_empty("post_timestamp", fields::post_timestamp(doc, rules)),
        &or_empty("ad_id", fields::ad_id(url, rules)),
        &or_empty("locale", fields::locale(url, rules)),
        &or_empty("category", fields::category(url, rules)),
    )
}
