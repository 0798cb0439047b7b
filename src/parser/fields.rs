//! Field getters for a single listing document.
//!
//! Each getter fails on its own; [`or_empty`] turns a failure into the
//! field's empty value so the rest of the record still loads.

use chrono::NaiveDateTime;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::debug;

use super::rules::ExtractionRules;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum FieldError {
    #[error("invalid selector `{0}`")]
    Selector(&'static str),
    #[error("no element matches `{0}`")]
    Missing(&'static str),
    #[error("cannot parse date {value:?}: {source}")]
    Date {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("url {url:?} has no segment {index}")]
    UrlSegment { url: String, index: usize },
}

pub fn or_empty<T: Default>(field: &str, result: Result<T, FieldError>) -> T {
    result.unwrap_or_else(|e| {
        debug!(field, error = %e, "field degraded to empty");
        T::default()
    })
}

fn selector(css: &'static str) -> Result<Selector, FieldError> {
    Selector::parse(css).map_err(|_| FieldError::Selector(css))
}

fn first<'a>(doc: &'a Html, css: &'static str) -> Result<ElementRef<'a>, FieldError> {
    let sel = selector(css)?;
    doc.select(&sel).next().ok_or(FieldError::Missing(css))
}

/// ASCII only, no control characters, label removed, trimmed.
pub fn clean_text(raw: &str, label: &str) -> String {
    let ascii: String = raw
        .chars()
        .filter(|c| c.is_ascii() && !c.is_ascii_control())
        .collect();
    let stripped = if label.is_empty() {
        ascii
    } else {
        ascii.replace(label, "")
    };
    stripped.trim().to_string()
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect()
}

/// Full text of the document, as searched for the end-of-results marker.
pub fn document_text(doc: &Html) -> String {
    element_text(doc.root_element())
}

/// `YYYY-MM-DD HH:MM:SS` from the "Posted:" line.
pub fn post_timestamp(doc: &Html, rules: &ExtractionRules) -> Result<String, FieldError> {
    let el = first(doc, rules.date_selector)?;
    let value = clean_text(&element_text(el), rules.date_label);
    let parsed = NaiveDateTime::parse_from_str(&value, rules.date_format)
        .map_err(|source| FieldError::Date { value, source })?;
    Ok(parsed.format(TIMESTAMP_FORMAT).to_string())
}

pub fn title(doc: &Html, rules: &ExtractionRules) -> Result<String, FieldError> {
    let el = first(doc, rules.title_selector)?;
    Ok(clean_text(&element_text(el), rules.title_label))
}

pub fn body_text(doc: &Html, rules: &ExtractionRules) -> Result<String, FieldError> {
    let el = first(doc, rules.body_selector)?;
    Ok(clean_text(&element_text(el), ""))
}

pub fn poster_age(doc: &Html, rules: &ExtractionRules) -> Result<String, FieldError> {
    let el = first(doc, rules.age_selector)?;
    Ok(clean_text(&element_text(el), rules.age_label))
}

/// First `div` whose own text (not its children's) carries the location label.
pub fn locations(doc: &Html, rules: &ExtractionRules) -> Result<String, FieldError> {
    let divs = selector("div")?;
    let el = doc
        .select(&divs)
        .find(|d| {
            d.children()
                .filter_map(|c| c.value().as_text())
                .any(|t| t.contains(rules.location_label))
        })
        .ok_or(FieldError::Missing(rules.location_label))?;
    Ok(clean_text(&element_text(el), rules.location_label))
}

/// Links listed under "other ads by this user", in page order.
pub fn related_ad_links(doc: &Html, rules: &ExtractionRules) -> Result<Vec<String>, FieldError> {
    let container = first(doc, rules.other_ads_selector)?;
    let items = selector(rules.other_ads_item_selector)?;
    let anchor = selector("a")?;
    Ok(container
        .select(&items)
        .filter_map(|item| item.select(&anchor).next())
        .filter_map(|a| a.value().attr("href"))
        .map(str::to_string)
        .collect())
}

/// Listing links on a result page: the first anchor of every `div` with a
/// class token matching the category pattern.
pub fn category_links(doc: &Html, pattern: &Regex) -> Result<Vec<String>, FieldError> {
    let divs = selector("div")?;
    let anchor = selector("a")?;
    Ok(doc
        .select(&divs)
        .filter(|d| d.value().classes().any(|c| pattern.is_match(c)))
        .filter_map(|d| d.select(&anchor).next())
        .filter_map(|a| a.value().attr("href"))
        .map(str::to_string)
        .collect())
}

fn url_segment(url: &str, index: usize) -> Result<&str, FieldError> {
    url.split('/')
        .nth(index)
        .ok_or_else(|| FieldError::UrlSegment {
            url: url.to_string(),
            index,
        })
}

/// Host's first label: `metroa` in `http://metroa.example.com/...`.
pub fn locale(url: &str, rules: &ExtractionRules) -> Result<String, FieldError> {
    let host = url_segment(url, rules.locale_segment)?;
    Ok(host.split('.').next().unwrap_or_default().to_string())
}

pub fn category(url: &str, rules: &ExtractionRules) -> Result<String, FieldError> {
    url_segment(url, rules.category_segment).map(str::to_string)
}

pub fn ad_id(url: &str, rules: &ExtractionRules) -> Result<String, FieldError> {
    url_segment(url, rules.ad_id_segment).map(str::to_string)
}
