use serde::Deserialize;

/// Output of the phone field when a post yields no candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoMatchPolicy {
    Empty,
    NotAvailable,
}

impl NoMatchPolicy {
    pub const NOT_AVAILABLE: &'static str = "N/A";

    pub fn placeholder(self) -> &'static str {
        match self {
            NoMatchPolicy::Empty => "",
            NoMatchPolicy::NotAvailable => Self::NOT_AVAILABLE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RulesVersion {
    /// Site-wide ETL rules: blank phone field when nothing is found.
    #[default]
    V1,
    /// Packaged scraper rules: `N/A` when nothing is found.
    V2,
}

/// Everything the extractor needs to know about the listing markup.
#[derive(Debug, Clone)]
pub struct ExtractionRules {
    pub version: RulesVersion,
    pub date_selector: &'static str,
    pub date_label: &'static str,
    pub date_format: &'static str,
    pub title_selector: &'static str,
    pub title_label: &'static str,
    pub body_selector: &'static str,
    pub age_selector: &'static str,
    pub age_label: &'static str,
    pub location_label: &'static str,
    pub other_ads_selector: &'static str,
    pub other_ads_item_selector: &'static str,
    /// Applied to each class token of a `div`; the first `a` inside a match is a listing link.
    pub category_link_pattern: &'static str,
    pub locale_segment: usize,
    pub category_segment: usize,
    pub ad_id_segment: usize,
    pub no_match: NoMatchPolicy,
}

impl ExtractionRules {
    pub fn for_version(version: RulesVersion) -> Self {
        let no_match = match version {
            RulesVersion::V1 => NoMatchPolicy::Empty,
            RulesVersion::V2 => NoMatchPolicy::NotAvailable,
        };
        Self {
            version,
            date_selector: "div.adInfo",
            date_label: "Posted:",
            date_format: "%A, %B %d, %Y %I:%M %p",
            title_selector: "div#postingTitle",
            title_label: "Report Ad",
            body_selector: "div.postingBody",
            age_selector: "p.metaInfoDisplay",
            age_label: "Poster's age:",
            location_label: "Location:",
            other_ads_selector: "div#OtherAdsByThisUser",
            other_ads_item_selector: "div.cat",
            category_link_pattern: "cat*",
            locale_segment: 2,
            category_segment: 3,
            ad_id_segment: 5,
            no_match,
        }
    }

    pub fn with_no_match(mut self, policy: Option<NoMatchPolicy>) -> Self {
        if let Some(p) = policy {
            self.no_match = p;
        }
        self
    }
}

impl Default for ExtractionRules {
    fn default() -> Self {
        Self::for_version(RulesVersion::default())
    }
}
