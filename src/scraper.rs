use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use rusqlite::Connection;
use scraper::Html;
use tracing::{debug, error, info, warn};

use crate::config::CrawlSettings;
use crate::db::{self, RawCapture};
use crate::identity;
use crate::network::{FetchError, FetchedPage, Transport};
use crate::parser::fields::{self, or_empty, TIMESTAMP_FORMAT};
use crate::parser::rules::ExtractionRules;
use crate::targets::Target;

/// Listing URLs found while walking a target's result pages.
#[derive(Debug, Default)]
pub struct ListingUrls {
    pub urls: Vec<String>,
    /// Result pages that contributed links.
    pub pages: u32,
    /// Pagination stopped because a page could not be fetched.
    pub truncated: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CrawlStats {
    pub targets: usize,
    pub pages: u32,
    pub urls: usize,
    pub stored: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub truncated: usize,
}

impl CrawlStats {
    fn absorb(&mut self, other: CrawlStats) {
        self.targets += other.targets;
        self.pages += other.pages;
        self.urls += other.urls;
        self.stored += other.stored;
        self.duplicates += other.duplicates;
        self.failed += other.failed;
        self.truncated += other.truncated;
    }
}

/// Walks result pages and stores every listing it can fetch. Runs one
/// request at a time; the transport is replaced whenever it is rotated.
pub struct Crawler<'c, T: Transport> {
    conn: &'c Connection,
    transport: T,
    settings: CrawlSettings,
    rules: ExtractionRules,
    link_pattern: Regex,
}

impl<'c, T: Transport> Crawler<'c, T> {
    pub fn new(
        conn: &'c Connection,
        transport: T,
        settings: CrawlSettings,
        rules: ExtractionRules,
    ) -> Result<Self> {
        let link_pattern = Regex::new(rules.category_link_pattern)
            .with_context(|| format!("bad category link pattern {:?}", rules.category_link_pattern))?;
        Ok(Self {
            conn,
            transport,
            settings,
            rules,
            link_pattern,
        })
    }

    pub async fn crawl_all(&mut self, targets: &[Target]) -> Result<CrawlStats> {
        let mut total = CrawlStats::default();
        for target in targets {
            let stats = self.crawl_target(target).await?;
            info!(
                "{}: {} urls, {} stored, {} duplicates, {} failed",
                target, stats.urls, stats.stored, stats.duplicates, stats.failed
            );
            total.absorb(stats);
        }
        Ok(total)
    }

    /// Collect a target's listing URLs, then fetch and store each one. A URL
    /// that cannot be fetched is skipped; only store errors abort.
    pub async fn crawl_target(&mut self, target: &Target) -> Result<CrawlStats> {
        let listing = self.collect_listing_urls(target).await;
        let mut stats = CrawlStats {
            targets: 1,
            pages: listing.pages,
            urls: listing.urls.len(),
            truncated: usize::from(listing.truncated),
            ..Default::default()
        };

        let pb = ProgressBar::new(listing.urls.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
                .progress_chars("=> "),
        );
        pb.set_message(target.to_string());

        let mut consecutive_duplicates = 0usize;
        for url in &listing.urls {
            self.ad_delay().await;
            match self.fetch_with_retry(url).await {
                Ok(page) => {
                    if self.store(page)? {
                        stats.stored += 1;
                        consecutive_duplicates = 0;
                    } else {
                        stats.duplicates += 1;
                        consecutive_duplicates += 1;
                        debug!(url = %url, "capture already stored");
                    }
                }
                Err(e) => {
                    warn!(url = %url, "skipping listing: {}", e);
                    stats.failed += 1;
                }
            }
            pb.inc(1);

            if let Some(cutoff) = self.settings.duplicate_cutoff {
                if consecutive_duplicates >= cutoff {
                    info!("{}: {} consecutive duplicates, moving on", target, consecutive_duplicates);
                    break;
                }
            }
        }

        pb.finish_and_clear();
        Ok(stats)
    }

    /// Walk `landing?page=1`, `?page=2`, ... until a page carries the
    /// terminal marker. The marker page itself contributes nothing.
    pub async fn collect_listing_urls(&mut self, target: &Target) -> ListingUrls {
        let landing = target.landing_url(&self.settings.landing_url_template);
        let mut out = ListingUrls::default();
        let mut page_no = 1u32;

        loop {
            if self.settings.max_pages.is_some_and(|max| page_no > max) {
                debug!("{}: page limit reached", target);
                break;
            }
            let url = format!("{}?page={}", landing, page_no);
            let Some(page) = self.fetch_result_page(&url).await else {
                out.truncated = true;
                break;
            };

            let links = {
                let doc = Html::parse_document(&page.body);
                if fields::document_text(&doc).contains(&self.settings.terminal_marker) {
                    debug!("{}: no more results after page {}", target, page_no - 1);
                    break;
                }
                or_empty("category_links", fields::category_links(&doc, &self.link_pattern))
            };
            debug!("{}: page {} has {} links", target, page_no, links.len());
            out.urls.extend(links.into_iter().map(|href| absolutize(&page.url, href)));
            out.pages += 1;
            page_no += 1;
            self.page_jitter().await;
        }

        out
    }

    /// Fetch one result page, rotating identity and sleeping between
    /// attempts. `None` once `max_page_attempts` is spent.
    async fn fetch_result_page(&mut self, url: &str) -> Option<FetchedPage> {
        let max = self.settings.max_page_attempts.max(1);
        for attempt in 1..=max {
            match self.transport.get(url).await {
                Ok(page) => return Some(page),
                Err(e) => {
                    warn!("Result page {} failed (attempt {}/{}): {}", url, attempt, max, e);
                    if attempt == max {
                        break;
                    }
                    self.rotate().await;
                    tokio::time::sleep(self.settings.page_retry_interval()).await;
                }
            }
        }
        error!("Giving up on {} after {} attempts, abandoning pagination", url, max);
        None
    }

    async fn rotate(&mut self) {
        match self.transport.rotate().await {
            Ok(next) => self.transport = next,
            Err(e) => warn!("identity rotation failed, keeping current identity: {}", e),
        }
    }

    /// Bounded retry with exponential backoff for a single listing.
    async fn fetch_with_retry(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let attempts = self.settings.fetch_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            match self.transport.get(url).await {
                Ok(page) => return Ok(page),
                Err(e) if attempt + 1 >= attempts => return Err(e),
                Err(e) => {
                    let backoff = self
                        .settings
                        .fetch_backoff()
                        .saturating_mul(2u32.saturating_pow(attempt));
                    warn!(
                        "Fetch failed for {} (attempt {}/{}), backing off {:.1}s: {}",
                        url,
                        attempt + 1,
                        attempts,
                        backoff.as_secs_f64(),
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Key the page and insert it into the raw store unless the key exists.
    fn store(&self, page: FetchedPage) -> Result<bool> {
        let key = {
            let doc = Html::parse_document(&page.body);
            identity::key_for_document(&doc, &page.url, &self.rules)
        };
        let capture = RawCapture {
            unique_key: Some(key.clone()),
            capture_timestamp: chrono::Local::now().format(TIMESTAMP_FORMAT).to_string(),
            http_status: page.status,
            source_url: page.url,
            raw_body: page.body,
        };
        db::insert_raw_capture(self.conn, &key, &capture)
    }

    async fn page_jitter(&self) {
        let base = self.settings.page_jitter_ms;
        if base > 0 {
            tokio::time::sleep(Duration::from_millis(fastrand::u64(0..jitter_bound(base)))).await;
        }
    }

    async fn ad_delay(&self) {
        let max = self.settings.ad_delay_ms;
        if max > 0 {
            tokio::time::sleep(Duration::from_millis(fastrand::u64(0..max))).await;
        }
    }
}

/// Upper bound of the inter-page delay, `2 * base` clamped to `u64::MAX`.
fn jitter_bound(base: u64) -> u64 {
    base.saturating_mul(2)
}

/// Resolve a possibly relative href against the page it came from.
fn absolutize(base: &str, href: String) -> String {
    match reqwest::Url::parse(base).and_then(|b| b.join(&href)) {
        Ok(url) => url.to_string(),
        Err(_) => href,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;
    use std::rc::Rc;

    use crate::db::tests::memory_db;
    use crate::parser::tests::ad_page;

    const LANDING: &str = "http://metroa.backpage.com/forsale/";
    const MARKER_PAGE: &str = "<html><body><p>No matches found.</p></body></html>";

    #[derive(Default)]
    struct MockState {
        pages: HashMap<String, String>,
        /// Remaining failures before a URL starts answering.
        failures: RefCell<HashMap<String, u32>>,
        requests: RefCell<Vec<String>>,
        rotations: Cell<u32>,
    }

    impl MockState {
        fn page(mut self, url: &str, body: String) -> Self {
            self.pages.insert(url.to_string(), body);
            self
        }

        fn failing(self, url: &str, times: u32) -> Self {
            self.failures.borrow_mut().insert(url.to_string(), times);
            self
        }

        fn requested(&self, url: &str) -> usize {
            self.requests.borrow().iter().filter(|r| r.as_str() == url).count()
        }
    }

    struct MockTransport(Rc<MockState>);

    impl Transport for MockTransport {
        async fn get(&self, url: &str) -> Result<FetchedPage, FetchError> {
            self.0.requests.borrow_mut().push(url.to_string());
            if let Some(left) = self.0.failures.borrow_mut().get_mut(url) {
                if *left > 0 {
                    *left -= 1;
                    return Err(FetchError::Status { status: 503, url: url.to_string() });
                }
            }
            match self.0.pages.get(url) {
                Some(body) => Ok(FetchedPage {
                    status: 200,
                    url: url.to_string(),
                    body: body.clone(),
                }),
                None => Err(FetchError::Status { status: 404, url: url.to_string() }),
            }
        }

        async fn rotate(&self) -> Result<Self, FetchError> {
            self.0.rotations.set(self.0.rotations.get() + 1);
            Ok(MockTransport(Rc::clone(&self.0)))
        }
    }

    fn settings() -> CrawlSettings {
        CrawlSettings {
            page_retry_secs: 0,
            max_page_attempts: 3,
            page_jitter_ms: 0,
            fetch_attempts: 2,
            fetch_backoff_ms: 0,
            ad_delay_ms: 0,
            ..CrawlSettings::default()
        }
    }

    fn page_url(n: u32) -> String {
        format!("{}?page={}", LANDING, n)
    }

    fn ad_url(n: u32) -> String {
        format!("{}item-{}/{}", LANDING, n, 1000 + n)
    }

    fn results_page(ads: &[u32]) -> String {
        let links: String = ads
            .iter()
            .map(|n| format!(r#"<div class="cat"><a href="{}">ad {}</a></div>"#, ad_url(*n), n))
            .collect();
        format!(r#"<html><body><div class="other"><a href="/nav">nav</a></div>{}</body></html>"#, links)
    }

    fn target() -> Target {
        Target::new("metroa", "forsale")
    }

    fn crawler<'c>(conn: &'c Connection, state: &Rc<MockState>, settings: CrawlSettings) -> Crawler<'c, MockTransport> {
        Crawler::new(conn, MockTransport(Rc::clone(state)), settings, ExtractionRules::default()).unwrap()
    }

    #[tokio::test]
    async fn pagination_stops_before_marker_page() {
        let state = Rc::new(
            MockState::default()
                .page(&page_url(1), results_page(&[1, 2]))
                .page(&page_url(2), results_page(&[3]))
                .page(&page_url(3), MARKER_PAGE.into()),
        );
        let conn = memory_db();
        let listing = crawler(&conn, &state, settings()).collect_listing_urls(&target()).await;
        assert_eq!(listing.urls, vec![ad_url(1), ad_url(2), ad_url(3)]);
        assert_eq!(listing.pages, 2);
        assert!(!listing.truncated);
        assert_eq!(state.requested(&page_url(4)), 0);
    }

    #[tokio::test]
    async fn end_to_end_single_page_target() {
        let posted = "Friday, March 3, 2017 10:15 PM";
        let state = Rc::new(
            MockState::default()
                .page(&page_url(1), results_page(&[1, 2, 3]))
                .page(&page_url(2), MARKER_PAGE.into())
                .page(&ad_url(1), ad_page(posted, "one"))
                .page(&ad_url(2), ad_page(posted, "two"))
                .page(&ad_url(3), ad_page(posted, "three")),
        );
        let conn = memory_db();
        let stats = crawler(&conn, &state, settings()).crawl_target(&target()).await.unwrap();

        assert_eq!(stats.urls, 3);
        assert_eq!(stats.stored, 3);
        assert_eq!(state.requested(&page_url(3)), 0);
        assert_eq!(db::get_stats(&conn).unwrap().raw, 3);

        let key: String = conn
            .query_row("SELECT unique_key FROM raw_captures ORDER BY id LIMIT 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(key, "2017-03-03 22:15:00-1001-metroa-forsale");
    }

    #[tokio::test]
    async fn failed_page_rotates_then_recovers() {
        let state = Rc::new(
            MockState::default()
                .page(&page_url(1), results_page(&[1]))
                .page(&page_url(2), MARKER_PAGE.into())
                .failing(&page_url(1), 2),
        );
        let conn = memory_db();
        let listing = crawler(&conn, &state, settings()).collect_listing_urls(&target()).await;
        assert_eq!(listing.urls, vec![ad_url(1)]);
        assert_eq!(state.rotations.get(), 2);
        assert_eq!(state.requested(&page_url(1)), 3);
    }

    #[tokio::test]
    async fn pagination_abandoned_at_attempt_bound() {
        let state = Rc::new(
            MockState::default()
                .page(&page_url(1), results_page(&[1, 2]))
                .failing(&page_url(2), 10),
        );
        let conn = memory_db();
        let listing = crawler(&conn, &state, settings()).collect_listing_urls(&target()).await;
        assert!(listing.truncated);
        assert_eq!(listing.urls.len(), 2);
        assert_eq!(state.requested(&page_url(2)), 3);
        assert_eq!(state.rotations.get(), 2);
    }

    #[tokio::test]
    async fn max_pages_bounds_pagination() {
        let state = Rc::new(
            MockState::default()
                .page(&page_url(1), results_page(&[1]))
                .page(&page_url(2), results_page(&[2])),
        );
        let conn = memory_db();
        let bounded = CrawlSettings { max_pages: Some(1), ..settings() };
        let listing = crawler(&conn, &state, bounded).collect_listing_urls(&target()).await;
        assert_eq!(listing.urls, vec![ad_url(1)]);
        assert_eq!(state.requested(&page_url(2)), 0);
    }

    #[tokio::test]
    async fn unfetchable_listing_is_skipped() {
        let posted = "Friday, March 3, 2017 10:15 PM";
        let state = Rc::new(
            MockState::default()
                .page(&page_url(1), results_page(&[1, 2]))
                .page(&page_url(2), MARKER_PAGE.into())
                .page(&ad_url(2), ad_page(posted, "two")),
        );
        let conn = memory_db();
        let stats = crawler(&conn, &state, settings()).crawl_target(&target()).await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.stored, 1);
        assert_eq!(state.requested(&ad_url(1)), 2);
        assert_eq!(state.rotations.get(), 0);
    }

    #[tokio::test]
    async fn transient_listing_error_is_retried() {
        let posted = "Friday, March 3, 2017 10:15 PM";
        let state = Rc::new(
            MockState::default()
                .page(&page_url(1), results_page(&[1]))
                .page(&page_url(2), MARKER_PAGE.into())
                .page(&ad_url(1), ad_page(posted, "one"))
                .failing(&ad_url(1), 1),
        );
        let conn = memory_db();
        let stats = crawler(&conn, &state, settings()).crawl_target(&target()).await.unwrap();
        assert_eq!(stats.stored, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn duplicates_are_skipped_and_can_cut_off() {
        let posted = "Friday, March 3, 2017 10:15 PM";
        let state = Rc::new(
            MockState::default()
                .page(&page_url(1), results_page(&[1, 1, 1, 2]))
                .page(&page_url(2), MARKER_PAGE.into())
                .page(&ad_url(1), ad_page(posted, "one"))
                .page(&ad_url(2), ad_page(posted, "two")),
        );

        let conn = memory_db();
        let stats = crawler(&conn, &state, settings()).crawl_target(&target()).await.unwrap();
        assert_eq!((stats.stored, stats.duplicates), (2, 2));

        let conn = memory_db();
        let cut = CrawlSettings { duplicate_cutoff: Some(2), ..settings() };
        let stats = crawler(&conn, &state, cut).crawl_target(&target()).await.unwrap();
        assert_eq!((stats.stored, stats.duplicates), (1, 2));
    }

    #[test]
    fn jitter_bound_saturates() {
        assert_eq!(jitter_bound(1000), 2000);
        assert_eq!(jitter_bound(u64::MAX), u64::MAX);
        let _ = fastrand::u64(0..jitter_bound(u64::MAX / 2 + 1));
    }

    #[test]
    fn relative_links_resolve_against_page() {
        assert_eq!(
            absolutize(&page_url(1), "/forsale/lamp/7".to_string()),
            "http://metroa.backpage.com/forsale/lamp/7"
        );
        assert_eq!(absolutize("not a url", "x".to_string()), "x");
    }
}
