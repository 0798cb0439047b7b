use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::parser::rules::{ExtractionRules, NoMatchPolicy, RulesVersion};

const ENV_PREFIX: &str = "ADCRAWL";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_path: PathBuf,
    pub network: NetworkSettings,
    pub crawl: CrawlSettings,
    pub load: LoadSettings,
    pub extraction: ExtractionSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/adcrawl.sqlite"),
            network: NetworkSettings::default(),
            crawl: CrawlSettings::default(),
            load: LoadSettings::default(),
            extraction: ExtractionSettings::default(),
        }
    }
}

/// Outbound network path. With `proxy` unset requests go out directly and
/// rotation only rebuilds the client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// SOCKS proxy, e.g. `socks5h://127.0.0.1:9050`.
    pub proxy: Option<String>,
    /// Tor control port, e.g. `127.0.0.1:9051`. Used to request a new circuit on rotation.
    pub control_addr: Option<String>,
    pub control_password: Option<String>,
    /// Endpoint that echoes the caller's address; logged after each rotation.
    pub ip_echo_url: Option<String>,
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            proxy: Some("socks5h://127.0.0.1:9050".into()),
            control_addr: None,
            control_password: None,
            ip_echo_url: None,
            request_timeout_secs: 60,
            user_agent: "Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/115.0"
                .into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlSettings {
    /// `{locale}` and `{category}` are substituted per target.
    pub landing_url_template: String,
    pub terminal_marker: String,
    /// Sleep after a failed result-page fetch, before retrying the same page.
    pub page_retry_secs: u64,
    pub max_page_attempts: u32,
    /// Inter-page delay is uniform in `[0, 2 * page_jitter_ms)`.
    pub page_jitter_ms: u64,
    pub fetch_attempts: u32,
    pub fetch_backoff_ms: u64,
    /// Delay between listing fetches is uniform in `[0, ad_delay_ms)`.
    pub ad_delay_ms: u64,
    pub max_pages: Option<u32>,
    /// Stop a target after this many consecutive captures that were already stored.
    pub duplicate_cutoff: Option<usize>,
    pub city_file: PathBuf,
    pub category_file: PathBuf,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            landing_url_template: "http://{locale}.backpage.com/{category}/".into(),
            terminal_marker: "No matches found.".into(),
            page_retry_secs: 100,
            max_page_attempts: 1000,
            page_jitter_ms: 1000,
            fetch_attempts: 4,
            fetch_backoff_ms: 1000,
            ad_delay_ms: 1000,
            max_pages: None,
            duplicate_cutoff: None,
            city_file: PathBuf::from("params/default_cities.txt"),
            category_file: PathBuf::from("params/default_categories.txt"),
        }
    }
}

impl CrawlSettings {
    pub fn page_retry_interval(&self) -> Duration {
        Duration::from_secs(self.page_retry_secs)
    }

    pub fn fetch_backoff(&self) -> Duration {
        Duration::from_millis(self.fetch_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoadSettings {
    pub batch_size: usize,
    pub poll_interval_secs: u64,
    /// Drop listings posted before the earliest capture in the clean store.
    pub prune_pre_collection: bool,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            poll_interval_secs: 300,
            prune_pre_collection: true,
        }
    }
}

impl LoadSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExtractionSettings {
    pub version: RulesVersion,
    /// Overrides the version's no-match policy for the phone field.
    pub no_match: Option<NoMatchPolicy>,
}

impl ExtractionSettings {
    pub fn rules(&self) -> ExtractionRules {
        ExtractionRules::for_version(self.version).with_no_match(self.no_match)
    }
}

/// Layer the optional config file under `ADCRAWL_*` environment variables.
pub fn load(path: &Path) -> Result<Settings> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path).required(false))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to read config {:?}", path))?
        .try_deserialize::<Settings>()
        .context("Invalid configuration")?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let s = load(Path::new("does/not/exist.toml")).unwrap();
        assert_eq!(s.crawl.fetch_attempts, 4);
        assert_eq!(s.crawl.terminal_marker, "No matches found.");
        assert_eq!(s.load.batch_size, 500);
        assert_eq!(s.extraction.version, RulesVersion::V1);
    }

    #[test]
    fn file_overrides_nested_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adcrawl.toml");
        std::fs::write(
            &path,
            "database_path = \"x.sqlite\"\n\
             [crawl]\nmax_page_attempts = 7\nmax_pages = 49\n\
             [extraction]\nversion = \"v2\"\nno_match = \"empty\"\n",
        )
        .unwrap();
        let s = load(&path).unwrap();
        assert_eq!(s.database_path, PathBuf::from("x.sqlite"));
        assert_eq!(s.crawl.max_page_attempts, 7);
        assert_eq!(s.crawl.max_pages, Some(49));
        assert_eq!(s.crawl.fetch_attempts, 4);
        assert_eq!(s.extraction.version, RulesVersion::V2);
        assert_eq!(s.extraction.no_match, Some(NoMatchPolicy::Empty));
        assert_eq!(s.extraction.rules().no_match, NoMatchPolicy::Empty);
    }
}
