//! Incremental load from the raw store into `listings`.
//!
//! Each cycle either loads a batch of captures that have no listing yet, or,
//! when there is nothing to load, reconciles the clean store against the raw
//! one. Keys that fail to load, and keys pruned as posted before collection
//! began, are remembered for the life of the process and never retried.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::config::LoadSettings;
use crate::db::{self, ListingRow, PendingCapture, SiteRow};
use crate::parser::{self, rules::ExtractionRules};

/// Site id to reference columns, read once at startup.
#[derive(Debug, Default)]
pub struct ReferenceMap(HashMap<String, SiteRow>);

impl ReferenceMap {
    pub fn load(conn: &Connection) -> Result<Self> {
        let sites = db::fetch_sites(conn)?;
        Ok(Self(sites.into_iter().map(|s| (s.site_id.clone(), s)).collect()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Fill the reference columns from the listing's locale. Unknown locales
    /// leave them empty.
    pub fn enrich(&self, row: &mut ListingRow) {
        if let Some(site) = self.0.get(&row.locale) {
            row.city = site.city.clone();
            row.state = site.state.clone();
            row.region = site.region.clone();
            row.division = site.division.clone();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// `stale` counts captures skipped because they predate the clean store.
    Loaded { loaded: usize, failed: usize, stale: usize },
    Idle { stale: usize, orphans: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Loaded,
    Failed,
    Stale,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoadTotals {
    pub cycles: usize,
    pub loaded: usize,
    pub failed: usize,
    pub stale: usize,
    pub orphans: usize,
}

pub struct Loader<'c> {
    conn: &'c Connection,
    rules: ExtractionRules,
    settings: LoadSettings,
    references: ReferenceMap,
    failures: HashSet<String>,
    pruned: HashSet<String>,
    collection_start: Option<String>,
}

impl<'c> Loader<'c> {
    pub fn new(conn: &'c Connection, rules: ExtractionRules, settings: LoadSettings) -> Result<Self> {
        let references = ReferenceMap::load(conn)?;
        info!(
            "Loaded {} reference sites, extraction rules {:?}",
            references.len(),
            rules.version
        );
        Ok(Self {
            conn,
            rules,
            settings,
            references,
            failures: HashSet::new(),
            pruned: HashSet::new(),
            collection_start: None,
        })
    }

    #[cfg(test)]
    pub fn failures(&self) -> &HashSet<String> {
        &self.failures
    }

    /// Poll until terminated, or with `once` until the first idle cycle.
    pub async fn run(&mut self, once: bool) -> Result<LoadTotals> {
        let mut totals = LoadTotals::default();
        loop {
            totals.cycles += 1;
            match self.run_cycle()? {
                CycleOutcome::Loaded { loaded, failed, stale } => {
                    info!(
                        "Loaded {} listings ({} failed, {} stale, {} keys skipped)",
                        loaded,
                        failed,
                        stale,
                        self.failures.len() + self.pruned.len()
                    );
                    totals.loaded += loaded;
                    totals.failed += failed;
                    totals.stale += stale;
                }
                CycleOutcome::Idle { stale, orphans } => {
                    info!("Nothing to load; pruned {} stale and {} orphaned listings", stale, orphans);
                    totals.stale += stale;
                    totals.orphans += orphans;
                    if once {
                        return Ok(totals);
                    }
                    tokio::time::sleep(self.settings.poll_interval()).await;
                }
            }
        }
    }

    pub fn run_cycle(&mut self) -> Result<CycleOutcome> {
        let batch = self.next_batch()?;
        if batch.is_empty() {
            let (stale, orphans) = self.reconcile()?;
            return Ok(CycleOutcome::Idle { stale, orphans });
        }

        if self.settings.prune_pre_collection {
            self.collection_start = db::collection_start(self.conn)?;
        }
        let (mut loaded, mut failed, mut stale) = (0, 0, 0);
        for capture in &batch {
            match self.load_one(capture) {
                Disposition::Loaded => loaded += 1,
                Disposition::Failed => failed += 1,
                Disposition::Stale => stale += 1,
            }
        }
        Ok(CycleOutcome::Loaded { loaded, failed, stale })
    }

    /// Over-fetch by the number of skipped keys so known-bad or pruned keys
    /// at the head of the raw store cannot crowd out loadable ones.
    fn next_batch(&self) -> Result<Vec<PendingCapture>> {
        let limit = self.settings.batch_size + self.failures.len() + self.pruned.len();
        Ok(db::fetch_unloaded(self.conn, limit)?
            .into_iter()
            .filter(|p| !self.failures.contains(&p.unique_key) && !self.pruned.contains(&p.unique_key))
            .take(self.settings.batch_size)
            .collect())
    }

    fn load_one(&mut self, capture: &PendingCapture) -> Disposition {
        let mut row = match parser::process_payload(&capture.payload, &self.rules) {
            Ok(row) => row,
            Err(e) => {
                warn!(key = %capture.unique_key, "extract failed: {}", e);
                self.failures.insert(capture.unique_key.clone());
                return Disposition::Failed;
            }
        };
        if row.unique_key != capture.unique_key {
            warn!(raw = %capture.unique_key, extracted = %row.unique_key, "key mismatch, keeping raw key");
            row.unique_key = capture.unique_key.clone();
        }
        if self.predates_collection(&row) {
            debug!(key = %capture.unique_key, "posted before collection began, skipped");
            self.pruned.insert(capture.unique_key.clone());
            return Disposition::Stale;
        }
        self.references.enrich(&mut row);

        match db::insert_listing(self.conn, &row) {
            Ok(()) => {
                debug!(key = %row.unique_key, "loaded");
                Disposition::Loaded
            }
            Err(e) => {
                warn!(key = %row.unique_key, "insert failed: {}", e);
                self.failures.insert(capture.unique_key.clone());
                Disposition::Failed
            }
        }
    }

    /// Same test the reconcile prune applies, against the clean store's
    /// earliest capture as of this batch.
    fn predates_collection(&self, row: &ListingRow) -> bool {
        match (&row.post_timestamp, &self.collection_start) {
            (Some(posted), Some(start)) => self.settings.prune_pre_collection && posted < start,
            _ => false,
        }
    }

    /// Drop listings posted before collection began, then listings whose raw
    /// capture is gone. Pruned keys are not loaded again by this process.
    pub fn reconcile(&mut self) -> Result<(usize, usize)> {
        let stale = if self.settings.prune_pre_collection {
            let keys = db::delete_pre_collection(self.conn)?;
            let n = keys.len();
            self.pruned.extend(keys);
            n
        } else {
            0
        };
        let orphans = db::delete_orphans(self.conn)?;
        Ok((stale, orphans))
    }
}
