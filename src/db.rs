use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS raw_captures (
            id          INTEGER PRIMARY KEY,
            unique_key  TEXT UNIQUE NOT NULL,
            capture     TEXT NOT NULL,
            inserted_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS sites (
            site_id   TEXT PRIMARY KEY,
            city      TEXT,
            state     TEXT,
            region    TEXT,
            division  TEXT
        );

        CREATE TABLE IF NOT EXISTS listings (
            id                INTEGER PRIMARY KEY,
            unique_key        TEXT UNIQUE NOT NULL,
            source_url        TEXT NOT NULL,
            locale            TEXT NOT NULL,
            category          TEXT NOT NULL,
            ad_id             TEXT NOT NULL,
            post_timestamp    TEXT,
            title             TEXT NOT NULL,
            body_text         TEXT NOT NULL,
            poster_age        TEXT NOT NULL,
            locations         TEXT NOT NULL,
            phones            TEXT NOT NULL,
            related_ad_links  TEXT NOT NULL,
            capture_timestamp TEXT NOT NULL,
            city              TEXT,
            state             TEXT,
            region            TEXT,
            division          TEXT,
            loaded_at         TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_listings_locale ON listings(locale);
        CREATE INDEX IF NOT EXISTS idx_listings_posted ON listings(post_timestamp);

        CREATE TABLE IF NOT EXISTS phones (
            id     INTEGER PRIMARY KEY,
            phone  TEXT UNIQUE NOT NULL
        );

        CREATE TABLE IF NOT EXISTS listing_phones (
            phone_id    INTEGER NOT NULL REFERENCES phones(id),
            listing_id  INTEGER NOT NULL REFERENCES listings(id) ON DELETE CASCADE,
            PRIMARY KEY (phone_id, listing_id)
        );
        CREATE INDEX IF NOT EXISTS idx_listing_phones_listing ON listing_phones(listing_id);
        ",
    )?;
    Ok(())
}

// ── Raw captures ──

/// One fetched listing page, stored as a JSON blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCapture {
    pub unique_key: Option<String>,
    pub capture_timestamp: String,
    pub http_status: u16,
    pub source_url: String,
    pub raw_body: String,
}

/// Insert unless the key is already stored. Returns whether a row was written.
pub fn insert_raw_capture(conn: &Connection, unique_key: &str, capture: &RawCapture) -> Result<bool> {
    let payload = serde_json::to_string(capture)?;
    let n = conn.execute(
        "INSERT OR IGNORE INTO raw_captures (unique_key, capture) VALUES (?1, ?2)",
        rusqlite::params![unique_key, payload],
    )?;
    Ok(n == 1)
}

pub struct PendingCapture {
    pub unique_key: String,
    pub payload: String,
}

/// Raw captures whose key has no row in `listings` yet, oldest first.
pub fn fetch_unloaded(conn: &Connection, limit: usize) -> Result<Vec<PendingCapture>> {
    let mut stmt = conn.prepare(
        "SELECT r.unique_key, r.capture
         FROM raw_captures r
         LEFT JOIN listings l ON l.unique_key = r.unique_key
         WHERE l.unique_key IS NULL
         ORDER BY r.id
         LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([limit as i64], |row| {
            Ok(PendingCapture {
                unique_key: row.get(0)?,
                payload: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Reference data ──

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SiteRow {
    pub site_id: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub region: Option<String>,
    pub division: Option<String>,
}

pub fn fetch_sites(conn: &Connection) -> Result<Vec<SiteRow>> {
    let mut stmt = conn.prepare("SELECT site_id, city, state, region, division FROM sites")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(SiteRow {
                site_id: row.get(0)?,
                city: row.get(1)?,
                state: row.get(2)?,
                region: row.get(3)?,
                division: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn save_sites(conn: &Connection, rows: &[SiteRow]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT OR REPLACE INTO sites (site_id, city, state, region, division)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for r in rows {
            count += stmt.execute(rusqlite::params![r.site_id, r.city, r.state, r.region, r.division])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

/// Read `site_id,city,state,region,division` rows from a CSV file.
pub fn read_sites_csv(path: &Path) -> Result<Vec<SiteRow>> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mut rows = Vec::new();
    for record in reader.deserialize::<SiteRow>() {
        let mut row = record.with_context(|| format!("Bad row in {:?}", path))?;
        row.site_id = row.site_id.trim().to_lowercase();
        if !row.site_id.is_empty() {
            rows.push(row);
        }
    }
    Ok(rows)
}

pub fn import_sites(conn: &Connection, path: &Path) -> Result<usize> {
    let rows = read_sites_csv(path)?;
    save_sites(conn, &rows)
}

// ── Listings ──

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingRow {
    pub unique_key: String,
    pub source_url: String,
    pub locale: String,
    pub category: String,
    pub ad_id: String,
    /// `None` when the date could not be read; kept out of timestamp comparisons.
    pub post_timestamp: Option<String>,
    pub title: String,
    pub body_text: String,
    pub poster_age: String,
    pub locations: String,
    pub phones: String,
    pub related_ad_links: Vec<String>,
    pub capture_timestamp: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub region: Option<String>,
    pub division: Option<String>,
}

/// Plain insert: a duplicate `unique_key` comes back as an error.
pub fn insert_listing(conn: &Connection, r: &ListingRow) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO listings
         (unique_key, source_url, locale, category, ad_id, post_timestamp, title, body_text,
          poster_age, locations, phones, related_ad_links, capture_timestamp,
          city, state, region, division)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
    )?;
    stmt.execute(rusqlite::params![
        r.unique_key, r.source_url, r.locale, r.category, r.ad_id, r.post_timestamp,
        r.title, r.body_text, r.poster_age, r.locations, r.phones,
        r.related_ad_links.join(";"), r.capture_timestamp,
        r.city, r.state, r.region, r.division,
    ])?;
    Ok(())
}

/// Earliest capture time in the clean store; `None` while it is empty.
pub fn collection_start(conn: &Connection) -> Result<Option<String>> {
    let start = conn.query_row("SELECT MIN(capture_timestamp) FROM listings", [], |r| r.get(0))?;
    Ok(start)
}

/// Delete listings posted before the earliest capture in the clean store.
/// Returns the deleted keys.
pub fn delete_pre_collection(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "DELETE FROM listings
         WHERE post_timestamp < (SELECT MIN(capture_timestamp) FROM listings)
         RETURNING unique_key",
    )?;
    let keys = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(keys)
}

/// Listings whose key no longer exists in the raw store.
pub fn delete_orphans(conn: &Connection) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM listings
         WHERE NOT EXISTS (SELECT 1 FROM raw_captures r WHERE r.unique_key = listings.unique_key)",
        [],
    )?;
    Ok(n)
}

// ── Phones ──

pub fn fetch_listing_phones(conn: &Connection) -> Result<Vec<(i64, String)>> {
    let mut stmt = conn.prepare("SELECT id, phones FROM listings WHERE phones != ''")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn save_phones(conn: &Connection, phones: &[&str]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare("INSERT OR IGNORE INTO phones (phone) VALUES (?1)")?;
        for p in phones {
            count += stmt.execute([p])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

pub fn fetch_phone_ids(conn: &Connection) -> Result<HashMap<String, i64>> {
    let mut stmt = conn.prepare("SELECT phone, id FROM phones")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

pub fn save_listing_phones(conn: &Connection, links: &[(i64, i64)]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO listing_phones (phone_id, listing_id) VALUES (?1, ?2)",
        )?;
        for (phone_id, listing_id) in links {
            count += stmt.execute(rusqlite::params![phone_id, listing_id])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

// ── Stats ──

pub struct Stats {
    pub raw: usize,
    pub listings: usize,
    pub unloaded: usize,
    pub sites: usize,
    pub phones: usize,
    pub phone_links: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let count = |sql: &str| -> Result<usize> { Ok(conn.query_row(sql, [], |r| r.get(0))?) };
    Ok(Stats {
        raw: count("SELECT COUNT(*) FROM raw_captures")?,
        listings: count("SELECT COUNT(*) FROM listings")?,
        unloaded: count(
            "SELECT COUNT(*) FROM raw_captures r
             WHERE NOT EXISTS (SELECT 1 FROM listings l WHERE l.unique_key = r.unique_key)",
        )?,
        sites: count("SELECT COUNT(*) FROM sites")?,
        phones: count("SELECT COUNT(*) FROM phones")?,
        phone_links: count("SELECT COUNT(*) FROM listing_phones")?,
    })
}
