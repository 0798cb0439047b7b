use std::collections::BTreeSet;

use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

use crate::db;
use crate::parser::rules::NoMatchPolicy;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkCounts {
    pub new_phones: usize,
    pub new_links: usize,
}

/// Split each listing's phone field into the `phones` table and link every
/// phone back to the listings that mention it. Safe to rerun.
pub fn link_phones(conn: &Connection) -> Result<LinkCounts> {
    let listings = db::fetch_listing_phones(conn)?;
    let per_listing: Vec<(i64, Vec<&str>)> = listings
        .iter()
        .map(|(id, field)| (*id, split_field(field)))
        .collect();

    let distinct: BTreeSet<&str> = per_listing.iter().flat_map(|(_, p)| p.iter().copied()).collect();
    let phones: Vec<&str> = distinct.into_iter().collect();
    let new_phones = db::save_phones(conn, &phones)?;

    let ids = db::fetch_phone_ids(conn)?;
    let links: Vec<(i64, i64)> = per_listing
        .iter()
        .flat_map(|(listing_id, phones)| {
            phones
                .iter()
                .filter_map(|p| ids.get(*p))
                .map(move |phone_id| (*phone_id, *listing_id))
        })
        .collect();
    let new_links = db::save_listing_phones(conn, &links)?;

    info!(
        "Linked {} listings: {} new phones, {} new links",
        per_listing.len(),
        new_phones,
        new_links
    );
    Ok(LinkCounts { new_phones, new_links })
}

fn split_field(field: &str) -> Vec<&str> {
    field
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty() && *p != NoMatchPolicy::NOT_AVAILABLE)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{listing, memory_db};

    fn add(conn: &Connection, key: &str, phones: &str) {
        let mut row = listing(key, None, "2017-03-04 09:00:00");
        row.phones = phones.into();
        db::insert_listing(conn, &row).unwrap();
    }

    #[test]
    fn split_skips_sentinels() {
        assert_eq!(split_field("6195551234;5551234"), vec!["6195551234", "5551234"]);
        assert!(split_field("N/A").is_empty());
        assert!(split_field("").is_empty());
    }

    #[test]
    fn shared_phone_links_both_listings() {
        let conn = memory_db();
        add(&conn, "a", "6195551234;5551234");
        add(&conn, "b", "6195551234");
        add(&conn, "c", "N/A");

        let counts = link_phones(&conn).unwrap();
        assert_eq!(counts, LinkCounts { new_phones: 2, new_links: 3 });

        let linked: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM listing_phones lp JOIN phones p ON p.id = lp.phone_id
                 WHERE p.phone = '6195551234'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(linked, 2);
    }

    #[test]
    fn rerun_is_a_no_op() {
        let conn = memory_db();
        add(&conn, "a", "6195551234");
        link_phones(&conn).unwrap();
        assert_eq!(link_phones(&conn).unwrap(), LinkCounts::default());

        add(&conn, "b", "6195551234;7605550000");
        assert_eq!(link_phones(&conn).unwrap(), LinkCounts { new_phones: 1, new_links: 2 });
    }

    #[test]
    fn links_follow_listing_deletes() {
        let conn = memory_db();
        add(&conn, "a", "6195551234");
        link_phones(&conn).unwrap();
        conn.execute("DELETE FROM listings WHERE unique_key = 'a'", []).unwrap();
        assert_eq!(db::get_stats(&conn).unwrap().phone_links, 0);
    }
}
