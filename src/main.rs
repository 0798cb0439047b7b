mod config;
mod db;
mod identity;
mod linker;
mod loader;
mod network;
mod parser;
mod scraper;
mod targets;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "adcrawl", about = "Classified-ad crawler and incremental loader")]
struct Cli {
    /// Config file (optional; ADCRAWL_* environment variables override it)
    #[arg(long, global = true, default_value = "adcrawl.toml")]
    config: PathBuf,
    /// SQLite database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk every city x category target and store raw listing pages
    Crawl {
        /// Seconds to sleep after a failed result page before retrying it
        #[arg(long)]
        sleep_time: Option<u64>,
        /// One city (locale) per line
        #[arg(long)]
        city_file: Option<PathBuf>,
        /// One category per line
        #[arg(long)]
        category_file: Option<PathBuf>,
    },
    /// Extract stored captures into listings, polling for new ones
    Load {
        /// Seconds between polls when there is nothing to load
        #[arg(long)]
        poll_interval: Option<u64>,
        /// Max captures per cycle
        #[arg(long)]
        batch_size: Option<usize>,
        /// Stop after the first cycle with nothing to load
        #[arg(long)]
        once: bool,
    },
    /// Build the phone tables from loaded listings
    LinkPhones,
    /// Import site reference data (site_id,city,state,region,division)
    ImportSites {
        csv: PathBuf,
    },
    /// Show row counts
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let mut settings = config::load(&cli.config)?;
    if let Some(db) = cli.db {
        settings.database_path = db;
    }
    let rules = settings.extraction.rules();

    let conn = db::connect(&settings.database_path)?;
    db::init_schema(&conn)?;

    let result = match cli.command {
        Commands::Crawl { sleep_time, city_file, category_file } => {
            let mut crawl = settings.crawl;
            if let Some(secs) = sleep_time {
                crawl.page_retry_secs = secs;
            }
            if let Some(path) = city_file {
                crawl.city_file = path;
            }
            if let Some(path) = category_file {
                crawl.category_file = path;
            }

            let targets = targets::load_targets(&crawl.city_file, &crawl.category_file)?;
            if targets.is_empty() {
                println!("No targets. Check the city and category files.");
                return Ok(());
            }
            println!("Crawling {} targets...", targets.len());

            let transport = network::NetworkContext::new(&settings.network)
                .context("Failed to build HTTP client")?;
            let mut crawler = scraper::Crawler::new(&conn, transport, crawl, rules)?;
            let stats = crawler.crawl_all(&targets).await?;
            println!(
                "Done: {} targets, {} pages, {} urls ({} stored, {} duplicates, {} failed).",
                stats.targets, stats.pages, stats.urls, stats.stored, stats.duplicates, stats.failed
            );
            if stats.truncated > 0 {
                println!("Pagination abandoned early on {} targets.", stats.truncated);
            }
            Ok(())
        }
        Commands::Load { poll_interval, batch_size, once } => {
            let mut load = settings.load;
            if let Some(secs) = poll_interval {
                load.poll_interval_secs = secs;
            }
            if let Some(n) = batch_size {
                load.batch_size = n;
            }

            let mut loader = loader::Loader::new(&conn, rules, load)?;
            let totals = loader.run(once).await?;
            println!(
                "Loaded {} listings in {} cycles ({} failed, {} stale and {} orphans pruned).",
                totals.loaded, totals.cycles, totals.failed, totals.stale, totals.orphans
            );
            Ok(())
        }
        Commands::LinkPhones => {
            let counts = linker::link_phones(&conn)?;
            println!("{} new phones, {} new links.", counts.new_phones, counts.new_links);
            Ok(())
        }
        Commands::ImportSites { csv } => {
            let n = db::import_sites(&conn, &csv)?;
            println!("Imported {} sites from {}.", n, csv.display());
            Ok(())
        }
        Commands::Stats => {
            let s = db::get_stats(&conn)?;
            println!("Raw captures: {}", s.raw);
            println!("Listings:     {}", s.listings);
            println!("Unloaded:     {}", s.unloaded);
            println!("Sites:        {}", s.sites);
            println!("Phones:       {}", s.phones);
            println!("Phone links:  {}", s.phone_links);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
