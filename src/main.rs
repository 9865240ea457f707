//! pagedb - inspect and exercise a pagedb database file

use anyhow::{Context, Result};
use clap::{Parser as ClapParser, Subcommand};
use pagedb::access::{KeyManager, RowId};
use pagedb::database::{Database, DatabaseOptions};
use pagedb::storage::PageId;
use std::path::PathBuf;

/// pagedb - paged storage engine with B+ tree indexes
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Buffer pool size in pages
    #[arg(short, long, default_value = "64")]
    pool_size: usize,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new database file
    Init {
        /// Database file
        file: PathBuf,
    },

    /// Print allocator statistics
    Stats {
        /// Database file
        file: PathBuf,
    },

    /// Insert integer keys 0..count into an index
    Load {
        /// Database file
        file: PathBuf,

        /// Index id
        #[arg(short, long, default_value = "1")]
        index: u32,

        /// Number of keys to insert
        #[arg(short, long)]
        count: i64,

        /// Leaf node fanout (defaults to a full page)
        #[arg(long)]
        leaf_max_size: Option<usize>,

        /// Internal node fanout (defaults to a full page)
        #[arg(long)]
        internal_max_size: Option<usize>,
    },

    /// Print the entries of an integer index in key order
    Scan {
        /// Database file
        file: PathBuf,

        /// Index id
        #[arg(short, long, default_value = "1")]
        index: u32,

        /// Start at the first key >= this value
        #[arg(long)]
        from: Option<i64>,

        /// Stop after this many entries
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let options = DatabaseOptions {
        pool_size: args.pool_size,
        ..DatabaseOptions::default()
    };

    match args.command {
        Command::Init { file } => {
            Database::create(&file, options).context("Failed to create database")?;
            println!("Created database at {}", file.display());
        }
        Command::Stats { file } => {
            let db = Database::open(&file, options).context("Failed to open database")?;
            let stats = db.stats();
            println!("File:            {}", file.display());
            println!("Allocated pages: {}", stats.allocated_pages);
            println!("Extents:         {}", stats.extents);
            for (i, used) in stats.extent_usage.iter().enumerate() {
                println!("  extent {:>4}: {} pages", i, used);
            }
            println!("Indexes:         {:?}", db.index_ids()?);
        }
        Command::Load {
            file,
            index,
            count,
            leaf_max_size,
            internal_max_size,
        } => {
            let options = DatabaseOptions {
                leaf_max_size,
                internal_max_size,
                ..options
            };
            let db = Database::open(&file, options).context("Failed to open database")?;
            let mut tree = db.open_index(index, KeyManager::i64())?;

            let mut inserted = 0u64;
            for k in 0..count {
                let rid = RowId::new(PageId((k / 64) as u32), (k % 64) as u32);
                if tree.insert(&KeyManager::encode_i64(k), rid)? {
                    inserted += 1;
                }
            }
            db.flush()?;
            println!(
                "Inserted {} of {} keys into index {}, height {}",
                inserted,
                count,
                index,
                tree.height()?
            );
        }
        Command::Scan {
            file,
            index,
            from,
            limit,
        } => {
            let db = Database::open(&file, options).context("Failed to open database")?;
            let tree = db.open_index(index, KeyManager::i64())?;

            let iter = match from {
                Some(k) => tree.begin_at(&KeyManager::encode_i64(k))?,
                None => tree.begin()?,
            };
            let mut shown = 0usize;
            for entry in iter.take(limit.unwrap_or(usize::MAX)) {
                let (key, rid) = entry?;
                println!("{}\t{}", KeyManager::decode_i64(&key), rid);
                shown += 1;
            }
            println!("({} entries)", shown);
        }
    }

    Ok(())
}
