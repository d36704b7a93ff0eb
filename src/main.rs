use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use feedpoll::config::Config;
use feedpoll::feed::{spawn_scheduler, PollError, Poller, Selection};
use feedpoll::storage::{Database, DatabaseError, NewSource, PostQuery, PostSort, SortOrder};
use feedpoll::util::{strip_control_chars, validate_feed_url};

/// Get the config directory path (~/.config/feedpoll/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedpoll"))
}

#[derive(Parser, Debug)]
#[command(name = "feedpoll", version, about = "Adaptive RSS/Atom/JSON feed poller")]
struct Args {
    /// Config file (default: ~/.config/feedpoll/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// SQLite database, overriding the config file
    #[arg(long, value_name = "FILE", global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one polling batch
    Poll {
        /// Poll every source, due or not
        #[arg(long, conflicts_with = "source")]
        all: bool,

        /// Poll only these source ids (repeatable)
        #[arg(long = "source", value_name = "ID")]
        source: Vec<i64>,

        /// Batch size (default: max_feeds from config)
        #[arg(long, value_name = "N")]
        max: Option<usize>,
    },
    /// Poll due sources on a timer until Ctrl-C
    Run {
        /// Minutes between batches (default: poll_every_minutes from config)
        #[arg(long, value_name = "MINUTES")]
        every: Option<u64>,
    },
    /// Subscribe to a feed
    Add {
        url: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Unsubscribe and delete the source's posts
    Remove { id: i64 },
    /// List sources with their polling state
    Sources,
    /// List stored posts
    Posts {
        /// Source name contains
        #[arg(long = "source", value_name = "TEXT")]
        source_name: Option<String>,
        /// Title contains
        #[arg(long)]
        title: Option<String>,
        /// Created on or after (YYYY-MM-DD)
        #[arg(long, value_parser = parse_day)]
        from: Option<NaiveDate>,
        /// Created on or before (YYYY-MM-DD)
        #[arg(long, value_parser = parse_day)]
        to: Option<NaiveDate>,
        #[arg(long, value_enum, default_value_t = SortKey::Created)]
        sort: SortKey,
        /// Oldest / A-Z first
        #[arg(long)]
        asc: bool,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SortKey {
    Created,
    Title,
    Body,
}

impl From<SortKey> for PostSort {
    fn from(key: SortKey) -> Self {
        match key {
            SortKey::Created => PostSort::Created,
            SortKey::Title => PostSort::Title,
            SortKey::Body => PostSort::Body,
        }
    }
}

fn parse_day(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            if let Err(e) = std::fs::set_permissions(&config_dir, perms) {
                tracing::warn!(path = %config_dir.display(), error = %e, "Failed to set config directory permissions to 0700");
            }
        }
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = args
        .database
        .clone()
        .unwrap_or_else(|| config.database_path(&config_dir));
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::Locked) => {
            eprintln!("Error: the database is locked by another feedpoll process. Try again later.");
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    match args.command {
        Command::Poll { all, source, max } => {
            let poller = Poller::from_config(db.clone(), &config)?;
            let selection = if all {
                Selection::Sources(db.get_sources().await?.iter().map(|s| s.id).collect())
            } else if !source.is_empty() {
                Selection::Sources(source)
            } else {
                Selection::Due
            };
            let max = max.unwrap_or(if all { usize::MAX } else { config.max_feeds });
            poll_once(&poller, selection, max).await?;
        }
        Command::Run { every } => {
            let poller = Poller::from_config(db, &config)?;
            let minutes = every.unwrap_or(config.poll_every_minutes).max(1);
            let handle = spawn_scheduler(poller, Duration::from_secs(minutes * 60), config.max_feeds);
            println!("Polling every {minutes} minute(s). Press Ctrl-C to stop.");

            tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
            println!("Stopping after the current batch...");
            handle.stop().await?;
        }
        Command::Add { url, name, owner } => {
            let url = validate_feed_url(&url).context("Refusing feed URL")?;
            let mut source = NewSource::new(url.as_str());
            source.name = name;
            source.owner = owner;
            let id = db.insert_source(&source).await.context("Failed to add source")?;
            println!("Added source {id}: {url}");
        }
        Command::Remove { id } => {
            let Some(source) = db.get_source(id).await? else {
                anyhow::bail!("No source with id {id}");
            };
            let posts = db.delete_source(id).await?;
            println!("Removed {} ({} posts)", source.display_name(), posts);
        }
        Command::Sources => print_sources(&db).await?,
        Command::Posts {
            source_name,
            title,
            from,
            to,
            sort,
            asc,
            limit,
        } => {
            let query = PostQuery {
                source_name,
                title,
                created_from: from.and_then(|d| d.and_hms_opt(0, 0, 0)).map(|t| t.and_utc().timestamp()),
                created_to: to.and_then(|d| d.and_hms_opt(23, 59, 59)).map(|t| t.and_utc().timestamp()),
                sort: sort.into(),
                order: if asc { SortOrder::Ascending } else { SortOrder::Descending },
                limit: Some(limit),
            };
            print_posts(&db, &query).await?;
        }
    }

    Ok(())
}

async fn poll_once(poller: &Poller, selection: Selection, max: usize) -> Result<()> {
    let reports = poller.update_feeds(selection, max).await?;
    if reports.is_empty() {
        println!("Nothing to poll.");
        return Ok(());
    }

    for report in &reports {
        match &report.result {
            Ok(summary) => println!(
                "#{:<5} {:>3}  +{:<3} next in {:>4} min  {}",
                report.source_id,
                summary.status_code,
                summary.stats.inserted,
                summary.interval,
                summary.last_result.as_deref().unwrap_or("")
            ),
            Err(PollError::InFlight(_)) => println!("#{:<5} skipped (already polling)", report.source_id),
            Err(e) => println!("#{:<5} failed: {}", report.source_id, e),
        }
    }
    Ok(())
}

fn format_time(ts: Option<i64>) -> String {
    ts.and_then(|t| DateTime::<Utc>::from_timestamp(t, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".to_string())
}

async fn print_sources(db: &Database) -> Result<()> {
    let sources = db.get_sources().await?;
    if sources.is_empty() {
        println!("No sources. Add one with: feedpoll add <URL>");
        return Ok(());
    }

    for s in sources {
        let flags = match (s.live, s.is_cloudflare) {
            (false, _) => " [dead]",
            (true, true) => " [cloudflare]",
            (true, false) => "",
        };
        println!("#{} {}{}", s.id, strip_control_chars(s.display_name()), flags);
        println!("    feed:     {}", s.feed_url);
        println!(
            "    polled:   {}  due: {}  every {} min  status {}",
            format_time(s.last_polled),
            format_time(Some(s.due_poll)),
            s.interval,
            s.status_code
        );
        if let Some(result) = &s.last_result {
            println!("    result:   {}", strip_control_chars(result));
        }
    }
    Ok(())
}

async fn print_posts(db: &Database, query: &PostQuery) -> Result<()> {
    let posts = db.list_posts(query).await?;
    if posts.is_empty() {
        println!("No posts match.");
        return Ok(());
    }

    for post in posts {
        println!(
            "{}  [{}#{}] {}",
            format_time(Some(post.created)),
            post.source_id,
            post.index,
            strip_control_chars(&post.title)
        );
        if let Some(link) = &post.link {
            println!("    {}", strip_control_chars(link));
        }
    }
    Ok(())
}
