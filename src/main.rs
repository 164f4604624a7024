use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use riffle::config::Config;
use riffle::feed::{self, FeedFetcher, FetchError};
use riffle::storage::{
    schema_identity, Article, FeedStore, Folder, NewArticle, Source, SourceUnreadCount, StoreError,
};
use riffle::util::{fit_to_width, truncate_to_width};

/// Get the config directory path (~/.config/riffle/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("riffle"))
}

#[derive(Parser, Debug)]
#[command(name = "riffle", about = "Local feed and article store")]
struct Args {
    /// Config file (default: ~/.config/riffle/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Database file (overrides the config file)
    #[arg(long, value_name = "FILE", global = true)]
    db: Option<PathBuf>,

    /// Delete the database file before opening it
    #[arg(long, global = true)]
    reset_db: bool,

    /// Rebuild the schema destructively if it cannot be migrated
    #[arg(long, global = true)]
    rebuild: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List sources with their unread counts
    Sources,
    /// Add or replace a source
    AddSource {
        url: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        folder: Option<String>,
        #[arg(long)]
        icon: Option<String>,
    },
    /// Remove a source and all of its articles
    RemoveSource { url: String },
    RenameSource { url: String, title: String },
    /// Set or clear a source's icon url
    SetIcon { url: String, icon: Option<String> },
    /// File a source under a folder (created if needed), or unfile it
    MoveSource { url: String, folder: Option<String> },
    /// List folders
    Folders,
    AddFolder { name: String },
    /// Remove a folder; its sources become unfiled
    RemoveFolder { name: String },
    RenameFolder { old: String, new: String },
    /// Ingest a JSON array of articles ("-" reads stdin)
    Ingest { file: PathBuf },
    /// Sync every source from a JSON document mapping source url to articles
    Sync {
        batches: PathBuf,
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// List articles, newest first
    Articles {
        #[arg(long, conflicts_with_all = ["folder", "saved"])]
        source: Option<String>,
        #[arg(long, conflicts_with = "saved")]
        folder: Option<String>,
        #[arg(long)]
        saved: bool,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show one article with its source title
    Show { link: String },
    MarkRead {
        link: String,
        #[arg(long)]
        unread: bool,
    },
    MarkSourceRead { url: String },
    MarkFolderRead { folder: String },
    MarkAllRead,
    Save {
        link: String,
        #[arg(long)]
        unsave: bool,
    },
    /// Delete every article; sources and folders stay
    Clear,
    /// Clip descriptions longer than the configured limit
    Truncate {
        #[arg(long)]
        max_chars: Option<i64>,
    },
    /// Write folders, sources and saved articles as JSON
    Export { file: PathBuf },
    /// Restore a JSON backup
    Import { file: PathBuf },
    /// Write sources as OPML, grouped by folder
    ExportOpml { file: PathBuf },
    /// Add sources and folders from an OPML file ("-" for stdin)
    ImportOpml { file: PathBuf },
    /// Print live snapshots until interrupted
    Watch {
        #[arg(value_enum, default_value_t = WatchTarget::Articles)]
        target: WatchTarget,
    },
    /// Print the current and stored schema identity
    Identity,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum WatchTarget {
    Articles,
    Saved,
    Sources,
    Folders,
    Unread,
}

/// Serves batches from a pre-fetched JSON document keyed by source url.
struct BatchFileFetcher {
    batches: HashMap<String, Vec<NewArticle>>,
}

#[async_trait]
impl FeedFetcher for BatchFileFetcher {
    async fn fetch(&self, source: &Source) -> Result<Vec<NewArticle>, FetchError> {
        self.batches
            .get(&source.url)
            .cloned()
            .ok_or_else(|| FetchError::Network(format!("no batch for {}", source.url)))
    }
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    if path == Path::new("-") {
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("Failed to read stdin")?;
    } else {
        buf = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
    }
    Ok(buf)
}

/// Write `bytes` to a sibling temp file, then rename it over `path`.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp_path = path.with_extension(format!("tmp.{}", std::process::id()));
    let result = std::fs::File::create(&temp_path)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .and_then(|()| std::fs::rename(&temp_path, path));
    if let Err(e) = result {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e).with_context(|| format!("Failed to write {}", path.display()));
    }
    Ok(())
}

fn format_date(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_articles(articles: &[Article], limit: usize) {
    for article in articles.iter().take(limit) {
        let flags = format!(
            "{}{}",
            if article.is_read { ' ' } else { '*' },
            if article.is_saved { 'S' } else { ' ' }
        );
        println!(
            "{} {}  {}  {}",
            flags,
            format_date(article.pub_date),
            fit_to_width(&article.title, 60),
            truncate_to_width(&article.link, 60)
        );
    }
    if articles.len() > limit {
        println!("... {} more", articles.len() - limit);
    }
}

fn print_sources(sources: &[Source], unread: &HashMap<String, i64>) {
    for source in sources {
        println!(
            "{:>5}  {}  {}  {}",
            unread.get(&source.url).copied().unwrap_or(0),
            fit_to_width(&source.title, 30),
            fit_to_width(source.folder_name.as_deref().unwrap_or("-"), 16),
            source.url
        );
    }
}

async fn open_store(args: &Args, config: &Config, config_dir: &Path) -> Result<FeedStore> {
    let db_path = args
        .db
        .clone()
        .unwrap_or_else(|| config.database_path(config_dir));

    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    if args.reset_db && db_path.exists() {
        std::fs::remove_file(&db_path).context("Failed to delete database")?;
        println!("Database reset.");
    }

    let mut options = config.store_options();
    options.destructive_rebuild |= args.rebuild;

    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    match FeedStore::open_with(db_path_str, options).await {
        Ok(store) => Ok(store),
        Err(StoreError::InstanceLocked) => {
            eprintln!("Error: Another process is using {}. Please close it and try again.", db_path.display());
            std::process::exit(1);
        }
        Err(e @ StoreError::SchemaMismatch { .. }) => {
            eprintln!("Error: {e}");
            eprintln!("Run with --rebuild to recreate the database (all stored data is lost).");
            std::process::exit(1);
        }
        Err(e) => Err(e).context("Failed to open database"),
    }
}

async fn watch(store: &FeedStore, target: WatchTarget) -> Result<()> {
    macro_rules! drain {
        ($live:expr, $render:expr) => {{
            let mut live = $live;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    snapshot = live.next() => match snapshot {
                        Some(rows) => {
                            let rows = rows.context("Live query failed")?;
                            println!("--- {} rows", rows.len());
                            ($render)(&rows);
                        }
                        None => break,
                    }
                }
            }
        }};
    }

    match target {
        WatchTarget::Articles => drain!(store.watch_all_articles(), |rows: &Vec<Article>| {
            print_articles(rows, 20)
        }),
        WatchTarget::Saved => drain!(store.watch_saved_articles(), |rows: &Vec<Article>| {
            print_articles(rows, 20)
        }),
        WatchTarget::Sources => drain!(store.watch_all_sources(), |rows: &Vec<Source>| {
            print_sources(rows, &HashMap::new())
        }),
        WatchTarget::Folders => drain!(store.watch_folders(), |rows: &Vec<Folder>| {
            for folder in rows {
                println!("{}", folder.name);
            }
        }),
        WatchTarget::Unread => drain!(
            store.watch_unread_counts(),
            |rows: &Vec<SourceUnreadCount>| {
                for row in rows {
                    println!("{:>5}  {}", row.count, row.source_url);
                }
            }
        ),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    let store = open_store(&args, &config, &config_dir).await?;

    match args.command {
        Command::Sources => {
            let unread: HashMap<String, i64> = store
                .unread_counts()
                .await?
                .into_iter()
                .map(|c| (c.source_url, c.count))
                .collect();
            print_sources(&store.all_sources().await?, &unread);
        }
        Command::AddSource {
            url,
            title,
            folder,
            icon,
        } => {
            if let Some(folder) = &folder {
                store.create_folder(folder).await?;
            }
            let mut source = Source::new(url, title);
            source.folder_name = folder;
            source.icon_url = icon;
            store.upsert_source(&source).await?;
            println!("Saved source {}", source.url);
        }
        Command::RemoveSource { url } => {
            let removed = store.delete_source(&url).await?;
            println!("Removed {url} and {removed} articles");
        }
        Command::RenameSource { url, title } => {
            if !store.rename_source(&url, &title).await? {
                anyhow::bail!("No source with url {url}");
            }
        }
        Command::SetIcon { url, icon } => {
            if !store.update_source_icon(&url, icon.as_deref()).await? {
                anyhow::bail!("No source with url {url}");
            }
        }
        Command::MoveSource { url, folder } => {
            if !store.move_source_to_folder(&url, folder.as_deref()).await? {
                anyhow::bail!("No source with url {url}");
            }
        }
        Command::Folders => {
            for folder in store.all_folders().await? {
                println!("{}", folder.name);
            }
        }
        Command::AddFolder { name } => {
            if !store.create_folder(&name).await? {
                println!("Folder {name} already exists");
            }
        }
        Command::RemoveFolder { name } => {
            if !store.delete_folder(&name).await? {
                anyhow::bail!("No folder named {name}");
            }
        }
        Command::RenameFolder { old, new } => {
            if !store.rename_folder(&old, &new).await? {
                anyhow::bail!("No folder named {old}");
            }
        }
        Command::Ingest { file } => {
            let articles: Vec<NewArticle> = serde_json::from_slice(&read_input(&file)?)
                .context("Expected a JSON array of articles")?;
            let inserted = store.ingest_articles(&articles).await?;
            println!("Ingested {inserted} new of {} articles", articles.len());
        }
        Command::Sync {
            batches,
            concurrency,
        } => {
            let batches: HashMap<String, Vec<NewArticle>> =
                serde_json::from_slice(&read_input(&batches)?)
                    .context("Expected a JSON object mapping source urls to article arrays")?;
            let fetcher = BatchFileFetcher { batches };
            let concurrency = concurrency.unwrap_or(config.sync_concurrency);
            for result in feed::sync_all(&store, &fetcher, concurrency, None).await? {
                match result.result {
                    Ok(n) => println!("{:>5}  {}", n, result.source_url),
                    Err(e) => println!("error  {}: {e}", result.source_url),
                }
            }
        }
        Command::Articles {
            source,
            folder,
            saved,
            limit,
        } => {
            let articles = match (source, folder, saved) {
                (Some(url), _, _) => store.articles_by_source(&url).await?,
                (_, Some(name), _) => store.articles_by_folder(&name).await?,
                (_, _, true) => store.saved_articles().await?,
                _ => store.all_articles().await?,
            };
            print_articles(&articles, limit);
        }
        Command::Show { link } => match store.article_with_source(&link).await? {
            Some(detail) => {
                let article = detail.article;
                println!("{}", article.title);
                println!(
                    "{} | {}",
                    detail.source_title.as_deref().unwrap_or("(removed source)"),
                    format_date(article.pub_date)
                );
                println!("{}", article.link);
                if let Some(description) = article.description {
                    println!();
                    println!("{description}");
                }
            }
            None => anyhow::bail!("No article with link {link}"),
        },
        Command::MarkRead { link, unread } => {
            if !store.mark_read(&link, !unread).await? {
                println!("Nothing changed");
            }
        }
        Command::MarkSourceRead { url } => {
            println!("Marked {} articles read", store.mark_source_read(&url).await?);
        }
        Command::MarkFolderRead { folder } => {
            println!("Marked {} articles read", store.mark_folder_read(&folder).await?);
        }
        Command::MarkAllRead => {
            println!("Marked {} articles read", store.mark_all_read().await?);
        }
        Command::Save { link, unsave } => {
            if !store.mark_saved(&link, !unsave).await? {
                println!("Nothing changed");
            }
        }
        Command::Clear => {
            println!("Deleted {} articles", store.clear_all_articles().await?);
        }
        Command::Truncate { max_chars } => {
            let max_chars = max_chars.unwrap_or(config.max_description_chars);
            let clipped = store.truncate_oversized_descriptions(max_chars).await?;
            println!("Clipped {clipped} descriptions to {max_chars} characters");
        }
        Command::Export { file } => {
            let out = std::fs::File::create(&file)
                .with_context(|| format!("Failed to create {}", file.display()))?;
            let mut out = std::io::BufWriter::new(out);
            let backup = store.export_backup(&mut out).await?;
            out.flush()
                .with_context(|| format!("Failed to write {}", file.display()))?;
            println!(
                "Exported {} folders, {} sources, {} saved articles",
                backup.folders.len(),
                backup.sources.len(),
                backup.saved_articles.len()
            );
        }
        Command::Import { file } => {
            let summary = store.import_backup(read_input(&file)?.as_slice()).await?;
            println!(
                "Imported {} folders, {} sources, {} saved articles",
                summary.folders, summary.sources, summary.articles
            );
        }
        Command::ExportOpml { file } => {
            let rendered = feed::export_opml(&store).await?;
            write_atomically(&file, rendered.as_bytes())?;
            println!("Exported subscriptions to {}", file.display());
        }
        Command::ImportOpml { file } => {
            let content = String::from_utf8(read_input(&file)?)
                .with_context(|| format!("{} is not valid UTF-8", file.display()))?;
            let summary = feed::import_opml(&store, &content).await?;
            println!(
                "Imported {} folders, {} sources",
                summary.folders, summary.sources
            );
        }
        Command::Watch { target } => watch(&store, target).await?,
        Command::Identity => {
            println!("current: {}", schema_identity());
            println!(
                "stored:  {}",
                store.stored_identity().await?.unwrap_or_else(|| "-".into())
            );
        }
    }

    Ok(())
}
