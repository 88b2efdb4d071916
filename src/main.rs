use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

use playlog::canonical::Canonicalizer;
use playlog::client::{ReqwestTransport, ResilientClient, RetryPolicy};
use playlog::config::Config;
use playlog::dispatch::{DispatchEngine, ReprocessOutcome, ReprocessRequest};
use playlog::domain::EventStatus;
use playlog::providers::{
    build_handlers, AlbumYearEnricher, EnrichOutcome, ImportOutcome, MusicBrainzClient,
    SpotifyImporter,
};
use playlog::storage::{CatalogStore, EventStore, SqliteStore};
use playlog::{logging, metrics};

#[derive(Parser)]
#[command(name = "playlog")]
#[command(about = "Media activity aggregator building a canonical listen/watch/read catalog")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record one payload for a provider and dispatch it
    Ingest {
        /// Provider tag (plex, spotify, bookshelf)
        provider: String,
        /// Payload file; stdin when omitted
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Print one event's stored status and error
    ShowEvent { id: i64 },
    /// Re-dispatch events matching a filter
    Reprocess {
        /// Bypass the status filter
        #[arg(long)]
        all: bool,
        /// Statuses to match (comma-separated; default: failed)
        #[arg(long)]
        status: Option<String>,
        /// Provider allow-list (comma-separated)
        #[arg(long)]
        providers: Option<String>,
        #[arg(long, default_value_t = 1000)]
        page_size: u32,
        /// Exclusive lower-bound event id cursor
        #[arg(long, default_value_t = 0)]
        from_id: i64,
        /// Only print the matching count and page math
        #[arg(long)]
        count_only: bool,
    },
    /// Reset one event to pending and dispatch it again
    RetryEvent { id: i64 },
    /// Pull the recently-played feed from the streaming service
    ImportSpotify,
    /// Fill missing album years from MusicBrainz
    EnrichAlbums {
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
    /// Print catalog row counts
    Stats,
}

struct App {
    store: Arc<SqliteStore>,
    canon: Arc<Canonicalizer>,
    engine: Arc<DispatchEngine>,
    config: Config,
}

fn build_app() -> anyhow::Result<App> {
    let config = Config::load_or_default()?;
    let store = Arc::new(SqliteStore::open(&config.storage.path)?);

    let canon = Arc::new(Canonicalizer::new(store.clone() as Arc<dyn CatalogStore>));
    let handlers = build_handlers(canon.clone());
    let engine = Arc::new(DispatchEngine::new(
        store.clone() as Arc<dyn EventStore>,
        handlers,
        config.dispatch.async_workers,
    ));

    Ok(App {
        store,
        canon,
        engine,
        config,
    })
}

fn parse_statuses(raw: &str) -> anyhow::Result<Vec<EventStatus>> {
    raw.split(',')
        .map(|s| {
            EventStatus::parse(s.trim())
                .ok_or_else(|| anyhow::anyhow!("unknown status: {}", s.trim()))
        })
        .collect()
}

fn read_payload(file: Option<PathBuf>) -> anyhow::Result<String> {
    match file {
        Some(path) => Ok(std::fs::read_to_string(path)?),
        None => {
            let mut payload = String::new();
            std::io::stdin().read_to_string(&mut payload)?;
            Ok(payload)
        }
    }
}

fn spotify_importer(app: &App) -> anyhow::Result<SpotifyImporter> {
    let timeout = Duration::from_secs(app.config.spotify.timeout_seconds);
    let transport = ReqwestTransport::new(
        &app.config.user_agent,
        Duration::from_secs(5),
        timeout,
        Some(app.config.spotify.token.clone()),
    )?;
    let client = ResilientClient::new(Arc::new(transport), RetryPolicy::rate_limit_only(), None);
    Ok(SpotifyImporter::new(
        client,
        app.store.clone() as Arc<dyn EventStore>,
        app.engine.clone(),
        app.config.spotify.base_url.clone(),
        app.config.spotify.page_limit,
    ))
}

fn album_enricher(app: &App) -> anyhow::Result<AlbumYearEnricher> {
    let timeout = Duration::from_secs(app.config.musicbrainz.timeout_seconds);
    let transport = ReqwestTransport::new(
        &app.config.user_agent,
        Duration::from_secs(5),
        timeout,
        None,
    )?;
    let client = ResilientClient::new(
        Arc::new(transport),
        RetryPolicy::standard(),
        Some(Duration::from_millis(app.config.musicbrainz.min_interval_ms)),
    );
    let mb = MusicBrainzClient::new(client, app.config.musicbrainz.base_url.clone());
    Ok(AlbumYearEnricher::new(
        mb,
        app.store.clone() as Arc<dyn CatalogStore>,
        app.canon.clone(),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    logging::init_logging();
    metrics::init_metrics();

    let cli = Cli::parse();
    let app = build_app()?;

    match cli.command {
        Commands::Ingest { provider, file } => {
            let payload = read_payload(file)?;
            let event = app.store.save(&provider, &payload).await?;
            app.engine.execute_sync(event.id).await?;

            match app.store.get(event.id).await? {
                Some(stored) => {
                    println!("📥 Event {}: {}", stored.id, stored.status);
                    if let Some(err) = stored.error {
                        println!("   Error: {}", err);
                    }
                }
                None => println!("⚠️  Event {} vanished after dispatch", event.id),
            }
        }
        Commands::ShowEvent { id } => match app.store.get(id).await? {
            Some(event) => {
                println!("Event {}", event.id);
                println!("   Provider:    {}", event.provider);
                println!("   Status:      {}", event.status);
                println!("   Fingerprint: {}", event.fingerprint);
                println!("   Created:     {}", event.created_at);
                println!("   Updated:     {}", event.updated_at);
                if let Some(err) = event.error {
                    println!("   Error:       {}", err);
                }
            }
            None => println!("⚠️  No event with id {}", id),
        },
        Commands::Reprocess {
            all,
            status,
            providers,
            page_size,
            from_id,
            count_only,
        } => {
            let statuses = match status {
                Some(raw) => parse_statuses(&raw)?,
                None => vec![EventStatus::Failed],
            };
            let req = ReprocessRequest {
                all,
                statuses,
                providers: providers
                    .map(|p| p.split(',').map(|s| s.trim().to_string()).collect())
                    .unwrap_or_default(),
                page_size,
                from_id_exclusive: from_id,
            };

            let count = app.engine.count(&req).await?;
            println!(
                "🔄 {} matching events ({} pages of {})",
                count.total, count.pages, count.page_size
            );
            if count_only {
                return Ok(());
            }

            match app.engine.reprocess(&req).await {
                Ok(ReprocessOutcome::Completed { processed }) => {
                    println!("✅ Reprocessed {}/{} events", processed, count.total);
                }
                Ok(ReprocessOutcome::AlreadyRunning) => {
                    println!("⚠️  A reprocess run is already in progress");
                }
                Err(e) => {
                    error!("Reprocess failed: {}", e);
                    println!("❌ Reprocess failed: {}", e);
                }
            }
        }
        Commands::RetryEvent { id } => {
            app.engine.reprocess_by_id(id).await?;
            match app.store.get(id).await? {
                Some(event) => {
                    println!("🔁 Event {}: {}", event.id, event.status);
                    if let Some(err) = event.error {
                        println!("   Error: {}", err);
                    }
                }
                None => println!("⚠️  No event with id {}", id),
            }
        }
        Commands::ImportSpotify => {
            let importer = spotify_importer(&app)?;
            match importer.import_recent().await {
                Ok(ImportOutcome::Completed { fetched, processed }) => {
                    println!("🎧 Imported {} plays ({} fetched)", processed, fetched);
                }
                Ok(ImportOutcome::AlreadyRunning) => {
                    println!("⚠️  An import run is already in progress");
                }
                Err(e) => {
                    error!("Import failed: {}", e);
                    println!("❌ Import failed: {}", e);
                }
            }
        }
        Commands::EnrichAlbums { limit } => {
            let enricher = album_enricher(&app)?;
            match enricher.enrich(limit).await {
                Ok(EnrichOutcome::Completed { examined, updated }) => {
                    println!("🗓️  Updated {} of {} examined albums", updated, examined);
                }
                Ok(EnrichOutcome::AlreadyRunning) => {
                    println!("⚠️  An enrichment run is already in progress");
                }
                Err(e) => {
                    error!("Enrichment failed: {}", e);
                    println!("❌ Enrichment failed: {}", e);
                }
            }
        }
        Commands::Stats => {
            let stats = app.store.stats().await?;
            println!("📊 Catalog:");
            println!("   Artists:       {}", stats.artists);
            println!("   Albums:        {}", stats.albums);
            println!("   Tracks:        {}", stats.tracks);
            println!("   Movies:        {}", stats.movies);
            println!("   Books:         {}", stats.books);
            println!("   Book editions: {}", stats.book_editions);
            println!("   External ids:  {}", stats.external_ids);
        }
    }

    Ok(())
}
