use std::io::IsTerminal;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jlh-cli")]
#[command(about = "Job listing harvester command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Walk search results for every term and store the listings.
    Scrape {
        /// Search term to run; repeat for several. Defaults to the built-in shuffled list.
        #[arg(long = "term")]
        terms: Vec<String>,
        #[arg(long)]
        location: Option<String>,
        /// Seed for the default term shuffle.
        #[arg(long)]
        seed: Option<u64>,
        /// Keep listings in memory instead of writing to the database.
        #[arg(long)]
        dry_run: bool,
    },
    Migrate,
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jlh_cli=info,jlh_sync=info,jlh_adapters=info,jlh_storage=info,jlh_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_ansi(std::io::stdout().is_terminal()))
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Scrape {
        terms: Vec::new(),
        location: None,
        seed: None,
        dry_run: false,
    });

    match command {
        Commands::Scrape {
            terms,
            location,
            seed,
            dry_run,
        } => {
            let mut config = jlh_sync::SyncConfig::from_env();
            if let Some(location) = location {
                config.search_location = location;
            }
            if seed.is_some() {
                config.shuffle_seed = seed;
            }
            config.dry_run |= dry_run;
            let terms = (!terms.is_empty()).then_some(terms);

            let summary = jlh_sync::run_scrape_once(&config, terms).await?;
            println!(
                "scrape complete: run_id={} terms={} failed={} created={} matched={} skipped={}",
                summary.run_id,
                summary.terms.len(),
                summary.failed_terms().len(),
                summary.total_created(),
                summary.total_matched(),
                summary.total_skipped()
            );
        }
        Commands::Migrate => {
            let config = jlh_sync::SyncConfig::from_env();
            let pool = sqlx::PgPool::connect(&config.database_url)
                .await
                .context("connecting to listing database")?;
            jlh_storage::run_migrations(&pool).await?;
            tracing::info!("migrations applied");
            println!("migrate complete");
        }
        Commands::Serve => {
            jlh_web::serve_from_env().await?;
        }
    }

    Ok(())
}
