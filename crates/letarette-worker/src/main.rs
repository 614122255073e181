//! Letarette worker binary and index tools.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use letarette_bus::{Bus, NatsBus};
use letarette_core::{Config, Error};
use letarette_store::{reset_migration, SqliteStore, StoreOptions, Synonym};
use letarette_worker::{Worker, WorkerOptions};

const OPTIMIZE_PAGE_INCREMENT: u32 = 500;

fn print_help() {
    println!("Letarette - distributed full text search worker");
    println!();
    println!("Usage: letarette [command]");
    println!();
    println!("Settings are read from LETARETTE_* environment variables.");
    println!();
    println!("Commands:");
    println!("  (none)                      Start the worker");
    println!("  stats                       Print index statistics");
    println!("  check                       Check index integrity");
    println!("  rebuild                     Rebuild the full text index");
    println!("  optimize                    Merge full text index segments");
    println!("  force-stemmer               Store the configured stemmer settings in the index");
    println!("  reset-migration <version>   Force the schema version");
    println!("  set-synonyms <file.json>    Replace the synonym list");
    println!("  help                        Show this help message");
}

fn open_for_tools(config: &Config) -> anyhow::Result<SqliteStore> {
    SqliteStore::open_unchecked(&config.db.path, StoreOptions::from(config))
        .map_err(|e| anyhow::anyhow!("Failed to open index: {}", e))
}

fn run_tool(command: &str, args: &[String], config: &Config) -> anyhow::Result<()> {
    match command {
        "stats" => {
            let store = open_for_tools(config)?;
            let stats = store.index_stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        "check" => {
            let store = open_for_tools(config)?;
            store.check_index()?;
            println!("Index OK");
        }
        "rebuild" => {
            let store = open_for_tools(config)?;
            store.rebuild_index()?;
            println!("Index rebuilt");
        }
        "optimize" => {
            let store = open_for_tools(config)?;
            let mut optimizer = store.start_optimize(OPTIMIZE_PAGE_INCREMENT)?;
            let mut steps = 0;
            while !optimizer.step()? {
                steps += 1;
                if steps % 10 == 0 {
                    info!("Optimizing, {} steps", steps);
                }
            }
            println!("Index optimized in {} steps", steps + 1);
        }
        "force-stemmer" => {
            let store = open_for_tools(config)?;
            store.force_stemmer_state()?;
            println!("Stemmer settings updated");
        }
        "reset-migration" => {
            let version: u32 = args
                .first()
                .context("Usage: letarette reset-migration <version>")?
                .parse()
                .context("Migration version must be a number")?;
            reset_migration(&config.db.path, version)?;
            println!("Migration reset to version {}", version);
        }
        "set-synonyms" => {
            let path = args
                .first()
                .context("Usage: letarette set-synonyms <file.json>")?;
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path))?;
            let synonyms: Vec<Synonym> = serde_json::from_str(&json)?;
            let store = open_for_tools(config)?;
            store.set_synonyms(&synonyms)?;
            println!("Loaded {} synonym groups", synonyms.len());
        }
        _ => {
            eprintln!("Unknown command: {}. Use 'letarette help' for usage.", command);
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if let Some(command) = args.get(1) {
        if matches!(command.as_str(), "--help" | "-h" | "help") {
            print_help();
            return Ok(());
        }
        let config = Config::from_env()?;
        return run_tool(command, &args[2..], &config);
    }

    let config = Config::from_env()?;
    info!("Index path: {}", config.db.path.display());

    let store = match SqliteStore::open(&config.db.path, StoreOptions::from(&config)) {
        Ok(store) => store,
        Err(Error::StemmerSettingsMismatch) => {
            anyhow::bail!(
                "Index and config stemmer settings mismatch. Re-build index or force changes."
            );
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open index: {}", e)),
    };

    let bus: Arc<dyn Bus> = Arc::new(NatsBus::connect(&config.nats).await?);
    let worker = Worker::start(config, bus, Arc::new(store), WorkerOptions::default()).await?;
    info!("Worker running");

    wait_for_signal().await;
    worker.shutdown().await;
    info!("Worker stopped");
    Ok(())
}
