//! tripcache - keep trip guides available offline and manage app updates.
//!
//! Usage:
//!   tripcache download <trip-id> <slug>
//!   tripcache refresh <trip-id> <slug>
//!   tripcache remove <trip-id>
//!   tripcache status [trip-id] [--json]
//!   tripcache check-update
//!   tripcache apply-update
//!   tripcache force-refresh

use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tripcache_core::utils::format_bytes;
use tripcache_core::{
    ApiClient, ApplyOutcome, CacheManager, Config, FileStore, PersistentStore, ReleaseFeedBridge,
    ServiceWorkerBridge, TripBundleFetcher, UpdateMonitor, VersionOracle,
};

/// Subdirectory of the cache dir holding trip bundles
const BUNDLES_DIR: &str = "bundles";

/// Subdirectory of the cache dir holding log files
const LOGS_DIR: &str = "logs";

const USAGE: &str = "\
usage: tripcache <command>

commands:
  download <trip-id> <slug>   make a trip available offline
  refresh <trip-id> <slug>    download a trip again
  remove <trip-id>            remove a trip's offline copy
  status [trip-id] [--json]   show offline trips
  check-update                look for a new app version
  apply-update                install a waiting app version
  force-refresh               clear app caches and reload";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Download { trip_id: i64, slug: String },
    Refresh { trip_id: i64, slug: String },
    Remove { trip_id: i64 },
    Status { trip_id: Option<i64>, json: bool },
    CheckUpdate,
    ApplyUpdate,
    ForceRefresh,
}

fn parse_trip_id(raw: &str) -> Result<i64> {
    let id: i64 = raw
        .parse()
        .with_context(|| format!("invalid trip id: {raw}"))?;
    if id <= 0 {
        bail!("invalid trip id: {raw}");
    }
    Ok(id)
}

fn parse_slug(raw: &str) -> Result<String> {
    if !ApiClient::is_valid_slug(raw) {
        bail!("invalid trip slug: {raw}");
    }
    Ok(raw.to_string())
}

fn parse_args(args: &[String]) -> Result<Command> {
    let words: Vec<&str> = args.iter().map(String::as_str).collect();
    let command = match words.as_slice() {
        ["download", id, slug] => Command::Download {
            trip_id: parse_trip_id(id)?,
            slug: parse_slug(slug)?,
        },
        ["refresh", id, slug] => Command::Refresh {
            trip_id: parse_trip_id(id)?,
            slug: parse_slug(slug)?,
        },
        ["remove", id] => Command::Remove {
            trip_id: parse_trip_id(id)?,
        },
        ["status", rest @ ..] => {
            let json = rest.contains(&"--json");
            let ids: Vec<&&str> = rest.iter().filter(|w| **w != "--json").collect();
            let trip_id = match ids.as_slice() {
                [] => None,
                [id] => Some(parse_trip_id(id)?),
                _ => bail!("{USAGE}"),
            };
            Command::Status { trip_id, json }
        }
        ["check-update"] => Command::CheckUpdate,
        ["apply-update"] => Command::ApplyUpdate,
        ["force-refresh"] => Command::ForceRefresh,
        _ => bail!("{USAGE}"),
    };
    Ok(command)
}

/// Initialize logging: stderr filtered by `RUST_LOG` (default `warn`), plus a
/// daily log file when `log_dir` is usable.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let appender = log_dir.and_then(|dir| {
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("tripcache")
            .filename_suffix("log")
            .build(dir)
            .ok()
    });
    let (file_layer, guard) = match appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .init();
    guard
}

async fn open_cache(config: &Config, api: &ApiClient) -> Result<CacheManager> {
    let root = config.cache_dir()?.join(BUNDLES_DIR);
    let store: Arc<dyn PersistentStore> = Arc::new(
        FileStore::open(&root, config.storage_quota_bytes)
            .await
            .with_context(|| format!("opening bundle store at {}", root.display()))?,
    );
    let cache = CacheManager::open(
        store,
        Arc::new(TripBundleFetcher::new(api.clone())),
        Arc::new(VersionOracle::new(api.clone())),
        config.cache_settings(),
    )
    .await?;
    Ok(cache)
}

async fn download(cache: &CacheManager, trip_id: i64, slug: &str, force: bool) -> Result<()> {
    let mut progress = cache.subscribe_progress();
    let watched = cache.clone();
    let reporter = tokio::spawn(async move {
        // The global watch may follow another trip; read this trip's own percent
        while progress.changed().await.is_ok() {
            progress.borrow_and_update();
            if let Some(percent) = watched.trip_progress(trip_id) {
                eprint!("\rDownloading {trip_id}... {percent:>3}%");
            }
        }
    });

    let result = if force {
        cache.redownload_trip(trip_id, slug).await
    } else {
        cache.enable_offline_for_trip(trip_id, slug).await
    };
    reporter.abort();
    eprintln!();

    let status = result?;
    println!(
        "Trip {trip_id} ({slug}) is available offline, {}",
        format_bytes(status.size_bytes)
    );
    Ok(())
}

async fn print_status(cache: &CacheManager, trip_id: Option<i64>, json: bool) -> Result<()> {
    let entries = match trip_id {
        Some(id) => cache.entry(id).into_iter().collect(),
        None => cache.cached_trips(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        match trip_id {
            Some(id) => println!("Trip {id} is not available offline"),
            None => println!("No trips available offline"),
        }
        return Ok(());
    }

    for entry in &entries {
        let freshness = if cache.is_cache_outdated(entry.trip_id).await {
            "update available"
        } else {
            "up to date"
        };
        println!(
            "{:>6}  {:<28} {:>10}  downloaded {:<10} {}",
            entry.trip_id,
            entry.trip_slug,
            format_bytes(entry.size_bytes),
            entry.age_display(),
            freshness,
        );
    }
    if trip_id.is_none() {
        println!("Total: {}", format_bytes(cache.total_size_bytes()));
    }
    Ok(())
}

async fn start_updates(config: &Config, api: ApiClient) -> (Arc<ReleaseFeedBridge>, UpdateMonitor) {
    let bridge = Arc::new(ReleaseFeedBridge::new(api, env!("CARGO_PKG_VERSION")));
    let monitor = UpdateMonitor::start(
        Arc::clone(&bridge) as Arc<dyn ServiceWorkerBridge>,
        config.update_settings(),
    )
    .await;
    (bridge, monitor)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;

    let mut config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: could not load config ({e}), using defaults");
        Config::default()
    });
    let log_dir = config.cache_dir().ok().map(|dir| dir.join(LOGS_DIR));
    let _guard = init_tracing(log_dir.as_deref());
    info!(?command, "tripcache starting");

    let api = ApiClient::new(&config.api_base_url())?;

    match command {
        Command::Download { trip_id, slug } => {
            let cache = open_cache(&config, &api).await?;
            download(&cache, trip_id, &slug, false).await?;
            config.last_trip_slug = Some(slug);
            if let Err(e) = config.save() {
                warn!(error = %e, "Failed to save config");
            }
        }
        Command::Refresh { trip_id, slug } => {
            let cache = open_cache(&config, &api).await?;
            download(&cache, trip_id, &slug, true).await?;
        }
        Command::Remove { trip_id } => {
            let cache = open_cache(&config, &api).await?;
            if !cache.is_offline_enabled(trip_id) {
                println!("Trip {trip_id} is not available offline");
                return Ok(());
            }
            cache.disable_offline_for_trip(trip_id).await?;
            println!("Removed offline copy of trip {trip_id}");
        }
        Command::Status { trip_id, json } => {
            let cache = open_cache(&config, &api).await?;
            print_status(&cache, trip_id, json).await?;
        }
        Command::CheckUpdate => {
            let (bridge, monitor) = start_updates(&config, api).await;
            monitor.check_for_updates().await?;
            match bridge.waiting_release() {
                Some(release) if monitor.state().update_available => {
                    println!(
                        "Version {} is available (running {})",
                        release.version,
                        bridge.running_version()
                    );
                    if let Some(notes) = release.notes {
                        println!("{notes}");
                    }
                }
                _ => println!("Up to date ({})", bridge.running_version()),
            }
        }
        Command::ApplyUpdate => {
            let (bridge, monitor) = start_updates(&config, api).await;
            monitor.check_for_updates().await?;
            match monitor.apply_update().await? {
                ApplyOutcome::Applied => println!(
                    "Updated to {}, restart tripcache to finish",
                    bridge.running_version()
                ),
                ApplyOutcome::NothingToApply => {
                    println!("Up to date ({})", bridge.running_version())
                }
            }
        }
        Command::ForceRefresh => {
            let (_bridge, monitor) = start_updates(&config, api).await;
            monitor.force_refresh().await?;
            println!("App caches cleared, restart tripcache to reload");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_parse_download() {
        assert_eq!(
            parse_args(&args(&["download", "42", "greek-isles-2025"])).unwrap(),
            Command::Download {
                trip_id: 42,
                slug: "greek-isles-2025".to_string()
            }
        );
    }

    #[test]
    fn test_parse_status_variants() {
        assert_eq!(
            parse_args(&args(&["status"])).unwrap(),
            Command::Status { trip_id: None, json: false }
        );
        assert_eq!(
            parse_args(&args(&["status", "--json", "7"])).unwrap(),
            Command::Status { trip_id: Some(7), json: true }
        );
        assert!(parse_args(&args(&["status", "1", "2"])).is_err());
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["remove", "abc"])).is_err());
        assert!(parse_args(&args(&["remove", "-3"])).is_err());
        assert!(parse_args(&args(&["download", "42"])).is_err());
        assert!(parse_args(&args(&["download", "42", "../etc"])).is_err());
    }
}
