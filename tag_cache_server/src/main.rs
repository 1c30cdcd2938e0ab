use std::path::Path;
use std::sync::Arc;
use tag_cache_server::config::settings::{Settings, SupervisionConfig};
use tag_cache_server::listeners::{Channels, EquipmentLogTargets, TagUpdateLogger};
use tag_cache_server::loader::InMemoryLoader;
use tag_cache_server::logging::init_logging;
use tag_cache_server::supervision::SupervisionEntity;
use tag_cache_server::tags::engine::{EngineOptions, TagEngine};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // --- Load Configuration ---
    let config_path = Path::new("config.toml");
    let loaded = Settings::load(config_path);
    let directive = loaded
        .as_ref()
        .map(|s| s.logging.directive.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_logging(&directive, None)?;
    info!("Tag cache server starting...");

    let settings = match loaded {
        Ok(s) => s,
        Err(e) => {
            error!(
                "FATAL: Failed to load configuration from {:?}: {}",
                config_path, e
            );
            std::process::exit(1);
        }
    };
    info!(
        "Configuration loaded: {} supervised entities, {} tags, {} alarms",
        settings.supervision.len(),
        settings.tags.len(),
        settings.alarms.len()
    );

    // --- Initialize Tag Engine ---
    let engine = TagEngine::with_options(EngineOptions {
        lock_policy: settings.cache.lock_policy(),
        ..EngineOptions::default()
    });

    let supervision_loader =
        InMemoryLoader::with_objects(settings.supervision.iter().map(SupervisionConfig::to_state));
    let tag_loader = InMemoryLoader::with_objects(settings.tags.iter().map(|c| c.to_tag()));
    let alarm_loader = InMemoryLoader::with_objects(settings.alarms.iter().map(|c| c.to_alarm()));

    let report = engine
        .populate(&supervision_loader, &tag_loader, &alarm_loader)
        .await?;
    for (id, reason) in &report.failures {
        warn!(id, "Not consistent after population: {}", reason);
    }

    // --- Register Listeners ---
    let targets = Arc::new(EquipmentLogTargets::new());
    for state in settings
        .supervision
        .iter()
        .filter(|s| s.entity == SupervisionEntity::Equipment)
    {
        targets.insert(state.id, state.name.clone());
    }
    engine.tag_listeners().register(
        Arc::new(TagUpdateLogger::new(targets)),
        Channels::VALUE_AND_SUPERVISION,
        settings.dispatch.worker_pool(),
    )?;
    info!("Tag update logger registered.");

    // --- Status Confirmation Loop ---
    let period = Duration::from_millis(settings.status_confirmation_interval_ms.max(1));
    let mut ticker = interval(period);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let worker = engine.clone();
                // Confirmation takes tag locks, keep it off the async workers.
                let confirmed = tokio::task::spawn_blocking(move || worker.confirm_all()).await?;
                debug!(confirmed, "Status confirmation sent");

                let now = engine.now();
                for alarm_id in engine.alarms().unpublished() {
                    match engine.alarms().mark_published(alarm_id, now) {
                        Ok(alarm) => info!(alarm_id, state = %alarm.state, info = %alarm.info, "Alarm published"),
                        Err(e) => warn!(alarm_id, "Alarm publication failed: {}", e),
                    }
                }
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown requested");
                break;
            }
        }
    }

    // --- Shutdown ---
    let worker = engine.clone();
    tokio::task::spawn_blocking(move || worker.shutdown()).await?;
    info!("Dispatchers drained, tag cache server stopped.");
    Ok(())
}
