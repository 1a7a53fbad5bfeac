use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use shared::regtype::ServiceType;
use service_browserd::api;
use service_browserd::backend::{MdnsBackend, ResolverBackend};
use service_browserd::cache::SnapshotCache;
use service_browserd::config::Config;
use service_browserd::hub::Hub;
use service_browserd::registration::RegistrationManager;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("service_browserd=info"))
        )
        .init();

    tracing::info!("Starting service-browserd");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/service-browser/browserd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    let mdns_daemon = ServiceDaemon::new()
        .context("Failed to create mDNS daemon")?;
    if let Some(interface) = &config.browser.interface {
        mdns_daemon
            .disable_interface(mdns_sd::IfKind::All)
            .context("Failed to disable default interfaces")?;
        mdns_daemon
            .enable_interface(interface.as_str())
            .with_context(|| format!("Failed to enable interface {}", interface))?;
    }

    let backend: Arc<dyn ResolverBackend> = Arc::new(MdnsBackend::new(mdns_daemon.clone()));
    let hub = Hub::new(backend.clone());
    let registrations = Arc::new(RegistrationManager::new(backend));

    let watched = config
        .browser
        .watch
        .iter()
        .map(|reg_type| {
            ServiceType::parse(reg_type, &config.browser.domain)
                .map(|service_type| service_type.browse_key())
                .with_context(|| format!("Invalid watch entry {}", reg_type))
        })
        .collect::<Result<Vec<_>>>()?;

    let cancel = CancellationToken::new();

    // Standing subscriptions: the type view plus every watched reg type
    let (cache, forwarders) = SnapshotCache::spawn(
        hub.clone(),
        &config.browser.domain,
        watched,
        config.browser.lookup_settle(),
        cancel.clone(),
    );

    for entry in &config.register {
        let instance = entry.to_instance(&config.browser.domain);
        if let Err(e) = registrations.register(instance).await {
            tracing::error!("Failed to register {}: {}", entry.name, e);
        }
    }

    let app = api::routes::router(api::routes::AppState {
        cache,
        registrations: registrations.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();

    // API first, then the forwarders (which drop their subscriptions)
    let _ = server_handle.await;
    let _ = futures::future::join_all(forwarders).await;

    registrations.unregister_all();

    hub.shutdown();

    if let Err(e) = mdns_daemon.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
