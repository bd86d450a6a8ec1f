use std::sync::Arc;

use session_proxy::modules;
use session_proxy::proxy;

#[tokio::main]
async fn main() -> Result<(), String> {
    modules::logger::init_logger();

    let mut config = match modules::config::load_config() {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::warn!("failed to load config: {}. using defaults", err);
            let cfg = proxy::ProxyConfig::default();
            let _ = modules::config::save_config(&cfg);
            cfg
        }
    };

    if let Ok(value) = std::env::var("SESSION_PROXY_ALLOW_LAN") {
        let enabled = matches!(value.as_str(), "1" | "true" | "yes" | "on");
        if enabled {
            config.allow_lan_access = true;
        }
    }

    if let Ok(value) = std::env::var("SESSION_PROXY_PORT") {
        match value.parse::<u16>() {
            Ok(port) => config.port = port,
            Err(_) => tracing::warn!("invalid SESSION_PROXY_PORT value: {}", value),
        }
    }

    if let Ok(value) = std::env::var("SESSION_TIMEOUT") {
        match value.parse::<u64>() {
            Ok(secs) => config.session_timeout = secs,
            Err(_) => tracing::warn!("invalid SESSION_TIMEOUT value: {}", value),
        }
    }

    if let Ok(value) = std::env::var("CLEANUP_INTERVAL") {
        match value.parse::<u64>() {
            Ok(secs) => config.cleanup_interval = secs,
            Err(_) => tracing::warn!("invalid CLEANUP_INTERVAL value: {}", value),
        }
    }

    let bind_address = if let Ok(addr) = std::env::var("SESSION_PROXY_BIND") {
        if addr != "127.0.0.1" && addr != "localhost" {
            config.allow_lan_access = true;
        }
        addr
    } else {
        config.get_bind_address().to_string()
    };

    let registry = Arc::new(proxy::SessionRegistry::new(
        config.session_timeout as i64,
        config.verify_ssl,
    ));

    let upstream = Arc::new(
        proxy::UpstreamClient::new(config.user_agent.clone(), config.request_timeout)
            .map_err(|e| format!("failed to create upstream client: {}", e))?,
    );

    let sweeper = proxy::SessionSweeper::new(registry.clone(), config.cleanup_interval);
    let sweeper_handle = sweeper.spawn();

    let (server, handle) = proxy::AxumServer::start(
        bind_address.clone(),
        config.port,
        registry,
        upstream,
    )
    .await
    .map_err(|e| format!("failed to start proxy server: {}", e))?;

    tracing::info!(
        "session-proxy listening on http://{}:{}",
        bind_address,
        config.port
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("failed to listen for shutdown signal: {}", e))?;

    tracing::info!("shutdown requested, stopping server...");
    sweeper_handle.abort();
    server.stop();
    let _ = handle.await;

    Ok(())
}
